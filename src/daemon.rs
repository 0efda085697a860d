use anyhow::Result;
use jbdbms_lib::ble::BleBms;
use jbdbms_lib::protocol::{BmsSample, CellVoltageList};
use log::{error, info};
use serde_json::json;

use crate::commandline::OutputFormat;

#[derive(Debug, Default)]
struct FetchedData {
    sample: Option<BmsSample>,
    cell_voltages: Option<CellVoltageList>,
}

impl FetchedData {
    fn to_json_value(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "info": serde_json::to_value(&self.sample)?,
            "cell_voltages": serde_json::to_value(&self.cell_voltages)?,
        }))
    }
}

async fn fetch_all(bms: &BleBms) -> FetchedData {
    let mut fetched_data = FetchedData::default();
    info!("Fetching basic info");
    match bms.fetch().await {
        Ok(sample) => fetched_data.sample = Some(sample),
        Err(e) => error!("Error fetching basic info: {e}"),
    }
    info!("Fetching cell voltages");
    match bms.fetch_voltages().await {
        Ok(voltages) => fetched_data.cell_voltages = Some(voltages),
        Err(e) => error!("Error fetching cell voltages: {e}"),
    }
    fetched_data
}

pub async fn run(bms: &BleBms, format: OutputFormat, interval: std::time::Duration) -> Result<()> {
    info!("Starting daemon mode: format={format:?}, interval={interval:?}");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping daemon mode");
                return Ok(());
            }
        }

        let fetched_data = fetch_all(bms).await;
        match format {
            OutputFormat::Console => {
                println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                if let Some(sample) = &fetched_data.sample {
                    println!("info: {sample:?}");
                }
                if let Some(voltages) = &fetched_data.cell_voltages {
                    println!("cell voltages: {voltages:?}");
                }
                println!("--------------------------");
            }
            OutputFormat::Json => match fetched_data.to_json_value() {
                Ok(value) => println!("{value}"),
                Err(e) => error!("Failed to serialize data to JSON: {e}"),
            },
        }
    }
}
