use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use jbdbms_lib::ble::BleBms;
use jbdbms_lib::client::ClientConfig;
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;

use commandline::{CliArgs, CliCommands, SwitchPosition};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

macro_rules! print_info {
    ($bms:expr) => {
        println!(
            "Info: {:?}",
            $bms.fetch().await.with_context(|| "Cannot get basic info")?
        )
    };
}
macro_rules! print_cell_voltages {
    ($bms:expr) => {
        println!(
            "Cell Voltages: {:?}",
            $bms.fetch_voltages()
                .await
                .with_context(|| "Cannot get cell voltages")?
        )
    };
}

async fn execute(bms: &BleBms, command: CliCommands) -> Result<()> {
    match command {
        CliCommands::Info => print_info!(bms),
        CliCommands::CellVoltages => print_cell_voltages!(bms),
        CliCommands::All => {
            print_info!(bms);
            print_cell_voltages!(bms);
        }
        CliCommands::SetSwitch { switch, state, .. } => bms
            .set_switch(switch.into(), state == SwitchPosition::On)
            .await
            .with_context(|| format!("Cannot set {switch:?} mosfet"))?,
        CliCommands::Daemon { interval, format } => daemon::run(bms, format, interval).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let await_switch_ack = !matches!(args.command, CliCommands::SetSwitch { no_ack: true, .. });
    let config = ClientConfig {
        timeout: args.timeout,
        verify_checksum: !args.skip_checksum,
        await_switch_ack,
        ..ClientConfig::default()
    };

    let bms = BleBms::connect(&args.device, args.scan_timeout, config)
        .await
        .with_context(|| format!("Cannot connect to BMS '{}'", args.device))?;

    let result = execute(&bms, args.command).await;
    if let Err(e) = bms.disconnect().await {
        warn!("Cannot disconnect cleanly: {e}");
    }
    result
}
