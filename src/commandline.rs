use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use jbdbms_lib::protocol::Switch;
use std::time::Duration;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum SwitchArg {
    Charge,
    Discharge,
}

impl From<SwitchArg> for Switch {
    fn from(arg: SwitchArg) -> Self {
        match arg {
            SwitchArg::Charge => Switch::Charge,
            SwitchArg::Discharge => Switch::Discharge,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum SwitchPosition {
    On,
    Off,
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum OutputFormat {
    Console,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show voltage, current, charge, capacity, SOC, cycles, temperatures and MOSFET state
    Info,
    /// Show individual cell voltages in mV
    CellVoltages,
    /// Show all available BMS information
    All,
    /// Turn the charge or discharge MOSFET on or off
    SetSwitch {
        /// The MOSFET to switch
        #[arg(value_enum)]
        switch: SwitchArg,
        /// The desired state
        #[arg(value_enum)]
        state: SwitchPosition,
        /// Do not wait for the BMS to acknowledge the command
        #[arg(long)]
        no_ack: bool,
    },
    /// Run in daemon mode, periodically fetching and printing metrics
    Daemon {
        /// Interval for fetching metrics (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
        /// Output format of each cycle
        #[arg(long, value_enum, default_value_t = OutputFormat::Console)]
        format: OutputFormat,
    },
}

const fn about_text() -> &'static str {
    "JBD bms bluetooth command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Advertised Bluetooth name of the BMS
    #[arg(short, long)]
    pub device: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Time to wait for a response from the BMS (e.g., "500ms", "5s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "16s")]
    pub timeout: Duration,

    /// Time to scan for the BMS before giving up
    #[arg(value_parser = humantime::parse_duration, long, default_value = "30s")]
    pub scan_timeout: Duration,

    /// Accept responses with a wrong checksum
    #[arg(long)]
    pub skip_checksum: bool,
}
