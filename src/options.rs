use clap::Parser;

/// EM340 Bridge - sniffs EM340 meter traffic on an RS-485 ModBus RTU bus and publishes it to MQTT
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "em340.yaml")]
    pub config_file: String,

    /// Optional runtime limit in seconds
    #[clap(short = 't', long = "time")]
    pub runtime: Option<u64>,

    /// Check that the serial device is present and can be opened, then exit
    #[clap(long = "check")]
    pub check: bool,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
