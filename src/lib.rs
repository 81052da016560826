#[macro_use]
pub mod error;

pub mod capture;
pub mod channels;
pub mod config;
pub mod health;
pub mod modbus;
pub mod mqtt;
pub mod options;
pub mod prelude;
pub mod reading;
pub mod register;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use crate::capture::Capture;
use crate::modbus::TransactionParser;
use crate::mqtt::Mqtt;
use crate::options::Options;

use std::io::Write;

pub fn init_logging(default_level: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(err) = result {
        eprintln!("logger already initialised: {}", err);
    }
}

/// Load the config, then either run the health check or the bridge.
pub async fn app(options: Options) -> Result<()> {
    let config = match Config::new(&options.config_file) {
        Ok(config) => config,
        Err(err) => {
            init_logging("info");
            return Err(err);
        }
    };

    init_logging(config.loglevel());

    if options.check {
        return health::check(&config);
    }

    info!("em340-bridge {} starting", CARGO_PKG_VERSION);
    config.log_summary();

    run(config, options.runtime).await
}

/// Run capture -> parser -> mqtt until Ctrl-C, the runtime limit or a capture failure.
pub async fn run(config: Config, runtime: Option<u64>) -> Result<()> {
    let schema = Arc::new(config.schema());
    if schema.is_empty() {
        warn!("no sensors configured, nothing will be published");
    }

    let Channels {
        to_parser,
        from_capture,
        to_mqtt,
        from_parser,
    } = Channels::new();
    let cancel = CancellationToken::new();

    info!("Initializing components...");
    let mqtt = tokio::spawn(Mqtt::new(config.clone()).start(from_parser));
    let parser = tokio::spawn(TransactionParser::from_config(&config, schema).start(from_capture, to_mqtt));
    let capture = tokio::spawn(Capture::new(config.device.clone()).start(to_parser, cancel.clone()));

    let signals = tokio::spawn(wait_for_shutdown(runtime, cancel.clone()));

    // each stage ends once the one before it has dropped its sender
    let captured = capture.await?;
    cancel.cancel();
    let parser_stats = parser.await?;
    let publish_stats = mqtt.await?;
    signals.await?;

    match &parser_stats {
        Ok(stats) => stats.print_summary(),
        Err(err) => error!("parser failed: {}", err),
    }
    match &publish_stats {
        Ok(stats) => stats.print_summary(),
        Err(err) => error!("mqtt failed: {}", err),
    }

    let bytes = captured.map_err(|err| anyhow!("capture failed: {}", err))?;
    info!("captured {} bytes, shutdown complete", bytes);

    parser_stats?;
    publish_stats?;

    Ok(())
}

async fn wait_for_shutdown(runtime: Option<u64>, cancel: CancellationToken) {
    let limit = async {
        match runtime {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!("Failed to listen for ctrl+c: {}", err);
            }
            info!("shutdown signal received, stopping components...");
        }
        _ = limit => info!("runtime limit reached, stopping components..."),
        _ = cancel.cancelled() => return,
    }

    cancel.cancel();
}
