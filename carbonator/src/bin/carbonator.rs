use std::{path::PathBuf, sync::Arc};

use carbonator::{
    config::{self, Config, Telemetry},
    counter::Source,
    engine::{self, Engine},
};
use clap::{Args, Parser};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    runtime::Builder,
    signal,
    time::{Duration, interval},
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Carbonator config is invalid: {0}")]
    Config(#[from] config::Error),
    #[error("Carbonator engine returned an error: {0}")]
    Engine(#[from] engine::Error),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[cfg(not(target_os = "linux"))]
    #[error("No counter source is available on this platform")]
    UnsupportedPlatform,
}

fn default_config_path() -> String {
    "/etc/carbonator/carbonator.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
enum Commands {
    /// Run carbonator with specified configuration
    Run(RunCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// the maximum time to wait, in seconds, for shutdown to complete
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

#[cfg(target_os = "linux")]
fn counter_source() -> Result<Arc<dyn Source>, Error> {
    Ok(Arc::new(carbonator::counter::procfs::Procfs::new()))
}

#[cfg(not(target_os = "linux"))]
fn counter_source() -> Result<Arc<dyn Source>, Error> {
    Err(Error::UnsupportedPlatform)
}

#[cfg(unix)]
async fn terminate() -> Result<(), Error> {
    signal::unix::signal(signal::unix::SignalKind::terminate())?
        .recv()
        .await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> Result<(), Error> {
    std::future::pending().await
}

async fn inner_main(config: Config) -> Result<(), Error> {
    if let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = config.telemetry.clone()
    {
        let mut builder = PrometheusBuilder::new().with_http_listener(addr);
        for (k, v) in global_labels {
            builder = builder.add_global_label(k, v);
        }
        builder.install()?;
        info!("prometheus telemetry listening on {addr}");
    }

    let engine = Engine::new(&config, counter_source()?)?;
    engine.start()?;

    let ctrl_c = signal::ctrl_c();
    let sigterm = terminate();
    tokio::pin!(ctrl_c);
    tokio::pin!(sigterm);
    let mut heartbeat = interval(Duration::from_millis(400));
    let res = loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                metrics::gauge!("carbonator.running").set(1.0);
            },
            res = &mut ctrl_c => {
                info!("received ctrl-c");
                break res.map_err(Error::from);
            },
            res = &mut sigterm => {
                info!("received SIGTERM");
                break res;
            },
        }
    };
    engine.stop().await;
    res
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting carbonator {version} run.");

    let args = match Commands::parse() {
        Commands::Run(args) => args,
        Commands::ConfigCheck(args) => {
            match config::load(&PathBuf::from(args.config_path)) {
                Ok(config) => {
                    info!(
                        "configuration valid: {counters} counter selectors, {outputs} outputs",
                        counters = config.counters.len(),
                        outputs = config.outputs.len()
                    );
                    std::process::exit(0)
                }
                Err(err) => {
                    error!("configuration invalid: {err}");
                    std::process::exit(1)
                }
            }
        }
    };

    let config = config::load(&PathBuf::from(&args.config_path)).inspect_err(|err| {
        error!("Could not load configuration from {}: {err}", args.config_path);
    })?;
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}
