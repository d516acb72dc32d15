mod webserver;

use crate::webserver::messages::{encode_into, ServerMessage, WsPayload};
use anyhow::{bail, Result};
use jt_config::{Config, DEFAULT_CONFIG_PATH};
use jt_mq::{MqError, TieredQueues};
use jt_sampler::{
    list_interfaces, spawn_compute_thread, spawn_sampling_thread, FrameRing, SamplerShared,
    StatsSink, SysClassNet,
};
use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};

/// Everything a WebSocket session needs: the configuration, the tiered
/// message bus, and the sampling controls.
pub struct Daemon {
    pub config: Config,
    pub queues: TieredQueues<WsPayload>,
    pub sampler: Arc<SamplerShared>,
}

/// Configure a highly detailed logging system.
pub fn set_console_logging() -> anyhow::Result<()> {
    // install global collector configured based on RUST_LOG env var.
    let level = if let Ok(level) = std::env::var("RUST_LOG") {
        match level.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => LevelFilter::WARN,
        }
    } else {
        LevelFilter::WARN
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        // Use a more compact, abbreviated log format
        .compact()
        // Display source code file paths
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(false)
        // Don't display the event's target (module path)
        .with_target(false)
        // Build the subscriber
        .finish();

    // Set the subscriber as the default
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Picks the interface to sample at startup: the configured default,
/// or the first allowed interface present on the system.
fn startup_interface(config: &Config) -> Result<String> {
    if let Some(iface) = &config.default_interface {
        return Ok(iface.clone());
    }
    let present = list_interfaces();
    let chosen = present
        .iter()
        .find(|iface| config.interface_allowed(iface))
        .cloned();
    match chosen {
        Some(iface) => Ok(iface),
        None => bail!("no sampleable network interface found"),
    }
}

fn main() -> Result<()> {
    // Set up logging
    set_console_logging()?;

    // Announce startup
    info!("JitterTrap Daemon Starting");

    // Load config
    let path = config_path();
    let config = Config::load(&path)?;

    let iface = startup_interface(&config)?;
    info!("Sampling {iface} at {} us", config.sample_period_us);

    let sampler = Arc::new(SamplerShared::new(&iface, config.sample_period_us));
    let ring = Arc::new(FrameRing::new());
    let daemon = Arc::new(Daemon {
        queues: TieredQueues::new(),
        sampler: sampler.clone(),
        config,
    });

    // Feed computed statistics into the message bus, routed to a tier
    // by their interval. No subscribers means nothing to do.
    let bus = daemon.clone();
    let sink: StatsSink = Arc::new(move |stats| {
        let interval_ns = stats.interval_ns;
        // Second-scale aggregates are the coarse feed for slow viewers.
        let message = if interval_ns >= 1_000_000_000 {
            ServerMessage::StatsSummary(stats)
        } else {
            ServerMessage::Stats(stats)
        };
        let result = bus
            .queues
            .produce_with(interval_ns, |slot| encode_into(&message, slot));
        match result {
            Ok(_) | Err(MqError::NoConsumers) => {}
            Err(err) => debug!("statistics message not published: {err}"),
        }
    });

    // Spawn the producer pipeline
    spawn_sampling_thread(
        SysClassNet::new(),
        sampler.clone(),
        ring.clone(),
        daemon.config.rt_cpu,
    )?;
    spawn_compute_thread(ring, sampler.clone(), sink)?;

    // Handle signals
    let mut signals = Signals::new([SIGINT, SIGHUP, SIGTERM])?;
    let hup_sampler = sampler.clone();
    std::thread::Builder::new()
        .name("Signal Handler".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                match sig {
                    SIGINT | SIGTERM => {
                        match sig {
                            SIGINT => warn!("Terminating on SIGINT"),
                            SIGTERM => warn!("Terminating on SIGTERM"),
                            _ => {
                                warn!("This should never happen - terminating on unknown signal")
                            }
                        }
                        std::process::exit(0);
                    }
                    SIGHUP => {
                        warn!("Reloading configuration because of SIGHUP");
                        match Config::load(&config_path()) {
                            Ok(config) => {
                                hup_sampler.set_sample_period(config.sample_period_us);
                            }
                            Err(err) => warn!("Unable to reload configuration: {err}"),
                        }
                    }
                    _ => warn!("No handler for signal: {sig}"),
                }
            }
        })?;

    let handle = std::thread::Builder::new()
        .name("Async Web".to_string())
        .spawn(move || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Unable to build the async runtime")
                .block_on(async {
                    if let Err(e) = webserver::spawn_webserver(daemon).await {
                        error!("Webserver Failed: {e:?}");
                    }
                });
        })?;
    let _ = handle.join();
    warn!("Main thread exiting");
    Ok(())
}
