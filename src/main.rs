//! Sunsynk bridge — main entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  TcpTransport / SerialTransport / DongleTransport              │
//! │  MqttSink (PublishSink)      CommandRouter (ingress)           │
//! │                                                                │
//! │  ──────────────── Port boundary ────────────────────────       │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │  InverterAgent (per inverter)                          │    │
//! │  │  planner · codec · state map · report predicates       │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  Timer loop (1 Hz, bounded concurrency) · shutdown signal      │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Exit codes: 0 normal shutdown, 1 invalid configuration,
//! 2 inverter connection failure at startup (after the grace delay).

#![deny(unused_must_use)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use tokio::sync::{Mutex, mpsc, watch};

use sunsynk_bridge::agent::{AgentState, InverterAgent};
use sunsynk_bridge::config::Options;
use sunsynk_bridge::connect::ConnectorManager;
use sunsynk_bridge::mqtt::{self, CommandRouter, MqttSink, PublishSink};
use sunsynk_bridge::schedule::ScheduleTable;
use sunsynk_bridge::sensor::defs::{DefFamily, SensorDefinitions};
use sunsynk_bridge::sensor_options::SensorOptions;
use sunsynk_bridge::timer::{AsyncCallback, Callback, SyncCallback, run_callbacks};

/// Grace delay before a fatal exit, so the supervisor watchdog restart
/// does not race the logs.
const FATAL_GRACE: Duration = Duration::from_secs(30);

const EXIT_CONFIG: u8 = 1;
const EXIT_CONNECT: u8 = 2;

fn options_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("OPTIONS_FILE").ok())
        .unwrap_or_else(|| "/data/options.json".to_string())
        .into()
}

#[tokio::main]
async fn main() -> ExitCode {
    // ── 1. Options & logging ──────────────────────────────────
    let opt = match Options::load(&options_path()) {
        Ok(opt) => opt,
        Err(e) => {
            env_logger::Builder::new()
                .filter_level(log::LevelFilter::Info)
                .init();
            error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    env_logger::Builder::from_default_env()
        .filter_level(opt.log_level())
        .init();
    info!("sunsynk-bridge v{}", env!("CARGO_PKG_VERSION"));

    match run(Arc::new(opt)).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(opt: Arc<Options>) -> Result<ExitCode> {
    // ── 2. Definitions, schedules, sensor options ─────────────
    let Some(family) = DefFamily::from_option(&opt.sensor_definitions) else {
        error!("invalid sensor_definitions: {}", opt.sensor_definitions);
        return Ok(ExitCode::from(EXIT_CONFIG));
    };
    let defs = SensorDefinitions::load(family, opt.prog_time_interval);
    let schedules = ScheduleTable::new(&opt.schedules);
    let sensor_options = SensorOptions::build(
        &defs,
        &schedules,
        &opt.sensors,
        &opt.sensors_first_inverter,
    );
    info!(
        "{} sensors configured ({} definitions available)",
        sensor_options.len(),
        defs.iter().count()
    );

    // ── 3. Connectors ─────────────────────────────────────────
    let mut connectors = match ConnectorManager::from_options(&opt) {
        Ok(m) => m,
        Err(e) => {
            error!("{e}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    // ── 4. Shutdown signal ────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let exit_code = Arc::new(AtomicU8::new(0));
    spawn_signal_handler(shutdown_tx.clone());

    // ── 5. Broker connection & command routing ────────────────
    let mut router = CommandRouter::default();
    let mut command_rx = Vec::new();
    for inv in &opt.inverters {
        let (tx, rx) = mpsc::channel(32);
        router.add(&inv.ha_prefix, tx);
        command_rx.push(rx);
    }
    let sink: Arc<MqttSink> = match mqtt::connect_broker(&opt, router, shutdown_rx.clone()) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!("{e}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    let availability = mqtt::availability_topic(&opt.inverters[0].ha_prefix);

    // ── 6. Agents: build, connect, discover ───────────────────
    let mut agents: Vec<Arc<Mutex<InverterAgent>>> = Vec::new();
    for (index, inv) in opt.inverters.iter().enumerate() {
        let connector = match connectors.for_inverter(inv, &opt) {
            Ok(c) => c,
            Err(e) => {
                error!("{e}");
                return Ok(ExitCode::from(EXIT_CONFIG));
            }
        };
        info!(
            "inverter {index} ({}): connector {}, unit {}",
            inv.ha_prefix,
            connector.name(),
            inv.modbus_id
        );
        let mut agent = InverterAgent::new(
            index,
            inv.clone(),
            Arc::clone(&opt),
            connector,
            sensor_options.for_inverter(index),
            command_rx.remove(0),
        );

        if let Err(e) = agent.connect().await {
            agent.log_bold(&e.to_string());
            error!(
                "This bridge will terminate in 30 seconds, use the supervisor watchdog to restart automatically."
            );
            tokio::time::sleep(FATAL_GRACE).await;
            return Ok(ExitCode::from(EXIT_CONNECT));
        }
        agent.discover(sink.as_ref()).await;
        agents.push(Arc::new(Mutex::new(agent)));
    }

    if let Err(e) = sink.publish(&availability, "online", true).await {
        warn!("{e}");
    }

    // ── 7. Timer callbacks ────────────────────────────────────
    let mut callbacks: Vec<Callback> = Vec::new();

    for agent in &agents {
        let agent = Arc::clone(agent);
        let sink: Arc<dyn PublishSink> = sink.clone();
        callbacks.push(Callback::Async(AsyncCallback::new("inverter", 1, move |t| {
            let agent = Arc::clone(&agent);
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                agent.lock().await.tick(t, sink.as_ref()).await;
            })
        })));
    }

    // Discovery-info flush, every 5 s (dependency propagator output).
    {
        let agents = agents.clone();
        let sink: Arc<dyn PublishSink> = sink.clone();
        callbacks.push(Callback::Async(AsyncCallback::new(
            "discovery_info",
            5,
            move |_t| {
                let agents = agents.clone();
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    for agent in agents {
                        agent.lock().await.flush_discovery(sink.as_ref()).await;
                    }
                })
            },
        )));
    }

    // Availability + fatal supervision, every 5 s.
    {
        let agents = agents.clone();
        let sink: Arc<dyn PublishSink> = sink.clone();
        let shutdown_tx = shutdown_tx.clone();
        let exit_code = Arc::clone(&exit_code);
        let fatal_scheduled = Arc::new(AtomicBool::new(false));
        let topic = availability.clone();
        callbacks.push(Callback::Async(AsyncCallback::new(
            "availability",
            5,
            move |_t| {
                let agents = agents.clone();
                let sink = Arc::clone(&sink);
                let shutdown_tx = shutdown_tx.clone();
                let exit_code = Arc::clone(&exit_code);
                let fatal_scheduled = Arc::clone(&fatal_scheduled);
                let topic = topic.clone();
                Box::pin(async move {
                    let mut states = Vec::with_capacity(agents.len());
                    for agent in &agents {
                        states.push(agent.lock().await.state());
                    }
                    let online = states
                        .iter()
                        .any(|s| !matches!(s, AgentState::Connecting | AgentState::Fatal));
                    let payload = if online { "online" } else { "offline" };
                    if let Err(e) = sink.publish(&topic, payload, true).await {
                        warn!("{e}");
                    }

                    let any_fatal = states.iter().any(|s| matches!(s, AgentState::Fatal));
                    if any_fatal && !fatal_scheduled.swap(true, Ordering::SeqCst) {
                        error!(
                            "An inverter is in a fatal state. This bridge will terminate in 30 seconds."
                        );
                        exit_code.store(EXIT_CONNECT, Ordering::SeqCst);
                        tokio::spawn(async move {
                            tokio::time::sleep(FATAL_GRACE).await;
                            let _ = shutdown_tx.send(true);
                        });
                    }
                })
            },
        )));
    }

    // Per-agent statistics, every 120 s.
    {
        let agents = agents.clone();
        callbacks.push(Callback::Async(AsyncCallback::new("stats", 120, move |_t| {
            let agents = agents.clone();
            Box::pin(async move {
                for agent in agents {
                    agent.lock().await.log_stats();
                }
            })
        })));
    }

    // Connector statistics, every 300 s; atomics, no lock needed.
    {
        let mut seen = std::collections::HashSet::new();
        let connector_list: Vec<_> = opt
            .inverters
            .iter()
            .filter_map(|inv| connectors.get(&inv.connector))
            .filter(|c| seen.insert(c.name().to_string()))
            .collect();
        callbacks.push(Callback::Sync(SyncCallback::new("conn_stats", 300, move |_t| {
            for conn in &connector_list {
                let stats = conn.stats();
                info!(
                    "connector {}: requests {}, errors {}, timeouts {}",
                    conn.name(),
                    stats.requests.load(Ordering::Relaxed),
                    stats.errors.load(Ordering::Relaxed),
                    stats.timeouts.load(Ordering::Relaxed),
                );
            }
        })));
    }

    // ── 8. Run until shutdown ─────────────────────────────────
    run_callbacks(callbacks, agents.len(), shutdown_rx).await;

    // ── 9. Drain: availability offline, flush the broker link ─
    if let Err(e) = sink.publish(&availability, "offline", true).await {
        warn!("{e}");
    }
    sink.disconnect().await;
    info!("shutdown complete");
    Ok(ExitCode::from(exit_code.load(Ordering::SeqCst)))
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("SIGTERM handler unavailable: {e}");
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}
