//! `sortline` – the sorting-line bridge daemon.
//!
//! 1. Loads `~/.sortline/config.toml` (or `$SORTLINE_CONFIG`) and applies
//!    environment overrides.
//! 2. Opens the belt controller's serial port and the broker connection, or
//!    in-process stand-ins for both with `--simulate`.
//! 3. Runs the detection bridge until the controller link closes or the
//!    operator presses **Ctrl-C**.

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use futures_util::stream::BoxStream;
use sortline_hal::{SerialLink, SimSerialLink, TokioSerialLink};
use sortline_middleware::{
    AmqpConnector, EventBus, MemoryBroker, QueueClient, QueueConnector, Topic, TopicReceiver,
    redact_amqp_url,
};
use sortline_runtime::{DetectionBridge, DetectionReporter, init_tracing};
use sortline_types::{CycleOutcome, EventPayload, HardwareEvent, SortError};
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    let simulate = std::env::args().skip(1).any(|arg| arg == "--simulate");

    // Held until exit so pending spans are flushed.
    let telemetry = init_tracing("sortline");

    print_banner(simulate);

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red().bold());
            return ExitCode::FAILURE;
        }
    };
    println!(
        "  Config from {}",
        config::config_path().display().to_string().bold()
    );
    info!(
        config = ?cfg,
        simulate,
        span_export = telemetry.is_exporting(),
        "configuration loaded"
    );

    match run(cfg, simulate).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "sortline stopped");
            eprintln!("{}: {e}", "Error".red().bold());
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────────────────

async fn run(cfg: Config, simulate: bool) -> Result<(), SortError> {
    let bridge_config = cfg
        .bridge_config()
        .map_err(|e| SortError::Config(e.to_string()))?;
    let bus = Arc::new(EventBus::default());
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let (link, lines, connector, url): (
        Arc<dyn SerialLink>,
        BoxStream<'static, HardwareEvent>,
        Arc<dyn QueueConnector>,
        String,
    ) = if simulate {
        let broker = MemoryBroker::new();
        let sim = Arc::new(SimSerialLink::new("sim"));
        let (link, lines) = with_lines(Arc::clone(&sim));
        tasks.push(tokio::spawn(feed_stdin(
            Arc::clone(&sim),
            broker.clone(),
            cfg.broker.queue.clone(),
        )));
        tasks.push(tokio::spawn(print_outcomes(bus.subscribe_to(Topic::Decisions))));
        println!(
            "  {} Type {} to trigger a cycle, or a JSON line to enqueue a classification.\n",
            "simulate:".yellow().bold(),
            bridge_config.trigger.bold()
        );
        (link, lines, Arc::new(broker) as Arc<dyn QueueConnector>, "memory://".to_string())
    } else {
        let (link, lines) = with_lines(Arc::new(TokioSerialLink::open(
            &cfg.serial.path,
            cfg.serial.baud_rate,
        )?));
        println!(
            "  Serial {} @ {} baud, broker {}\n",
            cfg.serial.path.bold(),
            cfg.serial.baud_rate,
            redact_amqp_url(&cfg.broker.amqp_url()).bold()
        );
        (
            link,
            lines,
            Arc::new(AmqpConnector::new()) as Arc<dyn QueueConnector>,
            cfg.broker.amqp_url(),
        )
    };

    let queue = Arc::new(
        QueueClient::new(connector, url, cfg.broker.queue.clone()).with_bus(Arc::clone(&bus)),
    );
    tasks.push(tokio::spawn(Arc::clone(&queue).supervise(cfg.reconnect.clone())));
    tasks.push(tokio::spawn(log_alerts(bus.subscribe_to(Topic::SystemAlerts))));

    if let Some(detections_url) = &cfg.reporter.detections_url {
        let reporter = DetectionReporter::new(
            detections_url.clone(),
            Duration::from_millis(cfg.reporter.timeout_ms),
        )?;
        info!(url = %reporter.url(), "reporting detections to the dashboard");
        tasks.push(tokio::spawn(reporter.run(bus.subscribe_to(Topic::Decisions))));
    }

    let bridge = DetectionBridge::new(bridge_config, queue, Arc::clone(&link)).with_bus(bus);

    let result = tokio::select! {
        _ = bridge.run(lines) => Err(SortError::Serial {
            port: link.port().to_string(),
            details: "controller line stream ended".to_string(),
        }),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Ctrl-C listener failed; shutting down");
            }
            println!();
            println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
            Ok(())
        }
    };

    for task in &tasks {
        task.abort();
    }
    info!(cycles = bridge.cycles_started(), "bridge stopped");
    result
}

/// Subscribe to `link` before anything else can run, so the bridge sees every
/// line the controller sends after the link opened.
fn with_lines<L: SerialLink + 'static>(
    link: Arc<L>,
) -> (Arc<dyn SerialLink>, BoxStream<'static, HardwareEvent>) {
    let lines = link.lines();
    (link, lines)
}

/// Simulate mode input: JSON lines go to the queue, everything else is a
/// controller line.
async fn feed_stdin(link: Arc<SimSerialLink>, broker: MemoryBroker, queue: String) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.starts_with('{') {
                    broker.publish(&queue, line.as_bytes().to_vec());
                    println!("  {} {}", "enqueued".dimmed(), line);
                } else if !line.is_empty() {
                    link.inject(line);
                }
            }
            Ok(None) => {
                info!("stdin closed; no more simulated input");
                break;
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        }
    }
}

async fn print_outcomes(mut decisions: TopicReceiver) {
    while let Some(event) = decisions.next_event().await {
        let EventPayload::CycleCompleted {
            cycle,
            outcome,
            elapsed_ms,
        } = event.payload
        else {
            continue;
        };
        let command = match outcome.command() {
            Some(command) => command.name().green().bold(),
            None => "none".red().bold(),
        };
        let detail = match &outcome {
            CycleOutcome::Routed { label, .. } | CycleOutcome::Unmatched { label, .. } => {
                format!("label {label}")
            }
            CycleOutcome::Malformed { reason } => format!("malformed: {reason}"),
            CycleOutcome::TimedOut { attempts } => format!("no message after {attempts} attempts"),
            CycleOutcome::QueueOffline { .. } => "queue offline".to_string(),
        };
        println!("  #{cycle} → {command} ({detail}, {elapsed_ms} ms)");
    }
}

async fn log_alerts(mut alerts: TopicReceiver) {
    while let Some(event) = alerts.next_event().await {
        match event.payload {
            EventPayload::QueueConnectivity { connected } => {
                info!(connected, source = %event.source, "broker connectivity changed");
            }
            EventPayload::Fault { component, message } => {
                warn!(%component, %message, "fault reported");
            }
            _ => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner(simulate: bool) {
    println!();
    println!("{}", r#"   _____            __  __    _          "#.bold().cyan());
    println!("{}", r#"  / ___/___  ____  / /_/ /   (_)___  ___ "#.bold().cyan());
    println!("{}", r#"  \__ \/ _ \/ __/ / __/ /   / / _ \/ -_)"#.bold().cyan());
    println!("{}", r#" ___/ /\___/_/    \__/_____/_/_//_/\__/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}{}",
        "SortLine".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed(),
        if simulate { " (simulated line)".yellow().to_string() } else { String::new() }
    );
    println!("  Detection-to-actuation bridge");
    println!();
}
