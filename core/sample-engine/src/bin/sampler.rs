//! Sampler CLI
//!
//! Runs publisher and/or subscriber samples and prints their traffic.
//!
//! # Usage
//!
//! ```bash
//! # Publish "hello" on t1 five times per second for ten seconds
//! sampler --role pub --topic t1 --message hello --frequency 5 --duration 10
//!
//! # Subscribe to two topics until Ctrl+C
//! sampler --role sub --subscribe t1,t2
//!
//! # Both sides in one process, hex on the wire, JSON lines output
//! sampler --role both --hex --hex-wire --json --duration 5
//!
//! # Using configuration file
//! sampler --config sampler.toml
//! ```

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use sample_engine::{
    Controller, EngineConfig, Endpoint, EventHandler, LogEntry, LogRecord, SampleId, SampleKind,
    SampleStats, TopicMatch,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Drain loop slice; bounds how quickly Ctrl+C is noticed
const POLL_SLICE: Duration = Duration::from_millis(200);

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Pub,
    Sub,
    Both,
}

/// Publish/subscribe sample runner
#[derive(Parser, Debug)]
#[command(name = "sampler")]
#[command(about = "Run publish/subscribe samples and print their traffic")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IPv4 address to bind/connect (`*` binds all interfaces)
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Which samples to run
    #[arg(short, long, value_enum, default_value = "both")]
    role: Role,

    /// Publisher topic
    #[arg(short, long)]
    topic: Option<String>,

    /// Subscriber topics (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    subscribe: Option<Vec<String>>,

    /// Publisher payload
    #[arg(short, long)]
    message: Option<String>,

    /// Messages per second (0 = send once)
    #[arg(short, long)]
    frequency: Option<u32>,

    /// Stop the publisher after this many messages
    #[arg(long)]
    count: Option<u64>,

    /// Hex-encode traffic
    #[arg(long)]
    hex: bool,

    /// Subscribe to publishers that send hex text
    #[arg(long)]
    hex_wire: bool,

    /// Match subscriber topics as prefixes
    #[arg(long)]
    prefix: bool,

    /// Traffic refresh rate (1-200 Hz)
    #[arg(long)]
    refresh_hz: Option<u32>,

    /// Run time in seconds (0 = until Ctrl+C)
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Prints relayed events to the terminal
struct Console {
    json: bool,
}

impl Console {
    fn traffic(&self, kind: &str, entry: &LogEntry) {
        if self.json {
            println!("{}", json!({ "event": kind, "entry": entry }));
        } else {
            println!("{}", entry);
        }
    }
}

impl EventHandler for Console {
    fn on_started(&mut self, sample: SampleId, kind: SampleKind, endpoint: Option<&Endpoint>) {
        let endpoint = endpoint.map(ToString::to_string).unwrap_or_default();
        if self.json {
            let event = json!({
                "event": "started",
                "sample": sample,
                "kind": kind,
                "endpoint": endpoint,
            });
            println!("{}", event);
        } else {
            println!("Started {} {} on {}", kind, sample, endpoint);
        }
    }

    fn on_message_sent(&mut self, entry: &LogEntry) {
        self.traffic("sent", entry);
    }

    fn on_message_received(&mut self, entry: &LogEntry) {
        self.traffic("received", entry);
    }

    fn on_finished(&mut self, sample: SampleId, stats: &SampleStats) {
        if self.json {
            println!("{}", json!({ "event": "finished", "sample": sample, "stats": stats }));
        } else {
            println!(
                "Finished {}: sent {}, received {}, timeouts {}",
                sample, stats.sent, stats.received, stats.timeouts
            );
        }
    }

    fn on_failure(&mut self, sample: SampleId, reason: &str) {
        if self.json {
            println!("{}", json!({ "event": "failure", "sample": sample, "reason": reason }));
        } else {
            eprintln!("Sample {} failed: {}", sample, reason);
        }
    }

    fn on_log(&mut self, record: &LogRecord) {
        // Plain output already gets log lines through tracing
        if self.json {
            println!("{}", json!({ "event": "log", "record": record }));
        }
    }
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(topic) = &args.topic {
        config.publisher.topic = topic.clone();
    }
    if let Some(topics) = &args.subscribe {
        config.subscriber.topics = topics.clone();
    }
    if let Some(message) = &args.message {
        config.publisher.payload = message.clone();
    }
    if let Some(frequency) = args.frequency {
        config.publisher.frequency = frequency;
    }
    if args.count.is_some() {
        config.publisher.max_messages = args.count;
    }
    if let Some(hz) = args.refresh_hz {
        config.traffic_refresh_hz = hz;
    }
    if args.prefix {
        config.subscriber.match_mode = TopicMatch::Prefix;
    }
    config.hex |= args.hex;
    config.subscriber.hex_wire |= args.hex_wire;

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Returns whether every sample ended without failure
fn run(args: &Args) -> Result<bool> {
    let config = build_config(args)?;
    let mut controller = Controller::from_config(&config)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;

    // Subscribers first so they are connecting by the time the publisher sends
    let mut ids = Vec::new();
    if matches!(args.role, Role::Sub | Role::Both) {
        ids.push(controller.create_sample(config.subscriber_config()));
    }
    if matches!(args.role, Role::Pub | Role::Both) {
        ids.push(controller.create_sample(config.publisher_config()));
    }
    for id in &ids {
        controller.start(*id)?;
    }

    info!(endpoint = %config.endpoint(), samples = ids.len(), "Sampler running");
    if args.duration == 0 {
        eprintln!("Press Ctrl+C to stop...");
    }

    let mut console = Console { json: args.json };
    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    while running.load(Ordering::SeqCst) {
        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            break;
        }
        if controller.run_until(POLL_SLICE, &mut console, |c| c.active() == 0) {
            break;
        }
    }

    controller.shutdown(SHUTDOWN_TIMEOUT, &mut console);

    let counters = controller.counters();
    if args.json {
        println!("{}", json!({ "event": "summary", "counters": counters }));
    } else {
        println!();
        println!("Summary:");
        println!("  Sent:      {}", counters.sent);
        println!("  Received:  {}", counters.received);
        println!("  Finished:  {}", counters.finished);
        println!("  Failures:  {}", counters.failures);
    }

    Ok(counters.failures == 0)
}
