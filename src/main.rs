//! pgbridge demo: publish lines from stdin and print what subscribers see.
//!
//! # Usage
//!
//! ```bash
//! pgbridge --topics orders,invoices
//! orders {"id": 1}
//! invoices "paid"
//! ```
//!
//! Each input line is `<channel> <payload>`; payloads that are not valid
//! JSON are sent as strings. Every topic gets a callback subscription,
//! and one bridge pulls from all topics at once.
//!
//! Environment variables can also be used:
//! - `PGBRIDGE_TOPICS`: Channels to listen to
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//! - `PGBRIDGE_LOG_FORMAT`: `text` or `json`

use anyhow::{Context, Result};
use pgbridge::config::Config;
use pgbridge::observability::metrics::init_metrics_with_endpoint;
use pgbridge::observability::tracing::init_tracing;
use pgbridge::transport::MemoryBroker;
use pgbridge::{EngineEvent, Message, PubSub};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

/// Channel used when no topics are configured.
const DEFAULT_TOPIC: &str = "events";

fn print_banner(config: &Config, topics: &[String]) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        r#"
  pgbridge v{} - push notifications, pulled

  Configuration:
    Topics:         {}
    Unlisten:       {:?}
    Payload limit:  {} bytes
    Log Level:      {} ({:?})

  Type `<channel> <payload>` lines. Ctrl+D or Ctrl+C to exit.
"#,
        version,
        topics.join(", "),
        config.unlisten_policy,
        config.max_payload_bytes,
        config.log_level,
        config.log_format
    );
}

/// Split an input line into channel and payload.
fn parse_line(line: &str) -> Option<(&str, Value)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (channel, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let payload =
        serde_json::from_str(rest).unwrap_or_else(|_| Value::String(rest.to_string()));
    Some((channel, payload))
}

fn describe(message: &Message) -> String {
    match message {
        Message::Payload(value) => value.to_string(),
        Message::Error(err) => format!("error: {err}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Config::parse_args();
    init_tracing(&config.log_level, config.log_format);
    init_metrics_with_endpoint(config.otel_endpoint.as_deref());

    if config.topics.is_empty() {
        config.topics.push(DEFAULT_TOPIC.to_string());
    }
    let topics = config.topics.clone();
    print_banner(&config, &topics);

    let broker = MemoryBroker::new();
    let pubsub = PubSub::new(
        broker.notifier(config.notifier_options()),
        config.engine_options(),
    );
    pubsub.connect().await.context("failed to connect")?;

    for topic in &topics {
        let channel = topic.clone();
        pubsub
            .subscribe(topic, move |message| {
                println!("[subscription:{channel}] {}", describe(&message));
            })
            .await
            .with_context(|| format!("failed to subscribe to '{topic}'"))?;
    }

    let bridge = pubsub
        .async_iterator(topics.as_slice())
        .context("failed to open bridge")?;
    let bridge_task = tokio::spawn(async move {
        let mut pulled: u64 = 0;
        while let Some(message) = bridge.next().await {
            pulled += 1;
            println!("[bridge #{pulled}] {}", describe(&message));
        }
        tracing::debug!(pulled, "Bridge drained");
    });

    let mut events = pubsub.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::Connected => tracing::info!("Engine connected"),
                EngineEvent::Error(err) => eprintln!("error event: {err}"),
            }
        }
    });

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown_rx.changed() => break,
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        if let Some((channel, payload)) = parse_line(&line) {
            if !pubsub.publish(channel, payload).await {
                eprintln!("not connected, dropped message for '{channel}'");
            }
        }
    }

    pubsub.close().await.context("failed to close")?;
    let _ = bridge_task.await;
    tracing::info!("pgbridge shutdown complete");
    Ok(())
}
