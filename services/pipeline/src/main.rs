//! Blinkwatch Pipeline - session runner
//!
//! `pipeline replay <user_id>` runs one monitoring session over a signal
//! stream read from stdin. Each line is one JSON inbound signal:
//!
//! ```text
//! {"timestamp": 1700000000.033, "ear_value": 0.31}
//! ```
//!
//! Every line is acknowledged with a JSON line on stdout. Logs go to stderr.

use anyhow::{bail, Result};
use blinkwatch_pipeline::{
    Acknowledgement, EventPublisher, InboundSignal, KafkaSink, PipelineConfig, SessionController,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ACK_BUFFER: usize = 256;

/// Parse one stdin line; malformed input fails the session like a broken transport
fn parse_signal(line: std::io::Result<String>) -> Result<InboundSignal, String> {
    let line = line.map_err(|e| format!("read error: {}", e))?;
    serde_json::from_str(&line).map_err(|e| format!("malformed signal '{}': {}", line, e))
}

async fn run_replay(config: PipelineConfig, user_id: String) -> Result<()> {
    let sink = Arc::new(KafkaSink::new(config.kafka.clone())?);
    let publisher = EventPublisher::new(sink.clone(), config.kafka.topics.clone());
    let mut session = SessionController::new(publisher, config.blink.clone());

    let session_id = session.start(user_id.as_str())?;
    info!(session_id = %session_id, user_id = %user_id, "Replaying signals from stdin");

    let (ack_tx, mut ack_rx) = mpsc::channel::<Acknowledgement>(ACK_BUFFER);
    let printer = tokio::spawn(async move {
        while let Some(ack) = ack_rx.recv().await {
            match serde_json::to_string(&ack) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to encode acknowledgement: {}", e),
            }
        }
    });

    let lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let signals = lines
        .filter(|line| {
            let blank = matches!(line, Ok(l) if l.trim().is_empty());
            futures::future::ready(!blank)
        })
        .map(parse_signal);

    let outcome = session.drive(signals, ack_tx).await;
    let blinks = session.blink_count();
    drop(session);
    printer.await?;

    sink.flush(Duration::from_secs(10))?;

    match outcome {
        Ok(status) => {
            info!(session_id = %session_id, status = %status, blinks, "Session finished");
            Ok(())
        }
        Err(e) => bail!("session {} interrupted: {}", session_id, e),
    }
}

fn print_usage() {
    println!("Usage: pipeline replay <user_id>");
    println!();
    println!("Reads one JSON signal per line from stdin, e.g.");
    println!("  {{\"timestamp\": 1700000000.033, \"ear_value\": 0.31}}");
    println!("and publishes session, frame and blink events to Kafka.");
    println!();
    println!("Environment variables:");
    println!("  KAFKA_BOOTSTRAP_SERVERS       - Kafka broker addresses (default: localhost:9092)");
    println!("  KAFKA_SERVER / KAFKA_PORT     - Alternative broker host and port");
    println!("  KAFKA_SECURITY_PROTOCOL       - Security protocol (plaintext, ssl, sasl_ssl)");
    println!("  PIPELINE__BLINK__EAR_THRESHOLD - Eye-closed threshold (default: 0.28)");
    println!("  PIPELINE__LOGGING__LEVEL      - Log level (default: info)");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let (mode, user_id) = (args.get(1).map(|s| s.as_str()), args.get(2));

    let user_id = match (mode, user_id) {
        (Some("replay"), Some(user_id)) => user_id.clone(),
        _ => {
            print_usage();
            return Ok(());
        }
    };

    let config = PipelineConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!(
        brokers = %config.kafka.bootstrap_servers,
        threshold = config.blink.ear_threshold,
        "Blinkwatch pipeline starting"
    );

    run_replay(config, user_id).await
}
