//! All-or-nothing pipeline: an upstream failure cancels every stage.
//!
//! Stages never cancel the caller's token on their own. This demo watches
//! the first stage's handle and cancels the shared token as soon as it
//! fails, so the source and the downstream stage stop too. A deadline on
//! the same token bounds the whole run.
//!
//! Usage: cargo run --example fail_fast

use stage_pipeline::{source_with_cancel, BoxError, CancellationToken, Message, Stage};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let token = CancellationToken::new().with_timeout(Duration::from_secs(10));
    let (input, producer) = source_with_cancel(1i64.., 8, &token)?;

    let parse = Stage::builder("parse")
        .workers(4)
        .output_buffer(8)
        .build(|m: Message<i64>| -> Result<Message<i64>, BoxError> {
            if m.payload == 137 {
                return Err(format!("payload {} is malformed", m.payload).into());
            }
            Ok(m)
        })?;

    let enrich = Stage::builder("enrich")
        .workers(2)
        .output_buffer(8)
        .build(|m: Message<i64>| -> Result<Message<String>, BoxError> {
            thread::sleep(Duration::from_millis(1));
            Ok(m.map(|p| format!("record-{p:05}")))
        })?;

    let (parsed, parse_handle) = parse.run(&token, input)?;
    let (enriched, enrich_handle) = enrich.run(&token, parsed)?;

    let watcher = {
        let token = token.clone();
        thread::spawn(move || {
            let result = parse_handle.wait();
            if let Err(err) = &result {
                warn!(error = %err, "upstream failed, cancelling pipeline");
                token.cancel();
            }
            result
        })
    };

    let received = enriched.iter().count();
    let upstream = watcher.join().map_err(|_| "watcher panicked")?;
    let downstream = enrich_handle.wait();
    let produced = producer.join().map_err(|_| "producer panicked")?;

    info!(produced, received, "pipeline stopped");
    println!("parse:  {upstream:?}");
    println!("enrich: {downstream:?}");
    Ok(())
}
