//! Two-stage pipeline: square each number, then double it.
//!
//! Ten messages flow through a 3-worker square stage into a 2-worker double
//! stage. Output order varies between runs; the ids tie results back to inputs.
//!
//! Usage: cargo run --example square_double
//!        RUST_LOG=stage_pipeline=debug cargo run --example square_double

use stage_pipeline::{source, wait_all, BoxError, CancellationToken, Message, Stage};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let token = CancellationToken::new();
    let (input, producer) = source(1..=10i64, 0)?;

    let square = Stage::builder("square")
        .workers(3)
        .output_buffer(4)
        .build(|m: Message<i64>| -> Result<Message<i64>, BoxError> {
            Ok(Message::new(m.id, m.payload * m.payload))
        })?;

    let double = Stage::builder("double")
        .workers(2)
        .output_buffer(4)
        .build(|m: Message<i64>| -> Result<Message<i64>, BoxError> {
            Ok(Message::new(m.id, m.payload * 2))
        })?;

    let (squared, square_handle) = square.run(&token, input)?;
    let (doubled, double_handle) = double.run(&token, squared)?;

    for result in doubled {
        println!("[{}]: {}", result.id, result.payload);
    }

    let square_report = square_handle.metrics().snapshot().format();
    let double_report = double_handle.metrics().snapshot().format();
    wait_all([square_handle, double_handle])?;
    let produced = producer.join().map_err(|_| "producer panicked")?;

    println!();
    println!("square: {square_report}");
    println!("double: {double_report}");
    println!("produced: {produced}");
    Ok(())
}
