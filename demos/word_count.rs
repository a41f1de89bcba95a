//! Word frequency counter pipeline
//!
//! Reads lines from stdin, splits them into words in one stage, normalizes
//! the words in a second stage, and counts them in the consumer. The counts
//! live only in the consumer; workers just pass messages along.
//!
//! Usage: cargo run --example word_count --release
//!        (Then type lines of text and press Ctrl-D to finish)

use stage_pipeline::{source, wait_all, BoxError, CancellationToken, Message, Stage};
use std::collections::HashMap;
use std::io::{self, BufRead};
use tracing_subscriber::EnvFilter;

fn split_words(line: Message<String>) -> Result<Message<Vec<String>>, BoxError> {
    Ok(line.map(|text| {
        text.split_whitespace()
            .map(|w| w.to_lowercase())
            .collect()
    }))
}

fn clean_words(words: Message<Vec<String>>) -> Result<Message<Vec<String>>, BoxError> {
    Ok(words.map(|words| {
        words
            .into_iter()
            .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
            .filter(|w| w.len() > 2)
            .collect()
    }))
}

fn top_n(counts: &HashMap<String, usize>, n: usize) -> Vec<(&str, usize)> {
    let mut items: Vec<_> = counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    items.truncate(n);
    items
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("Word Frequency Counter Pipeline");
    println!("================================");
    println!("Enter lines of text (Ctrl-D to finish):");
    println!();

    let lines: Vec<String> = io::stdin().lock().lines().map_while(Result::ok).collect();

    let token = CancellationToken::new();
    let (input, producer) = source(lines, 100)?;

    let splitter = Stage::builder("splitter")
        .workers(2)
        .output_buffer(100)
        .build(split_words)?;
    let cleaner = Stage::builder("cleaner")
        .workers(4)
        .output_buffer(200)
        .build(clean_words)?;

    let (split, split_handle) = splitter.run(&token, input)?;
    let (cleaned, clean_handle) = cleaner.run(&token, split)?;

    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut total = 0usize;
    for msg in cleaned {
        for word in msg.payload {
            *counts.entry(word).or_insert(0) += 1;
            total += 1;
        }
    }

    wait_all([split_handle, clean_handle])?;
    let lines_read = producer.join().unwrap_or(0);

    println!("\n=== Top 10 Words ({total} words, {lines_read} lines) ===");
    for (i, (word, count)) in top_n(&counts, 10).into_iter().enumerate() {
        println!("{:2}. {} ({})", i + 1, word, count);
    }

    Ok(())
}
