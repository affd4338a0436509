//! Word frequency counter pipeline
//!
//! Reads lines from stdin, splits into words, counts frequencies, and prints top-N words.
//!
//! Usage: cargo run --example word_count --release
//!        (Then type lines of text and press Ctrl-D to finish)

use std::collections::HashMap;
use std::io::{self, BufRead};
use stream_engine::{init_tracing, StageError, StreamPipeline};

fn top_n(counts: &HashMap<String, usize>, n: usize) -> Vec<(&str, usize)> {
    let mut items: Vec<_> = counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    items.truncate(n);
    items
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");

    println!("Word Frequency Counter Pipeline");
    println!("================================");
    println!("Enter lines of text (Ctrl-D to finish):");
    println!();

    let mut words = Vec::new();
    for line in io::stdin().lock().lines() {
        let line = line?;
        words.extend(line.split_whitespace().map(str::to_lowercase));
    }

    let counts = StreamPipeline::new()
        .source(words)
        .transform(|word: String| {
            let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
            if cleaned.is_empty() {
                return Err(StageError::msg(format!("no letters in {word:?}")));
            }
            Ok(cleaned)
        })
        // Punctuation-only tokens are dropped rather than failing the run
        .catch(|_, _| None)
        .filter(|word| word.len() > 2)
        .on_progress(|progress| {
            if progress.processed % 100 == 0 {
                tracing::info!(processed = progress.processed, "counting");
            }
        })
        .reduce(
            |mut counts: HashMap<String, usize>, word| {
                *counts.entry(word).or_insert(0) += 1;
                counts
            },
            HashMap::new(),
        )
        .await?;

    println!("\n=== Top 10 Words ===");
    for (i, (word, count)) in top_n(&counts, 10).into_iter().enumerate() {
        println!("{:2}. {} ({})", i + 1, word, count);
    }

    println!("\n\nProcessing complete!");

    Ok(())
}
