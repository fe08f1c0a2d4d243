//! embedgate CLI
//!
//! Encodes texts through a fully configured engine and prints the vectors,
//! followed by the stats snapshot and health report.
//!
//! ```text
//! embedgate [--config <file>] [text ...]
//! ```
//!
//! Without text arguments every non-empty stdin line is one input.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use embedgate::{EncodeOptions, GatewayConfig, MetricsSink, RequestContext, build_engine};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

const PREVIEW_LEN: usize = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config_path, mut texts) = parse_args(std::env::args().skip(1))?;

    let config = match config_path {
        Some(path) => GatewayConfig::load_layered(Some(&path), None)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::load()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .json()
        .init();

    let engine = build_engine(&config, Arc::new(MetricsSink))?;

    if texts.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                texts.push(line);
            }
        }
    }
    if texts.is_empty() {
        anyhow::bail!("nothing to encode: pass texts as arguments or on stdin");
    }

    let (ctx, cancel) = RequestContext::with_cancel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            cancel.cancel();
        }
    });

    tracing::info!(
        texts = texts.len(),
        devices = config.devices.len(),
        config = config.name.as_deref().unwrap_or("default"),
        "encoding"
    );
    let vectors = engine
        .encode(&ctx, &texts, &EncodeOptions::default())
        .await?;

    for (index, (text, vector)) in texts.iter().zip(&vectors).enumerate() {
        let preview: Vec<f32> = vector.iter().take(PREVIEW_LEN).copied().collect();
        println!(
            "{}",
            json!({
                "index": index,
                "text": text,
                "dimension": vector.len(),
                "preview": preview,
            })
        );
    }

    let health = engine.health_check(&RequestContext::background()).await;
    println!("{}", serde_json::to_string_pretty(&engine.stats())?);
    println!("{}", serde_json::to_string_pretty(&health)?);

    Ok(())
}

fn parse_args<I>(args: I) -> anyhow::Result<(Option<PathBuf>, Vec<String>)>
where
    I: IntoIterator<Item = String>,
{
    let mut config = None;
    let mut texts = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a file path")?;
                config = Some(PathBuf::from(path));
            }
            "--" => texts.extend(args.by_ref()),
            _ => texts.push(arg),
        }
    }
    Ok((config, texts))
}
