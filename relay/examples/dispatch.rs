//! Dispatch a burst of requests across two endpoints.
//!
//! Run with: cargo run -p relay --example dispatch

use async_trait::async_trait;
use futures::future::join_all;
use relay::prelude::*;
use relay::{BatchCall, BudgetConfig, ItemOutput, ItemResult, ProviderInfo};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

/// Backend that embeds whole batches at once
#[derive(Debug)]
struct BatchEmbedder {
    info: Arc<ProviderInfo>,
}

impl BatchEmbedder {
    fn new() -> Self {
        Self {
            info: Arc::new(
                ProviderInfo::new("batch-embedder", "Batch Embedder").with_max_batch_size(16),
            ),
        }
    }
}

#[async_trait]
impl Provider for BatchEmbedder {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    async fn invoke(&self, call: BatchCall) -> std::result::Result<Vec<ItemResult>, RelayError> {
        tokio::time::sleep(Duration::from_millis(40)).await;
        Ok(call
            .inputs
            .iter()
            .map(|input| {
                let text = input.as_str().unwrap_or_default();
                Ok(ItemOutput::new(
                    serde_json::json!({ "embedding": [text.len() as f64, 0.5] }),
                    text.len() as u64,
                ))
            })
            .collect())
    }
}

/// Backend taking one input per call that fails every fifth call
#[derive(Debug)]
struct FlakySingle {
    info: Arc<ProviderInfo>,
    calls: AtomicUsize,
}

impl FlakySingle {
    fn new() -> Self {
        Self {
            info: Arc::new(
                ProviderInfo::new("flaky-single", "Flaky Single").with_max_batch_size(1),
            ),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Provider for FlakySingle {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    async fn invoke(&self, call: BatchCall) -> std::result::Result<Vec<ItemResult>, RelayError> {
        tokio::time::sleep(Duration::from_millis(15)).await;
        if self.calls.fetch_add(1, Ordering::Relaxed) % 5 == 4 {
            return Err(RelayError::rate_limit("busy"));
        }
        Ok(call
            .inputs
            .iter()
            .map(|input| {
                Ok(ItemOutput::new(
                    serde_json::json!({ "embedding": [0.0, 1.0], "input": input }),
                    4,
                ))
            })
            .collect())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .init();

    let dispatcher = Dispatcher::builder()
        .max_batch_size(32)
        .max_wait(Duration::from_millis(25))
        .routing_strategy(RoutingStrategy::LeastLoaded)
        .tenant_budget("acme", BudgetConfig::new(10_000))
        .add_endpoint(
            EndpointBuilder::new(
                EndpointConfig::new("primary").with_weight(3),
                BatchEmbedder::new(),
            )
            .layer(LoggingLayer::new()),
        )
        .add_endpoint(
            EndpointBuilder::new(EndpointConfig::new("secondary"), FlakySingle::new())
                .layer(UnbatchedLayer::new().with_max_parallel(4))
                .layer(RetryLayer::new().with_max_retries(2))
                .layer(LoggingLayer::with_prefix("[secondary]")),
        )
        .build()?;

    let mut submissions = Vec::new();
    for i in 0..40 {
        let options = SubmitOptions::new().with_tenant("acme");
        let submission = dispatcher
            .enqueue("embed-small", serde_json::json!(format!("document {}", i)), options)
            .await?;
        submissions.push(submission);
    }

    let results = join_all(submissions).await;
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    println!("{} of {} requests succeeded", succeeded, results.len());

    dispatcher.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&dispatcher.metrics_snapshot())?);
    println!("{}", serde_json::to_string_pretty(&dispatcher.endpoint_snapshots())?);
    Ok(())
}
