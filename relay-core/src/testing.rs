//! In-crate provider double for tests.

use crate::error::RelayError;
use crate::provider::Provider;
use crate::types::{estimate_tokens, BatchCall, ItemOutput, ItemResult, ProviderInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Behaviour of one scripted call
#[derive(Debug, Clone)]
pub enum Step {
    /// Echo every input
    Echo,
    /// Fail the whole call
    Fail(RelayError),
    /// Fail the items at these positions
    FailItems(Vec<usize>),
    /// Answer with one result too few
    ShortResults,
    /// Sleep, then echo
    Delay(Duration),
}

/// Provider that records every call and follows a script.
///
/// Without a script step it echoes each input as `{"echo": input}` and
/// reports the input's estimated token count as usage.
#[derive(Debug)]
pub struct ScriptedProvider {
    info: Arc<ProviderInfo>,
    calls: Mutex<Vec<BatchCall>>,
    script: Mutex<VecDeque<Step>>,
    failing: AtomicBool,
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Self {
        Self {
            info: Arc::new(ProviderInfo::new(id, format!("Scripted {}", id))),
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.info = Arc::new(self.info.as_ref().clone().with_max_batch_size(size));
        self
    }

    /// Queue behaviour for the next calls
    pub fn push(&self, step: Step) {
        self.script.lock().push_back(step);
    }

    /// Fail every call until switched off
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<BatchCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.calls.lock().iter().map(|c| c.len()).collect()
    }
}

fn echo(call: &BatchCall) -> Vec<ItemResult> {
    call.inputs
        .iter()
        .map(|input| {
            Ok(ItemOutput::new(
                serde_json::json!({ "echo": input }),
                estimate_tokens(input),
            ))
        })
        .collect()
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    async fn invoke(&self, call: BatchCall) -> Result<Vec<ItemResult>, RelayError> {
        self.calls.lock().push(call.clone());
        let step = self.script.lock().pop_front().unwrap_or(Step::Echo);

        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::provider("scripted failure"));
        }

        match step {
            Step::Echo => Ok(echo(&call)),
            Step::Fail(error) => Err(error),
            Step::FailItems(positions) => Ok(echo(&call)
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    if positions.contains(&i) {
                        Err(RelayError::provider(format!("item {} rejected", i)))
                    } else {
                        item
                    }
                })
                .collect()),
            Step::ShortResults => {
                let mut results = echo(&call);
                results.pop();
                Ok(results)
            }
            Step::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(echo(&call))
            }
        }
    }
}
