//! Shared fixtures for the pool test suites.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lg_domain::config::{EngineOptions, ModelConfig};
use lg_domain::function::FunctionHandler;
use lg_domain::sampling::SamplingParams;
use lg_domain::Result;
use lg_pool::{Pool, PoolOptions};
use lg_runtime::mock::MockRuntime;
use lg_runtime::InferenceRuntime;

pub fn model_config(file: &Path) -> ModelConfig {
    ModelConfig {
        file: file.to_path_buf(),
        url: None,
        context_size: 2048,
        engine: EngineOptions::default(),
        grammars: HashMap::new(),
        preload: None,
        completion_defaults: SamplingParams::default(),
        functions: HashMap::new(),
    }
}

pub fn write_weights(dir: &Path, name: &str) -> PathBuf {
    let file = dir.join(name);
    std::fs::write(&file, b"weights").unwrap();
    file
}

pub fn make_pool(
    runtime: &MockRuntime,
    concurrency: usize,
    models_dir: &Path,
    models: Vec<(&str, ModelConfig)>,
) -> Pool {
    let runtime: Arc<dyn InferenceRuntime> = Arc::new(runtime.clone());
    Pool::new(
        runtime,
        PoolOptions {
            concurrency,
            models_dir: Some(models_dir.to_path_buf()),
            models: models
                .into_iter()
                .map(|(name, config)| (name.to_string(), config))
                .collect(),
        },
    )
    .unwrap()
}

/// Handler that counts invocations and returns a fixed value.
pub struct CountingHandler {
    pub counter: Arc<AtomicUsize>,
    pub result: serde_json::Value,
}

#[async_trait::async_trait]
impl FunctionHandler for CountingHandler {
    async fn call(&self, _params: serde_json::Value) -> Result<serde_json::Value> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

/// Handler that returns the next value from a fixed sequence on each call.
pub struct SequenceHandler {
    pub counter: Arc<AtomicUsize>,
    pub values: Vec<serde_json::Value>,
}

#[async_trait::async_trait]
impl FunctionHandler for SequenceHandler {
    async fn call(&self, _params: serde_json::Value) -> Result<serde_json::Value> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(self.values.get(index).cloned().unwrap_or(serde_json::Value::Null))
    }
}

/// Poll a condition until it holds or a bounded number of ticks elapse.
pub async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
