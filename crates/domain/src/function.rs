use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;

/// Host-side implementation of a model-invocable function.
///
/// Handlers run concurrently within one evocable group; they must be
/// abort-aware on their own if they do long work.
#[async_trait::async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, params: serde_json::Value) -> Result<serde_json::Value>;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;

/// Adapter so a plain closure can serve as a [`FunctionHandler`].
pub struct HandlerFn<F>(pub F);

#[async_trait::async_trait]
impl<F> FunctionHandler for HandlerFn<F>
where
    F: Fn(serde_json::Value) -> BoxedHandlerFuture + Send + Sync,
{
    async fn call(&self, params: serde_json::Value) -> Result<serde_json::Value> {
        (self.0)(params).await
    }
}

/// A function the model may invoke.
///
/// A definition with a handler is *evocable*: it resolves host-side within
/// the current request. One without a handler is surfaced to the caller
/// with an opaque call id and resolved in a follow-up request.
#[derive(Clone)]
pub struct FunctionDef {
    pub description: String,
    /// JSON Schema for the function's parameters.
    pub parameters: serde_json::Value,
    pub handler: Option<Arc<dyn FunctionHandler>>,
}

pub type FunctionMap = HashMap<String, FunctionDef>;

impl FunctionDef {
    pub fn new(description: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            description: description.into(),
            parameters,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn FunctionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn evocable(&self) -> bool {
        self.handler.is_some()
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .field("evocable", &self.evocable())
            .finish()
    }
}

/// Merge model-level and request-level definitions; request entries win
/// by name.
pub fn merge_functions(model: &FunctionMap, request: &FunctionMap) -> FunctionMap {
    let mut merged = model.clone();
    for (name, def) in request {
        merged.insert(name.clone(), def.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_functions_override_model_functions_by_name() {
        let mut model = FunctionMap::new();
        model.insert(
            "f".into(),
            FunctionDef::new("model-side", serde_json::json!({})),
        );
        model.insert(
            "g".into(),
            FunctionDef::new("stays", serde_json::json!({})),
        );
        let mut request = FunctionMap::new();
        request.insert(
            "f".into(),
            FunctionDef::new("request-side", serde_json::json!({})),
        );

        let merged = merge_functions(&model, &request);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["f"].description, "request-side");
        assert_eq!(merged["g"].description, "stays");
    }

    #[test]
    fn evocable_requires_handler() {
        struct Nop;
        #[async_trait::async_trait]
        impl FunctionHandler for Nop {
            async fn call(&self, _params: serde_json::Value) -> Result<serde_json::Value> {
                Ok(serde_json::Value::Null)
            }
        }

        let plain = FunctionDef::new("d", serde_json::json!({}));
        assert!(!plain.evocable());
        let with = plain.with_handler(Arc::new(Nop));
        assert!(with.evocable());
    }
}
