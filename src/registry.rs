//! Handler registration and lookup

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::args::{TypeDesc, TypedValue, Value};
use crate::error::TaskResult;

/// A registered task handler.
///
/// Handlers declare the types of their parameters; the worker coerces
/// each decoded argument to the declared type before calling `run`.
/// Returning `Err` marks the task FAILURE with the stringified error.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Declared parameter types, in order
    fn arg_types(&self) -> &[TypeDesc];

    /// Execute the handler with arguments already coerced to
    /// [`arg_types`](TaskHandler::arg_types)
    async fn run(&self, args: Vec<Value>) -> TaskResult<Vec<TypedValue>>;
}

/// Adapter turning an async closure into a [`TaskHandler`]
pub struct FnHandler<F> {
    arg_types: Vec<TypeDesc>,
    func: F,
}

impl<F> FnHandler<F> {
    /// Wrap a closure together with its declared parameter types
    pub fn new(arg_types: Vec<TypeDesc>, func: F) -> Self {
        Self { arg_types, func }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult<Vec<TypedValue>>> + Send,
{
    fn arg_types(&self) -> &[TypeDesc] {
        &self.arg_types
    }

    async fn run(&self, args: Vec<Value>) -> TaskResult<Vec<TypedValue>> {
        (self.func)(args).await
    }
}

/// Registry mapping handler names to handlers.
///
/// Populated before the worker starts consuming and only read afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name
    pub async fn register<H>(&self, name: &str, handler: H)
    where
        H: TaskHandler + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(name.to_string(), Arc::new(handler));
    }

    /// Look up a handler by name
    pub async fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.read().await;
        handlers.get(name).cloned()
    }

    /// Whether a handler is registered under the name
    pub async fn is_registered(&self, name: &str) -> bool {
        let handlers = self.handlers.read().await;
        handlers.contains_key(name)
    }

    /// Names of all registered handlers
    pub async fn names(&self) -> Vec<String> {
        let handlers = self.handlers.read().await;
        handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Kind;

    #[tokio::test]
    async fn registers_and_resolves_handlers() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                "add",
                FnHandler::new(
                    vec![TypeDesc::Scalar(Kind::Int64), TypeDesc::Scalar(Kind::Int64)],
                    |args: Vec<Value>| async move {
                        let sum = args[0].as_i64()? + args[1].as_i64()?;
                        Ok(vec![TypedValue::int64(sum)])
                    },
                ),
            )
            .await;

        assert!(registry.is_registered("add").await);
        assert!(!registry.is_registered("multiply").await);

        let handler = registry.get("add").await.unwrap();
        assert_eq!(handler.arg_types().len(), 2);
        let out = handler
            .run(vec![Value::Signed(1), Value::Signed(2)])
            .await
            .unwrap();
        assert_eq!(out, vec![TypedValue::int64(3)]);
    }
}
