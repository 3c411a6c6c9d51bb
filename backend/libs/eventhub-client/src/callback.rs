//! Callback resolution for subscriptions
//!
//! The reference implementation loaded a Managed subscription's code from a
//! database text column and `exec`'d it into a fresh module namespace at
//! runtime. Executing stored code is not something this crate will do;
//! instead the host application registers named callbacks up front and
//! Managed subscriptions resolve to one by name.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EventHubError, EventHubResult};
use crate::models::Event;

/// A handler invoked once per delivered event.
///
/// `parameters` carries a Managed subscription's stored `parameters` column
/// (the original injected these as module-level attributes; here they're
/// passed explicitly instead of becoming ambient state).
#[async_trait]
pub trait EventCallback: Send + Sync {
    async fn call(
        &self,
        event: &Event,
        parameters: Option<&serde_json::Value>,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Adapts a plain async closure into an [`EventCallback`].
pub struct FnCallback<F> {
    f: F,
}

impl<F, Fut> FnCallback<F>
where
    F: Fn(&Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> EventCallback for FnCallback<F>
where
    F: Fn(&Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn call(
        &self,
        event: &Event,
        _parameters: Option<&serde_json::Value>,
    ) -> anyhow::Result<serde_json::Value> {
        (self.f)(event).await
    }
}

/// Host-populated registry mapping `event_processing_module.name` to a callback.
///
/// Auto-subscription of Managed event types (see the Subscriber
/// constructor) looks callbacks up here; a name with no entry is a
/// configuration error, logged and skipped rather than fatal.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Arc<dyn EventCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module_name: impl Into<String>, callback: Arc<dyn EventCallback>) {
        self.callbacks.insert(module_name.into(), callback);
    }

    pub fn get(&self, module_name: &str) -> EventHubResult<Arc<dyn EventCallback>> {
        self.callbacks
            .get(module_name)
            .cloned()
            .ok_or_else(|| EventHubError::ProcessingModule(module_name.to_string()))
    }

    pub fn contains(&self, module_name: &str) -> bool {
        self.callbacks.contains_key(module_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_callback_is_resolved_by_name() {
        let mut registry = CallbackRegistry::new();
        registry.register(
            "echo",
            Arc::new(FnCallback::new(|event: &Event| {
                let id = event.id;
                async move { Ok(serde_json::json!({ "id": id })) }
            })),
        );

        assert!(registry.contains("echo"));
        let callback = registry.get("echo").unwrap();
        let event = Event {
            id: 1,
            publisher: "p".into(),
            event_type: "t".into(),
            source: "host".into(),
            publish_time: chrono::Utc::now(),
            payload: None,
            active: true,
        };
        let result = callback.call(&event, None).await.unwrap();
        assert_eq!(result["id"], 1);
    }

    #[test]
    fn missing_module_is_an_error() {
        let registry = CallbackRegistry::new();
        assert!(registry.get("missing").is_err());
    }
}
