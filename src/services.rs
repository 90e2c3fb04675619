//! In-process service registry: named request/response handlers with a
//! bounded wait. The production deployment can substitute a networked
//! transport behind the same `register`/`call` seam.

use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt::Display;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

pub type ServiceResult = Result<Value, ServiceError>;
pub type ServiceHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ServiceResult> + Send + Sync>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("no service registered under '{0}'")]
    NotFound(String),
    #[error("service '{0}' timed out after {1:?}")]
    Timeout(String, Duration),
    #[error("service '{service}' failed: {message}")]
    Handler { service: String, message: String },
    #[error("bad payload for service '{service}': {message}")]
    BadPayload { service: String, message: String },
}

impl ServiceError {
    pub fn handler(service: &str, message: impl Display) -> ServiceError {
        ServiceError::Handler {
            service: service.to_string(),
            message: message.to_string(),
        }
    }

    pub fn bad_payload(service: &str, message: impl Display) -> ServiceError {
        ServiceError::BadPayload {
            service: service.to_string(),
            message: message.to_string(),
        }
    }
}

pub struct ServiceRegistry {
    handlers: RwLock<ahash::AHashMap<String, ServiceHandler>>,
    default_timeout: Duration,
}

impl ServiceRegistry {
    pub fn new(default_timeout: Duration) -> Arc<ServiceRegistry> {
        Arc::new(ServiceRegistry {
            handlers: RwLock::new(ahash::AHashMap::new()),
            default_timeout,
        })
    }

    /// Registers a handler under a name. A second registration under the
    /// same name replaces the first.
    pub fn register(&self, name: &str, handler: ServiceHandler) {
        self.handlers
            .write()
            .unwrap()
            .insert(name.to_string(), handler);
    }

    pub async fn call(&self, name: &str, payload: Value) -> ServiceResult {
        self.call_with_timeout(name, payload, self.default_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        name: &str,
        payload: Value,
        timeout: Duration,
    ) -> ServiceResult {
        let handler = {
            let guard = self.handlers.read().unwrap();
            guard.get(name).cloned()
        };
        let handler = handler.ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

        match tokio::time::timeout(timeout, handler(payload)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(name.to_string(), timeout)),
        }
    }
}
