// Mock utilities for testing

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use trellis_core::{Error, HttpRequest, Middleware, MiddlewareOutcome, ResponseSink};

/// Call recorder with an optional canned return value.
///
/// Clones share their state. As a [`Middleware`] it records
/// `"<METHOD> <path>"` for every request and lets it continue.
pub struct MockService<T> {
    calls: Arc<Mutex<Vec<String>>>,
    return_value: Arc<Mutex<Option<T>>>,
}

impl<T> MockService<T> {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            return_value: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_return(self, value: T) -> Self {
        *self.return_value.lock() = Some(value);
        self
    }

    pub fn record_call(&self, method: &str) {
        self.calls.lock().push(method.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn get_calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn was_called(&self, method: &str) -> bool {
        self.calls.lock().iter().any(|call| call == method)
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn get_return(&self) -> Option<T>
    where
        T: Clone,
    {
        self.return_value.lock().clone()
    }
}

impl<T> Clone for MockService<T> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
            return_value: Arc::clone(&self.return_value),
        }
    }
}

impl<T> Default for MockService<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Middleware for MockService<T> {
    async fn handle(
        &self,
        request: &mut HttpRequest,
        _sink: &mut dyn ResponseSink,
    ) -> Result<MiddlewareOutcome, Error> {
        self.record_call(&format!("{} {}", request.method, request.path));
        Ok(MiddlewareOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestClient;
    use trellis_core::{Application, ResponseExt, StringResponse};

    #[test]
    fn test_records_calls() {
        let mock = MockService::<String>::new().with_return("user".to_string());
        mock.record_call("get_user");
        mock.clone().record_call("get_user");

        assert_eq!(mock.call_count(), 2);
        assert!(mock.was_called("get_user"));
        assert!(!mock.was_called("delete_user"));
        assert_eq!(mock.get_return(), Some("user".to_string()));

        mock.clear_calls();
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_as_middleware() {
        let mock = MockService::<()>::new();
        let app = Application::builder()
            .no_default_controller()
            .middleware(mock.clone())
            .get("/", |_ctx, _req| async { Ok(StringResponse::new("home").boxed()) })
            .build()
            .unwrap();

        let client = TestClient::new(app);
        client.get("/").await;
        client.get("/missing?x=1").await;

        assert_eq!(mock.get_calls(), vec!["GET /", "GET /missing?x=1"]);
    }
}
