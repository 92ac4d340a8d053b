// In-process test client

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use trellis_core::{Application, DispatchOutcome, Error, Headers, HttpRequest};

use crate::RecordingSink;

/// Drives requests through an [`Application`]'s dispatcher without a socket.
#[derive(Clone)]
pub struct TestClient {
    app: Application,
}

impl TestClient {
    pub fn new(app: Application) -> Self {
        Self { app }
    }

    pub fn app(&self) -> &Application {
        &self.app
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.send(TestRequest::new("GET", path)).await
    }

    pub async fn post(&self, path: &str, body: impl Into<Vec<u8>>) -> TestResponse {
        self.send(TestRequest::new("POST", path).body(body)).await
    }

    pub async fn put(&self, path: &str, body: impl Into<Vec<u8>>) -> TestResponse {
        self.send(TestRequest::new("PUT", path).body(body)).await
    }

    pub async fn patch(&self, path: &str, body: impl Into<Vec<u8>>) -> TestResponse {
        self.send(TestRequest::new("PATCH", path).body(body)).await
    }

    pub async fn delete(&self, path: &str) -> TestResponse {
        self.send(TestRequest::new("DELETE", path)).await
    }

    pub async fn send(&self, request: TestRequest) -> TestResponse {
        let mut sink = RecordingSink::new();
        let outcome = self.send_to(request, &mut sink).await;
        sink.into_response().with_outcome(outcome)
    }

    /// Dispatch into a caller-owned sink, e.g. to disconnect mid-stream.
    pub async fn send_to(&self, request: TestRequest, sink: &mut RecordingSink) -> DispatchOutcome {
        self.app.dispatch(request.build(), sink).await
    }
}

/// Builder for test requests
pub struct TestRequest {
    method: String,
    path: String,
    headers: Headers,
    body: Vec<u8>,
    query_params: Vec<(String, String)>,
}

impl TestRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
            query_params: Vec::new(),
        }
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn host(self, host: &str) -> Self {
        self.header("Host", host)
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T: serde::Serialize>(mut self, data: &T) -> Result<Self, Error> {
        self.body = serde_json::to_vec(data).map_err(|e| Error::Serialization(e.to_string()))?;
        self.headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        Ok(self)
    }

    /// Append a query parameter; values are sent as given.
    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query_params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn build(self) -> HttpRequest {
        let mut path = self.path;
        if !self.query_params.is_empty() {
            let params: Vec<String> = self
                .query_params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            path.push(if path.contains('?') { '&' } else { '?' });
            path.push_str(&params.join("&"));
        }

        let mut request = HttpRequest::new(self.method, path).with_body(self.body);
        request.headers = self.headers;
        request
    }
}

/// What a dispatched request wrote, plus how the dispatch ended.
#[derive(Debug)]
pub struct TestResponse {
    status: Option<u16>,
    headers: Headers,
    body: Vec<u8>,
    finished: bool,
    outcome: Option<DispatchOutcome>,
}

impl TestResponse {
    pub fn new(status: Option<u16>, headers: Headers, body: Vec<u8>, finished: bool) -> Self {
        Self {
            status,
            headers,
            body,
            finished,
            outcome: None,
        }
    }

    pub fn with_outcome(mut self, outcome: DispatchOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Status code, 0 when no head was written.
    pub fn status(&self) -> u16 {
        self.status.unwrap_or(0)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Case-insensitive header lookup
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Deserialization(e.to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn outcome(&self) -> Option<&DispatchOutcome> {
        self.outcome.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{JsonResponse, ResponseExt, StringResponse};

    fn echo(req: &HttpRequest) -> Result<Box<dyn trellis_core::Response>, Error> {
        let value: serde_json::Value = req.json()?;
        Ok(JsonResponse::new(&value)?.boxed())
    }

    fn app() -> Application {
        Application::builder()
            .no_default_controller()
            .get("/hello", |_ctx, _req| async {
                Ok(StringResponse::new("Hello!").boxed())
            })
            .post("/echo", |_ctx, req: HttpRequest| async move { echo(&req) })
            .get("/search", |ctx, _req| async move {
                let term = ctx.query.get("q").cloned().unwrap_or_default();
                Ok(StringResponse::new(term).boxed())
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_get() {
        let client = TestClient::new(app());
        let response = client.get("/hello").await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.body_string(), "Hello!");
        assert!(response.outcome().unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let client = TestClient::new(app());
        let request = TestRequest::new("POST", "/echo")
            .json(&serde_json::json!({ "users": ["Alice", "Bob"] }))
            .unwrap();
        let response = client.send(request).await;
        let json: serde_json::Value = response.body_json().unwrap();
        assert_eq!(json["users"][0], "Alice");
    }

    #[tokio::test]
    async fn test_query_builder() {
        let client = TestClient::new(app());
        let response = client
            .send(TestRequest::new("GET", "/search").query("q", "rust"))
            .await;
        assert_eq!(response.body_string(), "rust");
    }

    #[tokio::test]
    async fn test_unmatched_is_not_found() {
        let client = TestClient::new(app());
        let response = client.delete("/hello").await;
        assert_eq!(response.status(), 404);
        assert!(matches!(response.outcome(), Some(DispatchOutcome::NotFound)));
    }
}
