// Test assertions for dispatched responses

use crate::TestResponse;
use trellis_core::HttpStatus;

/// Assert that a response has a specific status code
pub fn assert_status(response: &TestResponse, expected: u16) {
    let actual = response.status();
    assert_eq!(
        actual, expected,
        "Expected status {}, got {}",
        expected, actual
    );
}

pub fn assert_http_status(response: &TestResponse, expected: HttpStatus) {
    assert_status(response, expected.code());
}

/// Assert that a response has a specific header
pub fn assert_header(response: &TestResponse, key: &str, expected: &str) {
    let actual = response.header(key);
    assert_eq!(
        actual,
        Some(expected),
        "Expected header '{}' to be '{}', got {:?}",
        key,
        expected,
        actual
    );
}

pub fn assert_body(response: &TestResponse, expected: &str) {
    assert_eq!(response.body_string(), expected, "Response bodies do not match");
}

/// Assert that a response body contains a string
pub fn assert_body_contains(response: &TestResponse, expected: &str) {
    let body = response.body_string();
    assert!(
        body.contains(expected),
        "Expected body to contain '{}', but it didn't. Body: {}",
        expected,
        body
    );
}

/// Assert that a response body contains JSON matching expected value
pub fn assert_json<T>(response: &TestResponse, expected: &T)
where
    T: serde::de::DeserializeOwned + PartialEq + std::fmt::Debug,
{
    let actual: T = response
        .body_json()
        .expect("Failed to deserialize response body");
    assert_eq!(actual, *expected, "JSON bodies do not match");
}

/// Assert that a response is successful (2xx status)
pub fn assert_success(response: &TestResponse) {
    let status = response.status();
    assert!(
        (200..300).contains(&status),
        "Expected successful status (2xx), got {}",
        status
    );
}

/// Assert that a response is a client error (4xx status)
pub fn assert_client_error(response: &TestResponse) {
    let status = response.status();
    assert!(
        (400..500).contains(&status),
        "Expected client error status (4xx), got {}",
        status
    );
}

/// Assert that a response is a server error (5xx status)
pub fn assert_server_error(response: &TestResponse) {
    let status = response.status();
    assert!(
        (500..600).contains(&status),
        "Expected server error status (5xx), got {}",
        status
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::Headers;

    fn response(status: u16, body: &str) -> TestResponse {
        let mut headers = Headers::new();
        headers.insert("Content-Type".into(), "application/json".into());
        TestResponse::new(Some(status), headers, body.as_bytes().to_vec(), true)
    }

    #[test]
    fn test_passing_assertions() {
        let ok = response(200, r#"{"status":"ok"}"#);
        assert_status(&ok, 200);
        assert_http_status(&ok, HttpStatus::Ok);
        assert_header(&ok, "content-type", "application/json");
        assert_body(&ok, r#"{"status":"ok"}"#);
        assert_body_contains(&ok, "ok");
        assert_json(&ok, &serde_json::json!({ "status": "ok" }));
        assert_success(&ok);

        assert_client_error(&response(404, ""));
        assert_server_error(&response(500, ""));
    }

    #[test]
    #[should_panic(expected = "Expected status 201, got 200")]
    fn test_status_mismatch_panics() {
        assert_status(&response(200, ""), 201);
    }
}
