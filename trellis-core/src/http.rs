// HTTP request types, method set and URL parsing

use crate::error::Error;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Header map; names keep the casing they arrived with and are looked up
/// case-insensitively through [`HttpRequest::header`].
pub type Headers = HashMap<String, String>;

/// Decoded query string parameters; a repeated key keeps its last value.
pub type QueryParams = HashMap<String, String>;

/// HTTP request wrapper
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    /// Raw request target: path plus optional query string
    pub path: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub path_params: HashMap<String, String>,
    pub query_params: QueryParams,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            headers: HashMap::new(),
            body: Vec::new(),
            path_params: HashMap::new(),
            query_params: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The `Host` header, if present
    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// Parse the request body as JSON
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Get a path parameter by name
    pub fn param(&self, name: &str) -> Option<&String> {
        self.path_params.get(name)
    }

    /// Get a query parameter by name
    pub fn query(&self, name: &str) -> Option<&String> {
        self.query_params.get(name)
    }
}

/// HTTP methods accepted at route registration.
///
/// `ANY` is the wildcard marker; it matches every request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
    HEAD,
    OPTIONS,
    ANY,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::HEAD => "HEAD",
            HttpMethod::OPTIONS => "OPTIONS",
            HttpMethod::ANY => "*",
        }
    }

    /// Whether a route registered for `self` accepts a request `method`.
    pub fn matches(&self, method: &str) -> bool {
        *self == HttpMethod::ANY || self.as_str().eq_ignore_ascii_case(method)
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    /// Case-insensitive; `*` and `ANY` select the wildcard and an empty
    /// string defaults to GET.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "GET" => Ok(HttpMethod::GET),
            "POST" => Ok(HttpMethod::POST),
            "PUT" => Ok(HttpMethod::PUT),
            "PATCH" => Ok(HttpMethod::PATCH),
            "DELETE" => Ok(HttpMethod::DELETE),
            "HEAD" => Ok(HttpMethod::HEAD),
            "OPTIONS" => Ok(HttpMethod::OPTIONS),
            "*" | "ANY" => Ok(HttpMethod::ANY),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request URL split into its decoded pathname and query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    /// Percent-decoded path, always starting with `/`
    pub pathname: String,
    pub query: QueryParams,
    /// Raw query string without the leading `?`
    pub search: Option<String>,
}

impl ParsedUrl {
    /// Parse a request target such as `/users/j%C3%B6rg?tab=posts`.
    ///
    /// Fragments are discarded. Fails with `BadRequest` when the path is not
    /// valid percent-encoded UTF-8 or the query string is malformed.
    pub fn parse(target: &str) -> Result<Self, Error> {
        let target = target.split('#').next().unwrap_or_default();
        let (raw_path, search) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (target, None),
        };

        let decoded = urlencoding::decode(raw_path)
            .map_err(|e| Error::BadRequest(format!("malformed path '{raw_path}': {e}")))?;
        let pathname = if decoded.starts_with('/') {
            decoded.into_owned()
        } else {
            format!("/{decoded}")
        };

        let query = match &search {
            Some(raw) if !raw.is_empty() => serde_urlencoded::from_str::<Vec<(String, String)>>(raw)
                .map_err(|e| Error::BadRequest(format!("malformed query string: {e}")))?
                .into_iter()
                .collect(),
            _ => QueryParams::new(),
        };

        Ok(Self {
            pathname,
            query,
            search,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_lookup_is_case_insensitive() {
        let req = HttpRequest::new("get", "/").with_header("Host", "a.example");
        assert_eq!(req.method, "GET");
        assert_eq!(req.host(), Some("a.example"));
        assert_eq!(req.header("HOST"), Some("a.example"));
        assert_eq!(req.header("accept"), None);
    }

    #[test]
    fn test_request_json_body() {
        #[derive(Deserialize)]
        struct Login {
            user: String,
        }

        let req = HttpRequest::new("POST", "/login").with_body(r#"{"user":"ada"}"#);
        let login: Login = req.json().unwrap();
        assert_eq!(login.user, "ada");

        let bad = HttpRequest::new("POST", "/login").with_body("nope");
        assert!(matches!(bad.json::<Login>(), Err(Error::Deserialization(_))));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::GET);
        assert_eq!("Patch".parse::<HttpMethod>().unwrap(), HttpMethod::PATCH);
        assert_eq!("*".parse::<HttpMethod>().unwrap(), HttpMethod::ANY);
        assert_eq!("".parse::<HttpMethod>().unwrap(), HttpMethod::GET);
        assert!(matches!(
            "BREW".parse::<HttpMethod>(),
            Err(Error::InvalidMethod(_))
        ));
    }

    #[test]
    fn test_method_matching() {
        assert!(HttpMethod::GET.matches("GET"));
        assert!(HttpMethod::GET.matches("get"));
        assert!(!HttpMethod::GET.matches("POST"));
        assert!(HttpMethod::ANY.matches("DELETE"));
    }

    #[test]
    fn test_parse_url_decodes_path_and_query() {
        let url = ParsedUrl::parse("/users/j%C3%B6rg?tab=posts&q=a%20b#top").unwrap();
        assert_eq!(url.pathname, "/users/jörg");
        assert_eq!(url.query.get("tab").map(String::as_str), Some("posts"));
        assert_eq!(url.query.get("q").map(String::as_str), Some("a b"));
        assert_eq!(url.search.as_deref(), Some("tab=posts&q=a%20b"));
    }

    #[test]
    fn test_parse_url_without_query() {
        let url = ParsedUrl::parse("").unwrap();
        assert_eq!(url.pathname, "/");
        assert!(url.query.is_empty());
        assert_eq!(url.search, None);

        let trailing = ParsedUrl::parse("/a?").unwrap();
        assert_eq!(trailing.pathname, "/a");
        assert!(trailing.query.is_empty());
    }

    #[test]
    fn test_parse_url_rejects_invalid_utf8() {
        assert!(matches!(
            ParsedUrl::parse("/%FF%FE"),
            Err(Error::BadRequest(_))
        ));
    }
}
