// Route matching and the route table

use crate::catalog::{PLUGIN_CATALOG, PluginCatalog};
use crate::container::{DependencyDescriptor, Inject, Injectable, ServiceRegistry};
use crate::controller::{ControllerHandle, ControllerType, RouteContext};
use crate::error::Error;
use crate::http::{HttpMethod, ParsedUrl};
use crate::logging::{debug, trace};
use crate::pipeline::ControllerResolver;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// Capture name to captured segment.
pub type RouteParams = HashMap<String, String>;

/// Outcome of matching request tokens against a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatch {
    NoMatch,
    /// Matched a pattern without captures
    Exact,
    Params(RouteParams),
}

impl RouteMatch {
    pub fn is_match(&self) -> bool {
        !matches!(self, RouteMatch::NoMatch)
    }

    /// Bound captures, `None` unless the pattern had at least one.
    pub fn into_params(self) -> Option<RouteParams> {
        match self {
            RouteMatch::Params(params) => Some(params),
            _ => None,
        }
    }
}

/// Split a path into its non-empty `/`-separated segments.
pub fn route_tokens(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Match request tokens against pattern tokens.
///
/// Segments starting with `:` capture the request segment under the rest of
/// their name; every other segment must be equal. Lengths must agree.
pub fn try_match_route<R, P>(request: &[R], pattern: &[P]) -> RouteMatch
where
    R: AsRef<str>,
    P: AsRef<str>,
{
    if request.len() != pattern.len() {
        return RouteMatch::NoMatch;
    }

    let mut params: Option<RouteParams> = None;
    for (segment, expected) in request.iter().zip(pattern) {
        let (segment, expected) = (segment.as_ref(), expected.as_ref());
        if let Some(name) = expected.strip_prefix(':') {
            params
                .get_or_insert_with(RouteParams::new)
                .insert(name.to_string(), segment.to_string());
        } else if segment != expected {
            return RouteMatch::NoMatch;
        }
    }

    match params {
        Some(params) => RouteMatch::Params(params),
        None => RouteMatch::Exact,
    }
}

/// Literal comparison of token lists; `:` has no special meaning.
pub fn try_match_exact_route<R, P>(request: &[R], pattern: &[P]) -> bool
where
    R: AsRef<str>,
    P: AsRef<str>,
{
    request.len() == pattern.len()
        && request
            .iter()
            .zip(pattern)
            .all(|(segment, expected)| segment.as_ref() == expected.as_ref())
}

/// How a route matches the request path.
#[derive(Debug, Clone)]
pub enum RoutePattern {
    /// Tokenised path, possibly with `:name` captures
    Tokens(Vec<String>),
    /// Tested against the whole decoded pathname
    Regex(Regex),
}

impl RoutePattern {
    pub fn path(path: &str) -> Self {
        RoutePattern::Tokens(route_tokens(path))
    }

    pub fn regex(pattern: &str) -> Result<Self, Error> {
        Regex::new(pattern)
            .map(RoutePattern::Regex)
            .map_err(|e| Error::InvalidRoute(format!("{pattern}: {e}")))
    }
}

/// Registration data for a route.
#[derive(Debug, Clone)]
pub struct RouteOptions {
    pub method: HttpMethod,
    pub pattern: RoutePattern,
}

impl RouteOptions {
    /// `method` is case-insensitive, `*` means any method and an empty
    /// string means GET.
    pub fn new(method: &str, path: &str) -> Result<Self, Error> {
        Ok(Self {
            method: method.parse()?,
            pattern: RoutePattern::path(path),
        })
    }

    pub fn regex(method: &str, pattern: &str) -> Result<Self, Error> {
        Ok(Self {
            method: method.parse()?,
            pattern: RoutePattern::regex(pattern)?,
        })
    }
}

struct TokenRoute {
    method: HttpMethod,
    tokens: Vec<String>,
    controller: ControllerType,
}

struct RegexRoute {
    method: HttpMethod,
    regex: Regex,
    controller: ControllerType,
}

/// Method-filtered routes, token routes before regex routes, each group in
/// registration order. The first match wins, so a catch-all registered early
/// shadows more specific routes registered after it.
#[derive(Default)]
pub struct RouteTable {
    catalog: Inject<PluginCatalog>,
    token_routes: Vec<TokenRoute>,
    regex_routes: Vec<RegexRoute>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, options: RouteOptions, controller: ControllerType) {
        match options.pattern {
            RoutePattern::Tokens(tokens) => self.token_routes.push(TokenRoute {
                method: options.method,
                tokens,
                controller,
            }),
            RoutePattern::Regex(regex) => self.regex_routes.push(RegexRoute {
                method: options.method,
                regex,
                controller,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.token_routes.len() + self.regex_routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Injectable for RouteTable {
    fn dependencies() -> DependencyDescriptor<Self> {
        DependencyDescriptor::<Self>::builder()
            .field("catalog", PLUGIN_CATALOG, |table| &mut table.catalog)
            .build()
    }

    fn on_resolved(&mut self, _registry: &ServiceRegistry) -> Result<(), Error> {
        let catalog = self.catalog.clone();
        for route in catalog.routes() {
            self.add_route(route.data.clone(), route.factory.clone());
        }
        debug!(
            token_routes = self.token_routes.len(),
            regex_routes = self.regex_routes.len(),
            "Route table loaded"
        );
        Ok(())
    }
}

impl ControllerResolver for RouteTable {
    fn try_resolve_controller(
        &self,
        registry: &Arc<ServiceRegistry>,
        method: &str,
        url: &ParsedUrl,
        tokens: &[String],
    ) -> Result<Option<ControllerHandle>, Error> {
        for route in self.token_routes.iter().filter(|r| r.method.matches(method)) {
            let matched = try_match_route(tokens, &route.tokens);
            if matched.is_match() {
                trace!(path = %url.pathname, route = ?route.tokens, "Token route matched");
                let context = RouteContext {
                    params: matched.into_params(),
                    query: url.query.clone(),
                };
                return route.controller.instantiate(registry, context).map(Some);
            }
        }

        for route in self.regex_routes.iter().filter(|r| r.method.matches(method)) {
            if route.regex.is_match(&url.pathname) {
                trace!(path = %url.pathname, route = %route.regex, "Regex route matched");
                let context = RouteContext {
                    params: None,
                    query: url.query.clone(),
                };
                return route.controller.instantiate(registry, context).map(Some);
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::tests::BufferSink;
    use crate::response::{ResponseExt, StringResponse};
    use crate::{DispatchContext, HttpRequest};

    fn tokens(path: &str) -> Vec<String> {
        route_tokens(path)
    }

    #[test]
    fn test_route_tokens_normalize_slashes() {
        assert_eq!(route_tokens("/users//42/"), vec!["users", "42"]);
        assert!(route_tokens("/").is_empty());
        assert!(route_tokens("").is_empty());
    }

    #[test]
    fn test_match_with_params() {
        let matched = try_match_route(&["users", "42"], &["users", ":id"]);
        assert_eq!(
            matched,
            RouteMatch::Params(RouteParams::from([("id".to_string(), "42".to_string())]))
        );
    }

    #[test]
    fn test_length_mismatch_is_no_match() {
        assert_eq!(try_match_route(&["users"], &["users", ":id"]), RouteMatch::NoMatch);
    }

    #[test]
    fn test_match_without_params() {
        let matched = try_match_route(&["a", "b"], &["a", "b"]);
        assert_eq!(matched, RouteMatch::Exact);
        assert!(matched.is_match());
        assert_eq!(matched.into_params(), None);
        assert_eq!(try_match_route::<&str, &str>(&[], &[]), RouteMatch::Exact);
    }

    #[test]
    fn test_literal_mismatch() {
        assert_eq!(try_match_route(&["a", "c"], &["a", "b"]), RouteMatch::NoMatch);
    }

    #[test]
    fn test_exact_route_ignores_captures() {
        assert!(try_match_exact_route(&["about"], &["about"]));
        assert!(!try_match_exact_route(&["about"], &[":page"]));
        assert!(!try_match_exact_route(&["a"], &["a", "b"]));
    }

    #[test]
    fn test_route_options() {
        let options = RouteOptions::new("post", "/users/:id").unwrap();
        assert_eq!(options.method, HttpMethod::POST);
        assert!(matches!(options.pattern, RoutePattern::Tokens(ref t) if t == &["users", ":id"]));

        assert_eq!(RouteOptions::new("*", "/").unwrap().method, HttpMethod::ANY);
        assert!(matches!(
            RouteOptions::new("FETCH", "/"),
            Err(Error::InvalidMethod(_))
        ));
        assert!(matches!(
            RouteOptions::regex("GET", "(unclosed"),
            Err(Error::InvalidRoute(_))
        ));
    }

    fn labelled(label: &'static str) -> ControllerType {
        ControllerType::function(move |ctx: DispatchContext, _req: HttpRequest| async move {
            let id = ctx.param("id").unwrap_or("-").to_string();
            Ok(StringResponse::new(format!("{label}:{id}")).boxed())
        })
    }

    async fn resolve_body(table: &RouteTable, method: &str, target: &str) -> Option<String> {
        let registry = Arc::new(ServiceRegistry::new());
        let url = ParsedUrl::parse(target).unwrap();
        let handle = table
            .try_resolve_controller(&registry, method, &url, &tokens(&url.pathname))
            .unwrap()?;
        let mut sink = BufferSink::default();
        handle
            .invoke(HttpRequest::new(method, target))
            .await
            .unwrap()
            .send(&mut sink)
            .await
            .unwrap();
        Some(sink.body_string())
    }

    #[tokio::test]
    async fn test_first_registered_route_wins() {
        let mut table = RouteTable::new();
        table.add_route(RouteOptions::new("GET", "/users/:id").unwrap(), labelled("by-id"));
        table.add_route(RouteOptions::new("GET", "/users/me").unwrap(), labelled("me"));

        // The capture registered first shadows the literal route
        assert_eq!(
            resolve_body(&table, "GET", "/users/me").await.as_deref(),
            Some("by-id:me")
        );
    }

    #[tokio::test]
    async fn test_method_filter_and_wildcard() {
        let mut table = RouteTable::new();
        table.add_route(RouteOptions::new("POST", "/items").unwrap(), labelled("create"));
        table.add_route(RouteOptions::new("*", "/items").unwrap(), labelled("any"));

        assert_eq!(resolve_body(&table, "POST", "/items").await.as_deref(), Some("create:-"));
        assert_eq!(resolve_body(&table, "GET", "/items").await.as_deref(), Some("any:-"));
    }

    #[tokio::test]
    async fn test_token_routes_before_regex_routes() {
        let mut table = RouteTable::new();
        table.add_route(RouteOptions::regex("GET", r"^/files/.*$").unwrap(), labelled("regex"));
        table.add_route(RouteOptions::new("GET", "/files/:id").unwrap(), labelled("token"));

        assert_eq!(
            resolve_body(&table, "GET", "/files/report").await.as_deref(),
            Some("token:report")
        );
        assert_eq!(
            resolve_body(&table, "GET", "/files/a/b%20c").await.as_deref(),
            Some("regex:-")
        );
        assert_eq!(resolve_body(&table, "GET", "/other").await, None);
        assert_eq!(table.len(), 2);
    }
}
