// Middleware and controller-preparation chains

use crate::catalog::{MiddlewareFactory, PLUGIN_CATALOG, PluginCatalog, PluginDefinition};
use crate::container::{DependencyDescriptor, Inject, Injectable, Service, ServiceKey, ServiceRegistry};
use crate::error::Error;
use crate::http::HttpRequest;
use crate::logging::{debug, error, trace};
use crate::response::{Response, ResponseSink};
use crate::service_key;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

service_key!(
    /// Interceptors run before controller resolution.
    pub MIDDLEWARE: MiddlewareChain = "trellis.middleware"
);

service_key!(
    /// Interceptors run between resolution and controller invocation.
    pub CONTROLLER_PREPARATION: PreparationChain = "trellis.controller_preparation"
);

/// What a single interceptor decided.
pub enum MiddlewareOutcome {
    /// Hand the request to the next interceptor
    Continue,
    /// Stop here and send this response
    Respond(Box<dyn Response>),
    /// Stop here; the interceptor already wrote to the sink
    Handled,
}

impl fmt::Debug for MiddlewareOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiddlewareOutcome::Continue => f.write_str("Continue"),
            MiddlewareOutcome::Respond(response) => f
                .debug_tuple("Respond")
                .field(&response.status_code())
                .finish(),
            MiddlewareOutcome::Handled => f.write_str("Handled"),
        }
    }
}

/// A request interceptor.
///
/// It may rewrite the request, write to the sink directly, or return a
/// response. Anything but [`MiddlewareOutcome::Continue`] ends the chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        request: &mut HttpRequest,
        sink: &mut dyn ResponseSink,
    ) -> Result<MiddlewareOutcome, Error>;
}

/// A synchronous closure used as [`Middleware`].
pub struct FnMiddleware<F> {
    func: F,
}

/// Wrap a closure as middleware.
///
/// ```
/// use trellis_core::middleware::{middleware_fn, MiddlewareOutcome};
/// use trellis_core::{EmptyResponse, ResponseExt};
///
/// let deny_admin = middleware_fn(|request, _sink| {
///     if request.path.starts_with("/admin") {
///         return Ok(MiddlewareOutcome::Respond(EmptyResponse::new(403).boxed()));
///     }
///     Ok(MiddlewareOutcome::Continue)
/// });
/// # let _ = deny_admin;
/// ```
pub fn middleware_fn<F>(func: F) -> FnMiddleware<F>
where
    F: Fn(&mut HttpRequest, &mut dyn ResponseSink) -> Result<MiddlewareOutcome, Error> + Send + Sync,
{
    FnMiddleware { func }
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut HttpRequest, &mut dyn ResponseSink) -> Result<MiddlewareOutcome, Error> + Send + Sync,
{
    async fn handle(
        &self,
        request: &mut HttpRequest,
        sink: &mut dyn ResponseSink,
    ) -> Result<MiddlewareOutcome, Error> {
        (self.func)(request, sink)
    }
}

/// How a whole chain ended.
pub enum ChainOutcome {
    /// Every interceptor continued
    Continue,
    Respond(Box<dyn Response>),
    Handled,
    /// An interceptor failed; the request must end with a 500
    Failed(Error),
}

impl ChainOutcome {
    pub fn is_continue(&self) -> bool {
        matches!(self, ChainOutcome::Continue)
    }
}

impl fmt::Debug for ChainOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainOutcome::Continue => f.write_str("Continue"),
            ChainOutcome::Respond(response) => f
                .debug_tuple("Respond")
                .field(&response.status_code())
                .finish(),
            ChainOutcome::Handled => f.write_str("Handled"),
            ChainOutcome::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

/// Build each interceptor from its factory, keeping registration order.
fn load(
    factories: &[PluginDefinition<MiddlewareFactory>],
    registry: &ServiceRegistry,
) -> Result<Vec<Arc<dyn Middleware>>, Error> {
    factories
        .iter()
        .map(|definition| (definition.factory)(registry))
        .collect()
}

/// Run interceptors strictly in order; the first one not continuing wins.
async fn run(
    chain: &'static str,
    interceptors: &[Arc<dyn Middleware>],
    request: &mut HttpRequest,
    sink: &mut dyn ResponseSink,
) -> ChainOutcome {
    for (index, interceptor) in interceptors.iter().enumerate() {
        trace!(chain, index, "Running interceptor");
        match interceptor.handle(request, sink).await {
            Ok(MiddlewareOutcome::Continue) => continue,
            Ok(MiddlewareOutcome::Respond(response)) => {
                debug!(chain, index, status = response.status_code(), "Interceptor responded");
                return ChainOutcome::Respond(response);
            }
            Ok(MiddlewareOutcome::Handled) => {
                debug!(chain, index, "Interceptor handled request");
                return ChainOutcome::Handled;
            }
            Err(err) => {
                error!(chain, index, error = %err, "Interceptor failed");
                return ChainOutcome::Failed(Error::Middleware(err.to_string()));
            }
        }
    }
    ChainOutcome::Continue
}

/// Interceptors run for every request before controller resolution.
#[derive(Default)]
pub struct MiddlewareChain {
    catalog: Inject<PluginCatalog>,
    interceptors: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn has_middleware(&self) -> bool {
        !self.interceptors.is_empty()
    }

    pub async fn run(&self, request: &mut HttpRequest, sink: &mut dyn ResponseSink) -> ChainOutcome {
        run("middleware", &self.interceptors, request, sink).await
    }
}

impl Injectable for MiddlewareChain {
    fn dependencies() -> DependencyDescriptor<Self> {
        DependencyDescriptor::<Self>::builder()
            .field("catalog", PLUGIN_CATALOG, |chain| &mut chain.catalog)
            .build()
    }

    fn on_resolved(&mut self, registry: &ServiceRegistry) -> Result<(), Error> {
        self.interceptors = load(self.catalog.middleware(), registry)?;
        debug!(count = self.interceptors.len(), "Middleware loaded");
        Ok(())
    }
}

impl Service for MiddlewareChain {
    type Contract = MiddlewareChain;
    const KEY: ServiceKey<MiddlewareChain> = MIDDLEWARE;

    fn into_contract(self: Arc<Self>) -> Arc<Self> {
        self
    }
}

/// Interceptors run once a controller is resolved, right before it is invoked.
#[derive(Default)]
pub struct PreparationChain {
    catalog: Inject<PluginCatalog>,
    interceptors: Vec<Arc<dyn Middleware>>,
}

impl PreparationChain {
    pub fn has_preparations(&self) -> bool {
        !self.interceptors.is_empty()
    }

    pub async fn run(&self, request: &mut HttpRequest, sink: &mut dyn ResponseSink) -> ChainOutcome {
        run("preparation", &self.interceptors, request, sink).await
    }
}

impl Injectable for PreparationChain {
    fn dependencies() -> DependencyDescriptor<Self> {
        DependencyDescriptor::<Self>::builder()
            .field("catalog", PLUGIN_CATALOG, |chain| &mut chain.catalog)
            .build()
    }

    fn on_resolved(&mut self, registry: &ServiceRegistry) -> Result<(), Error> {
        self.interceptors = load(self.catalog.preparations(), registry)?;
        debug!(count = self.interceptors.len(), "Controller preparations loaded");
        Ok(())
    }
}

impl Service for PreparationChain {
    type Contract = PreparationChain;
    const KEY: ServiceKey<PreparationChain> = CONTROLLER_PREPARATION;

    fn into_contract(self: Arc<Self>) -> Arc<Self> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Headers;
    use crate::response::tests::BufferSink;
    use crate::response::{EmptyResponse, ResponseExt};
    use parking_lot::Mutex;

    type CallLog = Arc<Mutex<Vec<&'static str>>>;

    fn factory<M: Middleware + 'static>(middleware: M) -> MiddlewareFactory {
        let middleware: Arc<dyn Middleware> = Arc::new(middleware);
        Arc::new(move |_: &ServiceRegistry| Ok(middleware.clone()))
    }

    fn recording(
        name: &'static str,
        log: &CallLog,
        outcome: fn(&mut dyn ResponseSink) -> Result<MiddlewareOutcome, Error>,
    ) -> MiddlewareFactory {
        let log = log.clone();
        factory(middleware_fn(move |_request, sink| {
            log.lock().push(name);
            outcome(sink)
        }))
    }

    fn chain_with(middleware: Vec<MiddlewareFactory>) -> Arc<MiddlewareChain> {
        let mut catalog = PluginCatalog::new();
        for factory in middleware {
            catalog.add_middleware(factory);
        }
        let registry = ServiceRegistry::new();
        registry.register_as(PLUGIN_CATALOG, Arc::new(catalog));
        registry.register_unresolved(MiddlewareChain::default());
        registry.get(MIDDLEWARE).unwrap()
    }

    #[tokio::test]
    async fn test_short_circuit_skips_remaining_middleware() {
        let log = CallLog::default();
        let chain = chain_with(vec![
            recording("m1", &log, |_| Ok(MiddlewareOutcome::Continue)),
            recording("m2", &log, |sink| {
                sink.write_head(202, &Headers::new())?;
                sink.finish();
                Ok(MiddlewareOutcome::Handled)
            }),
            recording("m3", &log, |_| Ok(MiddlewareOutcome::Continue)),
        ]);

        let mut request = HttpRequest::new("GET", "/");
        let mut sink = BufferSink::default();
        let outcome = chain.run(&mut request, &mut sink).await;

        assert!(matches!(outcome, ChainOutcome::Handled));
        assert_eq!(*log.lock(), vec!["m1", "m2"]);
        assert_eq!(sink.status, Some(202));
    }

    #[tokio::test]
    async fn test_respond_returns_the_response() {
        let log = CallLog::default();
        let chain = chain_with(vec![
            recording("deny", &log, |_| {
                Ok(MiddlewareOutcome::Respond(EmptyResponse::new(403).boxed()))
            }),
            recording("after", &log, |_| Ok(MiddlewareOutcome::Continue)),
        ]);

        let mut sink = BufferSink::default();
        let outcome = chain.run(&mut HttpRequest::new("GET", "/"), &mut sink).await;
        match outcome {
            ChainOutcome::Respond(response) => assert_eq!(response.status_code(), 403),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(*log.lock(), vec!["deny"]);
        // Sending is left to the caller
        assert_eq!(sink.status, None);
    }

    #[tokio::test]
    async fn test_failure_stops_the_chain() {
        let log = CallLog::default();
        let chain = chain_with(vec![
            recording("broken", &log, |_| Err(Error::Internal("boom".into()))),
            recording("after", &log, |_| Ok(MiddlewareOutcome::Continue)),
        ]);

        let outcome = chain
            .run(&mut HttpRequest::new("GET", "/"), &mut BufferSink::default())
            .await;
        assert!(matches!(outcome, ChainOutcome::Failed(Error::Middleware(ref msg)) if msg.contains("boom")));
        assert_eq!(*log.lock(), vec!["broken"]);
    }

    struct Tagging;

    #[async_trait]
    impl Middleware for Tagging {
        async fn handle(
            &self,
            request: &mut HttpRequest,
            _sink: &mut dyn ResponseSink,
        ) -> Result<MiddlewareOutcome, Error> {
            request.headers.insert("x-tagged".into(), "yes".into());
            Ok(MiddlewareOutcome::Continue)
        }
    }

    #[tokio::test]
    async fn test_middleware_may_rewrite_the_request() {
        let chain = chain_with(vec![factory(Tagging)]);
        assert!(chain.has_middleware());

        let mut request = HttpRequest::new("GET", "/");
        let outcome = chain.run(&mut request, &mut BufferSink::default()).await;
        assert!(outcome.is_continue());
        assert_eq!(request.header("X-Tagged"), Some("yes"));
    }

    #[tokio::test]
    async fn test_preparations_load_from_their_own_category() {
        let log = CallLog::default();
        let mut catalog = PluginCatalog::new();
        catalog.add_middleware(recording("middleware", &log, |_| Ok(MiddlewareOutcome::Continue)));
        catalog.add_preparation(recording("preparation", &log, |_| Ok(MiddlewareOutcome::Continue)));

        let registry = ServiceRegistry::new();
        registry.register_as(PLUGIN_CATALOG, Arc::new(catalog));
        registry.register_unresolved(PreparationChain::default());
        let preparations = registry.get(CONTROLLER_PREPARATION).unwrap();

        assert!(preparations.has_preparations());
        let outcome = preparations
            .run(&mut HttpRequest::new("GET", "/"), &mut BufferSink::default())
            .await;
        assert!(outcome.is_continue());
        assert_eq!(*log.lock(), vec!["preparation"]);
    }
}
