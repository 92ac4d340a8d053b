// Application bootstrap and the hyper HTTP/1 server

use crate::alias::{AliasResolver, AliasResolverChain};
use crate::catalog::{PLUGIN_CATALOG, PluginCatalog};
use crate::config::{ConfigProvider, StaticConfig, CONFIG};
use crate::container::{Injectable, Service, ServiceRegistry, validate_service_keys};
use crate::controller::{Controller, ControllerType, DispatchContext};
use crate::dispatcher::{DispatchOutcome, RequestDispatcher, WEB_SERVER};
use crate::error::Error;
use crate::http::{Headers, HttpRequest};
use crate::logging::{debug, error, info, warn};
use crate::middleware::{Middleware, MiddlewareChain, PreparationChain};
use crate::pipeline::{ControllerResolutionPipeline, ControllerResolver};
use crate::response::{Response, ResponseSink};
use crate::routing::{RouteOptions, RouteTable};
use crate::static_files::StaticFileController;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, LengthLimitError, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

/// Body chunks buffered between a response and the connection.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Priority of the built-in route table among controller resolvers.
pub const ROUTE_TABLE_PRIORITY: i32 = 0;

type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;
type ConfigRegistration = Box<dyn FnOnce(&ServiceRegistry) + Send>;

/// A bootstrapped application: the registry plus its request dispatcher.
#[derive(Clone)]
pub struct Application {
    registry: Arc<ServiceRegistry>,
    dispatcher: Arc<RequestDispatcher>,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    /// Dispatch one request in-process.
    pub async fn dispatch(&self, request: HttpRequest, sink: &mut dyn ResponseSink) -> DispatchOutcome {
        self.dispatcher.handle_request(&self.registry, request, sink).await
    }

    /// Bind `addr` and serve until the process exits.
    pub async fn listen(self, addr: impl ToSocketAddrs) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), Error> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve_with_shutdown(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let addr = listener.local_addr()?;
        info!(address = %addr, "Server listening");
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!(address = %addr, "Server shutting down");
                    return Ok(());
                }
            };
            self.spawn_connection(stream, peer);
        }
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let io = TokioIo::new(stream);
        let app = self.clone();

        tokio::spawn(async move {
            let service = service_fn(move |request: hyper::Request<Incoming>| {
                let app = app.clone();
                async move { Ok::<_, Infallible>(app.serve_request(request).await) }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(peer = %peer, error = %err, "Error serving connection");
            }
        });
    }

    async fn serve_request(&self, request: hyper::Request<Incoming>) -> hyper::Response<ResponseBody> {
        let limit = self.dispatcher.server_config().max_body_size();
        let request = match into_http_request(request, limit).await {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Rejected request body");
                return status_only(err.status_code());
            }
        };

        let (sink, head, body) = ChannelSink::new();
        let app = self.clone();
        // Own task, so a panicking controller only loses its head sender
        tokio::spawn(async move {
            let mut sink = sink;
            app.dispatch(request, &mut sink).await;
            sink.finish();
        });

        match head.await {
            Ok((status, headers)) => {
                let body = StreamBody::new(ReceiverStream::new(body)).boxed_unsync();
                build_response(status, &headers, body)
            }
            Err(_) => {
                error!("Request task ended without a response");
                status_only(500)
            }
        }
    }
}

async fn into_http_request(request: hyper::Request<Incoming>, limit: usize) -> Result<HttpRequest, Error> {
    let (parts, body) = request.into_parts();
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut http_request = HttpRequest::new(parts.method.as_str(), target);
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            http_request.headers.insert(name.to_string(), value.to_string());
        }
    }

    let collected = Limited::new(body, limit).collect().await.map_err(|err| {
        if err.downcast_ref::<LengthLimitError>().is_some() {
            Error::PayloadTooLarge(format!("request body exceeds {limit} bytes"))
        } else {
            Error::BadRequest(err.to_string())
        }
    })?;
    http_request.body = collected.to_bytes().to_vec();
    Ok(http_request)
}

fn build_response(status: u16, headers: &Headers, body: ResponseBody) -> hyper::Response<ResponseBody> {
    let mut builder = hyper::Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(body).unwrap_or_else(|err| {
        error!(error = %err, "Invalid response head");
        status_only(500)
    })
}

fn status_only(status: u16) -> hyper::Response<ResponseBody> {
    let mut response = hyper::Response::new(Empty::<Bytes>::new().boxed_unsync());
    *response.status_mut() =
        hyper::StatusCode::from_u16(status).unwrap_or(hyper::StatusCode::INTERNAL_SERVER_ERROR);
    response
}

type BodyFrame = Result<Frame<Bytes>, Infallible>;

/// Connects a dispatched request to its hyper response.
///
/// The head goes through a oneshot channel, body chunks through a bounded
/// channel the response body streams from.
pub struct ChannelSink {
    head: Option<oneshot::Sender<(u16, Headers)>>,
    body: Option<mpsc::Sender<BodyFrame>>,
}

impl ChannelSink {
    fn new() -> (Self, oneshot::Receiver<(u16, Headers)>, mpsc::Receiver<BodyFrame>) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let sink = Self {
            head: Some(head_tx),
            body: Some(body_tx),
        };
        (sink, head_rx, body_rx)
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    fn head_written(&self) -> bool {
        self.head.is_none()
    }

    fn write_head(&mut self, status: u16, headers: &Headers) -> Result<(), Error> {
        let head = self
            .head
            .take()
            .ok_or_else(|| Error::Send("response head already written".to_string()))?;
        head.send((status, headers.clone()))
            .map_err(|_| Error::Send("client disconnected".to_string()))
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), Error> {
        if !self.head_written() {
            return Err(Error::Send("body written before head".to_string()));
        }
        let body = self
            .body
            .as_ref()
            .ok_or_else(|| Error::Send("response already finished".to_string()))?;
        body.send(Ok(Frame::data(chunk)))
            .await
            .map_err(|_| Error::Send("client disconnected".to_string()))
    }

    fn finish(&mut self) {
        // Ending without a head still answers the client
        if !self.head_written() && self.write_head(200, &Headers::new()).is_err() {
            debug!("Client gone before response head");
        }
        self.body = None;
    }

    fn is_finished(&self) -> bool {
        self.body.is_none()
    }

    async fn closed(&self) {
        if let Some(body) = &self.body {
            body.closed().await;
        }
    }
}

/// Explicit registration API, consumed by [`ApplicationBuilder::build`].
///
/// The route table is installed as the first controller resolver and the
/// static file controller as the default controller.
pub struct ApplicationBuilder {
    catalog: PluginCatalog,
    config: Option<ConfigRegistration>,
    force_resolve: bool,
    errors: Vec<Error>,
}

impl Default for ApplicationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationBuilder {
    pub fn new() -> Self {
        let mut catalog = PluginCatalog::new();
        catalog.add_controller_resolver(
            ROUTE_TABLE_PRIORITY,
            Arc::new(|registry: &ServiceRegistry| {
                Ok(Arc::new(registry.create(RouteTable::new())?) as Arc<dyn ControllerResolver>)
            }),
        );
        catalog.set_default_controller(Some(ControllerType::instance::<StaticFileController>()));
        Self {
            catalog,
            config: None,
            force_resolve: true,
            errors: Vec::new(),
        }
    }

    /// Register a service, built unresolved at bootstrap.
    ///
    /// Registering under a built-in key replaces that built-in.
    pub fn service<S, F>(mut self, factory: F) -> Self
    where
        S: Service,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.catalog.add_service(factory);
        self
    }

    pub fn route(mut self, method: &str, path: &str, controller: ControllerType) -> Self {
        match RouteOptions::new(method, path) {
            Ok(options) => self.catalog.add_route(options, controller),
            Err(err) => self.errors.push(err),
        }
        self
    }

    /// A route tested against the whole decoded pathname.
    pub fn route_regex(mut self, method: &str, pattern: &str, controller: ControllerType) -> Self {
        match RouteOptions::regex(method, pattern) {
            Ok(options) => self.catalog.add_route(options, controller),
            Err(err) => self.errors.push(err),
        }
        self
    }

    /// A stateful controller type, created through the registry per request.
    pub fn controller<C>(self, method: &str, path: &str) -> Self
    where
        C: Controller + Injectable + Default,
    {
        self.route(method, path, ControllerType::instance::<C>())
    }

    pub fn get<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(DispatchContext, HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Response>, Error>> + Send + 'static,
    {
        self.route("GET", path, ControllerType::function(handler))
    }

    pub fn post<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(DispatchContext, HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Response>, Error>> + Send + 'static,
    {
        self.route("POST", path, ControllerType::function(handler))
    }

    pub fn put<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(DispatchContext, HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Response>, Error>> + Send + 'static,
    {
        self.route("PUT", path, ControllerType::function(handler))
    }

    pub fn patch<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(DispatchContext, HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Response>, Error>> + Send + 'static,
    {
        self.route("PATCH", path, ControllerType::function(handler))
    }

    pub fn delete<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(DispatchContext, HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Response>, Error>> + Send + 'static,
    {
        self.route("DELETE", path, ControllerType::function(handler))
    }

    /// Route matching every method.
    pub fn any<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(DispatchContext, HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Response>, Error>> + Send + 'static,
    {
        self.route("*", path, ControllerType::function(handler))
    }

    /// Add a controller resolver; lower priorities are asked first and the
    /// route table sits at [`ROUTE_TABLE_PRIORITY`].
    pub fn controller_resolver<R>(mut self, priority: i32, resolver: R) -> Self
    where
        R: ControllerResolver + 'static,
    {
        let resolver: Arc<dyn ControllerResolver> = Arc::new(resolver);
        self.catalog
            .add_controller_resolver(priority, Arc::new(move |_: &ServiceRegistry| Ok(resolver.clone())));
        self
    }

    /// A controller resolver with dependencies, created at bootstrap.
    pub fn injected_controller_resolver<R>(mut self, priority: i32) -> Self
    where
        R: ControllerResolver + Injectable + Default,
    {
        self.catalog.add_controller_resolver(
            priority,
            Arc::new(|registry: &ServiceRegistry| {
                Ok(Arc::new(registry.create(R::default())?) as Arc<dyn ControllerResolver>)
            }),
        );
        self
    }

    pub fn alias_resolver<A>(mut self, resolver: A) -> Self
    where
        A: AliasResolver + 'static,
    {
        let resolver: Arc<dyn AliasResolver> = Arc::new(resolver);
        self.catalog
            .add_alias_resolver(Arc::new(move |_: &ServiceRegistry| Ok(resolver.clone())));
        self
    }

    pub fn injected_alias_resolver<A>(mut self) -> Self
    where
        A: AliasResolver + Injectable + Default,
    {
        self.catalog.add_alias_resolver(Arc::new(|registry: &ServiceRegistry| {
            Ok(Arc::new(registry.create(A::default())?) as Arc<dyn AliasResolver>)
        }));
        self
    }

    pub fn middleware<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        let middleware: Arc<dyn Middleware> = Arc::new(middleware);
        self.catalog
            .add_middleware(Arc::new(move |_: &ServiceRegistry| Ok(middleware.clone())));
        self
    }

    pub fn injected_middleware<M>(mut self) -> Self
    where
        M: Middleware + Injectable + Default,
    {
        self.catalog.add_middleware(Arc::new(|registry: &ServiceRegistry| {
            Ok(Arc::new(registry.create(M::default())?) as Arc<dyn Middleware>)
        }));
        self
    }

    /// Interceptor run after resolution, right before the controller.
    pub fn preparation<M>(mut self, preparation: M) -> Self
    where
        M: Middleware + 'static,
    {
        let preparation: Arc<dyn Middleware> = Arc::new(preparation);
        self.catalog
            .add_preparation(Arc::new(move |_: &ServiceRegistry| Ok(preparation.clone())));
        self
    }

    /// Handle every URL no resolver or alias claims.
    pub fn default_controller(mut self, controller: ControllerType) -> Self {
        self.catalog.set_default_controller(Some(controller));
        self
    }

    /// Answer unclaimed URLs with 404 instead of serving static files.
    pub fn no_default_controller(mut self) -> Self {
        self.catalog.set_default_controller(None);
        self
    }

    /// Use `provider` for configuration instead of an empty [`StaticConfig`].
    pub fn config<S>(mut self, provider: S) -> Self
    where
        S: Service<Contract = dyn ConfigProvider>,
    {
        self.config = Some(Box::new(move |registry: &ServiceRegistry| {
            registry.register_unresolved(provider)
        }));
        self
    }

    /// Resolve every service during [`build`](Self::build) instead of on
    /// first lookup. On by default.
    pub fn force_resolve(mut self, force: bool) -> Self {
        self.force_resolve = force;
        self
    }

    /// Bootstrap the registry and resolve the request dispatcher.
    pub fn build(self) -> Result<Application, Error> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        validate_service_keys()?;

        let registry = Arc::new(ServiceRegistry::new());
        let catalog = Arc::new(self.catalog);
        registry.register_as(PLUGIN_CATALOG, catalog.clone());

        match self.config {
            Some(register) => register(&registry),
            None => registry.register_unresolved(StaticConfig::new()),
        }
        registry.register_unresolved(AliasResolverChain::default());
        registry.register_unresolved(ControllerResolutionPipeline::default());
        registry.register_unresolved(MiddlewareChain::default());
        registry.register_unresolved(PreparationChain::default());
        registry.register_unresolved(RequestDispatcher::default());

        for definition in catalog.services() {
            (definition.factory)(&registry);
        }

        if self.force_resolve {
            registry.resolve_all()?;
        }
        let dispatcher = registry.get(WEB_SERVER)?;
        let debug_enabled = registry.get(CONFIG)?.global().debug;
        info!(
            services = registry.keys().len(),
            routes = catalog.routes().len(),
            debug = debug_enabled,
            "Application bootstrapped"
        );

        Ok(Application {
            registry,
            dispatcher,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::AliasMap;
    use crate::container::{DependencyDescriptor, Inject, ServiceKey};
    use crate::middleware::{MiddlewareOutcome, middleware_fn};
    use crate::response::tests::BufferSink;
    use crate::response::{EmptyResponse, ResponseExt, StringResponse};
    use crate::service_key;
    use serde_json::json;

    pub trait Greeting: Send + Sync {
        fn greet(&self, name: &str) -> String;
    }

    service_key!(GREETING: dyn Greeting = "tests.application.greeting");

    struct Polite;

    impl Greeting for Polite {
        fn greet(&self, name: &str) -> String {
            format!("Good day, {name}")
        }
    }

    impl Injectable for Polite {}

    impl Service for Polite {
        type Contract = dyn Greeting;
        const KEY: ServiceKey<dyn Greeting> = GREETING;

        fn into_contract(self: Arc<Self>) -> Arc<dyn Greeting> {
            self
        }
    }

    #[derive(Default)]
    struct GreetController {
        greeting: Inject<dyn Greeting>,
        name: String,
    }

    impl Injectable for GreetController {
        fn dependencies() -> DependencyDescriptor<Self> {
            DependencyDescriptor::<Self>::builder()
                .field("greeting", GREETING, |c| &mut c.greeting)
                .build()
        }
    }

    #[async_trait]
    impl Controller for GreetController {
        async fn handle(&self, _request: &HttpRequest) -> Result<Box<dyn Response>, Error> {
            Ok(StringResponse::new(self.greeting.greet(&self.name)).boxed())
        }

        fn bind(&mut self, route: crate::controller::RouteContext) {
            self.name = route
                .params
                .and_then(|mut params| params.remove("name"))
                .unwrap_or_default();
        }
    }

    async fn run(app: &Application, request: HttpRequest) -> (DispatchOutcome, BufferSink) {
        let mut sink = BufferSink::default();
        let outcome = app.dispatch(request, &mut sink).await;
        (outcome, sink)
    }

    #[tokio::test]
    async fn test_instance_controller_receives_injected_service() {
        let app = Application::builder()
            .service(|| Polite)
            .controller::<GreetController>("GET", "/greet/:name")
            .build()
            .unwrap();

        let (outcome, sink) = run(&app, HttpRequest::new("GET", "/greet/Ada")).await;
        assert!(outcome.is_completed());
        assert_eq!(sink.body_string(), "Good day, Ada");
    }

    #[tokio::test]
    async fn test_function_routes_and_aliases() {
        let app = Application::builder()
            .get("/items/:id", |ctx: DispatchContext, _req: HttpRequest| async move {
                Ok(StringResponse::new(format!("item {}", ctx.param("id").unwrap_or("?"))).boxed())
            })
            .post("/items", |_ctx: DispatchContext, req: HttpRequest| async move {
                Ok(StringResponse::new(String::from_utf8_lossy(&req.body).into_owned())
                    .with_status(201)
                    .boxed())
            })
            .alias_resolver(AliasMap::new().alias("/latest", "/items/99"))
            .no_default_controller()
            .build()
            .unwrap();

        let (_, sink) = run(&app, HttpRequest::new("GET", "/items/7")).await;
        assert_eq!(sink.body_string(), "item 7");

        let (_, sink) = run(&app, HttpRequest::new("POST", "/items").with_body("new")).await;
        assert_eq!(sink.status, Some(201));
        assert_eq!(sink.body_string(), "new");

        let (_, sink) = run(&app, HttpRequest::new("GET", "/latest")).await;
        assert_eq!(sink.body_string(), "item 99");

        let (outcome, sink) = run(&app, HttpRequest::new("DELETE", "/items/7")).await;
        assert!(matches!(outcome, DispatchOutcome::NotFound));
        assert_eq!(sink.status, Some(404));
    }

    #[tokio::test]
    async fn test_custom_default_controller() {
        let app = Application::builder()
            .default_controller(ControllerType::function(|_ctx, req: HttpRequest| async move {
                Ok(StringResponse::new(format!("fallback for {}", req.path)).boxed())
            }))
            .build()
            .unwrap();

        let (outcome, sink) = run(&app, HttpRequest::new("GET", "/anything")).await;
        assert!(outcome.is_completed());
        assert_eq!(sink.body_string(), "fallback for /anything");
    }

    #[tokio::test]
    async fn test_config_drives_trusted_hosts() {
        let app = Application::builder()
            .config(StaticConfig::new().with_section("server", json!({ "trustedHosts": ["a.example"] })))
            .middleware(middleware_fn(|_req, _sink| {
                Ok(MiddlewareOutcome::Respond(EmptyResponse::new(204).boxed()))
            }))
            .build()
            .unwrap();

        let (outcome, sink) = run(&app, HttpRequest::new("GET", "/").with_header("host", "b.example")).await;
        assert!(outcome.is_failed());
        assert_eq!(sink.status, Some(500));

        let (outcome, sink) = run(&app, HttpRequest::new("GET", "/").with_header("host", "a.example")).await;
        assert!(matches!(outcome, DispatchOutcome::ShortCircuited));
        assert_eq!(sink.status, Some(204));
    }

    #[test]
    fn test_invalid_registration_fails_build() {
        let result = Application::builder()
            .route("FETCH", "/", ControllerType::instance::<StaticFileController>())
            .build();
        assert!(matches!(result, Err(Error::InvalidMethod(_))));

        let result = Application::builder()
            .route_regex("GET", "([", ControllerType::instance::<StaticFileController>())
            .build();
        assert!(matches!(result, Err(Error::InvalidRoute(_))));
    }

    #[test]
    fn test_lazy_bootstrap_still_resolves_dispatcher() {
        let app = Application::builder().force_resolve(false).build().unwrap();
        assert!(app.registry().is_resolved(WEB_SERVER));
        assert!(!app.registry().contains(GREETING));
    }

    #[tokio::test]
    async fn test_channel_sink_streams_head_then_body() {
        let (mut sink, head, mut body) = ChannelSink::new();
        sink.write_head(201, &Headers::from([("X-Id".to_string(), "1".to_string())]))
            .unwrap();
        sink.write(Bytes::from_static(b"hello")).await.unwrap();
        sink.finish();
        assert!(sink.is_finished());

        let (status, headers) = head.await.unwrap();
        assert_eq!(status, 201);
        assert_eq!(headers.get("X-Id").map(String::as_str), Some("1"));
        let frame = body.recv().await.unwrap().unwrap();
        assert_eq!(frame.into_data().ok(), Some(Bytes::from_static(b"hello")));
        assert!(body.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_sink_finish_without_head_answers_200() {
        let (mut sink, head, _body) = ChannelSink::new();
        sink.finish();
        assert_eq!(head.await.unwrap().0, 200);
        sink.closed().await;
    }
}
