// Per-request orchestration: host check, middleware, resolution, invocation, send

use crate::config::{CONFIG, ConfigProvider, ServerConfig};
use crate::container::{DependencyDescriptor, Inject, Injectable, Service, ServiceKey, ServiceRegistry};
use crate::error::Error;
use crate::http::{Headers, HttpRequest};
use crate::logging::{debug, error, info, warn};
use crate::middleware::{
    CONTROLLER_PREPARATION, ChainOutcome, MIDDLEWARE, MiddlewareChain, PreparationChain,
};
use crate::pipeline::{CONTROLLER_RESOLVER, ControllerResolutionPipeline};
use crate::response::{Response, ResponseExt, ResponseSink, StringResponse};
use crate::service_key;
use std::sync::Arc;
use tracing::{Instrument, info_span};
use uuid::Uuid;

service_key!(
    /// The request dispatcher behind the HTTP server.
    pub WEB_SERVER: RequestDispatcher = "trellis.web_server"
);

/// Terminal state of one dispatched request.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A controller ran and its response was sent
    Completed,
    /// Middleware or a preparation ended the request
    ShortCircuited,
    /// Nothing resolved; a 404 was sent
    NotFound,
    /// The request ended with an error status
    Failed(Error),
}

impl DispatchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, DispatchOutcome::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DispatchOutcome::Failed(_))
    }
}

/// Runs a request through host check, middleware, controller resolution,
/// preparations, invocation and sending.
///
/// Every failure stays inside its request: it is logged, turned into an
/// error status on the sink and reported as [`DispatchOutcome::Failed`].
#[derive(Default)]
pub struct RequestDispatcher {
    resolver: Inject<ControllerResolutionPipeline>,
    middleware: Inject<MiddlewareChain>,
    preparations: Inject<PreparationChain>,
    config: Inject<dyn ConfigProvider>,
    server: ServerConfig,
}

impl RequestDispatcher {
    pub fn server_config(&self) -> &ServerConfig {
        &self.server
    }

    /// Dispatch one request inside a span carrying a fresh request id.
    pub async fn handle_request(
        &self,
        registry: &Arc<ServiceRegistry>,
        request: HttpRequest,
        sink: &mut dyn ResponseSink,
    ) -> DispatchOutcome {
        let span = info_span!(
            "request",
            request_id = %Uuid::new_v4(),
            method = %request.method,
            path = %request.path,
        );
        self.dispatch(registry, request, sink).instrument(span).await
    }

    async fn dispatch(
        &self,
        registry: &Arc<ServiceRegistry>,
        mut request: HttpRequest,
        sink: &mut dyn ResponseSink,
    ) -> DispatchOutcome {
        if !self.server.is_trusted_host(request.host()) {
            let host = request.host().unwrap_or_default().to_string();
            warn!(host = %host, "Untrusted host");
            abort(sink, 500);
            return DispatchOutcome::Failed(Error::UntrustedHost(host));
        }

        if let Some(outcome) = finish_chain(self.middleware.run(&mut request, sink).await, sink).await {
            return outcome;
        }

        let handle = match self
            .resolver
            .try_resolve_controller(registry, &request.method, &request.path)
        {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                info!("Route not found");
                let not_found = StringResponse::new("Not Found").with_status(404).boxed();
                return match send(not_found, sink).await {
                    Ok(()) => DispatchOutcome::NotFound,
                    Err(err) => DispatchOutcome::Failed(err),
                };
            }
            Err(err) => {
                error!(error = %err, "Controller resolution failed");
                abort(sink, err.status_code());
                return DispatchOutcome::Failed(err);
            }
        };

        if let Some(outcome) = finish_chain(self.preparations.run(&mut request, sink).await, sink).await {
            return outcome;
        }

        let response = match handle.invoke(request).await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "Controller error");
                abort(sink, 500);
                return DispatchOutcome::Failed(Error::Controller(err.to_string()));
            }
        };

        match send(response, sink).await {
            Ok(()) => DispatchOutcome::Completed,
            Err(err) => DispatchOutcome::Failed(err),
        }
    }
}

/// Turn a chain result into a terminal outcome, or `None` to carry on.
async fn finish_chain(outcome: ChainOutcome, sink: &mut dyn ResponseSink) -> Option<DispatchOutcome> {
    match outcome {
        ChainOutcome::Continue => None,
        ChainOutcome::Respond(response) => Some(match send(response, sink).await {
            Ok(()) => DispatchOutcome::ShortCircuited,
            Err(err) => DispatchOutcome::Failed(err),
        }),
        ChainOutcome::Handled => {
            sink.finish();
            Some(DispatchOutcome::ShortCircuited)
        }
        ChainOutcome::Failed(err) => {
            abort(sink, 500);
            Some(DispatchOutcome::Failed(err))
        }
    }
}

async fn send(response: Box<dyn Response>, sink: &mut dyn ResponseSink) -> Result<(), Error> {
    let status = response.status_code();
    match response.send(sink).await {
        Ok(()) => {
            debug!(status, "Response sent");
            Ok(())
        }
        Err(err) => {
            error!(status, error = %err, "Failed to send a response");
            abort(sink, 500);
            Err(Error::Send(err.to_string()))
        }
    }
}

/// End the request with `status`, or just close it if the head is already out.
fn abort(sink: &mut dyn ResponseSink, status: u16) {
    if !sink.head_written() && sink.write_head(status, &Headers::new()).is_err() {
        debug!(status, "Client gone before error status could be sent");
    }
    sink.finish();
}

impl Injectable for RequestDispatcher {
    fn dependencies() -> DependencyDescriptor<Self> {
        DependencyDescriptor::<Self>::builder()
            .field("resolver", CONTROLLER_RESOLVER, |d| &mut d.resolver)
            .field("middleware", MIDDLEWARE, |d| &mut d.middleware)
            .field("preparations", CONTROLLER_PREPARATION, |d| &mut d.preparations)
            .field("config", CONFIG, |d| &mut d.config)
            .build()
    }

    fn on_resolved(&mut self, _registry: &ServiceRegistry) -> Result<(), Error> {
        self.server = self.config.section_as("server")?;
        debug!(
            trusted_hosts = ?self.server.trusted_hosts,
            has_middleware = self.middleware.has_middleware(),
            "Request dispatcher ready"
        );
        Ok(())
    }
}

impl Service for RequestDispatcher {
    type Contract = RequestDispatcher;
    const KEY: ServiceKey<RequestDispatcher> = WEB_SERVER;

    fn into_contract(self: Arc<Self>) -> Arc<Self> {
        self
    }
}
