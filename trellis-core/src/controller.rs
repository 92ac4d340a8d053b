// Controllers: the two handler variants and request body helpers

use crate::container::{Injectable, ServiceRegistry};
use crate::error::Error;
use crate::http::{HttpRequest, QueryParams};
use crate::response::Response;
use crate::routing::RouteParams;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Body limit used when the `server` config section sets none (1 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Per-request routing data handed to a controller before it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteContext {
    /// Present only when the matched pattern had captures
    pub params: Option<RouteParams>,
    pub query: QueryParams,
}

/// A stateful controller, created through the registry for every request.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn handle(&self, request: &HttpRequest) -> Result<Box<dyn Response>, Error>;

    /// Receive the route parameters and query of the current request.
    fn bind(&mut self, _route: RouteContext) {}
}

pub type ControllerFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Response>, Error>> + Send>>;

/// A stateless handler function.
pub type ControllerFn = Arc<dyn Fn(DispatchContext, HttpRequest) -> ControllerFuture + Send + Sync>;

pub type ControllerFactory =
    Arc<dyn Fn(&ServiceRegistry) -> Result<Box<dyn Controller>, Error> + Send + Sync>;

/// What a function controller is closed over.
#[derive(Clone)]
pub struct DispatchContext {
    pub registry: Arc<ServiceRegistry>,
    pub params: Option<RouteParams>,
    pub query: QueryParams,
}

impl DispatchContext {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.as_ref()?.get(name).map(String::as_str)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

impl fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("params", &self.params)
            .field("query", &self.query)
            .finish()
    }
}

/// A registered handler; the variant is fixed at registration.
#[derive(Clone)]
pub enum ControllerType {
    Instance {
        type_name: &'static str,
        factory: ControllerFactory,
    },
    Function(ControllerFn),
}

impl ControllerType {
    /// A controller type built from `C::default()` and resolved per request.
    pub fn instance<C>() -> Self
    where
        C: Controller + Injectable + Default,
    {
        Self::instance_with(C::default)
    }

    /// Like [`ControllerType::instance`] with a custom constructor.
    pub fn instance_with<C, F>(construct: F) -> Self
    where
        C: Controller + Injectable,
        F: Fn() -> C + Send + Sync + 'static,
    {
        ControllerType::Instance {
            type_name: std::any::type_name::<C>(),
            factory: Arc::new(move |registry: &ServiceRegistry| {
                let controller = registry.create(construct())?;
                Ok(Box::new(controller) as Box<dyn Controller>)
            }),
        }
    }

    /// Wrap an async function; it receives its dispatch context and the request.
    pub fn function<F, Fut>(handler: F) -> Self
    where
        F: Fn(DispatchContext, HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Response>, Error>> + Send + 'static,
    {
        ControllerType::Function(Arc::new(move |context, request| {
            Box::pin(handler(context, request)) as ControllerFuture
        }))
    }

    /// Build the per-request handle for a matched route.
    pub fn instantiate(
        &self,
        registry: &Arc<ServiceRegistry>,
        route: RouteContext,
    ) -> Result<ControllerHandle, Error> {
        match self {
            ControllerType::Instance { factory, .. } => {
                let mut controller = factory(registry)?;
                controller.bind(route.clone());
                Ok(ControllerHandle::Instance { controller, route })
            }
            ControllerType::Function(func) => Ok(ControllerHandle::Function {
                func: func.clone(),
                context: DispatchContext {
                    registry: registry.clone(),
                    params: route.params,
                    query: route.query,
                },
            }),
        }
    }
}

impl fmt::Debug for ControllerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerType::Instance { type_name, .. } => {
                f.debug_tuple("Instance").field(type_name).finish()
            }
            ControllerType::Function(_) => f.write_str("Function"),
        }
    }
}

/// A controller ready to run for one request.
pub enum ControllerHandle {
    Instance {
        controller: Box<dyn Controller>,
        route: RouteContext,
    },
    Function {
        func: ControllerFn,
        context: DispatchContext,
    },
}

impl ControllerHandle {
    pub fn route_params(&self) -> Option<&RouteParams> {
        match self {
            ControllerHandle::Instance { route, .. } => route.params.as_ref(),
            ControllerHandle::Function { context, .. } => context.params.as_ref(),
        }
    }

    /// Run the handler. Route parameters and query are copied onto the
    /// request first so both variants see them there too.
    pub async fn invoke(self, mut request: HttpRequest) -> Result<Box<dyn Response>, Error> {
        match self {
            ControllerHandle::Instance { controller, route } => {
                request.path_params = route.params.unwrap_or_default();
                request.query_params = route.query;
                controller.handle(&request).await
            }
            ControllerHandle::Function { func, context } => {
                request.path_params = context.params.clone().unwrap_or_default();
                request.query_params = context.query.clone();
                func(context, request).await
            }
        }
    }
}

impl fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerHandle::Instance { route, .. } => {
                f.debug_struct("Instance").field("route", route).finish()
            }
            ControllerHandle::Function { context, .. } => {
                f.debug_struct("Function").field("context", context).finish()
            }
        }
    }
}

fn content_type(request: &HttpRequest) -> String {
    request
        .header("content-type")
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

fn check_body(request: &HttpRequest, max_size: Option<usize>) -> Result<(), Error> {
    let limit = max_size.unwrap_or(DEFAULT_MAX_BODY_SIZE);
    let declared = request
        .header("content-length")
        .and_then(|value| value.trim().parse::<usize>().ok());
    if request.body.len() > limit || declared.is_some_and(|length| length > limit) {
        return Err(Error::PayloadTooLarge(format!(
            "request body exceeds {limit} bytes"
        )));
    }
    if request.body.is_empty() {
        return Err(Error::BadRequest("Invalid body content.".to_string()));
    }
    Ok(())
}

/// Deserialize a JSON request body.
///
/// Requires an `application/json` (or `text/json`) content type and a
/// non-empty body no larger than `max_size`.
pub fn read_json_body<T: DeserializeOwned>(
    request: &HttpRequest,
    max_size: Option<usize>,
) -> Result<T, Error> {
    if !matches!(content_type(request).as_str(), "application/json" | "text/json") {
        return Err(Error::BadRequest("Invalid body content.".to_string()));
    }
    check_body(request, max_size)?;
    serde_json::from_slice(&request.body).map_err(|e| Error::BadRequest(e.to_string()))
}

/// Decode an `application/x-www-form-urlencoded` request body.
pub fn read_form_body(
    request: &HttpRequest,
    max_size: Option<usize>,
) -> Result<HashMap<String, String>, Error> {
    if content_type(request) != "application/x-www-form-urlencoded" {
        return Err(Error::BadRequest("Invalid body content.".to_string()));
    }
    check_body(request, max_size)?;
    serde_urlencoded::from_bytes::<Vec<(String, String)>>(&request.body)
        .map(|pairs| pairs.into_iter().collect())
        .map_err(|e| Error::BadRequest(e.to_string()))
}
