// Trellis - a pluggable async HTTP application framework
//
// Applications are assembled from services in a registry: routes, controller
// resolvers, alias resolvers and middleware are registered explicitly and
// wired together at bootstrap.

// Re-export core functionality
pub use trellis_core::*;

pub use async_trait::async_trait;
pub use serde;
pub use serde_json;
pub use tokio;

// Re-export optional crates
#[cfg(feature = "config")]
pub use trellis_config;

#[cfg(feature = "testing")]
pub use trellis_testing;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        AliasMap,
        AliasResolver,
        Application,
        ApplicationBuilder,
        ConfigProvider,
        Controller,
        ControllerResolver,
        ControllerType,
        DependencyDescriptor,
        DispatchContext,
        EmptyResponse,
        Error,
        EventStreamResponse,
        FileResponse,
        HtmlResponse,
        HttpRequest,
        Inject,
        Injectable,
        JsonResponse,
        Middleware,
        MiddlewareOutcome,
        RedirectResponse,
        Response,
        ResponseExt,
        RouteContext,
        Service,
        ServiceKey,
        ServiceRegistry,
        StaticConfig,
        StringResponse,
        async_trait,
        middleware_fn,
        service_key,
    };
}
