// Controller resolution: prioritised resolvers, alias re-entry and the default controller

use crate::alias::{ALIAS_RESOLVER, AliasResolver};
use crate::catalog::{PLUGIN_CATALOG, PluginCatalog};
use crate::container::{DependencyDescriptor, Inject, Injectable, Service, ServiceKey, ServiceRegistry};
use crate::controller::{ControllerHandle, ControllerType, RouteContext};
use crate::error::Error;
use crate::http::ParsedUrl;
use crate::logging::{debug, trace, warn};
use crate::routing::route_tokens;
use crate::service_key;
use std::sync::Arc;

service_key!(
    /// The controller resolution pipeline used by the dispatcher.
    pub CONTROLLER_RESOLVER: ControllerResolutionPipeline = "trellis.controller_resolver"
);

/// Alias rewrites followed for one request before resolution gives up.
pub const MAX_ALIAS_HOPS: usize = 8;

/// One stage of controller resolution.
///
/// `Ok(None)` means no opinion; the pipeline moves on to the next resolver.
pub trait ControllerResolver: Send + Sync {
    fn try_resolve_controller(
        &self,
        registry: &Arc<ServiceRegistry>,
        method: &str,
        url: &ParsedUrl,
        tokens: &[String],
    ) -> Result<Option<ControllerHandle>, Error>;
}

/// Maps a method and request target to a controller.
///
/// Resolvers are asked in ascending priority. When none claims the URL the
/// alias resolver may rewrite it, and resolution restarts from the first
/// resolver with the new URL and the same method. Past [`MAX_ALIAS_HOPS`]
/// rewrites the request resolves to nothing. The default controller, if any,
/// handles whatever is left.
#[derive(Default)]
pub struct ControllerResolutionPipeline {
    catalog: Inject<PluginCatalog>,
    aliases: Inject<dyn AliasResolver>,
    resolvers: Vec<Arc<dyn ControllerResolver>>,
    default_controller: Option<ControllerType>,
}

impl ControllerResolutionPipeline {
    pub fn resolver_count(&self) -> usize {
        self.resolvers.len()
    }

    pub fn default_controller(&self) -> Option<&ControllerType> {
        self.default_controller.as_ref()
    }

    /// Resolve `request_url` (path plus optional query) for `method`.
    ///
    /// Errors come from malformed URLs and from controller construction; a
    /// URL nobody handles is `Ok(None)`.
    pub fn try_resolve_controller(
        &self,
        registry: &Arc<ServiceRegistry>,
        method: &str,
        request_url: &str,
    ) -> Result<Option<ControllerHandle>, Error> {
        match self.resolve_from(registry, method, request_url, 0) {
            Err(Error::AliasDepthExceeded { url, hops }) => {
                warn!(
                    method,
                    path = request_url,
                    last = %url,
                    hops,
                    "Alias chain too long, treating as unmatched"
                );
                Ok(None)
            }
            result => result,
        }
    }

    fn resolve_from(
        &self,
        registry: &Arc<ServiceRegistry>,
        method: &str,
        target: &str,
        hops: usize,
    ) -> Result<Option<ControllerHandle>, Error> {
        let url = ParsedUrl::parse(target)?;
        let tokens = route_tokens(&url.pathname);

        for resolver in &self.resolvers {
            if let Some(handle) = resolver.try_resolve_controller(registry, method, &url, &tokens)? {
                return Ok(Some(handle));
            }
        }

        if let Some(alias) = self.aliases.try_resolve_alias(&url, &tokens) {
            if hops >= MAX_ALIAS_HOPS {
                return Err(Error::AliasDepthExceeded { url: alias, hops });
            }
            debug!(from = %url.pathname, to = %alias, hop = hops + 1, "Resolving alias");
            return self.resolve_from(registry, method, &alias, hops + 1);
        }

        match &self.default_controller {
            Some(controller) => {
                trace!(path = %url.pathname, "Falling back to default controller");
                let context = RouteContext {
                    params: None,
                    query: url.query,
                };
                controller.instantiate(registry, context).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl Injectable for ControllerResolutionPipeline {
    fn dependencies() -> DependencyDescriptor<Self> {
        DependencyDescriptor::<Self>::builder()
            .field("catalog", PLUGIN_CATALOG, |pipeline| &mut pipeline.catalog)
            .field("aliases", ALIAS_RESOLVER, |pipeline| &mut pipeline.aliases)
            .build()
    }

    fn on_resolved(&mut self, registry: &ServiceRegistry) -> Result<(), Error> {
        let catalog = self.catalog.clone();
        self.resolvers = catalog
            .controller_resolvers()
            .into_iter()
            .map(|definition| (definition.factory)(registry))
            .collect::<Result<_, _>>()?;
        self.default_controller = catalog.default_controller().cloned();
        debug!(
            resolvers = self.resolvers.len(),
            default_controller = ?self.default_controller,
            "Controller resolvers loaded"
        );
        Ok(())
    }
}

impl Service for ControllerResolutionPipeline {
    type Contract = ControllerResolutionPipeline;
    const KEY: ServiceKey<ControllerResolutionPipeline> = CONTROLLER_RESOLVER;

    fn into_contract(self: Arc<Self>) -> Arc<Self> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::{AliasMap, AliasResolverChain};
    use crate::catalog::ResolverFactory;
    use crate::http::HttpRequest;
    use crate::response::tests::BufferSink;
    use crate::response::{ResponseExt, StringResponse};
    use crate::routing::{RouteOptions, RouteTable};
    use crate::DispatchContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn labelled(label: &'static str) -> ControllerType {
        ControllerType::function(move |ctx: DispatchContext, _req: HttpRequest| async move {
            let id = ctx.param("id").unwrap_or("-").to_string();
            let page = ctx.query("page").unwrap_or("-").to_string();
            Ok(StringResponse::new(format!("{label}:{id}:{page}")).boxed())
        })
    }

    fn route_table() -> ResolverFactory {
        Arc::new(|registry: &ServiceRegistry| {
            Ok(Arc::new(registry.create(RouteTable::new())?) as Arc<dyn ControllerResolver>)
        })
    }

    fn bootstrap(catalog: PluginCatalog) -> (Arc<ServiceRegistry>, Arc<ControllerResolutionPipeline>) {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register_as(PLUGIN_CATALOG, Arc::new(catalog));
        registry.register_unresolved(AliasResolverChain::default());
        registry.register_unresolved(ControllerResolutionPipeline::default());
        let pipeline = registry.get(CONTROLLER_RESOLVER).unwrap();
        (registry, pipeline)
    }

    async fn body_of(
        pipeline: &ControllerResolutionPipeline,
        registry: &Arc<ServiceRegistry>,
        method: &str,
        target: &str,
    ) -> Option<String> {
        let handle = pipeline.try_resolve_controller(registry, method, target).unwrap()?;
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
    async fn test_route_then_default_controller() {
        let mut catalog = PluginCatalog::new();
        catalog.add_controller_resolver(0, route_table());
        catalog.add_route(RouteOptions::new("GET", "/users/:id").unwrap(), labelled("user"));
        catalog.set_default_controller(Some(labelled("default")));
        let (registry, pipeline) = bootstrap(catalog);

        assert_eq!(pipeline.resolver_count(), 1);
        assert_eq!(
            body_of(&pipeline, &registry, "GET", "/users/42").await.as_deref(),
            Some("user:42:-")
        );
        assert_eq!(
            body_of(&pipeline, &registry, "GET", "/missing?page=3").await.as_deref(),
            Some("default:-:3")
        );
    }

    #[tokio::test]
    async fn test_no_default_controller_resolves_nothing() {
        let mut catalog = PluginCatalog::new();
        catalog.add_controller_resolver(0, route_table());
        let (registry, pipeline) = bootstrap(catalog);

        assert!(pipeline.default_controller().is_none());
        assert!(body_of(&pipeline, &registry, "GET", "/missing").await.is_none());
    }

    #[tokio::test]
    async fn test_alias_restarts_resolution_with_same_method() {
        let mut catalog = PluginCatalog::new();
        catalog.add_controller_resolver(0, route_table());
        catalog.add_route(RouteOptions::new("POST", "/users/:id").unwrap(), labelled("post"));
        catalog.add_route(RouteOptions::new("GET", "/users/:id").unwrap(), labelled("get"));
        catalog.add_alias_resolver(Arc::new(|_: &ServiceRegistry| {
            Ok(Arc::new(AliasMap::new().alias("/me", "/users/self")) as Arc<dyn AliasResolver>)
        }));
        let (registry, pipeline) = bootstrap(catalog);

        assert_eq!(
            body_of(&pipeline, &registry, "POST", "/me?page=2").await.as_deref(),
            Some("post:self:2")
        );
        assert_eq!(
            body_of(&pipeline, &registry, "GET", "/me").await.as_deref(),
            Some("get:self:-")
        );
    }

    #[tokio::test]
    async fn test_alias_cycle_fails_closed() {
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = asked.clone();

        let mut catalog = PluginCatalog::new();
        catalog.add_controller_resolver(0, route_table());
        catalog.add_alias_resolver(Arc::new(move |_: &ServiceRegistry| {
            let counter = counter.clone();
            let ping_pong = move |url: &ParsedUrl, _: &[String]| {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(if url.pathname == "/a" { "/b" } else { "/a" }.to_string())
            };
            Ok(Arc::new(ping_pong) as Arc<dyn AliasResolver>)
        }));
        // A default controller is not consulted once the hop bound is hit
        catalog.set_default_controller(Some(labelled("default")));
        let (registry, pipeline) = bootstrap(catalog);

        assert!(body_of(&pipeline, &registry, "GET", "/a").await.is_none());
        assert_eq!(asked.load(Ordering::SeqCst), MAX_ALIAS_HOPS + 1);
    }

    struct Fixed(&'static str);

    impl ControllerResolver for Fixed {
        fn try_resolve_controller(
            &self,
            registry: &Arc<ServiceRegistry>,
            _method: &str,
            url: &ParsedUrl,
            _tokens: &[String],
        ) -> Result<Option<ControllerHandle>, Error> {
            if url.pathname != "/shared" {
                return Ok(None);
            }
            labelled(self.0)
                .instantiate(registry, RouteContext::default())
                .map(Some)
        }
    }

    #[tokio::test]
    async fn test_lower_priority_value_is_asked_first() {
        let mut catalog = PluginCatalog::new();
        catalog.add_controller_resolver(
            20,
            Arc::new(|_: &ServiceRegistry| Ok(Arc::new(Fixed("late")) as Arc<dyn ControllerResolver>)),
        );
        catalog.add_controller_resolver(
            -1,
            Arc::new(|_: &ServiceRegistry| Ok(Arc::new(Fixed("early")) as Arc<dyn ControllerResolver>)),
        );
        let (registry, pipeline) = bootstrap(catalog);

        assert_eq!(
            body_of(&pipeline, &registry, "GET", "/shared").await.as_deref(),
            Some("early:-:-")
        );
    }

    #[test]
    fn test_malformed_url_is_an_error() {
        let (registry, pipeline) = bootstrap(PluginCatalog::new());
        assert!(matches!(
            pipeline.try_resolve_controller(&registry, "GET", "/bad%FFpath"),
            Err(Error::BadRequest(_))
        ));
    }
}
