// Plugin catalog: the explicit, ordered registration lists consumed at bootstrap

use crate::alias::AliasResolver;
use crate::container::{Service, ServiceRegistry};
use crate::controller::ControllerType;
use crate::error::Error;
use crate::middleware::Middleware;
use crate::pipeline::ControllerResolver;
use crate::routing::RouteOptions;
use crate::service_key;
use std::fmt;
use std::sync::Arc;

service_key!(
    /// The catalog itself, bound resolved at bootstrap.
    pub PLUGIN_CATALOG: PluginCatalog = "trellis.plugin_catalog"
);

/// A factory plus its category-specific data.
#[derive(Clone)]
pub struct PluginDefinition<F, D = ()> {
    pub factory: F,
    pub data: D,
}

pub type ServiceRegistration = Arc<dyn Fn(&ServiceRegistry) + Send + Sync>;

pub type ResolverFactory =
    Arc<dyn Fn(&ServiceRegistry) -> Result<Arc<dyn ControllerResolver>, Error> + Send + Sync>;

pub type AliasFactory =
    Arc<dyn Fn(&ServiceRegistry) -> Result<Arc<dyn AliasResolver>, Error> + Send + Sync>;

pub type MiddlewareFactory =
    Arc<dyn Fn(&ServiceRegistry) -> Result<Arc<dyn Middleware>, Error> + Send + Sync>;

/// Everything the application registered, per category.
///
/// Routes, alias resolvers, middleware and preparations keep registration
/// order. Controller resolvers are ordered by ascending priority, ties in
/// registration order.
#[derive(Default)]
pub struct PluginCatalog {
    services: Vec<PluginDefinition<ServiceRegistration, &'static str>>,
    routes: Vec<PluginDefinition<ControllerType, RouteOptions>>,
    controller_resolvers: Vec<PluginDefinition<ResolverFactory, i32>>,
    alias_resolvers: Vec<PluginDefinition<AliasFactory>>,
    middleware: Vec<PluginDefinition<MiddlewareFactory>>,
    preparations: Vec<PluginDefinition<MiddlewareFactory>>,
    default_controller: Option<ControllerType>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service registered unresolved at bootstrap, built by `factory`.
    pub fn add_service<S, F>(&mut self, factory: F)
    where
        S: Service,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.services.push(PluginDefinition {
            factory: Arc::new(move |registry: &ServiceRegistry| {
                registry.register_unresolved(factory())
            }),
            data: S::KEY.name(),
        });
    }

    pub fn add_route(&mut self, options: RouteOptions, controller: ControllerType) {
        self.routes.push(PluginDefinition {
            factory: controller,
            data: options,
        });
    }

    pub fn add_controller_resolver(&mut self, priority: i32, factory: ResolverFactory) {
        self.controller_resolvers.push(PluginDefinition {
            factory,
            data: priority,
        });
    }

    pub fn add_alias_resolver(&mut self, factory: AliasFactory) {
        self.alias_resolvers.push(PluginDefinition { factory, data: () });
    }

    pub fn add_middleware(&mut self, factory: MiddlewareFactory) {
        self.middleware.push(PluginDefinition { factory, data: () });
    }

    pub fn add_preparation(&mut self, factory: MiddlewareFactory) {
        self.preparations.push(PluginDefinition { factory, data: () });
    }

    pub fn set_default_controller(&mut self, controller: Option<ControllerType>) {
        self.default_controller = controller;
    }

    pub fn services(&self) -> &[PluginDefinition<ServiceRegistration, &'static str>] {
        &self.services
    }

    pub fn routes(&self) -> &[PluginDefinition<ControllerType, RouteOptions>] {
        &self.routes
    }

    /// Controller resolvers sorted by priority; the sort is stable.
    pub fn controller_resolvers(&self) -> Vec<&PluginDefinition<ResolverFactory, i32>> {
        let mut resolvers: Vec<_> = self.controller_resolvers.iter().collect();
        resolvers.sort_by_key(|definition| definition.data);
        resolvers
    }

    pub fn alias_resolvers(&self) -> &[PluginDefinition<AliasFactory>] {
        &self.alias_resolvers
    }

    pub fn middleware(&self) -> &[PluginDefinition<MiddlewareFactory>] {
        &self.middleware
    }

    pub fn preparations(&self) -> &[PluginDefinition<MiddlewareFactory>] {
        &self.preparations
    }

    pub fn default_controller(&self) -> Option<&ControllerType> {
        self.default_controller.as_ref()
    }
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCatalog")
            .field(
                "services",
                &self.services.iter().map(|s| s.data).collect::<Vec<_>>(),
            )
            .field("routes", &self.routes.len())
            .field("controller_resolvers", &self.controller_resolvers.len())
            .field("alias_resolvers", &self.alias_resolvers.len())
            .field("middleware", &self.middleware.len())
            .field("preparations", &self.preparations.len())
            .field("default_controller", &self.default_controller)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ParsedUrl;
    use crate::controller::ControllerHandle;

    struct Named;

    impl ControllerResolver for Named {
        fn try_resolve_controller(
            &self,
            _registry: &Arc<ServiceRegistry>,
            _method: &str,
            _url: &ParsedUrl,
            _tokens: &[String],
        ) -> Result<Option<ControllerHandle>, Error> {
            Ok(None)
        }
    }

    type CallLog = Arc<parking_lot::Mutex<Vec<&'static str>>>;

    fn resolver(name: &'static str, log: &CallLog) -> ResolverFactory {
        let log = log.clone();
        Arc::new(move |_registry: &ServiceRegistry| {
            log.lock().push(name);
            Ok(Arc::new(Named) as Arc<dyn ControllerResolver>)
        })
    }

    #[test]
    fn test_resolvers_sorted_by_priority_then_registration() {
        let log = CallLog::default();
        let mut catalog = PluginCatalog::new();
        catalog.add_controller_resolver(10, resolver("late", &log));
        catalog.add_controller_resolver(0, resolver("first", &log));
        catalog.add_controller_resolver(10, resolver("later", &log));
        catalog.add_controller_resolver(-5, resolver("earliest", &log));

        let registry = ServiceRegistry::new();
        for definition in catalog.controller_resolvers() {
            (definition.factory)(&registry).unwrap();
        }
        assert_eq!(*log.lock(), vec!["earliest", "first", "late", "later"]);
    }

    #[test]
    fn test_routes_keep_registration_order() {
        let mut catalog = PluginCatalog::new();
        for path in ["/a", "/b", "/c"] {
            catalog.add_route(
                RouteOptions::new("GET", path).unwrap(),
                ControllerType::function(|_, _| async { Err(Error::Internal("unused".into())) }),
            );
        }
        let paths: Vec<String> = catalog
            .routes()
            .iter()
            .map(|route| match &route.data.pattern {
                crate::routing::RoutePattern::Tokens(tokens) => tokens.join("/"),
                crate::routing::RoutePattern::Regex(regex) => regex.to_string(),
            })
            .collect();
        assert_eq!(paths, vec!["a", "b", "c"]);
        assert!(catalog.default_controller().is_none());
    }
}
