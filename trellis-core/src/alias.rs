// URL alias resolution

use crate::catalog::{PLUGIN_CATALOG, PluginCatalog};
use crate::container::{DependencyDescriptor, Inject, Injectable, Service, ServiceKey, ServiceRegistry};
use crate::error::Error;
use crate::http::ParsedUrl;
use crate::logging::{debug, trace};
use crate::routing::{route_tokens, try_match_exact_route};
use crate::service_key;
use std::sync::Arc;

service_key!(
    /// The alias resolver consulted by the controller pipeline.
    pub ALIAS_RESOLVER: dyn AliasResolver = "trellis.alias_resolver"
);

/// Rewrites a URL that no controller resolver claimed.
///
/// Returning `Some(url)` restarts controller resolution with `url` and the
/// original method.
pub trait AliasResolver: Send + Sync {
    fn try_resolve_alias(&self, url: &ParsedUrl, tokens: &[String]) -> Option<String>;
}

impl<F> AliasResolver for F
where
    F: Fn(&ParsedUrl, &[String]) -> Option<String> + Send + Sync,
{
    fn try_resolve_alias(&self, url: &ParsedUrl, tokens: &[String]) -> Option<String> {
        self(url, tokens)
    }
}

/// The registered alias resolvers, asked in registration order.
#[derive(Default)]
pub struct AliasResolverChain {
    catalog: Inject<PluginCatalog>,
    resolvers: Vec<Arc<dyn AliasResolver>>,
}

impl AliasResolverChain {
    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl Injectable for AliasResolverChain {
    fn dependencies() -> DependencyDescriptor<Self> {
        DependencyDescriptor::<Self>::builder()
            .field("catalog", PLUGIN_CATALOG, |chain| &mut chain.catalog)
            .build()
    }

    fn on_resolved(&mut self, registry: &ServiceRegistry) -> Result<(), Error> {
        self.resolvers = self
            .catalog
            .alias_resolvers()
            .iter()
            .map(|definition| (definition.factory)(registry))
            .collect::<Result<_, _>>()?;
        debug!(count = self.resolvers.len(), "Alias resolvers loaded");
        Ok(())
    }
}

impl Service for AliasResolverChain {
    type Contract = dyn AliasResolver;
    const KEY: ServiceKey<dyn AliasResolver> = ALIAS_RESOLVER;

    fn into_contract(self: Arc<Self>) -> Arc<dyn AliasResolver> {
        self
    }
}

impl AliasResolver for AliasResolverChain {
    fn try_resolve_alias(&self, url: &ParsedUrl, tokens: &[String]) -> Option<String> {
        self.resolvers
            .iter()
            .find_map(|resolver| {
                resolver
                    .try_resolve_alias(url, tokens)
                    .filter(|target| !target.is_empty())
            })
    }
}

/// Fixed path-to-path aliases, e.g. `/home` to `/`.
///
/// Paths are compared token by token, so `/home/` and `//home` both match
/// `/home`. The original query string is carried over unless the target has
/// its own.
#[derive(Debug, Clone, Default)]
pub struct AliasMap {
    entries: Vec<(Vec<String>, String)>,
}

impl AliasMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alias(mut self, from: &str, to: impl Into<String>) -> Self {
        self.entries.push((route_tokens(from), to.into()));
        self
    }
}

impl AliasResolver for AliasMap {
    fn try_resolve_alias(&self, url: &ParsedUrl, tokens: &[String]) -> Option<String> {
        let (_, target) = self
            .entries
            .iter()
            .find(|(from, _)| try_match_exact_route(tokens, from))?;
        trace!(from = %url.pathname, to = %target, "Alias matched");

        match &url.search {
            Some(search) if !search.is_empty() && !target.contains('?') => {
                Some(format!("{target}?{search}"))
            }
            _ => Some(target.clone()),
        }
    }
}
