// Dependency injection: service keys, dependency descriptors and the registry

use crate::Error;
use crate::logging::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Typed identifier of a capability contract in the [`ServiceRegistry`].
///
/// `T` is the contract the key hands out, usually a trait object such as
/// `dyn UserStore`. Declare keys with [`service_key!`](crate::service_key) so
/// their names take part in startup validation.
pub struct ServiceKey<T: ?Sized> {
    name: &'static str,
    _contract: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized> ServiceKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _contract: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: ?Sized> Clone for ServiceKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for ServiceKey<T> {}

impl<T: ?Sized> fmt::Debug for ServiceKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceKey").field(&self.name).finish()
    }
}

/// A key declaration collected at link time by [`service_key!`](crate::service_key).
#[doc(hidden)]
pub struct KeyDeclaration {
    pub name: &'static str,
    pub contract: &'static str,
}

inventory::collect!(KeyDeclaration);

/// Declare a service key constant and record it for startup validation.
///
/// ```
/// use trellis_core::service_key;
///
/// pub trait Clock: Send + Sync {
///     fn now(&self) -> u64;
/// }
///
/// service_key!(pub CLOCK: dyn Clock = "app.clock");
/// assert_eq!(CLOCK.name(), "app.clock");
/// ```
#[macro_export]
macro_rules! service_key {
    ($(#[$meta:meta])* $vis:vis $ident:ident : $contract:ty = $name:literal) => {
        $(#[$meta])*
        $vis const $ident: $crate::ServiceKey<$contract> = $crate::ServiceKey::new($name);

        $crate::inventory::submit! {
            $crate::container::KeyDeclaration {
                name: $name,
                contract: stringify!($contract),
            }
        }
    };
}

/// Check that no two declared keys share a name.
///
/// Keys are global by convention only, so two crates picking the same name
/// would silently replace each other's services.
pub fn validate_service_keys() -> Result<usize, Error> {
    let mut seen: HashMap<&'static str, &'static str> = HashMap::new();
    for declaration in inventory::iter::<KeyDeclaration> {
        if let Some(first) = seen.insert(declaration.name, declaration.contract) {
            return Err(Error::DuplicateServiceKey {
                key: declaration.name.to_string(),
                first,
                second: declaration.contract,
            });
        }
    }
    trace!(keys = seen.len(), "Service keys validated");
    Ok(seen.len())
}

/// A component whose fields are filled from the registry.
pub trait Injectable: Send + Sync + Sized + 'static {
    /// Fields to inject, most-derived first.
    fn dependencies() -> DependencyDescriptor<Self> {
        DependencyDescriptor::none()
    }

    /// Lifecycle hook, fired once after every declared dependency (including
    /// inherited ones) has been injected.
    fn on_resolved(&mut self, _registry: &ServiceRegistry) -> Result<(), Error> {
        Ok(())
    }
}

/// An [`Injectable`] bound to a key in the registry.
pub trait Service: Injectable {
    /// What lookups of [`Service::KEY`] return, e.g. `dyn AliasResolver`.
    type Contract: ?Sized + Send + Sync + 'static;

    const KEY: ServiceKey<Self::Contract>;

    fn into_contract(self: Arc<Self>) -> Arc<Self::Contract>;
}

/// A dependency slot, empty until the owning component is resolved.
///
/// # Panics
///
/// Dereferencing an empty slot panics. A component built by hand rather
/// than through [`ServiceRegistry::create`] or a registry lookup has empty
/// slots; use [`Inject::get`] where that can happen.
pub struct Inject<T: ?Sized>(Option<Arc<T>>);

impl<T: ?Sized> Inject<T> {
    pub const fn empty() -> Self {
        Self(None)
    }

    pub fn set(&mut self, value: Arc<T>) {
        self.0 = Some(value);
    }

    pub fn is_injected(&self) -> bool {
        self.0.is_some()
    }

    /// The injected service, or `None` before resolution.
    pub fn get(&self) -> Option<&Arc<T>> {
        self.0.as_ref()
    }
}

impl<T: ?Sized> Default for Inject<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized> Clone for Inject<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: ?Sized> Deref for Inject<T> {
    type Target = T;

    /// Panics when the owner has not gone through the registry. Components
    /// only see their dependencies after `ServiceRegistry::resolve`.
    fn deref(&self) -> &T {
        match &self.0 {
            Some(value) => value.as_ref(),
            None => panic!(
                "dependency {} accessed before its owner was resolved",
                type_name::<T>()
            ),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Inject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inject")
            .field("contract", &type_name::<T>())
            .field("injected", &self.is_injected())
            .finish()
    }
}

type Injector<T> = Box<dyn Fn(&mut T, &ServiceRegistry) -> Result<(), Error> + Send + Sync>;

struct FieldDependency<T> {
    field: &'static str,
    key: &'static str,
    inject: Injector<T>,
}

/// The injectable fields of a type, optionally chained to the descriptor of
/// an embedded base component.
pub struct DependencyDescriptor<T> {
    fields: Vec<FieldDependency<T>>,
    parent: Option<Box<DependencyDescriptor<T>>>,
}

impl<T: 'static> DependencyDescriptor<T> {
    pub fn none() -> Self {
        Self {
            fields: Vec::new(),
            parent: None,
        }
    }

    pub fn builder() -> DependencyDescriptorBuilder<T> {
        DependencyDescriptorBuilder {
            descriptor: Self::none(),
        }
    }

    /// `(field, key)` pairs in injection order.
    pub fn fields(&self) -> Vec<(&'static str, &'static str)> {
        let mut out = Vec::new();
        let mut current = Some(self);
        while let Some(descriptor) = current {
            out.extend(descriptor.fields.iter().map(|f| (f.field, f.key)));
            current = descriptor.parent.as_deref();
        }
        out
    }

    /// Fill every declared field of `target`, walking the chain from the
    /// most-derived descriptor down to the least-derived one.
    pub fn inject(&self, target: &mut T, registry: &ServiceRegistry) -> Result<(), Error> {
        let mut current = Some(self);
        while let Some(descriptor) = current {
            for dependency in &descriptor.fields {
                trace!(
                    component = type_name::<T>(),
                    field = dependency.field,
                    service = dependency.key,
                    "Injecting dependency"
                );
                (dependency.inject)(target, registry)?;
            }
            current = descriptor.parent.as_deref();
        }
        Ok(())
    }

    fn project<U: 'static>(self, projection: fn(&mut U) -> &mut T) -> DependencyDescriptor<U> {
        let fields = self
            .fields
            .into_iter()
            .map(|dependency| {
                let inner = dependency.inject;
                FieldDependency {
                    field: dependency.field,
                    key: dependency.key,
                    inject: Box::new(move |target: &mut U, registry: &ServiceRegistry| {
                        inner(projection(target), registry)
                    }) as Injector<U>,
                }
            })
            .collect();

        DependencyDescriptor {
            fields,
            parent: self.parent.map(|parent| Box::new(parent.project(projection))),
        }
    }
}

impl<T> fmt::Debug for DependencyDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyDescriptor")
            .field("fields", &self.fields.iter().map(|d| d.field).collect::<Vec<_>>())
            .field("parent", &self.parent)
            .finish()
    }
}

/// Builder for [`DependencyDescriptor`].
///
/// ```
/// use trellis_core::{service_key, DependencyDescriptor, Inject, Injectable};
///
/// pub trait Clock: Send + Sync {}
/// service_key!(pub CLOCK: dyn Clock = "doc.clock");
///
/// #[derive(Default)]
/// struct Greeter {
///     clock: Inject<dyn Clock>,
/// }
///
/// impl Injectable for Greeter {
///     fn dependencies() -> DependencyDescriptor<Self> {
///         DependencyDescriptor::<Self>::builder()
///             .field("clock", CLOCK, |g| &mut g.clock)
///             .build()
///     }
/// }
///
/// assert_eq!(Greeter::dependencies().fields(), vec![("clock", "doc.clock")]);
/// ```
pub struct DependencyDescriptorBuilder<T> {
    descriptor: DependencyDescriptor<T>,
}

impl<T: 'static> DependencyDescriptorBuilder<T> {
    /// Declare a field filled from `key`.
    pub fn field<D>(
        mut self,
        field: &'static str,
        key: ServiceKey<D>,
        accessor: fn(&mut T) -> &mut Inject<D>,
    ) -> Self
    where
        D: ?Sized + Send + Sync + 'static,
    {
        let inject: Injector<T> = Box::new(move |target: &mut T, registry: &ServiceRegistry| {
            let dependency = registry.get(key)?;
            accessor(target).set(dependency);
            Ok(())
        });
        self.descriptor.fields.push(FieldDependency {
            field,
            key: key.name(),
            inject,
        });
        self
    }

    /// Chain the descriptor of an embedded base component, reached through
    /// `projection`. Its fields are injected after this type's own fields.
    pub fn inherit<B: 'static>(
        mut self,
        parent: DependencyDescriptor<B>,
        projection: fn(&mut T) -> &mut B,
    ) -> Self {
        self.descriptor.parent = Some(Box::new(parent.project(projection)));
        self
    }

    pub fn build(self) -> DependencyDescriptor<T> {
        self.descriptor
    }
}

type SharedService = Arc<dyn Any + Send + Sync>;

/// An unresolved registration, type-erased.
trait PendingService: Send {
    fn type_name(&self) -> &'static str;
    fn inject(&mut self, registry: &ServiceRegistry) -> Result<(), Error>;
    fn activate(self: Box<Self>, registry: &ServiceRegistry) -> Result<SharedService, Error>;
}

struct Pending<S: Service>(S);

impl<S: Service> PendingService for Pending<S> {
    fn type_name(&self) -> &'static str {
        type_name::<S>()
    }

    fn inject(&mut self, registry: &ServiceRegistry) -> Result<(), Error> {
        registry.resolve(&mut self.0)
    }

    fn activate(self: Box<Self>, registry: &ServiceRegistry) -> Result<SharedService, Error> {
        let mut service = self.0;
        service.on_resolved(registry)?;
        let contract: Arc<S::Contract> = S::into_contract(Arc::new(service));
        Ok(Arc::new(contract))
    }
}

enum Slot {
    Unresolved(Box<dyn PendingService>),
    /// Being resolved by the given thread; other threads wait.
    Resolving(ThreadId),
    Resolved(SharedService),
    /// The lifecycle hook failed; the instance is gone.
    Failed,
}

impl Slot {
    fn state(&self) -> &'static str {
        match self {
            Slot::Unresolved(_) => "unresolved",
            Slot::Resolving(_) => "resolving",
            Slot::Resolved(_) => "resolved",
            Slot::Failed => "failed",
        }
    }
}

/// Keyed store of services with lazy, at-most-once resolution.
///
/// Built once at bootstrap and shared as `Arc<ServiceRegistry>`. Lookups of
/// an unresolved service inject its dependencies and fire its lifecycle hook
/// before promoting it; concurrent lookups of the same key wait for the first
/// one to finish. A lookup that would wait on itself, directly or through
/// other waiting threads, fails with [`Error::CircularDependency`].
pub struct ServiceRegistry {
    slots: Mutex<HashMap<&'static str, Slot>>,
    /// Key each blocked thread is waiting on. Locked after `slots`.
    waiting: Mutex<HashMap<ThreadId, &'static str>>,
    settled: Condvar,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        debug!("Creating service registry");
        Self {
            slots: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
        }
    }

    /// Bind an already-usable service under its own key.
    pub fn register_resolved<S: Service>(&self, service: S) {
        self.register_as(S::KEY, S::into_contract(Arc::new(service)));
    }

    /// Bind a ready contract object under `key`, replacing any earlier binding.
    pub fn register_as<T>(&self, key: ServiceKey<T>, service: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let name = key.name();
        let mut slots = self.slots.lock();
        if let Some(previous) = slots.get(name) {
            warn!(service = name, previous = previous.state(), "Overriding service");
        }
        slots.insert(name, Slot::Resolved(Arc::new(service)));
        self.settled.notify_all();
        debug!(service = name, "Service registered");
    }

    /// Bind a service to be resolved on first lookup.
    ///
    /// Never replaces a resolved (or resolving) binding; that case is logged
    /// and ignored.
    pub fn register_unresolved<S: Service>(&self, service: S) {
        let name = S::KEY.name();
        let mut slots = self.slots.lock();
        match slots.get(name) {
            Some(Slot::Resolved(_)) | Some(Slot::Resolving(_)) => {
                warn!(
                    service = name,
                    service_type = type_name::<S>(),
                    "Service is already registered, ignoring unresolved registration"
                );
                return;
            }
            Some(previous) => {
                warn!(service = name, previous = previous.state(), "Overriding service");
            }
            None => {}
        }
        slots.insert(name, Slot::Unresolved(Box::new(Pending(service))));
        debug!(
            service = name,
            service_type = type_name::<S>(),
            "Service registered unresolved"
        );
    }

    /// Look up a required service, resolving it first if needed.
    pub fn get<T>(&self, key: ServiceKey<T>) -> Result<Arc<T>, Error>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get_optional(key)?
            .ok_or_else(|| Error::ServiceNotRegistered(key.name().to_string()))
    }

    /// Look up a service that may be absent.
    pub fn get_optional<T>(&self, key: ServiceKey<T>) -> Result<Option<Arc<T>>, Error>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let Some(shared) = self.lookup(key.name())? else {
            return Ok(None);
        };
        shared
            .downcast_ref::<Arc<T>>()
            .cloned()
            .map(Some)
            .ok_or_else(|| Error::ServiceTypeMismatch {
                key: key.name().to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Inject the declared dependencies of `target` without firing its hook.
    pub fn resolve<T: Injectable>(&self, target: &mut T) -> Result<(), Error> {
        T::dependencies().inject(target, self)
    }

    /// Resolve a per-request component that is never bound to a key.
    pub fn create<T: Injectable>(&self, mut instance: T) -> Result<T, Error> {
        self.resolve(&mut instance)?;
        instance.on_resolved(self)?;
        trace!(component = type_name::<T>(), "Component created");
        Ok(instance)
    }

    pub fn contains<T: ?Sized>(&self, key: ServiceKey<T>) -> bool {
        self.slots.lock().contains_key(key.name())
    }

    pub fn is_resolved<T: ?Sized>(&self, key: ServiceKey<T>) -> bool {
        matches!(self.slots.lock().get(key.name()), Some(Slot::Resolved(_)))
    }

    /// Resolve every service still unresolved, returning how many were.
    pub fn resolve_all(&self) -> Result<usize, Error> {
        let pending: Vec<&'static str> = {
            let slots = self.slots.lock();
            slots
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Unresolved(_)))
                .map(|(name, _)| *name)
                .collect()
        };

        // Entries promoted as a dependency of an earlier one are simply read
        for name in &pending {
            self.lookup(name)?;
        }
        debug!(count = pending.len(), "Force-resolved services");
        Ok(pending.len())
    }

    /// Registered key names, sorted.
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.slots.lock().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    fn lookup(&self, name: &'static str) -> Result<Option<SharedService>, Error> {
        let current = thread::current().id();
        let mut slots = self.slots.lock();

        let mut pending = loop {
            match slots.get(name) {
                None => return Ok(None),
                Some(Slot::Resolved(shared)) => return Ok(Some(shared.clone())),
                Some(Slot::Failed) => return Err(Error::ResolutionFailed(name.to_string())),
                Some(Slot::Resolving(owner)) => {
                    let owner = *owner;
                    if self.waits_on(owner, current, &slots) {
                        return Err(Error::CircularDependency(name.to_string()));
                    }
                    self.waiting.lock().insert(current, name);
                    self.settled.wait(&mut slots);
                    self.waiting.lock().remove(&current);
                }
                Some(Slot::Unresolved(_)) => {
                    if let Some(Slot::Unresolved(pending)) =
                        slots.insert(name, Slot::Resolving(current))
                    {
                        break pending;
                    }
                }
            }
        };
        drop(slots);

        debug!(
            service = name,
            service_type = pending.type_name(),
            "Resolving service"
        );

        if let Err(err) = pending.inject(self) {
            warn!(service = name, error = %err, "Service dependencies could not be injected");
            self.settle(name, Slot::Unresolved(pending));
            return Err(err);
        }

        match pending.activate(self) {
            Ok(shared) => {
                self.settle(name, Slot::Resolved(shared.clone()));
                debug!(service = name, "Service resolved");
                Ok(Some(shared))
            }
            Err(err) => {
                error!(service = name, error = %err, "Service lifecycle hook failed");
                self.settle(name, Slot::Failed);
                Err(err)
            }
        }
    }

    /// Whether `owner` is `current` or is blocked, through a chain of waiting
    /// threads, on a key `current` is resolving.
    fn waits_on(
        &self,
        mut owner: ThreadId,
        current: ThreadId,
        slots: &HashMap<&'static str, Slot>,
    ) -> bool {
        let waiting = self.waiting.lock();
        // Every hop visits a distinct blocked thread
        for _ in 0..=waiting.len() {
            if owner == current {
                return true;
            }
            match waiting.get(&owner).and_then(|key| slots.get(key)) {
                Some(Slot::Resolving(next)) => owner = *next,
                _ => return false,
            }
        }
        false
    }

    /// Store the outcome of a resolution unless the key was re-registered
    /// while it was in flight.
    fn settle(&self, name: &'static str, slot: Slot) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(name), Some(Slot::Resolving(_))) {
            slots.insert(name, slot);
        }
        self.settled.notify_all();
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        let mut map = f.debug_map();
        for (name, slot) in slots.iter() {
            map.entry(name, &slot.state());
        }
        map.finish()
    }
}
