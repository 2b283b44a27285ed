//! Dependency-ordered component instantiation.
//!
//! The [`Instantiator`] walks a validated [`DependencyGraph`] with Kahn's
//! algorithm, breaking ties by component name so the same model always
//! produces the same creation order. Each component with a class is handed to
//! a [`ComponentFactory`] together with its already-created children and
//! dependencies; class-less internal children are passed to their owner's
//! factory call instead and registered as handles into the owner.
//!
//! # Failure
//!
//! If the factory fails for a component, every instance created so far is
//! torn down in reverse creation order before the error is returned. No
//! component after the failing one is created.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut catalog = FactoryCatalog::new();
//! catalog.register("simulated.Light", Arc::new(|ctx| Ok(Device::light(ctx.declaration))));
//!
//! let registry = Instantiator::new(&graph, &store).instantiate(&catalog)?;
//! let light = registry.find_by_role("light");
//! ```

use crate::config::RolePolicy;
use crate::declaration::{ChildHandle, ComponentDeclaration};
use crate::error::{ResolveError, ResolveResult};
use crate::graph::DependencyGraph;
use crate::store::DeclarationStore;
use crate::validate;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// =============================================================================
// Factory
// =============================================================================

/// Constructs component instances from declarations.
pub trait ComponentFactory {
    type Instance;

    /// Build one component. Internal children of the component are listed in
    /// `ctx.children` and must be built as part of the returned instance.
    fn create(&self, ctx: CreateContext<'_, Self::Instance>) -> anyhow::Result<Self::Instance>;

    /// Release an instance. Called once per created component, in reverse
    /// creation order.
    fn teardown(&self, _name: &str, _instance: &Self::Instance) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A reference to a registered component.
#[derive(Debug)]
pub enum Lookup<I> {
    /// A component created by the factory.
    Component(Arc<I>),
    /// An internal child, reachable through its owner.
    Internal {
        owner: Arc<I>,
        owner_name: String,
        handle: ChildHandle,
    },
}

impl<I> Clone for Lookup<I> {
    fn clone(&self) -> Self {
        match self {
            Lookup::Component(instance) => Lookup::Component(Arc::clone(instance)),
            Lookup::Internal {
                owner,
                owner_name,
                handle,
            } => Lookup::Internal {
                owner: Arc::clone(owner),
                owner_name: owner_name.clone(),
                handle: *handle,
            },
        }
    }
}

impl<I> Lookup<I> {
    /// The instance itself, or the owner for an internal child.
    pub fn instance(&self) -> &Arc<I> {
        match self {
            Lookup::Component(instance) => instance,
            Lookup::Internal { owner, .. } => owner,
        }
    }

    pub fn handle(&self) -> Option<ChildHandle> {
        match self {
            Lookup::Component(_) => None,
            Lookup::Internal { handle, .. } => Some(*handle),
        }
    }
}

/// What a factory receives for one `children` slot.
#[derive(Debug)]
pub enum ChildBinding<'a, I> {
    /// The child was created earlier.
    Created(Lookup<I>),
    /// The child has no class: the factory builds it, storing it at `handle`.
    Internal {
        declaration: &'a ComponentDeclaration,
        handle: ChildHandle,
        /// The child's dependencies that already exist. Dependencies on the
        /// owner or on siblings are left to the factory.
        dependencies: BTreeMap<String, Lookup<I>>,
    },
}

/// Everything the factory needs to build one component.
#[derive(Debug)]
pub struct CreateContext<'a, I> {
    pub declaration: &'a ComponentDeclaration,
    pub children: BTreeMap<String, ChildBinding<'a, I>>,
    pub dependencies: BTreeMap<String, Lookup<I>>,
}

impl<'a, I> CreateContext<'a, I> {
    pub fn name(&self) -> &str {
        &self.declaration.name
    }

    pub fn child(&self, slot: &str) -> Option<&ChildBinding<'a, I>> {
        self.children.get(slot)
    }

    pub fn dependency(&self, slot: &str) -> Option<&Lookup<I>> {
        self.dependencies.get(slot)
    }

    /// Internal children in handle order.
    pub fn internal_children(&self) -> Vec<(&str, &'a ComponentDeclaration, ChildHandle)> {
        let mut children: Vec<_> = self
            .children
            .iter()
            .filter_map(|(slot, binding)| match binding {
                ChildBinding::Internal {
                    declaration,
                    handle,
                    ..
                } => Some((slot.as_str(), *declaration, *handle)),
                ChildBinding::Created(_) => None,
            })
            .collect();
        children.sort_by_key(|(_, _, handle)| *handle);
        children
    }
}

/// Constructor registered for one class in a [`FactoryCatalog`].
pub type ComponentBuilder<I> =
    Arc<dyn for<'a> Fn(CreateContext<'a, I>) -> anyhow::Result<I> + Send + Sync>;

/// Factory dispatching on the declared class.
pub struct FactoryCatalog<I> {
    builders: HashMap<String, ComponentBuilder<I>>,
}

impl<I> Default for FactoryCatalog<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> Clone for FactoryCatalog<I> {
    fn clone(&self) -> Self {
        Self {
            builders: self.builders.clone(),
        }
    }
}

impl<I> FactoryCatalog<I> {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    pub fn register(&mut self, class: impl Into<String>, builder: ComponentBuilder<I>) {
        self.builders.insert(class.into(), builder);
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.builders.contains_key(class)
    }
}

impl<I> ComponentFactory for FactoryCatalog<I> {
    type Instance = I;

    fn create(&self, ctx: CreateContext<'_, I>) -> anyhow::Result<I> {
        let class = ctx
            .declaration
            .class
            .as_deref()
            .ok_or_else(|| anyhow!("Component '{}' has no class", ctx.name()))?;
        let builder = self
            .builders
            .get(class)
            .ok_or_else(|| anyhow!("Unsupported component class: {}", class))?;
        builder(ctx)
    }
}

// =============================================================================
// Registry
// =============================================================================

enum Slot<I> {
    Component(Arc<I>),
    Internal { owner: usize, handle: ChildHandle },
    Released,
}

struct RegistryEntry<I> {
    name: String,
    role: Option<String>,
    slot: Slot<I>,
}

struct RegistryInner<I> {
    entries: Vec<RegistryEntry<I>>,
    by_name: HashMap<String, usize>,
    by_role: BTreeMap<String, Vec<usize>>,
}

/// Created components, looked up by name or role.
///
/// Names are write-once. Registration is serialized so concurrent creation
/// of independent components can register safely.
pub struct InstanceRegistry<I> {
    inner: Mutex<RegistryInner<I>>,
    role_policy: RolePolicy,
}

impl<I> std::fmt::Debug for InstanceRegistry<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("components", &self.creation_order())
            .field("role_policy", &self.role_policy)
            .finish()
    }
}

impl<I> InstanceRegistry<I> {
    pub fn new(role_policy: RolePolicy) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                entries: Vec::new(),
                by_name: HashMap::new(),
                by_role: BTreeMap::new(),
            }),
            role_policy,
        }
    }

    /// Register a factory-created component.
    pub fn register_component(
        &self,
        name: &str,
        role: Option<&str>,
        instance: Arc<I>,
    ) -> ResolveResult<()> {
        self.insert(name, role, Slot::Component(instance))
    }

    /// Register an internal child of an already registered owner.
    pub fn register_internal(
        &self,
        name: &str,
        role: Option<&str>,
        owner: &str,
        handle: ChildHandle,
    ) -> ResolveResult<()> {
        let owner_index = self
            .inner
            .lock()
            .by_name
            .get(owner)
            .copied()
            .ok_or_else(|| ResolveError::UnresolvedReference {
                referrer: name.to_string(),
                missing: owner.to_string(),
            })?;
        self.insert(
            name,
            role,
            Slot::Internal {
                owner: owner_index,
                handle,
            },
        )
    }

    fn insert(&self, name: &str, role: Option<&str>, slot: Slot<I>) -> ResolveResult<()> {
        let mut inner = self.inner.lock();
        if inner.by_name.contains_key(name) {
            return Err(ResolveError::DuplicateName(name.to_string()));
        }
        if let (Some(role), RolePolicy::Unique) = (role, self.role_policy) {
            if let Some(&first) = inner.by_role.get(role).and_then(|holders| holders.first()) {
                return Err(ResolveError::DuplicateRole {
                    role: role.to_string(),
                    first: inner.entries[first].name.clone(),
                    second: name.to_string(),
                });
            }
        }

        let index = inner.entries.len();
        inner.entries.push(RegistryEntry {
            name: name.to_string(),
            role: role.map(str::to_string),
            slot,
        });
        inner.by_name.insert(name.to_string(), index);
        if let Some(role) = role {
            inner.by_role.entry(role.to_string()).or_default().push(index);
        }
        Ok(())
    }

    fn lookup_index(inner: &RegistryInner<I>, index: usize) -> Option<Lookup<I>> {
        let entry = inner.entries.get(index)?;
        match &entry.slot {
            Slot::Component(instance) => Some(Lookup::Component(Arc::clone(instance))),
            Slot::Internal { owner, handle } => {
                let owner_entry = inner.entries.get(*owner)?;
                match &owner_entry.slot {
                    Slot::Component(instance) => Some(Lookup::Internal {
                        owner: Arc::clone(instance),
                        owner_name: owner_entry.name.clone(),
                        handle: *handle,
                    }),
                    _ => None,
                }
            }
            Slot::Released => None,
        }
    }

    pub fn get(&self, name: &str) -> Option<Lookup<I>> {
        let inner = self.inner.lock();
        let index = *inner.by_name.get(name)?;
        Self::lookup_index(&inner, index)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Every live component holding `role`, in creation order.
    pub fn by_role(&self, role: &str) -> Vec<Lookup<I>> {
        let inner = self.inner.lock();
        inner
            .by_role
            .get(role)
            .into_iter()
            .flatten()
            .filter_map(|&index| Self::lookup_index(&inner, index))
            .collect()
    }

    /// First component holding `role`.
    pub fn find_by_role(&self, role: &str) -> Option<Lookup<I>> {
        self.by_role(role).into_iter().next()
    }

    pub fn names_for_role(&self, role: &str) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .by_role
            .get(role)
            .into_iter()
            .flatten()
            .map(|&index| inner.entries[index].name.clone())
            .collect()
    }

    pub fn role_of(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock();
        let index = *inner.by_name.get(name)?;
        inner.entries[index].role.clone()
    }

    /// Names of registered components, in creation order.
    pub fn creation_order(&self) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Number of live components.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|entry| !matches!(entry.slot, Slot::Released))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear every component down in reverse creation order.
    ///
    /// Internal children are released with their owner. Calling this again
    /// has no effect.
    pub fn shutdown<F>(&self, factory: &F) -> ResolveResult<()>
    where
        F: ComponentFactory<Instance = I> + ?Sized,
    {
        let released: Vec<(String, Arc<I>)> = {
            let mut inner = self.inner.lock();
            let mut released = Vec::new();
            for entry in inner.entries.iter_mut().rev() {
                match std::mem::replace(&mut entry.slot, Slot::Released) {
                    Slot::Component(instance) => released.push((entry.name.clone(), instance)),
                    Slot::Internal { .. } | Slot::Released => {}
                }
            }
            released
        };

        let mut errors = Vec::new();
        for (name, instance) in released {
            debug!(component = %name, "Tearing down component");
            if let Err(source) = factory.teardown(&name, &instance) {
                error!(component = %name, error = %source, "Teardown failed");
                errors.push(ResolveError::Teardown { name, source });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ResolveError::ShutdownFailed(errors))
        }
    }
}

// =============================================================================
// Instantiator
// =============================================================================

/// Creates the components of a validated model in dependency order.
pub struct Instantiator<'a> {
    graph: &'a DependencyGraph,
    store: &'a DeclarationStore,
    role_policy: RolePolicy,
}

impl<'a> Instantiator<'a> {
    pub fn new(graph: &'a DependencyGraph, store: &'a DeclarationStore) -> Self {
        Self {
            graph,
            store,
            role_policy: RolePolicy::Unique,
        }
    }

    pub fn with_role_policy(mut self, role_policy: RolePolicy) -> Self {
        self.role_policy = role_policy;
        self
    }

    /// Creation order: Kahn's algorithm, smallest ready name first.
    ///
    /// Fails with the components left over if the graph has a cycle.
    pub fn order(&self) -> ResolveResult<Vec<String>> {
        let mut in_degree = self.in_degrees();
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            for dependent in self.graph.dependents_of(name) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        self.check_complete(&order, &in_degree)?;
        Ok(order)
    }

    /// Creation layers: every component of a layer depends only on earlier
    /// layers. Names within a layer are sorted.
    pub fn layers(&self) -> ResolveResult<Vec<Vec<String>>> {
        let mut in_degree = self.in_degrees();
        let mut layer: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut layers = Vec::new();
        let mut visited = Vec::new();
        while !layer.is_empty() {
            let mut next = BTreeSet::new();
            for &name in &layer {
                for dependent in self.graph.dependents_of(name) {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(dependent);
                        }
                    }
                }
            }
            visited.extend(layer.iter().map(|name| name.to_string()));
            layers.push(layer.iter().map(|name| name.to_string()).collect());
            layer = next.into_iter().collect();
        }

        self.check_complete(&visited, &in_degree)?;
        Ok(layers)
    }

    /// In-degree of every declared component, counting only edges between
    /// declared components.
    fn in_degrees(&self) -> BTreeMap<&'a str, usize> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .graph
            .nodes()
            .iter()
            .map(|name| (name.as_str(), 0))
            .collect();
        for name in self.graph.nodes() {
            for dependent in self.graph.dependents_of(name) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree += 1;
                }
            }
        }
        in_degree
    }

    /// Fail when Kahn's walk stalled, naming the members of the first cycle.
    /// Components that only depend on a cycle are not part of it.
    fn check_complete(&self, visited: &[String], in_degree: &BTreeMap<&str, usize>) -> ResolveResult<()> {
        if visited.len() == in_degree.len() {
            return Ok(());
        }
        if let Some(cycle) = validate::find_cycles(self.graph).into_iter().next() {
            return Err(ResolveError::CyclicDependency(cycle));
        }
        let visited: BTreeSet<&str> = visited.iter().map(String::as_str).collect();
        let remaining = in_degree
            .keys()
            .filter(|name| !visited.contains(*name))
            .map(|name| name.to_string())
            .collect();
        Err(ResolveError::CyclicDependency(remaining))
    }

    /// Refuse graphs with cycles or dangling references before creating
    /// anything. Roles are checked at registration instead.
    fn precheck(&self) -> ResolveResult<()> {
        validate::validate(self.graph, self.store, RolePolicy::Shared)?;
        Ok(())
    }

    /// Create every component sequentially, in [`order`](Self::order).
    pub fn instantiate<F>(&self, factory: &F) -> ResolveResult<InstanceRegistry<F::Instance>>
    where
        F: ComponentFactory + ?Sized,
    {
        self.precheck()?;
        let order = self.order()?;
        let registry = InstanceRegistry::new(self.role_policy);

        for name in &order {
            let prepared = self.declaration(name).and_then(|decl| {
                if decl.is_internal() {
                    self.register_internal(&registry, decl).map(|()| None)
                } else {
                    self.context(decl, &registry).map(|ctx| Some((decl, ctx)))
                }
            });
            let (decl, ctx) = match prepared {
                Ok(Some(step)) => step,
                Ok(None) => continue,
                Err(err) => {
                    unwind(&registry, factory);
                    return Err(err);
                }
            };

            let instance = match factory.create(ctx) {
                Ok(instance) => Arc::new(instance),
                Err(source) => {
                    error!(component = %name, error = %source, "Component creation failed");
                    unwind(&registry, factory);
                    return Err(ResolveError::Factory {
                        name: name.clone(),
                        source,
                    });
                }
            };

            if let Err(err) = registry.register_component(name, decl.role.as_deref(), Arc::clone(&instance)) {
                release_unregistered(factory, name, &instance);
                unwind(&registry, factory);
                return Err(err);
            }
            debug!(component = %name, class = ?decl.class, "Created component");
        }

        info!(components = registry.len(), "Instantiated model");
        Ok(registry)
    }

    /// Create components layer by layer, building the members of a layer on
    /// scoped threads.
    ///
    /// Registration follows layer order and, within a layer, name order. If
    /// any member of a layer fails, its successful siblings and every earlier
    /// layer are torn down and the failure of the smallest name is returned.
    pub fn instantiate_layered<F>(&self, factory: &F) -> ResolveResult<InstanceRegistry<F::Instance>>
    where
        F: ComponentFactory + Sync + ?Sized,
        F::Instance: Send + Sync,
    {
        self.precheck()?;
        let layers = self.layers()?;
        let registry = InstanceRegistry::new(self.role_policy);

        for layer in &layers {
            let mut pending = Vec::new();
            for name in layer {
                let prepared = self.declaration(name).and_then(|decl| {
                    if decl.is_internal() {
                        self.register_internal(&registry, decl).map(|()| None)
                    } else {
                        self.context(decl, &registry).map(|ctx| Some((decl, ctx)))
                    }
                });
                match prepared {
                    Ok(Some((decl, ctx))) => pending.push((name.as_str(), decl, ctx)),
                    Ok(None) => {}
                    Err(err) => {
                        unwind(&registry, factory);
                        return Err(err);
                    }
                }
            }

            let results: Vec<(&str, &ComponentDeclaration, anyhow::Result<F::Instance>)> =
                std::thread::scope(|scope| {
                    let handles: Vec<_> = pending
                        .into_iter()
                        .map(|(name, decl, ctx)| (name, decl, scope.spawn(move || factory.create(ctx))))
                        .collect();
                    handles
                        .into_iter()
                        .map(|(name, decl, handle)| {
                            let result = handle
                                .join()
                                .unwrap_or_else(|_| Err(anyhow!("factory panicked")));
                            (name, decl, result)
                        })
                        .collect()
                });

            let mut created = Vec::new();
            let mut failure = None;
            for (name, decl, result) in results {
                match result {
                    Ok(instance) => created.push((name, decl, Arc::new(instance))),
                    Err(source) if failure.is_none() => {
                        error!(component = %name, error = %source, "Component creation failed");
                        failure = Some(ResolveError::Factory {
                            name: name.to_string(),
                            source,
                        });
                    }
                    Err(source) => {
                        warn!(component = %name, error = %source, "Component creation failed");
                    }
                }
            }

            if let Some(err) = failure {
                for (name, _, instance) in created.iter().rev() {
                    release_unregistered(factory, name, instance);
                }
                unwind(&registry, factory);
                return Err(err);
            }

            let mut created = created.into_iter();
            while let Some((name, decl, instance)) = created.next() {
                if let Err(err) = registry.register_component(name, decl.role.as_deref(), Arc::clone(&instance)) {
                    let rest: Vec<_> = created.collect();
                    for (rest_name, _, rest_instance) in rest.iter().rev() {
                        release_unregistered(factory, rest_name, rest_instance);
                    }
                    release_unregistered(factory, name, &instance);
                    unwind(&registry, factory);
                    return Err(err);
                }
                debug!(component = %name, class = ?decl.class, "Created component");
            }
        }

        info!(
            components = registry.len(),
            layers = layers.len(),
            "Instantiated model"
        );
        Ok(registry)
    }

    fn declaration(&self, name: &str) -> ResolveResult<&'a ComponentDeclaration> {
        self.store
            .get(name)
            .ok_or_else(|| ResolveError::MalformedDeclaration {
                name: name.to_string(),
                reason: "present in the graph but not in the store".to_string(),
            })
    }

    fn register_internal<I>(&self, registry: &InstanceRegistry<I>, decl: &ComponentDeclaration) -> ResolveResult<()> {
        let (owner, handle) =
            self.store
                .child_handle(&decl.name)
                .ok_or_else(|| ResolveError::MalformedDeclaration {
                    name: decl.name.clone(),
                    reason: "internal child without an owner".to_string(),
                })?;
        registry.register_internal(&decl.name, decl.role.as_deref(), owner, handle)
    }

    fn context<I>(
        &self,
        decl: &'a ComponentDeclaration,
        registry: &InstanceRegistry<I>,
    ) -> ResolveResult<CreateContext<'a, I>> {
        let resolve = |name: &str| {
            registry
                .get(name)
                .ok_or_else(|| ResolveError::UnresolvedReference {
                    referrer: decl.name.clone(),
                    missing: name.to_string(),
                })
        };

        let mut children = BTreeMap::new();
        for (slot, child_name) in &decl.children {
            let binding = match self.store.child_handle(child_name) {
                Some((owner, handle)) if owner == decl.name => {
                    let declaration = self.declaration(child_name)?;
                    let dependencies = declaration
                        .dependencies
                        .iter()
                        .filter_map(|(dep_slot, dep)| {
                            registry.get(dep).map(|lookup| (dep_slot.clone(), lookup))
                        })
                        .collect();
                    ChildBinding::Internal {
                        declaration,
                        handle,
                        dependencies,
                    }
                }
                _ => ChildBinding::Created(resolve(child_name)?),
            };
            children.insert(slot.clone(), binding);
        }

        let mut dependencies = BTreeMap::new();
        for (slot, dep) in &decl.dependencies {
            dependencies.insert(slot.clone(), resolve(dep)?);
        }

        Ok(CreateContext {
            declaration: decl,
            children,
            dependencies,
        })
    }
}

fn unwind<F>(registry: &InstanceRegistry<F::Instance>, factory: &F)
where
    F: ComponentFactory + ?Sized,
{
    let created = registry.len();
    if created > 0 {
        warn!(components = created, "Tearing down partially instantiated model");
    }
    if let Err(err) = registry.shutdown(factory) {
        error!(error = %err, "Errors while unwinding instantiation");
    }
}

fn release_unregistered<F>(factory: &F, name: &str, instance: &F::Instance)
where
    F: ComponentFactory + ?Sized,
{
    if let Err(err) = factory.teardown(name, instance) {
        error!(component = %name, error = %err, "Teardown failed");
    }
}
