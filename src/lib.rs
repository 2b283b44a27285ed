//! Component-graph resolver for declarative microscope models.
//!
//! A model file declares the hardware components of an instrument: their
//! class, role, init parameters, properties, the children they own, the
//! components they depend on and the components whose data they affect. This
//! crate turns such a model into live objects:
//!
//! 1. [`store`] flattens inline children and checks each declaration.
//! 2. [`graph`] derives "must exist before" edges.
//! 3. [`validate`] reports every cycle, dangling reference and shared role.
//! 4. [`instantiate`] creates components in dependency order through a
//!    pluggable [`ComponentFactory`], unwinding on failure.
//! 5. [`affects`] indexes the informational `affects` relation.
//!
//! [`Resolver`] chains all of the above for one model.
//!
//! ```rust,ignore
//! let resolver = Resolver::new(ResolverConfig::load()?);
//! let resolution = resolver.resolve_yaml(&std::fs::read_to_string("sparc-sim.yaml")?, &catalog)?;
//! let ccd = resolution.registry.find_by_role("ccd");
//! ```

pub mod affects;
pub mod config;
pub mod declaration;
pub mod error;
pub mod graph;
pub mod instantiate;
pub mod logging;
pub mod overrides;
pub mod resolver;
pub mod store;
pub mod validate;
pub mod value;

pub use affects::AffectIndex;
pub use config::{ResolverConfig, RolePolicy};
pub use declaration::{ChildHandle, ComponentDeclaration, RawDeclaration};
pub use error::{ResolveError, ResolveResult, ValidationErrors};
pub use graph::DependencyGraph;
pub use instantiate::{
    ChildBinding, ComponentFactory, CreateContext, FactoryCatalog, InstanceRegistry, Instantiator,
    Lookup,
};
pub use overrides::PropertyOverride;
pub use resolver::{Plan, Resolution, Resolver};
pub use store::DeclarationStore;
pub use value::Value;
