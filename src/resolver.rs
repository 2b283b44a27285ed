//! One-call resolution pipeline.
//!
//! [`Resolver`] runs load, graph construction, validation, affect indexing
//! and instantiation for one model. Structural problems from every stage
//! before instantiation are gathered into a single
//! [`ResolveError::Invalid`], so a user fixing a model file sees all of them
//! at once. Each run owns its store and registry; nothing is shared between
//! runs.

use crate::affects::AffectIndex;
use crate::config::ResolverConfig;
use crate::declaration::RawDeclaration;
use crate::error::{ResolveError, ResolveResult};
use crate::graph::DependencyGraph;
use crate::instantiate::{ComponentFactory, InstanceRegistry, Instantiator};
use crate::overrides::{self, PropertyOverride};
use crate::store::{self, DeclarationStore};
use crate::validate;
use std::path::Path;
use tracing::{info, info_span};

/// A validated model, ready to instantiate.
#[derive(Debug, Clone)]
pub struct Plan {
    pub store: DeclarationStore,
    pub graph: DependencyGraph,
    pub affects: AffectIndex,
    /// Sequential creation order.
    pub order: Vec<String>,
    /// Groups of components that can be created concurrently.
    pub layers: Vec<Vec<String>>,
}

/// A fully instantiated model.
#[derive(Debug)]
pub struct Resolution<I> {
    pub plan: Plan,
    pub registry: InstanceRegistry<I>,
}

impl<I> Resolution<I> {
    /// Tear every instance down in reverse creation order.
    pub fn shutdown<F>(&self, factory: &F) -> ResolveResult<()>
    where
        F: ComponentFactory<Instance = I> + ?Sized,
    {
        self.registry.shutdown(factory)
    }
}

/// Drives a model from raw declarations to live instances.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    config: ResolverConfig,
    overrides: Vec<PropertyOverride>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            overrides: Vec::new(),
        }
    }

    /// Property overrides applied to the raw declarations before loading.
    pub fn with_overrides(mut self, overrides: Vec<PropertyOverride>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Load and validate a model without creating anything.
    pub fn plan(&self, mut entries: Vec<(String, RawDeclaration)>) -> ResolveResult<Plan> {
        let _span = info_span!("plan", components = entries.len()).entered();

        if !self.overrides.is_empty() {
            overrides::apply_overrides(&mut entries, &self.overrides)?;
        }

        let (store, mut errors) = DeclarationStore::load_collecting(entries, &self.config.root_classes);
        let (graph, graph_errors) = DependencyGraph::build_collecting(&store);
        errors.extend(graph_errors);
        if let Err(validation) = validate::validate(&graph, &store, self.config.role_policy) {
            errors.extend(validation);
        }
        if !errors.is_empty() {
            return Err(ResolveError::Invalid(errors));
        }

        let affects = AffectIndex::build(&store)?;
        let instantiator = Instantiator::new(&graph, &store);
        let order = instantiator.order()?;
        let layers = instantiator.layers()?;

        info!(
            components = store.len(),
            edges = graph.edge_count(),
            affects = affects.len(),
            layers = layers.len(),
            "Model validated"
        );
        Ok(Plan {
            store,
            graph,
            affects,
            order,
            layers,
        })
    }

    /// Parse a YAML document and plan it.
    pub fn plan_yaml(&self, yaml: &str) -> ResolveResult<Plan> {
        self.plan(store::parse_entries(yaml)?)
    }

    /// Read a YAML model file and plan it.
    pub fn plan_path<P: AsRef<Path>>(&self, path: P) -> ResolveResult<Plan> {
        let text = std::fs::read_to_string(path)?;
        self.plan_yaml(&text)
    }

    /// Validate the model and create every component.
    ///
    /// With `parallel` set in the configuration, the members of each layer
    /// are created concurrently.
    pub fn resolve<F>(
        &self,
        entries: Vec<(String, RawDeclaration)>,
        factory: &F,
    ) -> ResolveResult<Resolution<F::Instance>>
    where
        F: ComponentFactory + Sync + ?Sized,
        F::Instance: Send + Sync,
    {
        let plan = self.plan(entries)?;
        let _span = info_span!("instantiate", parallel = self.config.parallel).entered();

        let instantiator =
            Instantiator::new(&plan.graph, &plan.store).with_role_policy(self.config.role_policy);
        let registry = if self.config.parallel {
            instantiator.instantiate_layered(factory)?
        } else {
            instantiator.instantiate(factory)?
        };
        Ok(Resolution { plan, registry })
    }

    /// Parse a YAML document and resolve it.
    pub fn resolve_yaml<F>(&self, yaml: &str, factory: &F) -> ResolveResult<Resolution<F::Instance>>
    where
        F: ComponentFactory + Sync + ?Sized,
        F::Instance: Send + Sync,
    {
        self.resolve(store::parse_entries(yaml)?, factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RolePolicy;
    use crate::instantiate::CreateContext;
    use tracing_test::traced_test;

    struct Names;

    impl ComponentFactory for Names {
        type Instance = String;

        fn create(&self, ctx: CreateContext<'_, String>) -> anyhow::Result<String> {
            Ok(ctx.name().to_string())
        }
    }

    const SPARC: &str = r#"
SPARC:
  class: Microscope
  role: sparc
  children: ["Andor SimCam", "Spectrometer", "MirrorMover"]
Andor SimCam:
  class: andorcam2.FakeAndorCam2
  role: ccd
  init: {device: 0}
  properties: {exposureTime: 0.1}
MirrorMover:
  class: pigcs.FakeBus
  role: mirror
  affects: ["Andor SimCam"]
Spectrometer:
  class: spectrometer.CompositedSpectrometer
  role: spectrometer
  children: {detector: "Andor SimCam"}
  dependencies: {stage: "MirrorMover"}
"#;

    #[test]
    fn test_plan_sparc() {
        let plan = Resolver::default().plan_yaml(SPARC).unwrap();

        assert_eq!(
            plan.order,
            vec!["Andor SimCam", "MirrorMover", "Spectrometer", "SPARC"]
        );
        assert_eq!(
            plan.layers,
            vec![
                vec!["Andor SimCam", "MirrorMover"],
                vec!["Spectrometer"],
                vec!["SPARC"],
            ]
        );
        assert!(plan.affects.affected_by("Andor SimCam").contains("MirrorMover"));
    }

    #[test]
    fn test_resolve_sequential_and_parallel_agree() {
        let sequential = Resolver::default().resolve_yaml(SPARC, &Names).unwrap();
        let parallel = Resolver::new(ResolverConfig {
            parallel: true,
            ..Default::default()
        })
        .resolve_yaml(SPARC, &Names)
        .unwrap();

        assert_eq!(
            sequential.registry.creation_order(),
            parallel.registry.creation_order()
        );
        assert_eq!(sequential.registry.len(), 4);
        sequential.shutdown(&Names).unwrap();
        assert!(sequential.registry.is_empty());
    }

    #[test]
    fn test_errors_from_every_stage_surface_together() {
        let yaml = r#"
"Orphan": {role: lost}
"A": {class: x, dependencies: {b: "B"}}
"B": {class: x, dependencies: {a: "A"}}
"Self": {class: x, dependencies: {me: "Self"}}
"#;
        let err = Resolver::default().plan_yaml(yaml).unwrap_err();
        let errors = match err {
            ResolveError::Invalid(errors) => errors,
            other => panic!("expected collected errors, got {:?}", other),
        };

        assert!(errors
            .iter()
            .any(|e| matches!(e, ResolveError::MalformedDeclaration { name, .. } if name == "Orphan")));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ResolveError::SelfDependency(name) if name == "Self")));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ResolveError::CyclicDependency(names) if names == &["A", "B"])));
    }

    #[test]
    fn test_overrides_applied_before_load() {
        let resolver = Resolver::default()
            .with_overrides(vec!["Andor SimCam.exposureTime=0.5".parse().unwrap()]);
        let plan = resolver.plan_yaml(SPARC).unwrap();
        let cam = plan.store.get("Andor SimCam").unwrap();
        assert_eq!(cam.properties["exposureTime"].as_f64(), Some(0.5));
    }

    #[test]
    fn test_shared_roles_policy() {
        let yaml = r#"
"Cam1": {class: x, role: ccd}
"Cam2": {class: x, role: ccd}
"#;
        assert!(Resolver::default().plan_yaml(yaml).is_err());

        let resolver = Resolver::new(ResolverConfig {
            role_policy: RolePolicy::Shared,
            ..Default::default()
        });
        let resolution = resolver.resolve_yaml(yaml, &Names).unwrap();
        assert_eq!(resolution.registry.by_role("ccd").len(), 2);
    }

    #[traced_test]
    #[test]
    fn test_pipeline_logs_progress() {
        Resolver::default().resolve_yaml(SPARC, &Names).unwrap();
        assert!(logs_contain("Model validated"));
        assert!(logs_contain("Instantiated model"));
    }
}
