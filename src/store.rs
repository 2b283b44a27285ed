//! Declaration store: the loaded, flattened model.
//!
//! Loading walks the document in order, lifts inline children out of their
//! parents, assigns every child its owner and checks the declaration-level
//! rules:
//!
//! - names are unique after flattening;
//! - a top-level component declares a `class`;
//! - a component whose class is a root class (by default `Microscope`)
//!   declares a `role`;
//! - a component is the child of at most one parent, not counting root
//!   components, which list the whole instrument;
//! - a class-less component is owned by a parent that has a class.
//!
//! Every violation is collected before `load` fails.

use crate::declaration::{ChildHandle, ComponentDeclaration, RawChild, RawChildren, RawDeclaration};
use crate::error::{ResolveError, ResolveResult, ValidationErrors};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Class of the component describing the whole instrument.
pub const DEFAULT_ROOT_CLASS: &str = "Microscope";

/// Immutable name → declaration mapping for one resolution run.
#[derive(Debug, Clone, Default)]
pub struct DeclarationStore {
    declarations: BTreeMap<String, ComponentDeclaration>,
}

impl DeclarationStore {
    /// Load declarations with the default root class.
    pub fn load<I>(entries: I) -> Result<Self, ValidationErrors>
    where
        I: IntoIterator<Item = (String, RawDeclaration)>,
    {
        Self::load_with_roots(entries, &[DEFAULT_ROOT_CLASS.to_string()])
    }

    /// Load declarations, requiring a role on every component whose class is
    /// listed in `root_classes`.
    pub fn load_with_roots<I>(entries: I, root_classes: &[String]) -> Result<Self, ValidationErrors>
    where
        I: IntoIterator<Item = (String, RawDeclaration)>,
    {
        let (store, errors) = Self::load_collecting(entries, root_classes);
        errors.into_result(store)
    }

    /// Build the store and return it together with every load error found.
    ///
    /// When names collide the first declaration is kept, so later passes can
    /// still report on the rest of the model.
    pub(crate) fn load_collecting<I>(entries: I, root_classes: &[String]) -> (Self, ValidationErrors)
    where
        I: IntoIterator<Item = (String, RawDeclaration)>,
    {
        let mut errors = ValidationErrors::new();
        let mut flat = Vec::new();
        for (name, raw) in entries {
            flatten(name, raw, None, &mut flat);
        }

        let mut declarations: BTreeMap<String, ComponentDeclaration> = BTreeMap::new();
        let mut inline_owner: BTreeMap<String, String> = BTreeMap::new();
        for (decl, owner) in flat {
            if declarations.contains_key(&decl.name) {
                errors.push(ResolveError::DuplicateName(decl.name.clone()));
                continue;
            }
            if let Some(owner) = owner {
                inline_owner.insert(decl.name.clone(), owner);
            }
            declarations.insert(decl.name.clone(), decl);
        }

        let is_root = |decl: &ComponentDeclaration| {
            decl.class
                .as_ref()
                .map(|class| root_classes.iter().any(|root| root == class))
                .unwrap_or(false)
        };

        // Ownership: who declares whom as a child. A root component lists the
        // whole instrument without owning it, except for its inline children.
        let mut claims: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for decl in declarations.values().filter(|decl| !is_root(*decl)) {
            for child in decl.children.values() {
                if child != &decl.name && declarations.contains_key(child) {
                    claims.entry(child.clone()).or_default().push(decl.name.clone());
                }
            }
        }
        for (child, parents) in &claims {
            if parents.len() > 1 {
                errors.push(ResolveError::MalformedDeclaration {
                    name: child.clone(),
                    reason: format!("claimed as a child by {}", parents.join(", ")),
                });
            }
        }
        for (child, parents) in claims {
            let owner = inline_owner.remove(&child).or_else(|| parents.into_iter().next());
            if let Some(decl) = declarations.get_mut(&child) {
                decl.owner = owner;
            }
        }
        // Inline children not claimed above sit under a root component,
        // which builds them all the same.
        for (child, owner) in inline_owner {
            if let Some(decl) = declarations.get_mut(&child) {
                decl.owner = Some(owner);
            }
        }

        for decl in declarations.values() {
            match &decl.owner {
                None if decl.class.is_none() => errors.push(ResolveError::MalformedDeclaration {
                    name: decl.name.clone(),
                    reason: "top-level component has no class".to_string(),
                }),
                Some(owner) if decl.class.is_none() => {
                    let owner_has_class = declarations
                        .get(owner)
                        .map(|o| o.class.is_some())
                        .unwrap_or(false);
                    if !owner_has_class {
                        errors.push(ResolveError::MalformedDeclaration {
                            name: decl.name.clone(),
                            reason: format!(
                                "internal child of '{}', which has no class to build it",
                                owner
                            ),
                        });
                    }
                }
                _ => {}
            }

            if is_root(decl) && decl.role.is_none() {
                errors.push(ResolveError::MalformedDeclaration {
                    name: decl.name.clone(),
                    reason: "root component must declare a role".to_string(),
                });
            }
        }

        debug!(
            components = declarations.len(),
            errors = errors.len(),
            "Loaded declarations"
        );
        (Self { declarations }, errors)
    }

    /// Parse a YAML model document and load it.
    pub fn from_yaml_str(yaml: &str) -> ResolveResult<Self> {
        Ok(Self::load(parse_entries(yaml)?)?)
    }

    /// Read and load a YAML model file.
    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> ResolveResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn get(&self, name: &str) -> Option<&ComponentDeclaration> {
        self.declarations.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.declarations.contains_key(name)
    }

    pub fn all_names(&self) -> BTreeSet<String> {
        self.declarations.keys().cloned().collect()
    }

    /// Declarations in lexical name order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentDeclaration> {
        self.declarations.values()
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Class-less children of `owner`, in slot order. The position in this
    /// list is the child's [`ChildHandle`].
    pub fn internal_children(&self, owner: &str) -> Vec<(&str, &ComponentDeclaration)> {
        let Some(parent) = self.declarations.get(owner) else {
            return Vec::new();
        };
        parent
            .children
            .iter()
            .filter_map(|(slot, name)| {
                self.declarations
                    .get(name)
                    .filter(|child| child.is_internal() && child.owner.as_deref() == Some(owner))
                    .map(|child| (slot.as_str(), child))
            })
            .collect()
    }

    /// Owner and handle of an internal child.
    pub fn child_handle(&self, name: &str) -> Option<(&str, ChildHandle)> {
        let decl = self.declarations.get(name)?;
        if !decl.is_internal() {
            return None;
        }
        let owner = decl.owner.as_deref()?;
        self.internal_children(owner)
            .iter()
            .position(|(_, child)| child.name == name)
            .map(|index| (owner, ChildHandle(index)))
    }
}

/// Split a YAML model document into `(name, declaration)` entries in document
/// order. Repeated names are kept so loading can report them.
pub fn parse_entries(yaml: &str) -> ResolveResult<Vec<(String, RawDeclaration)>> {
    let ModelEntries(entries) = serde_yaml::from_str(yaml)?;
    Ok(entries)
}

struct ModelEntries(Vec<(String, RawDeclaration)>);

impl<'de> Deserialize<'de> for ModelEntries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ModelEntriesVisitor;

        impl<'de> Visitor<'de> for ModelEntriesVisitor {
            type Value = ModelEntries;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a mapping of component names to declarations")
            }

            fn visit_unit<E>(self) -> Result<ModelEntries, E>
            where
                E: de::Error,
            {
                Ok(ModelEntries(Vec::new()))
            }

            fn visit_map<V>(self, mut map: V) -> Result<ModelEntries, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, RawDeclaration>()? {
                    entries.push(entry);
                }
                Ok(ModelEntries(entries))
            }
        }

        deserializer.deserialize_map(ModelEntriesVisitor)
    }
}

fn flatten(
    name: String,
    mut raw: RawDeclaration,
    owner: Option<String>,
    out: &mut Vec<(ComponentDeclaration, Option<String>)>,
) {
    let raw_children = std::mem::take(&mut raw.children);
    let mut children = BTreeMap::new();
    let mut nested = Vec::new();

    match raw_children {
        RawChildren::Names(names) => {
            for child in names {
                children.insert(child.clone(), child);
            }
        }
        RawChildren::Slots(slots) => {
            for (slot, child) in slots {
                match child {
                    RawChild::Name(child) => {
                        children.insert(slot, child);
                    }
                    RawChild::Inline(inline) => {
                        let child_name = inline
                            .name
                            .clone()
                            .unwrap_or_else(|| format!("{}.{}", name, slot));
                        children.insert(slot, child_name.clone());
                        nested.push((child_name, *inline));
                    }
                }
            }
        }
    }

    out.push((ComponentDeclaration::from_raw(name.clone(), raw, children), owner));
    for (child_name, inline) in nested {
        flatten(child_name, inline, Some(name.clone()), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, raw: RawDeclaration) -> (String, RawDeclaration) {
        (name.to_string(), raw)
    }

    #[test]
    fn test_load_and_lookup() {
        let store = DeclarationStore::load(vec![
            entry("Light", RawDeclaration::with_class("simulated.Light").role("light")),
            entry("Cam", RawDeclaration::with_class("andorcam2.FakeAndorCam2").role("ccd")),
        ])
        .unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(
            store.all_names(),
            BTreeSet::from(["Cam".to_string(), "Light".to_string()])
        );
        assert_eq!(store.get("Light").unwrap().role.as_deref(), Some("light"));
        assert!(store.get("Stage").is_none());
    }

    #[test]
    fn test_inline_children_are_flattened_and_owned() {
        let sem = RawDeclaration::with_class("phenom.SEM")
            .role("sem")
            .inline_child("scanner", RawDeclaration::default().role("e-beam"))
            .inline_child(
                "detector",
                RawDeclaration {
                    name: Some("SE Detector".into()),
                    role: Some("se-detector".into()),
                    ..Default::default()
                },
            );
        let store = DeclarationStore::load(vec![entry("SEM", sem)]).unwrap();

        let scanner = store.get("SEM.scanner").unwrap();
        assert!(scanner.is_internal());
        assert_eq!(scanner.owner.as_deref(), Some("SEM"));

        let detector = store.get("SE Detector").unwrap();
        assert_eq!(detector.owner.as_deref(), Some("SEM"));

        // Slot order: detector < scanner
        assert_eq!(store.child_handle("SE Detector"), Some(("SEM", ChildHandle(0))));
        assert_eq!(store.child_handle("SEM.scanner"), Some(("SEM", ChildHandle(1))));
        assert_eq!(store.child_handle("SEM"), None);
    }

    #[test]
    fn test_duplicate_after_flattening() {
        let sem = RawDeclaration::with_class("phenom.SEM").inline_child(
            "stage",
            RawDeclaration {
                name: Some("Stage".into()),
                ..Default::default()
            },
        );
        let errors = DeclarationStore::load(vec![
            entry("SEM", sem),
            entry("Stage", RawDeclaration::with_class("simulated.Stage")),
        ])
        .unwrap_err();

        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors.iter().next(),
            Some(ResolveError::DuplicateName(name)) if name == "Stage"
        ));
    }

    #[test]
    fn test_malformed_declarations_are_all_reported() {
        let errors = DeclarationStore::load(vec![
            entry("Scope", RawDeclaration::with_class("Microscope")),
            entry("Orphan", RawDeclaration::default().role("stage")),
            entry("A", RawDeclaration::with_class("x.A").child("c", "Shared")),
            entry("B", RawDeclaration::with_class("x.B").child("c", "Shared")),
            entry("Shared", RawDeclaration::with_class("x.Shared")),
        ])
        .unwrap_err();

        let names: Vec<_> = errors.iter().flat_map(|e| e.components()).collect();
        assert_eq!(errors.len(), 3);
        assert!(names.contains(&"Scope"));
        assert!(names.contains(&"Orphan"));
        assert!(names.contains(&"Shared"));
    }

    #[test]
    fn test_internal_child_of_internal_parent_is_malformed() {
        let parent = RawDeclaration::with_class("x.Parent").inline_child(
            "mid",
            RawDeclaration::default().inline_child("leaf", RawDeclaration::default()),
        );
        let errors = DeclarationStore::load(vec![entry("P", parent)]).unwrap_err();
        let names: Vec<_> = errors.iter().flat_map(|e| e.components()).collect();
        assert_eq!(names, vec!["P.mid.leaf"]);
    }

    #[test]
    fn test_custom_root_classes() {
        let entries = || vec![entry("Scope", RawDeclaration::with_class("Instrument"))];
        assert!(DeclarationStore::load(entries()).is_ok());
        assert!(DeclarationStore::load_with_roots(entries(), &["Instrument".to_string()]).is_err());
    }

    #[test]
    fn test_inline_children_of_root_are_owned() {
        let sparc = RawDeclaration::with_class("Microscope")
            .role("sparc")
            .inline_child("lens", RawDeclaration::default().role("lens"))
            .inline_child("stage", RawDeclaration::with_class("simulated.Stage").role("stage"));
        let store = DeclarationStore::load(vec![entry("SPARC", sparc)]).unwrap();

        let lens = store.get("SPARC.lens").unwrap();
        assert!(lens.is_internal());
        assert_eq!(lens.owner.as_deref(), Some("SPARC"));
        assert_eq!(store.child_handle("SPARC.lens"), Some(("SPARC", ChildHandle(0))));
        assert_eq!(store.get("SPARC.stage").unwrap().owner.as_deref(), Some("SPARC"));
    }

    #[test]
    fn test_repeated_yaml_name_is_a_duplicate() {
        let err = DeclarationStore::from_yaml_str(
            r#"
"Light": {class: simulated.Light, role: light}
"Cam": {class: andorcam2.FakeAndorCam2, role: ccd}
"Light": {class: simulated.Light, role: light2}
"#,
        )
        .unwrap_err();

        match &err {
            ResolveError::Invalid(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(
                    errors.iter().next(),
                    Some(ResolveError::DuplicateName(name)) if name == "Light"
                ));
            }
            other => panic!("expected collected errors, got {:?}", other),
        }
        assert_eq!(err.components(), vec!["Light"]);
    }

    #[test]
    fn test_parse_entries_keeps_document_order() {
        let entries = parse_entries("Zeta: {class: x}\nAlpha: {class: y}\n").unwrap();
        let names: Vec<_> = entries.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["Zeta", "Alpha"]);
    }

    #[test]
    fn test_from_yaml_str() {
        let store = DeclarationStore::from_yaml_str(
            r#"
"Optical Path": {class: Microscope, role: optical, children: ["Light", "Camera", "Spec"]}
"Light": {class: simulated.Light, role: light, affects: ["Camera"]}
"Camera": {class: andorcam2.FakeAndorCam2, role: ccd, init: {device: 0}}
"Spec": {class: spectrometer.CompositedSpectrometer, children: {detector: "Camera"}}
"#,
        )
        .unwrap();

        assert_eq!(store.len(), 4);
        let light = store.get("Light").unwrap();
        assert_eq!(light.owner, None);
        assert_eq!(light.affects, vec!["Camera".to_string()]);
        assert!(!light.is_internal());
        // Listed by the microscope too, but owned by the spectrometer.
        assert_eq!(store.get("Camera").unwrap().owner.as_deref(), Some("Spec"));
    }
}
