//! Component declarations.
//!
//! A model document maps component names to [`RawDeclaration`]s as written by
//! the user. Loading them into a [`DeclarationStore`](crate::store::DeclarationStore)
//! flattens inline children and records ownership, producing one immutable
//! [`ComponentDeclaration`] per component.
//!
//! ```yaml
//! "SPARC": {
//!     class: Microscope,
//!     role: sparc,
//!     children: ["Andor SimCam", "Spectrometer"],
//! }
//! "Spectrometer": {
//!     class: spectrometer.CompositedSpectrometer,
//!     role: spectrometer,
//!     children: {detector: "Andor SimCam", spectrograph: "SpecSim"},
//!     dependencies: {stage: "MirrorMover"},
//!     affects: ["Andor SimCam"],
//! }
//! ```

use crate::value::ValueMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declaration fields exactly as they appear in a parsed model document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDeclaration {
    /// Explicit name, only meaningful for inline children.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub init: ValueMap,
    #[serde(default)]
    pub metadata: ValueMap,
    #[serde(default)]
    pub properties: ValueMap,
    #[serde(default)]
    pub children: RawChildren,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub affects: Vec<String>,
}

/// The two accepted shapes of a `children` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawChildren {
    /// Slot name to child, the usual form.
    Slots(BTreeMap<String, RawChild>),
    /// Plain list of component names; each name is also its slot.
    Names(Vec<String>),
}

impl Default for RawChildren {
    fn default() -> Self {
        RawChildren::Slots(BTreeMap::new())
    }
}

/// A child slot either names another declaration or nests one inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawChild {
    Name(String),
    Inline(Box<RawDeclaration>),
}

impl RawDeclaration {
    /// Declaration with only a class set.
    pub fn with_class(class: impl Into<String>) -> Self {
        Self {
            class: Some(class.into()),
            ..Default::default()
        }
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn child(mut self, slot: impl Into<String>, name: impl Into<String>) -> Self {
        let child = RawChild::Name(name.into());
        match &mut self.children {
            RawChildren::Slots(slots) => {
                slots.insert(slot.into(), child);
            }
            RawChildren::Names(names) => {
                let mut slots: BTreeMap<String, RawChild> = names
                    .drain(..)
                    .map(|n| (n.clone(), RawChild::Name(n)))
                    .collect();
                slots.insert(slot.into(), child);
                self.children = RawChildren::Slots(slots);
            }
        }
        self
    }

    pub fn inline_child(mut self, slot: impl Into<String>, child: RawDeclaration) -> Self {
        if let RawChildren::Names(names) = &mut self.children {
            let slots = names
                .drain(..)
                .map(|n| (n.clone(), RawChild::Name(n)))
                .collect();
            self.children = RawChildren::Slots(slots);
        }
        if let RawChildren::Slots(slots) = &mut self.children {
            slots.insert(slot.into(), RawChild::Inline(Box::new(child)));
        }
        self
    }

    pub fn dependency(mut self, slot: impl Into<String>, name: impl Into<String>) -> Self {
        self.dependencies.insert(slot.into(), name.into());
        self
    }

    pub fn affects(mut self, name: impl Into<String>) -> Self {
        self.affects.push(name.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<crate::value::Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn init(mut self, name: impl Into<String>, value: impl Into<crate::value::Value>) -> Self {
        self.init.insert(name.into(), value.into());
        self
    }
}

/// Index of an internal child inside its owner's storage.
///
/// Internal children are numbered in the owner's slot order, counting only
/// class-less children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildHandle(pub(crate) usize);

impl ChildHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One component of a loaded model. Immutable once the store is built.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDeclaration {
    pub name: String,
    /// Implementation class; `None` for internal children.
    pub class: Option<String>,
    pub role: Option<String>,
    pub init: ValueMap,
    pub metadata: ValueMap,
    pub properties: ValueMap,
    /// Slot name to child component name. Inline children appear here under
    /// their flattened name.
    pub children: BTreeMap<String, String>,
    pub dependencies: BTreeMap<String, String>,
    pub affects: Vec<String>,
    /// Component declaring this one as a child, if any.
    pub owner: Option<String>,
}

impl ComponentDeclaration {
    /// Internal children have no class of their own and are built by their owner.
    pub fn is_internal(&self) -> bool {
        self.class.is_none()
    }

    /// Children and dependencies, as `(slot, referenced name)` pairs.
    pub fn requirements(&self) -> impl Iterator<Item = (&str, &str)> {
        self.children
            .iter()
            .chain(self.dependencies.iter())
            .map(|(slot, name)| (slot.as_str(), name.as_str()))
    }

    pub(crate) fn from_raw(name: String, raw: RawDeclaration, children: BTreeMap<String, String>) -> Self {
        Self {
            name,
            class: raw.class,
            role: raw.role,
            init: raw.init,
            metadata: raw.metadata,
            properties: raw.properties,
            children,
            dependencies: raw.dependencies,
            affects: raw.affects,
            owner: None,
        }
    }
}
