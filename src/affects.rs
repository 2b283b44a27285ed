//! Affect relations between components.
//!
//! `affects` records that a state change in one component may invalidate
//! data produced by another: when a stage moves, images already acquired by
//! the cameras it affects are stale. The relation carries no ownership and no
//! ordering; it is only looked up by consumers after resolution.

use crate::error::{ResolveError, ValidationErrors};
use crate::store::DeclarationStore;
use std::collections::{BTreeMap, BTreeSet};

/// Both directions of the `affects` relation of one model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AffectIndex {
    affects: BTreeMap<String, BTreeSet<String>>,
    affected_by: BTreeMap<String, BTreeSet<String>>,
}

impl AffectIndex {
    /// Index every `affects` entry of the store. Targets that are not
    /// declared are reported as unresolved references.
    pub fn build(store: &DeclarationStore) -> Result<Self, ValidationErrors> {
        unresolved_targets(store).into_result(())?;

        let mut index = AffectIndex::default();
        for decl in store.iter() {
            for target in &decl.affects {
                index
                    .affects
                    .entry(decl.name.clone())
                    .or_default()
                    .insert(target.clone());
                index
                    .affected_by
                    .entry(target.clone())
                    .or_default()
                    .insert(decl.name.clone());
            }
        }
        Ok(index)
    }

    /// Components whose cached data is invalidated when `name` changes.
    pub fn affects(&self, name: &str) -> BTreeSet<String> {
        self.affects.get(name).cloned().unwrap_or_default()
    }

    /// Components whose changes invalidate data from `name`.
    pub fn affected_by(&self, name: &str) -> BTreeSet<String> {
        self.affected_by.get(name).cloned().unwrap_or_default()
    }

    /// Number of distinct `(source, target)` pairs.
    pub fn len(&self) -> usize {
        self.affects.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.affects.is_empty()
    }
}

/// Every `affects` entry naming an undeclared component.
pub(crate) fn unresolved_targets(store: &DeclarationStore) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    for decl in store.iter() {
        let mut reported = BTreeSet::new();
        for target in &decl.affects {
            if !store.contains(target) && reported.insert(target) {
                errors.push(ResolveError::UnresolvedReference {
                    referrer: decl.name.clone(),
                    missing: target.clone(),
                });
            }
        }
    }
    errors
}
