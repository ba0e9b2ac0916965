//! Pack catalog: which packs exist, their published checksum, and what they depend on.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::integrity;

/// One published pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackDescriptor {
    pub name: String,
    /// CRC-32 of the whole archive as published, when known.
    #[serde(default)]
    pub archive_checksum: Option<u32>,
    /// Packs that must be mounted first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PackDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            archive_checksum: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_checksum(mut self, checksum: u32) -> Self {
        self.archive_checksum = Some(checksum);
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Published checksum names an empty archive: mount without a transfer.
    pub fn is_empty_pack(&self) -> bool {
        self.archive_checksum
            .is_some_and(integrity::is_empty_archive_checksum)
    }
}

/// Validated set of packs: unique names, known dependencies, no cycles.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    packs: BTreeMap<String, PackDescriptor>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = PackDescriptor>,
    ) -> Result<Self, CatalogError> {
        let mut packs = BTreeMap::new();
        for d in descriptors {
            if packs.contains_key(&d.name) {
                return Err(CatalogError::DuplicatePack(d.name));
            }
            packs.insert(d.name.clone(), d);
        }
        let catalog = Self { packs };
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        for d in self.packs.values() {
            for dep in &d.dependencies {
                if !self.packs.contains_key(dep) {
                    return Err(CatalogError::UnknownDependency {
                        pack: d.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        for name in self.packs.keys() {
            self.dependency_order(name)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PackDescriptor> {
        self.packs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PackDescriptor> {
        self.packs.values()
    }

    /// `name` and everything it depends on, dependencies first.
    pub fn dependency_order(&self, name: &str) -> Result<Vec<String>, CatalogError> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut visiting = Vec::new();
        self.visit(name, &mut visiting, &mut done, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        visiting: &mut Vec<String>,
        done: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<(), CatalogError> {
        if done.contains(name) {
            return Ok(());
        }
        if visiting.iter().any(|v| v == name) {
            return Err(CatalogError::DependencyCycle(name.to_string()));
        }
        let pack = self
            .packs
            .get(name)
            .ok_or_else(|| CatalogError::UnknownPack(name.to_string()))?;
        visiting.push(name.to_string());
        for dep in &pack.dependencies {
            self.visit(dep, visiting, done, order)?;
        }
        visiting.pop();
        done.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("pack {0} listed twice")]
    DuplicatePack(String),
    #[error("unknown pack {0}")]
    UnknownPack(String),
    #[error("pack {pack} depends on unknown pack {dependency}")]
    UnknownDependency { pack: String, dependency: String },
    #[error("dependency cycle through {0}")]
    DependencyCycle(String),
}
