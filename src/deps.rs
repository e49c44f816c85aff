//! Dependency tracking for the sandbox's `node_modules`.
//!
//! Keeps the set of package names already installed in the current instance
//! and computes what an incoming `package.json` still needs.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// The parts of `package.json` the session cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
}

impl PackageManifest {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).map_err(|e| anyhow::anyhow!("Invalid package.json: {e}"))
    }

    /// Every declared package name (runtime and dev), sorted.
    pub fn names(&self) -> BTreeSet<String> {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .cloned()
            .collect()
    }

    /// Declared range for `name`, runtime dependencies taking precedence.
    pub fn range_of(&self, name: &str) -> Option<&str> {
        self.dependencies
            .get(name)
            .or_else(|| self.dev_dependencies.get(name))
            .map(String::as_str)
    }

    /// `name@range` install spec, or the bare name when no range is declared.
    pub fn install_spec(&self, name: &str) -> String {
        match self.range_of(name) {
            Some(range) if !range.trim().is_empty() => format!("{name}@{range}"),
            _ => name.to_string(),
        }
    }
}

/// Package names known to be present in the current instance's `node_modules`.
#[derive(Debug, Clone, Default)]
pub struct InstalledDependencies {
    names: HashSet<String>,
}

impl InstalledDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Names declared by `manifest` that are not installed yet, sorted.
    pub fn diff(&self, manifest: &PackageManifest) -> Vec<String> {
        manifest
            .names()
            .into_iter()
            .filter(|name| !self.names.contains(name))
            .collect()
    }

    pub fn record_installed<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }
}

/// Parse `manifest_text` and return the names still missing from `installed`.
pub fn diff_dependencies(
    installed: &InstalledDependencies,
    manifest_text: &str,
) -> anyhow::Result<Vec<String>> {
    let manifest = PackageManifest::parse(manifest_text)?;
    Ok(installed.diff(&manifest))
}

/// How to bring `node_modules` in line with a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPlan {
    UpToDate,
    /// Add only these `name@range` specs.
    Incremental(Vec<String>),
    /// Run a clean full install of the manifest.
    Full,
}

impl InstallPlan {
    /// Large incremental adds are less reliable than a clean install, so
    /// anything above `threshold` new names becomes a full install.
    pub fn decide(missing: &[String], manifest: &PackageManifest, threshold: usize) -> Self {
        if missing.is_empty() {
            InstallPlan::UpToDate
        } else if missing.len() > threshold {
            InstallPlan::Full
        } else {
            InstallPlan::Incremental(
                missing
                    .iter()
                    .map(|name| manifest.install_spec(name))
                    .collect(),
            )
        }
    }
}
