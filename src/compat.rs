//! Rewrites for known-incompatible project setups.
//!
//! The sandbox runs a pinned toolchain. A few upstream majors break it, so the
//! copy of a bundle that goes into the sandbox is patched by a fixed table of
//! `(detector, fix)` rules. The caller's bundle is never touched, and nothing
//! here tries to infer compatibility beyond the rules listed in [`RULES`].

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::bundle::FileBundle;
use crate::template;

const MANIFEST_PATH: &str = "package.json";
const DEP_SECTIONS: [&str; 2] = ["dependencies", "devDependencies"];

const TAILWIND_V3: &str = "^3.4.17";
const POSTCSS_RANGE: &str = "^8.4.49";
const AUTOPREFIXER_RANGE: &str = "^10.4.20";
const VITE_V5: &str = "^5.4.11";
const PLUGIN_REACT_V4: &str = "^4.3.4";

const POSTCSS_CONFIGS: &[&str] = &[
    "postcss.config.js",
    "postcss.config.cjs",
    "postcss.config.mjs",
    "postcss.config.ts",
];
const VITE_CONFIGS: &[&str] = &["vite.config.ts", "vite.config.js", "vite.config.mjs"];
const TAILWIND_CONFIGS: &[&str] = &[
    "tailwind.config.js",
    "tailwind.config.cjs",
    "tailwind.config.mjs",
    "tailwind.config.ts",
];

const TAILWIND_V3_DIRECTIVES: &str = "@tailwind base;\n@tailwind components;\n@tailwind utilities;";

static MAJOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\^|~|>=|>|=)?\s*v?(\d+)").expect("static version regex")
});

static CONFIG_LOADER_FLAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s+--configLoader(?:=|\s+)\S+").expect("static flag regex")
});

static TAILWIND_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"@import\s+["']tailwindcss["']\s*;"#).expect("static import regex")
});

/// Result of [`patch_bundle`].
#[derive(Debug)]
pub struct PatchOutcome<'a> {
    /// Borrowed when no rule applied.
    pub bundle: Cow<'a, FileBundle>,
    /// One human-readable line per change.
    pub fixes: Vec<String>,
}

impl PatchOutcome<'_> {
    pub fn is_patched(&self) -> bool {
        !self.fixes.is_empty()
    }
}

struct Patch {
    manifest: Map<String, Value>,
    files: FileBundle,
}

struct CompatRule {
    name: &'static str,
    applies: fn(&Map<String, Value>) -> bool,
    fix: fn(&mut Patch) -> Vec<String>,
}

/// Every rule the patcher knows, in application order.
const RULES: &[CompatRule] = &[
    CompatRule {
        name: "tailwind-v4",
        applies: tailwind_v4_detected,
        fix: downgrade_tailwind,
    },
    CompatRule {
        name: "vite-6-plus",
        applies: vite_6_detected,
        fix: downgrade_vite,
    },
];

/// Patch the copy of `bundle` destined for the sandbox.
pub fn patch_bundle(bundle: &FileBundle) -> PatchOutcome<'_> {
    let unchanged = || PatchOutcome {
        bundle: Cow::Borrowed(bundle),
        fixes: Vec::new(),
    };

    let Some(text) = bundle.get(MANIFEST_PATH) else {
        return unchanged();
    };
    let manifest = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return unchanged(),
        Err(e) => {
            tracing::warn!("Skipping compatibility check, package.json is invalid: {e}");
            return unchanged();
        }
    };

    let matching: Vec<&CompatRule> = RULES.iter().filter(|r| (r.applies)(&manifest)).collect();
    if matching.is_empty() {
        return unchanged();
    }

    let mut patch = Patch {
        manifest,
        files: bundle.clone(),
    };
    let mut fixes = Vec::new();
    for rule in matching {
        let applied = (rule.fix)(&mut patch);
        tracing::debug!(rule = rule.name, changes = applied.len(), "compat rule applied");
        fixes.extend(applied);
    }

    match serde_json::to_string_pretty(&Value::Object(patch.manifest)) {
        Ok(json) => {
            patch.files.insert(MANIFEST_PATH.to_string(), format!("{json}\n"));
        }
        Err(e) => {
            tracing::warn!("Failed to re-serialize patched package.json: {e}");
            return unchanged();
        }
    }

    PatchOutcome {
        bundle: Cow::Owned(patch.files),
        fixes,
    }
}

fn declared_range<'m>(manifest: &'m Map<String, Value>, name: &str) -> Option<&'m str> {
    DEP_SECTIONS
        .iter()
        .filter_map(|section| manifest.get(*section)?.get(name)?.as_str())
        .next()
}

/// Whether a declared range targets `major` or newer. Dist-tags count as newest.
fn at_least_major(range: &str, major: u64) -> bool {
    let range = range.trim();
    if matches!(range, "latest" | "next" | "*") {
        return true;
    }
    MAJOR
        .captures(range)
        .and_then(|c| c[1].parse::<u64>().ok())
        .is_some_and(|m| m >= major)
}

fn set_range(manifest: &mut Map<String, Value>, name: &str, range: &str) {
    for section in DEP_SECTIONS {
        if let Some(Value::Object(deps)) = manifest.get_mut(section) {
            if let Some(slot) = deps.get_mut(name) {
                *slot = Value::String(range.to_string());
            }
        }
    }
}

fn remove_dependency(manifest: &mut Map<String, Value>, name: &str) -> bool {
    let mut removed = false;
    for section in DEP_SECTIONS {
        if let Some(Value::Object(deps)) = manifest.get_mut(section) {
            removed |= deps.remove(name).is_some();
        }
    }
    removed
}

fn ensure_dev_dependency(manifest: &mut Map<String, Value>, name: &str, range: &str) -> bool {
    if declared_range(manifest, name).is_some() {
        return false;
    }
    let section = manifest
        .entry("devDependencies")
        .or_insert_with(|| Value::Object(Map::new()));
    if !section.is_object() {
        *section = Value::Object(Map::new());
    }
    if let Value::Object(deps) = section {
        deps.insert(name.to_string(), Value::String(range.to_string()));
    }
    true
}

fn tailwind_v4_detected(manifest: &Map<String, Value>) -> bool {
    declared_range(manifest, "tailwindcss").is_some_and(|r| at_least_major(r, 4))
}

fn downgrade_tailwind(patch: &mut Patch) -> Vec<String> {
    let mut fixes = Vec::new();

    let old = declared_range(&patch.manifest, "tailwindcss")
        .unwrap_or_default()
        .to_string();
    set_range(&mut patch.manifest, "tailwindcss", TAILWIND_V3);
    fixes.push(format!("Pinned tailwindcss {old} -> {TAILWIND_V3}"));

    for plugin in ["@tailwindcss/postcss", "@tailwindcss/vite"] {
        if remove_dependency(&mut patch.manifest, plugin) {
            fixes.push(format!("Removed {plugin} (Tailwind v4 only)"));
        }
    }
    for (name, range) in [("postcss", POSTCSS_RANGE), ("autoprefixer", AUTOPREFIXER_RANGE)] {
        if ensure_dev_dependency(&mut patch.manifest, name, range) {
            fixes.push(format!("Added {name}@{range}"));
        }
    }

    let postcss_present: Vec<&str> = POSTCSS_CONFIGS
        .iter()
        .copied()
        .filter(|p| patch.files.contains_key(*p))
        .collect();
    let v4_postcss: Vec<&str> = postcss_present
        .iter()
        .copied()
        .filter(|p| patch.files[*p].contains("@tailwindcss/postcss"))
        .collect();
    for path in &v4_postcss {
        patch.files.remove(*path);
    }
    if !v4_postcss.is_empty() || postcss_present.is_empty() {
        patch
            .files
            .insert("postcss.config.js".to_string(), template::POSTCSS_CONFIG.to_string());
        fixes.push("Replaced PostCSS config with the Tailwind v3 plugin setup".to_string());
    }

    for path in VITE_CONFIGS {
        if let Some(content) = patch.files.get_mut(*path) {
            if content.contains("@tailwindcss/vite") {
                *content = template::VITE_CONFIG.to_string();
                fixes.push(format!("Replaced {path} with a plain React config"));
            }
        }
    }

    if !TAILWIND_CONFIGS.iter().any(|p| patch.files.contains_key(*p)) {
        patch
            .files
            .insert("tailwind.config.js".to_string(), template::TAILWIND_CONFIG.to_string());
        fixes.push("Added tailwind.config.js".to_string());
    }

    let css_paths: Vec<String> = patch
        .files
        .keys()
        .filter(|p| p.ends_with(".css"))
        .cloned()
        .collect();
    for path in css_paths {
        if let Some(content) = patch.files.get_mut(&path) {
            if TAILWIND_IMPORT.is_match(content) {
                let rewritten = TAILWIND_IMPORT
                    .replace_all(content, TAILWIND_V3_DIRECTIVES)
                    .into_owned();
                *content = rewritten;
                fixes.push(format!("Rewrote Tailwind import in {path}"));
            }
        }
    }

    fixes
}

fn vite_6_detected(manifest: &Map<String, Value>) -> bool {
    declared_range(manifest, "vite").is_some_and(|r| at_least_major(r, 6))
}

fn downgrade_vite(patch: &mut Patch) -> Vec<String> {
    let mut fixes = Vec::new();

    let old = declared_range(&patch.manifest, "vite")
        .unwrap_or_default()
        .to_string();
    set_range(&mut patch.manifest, "vite", VITE_V5);
    fixes.push(format!("Pinned vite {old} -> {VITE_V5}"));

    if declared_range(&patch.manifest, "@vitejs/plugin-react").is_some_and(|r| at_least_major(r, 5)) {
        set_range(&mut patch.manifest, "@vitejs/plugin-react", PLUGIN_REACT_V4);
        fixes.push(format!("Pinned @vitejs/plugin-react -> {PLUGIN_REACT_V4}"));
    }

    if let Some(Value::Object(scripts)) = patch.manifest.get_mut("scripts") {
        for (name, command) in scripts.iter_mut() {
            let Some(text) = command.as_str() else {
                continue;
            };
            if CONFIG_LOADER_FLAG.is_match(text) {
                let stripped = CONFIG_LOADER_FLAG.replace_all(text, "").into_owned();
                *command = Value::String(stripped);
                fixes.push(format!("Removed --configLoader from the \"{name}\" script"));
            }
        }
    }

    fixes
}
