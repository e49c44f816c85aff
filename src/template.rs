//! Fixed base scaffold mounted during pre-warm.
//!
//! The files live under `templates/vite-react/` and are compiled into the
//! crate. Installing the base manifest up front means most projects only need a
//! small incremental install on their first load.

use std::collections::BTreeSet;

use crate::bundle::FileBundle;
use crate::deps::PackageManifest;

pub const PACKAGE_JSON: &str = include_str!("../templates/vite-react/package.json");
pub const VITE_CONFIG: &str = include_str!("../templates/vite-react/vite.config.ts");
pub const TAILWIND_CONFIG: &str = include_str!("../templates/vite-react/tailwind.config.js");
pub const POSTCSS_CONFIG: &str = include_str!("../templates/vite-react/postcss.config.js");
pub const INDEX_HTML: &str = include_str!("../templates/vite-react/index.html");
pub const MAIN_TSX: &str = include_str!("../templates/vite-react/src/main.tsx");
pub const APP_TSX: &str = include_str!("../templates/vite-react/src/App.tsx");
pub const INDEX_CSS: &str = include_str!("../templates/vite-react/src/index.css");

const FILES: &[(&str, &str)] = &[
    ("package.json", PACKAGE_JSON),
    ("vite.config.ts", VITE_CONFIG),
    ("tailwind.config.js", TAILWIND_CONFIG),
    ("postcss.config.js", POSTCSS_CONFIG),
    ("index.html", INDEX_HTML),
    ("src/main.tsx", MAIN_TSX),
    ("src/App.tsx", APP_TSX),
    ("src/index.css", INDEX_CSS),
];

/// The scaffold as a bundle.
pub fn base_files() -> FileBundle {
    FILES
        .iter()
        .map(|(path, content)| ((*path).to_string(), (*content).to_string()))
        .collect()
}

/// Package names the base install provides.
pub fn base_dependency_names() -> anyhow::Result<BTreeSet<String>> {
    Ok(PackageManifest::parse(PACKAGE_JSON)?.names())
}
