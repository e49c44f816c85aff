//! Running the package manager inside the sandbox.

use std::collections::VecDeque;

use crate::config::InstallConfig;
use crate::error::{PreviewError, Result};
use crate::runtime::Container;

/// Output fragments that mean the package cache is corrupted and a wipe is
/// likely to fix the install. Matched case-insensitively.
const CACHE_CORRUPTION_SIGNATURES: &[&str] = &[
    "enotempty",
    "eexist",
    "eintegrity",
    "cache corrupted",
    "integrity checksum failed",
    "invalid response body while trying to fetch",
];

/// Lines kept for the error message of a failed install.
const TAIL_LINES: usize = 12;

pub(crate) fn is_cache_corruption(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    CACHE_CORRUPTION_SIGNATURES
        .iter()
        .any(|sig| lower.contains(sig))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InstallRequest {
    /// Install everything the manifest declares.
    Full,
    /// Add these `name@range` specs without rewriting the manifest.
    Packages(Vec<String>),
}

pub(crate) struct Installer<'a> {
    config: &'a InstallConfig,
    cache_dir: &'a str,
}

impl<'a> Installer<'a> {
    pub(crate) fn new(config: &'a InstallConfig, cache_dir: &'a str) -> Self {
        Self { config, cache_dir }
    }

    pub(crate) fn args(&self, request: &InstallRequest) -> Vec<String> {
        let mut args = vec!["install".to_string()];
        if let InstallRequest::Packages(specs) = request {
            args.push("--no-save".to_string());
            args.extend(specs.iter().cloned());
        }
        args.extend(self.config.args.iter().cloned());
        args.push("--cache".to_string());
        args.push(self.cache_dir.to_string());
        args
    }

    /// Run the install, retrying after a cache wipe when the output shows
    /// cache corruption. Every output line goes to `on_line`.
    pub(crate) async fn run<F>(
        &self,
        container: &dyn Container,
        request: &InstallRequest,
        mut on_line: F,
    ) -> Result<()>
    where
        F: FnMut(&str) + Send,
    {
        let attempts = self.config.attempts.max(1);
        let args = self.args(request);
        let mut attempt = 0;

        loop {
            attempt += 1;
            tracing::info!(
                "Running {} {} (attempt {attempt}/{attempts})",
                self.config.program,
                args.join(" ")
            );

            let process = container
                .spawn(&self.config.program, &args)
                .await
                .map_err(|e| PreviewError::Spawn(PreviewError::describe(&e)))?;

            let mut corrupted = false;
            let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
            let code = process
                .wait_with_output(|line| {
                    corrupted |= is_cache_corruption(line);
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                    on_line(line);
                })
                .await;

            if code == 0 {
                return Ok(());
            }

            if corrupted {
                if attempt < attempts {
                    tracing::warn!("Install hit a corrupted package cache; wiping and retrying");
                    on_line("Package cache looks corrupted, clearing it and retrying...");
                    if let Err(e) = container.remove(self.cache_dir, true).await {
                        tracing::warn!("Failed to clear package cache: {e}");
                    }
                    continue;
                }
                return Err(PreviewError::CacheCorruption { attempts });
            }

            return Err(PreviewError::Install {
                exit_code: code,
                detail: Vec::from(tail).join("\n"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_signatures_match_npm_output() {
        assert!(is_cache_corruption("npm ERR! code ENOTEMPTY"));
        assert!(is_cache_corruption("npm error code EEXIST"));
        assert!(is_cache_corruption("npm WARN tarball data for react seems to be corrupted. EINTEGRITY"));
        assert!(is_cache_corruption("Cache corrupted, please retry"));
        assert!(!is_cache_corruption("added 212 packages in 9s"));
        assert!(!is_cache_corruption("npm ERR! 404 Not Found - GET https://registry.npmjs.org/nope"));
    }

    #[test]
    fn full_install_args() {
        let config = InstallConfig::default();
        let installer = Installer::new(&config, ".npm-cache");
        assert_eq!(
            installer.args(&InstallRequest::Full),
            vec!["install", "--no-audit", "--no-fund", "--prefer-offline", "--cache", ".npm-cache"]
        );
    }

    #[test]
    fn incremental_install_does_not_save() {
        let config = InstallConfig {
            args: Vec::new(),
            ..InstallConfig::default()
        };
        let installer = Installer::new(&config, "c");
        let args = installer.args(&InstallRequest::Packages(vec![
            "zod@^3.22.0".to_string(),
            "clsx".to_string(),
        ]));
        assert_eq!(args, vec!["install", "--no-save", "zod@^3.22.0", "clsx", "--cache", "c"]);
    }
}
