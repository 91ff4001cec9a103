// Credential store - enumerates and vends stored browser auth bundles
//
// A bundle is an opaque JSON snapshot of browser storage state for one
// logged-in account. Bundles come from either environment variables
// (AUTH_JSON_<N>) or a directory of auth-<N>.json files. The store is
// read-only after startup; `load` re-reads the source each call so bundles
// rotated on disk are picked up on next use.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where bundles are discovered from. Chosen once at startup: the directory
/// wins when it exists, otherwise the environment is scanned.
#[derive(Debug, Clone)]
enum Backing {
    Env,
    Directory(PathBuf),
}

pub struct CredentialStore {
    backing: Backing,
    /// Valid indices, ascending
    indices: Vec<u32>,
    /// Display names extracted from the bundles at startup
    names: HashMap<u32, String>,
}

impl CredentialStore {
    /// Discover and validate bundles. Fails when no valid bundle remains.
    pub fn discover(auth_dir: &Path) -> Result<Self> {
        let backing = if auth_dir.is_dir() {
            Backing::Directory(auth_dir.to_path_buf())
        } else {
            Backing::Env
        };

        let candidates = match &backing {
            Backing::Env => scan_env(),
            Backing::Directory(dir) => scan_directory(dir),
        };

        let mut indices = Vec::new();
        let mut names = HashMap::new();
        for (index, raw) in candidates {
            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(bundle) => {
                    if let Some(name) = account_name(&bundle) {
                        names.insert(index, name);
                    }
                    indices.push(index);
                }
                Err(e) => {
                    tracing::warn!("Auth bundle {} is not valid JSON, skipping: {}", index, e);
                }
            }
        }
        indices.sort_unstable();
        indices.dedup();

        if indices.is_empty() {
            bail!("No valid auth bundles found (checked AUTH_JSON_<N> env vars and {:?})", auth_dir);
        }

        tracing::info!(
            "Credential store: {} bundle(s), indices {:?}",
            indices.len(),
            indices
        );

        Ok(Self {
            backing,
            indices,
            names,
        })
    }

    pub fn available_indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn name_of(&self, index: u32) -> Option<&str> {
        self.names.get(&index).map(|s| s.as_str())
    }

    pub fn max_index(&self) -> u32 {
        self.indices.last().copied().unwrap_or(0)
    }

    /// Re-read a bundle from its source. Returns None when the bundle is
    /// missing or no longer parses.
    pub fn load(&self, index: u32) -> Option<String> {
        let raw = match &self.backing {
            Backing::Env => std::env::var(format!("AUTH_JSON_{}", index)).ok()?,
            Backing::Directory(dir) => {
                std::fs::read_to_string(dir.join(format!("auth-{}.json", index))).ok()?
            }
        };
        if serde_json::from_str::<serde_json::Value>(&raw).is_err() {
            tracing::warn!("Auth bundle {} no longer parses as JSON", index);
            return None;
        }
        Some(raw)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(indices: Vec<u32>) -> Self {
        Self {
            backing: Backing::Env,
            indices,
            names: HashMap::new(),
        }
    }
}

/// Scan AUTH_JSON_<N> environment variables.
fn scan_env() -> Vec<(u32, String)> {
    let mut found = Vec::new();
    for (key, value) in std::env::vars() {
        if let Some(suffix) = key.strip_prefix("AUTH_JSON_") {
            if let Ok(index) = suffix.parse::<u32>() {
                if index >= 1 {
                    found.push((index, value));
                }
            }
        }
    }
    found
}

/// Scan a directory for auth-<N>.json files.
fn scan_directory(dir: &Path) -> Vec<(u32, String)> {
    let mut found = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot read auth directory {:?}: {}", dir, e);
            return found;
        }
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(index) = name
            .strip_prefix("auth-")
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        if index < 1 {
            continue;
        }
        match std::fs::read_to_string(entry.path()) {
            Ok(raw) => found.push((index, raw)),
            Err(e) => tracing::warn!("Cannot read {:?}: {}", entry.path(), e),
        }
    }
    found
}

/// Pull the display name out of a bundle, if present.
fn account_name(bundle: &serde_json::Value) -> Option<String> {
    bundle
        .get("accountName")
        .and_then(|v| v.as_str())
        .map(String::from)
}
