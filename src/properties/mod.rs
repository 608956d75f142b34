//! Reading and writing of the `server.properties` file and the
//! `mcsm_info.json` metadata sidecar.
//!
//! The `memory` key is virtual: it lives in the sidecar, never in
//! `server.properties`, and is merged into the properties view on read.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::utils::current_timestamp;

pub const PROPERTIES_FILE: &str = "server.properties";
pub const METADATA_FILE: &str = "mcsm_info.json";

/// Per-server metadata kept outside `server.properties`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerMetadata {
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub created_at: Option<u64>,
    #[serde(default)]
    pub last_started: Option<u64>,
    #[serde(default)]
    pub total_runtime: Option<u64>,
}

/// Parse a line-oriented `key=value` file. Blank lines and `#` comments are
/// skipped; each remaining line is split on the first `=` with both sides
/// trimmed. Duplicate keys keep the last occurrence.
pub fn parse_properties(path: &Path) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return properties,
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            properties.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    properties
}

/// Read the metadata sidecar. Missing or unparseable files yield the default
/// (all-`None`) record; a parse failure is logged and not propagated.
pub fn read_metadata(server_dir: &Path) -> ServerMetadata {
    let path = server_dir.join(METADATA_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(_) => return ServerMetadata::default(),
    };
    match serde_json::from_str(&content) {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!("Invalid metadata file {}: {}", path.display(), e);
            ServerMetadata::default()
        }
    }
}

/// Persist the metadata sidecar as pretty-printed JSON.
pub fn write_metadata(server_dir: &Path, metadata: &ServerMetadata) -> Result<()> {
    let path = server_dir.join(METADATA_FILE);
    let content = serde_json::to_string_pretty(metadata)?;
    fs::write(&path, content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Read the merged properties view: the `server.properties` entries plus the
/// virtual `memory` key sourced from the sidecar (or `default_memory` when
/// the sidecar has none).
pub fn read_properties(server_dir: &Path, default_memory: &str) -> HashMap<String, String> {
    let mut properties = parse_properties(&server_dir.join(PROPERTIES_FILE));

    let metadata = read_metadata(server_dir);
    let memory = metadata
        .memory
        .unwrap_or_else(|| default_memory.to_string());
    properties.insert("memory".to_string(), memory);

    properties
}

/// Apply a patch to the server's properties. The `memory` key is diverted
/// into the metadata sidecar (read-modify-write, other fields preserved);
/// the remaining keys are merged into the existing map and the whole file is
/// rewritten sorted by key.
///
/// The caller is responsible for rejecting writes while the matching server
/// process is running.
pub fn write_properties(server_dir: &Path, mut patch: HashMap<String, String>) -> Result<()> {
    if let Some(memory) = patch.remove("memory") {
        let mut metadata = read_metadata(server_dir);
        metadata.memory = Some(memory);
        write_metadata(server_dir, &metadata)?;
    }

    let path = server_dir.join(PROPERTIES_FILE);
    let mut properties = parse_properties(&path);
    properties.extend(patch);

    let mut keys: Vec<&String> = properties.keys().collect();
    keys.sort();

    let mut content = String::new();
    for key in keys {
        content.push_str(key);
        content.push('=');
        content.push_str(&properties[key]);
        content.push('\n');
    }
    fs::write(&path, content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Record a successful start in the metadata sidecar.
pub fn touch_last_started(server_dir: &Path) {
    let mut metadata = read_metadata(server_dir);
    metadata.last_started = Some(current_timestamp());
    if let Err(e) = write_metadata(server_dir, &metadata) {
        tracing::warn!(
            "Failed to update last_started in {}: {}",
            server_dir.display(),
            e
        );
    }
}
