//! Server detection over the configured servers directory.
//!
//! A child directory counts as a server when it contains at least one jar
//! and a `server.properties`. Each detected server gets a stable opaque id
//! derived from its canonical path.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::properties;

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub kind: ServerKind,
    pub version: String,
    pub port: u16,
    pub max_players: u32,
    pub motd: String,
    pub world_name: String,
    pub has_world: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Forge,
    Fabric,
    Paper,
    Spigot,
    Bukkit,
    Vanilla,
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Forge => "forge",
            Self::Fabric => "fabric",
            Self::Paper => "paper",
            Self::Spigot => "spigot",
            Self::Bukkit => "bukkit",
            Self::Vanilla => "vanilla",
        };
        f.write_str(name)
    }
}

/// Jar filenames in `dir`, in directory-listing order.
pub fn jar_files(dir: &Path) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.to_lowercase().ends_with(".jar"))
        .collect()
}

/// Whether the directory looks like a Minecraft server.
pub fn is_server_dir(dir: &Path) -> bool {
    !jar_files(dir).is_empty() && dir.join(properties::PROPERTIES_FILE).is_file()
}

/// Stable opaque id for a server directory: hex SHA-256 of its canonical path.
pub fn server_id(dir: &Path) -> Option<String> {
    let canonical = dir.canonicalize().ok()?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    Some(hex::encode(hasher.finalize()))
}

/// Scan `servers_dir` and return every detected server.
pub fn detect_servers(servers_dir: &str) -> Vec<ServerInfo> {
    let root = Path::new(servers_dir);
    if !root.is_dir() {
        tracing::warn!("Servers directory '{}' does not exist", servers_dir);
        return Vec::new();
    }

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("Failed to read servers directory '{}': {}", servers_dir, e);
            return Vec::new();
        }
    };

    entries
        .flatten()
        .map(|e| e.path())
        .filter(|path| path.is_dir() && is_server_dir(path))
        .filter_map(|path| server_info(&path))
        .collect()
}

/// Resolve a server id to its directory path.
pub fn resolve_path(servers_dir: &str, id: &str) -> Option<PathBuf> {
    find_server(servers_dir, id).map(|server| server.path)
}

/// Find a detected server by id.
pub fn find_server(servers_dir: &str, id: &str) -> Option<ServerInfo> {
    detect_servers(servers_dir)
        .into_iter()
        .find(|server| server.id == id)
}

fn server_info(dir: &Path) -> Option<ServerInfo> {
    let id = server_id(dir)?;
    let name = dir.file_name()?.to_string_lossy().into_owned();
    let jars = jar_files(dir);
    let kind = classify_kind(&jars);
    let version = detect_version(&jars);
    let props = properties::parse_properties(&dir.join(properties::PROPERTIES_FILE));

    let port = props
        .get("server-port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(25565);
    let max_players = props
        .get("max-players")
        .and_then(|p| p.parse().ok())
        .unwrap_or(20);
    let motd = props
        .get("motd")
        .cloned()
        .unwrap_or_else(|| "A Minecraft Server".to_string());
    let world_name = props
        .get("level-name")
        .cloned()
        .unwrap_or_else(|| "world".to_string());
    let has_world = dir.join(&world_name).is_dir();

    Some(ServerInfo {
        id,
        name,
        path: dir.to_path_buf(),
        kind,
        version,
        port,
        max_players,
        motd,
        world_name,
        has_world,
    })
}

/// Classify the server distribution by jar-name substring, first marker in
/// priority order wins.
fn classify_kind(jars: &[String]) -> ServerKind {
    const MARKERS: [(&str, ServerKind); 5] = [
        ("forge", ServerKind::Forge),
        ("fabric", ServerKind::Fabric),
        ("paper", ServerKind::Paper),
        ("spigot", ServerKind::Spigot),
        ("bukkit", ServerKind::Bukkit),
    ];
    for (marker, kind) in MARKERS {
        if jars.iter().any(|jar| jar.to_lowercase().contains(marker)) {
            return kind;
        }
    }
    ServerKind::Vanilla
}

/// Best-effort version extraction from jar filenames.
fn detect_version(jars: &[String]) -> String {
    jars.iter()
        .find_map(|jar| version_regex().find(jar))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9]+\.[0-9]+(\.[0-9]+)?").expect("valid version pattern"))
}
