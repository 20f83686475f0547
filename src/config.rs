use std::path::PathBuf;

use crate::model::RoomId;

const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 7878;
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_MAX_CONNECTIONS: usize = 256;
const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;
const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Server settings, read once from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub max_line_bytes: usize,
    /// Rooms created at startup if they do not exist yet.
    pub rooms: Vec<(RoomId, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    BadRoomSeed(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::BadRoomSeed(entry) => {
                write!(f, "SLOTBOOK_ROOMS: expected `id:name`, got {entry:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparsable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parsed<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|s| s.trim().parse().ok())
        }

        let rooms = match lookup("SLOTBOOK_ROOMS") {
            Some(raw) => parse_room_seeds(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            bind: lookup("SLOTBOOK_BIND").unwrap_or_else(|| DEFAULT_BIND.into()),
            port: parsed(lookup("SLOTBOOK_PORT")).unwrap_or(DEFAULT_PORT),
            data_dir: lookup("SLOTBOOK_DATA_DIR")
                .unwrap_or_else(|| DEFAULT_DATA_DIR.into())
                .into(),
            max_connections: parsed(lookup("SLOTBOOK_MAX_CONNECTIONS"))
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            compact_threshold: parsed(lookup("SLOTBOOK_COMPACT_THRESHOLD"))
                .unwrap_or(DEFAULT_COMPACT_THRESHOLD),
            metrics_port: parsed(lookup("SLOTBOOK_METRICS_PORT")),
            max_line_bytes: parsed(lookup("SLOTBOOK_MAX_LINE_BYTES"))
                .unwrap_or(DEFAULT_MAX_LINE_BYTES),
            rooms,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }
}

/// Parse `"1:Room A,2:Room B"`. Empty entries are skipped.
pub fn parse_room_seeds(raw: &str) -> Result<Vec<(RoomId, String)>, ConfigError> {
    let mut rooms = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let bad = || ConfigError::BadRoomSeed(entry.to_string());
        let (id, name) = entry.split_once(':').ok_or_else(bad)?;
        let id: RoomId = id.trim().parse().map_err(|_| bad())?;
        let name = name.trim();
        if name.is_empty() {
            return Err(bad());
        }
        rooms.push((id, name.to_string()));
    }
    Ok(rooms)
}
