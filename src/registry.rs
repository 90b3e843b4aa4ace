//! Persistence of per-database association records.
//!
//! The engine only ever talks to the [`DatabaseRegistry`] trait; what sits
//! behind it is the host application's business. Two implementations ship:
//! [`MemoryRegistry`] for throwaway sessions and tests, and [`FileRegistry`]
//! which serializes the records to a JSON file at a caller-chosen path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;
use crate::secret::{Protection, SecretBuffer};

/// 32-byte identifier KeePassXC computes for an open database. Reported on
/// the wire as a 64-char hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatabaseHash([u8; 32]);

impl DatabaseHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, Error> {
        let raw = hex::decode(encoded).map_err(|_| Error::DatabaseHashNotReceived)?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| Error::DatabaseHashNotReceived)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for DatabaseHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Display for DatabaseHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// This client's registered identity for one database.
#[derive(Debug, Clone)]
pub struct AssociationRecord {
    /// Human-facing label the daemon returned on successful association.
    pub name: String,
    /// Long-term identity key presented in `test-associate` and `get-logins`.
    pub client_id_key: SecretBuffer,
}

/// Opaque store of `database hash → association record`.
pub trait DatabaseRegistry: Send {
    fn has_database(&self, hash: &DatabaseHash) -> bool;
    fn client_id_key(&self, hash: &DatabaseHash) -> Option<SecretBuffer>;
    fn name(&self, hash: &DatabaseHash) -> Option<String>;
    fn add_database(&mut self, hash: DatabaseHash, name: String, client_id_key: SecretBuffer);
    fn remove_database(&mut self, hash: &DatabaseHash);
}

// ─── In-memory variant ───────────────────────────────────────────────────────

/// Registry that forgets everything when dropped.
#[derive(Default)]
pub struct MemoryRegistry {
    records: HashMap<DatabaseHash, AssociationRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DatabaseRegistry for MemoryRegistry {
    fn has_database(&self, hash: &DatabaseHash) -> bool {
        self.records.contains_key(hash)
    }

    fn client_id_key(&self, hash: &DatabaseHash) -> Option<SecretBuffer> {
        self.records.get(hash).map(|r| r.client_id_key.clone())
    }

    fn name(&self, hash: &DatabaseHash) -> Option<String> {
        self.records.get(hash).map(|r| r.name.clone())
    }

    fn add_database(&mut self, hash: DatabaseHash, name: String, client_id_key: SecretBuffer) {
        self.records
            .insert(hash, AssociationRecord { name, client_id_key });
    }

    fn remove_database(&mut self, hash: &DatabaseHash) {
        self.records.remove(hash);
    }
}

// ─── JSON-file variant ───────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    name: String,
    /// base64 of the identity key bytes.
    key: String,
}

/// Registry persisted as a JSON object `{ "<hex hash>": {name, key} }`.
/// Loaded once on open; rewritten on every mutation.
pub struct FileRegistry {
    path: PathBuf,
    records: HashMap<DatabaseHash, AssociationRecord>,
}

impl FileRegistry {
    /// Open (or create) the registry file at `path`. A missing file yields
    /// an empty registry; an unreadable or corrupt file is an error so the
    /// host does not silently lose its associations.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut records = HashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let stored: HashMap<String, StoredRecord> = serde_json::from_str(&contents)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                for (hex_hash, record) in stored {
                    let hash = DatabaseHash::from_hex(&hex_hash).map_err(|_| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, "bad database hash")
                    })?;
                    let key = SecretBuffer::from_base64(&record.key, Protection::Readonly)
                        .map_err(|_| {
                            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad identity key")
                        })?;
                    records.insert(
                        hash,
                        AssociationRecord {
                            name: record.name,
                            client_id_key: key,
                        },
                    );
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(Self { path, records })
    }

    fn save(&self) {
        let stored: HashMap<String, StoredRecord> = self
            .records
            .iter()
            .map(|(hash, record)| {
                (
                    hash.to_hex(),
                    StoredRecord {
                        name: record.name.clone(),
                        key: record.client_id_key.to_base64(),
                    },
                )
            })
            .collect();

        let json = match serde_json::to_string_pretty(&stored) {
            Ok(json) => json,
            Err(e) => {
                warn!(err = %e, "failed to serialize database registry");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, json) {
            warn!(path = %self.path.display(), err = %e, "failed to persist database registry");
        }
    }
}

impl DatabaseRegistry for FileRegistry {
    fn has_database(&self, hash: &DatabaseHash) -> bool {
        self.records.contains_key(hash)
    }

    fn client_id_key(&self, hash: &DatabaseHash) -> Option<SecretBuffer> {
        self.records.get(hash).map(|r| r.client_id_key.clone())
    }

    fn name(&self, hash: &DatabaseHash) -> Option<String> {
        self.records.get(hash).map(|r| r.name.clone())
    }

    fn add_database(&mut self, hash: DatabaseHash, name: String, client_id_key: SecretBuffer) {
        self.records
            .insert(hash, AssociationRecord { name, client_id_key });
        self.save();
    }

    fn remove_database(&mut self, hash: &DatabaseHash) {
        if self.records.remove(hash).is_some() {
            self.save();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> DatabaseHash {
        DatabaseHash::from_bytes([byte; 32])
    }

    fn key(byte: u8) -> SecretBuffer {
        SecretBuffer::from_bytes(vec![byte; 32], Protection::Readonly)
    }

    #[test]
    fn hash_hex_round_trips() {
        let h = hash(0x2A);
        assert_eq!(DatabaseHash::from_hex(&h.to_hex()).unwrap(), h);
    }

    #[test]
    fn short_hash_is_rejected() {
        assert_eq!(
            DatabaseHash::from_hex("abcdef"),
            Err(Error::DatabaseHashNotReceived)
        );
        assert_eq!(
            DatabaseHash::from_hex("not hex at all"),
            Err(Error::DatabaseHashNotReceived)
        );
    }

    #[test]
    fn memory_registry_stores_and_removes() {
        let mut reg = MemoryRegistry::new();
        assert!(!reg.has_database(&hash(1)));

        reg.add_database(hash(1), "host-app".into(), key(9));
        assert!(reg.has_database(&hash(1)));
        assert_eq!(reg.name(&hash(1)).unwrap(), "host-app");
        assert_eq!(reg.client_id_key(&hash(1)).unwrap(), key(9));

        reg.remove_database(&hash(1));
        assert!(!reg.has_database(&hash(1)));
    }

    #[test]
    fn file_registry_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        {
            let mut reg = FileRegistry::open(&path).unwrap();
            reg.add_database(hash(3), "host-app".into(), key(7));
        }

        let reg = FileRegistry::open(&path).unwrap();
        assert!(reg.has_database(&hash(3)));
        assert_eq!(reg.name(&hash(3)).unwrap(), "host-app");
        assert_eq!(reg.client_id_key(&hash(3)).unwrap(), key(7));
    }

    #[test]
    fn file_registry_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let mut reg = FileRegistry::open(&path).unwrap();
        reg.add_database(hash(3), "host-app".into(), key(7));
        reg.remove_database(&hash(3));
        drop(reg);

        let reg = FileRegistry::open(&path).unwrap();
        assert!(!reg.has_database(&hash(3)));
    }

    #[test]
    fn corrupt_registry_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(FileRegistry::open(&path).is_err());
    }
}
