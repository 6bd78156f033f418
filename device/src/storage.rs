use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::StoreError;

pub const PREFERENCES_NAMESPACE: &str = "gps-tracker";

/// Namespaced key-value settings persisted in a small SQLite file.
///
/// Every write is its own statement so a power cut can only lose the value
/// being written, never the rest of the namespace.
pub struct Preferences {
    conn: Connection,
    namespace: String,
}

impl Preferences {
    pub fn open(path: &Path, namespace: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        info!(path = %path.display(), namespace, "Opening preferences store");
        Self::init(conn, namespace)
    }

    /// Volatile store used when the data directory cannot be mounted.
    pub fn in_memory(namespace: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, namespace)
    }

    fn init(conn: Connection, namespace: &str) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS preferences (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            )",
            [],
        )?;
        Ok(Preferences {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn get_raw(&self, key: &str) -> Option<String> {
        let result = self
            .conn
            .query_row(
                "SELECT value FROM preferences WHERE namespace = ?1 AND key = ?2",
                params![self.namespace, key],
                |row| row.get::<_, String>(0),
            )
            .optional();
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, key, "Failed to read preference, using default");
                None
            }
        }
    }

    fn put_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        debug!(key, "Writing preference");
        self.conn.execute(
            "INSERT INTO preferences (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
            params![self.namespace, key, value],
        )?;
        Ok(())
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get_raw(key).unwrap_or_else(|| default.to_string())
    }

    pub fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put_raw(key, value)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get_raw(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn put_u64(&self, key: &str, value: u64) -> Result<(), StoreError> {
        self.put_raw(key, &value.to_string())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_raw(key).as_deref() {
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            _ => default,
        }
    }

    pub fn put_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        self.put_raw(key, if value { "1" } else { "0" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_keys_fall_back_to_defaults() {
        let prefs = Preferences::in_memory(PREFERENCES_NAMESPACE).unwrap();
        assert_eq!(prefs.get_string("apn", "fallback"), "fallback");
        assert_eq!(prefs.get_u64("sleepTime", 60), 60);
        assert!(prefs.get_bool("registered", true));
    }

    #[test]
    fn values_overwrite_in_place() {
        let prefs = Preferences::in_memory(PREFERENCES_NAMESPACE).unwrap();
        prefs.put_u64("port", 80).unwrap();
        prefs.put_u64("port", 8443).unwrap();
        assert_eq!(prefs.get_u64("port", 443), 8443);
        prefs.put_bool("registered", false).unwrap();
        assert!(!prefs.get_bool("registered", true));
    }

    #[test]
    fn unparsable_number_uses_default() {
        let prefs = Preferences::in_memory(PREFERENCES_NAMESPACE).unwrap();
        prefs.put_string("sleepTime", "soon").unwrap();
        assert_eq!(prefs.get_u64("sleepTime", 60), 60);
    }

    #[test]
    fn namespaces_are_isolated_and_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.db");
        {
            let prefs = Preferences::open(&path, "gps-tracker").unwrap();
            prefs.put_string("server", "collector.example").unwrap();
        }
        let other = Preferences::open(&path, "other").unwrap();
        assert_eq!(other.get_string("server", "unset"), "unset");
        let prefs = Preferences::open(&path, "gps-tracker").unwrap();
        assert_eq!(prefs.get_string("server", ""), "collector.example");
    }
}
