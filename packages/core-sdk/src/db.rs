use anyhow::Result;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, thread, time::Duration};

/** \brief Storage key of the last-used credential. */
pub const CREDENTIAL_KEY: &str = "pplx_api_key";
const TELEMETRY_KEY: &str = "telemetry_enabled";

/**
 * \brief Minimal string key-value store for the few settings that outlive a process.
 */
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/**
 * \brief Opens the database file and applies migrations.
 */
pub fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    migrate(&conn)?;
    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief `KeyValueStore` backed by the `app_config` table.
 */
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_db(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self::new(conn))
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = retry_on_locked(|| {
            self.conn
                .query_row(
                    "SELECT value FROM app_config WHERE key=?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()
        })?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        retry_on_locked(|| {
            self.conn.execute(
                "INSERT INTO app_config (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                params![key, value],
            )
        })?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        retry_on_locked(|| {
            self.conn
                .execute("DELETE FROM app_config WHERE key=?1", params![key])
        })?;
        Ok(())
    }
}

/**
 * \brief Persists the credential when non-blank, clears it otherwise.
 */
pub fn remember_credential(store: &impl KeyValueStore, credential: &str) -> Result<()> {
    if credential.trim().is_empty() {
        store.remove(CREDENTIAL_KEY)
    } else {
        store.set(CREDENTIAL_KEY, credential)
    }
}

pub fn stored_credential(store: &impl KeyValueStore) -> Result<Option<String>> {
    Ok(store
        .get(CREDENTIAL_KEY)?
        .filter(|v| !v.trim().is_empty()))
}

pub fn get_telemetry_enabled(store: &impl KeyValueStore) -> Result<bool> {
    Ok(store.get(TELEMETRY_KEY)?.as_deref() == Some("1"))
}

pub fn set_telemetry_enabled(store: &impl KeyValueStore, enabled: bool) -> Result<()> {
    store.set(TELEMETRY_KEY, if enabled { "1" } else { "0" })
}

/**
 * \brief Masks a credential for display, keeping the prefix and last four characters.
 */
pub fn mask_credential(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() <= 9 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..5].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}

fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_store() -> SqliteStore {
        SqliteStore::in_memory().expect("open in-memory db")
    }

    #[test]
    fn test_set_get_remove() {
        let store = mem_store();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "v1").unwrap();
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        // Removing a missing key is a no-op.
        store.remove("k").unwrap();
    }

    #[test]
    fn test_remember_credential_sets_and_clears() {
        let store = mem_store();
        remember_credential(&store, "pplx-abc").unwrap();
        assert_eq!(stored_credential(&store).unwrap().as_deref(), Some("pplx-abc"));
        assert_eq!(
            store.get(CREDENTIAL_KEY).unwrap().as_deref(),
            Some("pplx-abc")
        );

        remember_credential(&store, "  ").unwrap();
        assert_eq!(stored_credential(&store).unwrap(), None);
        assert_eq!(store.get(CREDENTIAL_KEY).unwrap(), None);
    }

    #[test]
    fn test_telemetry_flag_round_trip() {
        let store = mem_store();
        assert!(!get_telemetry_enabled(&store).unwrap());
        set_telemetry_enabled(&store, true).unwrap();
        assert!(get_telemetry_enabled(&store).unwrap());
        set_telemetry_enabled(&store, false).unwrap();
        assert!(!get_telemetry_enabled(&store).unwrap());
    }

    #[test]
    fn test_open_db_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            remember_credential(&store, "pplx-persisted").unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            stored_credential(&store).unwrap().as_deref(),
            Some("pplx-persisted")
        );
    }

    #[test]
    fn test_mask_credential() {
        let key = format!("pplx-{}wxyz", "a".repeat(44));
        assert_eq!(mask_credential(&key), "pplx-…wxyz");
        assert_eq!(mask_credential("short"), "*****");
    }
}
