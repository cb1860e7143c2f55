use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::now_iso;

// Storage keys. The unified keys are authoritative; the legacy keys are
// read once and migrated on first load.
pub const KEY_INVOICE_HISTORY: &str = "invoiceHistory";
pub const KEY_LEGACY_INVOICE_HISTORY: &str = "invoice_history";
pub const KEY_CLIENT_LIST: &str = "clientList";
pub const KEY_LEGACY_CLIENTS: &str = "clients";
pub const KEY_INVOICE_DATA: &str = "invoiceData";
pub const KEY_COMPANY_INFO: &str = "companyInfo";
pub const KEY_THEME: &str = "theme";
pub const KEY_CURRENCY: &str = "currency";
pub const KEY_LANGUAGE: &str = "language";
pub const KEY_DARK_MODE: &str = "darkMode";
pub const KEY_AUTO_SAVE: &str = "autoSave";
pub const KEY_NOTIFICATIONS: &str = "notifications";
pub const KEY_BACKUP_BEFORE_IMPORT: &str = "lastBackupBeforeImport";
pub const KEY_BACKUP_BEFORE_CLEAR: &str = "lastBackupBeforeClear";

fn sqlite_error_string(err: &rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(code, msg) => {
            let message = msg.clone().unwrap_or_else(|| "".to_string());
            format!(
                "sqlite(code={:?}, extended_code={}, msg={})",
                code.code, code.extended_code, message
            )
        }
        other => other.to_string(),
    }
}

fn configure_sqlite(conn: &Connection) -> Result<(), rusqlite::Error> {
    // Apply PRAGMAs on init (outside any transaction).
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )?;
    conn.busy_timeout(Duration::from_millis(5000))?;
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updatedAt TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// Reads the JSON document stored under `key`. A missing row and a corrupt
/// document both come back as `None`; corruption is logged, never fatal.
pub fn kv_get(conn: &Connection, key: &str) -> Result<Option<serde_json::Value>, rusqlite::Error> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()?;

    Ok(raw.and_then(|s| match serde_json::from_str(&s) {
        Ok(v) => Some(v),
        Err(e) => {
            eprintln!("[storage] {{ key: {:?}, error: \"corrupt json: {}\" }}", key, e);
            None
        }
    }))
}

/// Writes the JSON document under `key`, replacing any previous value.
pub fn kv_set(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> Result<(), rusqlite::Error> {
    let raw = value.to_string();
    conn.execute(
        "INSERT INTO kv_store(key, value, updatedAt) VALUES(?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updatedAt = excluded.updatedAt",
        params![key, raw, now_iso()],
    )?;
    Ok(())
}

pub fn kv_remove(conn: &Connection, key: &str) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
    Ok(())
}

/// Typed convenience over [`kv_get`]: a document that does not deserialize
/// into `T` degrades to the type's default, with a logged warning.
pub fn kv_get_as<T>(conn: &Connection, key: &str) -> Result<T, rusqlite::Error>
where
    T: serde::de::DeserializeOwned + Default,
{
    match kv_get(conn, key)? {
        Some(v) => Ok(serde_json::from_value(v).unwrap_or_else(|e| {
            eprintln!("[storage] {{ key: {:?}, error: \"unexpected shape: {}\" }}", key, e);
            T::default()
        })),
        None => Ok(T::default()),
    }
}

pub fn kv_set_as<T>(conn: &Connection, key: &str, value: &T) -> Result<(), rusqlite::Error>
where
    T: serde::Serialize,
{
    let v = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    kv_set(conn, key, &v)
}

/// Handle on the backing store, constructed once per process and shared by
/// every component. All mutations run under the write lock, which stands in
/// for the single-threaded event loop the storage layer originally assumed.
#[derive(Clone)]
pub struct StoreState {
    conn: Arc<Mutex<Connection>>,
    write_lock: Arc<Mutex<()>>,
}

impl StoreState {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| e.to_string())?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, String> {
        configure_sqlite(&conn).map_err(|e| e.to_string())?;
        init_schema(&conn).map_err(|e| e.to_string())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn with_read<T, F>(&self, op_name: &'static str, f: F) -> Result<T, String>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let guard = self.conn.lock().map_err(|_| "store mutex poisoned".to_string())?;
        f(&guard).map_err(|e| {
            let msg = sqlite_error_string(&e);
            eprintln!("[storage] {{ op: {:?}, error: {:?} }}", op_name, msg);
            msg
        })
    }

    pub fn with_write<T, F>(&self, op_name: &'static str, f: F) -> Result<T, String>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error>,
    {
        let _wg = self.write_lock.lock().map_err(|_| "write mutex poisoned".to_string())?;
        let mut guard = self.conn.lock().map_err(|_| "store mutex poisoned".to_string())?;
        f(&mut guard).map_err(|e| {
            let msg = sqlite_error_string(&e);
            eprintln!("[storage] {{ op: {:?}, error: {:?} }}", op_name, msg);
            msg
        })
    }
}
