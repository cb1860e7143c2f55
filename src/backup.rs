use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clients::{load_clients_conn, save_clients_conn};
use crate::invoices::load_history_conn;
use crate::model::{Client, Invoice, OpReport};
use crate::now_iso;
use crate::storage::{
    kv_get, kv_remove, kv_set, kv_set_as, StoreState, KEY_AUTO_SAVE, KEY_BACKUP_BEFORE_CLEAR,
    KEY_BACKUP_BEFORE_IMPORT, KEY_CLIENT_LIST, KEY_COMPANY_INFO, KEY_CURRENCY, KEY_DARK_MODE,
    KEY_INVOICE_DATA, KEY_INVOICE_HISTORY, KEY_LANGUAGE, KEY_NOTIFICATIONS, KEY_THEME,
};
use crate::sync::recompute_balances_conn;

pub const APP_NAME: &str = "Divided Finance Master";
pub const BACKUP_VERSION: &str = "1.0.0";

/// Envelope of a full-data export. `app_name` doubles as the file marker
/// checked (loosely) on import.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDocument {
    pub version: String,
    pub export_date: String,
    pub app_name: String,
    pub data: BackupData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupData {
    #[serde(default)]
    pub invoices: Vec<Invoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_info: Option<Value>,
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default)]
    pub settings: BackupSettings,
    #[serde(default)]
    pub preferences: BackupPreferences,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dark_mode: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_save: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Value>,
}

fn build_backup_conn(conn: &Connection) -> Result<BackupDocument, rusqlite::Error> {
    Ok(BackupDocument {
        version: BACKUP_VERSION.to_string(),
        export_date: now_iso(),
        app_name: APP_NAME.to_string(),
        data: BackupData {
            invoices: load_history_conn(conn)?,
            company_info: kv_get(conn, KEY_COMPANY_INFO)?,
            clients: load_clients_conn(conn)?,
            settings: BackupSettings {
                theme: kv_get(conn, KEY_THEME)?,
                currency: kv_get(conn, KEY_CURRENCY)?,
                language: kv_get(conn, KEY_LANGUAGE)?,
            },
            preferences: BackupPreferences {
                dark_mode: kv_get(conn, KEY_DARK_MODE)?,
                auto_save: kv_get(conn, KEY_AUTO_SAVE)?,
                notifications: kv_get(conn, KEY_NOTIFICATIONS)?,
            },
        },
    })
}

/// Serializes everything the app stores into one pretty-printed document.
pub fn export_all(store: &StoreState) -> Result<String, String> {
    let doc = store.with_read("export_all", build_backup_conn)?;
    serde_json::to_string_pretty(&doc).map_err(|e| e.to_string())
}

/// Restores a full-data export, overwriting the corresponding keys. The
/// pre-import state is snapshotted first so a bad file is recoverable.
/// A parse failure or missing marker is an [`OpReport`] failure, not an
/// `Err`: the store is left untouched in both cases.
pub fn import_all(store: &StoreState, raw: &str) -> Result<OpReport, String> {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Ok(OpReport::failed("Invalid backup file format")),
    };

    // Loose marker check: older exports carried no appName at all.
    match parsed.get("appName").and_then(Value::as_str) {
        Some(name) if name != APP_NAME => {
            eprintln!("[backup] {{ op: \"import_all\", warn: \"unexpected appName {:?}\" }}", name);
        }
        _ => {}
    }

    let Some(doc) = parsed.get("data") else {
        return Ok(OpReport::failed("Backup file has no data section"));
    };
    let data: BackupData = match serde_json::from_value(doc.clone()) {
        Ok(d) => d,
        Err(_) => return Ok(OpReport::failed("Invalid backup file format")),
    };

    store.with_write("import_all", move |conn| {
        let snapshot = build_backup_conn(conn)?;
        kv_set_as(conn, KEY_BACKUP_BEFORE_IMPORT, &snapshot)?;

        kv_set_as(conn, KEY_INVOICE_HISTORY, &data.invoices)?;
        save_clients_conn(conn, &data.clients)?;
        if let Some(info) = &data.company_info {
            kv_set(conn, KEY_COMPANY_INFO, info)?;
        }
        if let Some(v) = &data.settings.theme {
            kv_set(conn, KEY_THEME, v)?;
        }
        if let Some(v) = &data.settings.currency {
            kv_set(conn, KEY_CURRENCY, v)?;
        }
        if let Some(v) = &data.settings.language {
            kv_set(conn, KEY_LANGUAGE, v)?;
        }
        if let Some(v) = &data.preferences.dark_mode {
            kv_set(conn, KEY_DARK_MODE, v)?;
        }
        if let Some(v) = &data.preferences.auto_save {
            kv_set(conn, KEY_AUTO_SAVE, v)?;
        }
        if let Some(v) = &data.preferences.notifications {
            kv_set(conn, KEY_NOTIFICATIONS, v)?;
        }

        recompute_balances_conn(conn, &data.invoices)?;

        Ok(OpReport::ok(format!(
            "Imported {} invoices and {} clients",
            data.invoices.len(),
            data.clients.len()
        )))
    })
}

/// Wipes every stored document after snapshotting the current state under
/// its own key, so a misclick is not the end of the books.
pub fn clear_all(store: &StoreState) -> Result<OpReport, String> {
    store.with_write("clear_all", |conn| {
        let snapshot = build_backup_conn(conn)?;
        kv_set_as(conn, KEY_BACKUP_BEFORE_CLEAR, &snapshot)?;

        for key in [
            KEY_INVOICE_HISTORY,
            KEY_CLIENT_LIST,
            KEY_INVOICE_DATA,
            KEY_COMPANY_INFO,
            KEY_THEME,
            KEY_CURRENCY,
            KEY_LANGUAGE,
            KEY_DARK_MODE,
            KEY_AUTO_SAVE,
            KEY_NOTIFICATIONS,
            KEY_BACKUP_BEFORE_IMPORT,
        ] {
            kv_remove(conn, key)?;
        }

        Ok(OpReport::ok("All data cleared"))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientsBackup {
    #[serde(rename = "type")]
    pub kind: String,
    pub export_date: String,
    pub clients: Vec<Client>,
}

/// Clients-only export, tagged so it cannot be mistaken for a full backup.
pub fn export_clients(store: &StoreState) -> Result<String, String> {
    let clients = store.with_read("export_clients", |conn| load_clients_conn(conn))?;
    let doc = ClientsBackup {
        kind: "clients_backup".to_string(),
        export_date: now_iso(),
        clients,
    };
    serde_json::to_string_pretty(&doc).map_err(|e| e.to_string())
}

/// Merges a clients-only export into the registry. Records without a name
/// are dropped, existing ids are kept as-is; if nothing in the file is
/// usable the import fails as a whole.
pub fn import_clients(store: &StoreState, raw: &str) -> Result<OpReport, String> {
    let parsed: ClientsBackup = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Ok(OpReport::failed("Invalid clients file format")),
    };

    let valid: Vec<Client> = parsed
        .clients
        .into_iter()
        .filter(|c| !c.name.trim().is_empty())
        .collect();
    if valid.is_empty() {
        return Ok(OpReport::failed("No valid clients found in file"));
    }

    store.with_write("import_clients", move |conn| {
        let mut clients = load_clients_conn(conn)?;
        let mut added = 0usize;
        for mut incoming in valid {
            if clients.iter().any(|c| c.id == incoming.id) {
                continue;
            }
            let now = now_iso();
            if incoming.id.is_empty() {
                incoming.id = crate::new_id();
            }
            if incoming.created_at.is_empty() {
                incoming.created_at = now.clone();
            }
            incoming.updated_at = now;
            clients.push(incoming);
            added += 1;
        }
        save_clients_conn(conn, &clients)?;

        let history = load_history_conn(conn)?;
        recompute_balances_conn(conn, &history)?;

        Ok(OpReport::ok(format!("Imported {} clients", added)))
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStats {
    pub invoice_count: usize,
    pub client_count: usize,
    pub has_company_info: bool,
    /// Serialized size of everything in the store, in bytes.
    pub storage_bytes: u64,
}

pub fn data_stats(store: &StoreState) -> Result<DataStats, String> {
    store.with_read("data_stats", |conn| {
        let invoices = load_history_conn(conn)?;
        let clients = load_clients_conn(conn)?;
        let has_company_info = kv_get(conn, KEY_COMPANY_INFO)?.is_some();
        let storage_bytes: u64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(value)), 0) FROM kv_store",
            [],
            |r| r.get(0),
        )?;

        Ok(DataStats {
            invoice_count: invoices.len(),
            client_count: clients.len(),
            has_company_info,
            storage_bytes,
        })
    })
}
