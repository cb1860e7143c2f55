use std::sync::OnceLock;

use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::model::{Client, ClientPatch, NewClient};
use crate::storage::{
    kv_get_as, kv_remove, kv_set_as, StoreState, KEY_CLIENT_LIST, KEY_LEGACY_CLIENTS,
};
use crate::{new_id, now_iso};

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern"))
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?[1-9]\d{0,15}$").expect("phone pattern"))
}

/// Loads the unified client list. A populated legacy `clients` key is
/// migrated into the unified key once, then removed.
pub(crate) fn load_clients_conn(conn: &Connection) -> Result<Vec<Client>, rusqlite::Error> {
    let clients: Vec<Client> = kv_get_as(conn, KEY_CLIENT_LIST)?;
    if !clients.is_empty() {
        return Ok(clients);
    }

    let legacy: Vec<serde_json::Value> = kv_get_as(conn, KEY_LEGACY_CLIENTS)?;
    if legacy.is_empty() {
        return Ok(clients);
    }

    eprintln!("[clients] {{ migrating: {} records from legacy key }}", legacy.len());
    let now = now_iso();
    let migrated: Vec<Client> = legacy
        .into_iter()
        .map(|raw| {
            let mut c: Client = serde_json::from_value(normalize_legacy_id(raw)).unwrap_or_default();
            if c.created_at.is_empty() {
                c.created_at = now.clone();
            }
            c.updated_at = now.clone();
            c
        })
        .collect();

    save_clients_conn(conn, &migrated)?;
    kv_remove(conn, KEY_LEGACY_CLIENTS)?;
    Ok(migrated)
}

/// Legacy records used numeric ids, or none at all. The id must be a string
/// before the typed decode, otherwise the whole record fails to deserialize
/// and its fields would be lost.
fn normalize_legacy_id(mut raw: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = raw.as_object_mut() {
        match obj.get("id") {
            Some(id) if id.is_string() => {}
            Some(id) => {
                let id = match id.as_f64() {
                    Some(n) => n.to_string(),
                    None => new_id(),
                };
                obj.insert("id".to_string(), serde_json::Value::String(id));
            }
            None => {
                obj.insert("id".to_string(), serde_json::Value::String(new_id()));
            }
        }
    }
    raw
}

pub(crate) fn save_clients_conn(conn: &Connection, clients: &[Client]) -> Result<(), rusqlite::Error> {
    kv_set_as(conn, KEY_CLIENT_LIST, &clients)
}

pub fn get_all_clients(store: &StoreState) -> Result<Vec<Client>, String> {
    store.with_read("get_all_clients", load_clients_conn)
}

pub fn get_client_by_id(store: &StoreState, id: &str) -> Result<Option<Client>, String> {
    store.with_read("get_client_by_id", |conn| {
        let clients = load_clients_conn(conn)?;
        Ok(clients.into_iter().find(|c| c.id == id))
    })
}

pub fn add_client(store: &StoreState, input: NewClient) -> Result<Client, String> {
    store.with_write("add_client", move |conn| {
        let mut clients = load_clients_conn(conn)?;
        let now = now_iso();
        let created = Client {
            id: new_id(),
            name: input.name,
            email: input.email,
            phone: input.phone,
            address: input.address,
            company: input.company,
            notes: input.notes,
            default_discount: input.default_discount,
            balance: 0.0,
            total_payments: 0.0,
            created_at: now.clone(),
            updated_at: now,
        };
        clients.push(created.clone());
        save_clients_conn(conn, &clients)?;
        Ok(created)
    })
}

/// Applies a patch to the client with `id`. The id itself never changes,
/// regardless of what the patch carries. `Ok(None)` means no such client.
pub fn update_client(
    store: &StoreState,
    id: &str,
    patch: ClientPatch,
) -> Result<Option<Client>, String> {
    store.with_write("update_client", move |conn| {
        let mut clients = load_clients_conn(conn)?;
        let Some(existing) = clients.iter_mut().find(|c| c.id == id) else {
            return Ok(None);
        };

        apply_client_patch(existing, &patch);
        existing.updated_at = now_iso();
        let updated = existing.clone();

        save_clients_conn(conn, &clients)?;
        Ok(Some(updated))
    })
}

pub(crate) fn apply_client_patch(client: &mut Client, patch: &ClientPatch) {
    if let Some(v) = &patch.name {
        client.name = v.clone();
    }
    if let Some(v) = &patch.email {
        client.email = v.clone();
    }
    if let Some(v) = &patch.phone {
        client.phone = v.clone();
    }
    if let Some(v) = &patch.address {
        client.address = v.clone();
    }
    if let Some(v) = &patch.company {
        client.company = v.clone();
    }
    if let Some(v) = &patch.notes {
        client.notes = v.clone();
    }
    if let Some(v) = patch.default_discount {
        client.default_discount = v;
    }
}

/// Registry-only removal. Invoices that embed this client keep their
/// snapshot untouched; use the sync engine's removal for the propagating
/// path.
pub fn remove_client(store: &StoreState, id: &str) -> Result<bool, String> {
    store.with_write("remove_client", move |conn| {
        let clients = load_clients_conn(conn)?;
        let before = clients.len();
        let remaining: Vec<Client> = clients.into_iter().filter(|c| c.id != id).collect();
        let removed = remaining.len() < before;
        save_clients_conn(conn, &remaining)?;
        Ok(removed)
    })
}

/// Case-insensitive substring search over name, email, phone and company.
/// A blank term returns the full list unfiltered.
pub fn search_clients(store: &StoreState, term: &str) -> Result<Vec<Client>, String> {
    store.with_read("search_clients", |conn| {
        let clients = load_clients_conn(conn)?;
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(clients);
        }
        Ok(clients
            .into_iter()
            .filter(|c| {
                c.name.to_lowercase().contains(&needle)
                    || c.email.to_lowercase().contains(&needle)
                    || c.phone.to_lowercase().contains(&needle)
                    || c.company.to_lowercase().contains(&needle)
            })
            .collect())
    })
}

/// Returns human-readable problems with the submitted client data; an empty
/// list means the data is acceptable.
pub fn validate_client(data: &NewClient) -> Vec<String> {
    let mut errors = Vec::new();

    if data.name.trim().is_empty() {
        errors.push("Client name is required".to_string());
    }

    if !data.email.is_empty() && !email_regex().is_match(&data.email) {
        errors.push("Please enter a valid email address".to_string());
    }

    if !data.phone.is_empty() {
        let stripped: String = data
            .phone
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
            .collect();
        if !phone_regex().is_match(&stripped) {
            errors.push("Please enter a valid phone number".to_string());
        }
    }

    if !(0.0..=100.0).contains(&data.default_discount) {
        errors.push("Default discount must be between 0 and 100".to_string());
    }

    errors
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub total_clients: usize,
    pub total_balance: f64,
    pub total_payments: f64,
    pub recent_clients: Vec<Client>,
}

pub fn client_stats(store: &StoreState) -> Result<ClientStats, String> {
    store.with_read("client_stats", |conn| {
        let mut clients = load_clients_conn(conn)?;
        let total_balance = clients.iter().map(|c| c.balance).sum();
        let total_payments = clients.iter().map(|c| c.total_payments).sum();
        let total_clients = clients.len();

        clients.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        clients.truncate(5);

        Ok(ClientStats {
            total_clients,
            total_balance,
            total_payments,
            recent_clients: clients,
        })
    })
}
