use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::clients::{apply_client_patch, load_clients_conn, save_clients_conn};
use crate::invoices::{load_history_conn, save_history_conn};
use crate::model::{Client, ClientPatch, Invoice, PaymentStatus};
use crate::now_iso;
use crate::storage::{kv_get, kv_set, StoreState, KEY_INVOICE_DATA};
use crate::totals::compute_totals;

/// Overwrites every client's derived `balance` and `totalPayments` from the
/// given invoice set.
///
/// For each invoice referencing the client: a paid invoice contributes its
/// full computed total to `totalPayments`; any other invoice contributes its
/// total minus the recorded partial payments to `balance`. Partial-payment
/// ledger entries count toward `totalPayments` whatever the invoice's final
/// status, since the ledger survives the transition to `paid`.
///
/// This is a full recompute over clients x invoices rather than an
/// incremental delta; at local single-user scale that is the intended
/// tradeoff, and it makes the caches re-derivable from history alone.
pub(crate) fn recompute_balances_conn(
    conn: &Connection,
    invoices: &[Invoice],
) -> Result<Vec<Client>, rusqlite::Error> {
    let mut clients = load_clients_conn(conn)?;
    let now = now_iso();

    for client in clients.iter_mut() {
        let mut balance = 0.0;
        let mut payments = 0.0;

        for inv in invoices
            .iter()
            .filter(|inv| inv.selected_client.as_ref().is_some_and(|c| c.id == client.id))
        {
            let total = compute_totals(inv).total;
            let partial_sum: f64 = inv.partial_payments.iter().map(|p| p.amount).sum();

            if inv.payment_status == PaymentStatus::Paid {
                payments += total;
            } else {
                balance += total - partial_sum;
            }
            payments += partial_sum;
        }

        client.balance = balance;
        client.total_payments = payments;
        client.updated_at = now.clone();
    }

    save_clients_conn(conn, &clients)?;
    Ok(clients)
}

/// Recomputes all client balances from the current invoice history.
pub fn recompute_balances(store: &StoreState) -> Result<Vec<Client>, String> {
    store.with_write("recompute_balances", |conn| {
        let history = load_history_conn(conn)?;
        recompute_balances_conn(conn, &history)
    })
}

/// Mirrors the client registry into the invoice-draft document, so the
/// composer's client picker always sees the unified list.
fn sync_client_list_conn(conn: &Connection) -> Result<Vec<Client>, rusqlite::Error> {
    let clients = load_clients_conn(conn)?;

    let mut invoice_data = kv_get(conn, KEY_INVOICE_DATA)?.unwrap_or_else(|| serde_json::json!({}));
    if !invoice_data.is_object() {
        invoice_data = serde_json::json!({});
    }
    invoice_data["clientList"] = serde_json::to_value(&clients).unwrap_or_default();
    kv_set(conn, KEY_INVOICE_DATA, &invoice_data)?;

    Ok(clients)
}

pub fn sync_client_list(store: &StoreState) -> Result<Vec<Client>, String> {
    store.with_write("sync_client_list", |conn| sync_client_list_conn(conn))
}

/// Edits a client and propagates the fresh data into the embedded snapshot
/// of every invoice that references it. This is the propagating counterpart
/// of [`crate::clients::update_client`], which leaves history untouched.
pub fn update_client_everywhere(
    store: &StoreState,
    id: &str,
    patch: ClientPatch,
) -> Result<Option<Client>, String> {
    store.with_write("update_client_everywhere", move |conn| {
        let mut clients = load_clients_conn(conn)?;
        let Some(existing) = clients.iter_mut().find(|c| c.id == id) else {
            return Ok(None);
        };

        apply_client_patch(existing, &patch);
        existing.updated_at = now_iso();
        let updated = existing.clone();
        save_clients_conn(conn, &clients)?;
        sync_client_list_conn(conn)?;

        let mut history = load_history_conn(conn)?;
        let mut touched = false;
        for inv in history.iter_mut() {
            if inv.selected_client.as_ref().is_some_and(|c| c.id == id) {
                inv.selected_client = Some(updated.clone());
                touched = true;
            }
        }
        if touched {
            save_history_conn(conn, &history)?;
        }

        Ok(Some(updated))
    })
}

/// Deletes a client and detaches it from history: every invoice that
/// embedded it keeps its line items but loses the client snapshot. The
/// registry-only [`crate::clients::remove_client`] leaves snapshots alone.
pub fn remove_client_everywhere(store: &StoreState, id: &str) -> Result<bool, String> {
    store.with_write("remove_client_everywhere", move |conn| {
        let clients = load_clients_conn(conn)?;
        let before = clients.len();
        let remaining: Vec<Client> = clients.into_iter().filter(|c| c.id != id).collect();
        let removed = remaining.len() < before;
        save_clients_conn(conn, &remaining)?;
        sync_client_list_conn(conn)?;

        let mut history = load_history_conn(conn)?;
        let mut touched = false;
        for inv in history.iter_mut() {
            if inv.selected_client.as_ref().is_some_and(|c| c.id == id) {
                inv.selected_client = None;
                touched = true;
            }
        }
        if touched {
            save_history_conn(conn, &history)?;
        }

        Ok(removed)
    })
}

/// Inserts an embedded snapshot into the registry when it is missing there,
/// e.g. after importing invoices whose clients were never registered.
/// Returns whether an insert happened.
pub fn ensure_client_in_registry(store: &StoreState, client: &Client) -> Result<bool, String> {
    let client = client.clone();
    store.with_write("ensure_client_in_registry", move |conn| {
        let mut clients = load_clients_conn(conn)?;
        if clients.iter().any(|c| c.id == client.id) {
            return Ok(false);
        }

        let now = now_iso();
        let mut inserted = client;
        if inserted.created_at.is_empty() {
            inserted.created_at = now.clone();
        }
        inserted.updated_at = now;
        clients.push(inserted);
        save_clients_conn(conn, &clients)?;
        sync_client_list_conn(conn)?;
        Ok(true)
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientUsageStats {
    pub invoice_count: usize,
    /// Gross item revenue across the client's invoices, before discounts.
    pub total_revenue: f64,
    pub last_invoice_date: Option<String>,
    pub can_delete: bool,
}

pub fn client_usage_stats(store: &StoreState, id: &str) -> Result<ClientUsageStats, String> {
    store.with_read("client_usage_stats", |conn| {
        let history = load_history_conn(conn)?;
        let client_invoices: Vec<&Invoice> = history
            .iter()
            .filter(|inv| inv.selected_client.as_ref().is_some_and(|c| c.id == id))
            .collect();

        let total_revenue = client_invoices
            .iter()
            .map(|inv| inv.items.iter().map(|i| i.amount()).sum::<f64>())
            .sum();

        Ok(ClientUsageStats {
            invoice_count: client_invoices.len(),
            total_revenue,
            // History is newest first.
            last_invoice_date: client_invoices.first().map(|inv| inv.created_at.clone()),
            can_delete: client_invoices.is_empty(),
        })
    })
}

#[derive(Default)]
struct SyncSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

/// Periodic background mirror of the registry into the composer document.
/// Owns its thread explicitly: `start` launches it, `stop` wakes it, joins
/// it and runs one final sync.
pub struct SyncEngine {
    store: StoreState,
    interval: Duration,
    signal: Arc<SyncSignal>,
    handle: Option<JoinHandle<()>>,
}

impl SyncEngine {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

    pub fn new(store: StoreState, interval: Duration) -> Self {
        Self {
            store,
            interval,
            signal: Arc::new(SyncSignal::default()),
            handle: None,
        }
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        if let Ok(mut stopped) = self.signal.stopped.lock() {
            *stopped = false;
        }

        let store = self.store.clone();
        let interval = self.interval;
        let signal = self.signal.clone();

        self.handle = Some(std::thread::spawn(move || loop {
            if let Err(e) = sync_client_list(&store) {
                eprintln!("[sync] {{ op: \"periodic\", error: {:?} }}", e);
            }

            let Ok(guard) = signal.stopped.lock() else { return };
            let Ok((guard, _)) = signal.cv.wait_timeout_while(guard, interval, |s| !*s) else {
                return;
            };
            if *guard {
                return;
            }
        }));
    }

    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Ok(mut stopped) = self.signal.stopped.lock() {
            *stopped = true;
        }
        self.signal.cv.notify_all();
        let _ = handle.join();

        // Final sync, mirroring whatever the last mutation left behind.
        if let Err(e) = sync_client_list(&self.store) {
            eprintln!("[sync] {{ op: \"final\", error: {:?} }}", e);
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{add_client, get_all_clients, get_client_by_id, remove_client};
    use crate::invoices::{load_history, save_invoice, update_payment_status};
    use crate::model::{InvoiceDraft, InvoiceItem, NewClient};

    fn store() -> StoreState {
        StoreState::open_in_memory().unwrap()
    }

    fn registered_client(s: &StoreState, name: &str) -> Client {
        add_client(
            s,
            NewClient {
                name: name.to_string(),
                ..NewClient::default()
            },
        )
        .unwrap()
    }

    fn invoice_for(s: &StoreState, client: &Client, quantity: f64, rate: f64) -> Invoice {
        save_invoice(
            s,
            InvoiceDraft {
                selected_client: Some(client.clone()),
                items: vec![InvoiceItem {
                    description: "work".to_string(),
                    quantity,
                    rate,
                }],
                ..InvoiceDraft::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn balances_follow_invoice_mutations() {
        let s = store();
        let client = registered_client(&s, "Acme");

        // One 100 + 10% tax invoice: all of it outstanding.
        let inv = invoice_for(&s, &client, 2.0, 50.0);
        let c = get_client_by_id(&s, &client.id).unwrap().unwrap();
        assert_eq!(c.balance, 110.0);
        assert_eq!(c.total_payments, 0.0);

        // A 30 partial payment moves from balance to payments.
        update_payment_status(&s, &inv.id, PaymentStatus::Partial, None, Some(30.0)).unwrap();
        let c = get_client_by_id(&s, &client.id).unwrap().unwrap();
        assert_eq!(c.balance, 80.0);
        assert_eq!(c.total_payments, 30.0);

        // Fully paid: nothing outstanding.
        update_payment_status(&s, &inv.id, PaymentStatus::Paid, None, None).unwrap();
        let c = get_client_by_id(&s, &client.id).unwrap().unwrap();
        assert_eq!(c.balance, 0.0);

        // Back to unpaid clears the ledger and restores the full balance.
        update_payment_status(&s, &inv.id, PaymentStatus::Unpaid, None, None).unwrap();
        let c = get_client_by_id(&s, &client.id).unwrap().unwrap();
        assert_eq!(c.balance, 110.0);
        assert_eq!(c.total_payments, 0.0);
    }

    #[test]
    fn partial_ledger_counts_toward_payments_even_after_paid() {
        let s = store();
        let client = registered_client(&s, "Acme");
        let inv = invoice_for(&s, &client, 1.0, 100.0); // total 110 with tax

        update_payment_status(&s, &inv.id, PaymentStatus::Partial, None, Some(50.0)).unwrap();
        update_payment_status(&s, &inv.id, PaymentStatus::Paid, None, None).unwrap();

        let c = get_client_by_id(&s, &client.id).unwrap().unwrap();
        assert_eq!(c.balance, 0.0);
        // Full total plus the surviving ledger entry.
        assert_eq!(c.total_payments, 160.0);
    }

    #[test]
    fn recompute_is_idempotent() {
        let s = store();
        let a = registered_client(&s, "Acme");
        let b = registered_client(&s, "Globex");
        let inv = invoice_for(&s, &a, 2.0, 50.0);
        invoice_for(&s, &b, 1.0, 40.0);
        update_payment_status(&s, &inv.id, PaymentStatus::Partial, None, Some(10.0)).unwrap();

        let first = recompute_balances(&s).unwrap();
        let second = recompute_balances(&s).unwrap();

        for (x, y) in first.iter().zip(second.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.balance, y.balance);
            assert_eq!(x.total_payments, y.total_payments);
        }
    }

    #[test]
    fn clients_only_see_their_own_invoices() {
        let s = store();
        let a = registered_client(&s, "Acme");
        let b = registered_client(&s, "Globex");
        invoice_for(&s, &a, 1.0, 100.0);
        invoice_for(&s, &b, 1.0, 200.0);

        let a = get_client_by_id(&s, &a.id).unwrap().unwrap();
        let b = get_client_by_id(&s, &b.id).unwrap().unwrap();
        assert_eq!(a.balance, 110.0);
        assert_eq!(b.balance, 220.0);
    }

    #[test]
    fn everywhere_removal_detaches_snapshots_registry_removal_does_not() {
        let s = store();
        let a = registered_client(&s, "Acme");
        let b = registered_client(&s, "Globex");
        invoice_for(&s, &a, 1.0, 10.0);
        invoice_for(&s, &b, 1.0, 20.0);

        // Registry-only path: history keeps the snapshot.
        assert!(remove_client(&s, &b.id).unwrap());
        let history = load_history(&s).unwrap();
        assert!(history
            .iter()
            .any(|inv| inv.selected_client.as_ref().is_some_and(|c| c.id == b.id)));

        // Propagating path: snapshots are nulled, invoices retained.
        assert!(remove_client_everywhere(&s, &a.id).unwrap());
        let history = load_history(&s).unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history
            .iter()
            .any(|inv| inv.selected_client.as_ref().is_some_and(|c| c.id == a.id)));
    }

    #[test]
    fn everywhere_update_rewrites_snapshots() {
        let s = store();
        let a = registered_client(&s, "Acme");
        invoice_for(&s, &a, 1.0, 10.0);

        let updated = update_client_everywhere(
            &s,
            &a.id,
            ClientPatch {
                name: Some("Acme Corp".to_string()),
                ..ClientPatch::default()
            },
        )
        .unwrap()
        .unwrap();
        assert_eq!(updated.name, "Acme Corp");

        let history = load_history(&s).unwrap();
        let snapshot = history[0].selected_client.as_ref().unwrap();
        assert_eq!(snapshot.name, "Acme Corp");
        assert_eq!(snapshot.id, a.id);
    }

    #[test]
    fn everywhere_update_of_unknown_client_reports_not_found() {
        let s = store();
        let out = update_client_everywhere(&s, "nope", ClientPatch::default()).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn ensure_inserts_missing_snapshot_only_once() {
        let s = store();
        let snapshot = Client {
            id: "imported-1".to_string(),
            name: "Imported Co".to_string(),
            ..Client::default()
        };

        assert!(ensure_client_in_registry(&s, &snapshot).unwrap());
        assert!(!ensure_client_in_registry(&s, &snapshot).unwrap());

        let clients = get_all_clients(&s).unwrap();
        assert_eq!(clients.len(), 1);
        assert!(!clients[0].created_at.is_empty());
    }

    #[test]
    fn client_list_is_mirrored_into_the_composer_document() {
        let s = store();
        registered_client(&s, "Acme");
        sync_client_list(&s).unwrap();

        let doc = s
            .with_read("t", |conn| kv_get(conn, KEY_INVOICE_DATA))
            .unwrap()
            .unwrap();
        assert_eq!(doc["clientList"].as_array().unwrap().len(), 1);
        assert_eq!(doc["clientList"][0]["name"], "Acme");
    }

    #[test]
    fn usage_stats_report_revenue_and_deletability() {
        let s = store();
        let a = registered_client(&s, "Acme");
        let b = registered_client(&s, "Globex");
        invoice_for(&s, &a, 2.0, 50.0);
        invoice_for(&s, &a, 1.0, 25.0);

        let stats = client_usage_stats(&s, &a.id).unwrap();
        assert_eq!(stats.invoice_count, 2);
        assert_eq!(stats.total_revenue, 125.0);
        assert!(stats.last_invoice_date.is_some());
        assert!(!stats.can_delete);

        let stats = client_usage_stats(&s, &b.id).unwrap();
        assert_eq!(stats.invoice_count, 0);
        assert!(stats.can_delete);
    }

    #[test]
    fn engine_start_stop_performs_a_final_sync() {
        let s = store();
        registered_client(&s, "Acme");

        let mut engine = SyncEngine::new(s.clone(), Duration::from_secs(3600));
        engine.start();
        engine.stop();

        let doc = s
            .with_read("t", |conn| kv_get(conn, KEY_INVOICE_DATA))
            .unwrap()
            .unwrap();
        assert_eq!(doc["clientList"].as_array().unwrap().len(), 1);
    }
}
