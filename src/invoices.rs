use rusqlite::Connection;

use crate::model::{
    Invoice, InvoiceDraft, InvoicePatch, OpReport, PartialPayment, PaymentStatus,
};
use crate::storage::{
    kv_get_as, kv_remove, kv_set_as, StoreState, KEY_INVOICE_HISTORY, KEY_LEGACY_INVOICE_HISTORY,
};
use crate::sync::recompute_balances_conn;
use crate::totals::compute_totals;
use crate::{new_id, now_iso};

/// Loads the invoice history, newest first. A populated legacy
/// `invoice_history` key is folded into the unified key once, then removed.
pub(crate) fn load_history_conn(conn: &Connection) -> Result<Vec<Invoice>, rusqlite::Error> {
    let history: Vec<Invoice> = kv_get_as(conn, KEY_INVOICE_HISTORY)?;
    if !history.is_empty() {
        return Ok(history);
    }

    let legacy: Vec<Invoice> = kv_get_as(conn, KEY_LEGACY_INVOICE_HISTORY)?;
    if legacy.is_empty() {
        return Ok(history);
    }

    eprintln!("[invoices] {{ migrating: {} records from legacy key }}", legacy.len());
    save_history_conn(conn, &legacy)?;
    kv_remove(conn, KEY_LEGACY_INVOICE_HISTORY)?;
    Ok(legacy)
}

pub(crate) fn save_history_conn(conn: &Connection, history: &[Invoice]) -> Result<(), rusqlite::Error> {
    kv_set_as(conn, KEY_INVOICE_HISTORY, &history)
}

pub fn load_history(store: &StoreState) -> Result<Vec<Invoice>, String> {
    store.with_read("load_history", load_history_conn)
}

pub fn get_invoice_by_id(store: &StoreState, id: &str) -> Result<Option<Invoice>, String> {
    store.with_read("get_invoice_by_id", |conn| {
        let history = load_history_conn(conn)?;
        Ok(history.into_iter().find(|inv| inv.id == id))
    })
}

/// Persists a draft as a new invoice. The id is assigned here and nowhere
/// else; drafts are transient until this call. The new record is prepended
/// (history is stored newest first) and every client balance is recomputed
/// from the updated history.
pub fn save_invoice(store: &StoreState, draft: InvoiceDraft) -> Result<Invoice, String> {
    store.with_write("save_invoice", move |conn| {
        let mut history = load_history_conn(conn)?;
        let now = now_iso();

        let invoice = Invoice {
            id: format!("INV-{}", now),
            invoice_number: draft.invoice_number,
            selected_client: draft.selected_client,
            items: draft.items,
            discount: draft.discount.unwrap_or_default(),
            theme: draft.theme,
            issue_date: draft.issue_date,
            due_date: draft.due_date,
            notes: draft.notes,
            company_info: draft.company_info,
            status: "created".to_string(),
            payment_status: PaymentStatus::Unpaid,
            payment_date: None,
            partial_payments: Vec::new(),
            total_paid: 0.0,
            created_at: now.clone(),
            updated_at: now,
        };

        history.insert(0, invoice.clone());
        save_history_conn(conn, &history)?;
        recompute_balances_conn(conn, &history)?;
        Ok(invoice)
    })
}

/// Removes an invoice from history. Unknown ids are a silent no-op; the
/// returned flag only reports whether anything was removed.
pub fn delete_invoice(store: &StoreState, id: &str) -> Result<bool, String> {
    store.with_write("delete_invoice", move |conn| {
        let history = load_history_conn(conn)?;
        let before = history.len();
        let remaining: Vec<Invoice> = history.into_iter().filter(|inv| inv.id != id).collect();
        let removed = remaining.len() < before;
        save_history_conn(conn, &remaining)?;
        recompute_balances_conn(conn, &remaining)?;
        Ok(removed)
    })
}

/// Shallow-merges a typed patch into an existing invoice. `Ok(None)` means
/// no invoice with that id exists.
pub fn edit_invoice(
    store: &StoreState,
    id: &str,
    patch: InvoicePatch,
) -> Result<Option<Invoice>, String> {
    store.with_write("edit_invoice", move |conn| {
        let mut history = load_history_conn(conn)?;
        let Some(existing) = history.iter_mut().find(|inv| inv.id == id) else {
            return Ok(None);
        };

        if let Some(v) = patch.invoice_number {
            existing.invoice_number = v;
        }
        if let Some(v) = patch.selected_client {
            existing.selected_client = v;
        }
        if let Some(v) = patch.items {
            existing.items = v;
        }
        if let Some(v) = patch.discount {
            existing.discount = v;
        }
        if let Some(v) = patch.theme {
            existing.theme = v;
        }
        if let Some(v) = patch.issue_date {
            existing.issue_date = v;
        }
        if let Some(v) = patch.due_date {
            existing.due_date = v;
        }
        if let Some(v) = patch.notes {
            existing.notes = Some(v);
        }
        if let Some(v) = patch.company_info {
            existing.company_info = Some(v);
        }
        existing.updated_at = now_iso();
        let updated = existing.clone();

        save_history_conn(conn, &history)?;
        recompute_balances_conn(conn, &history)?;
        Ok(Some(updated))
    })
}

/// Replaces the discount block of an invoice and recomputes balances.
pub fn update_discount(
    store: &StoreState,
    id: &str,
    discount: crate::model::Discount,
) -> Result<Option<Invoice>, String> {
    edit_invoice(
        store,
        id,
        InvoicePatch {
            discount: Some(discount),
            ..InvoicePatch::default()
        },
    )
}

/// Payment-status state machine.
///
/// - `paid`: stamps the payment date and snapshots the computed total into
///   `totalPaid`. The partial ledger, if any, is kept for history.
/// - `partial`: appends one ledger entry and re-derives `totalPaid` as the
///   ledger sum, so repeated calls accumulate rather than replace.
/// - `unpaid`: clears the ledger, `totalPaid` and the payment date;
///   applying it twice is the same as applying it once.
///
/// A partial transition without a positive amount is rejected. Overpayment
/// is accepted but logged.
pub fn update_payment_status(
    store: &StoreState,
    id: &str,
    status: PaymentStatus,
    date: Option<String>,
    partial_amount: Option<f64>,
) -> Result<Option<Invoice>, String> {
    if status == PaymentStatus::Partial {
        match partial_amount {
            Some(a) if a > 0.0 => {}
            Some(_) => return Err("Partial payment amount must be positive".to_string()),
            None => return Err("Partial payment requires an amount".to_string()),
        }
    }

    store.with_write("update_payment_status", move |conn| {
        let mut history = load_history_conn(conn)?;
        let Some(existing) = history.iter_mut().find(|inv| inv.id == id) else {
            return Ok(None);
        };

        let when = date.clone().unwrap_or_else(now_iso);
        existing.payment_status = status;
        existing.updated_at = now_iso();

        match status {
            PaymentStatus::Paid => {
                existing.payment_date = Some(when);
                existing.total_paid = compute_totals(existing).total;
            }
            PaymentStatus::Partial => {
                let amount = partial_amount.unwrap_or(0.0);
                existing.payment_date = Some(when.clone());
                existing.partial_payments.push(PartialPayment {
                    id: new_id(),
                    amount,
                    date: when,
                });
                existing.total_paid = existing.partial_payments.iter().map(|p| p.amount).sum();

                let total = compute_totals(existing).total;
                if existing.total_paid > total {
                    eprintln!(
                        "[invoices] {{ id: {:?}, warning: \"partial payments {:.2} exceed invoice total {:.2}\" }}",
                        existing.id, existing.total_paid, total
                    );
                }
            }
            PaymentStatus::Unpaid => {
                existing.payment_date = None;
                existing.partial_payments.clear();
                existing.total_paid = 0.0;
            }
        }

        let updated = existing.clone();
        save_history_conn(conn, &history)?;
        recompute_balances_conn(conn, &history)?;
        Ok(Some(updated))
    })
}

/// Serializes invoices for export; writing the file is the caller's job.
pub fn export_invoices(invoices: &[Invoice]) -> Result<String, String> {
    serde_json::to_string_pretty(invoices).map_err(|e| e.to_string())
}

/// Merges exported invoices into history, skipping ids that already exist,
/// then recomputes balances.
pub fn import_invoices(store: &StoreState, data: &serde_json::Value) -> Result<OpReport, String> {
    let imported: Vec<Invoice> = match serde_json::from_value(data.clone()) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("[invoices] {{ op: \"import\", error: {:?} }}", e.to_string());
            return Ok(OpReport::failed("Invalid invoices file format"));
        }
    };

    store.with_write("import_invoices", move |conn| {
        let mut history = load_history_conn(conn)?;
        let mut added = 0usize;
        for inv in imported {
            if history.iter().any(|existing| existing.id == inv.id) {
                continue;
            }
            history.push(inv);
            added += 1;
        }
        save_history_conn(conn, &history)?;
        recompute_balances_conn(conn, &history)?;
        Ok(OpReport::ok(format!("Imported {} invoices", added)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Client, Discount, InvoiceItem};

    fn store() -> StoreState {
        StoreState::open_in_memory().unwrap()
    }

    fn draft_for(client: Option<Client>, items: Vec<(f64, f64)>) -> InvoiceDraft {
        InvoiceDraft {
            invoice_number: "INV-001".to_string(),
            selected_client: client,
            items: items
                .into_iter()
                .map(|(quantity, rate)| InvoiceItem {
                    description: "work".to_string(),
                    quantity,
                    rate,
                })
                .collect(),
            ..InvoiceDraft::default()
        }
    }

    #[test]
    fn save_assigns_metadata_and_prepends() {
        let s = store();
        let first = save_invoice(&s, draft_for(None, vec![(1.0, 10.0)])).unwrap();
        let second = save_invoice(&s, draft_for(None, vec![(1.0, 20.0)])).unwrap();

        assert!(first.id.starts_with("INV-"));
        assert_eq!(first.status, "created");
        assert_eq!(first.payment_status, PaymentStatus::Unpaid);
        assert_eq!(first.total_paid, 0.0);

        let history = load_history(&s).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.id, "newest first");
    }

    #[test]
    fn save_defaults_missing_discount() {
        let s = store();
        let inv = save_invoice(&s, draft_for(None, vec![(1.0, 10.0)])).unwrap();
        assert_eq!(inv.discount.discount_type, crate::model::DiscountType::None);
        assert_eq!(inv.discount.value, 0.0);
        assert_eq!(inv.discount.client_discount, 0.0);
    }

    #[test]
    fn delete_unknown_id_is_a_silent_noop() {
        let s = store();
        save_invoice(&s, draft_for(None, vec![(1.0, 10.0)])).unwrap();
        assert!(!delete_invoice(&s, "nope").unwrap());
        assert_eq!(load_history(&s).unwrap().len(), 1);
    }

    #[test]
    fn delete_removes_by_id() {
        let s = store();
        let inv = save_invoice(&s, draft_for(None, vec![(1.0, 10.0)])).unwrap();
        assert!(delete_invoice(&s, &inv.id).unwrap());
        assert!(load_history(&s).unwrap().is_empty());
    }

    #[test]
    fn edit_unknown_id_reports_not_found() {
        let s = store();
        let out = edit_invoice(&s, "nope", InvoicePatch::default()).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn edit_merges_patch_and_bumps_updated_at() {
        let s = store();
        let inv = save_invoice(&s, draft_for(None, vec![(1.0, 10.0)])).unwrap();
        let updated = edit_invoice(
            &s,
            &inv.id,
            InvoicePatch {
                notes: Some("net 30".to_string()),
                ..InvoicePatch::default()
            },
        )
        .unwrap()
        .unwrap();

        assert_eq!(updated.notes.as_deref(), Some("net 30"));
        assert_eq!(updated.invoice_number, "INV-001");
        assert!(updated.updated_at >= inv.updated_at);
    }

    #[test]
    fn partial_payments_accumulate_across_calls() {
        let s = store();
        let inv = save_invoice(&s, draft_for(None, vec![(10.0, 100.0)])).unwrap();

        update_payment_status(&s, &inv.id, PaymentStatus::Partial, None, Some(100.0))
            .unwrap()
            .unwrap();
        let after = update_payment_status(&s, &inv.id, PaymentStatus::Partial, None, Some(100.0))
            .unwrap()
            .unwrap();

        assert_eq!(after.partial_payments.len(), 2);
        assert_eq!(after.total_paid, 200.0);
        assert_ne!(after.partial_payments[0].id, after.partial_payments[1].id);
    }

    #[test]
    fn unpaid_reset_is_idempotent() {
        let s = store();
        let inv = save_invoice(&s, draft_for(None, vec![(1.0, 100.0)])).unwrap();
        update_payment_status(&s, &inv.id, PaymentStatus::Partial, None, Some(40.0))
            .unwrap()
            .unwrap();

        let once = update_payment_status(&s, &inv.id, PaymentStatus::Unpaid, None, None)
            .unwrap()
            .unwrap();
        let twice = update_payment_status(&s, &inv.id, PaymentStatus::Unpaid, None, None)
            .unwrap()
            .unwrap();

        for state in [once, twice] {
            assert_eq!(state.payment_status, PaymentStatus::Unpaid);
            assert!(state.partial_payments.is_empty());
            assert_eq!(state.total_paid, 0.0);
            assert!(state.payment_date.is_none());
        }
    }

    #[test]
    fn paid_snapshots_the_computed_total() {
        let s = store();
        let mut draft = draft_for(None, vec![(2.0, 50.0)]);
        draft.discount = Some(Discount {
            client_discount: 10.0,
            ..Discount::default()
        });
        let inv = save_invoice(&s, draft).unwrap();

        let paid = update_payment_status(&s, &inv.id, PaymentStatus::Paid, None, None)
            .unwrap()
            .unwrap();
        assert_eq!(paid.total_paid, 99.0);
        assert!(paid.payment_date.is_some());
    }

    #[test]
    fn partial_without_amount_is_rejected() {
        let s = store();
        let inv = save_invoice(&s, draft_for(None, vec![(1.0, 100.0)])).unwrap();
        assert!(update_payment_status(&s, &inv.id, PaymentStatus::Partial, None, None).is_err());
        assert!(
            update_payment_status(&s, &inv.id, PaymentStatus::Partial, None, Some(-5.0)).is_err()
        );

        // The invoice is untouched by rejected transitions.
        let current = get_invoice_by_id(&s, &inv.id).unwrap().unwrap();
        assert_eq!(current.payment_status, PaymentStatus::Unpaid);
        assert!(current.partial_payments.is_empty());
    }

    #[test]
    fn overpayment_is_accepted() {
        let s = store();
        let inv = save_invoice(&s, draft_for(None, vec![(1.0, 10.0)])).unwrap();
        let after = update_payment_status(&s, &inv.id, PaymentStatus::Partial, None, Some(500.0))
            .unwrap()
            .unwrap();
        assert_eq!(after.total_paid, 500.0);
    }

    #[test]
    fn status_update_on_unknown_id_reports_not_found() {
        let s = store();
        let out = update_payment_status(&s, "nope", PaymentStatus::Paid, None, None).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn discount_update_changes_the_computed_total() {
        let s = store();
        let inv = save_invoice(&s, draft_for(None, vec![(1.0, 100.0)])).unwrap();

        let updated = update_discount(
            &s,
            &inv.id,
            Discount {
                discount_type: crate::model::DiscountType::Fixed,
                value: 20.0,
                client_discount: 0.0,
            },
        )
        .unwrap()
        .unwrap();

        assert_eq!(crate::totals::compute_totals(&updated).total, 88.0);
    }

    #[test]
    fn import_skips_duplicate_ids() {
        let s = store();
        let inv = save_invoice(&s, draft_for(None, vec![(1.0, 10.0)])).unwrap();

        let exported = export_invoices(&[inv.clone()]).unwrap();
        let mut other = inv.clone();
        other.id = "INV-other".to_string();
        let payload = serde_json::json!([
            serde_json::to_value(&inv).unwrap(),
            serde_json::to_value(&other).unwrap(),
        ]);

        let report = import_invoices(&s, &payload).unwrap();
        assert!(report.success);
        assert_eq!(load_history(&s).unwrap().len(), 2);
        assert!(exported.contains(&inv.id));
    }

    #[test]
    fn import_rejects_malformed_payload() {
        let s = store();
        let report = import_invoices(&s, &serde_json::json!({"not": "an array"})).unwrap();
        assert!(!report.success);
        assert!(load_history(&s).unwrap().is_empty());
    }

    #[test]
    fn legacy_history_key_is_migrated_once() {
        let s = store();
        let inv = Invoice {
            id: "INV-legacy".to_string(),
            ..Invoice::default()
        };
        s.with_write("seed", |conn| {
            kv_set_as(conn, KEY_LEGACY_INVOICE_HISTORY, &vec![inv])
        })
        .unwrap();

        let history = load_history(&s).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "INV-legacy");

        let legacy = s
            .with_read("t", |conn| {
                crate::storage::kv_get(conn, KEY_LEGACY_INVOICE_HISTORY)
            })
            .unwrap();
        assert!(legacy.is_none());
    }
}
