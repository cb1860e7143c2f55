//! Data and calculation core of Divided Finance Master: invoice totals,
//! the client registry, the invoice history with its payment-status state
//! machine, client/invoice synchronization, and backup/restore. All state
//! lives in a single key-value document store; the UI layer on top of this
//! crate only renders what these modules compute.

pub mod backup;
pub mod clients;
pub mod invoices;
pub mod model;
pub mod storage;
pub mod sync;
pub mod totals;

pub use model::{
    Client, ClientPatch, Discount, DiscountType, Invoice, InvoiceDraft, InvoiceItem, InvoicePatch,
    NewClient, OpReport, PartialPayment, PaymentStatus, Theme, ThemeDisplay,
};
pub use storage::StoreState;
pub use totals::{compute_totals, format_money, Totals, TAX_RATE};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

/// Current instant as an RFC 3339 string, the timestamp format used for
/// every `createdAt`/`updatedAt` field in the store.
pub(crate) fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}
