use serde::{Deserialize, Deserializer, Serialize};

/// Coerces whatever the UI put into a numeric field to an `f64`.
///
/// Drafts arrive from loosely-typed form state, so quantities, rates and
/// discount values may be numbers, numeric strings, empty strings or null.
/// Anything that is not a usable number becomes `0.0`; parsing never fails.
pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    Ok(match v {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub notes: String,
    /// Percentage in [0, 100], copied onto new invoices at client selection.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub default_discount: f64,
    /// Derived cache: outstanding amount across this client's non-paid
    /// invoices. Recomputed from the invoice history, never authoritative.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub balance: f64,
    /// Derived cache: amounts actually received for this client.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_payments: f64,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewClient {
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub default_discount: f64,
}

/// Explicit field-by-field patch; unknown fields in the incoming JSON are
/// dropped by construction instead of being merged into the record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub company: Option<String>,
    pub notes: Option<String>,
    pub default_discount: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceItem {
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub quantity: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub rate: f64,
}

impl InvoiceItem {
    /// Line amount is always derived; a stored `amount` field is ignored.
    pub fn amount(&self) -> f64 {
        self.quantity * self.rate
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    #[default]
    None,
    Percentage,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Discount {
    #[serde(rename = "type", default)]
    pub discount_type: DiscountType,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub value: f64,
    /// Percentage copied from the client at selection time. Stacks with the
    /// additional percentage/fixed discount; the two are not exclusive.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub client_discount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ThemeDisplay {
    /// Tax applies unless this is explicitly `false`.
    #[serde(default)]
    pub show_tax: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Theme {
    #[serde(default)]
    pub display: ThemeDisplay,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    Partial,
    Paid,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PartialPayment {
    pub id: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub amount: f64,
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub invoice_number: String,
    /// Snapshot of the client at invoice time, not a live reference. `None`
    /// once the client has been deleted through the propagating path.
    #[serde(default)]
    pub selected_client: Option<Client>,
    #[serde(default)]
    pub items: Vec<InvoiceItem>,
    #[serde(default)]
    pub discount: Discount,
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub issue_date: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Issuer details as entered in the composer; opaque to the core.
    #[serde(default)]
    pub company_info: Option<serde_json::Value>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub payment_date: Option<String>,
    #[serde(default)]
    pub partial_payments: Vec<PartialPayment>,
    /// Derived: sum of the partial ledger while `partial`, the full computed
    /// total once `paid`, zero when `unpaid`.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_paid: f64,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// What the composer hands over on save. Ids, timestamps and payment state
/// are assigned by the history store, never by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceDraft {
    #[serde(default)]
    pub invoice_number: String,
    #[serde(default)]
    pub selected_client: Option<Client>,
    #[serde(default)]
    pub items: Vec<InvoiceItem>,
    #[serde(default)]
    pub discount: Option<Discount>,
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub issue_date: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub company_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InvoicePatch {
    pub invoice_number: Option<String>,
    /// `Some(None)` detaches the embedded client snapshot.
    #[serde(default, with = "double_option")]
    pub selected_client: Option<Option<Client>>,
    pub items: Option<Vec<InvoiceItem>>,
    pub discount: Option<Discount>,
    pub theme: Option<Theme>,
    #[serde(default, with = "double_option")]
    pub issue_date: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub due_date: Option<Option<String>>,
    pub notes: Option<String>,
    pub company_info: Option<serde_json::Value>,
}

/// Distinguishes "field absent" from "field present and null" in patches.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Outcome surface for operations the UI shows directly to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpReport {
    pub success: bool,
    pub message: String,
}

impl OpReport {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}
