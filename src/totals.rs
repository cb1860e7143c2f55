use serde::{Deserialize, Serialize};

use crate::model::{DiscountType, Invoice};

/// Flat tax rate applied to the discounted subtotal. The only tax rule the
/// app supports; there are no jurisdictional tables.
pub const TAX_RATE: f64 = 0.10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub subtotal: f64,
    pub discount_amount: f64,
    pub discounted_subtotal: f64,
    pub tax: f64,
    pub total: f64,
}

/// Computes the financial breakdown of an invoice.
///
/// The ordering is fixed: the client discount and the additional discount
/// are both taken against the same gross subtotal (additive, not
/// compounding), and tax applies to what remains after discounting. Values
/// are carried at full precision; rounding happens only at display time, so
/// intermediate figures must not be rounded here. A fixed discount is not
/// capped at the subtotal — the discounted subtotal may go negative.
pub fn compute_totals(invoice: &Invoice) -> Totals {
    let subtotal: f64 = invoice.items.iter().map(|i| i.amount()).sum();

    let d = &invoice.discount;
    let mut discount_amount = 0.0;
    if d.client_discount > 0.0 {
        discount_amount += subtotal * d.client_discount / 100.0;
    }
    match d.discount_type {
        DiscountType::Percentage if d.value > 0.0 => {
            discount_amount += subtotal * d.value / 100.0;
        }
        DiscountType::Fixed if d.value > 0.0 => {
            discount_amount += d.value;
        }
        _ => {}
    }

    let discounted_subtotal = subtotal - discount_amount;
    let tax = if invoice.theme.display.show_tax != Some(false) {
        discounted_subtotal * TAX_RATE
    } else {
        0.0
    };

    Totals {
        subtotal,
        discount_amount,
        discounted_subtotal,
        tax,
        total: discounted_subtotal + tax,
    }
}

/// Display-time formatting: two decimals, thousands separators.
pub fn format_money(v: f64) -> String {
    let s = format!("{:.2}", v);
    let (sign, s) = match s.strip_prefix('-') {
        Some(rest) => ("-", rest.to_string()),
        None => ("", s),
    };
    let parts = s.split('.').collect::<Vec<_>>();
    let int_part = parts[0];
    let dec_part = parts.get(1).copied().unwrap_or("00");

    let mut out = String::new();
    let chars: Vec<char> = int_part.chars().collect();
    let mut cnt = 0;
    for i in (0..chars.len()).rev() {
        if cnt == 3 {
            out.push(',');
            cnt = 0;
        }
        out.push(chars[i]);
        cnt += 1;
    }
    let int_with_sep: String = out.chars().rev().collect();
    format!("{}{}.{}", sign, int_with_sep, dec_part)
}
