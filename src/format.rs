//! Human display of prices. JSON output keeps canonical decimal strings;
//! these helpers are for tables only.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::DisplayConfig;
use crate::margin::DerivedPrice;

/// Shown in place of a price that could not be determined.
pub const UNDETERMINED: &str = "n/a";

fn group_int_digits(int_part: &str) -> String {
    let mut out = String::with_capacity(int_part.len() + int_part.len() / 3);
    let len = int_part.len();
    for (i, ch) in int_part.chars().enumerate() {
        out.push(ch);
        let remaining = len.saturating_sub(i + 1);
        if remaining > 0 && remaining % 3 == 0 {
            out.push(',');
        }
    }
    out
}

fn pad_fraction_to_dp(s: &str, dp: u32) -> String {
    let (int_part, frac_part) = s.split_once('.').unwrap_or((s, ""));
    if dp == 0 {
        return int_part.to_string();
    }
    let mut frac: String = frac_part.chars().take(dp as usize).collect();
    while frac.len() < dp as usize {
        frac.push('0');
    }
    format!("{int_part}.{frac}")
}

/// Format a price for display.
///
/// Rounds half away from zero when `decimals` is set, strips trailing zeros
/// unless `fixed_decimals` asks for padding, and groups thousands on request.
pub fn format_price(value: Decimal, display: &DisplayConfig) -> String {
    let rounded = match display.decimals {
        Some(dp) => value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero),
        None => value,
    };

    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let mut s = rounded.abs().normalize().to_string();
    if display.fixed_decimals {
        if let Some(dp) = display.decimals {
            s = pad_fraction_to_dp(&s, dp);
        }
    }
    if display.grouping {
        s = match s.split_once('.') {
            Some((int_part, frac)) => format!("{}.{frac}", group_int_digits(int_part)),
            None => group_int_digits(&s),
        };
    }

    if negative {
        format!("-{s}")
    } else {
        s
    }
}

/// Format a derived local-currency price, with the configured symbol.
pub fn format_derived(price: &DerivedPrice, display: &DisplayConfig) -> String {
    if !price.determinable {
        return UNDETERMINED.to_string();
    }
    let formatted = format_price(price.value, display);
    match display.symbol.as_deref() {
        Some(symbol) => format!("{symbol}{formatted}"),
        None => formatted,
    }
}
