//! Margin-adjusted selling prices.
//!
//! All functions are pure. Rates for non-USD currencies are quoted as
//! target-currency-per-USD, so they are inverted before the margin applies.

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// A computed price. `determinable` is false when an input rate made the
/// price undefined; `value` is then zero and must not be shown as a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedPrice {
    pub value: Decimal,
    pub determinable: bool,
}

impl DerivedPrice {
    pub fn known(value: Decimal) -> Self {
        Self {
            value,
            determinable: true,
        }
    }

    pub fn undetermined() -> Self {
        Self {
            value: Decimal::ZERO,
            determinable: false,
        }
    }
}

/// Margin percentages must not be negative.
pub fn validate_margins(
    usd_margin_pct: Decimal,
    other_currencies_margin_pct: Decimal,
) -> Result<()> {
    if usd_margin_pct < Decimal::ZERO {
        bail!("USD margin must not be negative, got {usd_margin_pct}");
    }
    if other_currencies_margin_pct < Decimal::ZERO {
        bail!("Other-currency margin must not be negative, got {other_currencies_margin_pct}");
    }
    Ok(())
}

fn markup(pct: Decimal) -> Decimal {
    Decimal::ONE + pct / HUNDRED
}

/// `base * (1 + pct/100)`.
pub fn usd_price(base_rate: Decimal, usd_margin_pct: Decimal) -> DerivedPrice {
    match base_rate.checked_mul(markup(usd_margin_pct)) {
        Some(value) => DerivedPrice::known(value),
        None => DerivedPrice::undetermined(),
    }
}

/// USD-per-target for a target-per-USD rate. Zero and negative rates have no
/// meaningful inverse.
pub fn invert_rate(target_per_usd: Decimal) -> DerivedPrice {
    if target_per_usd <= Decimal::ZERO {
        return DerivedPrice::undetermined();
    }
    match Decimal::ONE.checked_div(target_per_usd) {
        Some(value) => DerivedPrice::known(value),
        None => DerivedPrice::undetermined(),
    }
}

/// `base * (1 / target_per_usd) * (1 + pct/100)`.
pub fn other_currency_price(
    base_rate: Decimal,
    target_per_usd: Decimal,
    other_margin_pct: Decimal,
) -> DerivedPrice {
    let inverse = invert_rate(target_per_usd);
    if !inverse.determinable {
        return inverse;
    }
    base_rate
        .checked_mul(inverse.value)
        .and_then(|v| v.checked_mul(markup(other_margin_pct)))
        .map(DerivedPrice::known)
        .unwrap_or_else(DerivedPrice::undetermined)
}
