//! Parsing and rendering of native and reference amounts.

use crate::oracle::{UsdAmount, Wei, PRECISION, PRECISION_DECIMALS};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    #[error("empty amount")]
    Empty,
    #[error("invalid amount {0:?}")]
    Invalid(String),
    #[error("amount {0:?} has more than 18 decimals")]
    TooPrecise(String),
    #[error("amount {0:?} overflows")]
    Overflow(String),
}

/// Parses `"1.5eth"`/`"1.5 ether"` as ether, anything else as raw wei.
pub fn parse_amount(input: &str) -> Result<Wei, UnitError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(UnitError::Empty);
    }
    let lower = trimmed.to_ascii_lowercase();
    if let Some(ether) = lower
        .strip_suffix("ether")
        .or_else(|| lower.strip_suffix("eth"))
    {
        return parse_decimal(ether.trim(), input);
    }
    let raw = lower.strip_suffix("wei").unwrap_or(&lower).trim();
    raw.parse::<Wei>()
        .map_err(|_| UnitError::Invalid(input.to_string()))
}

fn parse_decimal(value: &str, input: &str) -> Result<Wei, UnitError> {
    let (whole, frac) = value.split_once('.').unwrap_or((value, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(UnitError::Invalid(input.to_string()));
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return Err(UnitError::Invalid(input.to_string()));
    }
    if frac.len() > PRECISION_DECIMALS as usize {
        return Err(UnitError::TooPrecise(input.to_string()));
    }
    let overflow = || UnitError::Overflow(input.to_string());
    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| overflow())?
    };
    let frac_scaled: u128 = if frac.is_empty() {
        0
    } else {
        let digits: u128 = frac.parse().map_err(|_| overflow())?;
        digits * 10u128.pow(PRECISION_DECIMALS - frac.len() as u32)
    };
    whole
        .checked_mul(PRECISION)
        .and_then(|v| v.checked_add(frac_scaled))
        .ok_or_else(overflow)
}

/// Renders an 18-decimal fixed-point value, trimming trailing zeros.
pub fn format_fixed(value: u128) -> String {
    let whole = value / PRECISION;
    let frac = value % PRECISION;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:018}", frac);
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

pub fn format_eth(value: Wei) -> String {
    format!("{} ETH", format_fixed(value))
}

pub fn format_usd(value: UsdAmount) -> String {
    format!("{} USD", format_fixed(value))
}
