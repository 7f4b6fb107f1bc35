use crate::constants::*;
use crate::error::{ApiError, ApiResult};

pub fn validate_string_length(value: &str, field_name: &str, max_length: usize) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::validation(format!("{} cannot be empty", field_name)));
    }
    if value.len() > max_length {
        return Err(ApiError::validation(format!(
            "{} must be less than {} characters",
            field_name, max_length
        )));
    }
    Ok(())
}

/// Page size for `GET /sync`. Zero is allowed and turns the call into a head
/// probe.
pub fn validate_sync_limit(limit: Option<u32>) -> ApiResult<u32> {
    match limit {
        Some(l) if l > MAX_SYNC_LIMIT => Err(ApiError::validation(format!(
            "Limit cannot exceed {}",
            MAX_SYNC_LIMIT
        ))),
        Some(l) => Ok(l),
        None => Ok(DEFAULT_SYNC_LIMIT),
    }
}

pub fn validate_cursor(cursor: Option<i64>) -> ApiResult<i64> {
    match cursor {
        Some(c) if c < 0 => Err(ApiError::validation("Cursor cannot be negative")),
        Some(c) => Ok(c),
        None => Ok(0),
    }
}

pub fn validate_day_in_range(value: i64, field_name: &str, min: i64, max: i64) -> ApiResult<()> {
    if value < min || value > max {
        return Err(ApiError::validation(format!(
            "{} must be between {} and {}",
            field_name, min, max
        )));
    }
    Ok(())
}

pub fn validate_positive_amount(amount: i64) -> ApiResult<()> {
    if amount <= 0 {
        return Err(ApiError::validation("Amount must be a positive integer"));
    }
    if amount > MAX_AMOUNT {
        return Err(ApiError::validation(format!(
            "Amount cannot exceed {}",
            MAX_AMOUNT
        )));
    }
    Ok(())
}

/// Hand-seeded balances stay far enough from `i64` limits that entries can
/// still be added on top.
pub fn validate_balance(balance: i64) -> ApiResult<()> {
    if !(-MAX_BALANCE..=MAX_BALANCE).contains(&balance) {
        return Err(ApiError::validation(format!(
            "Balance must be between -{} and {}",
            MAX_BALANCE, MAX_BALANCE
        )));
    }
    Ok(())
}

pub fn validate_ledger_year(year: i32, field_name: &str) -> ApiResult<()> {
    if !(MIN_LEDGER_YEAR..=MAX_LEDGER_YEAR).contains(&year) {
        return Err(ApiError::validation(format!(
            "{} must fall between the years {} and {}",
            field_name, MIN_LEDGER_YEAR, MAX_LEDGER_YEAR
        )));
    }
    Ok(())
}
