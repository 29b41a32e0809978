use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Convert a caller-supplied hour count into whole minutes.
pub fn duration_from_hours(hours: f64) -> Result<Minutes, EngineError> {
    if !hours.is_finite() {
        return Err(EngineError::InvalidDuration(format!("{hours} is not a number")));
    }
    if hours <= 0.0 {
        return Err(EngineError::InvalidDuration(format!("{hours}h is not positive")));
    }
    let minutes = (hours * 60.0).round();
    if minutes < 1.0 {
        return Err(EngineError::InvalidDuration(format!("{hours}h rounds to zero minutes")));
    }
    if minutes > MAX_DURATION_MINUTES as f64 {
        return Err(EngineError::InvalidDuration(format!("{hours}h exceeds one day")));
    }
    Ok(minutes as Minutes)
}

pub(crate) fn validate_duration(duration: Minutes) -> Result<(), EngineError> {
    if duration <= 0 {
        return Err(EngineError::InvalidDuration(format!("{duration} minutes is not positive")));
    }
    if duration > MAX_DURATION_MINUTES {
        return Err(EngineError::InvalidDuration(format!("{duration} minutes exceeds one day")));
    }
    Ok(())
}

pub(crate) fn validate_date(date: NaiveDate, reject_past: bool) -> Result<(), EngineError> {
    if reject_past && date < today() {
        return Err(EngineError::PastDate(date));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
    Ok(())
}

pub(crate) fn validate_customer(customer: &CustomerInfo) -> Result<(), EngineError> {
    if customer.name.len() > MAX_CUSTOMER_NAME_LEN {
        return Err(EngineError::LimitExceeded("customer name too long"));
    }
    if customer.contact_number.as_ref().is_some_and(|c| c.len() > MAX_CONTACT_LEN) {
        return Err(EngineError::LimitExceeded("contact number too long"));
    }
    if customer.email.as_ref().is_some_and(|e| e.len() > MAX_EMAIL_LEN) {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    if customer.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    if customer.address.as_ref().is_some_and(|a| a.len() > MAX_ADDRESS_LEN) {
        return Err(EngineError::LimitExceeded("address too long"));
    }
    Ok(())
}

pub(crate) fn validate_hourly_rate(hourly_rate: Option<u64>) -> Result<(), EngineError> {
    if hourly_rate.is_some_and(|r| r > MAX_HOURLY_RATE) {
        return Err(EngineError::LimitExceeded("hourly rate too large"));
    }
    Ok(())
}

/// Authoritative overlap check against the resource's current state.
/// Caller must hold the write lock across this check and the insert.
pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    date: NaiveDate,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let conflicts: Vec<ConflictInfo> = rs
        .overlapping(date, span)
        .filter(|r| Some(r.id) != exclude)
        .map(Reservation::conflict_info)
        .collect();
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(EngineError::SlotConflict(conflicts))
    }
}

/// Price for `duration` at `hourly_rate`, rounded to the nearest minor unit.
pub(crate) fn quote_price(hourly_rate: Option<u64>, duration: Minutes) -> Option<u64> {
    let rate = hourly_rate?;
    let minutes = u128::try_from(duration).ok()?;
    u64::try_from((u128::from(rate) * minutes + 30) / 60).ok()
}
