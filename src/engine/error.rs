use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{format_clock, ConflictInfo, Minutes};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Reservation exists but is cancelled and cannot be edited.
    NotActive(Ulid),
    HasReservations(Ulid),
    /// Bad step or operating hours.
    InvalidConfiguration(String),
    /// Duration is zero, negative, non-numeric or too long.
    InvalidDuration(String),
    /// Start is off-grid or outside operating hours.
    InvalidStart {
        start: Minutes,
        reason: &'static str,
    },
    /// The booking would run past closing time.
    InsufficientTrailingSlots {
        start: Minutes,
        needed: usize,
        available: usize,
    },
    /// Overlaps at least one active reservation.
    SlotConflict(Vec<ConflictInfo>),
    PastDate(NaiveDate),
    /// The resource lock could not be acquired in time.
    Busy(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) | EngineError::NotActive(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::HasReservations(_) => "23503",
            EngineError::InvalidConfiguration(_)
            | EngineError::InvalidDuration(_)
            | EngineError::InvalidStart { .. }
            | EngineError::InsufficientTrailingSlots { .. }
            | EngineError::PastDate(_) => "22023",
            EngineError::SlotConflict(_) => "23P01",
            EngineError::Busy(_) => "55P03",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::NotActive(_) => "not_active",
            EngineError::HasReservations(_) => "has_reservations",
            EngineError::InvalidConfiguration(_) => "invalid_configuration",
            EngineError::InvalidDuration(_) => "invalid_duration",
            EngineError::InvalidStart { .. } => "invalid_start",
            EngineError::InsufficientTrailingSlots { .. } => "insufficient_trailing_slots",
            EngineError::SlotConflict(_) => "slot_conflict",
            EngineError::PastDate(_) => "past_date",
            EngineError::Busy(_) => "busy",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// Conflicting reservations, if this is a conflict.
    pub fn conflicts(&self) -> &[ConflictInfo] {
        match self {
            EngineError::SlotConflict(c) => c,
            _ => &[],
        }
    }

    /// Scheduling rejections the caller can fix by re-fetching availability
    /// and picking again. Infrastructure failures are not in this set.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            EngineError::SlotConflict(_)
                | EngineError::Busy(_)
                | EngineError::InsufficientTrailingSlots { .. }
                | EngineError::InvalidStart { .. }
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NotActive(id) => write!(f, "reservation {id} is cancelled"),
            EngineError::HasReservations(id) => {
                write!(f, "cannot delete resource {id}: has active reservations")
            }
            EngineError::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            EngineError::InvalidDuration(msg) => write!(f, "invalid duration: {msg}"),
            EngineError::InvalidStart { start, reason } => {
                write!(f, "invalid start {}: {reason}", format_clock(*start))
            }
            EngineError::InsufficientTrailingSlots {
                start,
                needed,
                available,
            } => write!(
                f,
                "booking from {} needs {needed} slots but only {available} remain before closing",
                format_clock(*start)
            ),
            EngineError::SlotConflict(conflicts) => {
                write!(f, "slot conflict with")?;
                for (i, c) in conflicts.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(
                        f,
                        "{sep}{} [{}-{})",
                        c.reservation_id,
                        format_clock(c.start),
                        format_clock(c.end)
                    )?;
                }
                Ok(())
            }
            EngineError::PastDate(date) => write!(f, "date {date} is in the past"),
            EngineError::Busy(id) => write!(f, "resource {id} busy, retry with fresh availability"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
