use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Wall-clock minutes since local midnight — the only time-of-day type.
pub type Minutes = i32;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Step used when a caller supplies no usable one.
pub const DEFAULT_STEP_MINUTES: Minutes = 60;

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> Minutes {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Daily operating window `[open, close)`. `close` may be 24:00.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    pub open: Minutes,
    pub close: Minutes,
}

impl OperatingHours {
    pub fn new(open: Minutes, close: Minutes) -> Result<Self, EngineError> {
        if open < 0 || close > MINUTES_PER_DAY {
            return Err(EngineError::InvalidConfiguration(format!(
                "operating hours {}-{} outside 00:00-24:00",
                format_clock(open.max(0)),
                format_clock(close.min(MINUTES_PER_DAY)),
            )));
        }
        if open >= close {
            return Err(EngineError::InvalidConfiguration(format!(
                "opening time {} is not before closing time {}",
                format_clock(open),
                format_clock(close),
            )));
        }
        Ok(Self { open, close })
    }

    pub fn span(&self) -> Span {
        Span::new(self.open, self.close)
    }
}

/// Grid granularity in minutes. Invariant: `0 < step <= 24h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStep(Minutes);

impl SlotStep {
    pub fn new(minutes: Minutes) -> Result<Self, EngineError> {
        if minutes <= 0 || minutes > MINUTES_PER_DAY {
            return Err(EngineError::InvalidConfiguration(format!(
                "slot step must be within 1..={MINUTES_PER_DAY} minutes, got {minutes}"
            )));
        }
        Ok(Self(minutes))
    }

    /// Lenient constructor for caller-driven values: an out-of-range step
    /// becomes [`DEFAULT_STEP_MINUTES`] instead of a degenerate grid.
    pub fn or_default(minutes: Minutes) -> Self {
        match Self::new(minutes) {
            Ok(step) => step,
            Err(e) => {
                tracing::warn!("{e}; using {DEFAULT_STEP_MINUTES} minute step");
                Self::default()
            }
        }
    }

    pub fn minutes(&self) -> Minutes {
        self.0
    }

    /// Number of grid slots a booking of `duration` consumes (ceiling).
    pub fn slots_for(&self, duration: Minutes) -> usize {
        if duration <= 0 {
            return 0;
        }
        ((duration + self.0 - 1) / self.0) as usize
    }
}

impl Default for SlotStep {
    fn default() -> Self {
        Self(DEFAULT_STEP_MINUTES)
    }
}

/// Parse `HH:MM` (24h). `24:00` is accepted as end-of-day.
pub fn parse_clock(s: &str) -> Option<Minutes> {
    let s = s.trim();
    if s == "24:00" {
        return Some(MINUTES_PER_DAY);
    }
    let t = NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()?;
    if t.second() != 0 {
        return None;
    }
    Some((t.hour() * 60 + t.minute()) as Minutes)
}

pub fn format_clock(m: Minutes) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Parse `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

/// Opaque to the engine apart from length limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    pub contact_number: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub start: Minutes,
    pub duration: Minutes,
    pub status: ReservationStatus,
    pub customer: CustomerInfo,
    /// `hourly_rate × duration` at commit time, in minor currency units.
    pub quoted_price: Option<u64>,
}

impl Reservation {
    pub fn end(&self) -> Minutes {
        self.start + self.duration
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end())
    }

    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    pub fn conflict_info(&self) -> ConflictInfo {
        ConflictInfo {
            reservation_id: self.id,
            date: self.date,
            start: self.start,
            end: self.end(),
        }
    }
}

/// A booking request as it reaches the engine: times already parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub start: Minutes,
    pub duration: Minutes,
    pub customer: CustomerInfo,
}

/// An existing reservation that blocks a request. Carried back to the caller
/// so it can re-render without another fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub reservation_id: Ulid,
    pub date: NaiveDate,
    pub start: Minutes,
    pub end: Minutes,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub hours: OperatingHours,
    pub step: SlotStep,
    /// Minor currency units per hour.
    pub hourly_rate: Option<u64>,
    /// Active reservations per date, each list sorted by `start`.
    pub days: BTreeMap<NaiveDate, Vec<Reservation>>,
    /// Cancelled reservations stay addressable so a second cancel is a no-op.
    pub cancelled: HashMap<Ulid, Reservation>,
    /// Set under the write lock when the resource is removed; writers queued
    /// on a stale handle must not commit into it.
    pub deleted: bool,
    active_dates: HashMap<Ulid, NaiveDate>,
}

impl ResourceState {
    pub fn new(
        id: Ulid,
        name: Option<String>,
        hours: OperatingHours,
        step: SlotStep,
        hourly_rate: Option<u64>,
    ) -> Self {
        Self {
            id,
            name,
            hours,
            step,
            hourly_rate,
            days: BTreeMap::new(),
            cancelled: HashMap::new(),
            deleted: false,
            active_dates: HashMap::new(),
        }
    }

    /// Insert an active reservation maintaining sort order by start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let day = self.days.entry(reservation.date).or_default();
        let pos = day
            .binary_search_by_key(&reservation.start, |r| r.start)
            .unwrap_or_else(|e| e);
        self.active_dates.insert(reservation.id, reservation.date);
        day.insert(pos, reservation);
    }

    /// Remove an active reservation by id.
    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let date = self.active_dates.remove(&id)?;
        let day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|r| r.id == id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(removed)
    }

    /// Move an active reservation to the cancelled set.
    pub fn cancel_reservation(&mut self, id: Ulid) -> bool {
        match self.remove_reservation(id) {
            Some(mut r) => {
                r.status = ReservationStatus::Cancelled;
                self.cancelled.insert(id, r);
                true
            }
            None => false,
        }
    }

    pub fn get_reservation(&self, id: &Ulid) -> Option<&Reservation> {
        if let Some(date) = self.active_dates.get(id) {
            return self.days.get(date)?.iter().find(|r| r.id == *id);
        }
        self.cancelled.get(id)
    }

    pub fn active_on(&self, date: NaiveDate) -> &[Reservation] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn active_count(&self) -> usize {
        self.active_dates.len()
    }

    /// Active reservations on `date` whose span overlaps `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, date: NaiveDate, query: &Span) -> impl Iterator<Item = &Reservation> {
        let day = self.active_on(date);
        let right_bound = day.partition_point(|r| r.start < query.end);
        day[..right_bound]
            .iter()
            .filter(move |r| r.end() > query.start)
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            hours: self.hours,
            step: self.step,
            hourly_rate: self.hourly_rate,
        }
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        hours: OperatingHours,
        step: SlotStep,
        hourly_rate: Option<u64>,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        hours: OperatingHours,
        step: SlotStep,
        hourly_rate: Option<u64>,
    },
    ResourceDeleted {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationRescheduled {
        id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        start: Minutes,
        duration: Minutes,
        quoted_price: Option<u64>,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    /// Short tag used in notification payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ResourceCreated { .. } => "resource_created",
            Event::ResourceUpdated { .. } => "resource_updated",
            Event::ResourceDeleted { .. } => "resource_deleted",
            Event::ReservationCreated { .. } => "reservation_created",
            Event::ReservationRescheduled { .. } => "reservation_rescheduled",
            Event::ReservationCancelled { .. } => "reservation_cancelled",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub hours: OperatingHours,
    pub step: SlotStep,
    pub hourly_rate: Option<u64>,
}

/// One row of `GetAvailability`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAvailability {
    pub start: Minutes,
    /// The single-step probe `[start, start + step)` is occupied.
    pub booked: bool,
    /// A booking of the requested duration can start here.
    pub startable: bool,
    pub conflicts: Vec<Ulid>,
}
