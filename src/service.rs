use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{
    duration_from_hours, resolve_range, validate_date, AvailabilityView, Engine, EngineError, ResolvedRange,
};
use crate::model::*;

/// What a client asks for. `duration_hours` may be fractional.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub start: Minutes,
    pub duration_hours: f64,
    pub customer: CustomerInfo,
}

impl BookingRequest {
    pub fn new(resource_id: Ulid, date: NaiveDate, start: Minutes, duration_hours: f64) -> Self {
        Self {
            id: Ulid::new(),
            resource_id,
            date,
            start,
            duration_hours,
            customer: CustomerInfo::default(),
        }
    }

    pub fn with_customer(mut self, customer: CustomerInfo) -> Self {
        self.customer = customer;
        self
    }

    fn to_new_reservation(&self) -> Result<NewReservation, EngineError> {
        Ok(NewReservation {
            id: self.id,
            resource_id: self.resource_id,
            date: self.date,
            start: self.start,
            duration: duration_from_hours(self.duration_hours)?,
            customer: self.customer.clone(),
        })
    }
}

/// Where one booking attempt stands.
///
/// `Draft → Resolved → Committed | Rejected`, or `Draft → Invalid`.
/// Only `Committed` means the reservation exists.
#[derive(Debug)]
pub enum AttemptState {
    Draft,
    /// The range resolved against the last fetched view. Advisory only.
    Resolved {
        range: ResolvedRange,
        view: AvailabilityView,
    },
    Committed(Reservation),
    /// The store refused a range that had resolved cleanly: someone else got
    /// there first, or the lock timed out. Carries availability fetched after
    /// the refusal.
    Rejected {
        error: EngineError,
        availability: Vec<SlotAvailability>,
    },
    Invalid(EngineError),
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Committed(_) | AttemptState::Rejected { .. } | AttemptState::Invalid(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            AttemptState::Draft => "draft",
            AttemptState::Resolved { .. } => "resolved",
            AttemptState::Committed(_) => "committed",
            AttemptState::Rejected { .. } => "rejected",
            AttemptState::Invalid(_) => "invalid",
        }
    }
}

/// One client's path from picking a slot to a committed reservation.
/// Abandoning it before `commit` leaves nothing behind.
#[derive(Debug)]
pub struct BookingAttempt {
    request: BookingRequest,
    state: AttemptState,
}

impl BookingAttempt {
    pub fn new(request: BookingRequest) -> Self {
        Self {
            request,
            state: AttemptState::Draft,
        }
    }

    pub fn request(&self) -> &BookingRequest {
        &self.request
    }

    pub fn state(&self) -> &AttemptState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Changing the date drops any resolved range. Returns false once terminal.
    pub fn set_date(&mut self, date: NaiveDate) -> bool {
        self.edit(|r| r.date = date)
    }

    pub fn set_start(&mut self, start: Minutes) -> bool {
        self.edit(|r| r.start = start)
    }

    pub fn set_duration(&mut self, duration_hours: f64) -> bool {
        self.edit(|r| r.duration_hours = duration_hours)
    }

    fn edit(&mut self, f: impl FnOnce(&mut BookingRequest)) -> bool {
        if self.is_terminal() {
            return false;
        }
        f(&mut self.request);
        self.state = AttemptState::Draft;
        true
    }

    /// Fetch a fresh view and resolve the requested range against it.
    /// Bad input and visible conflicts end the attempt as `Invalid`.
    pub async fn resolve(&mut self, engine: &Engine) -> Result<&AttemptState, EngineError> {
        if self.is_terminal() {
            return Ok(&self.state);
        }
        self.state = match self.try_resolve(engine).await {
            Ok((range, view)) => AttemptState::Resolved { range, view },
            Err(e @ EngineError::WalError(_)) => return Err(e),
            Err(e) => {
                debug!("attempt {} invalid: {e}", self.request.id);
                AttemptState::Invalid(e)
            }
        };
        Ok(&self.state)
    }

    async fn try_resolve(&self, engine: &Engine) -> Result<(ResolvedRange, AvailabilityView), EngineError> {
        let new = self.request.to_new_reservation()?;
        validate_date(new.date, engine.config.reject_past_dates)?;
        let view = engine.availability_view(new.resource_id, new.date, None).await?;
        let range = resolve_range(new.start, new.duration, &view.grid(), view.step, view.hours.close, &view)?;
        Ok((range, view))
    }

    /// Commit through the store. A `Draft` is resolved first.
    ///
    /// Infrastructure failures come back as `Err` and leave the attempt
    /// `Resolved`, so the caller may retry the same commit.
    pub async fn commit(&mut self, engine: &Engine) -> Result<&AttemptState, EngineError> {
        if matches!(self.state, AttemptState::Draft) {
            self.resolve(engine).await?;
        }
        if !matches!(self.state, AttemptState::Resolved { .. }) {
            return Ok(&self.state);
        }

        let new = self.request.to_new_reservation()?;
        self.state = match engine.create_reservation(new).await {
            Ok(reservation) => AttemptState::Committed(reservation),
            Err(e @ EngineError::WalError(_)) => return Err(e),
            Err(e) if e.is_scheduling() => {
                info!("attempt {} rejected at commit: {e}", self.request.id);
                let availability = self.availability_after_rejection(engine).await;
                AttemptState::Rejected { error: e, availability }
            }
            Err(e) => AttemptState::Invalid(e),
        };
        Ok(&self.state)
    }

    /// Best effort: the refusal is the answer, fresh slots are a courtesy.
    async fn availability_after_rejection(&self, engine: &Engine) -> Vec<SlotAvailability> {
        let fetched = match duration_from_hours(self.request.duration_hours) {
            Ok(duration) => {
                engine
                    .get_availability(self.request.resource_id, self.request.date, duration)
                    .await
            }
            Err(e) => Err(e),
        };
        fetched.unwrap_or_else(|e| {
            warn!("attempt {}: availability unavailable after rejection: {e}", self.request.id);
            Vec::new()
        })
    }
}

/// The four client-facing operations over one engine.
#[derive(Clone)]
pub struct ReservationService {
    engine: Arc<Engine>,
}

impl ReservationService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn get_availability(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        duration_hours: f64,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        let duration = duration_from_hours(duration_hours)?;
        self.engine.get_availability(resource_id, date, duration).await
    }

    pub async fn create_reservation(&self, request: BookingRequest) -> Result<Reservation, EngineError> {
        self.engine.create_reservation(request.to_new_reservation()?).await
    }

    pub async fn update_reservation(
        &self,
        id: Ulid,
        date: NaiveDate,
        start: Minutes,
        duration_hours: f64,
    ) -> Result<Reservation, EngineError> {
        let duration = duration_from_hours(duration_hours)?;
        self.engine.update_reservation(id, date, start, duration).await
    }

    /// Returns whether anything changed; a repeated cancel is `Ok(false)`.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<bool, EngineError> {
        self.engine.cancel_reservation(id).await
    }

    pub fn attempt(&self, request: BookingRequest) -> BookingAttempt {
        BookingAttempt::new(request)
    }
}
