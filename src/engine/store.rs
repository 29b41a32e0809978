use std::time::Instant;

use chrono::NaiveDate;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::check_no_conflict;
use super::{Engine, EngineError};

/// The reservation store: the only place reservations are inserted, moved
/// or cancelled. Every write here runs under the resource's write lock,
/// and the overlap check is repeated against live state inside that lock.
impl Engine {
    /// Take the resource's write lock, giving up after `lock_timeout`.
    pub(super) async fn lock_resource(
        &self,
        resource_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let wait_start = Instant::now();
        let guard = tokio::time::timeout(self.config.lock_timeout, rs.write_owned())
            .await
            .map_err(|_| {
                warn!("lock wait on resource {resource_id} exceeded {:?}", self.config.lock_timeout);
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                EngineError::Busy(resource_id)
            })?;
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(wait_start.elapsed().as_secs_f64());
        if guard.deleted {
            return Err(EngineError::NotFound(resource_id));
        }
        Ok(guard)
    }

    /// Check-and-insert. Fails with `SlotConflict` if any active reservation
    /// on the same date overlaps.
    pub(super) async fn store_insert(
        &self,
        rs: &mut ResourceState,
        reservation: Reservation,
    ) -> Result<Ulid, EngineError> {
        if self.entity_to_resource.contains_key(&reservation.id) {
            return Err(EngineError::AlreadyExists(reservation.id));
        }
        if rs.active_on(reservation.date).len() >= MAX_RESERVATIONS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many reservations on this date"));
        }
        check_no_conflict(rs, reservation.date, &reservation.span(), None)?;

        let id = reservation.id;
        let event = Event::ReservationCreated { reservation };
        self.persist_and_apply(rs.id, rs, &event).await?;
        Ok(id)
    }

    /// Move an active reservation. Delete-old and insert-new are one WAL
    /// record, so a failure leaves the original in place.
    pub(super) async fn store_replace(
        &self,
        rs: &mut ResourceState,
        id: Ulid,
        date: NaiveDate,
        span: Span,
        quoted_price: Option<u64>,
    ) -> Result<(), EngineError> {
        match rs.get_reservation(&id) {
            Some(r) if r.is_active() => {}
            Some(_) => return Err(EngineError::NotActive(id)),
            None => return Err(EngineError::NotFound(id)),
        }
        check_no_conflict(rs, date, &span, Some(id))?;

        let event = Event::ReservationRescheduled {
            id,
            resource_id: rs.id,
            date,
            start: span.start,
            duration: span.duration(),
            quoted_price,
        };
        self.persist_and_apply(rs.id, rs, &event).await
    }

    /// Soft-delete. Returns `false` when the reservation was already cancelled.
    pub(super) async fn store_delete(&self, rs: &mut ResourceState, id: Ulid) -> Result<bool, EngineError> {
        match rs.get_reservation(&id) {
            Some(r) if r.is_active() => {}
            Some(_) => {
                debug!("reservation {id} already cancelled");
                return Ok(false);
            }
            None => return Err(EngineError::NotFound(id)),
        }
        let event = Event::ReservationCancelled { id, resource_id: rs.id };
        self.persist_and_apply(rs.id, rs, &event).await?;
        Ok(true)
    }

    /// Active reservations on one resource, for one date or all dates.
    pub async fn list_active(
        &self,
        resource_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(match date {
            Some(d) => guard.active_on(d).to_vec(),
            None => guard.days.values().flatten().cloned().collect(),
        })
    }
}
