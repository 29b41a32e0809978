use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::view_of;
use super::conflict::{
    quote_price, validate_customer, validate_date, validate_duration, validate_hourly_rate, validate_name,
};
use super::range::resolve_range;
use super::{Engine, EngineError, WalCommand};

fn count_rejection(e: &EngineError) {
    metrics::counter!(crate::observability::RESERVATIONS_REJECTED_TOTAL, "reason" => e.reason())
        .increment(1);
}

impl Engine {
    pub async fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        hours: OperatingHours,
        step: SlotStep,
        hourly_rate: Option<u64>,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        validate_name(&name)?;
        validate_hourly_rate(hourly_rate)?;

        let gate = self.compaction_gate.read().await;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::ResourceCreated { id, name: name.clone(), hours, step, hourly_rate };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, name, hours, step, hourly_rate);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        drop(gate);
        self.notify.send(id, &event);
        Ok(())
    }

    /// Replace a resource's master data. Existing reservations stay as they
    /// are even if they no longer sit on the new grid.
    pub async fn update_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        hours: OperatingHours,
        step: SlotStep,
        hourly_rate: Option<u64>,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        validate_hourly_rate(hourly_rate)?;
        let mut guard = self.lock_resource(id).await?;
        let event = Event::ResourceUpdated { id, name, hours, step, hourly_rate };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.lock_resource(id).await?;
        if guard.active_count() > 0 {
            return Err(EngineError::HasReservations(id));
        }

        let event = Event::ResourceDeleted { id };
        self.wal_append(&event).await?;
        guard.deleted = true;
        self.state.remove(&id);
        self.entity_to_resource.retain(|_, rid| *rid != id);
        drop(guard);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    /// Validate and commit a booking. The range is resolved against a view
    /// computed under the write lock, and the store re-checks overlap before
    /// the insert, so two racing callers can never both succeed.
    pub async fn create_reservation(&self, req: NewReservation) -> Result<Reservation, EngineError> {
        let result = self.create_reservation_inner(req).await;
        match &result {
            Ok(r) => {
                metrics::counter!(crate::observability::RESERVATIONS_COMMITTED_TOTAL).increment(1);
                info!(
                    "reservation {} committed on {} {} {}+{}m",
                    r.id,
                    r.resource_id,
                    r.date,
                    format_clock(r.start),
                    r.duration
                );
            }
            Err(e) => {
                count_rejection(e);
                debug!("reservation rejected: {e}");
            }
        }
        result
    }

    async fn create_reservation_inner(&self, req: NewReservation) -> Result<Reservation, EngineError> {
        validate_duration(req.duration)?;
        validate_date(req.date, self.config.reject_past_dates)?;
        validate_customer(&req.customer)?;

        let mut guard = self.lock_resource(req.resource_id).await?;
        let view = view_of(&guard, req.date, None);
        let range = resolve_range(req.start, req.duration, &view.grid(), guard.step, guard.hours.close, &view)?;

        let reservation = Reservation {
            id: req.id,
            resource_id: req.resource_id,
            date: req.date,
            start: range.booking.start,
            duration: range.booking.duration(),
            status: ReservationStatus::Active,
            customer: req.customer,
            quoted_price: quote_price(guard.hourly_rate, req.duration),
        };
        self.store_insert(&mut guard, reservation.clone()).await?;
        Ok(reservation)
    }

    /// Move an active reservation to a new date/start/duration.
    /// The reservation's own current slots count as free for the move.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        date: NaiveDate,
        start: Minutes,
        duration: Minutes,
    ) -> Result<Reservation, EngineError> {
        let result = self.update_reservation_inner(id, date, start, duration).await;
        match &result {
            Ok(r) => info!("reservation {id} moved to {} {}+{}m", r.date, format_clock(r.start), r.duration),
            Err(e) => {
                count_rejection(e);
                debug!("reschedule of {id} rejected: {e}");
            }
        }
        result
    }

    async fn update_reservation_inner(
        &self,
        id: Ulid,
        date: NaiveDate,
        start: Minutes,
        duration: Minutes,
    ) -> Result<Reservation, EngineError> {
        validate_duration(duration)?;
        validate_date(date, self.config.reject_past_dates)?;

        let (_resource_id, mut guard) = self.resolve_entity_write(&id).await?;
        match guard.get_reservation(&id) {
            Some(r) if r.is_active() => {}
            Some(_) => return Err(EngineError::NotActive(id)),
            None => return Err(EngineError::NotFound(id)),
        }

        let view = view_of(&guard, date, Some(id));
        let range = resolve_range(start, duration, &view.grid(), guard.step, guard.hours.close, &view)?;
        let quoted = quote_price(guard.hourly_rate, duration);
        self.store_replace(&mut guard, id, date, range.booking, quoted).await?;

        guard.get_reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Cancel a reservation. Cancelling twice is a no-op; returns whether
    /// this call changed anything.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<bool, EngineError> {
        let (_resource_id, mut guard) = self.resolve_entity_write(&id).await?;
        let changed = self.store_delete(&mut guard, id).await?;
        if changed {
            metrics::counter!(crate::observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
            info!("reservation {id} cancelled");
        }
        Ok(changed)
    }

    /// Rewrite the WAL as one snapshot of current state. Every resource stays
    /// write-locked until the writer has swapped the file, so no commit can
    /// land in the old log after the snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let mut resources: Vec<_> = self.state.iter().map(|e| (*e.key(), e.value().clone())).collect();
        resources.sort_unstable_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(resources.len());
        for (_, rs) in resources {
            guards.push(rs.write_owned().await);
        }

        let mut events = Vec::new();
        for guard in guards.iter().filter(|g| !g.deleted) {
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                hours: guard.hours,
                step: guard.step,
                hourly_rate: guard.hourly_rate,
            });
            for reservation in guard.days.values().flatten().chain(guard.cancelled.values()) {
                events.push(Event::ReservationCreated { reservation: reservation.clone() });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
