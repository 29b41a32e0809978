use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{free_windows, view_of, AvailabilityView};
use super::conflict::{quote_price, validate_duration};
use super::{Engine, EngineError};

impl Engine {
    /// Snapshot of one resource/date. `exclude` hides a reservation that is
    /// about to be moved, so its current slots read as free.
    pub async fn availability_view(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        exclude: Option<Ulid>,
    ) -> Result<AvailabilityView, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(view_of(&guard, date, exclude))
    }

    /// Every grid slot of the day, tagged booked / startable for `duration`.
    pub async fn get_availability(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        duration: Minutes,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        validate_duration(duration)?;
        metrics::counter!(crate::observability::AVAILABILITY_QUERIES_TOTAL).increment(1);
        let view = self.availability_view(resource_id, date, None).await?;
        Ok(view.for_duration(duration))
    }

    /// Unbooked stretches of the operating window, optionally dropping the
    /// ones shorter than `min_duration`.
    pub async fn free_windows(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        min_duration: Option<Minutes>,
    ) -> Result<Vec<Span>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let mut free = free_windows(&guard, date);
        if let Some(min) = min_duration {
            free.retain(|s| s.duration() >= min);
        }
        Ok(free)
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut result = Vec::with_capacity(resources.len());
        for rs in resources {
            result.push(rs.read().await.info());
        }
        result.sort_by_key(|r| r.id);
        result
    }

    pub async fn get_resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let info = rs.read().await.info();
        Ok(info)
    }

    /// Look up a reservation, active or cancelled.
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let resource_id = self.get_resource_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        guard.get_reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// What a booking of `duration` would cost on this resource right now.
    pub async fn quote(&self, resource_id: Ulid, duration: Minutes) -> Result<Option<u64>, EngineError> {
        validate_duration(duration)?;
        let info = self.get_resource_info(resource_id).await?;
        Ok(quote_price(info.hourly_rate, duration))
    }
}
