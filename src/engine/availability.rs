use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::grid::slot_grid;
use super::overlap::overlaps;
use super::range::resolve_range;

// ── Availability View ─────────────────────────────────────────────

/// One grid point, probed as a single step `[start, start + step)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotState {
    pub start: Minutes,
    pub booked: bool,
    pub conflicts: Vec<ConflictInfo>,
}

/// Point-in-time snapshot of which slots are occupied on one resource/date.
/// Advisory only: the authoritative check runs again under the write lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityView {
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub hours: OperatingHours,
    pub step: SlotStep,
    pub slots: Vec<SlotState>,
}

impl AvailabilityView {
    pub fn grid(&self) -> Vec<Minutes> {
        self.slots.iter().map(|s| s.start).collect()
    }

    pub fn slot(&self, start: Minutes) -> Option<&SlotState> {
        self.slots
            .binary_search_by_key(&start, |s| s.start)
            .ok()
            .map(|i| &self.slots[i])
    }

    pub fn is_booked(&self, start: Minutes) -> bool {
        self.slot(start).is_some_and(|s| s.booked)
    }

    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.booked).count()
    }

    /// Annotate every slot with whether a booking of `duration` can start there.
    pub fn for_duration(&self, duration: Minutes) -> Vec<SlotAvailability> {
        let grid = self.grid();
        self.slots
            .iter()
            .map(|s| SlotAvailability {
                start: s.start,
                booked: s.booked,
                startable: !s.booked
                    && resolve_range(s.start, duration, &grid, self.step, self.hours.close, self).is_ok(),
                conflicts: s.conflicts.iter().map(|c| c.reservation_id).collect(),
            })
            .collect()
    }
}

/// Tag each grid slot of `date` as free or booked against `reservations`.
///
/// Only active reservations on `date` count; `exclude` skips one reservation
/// (the one being edited).
pub fn compute(
    resource_id: Ulid,
    date: NaiveDate,
    hours: OperatingHours,
    step: SlotStep,
    reservations: &[Reservation],
    exclude: Option<Ulid>,
) -> AvailabilityView {
    let relevant: Vec<&Reservation> = reservations
        .iter()
        .filter(|r| r.is_active() && r.date == date && Some(r.id) != exclude)
        .collect();

    let slots = slot_grid(&hours, step)
        .into_iter()
        .map(|t| {
            let conflicts: Vec<ConflictInfo> = relevant
                .iter()
                .filter(|r| overlaps(t, step.minutes(), r.start, r.duration))
                .map(|r| r.conflict_info())
                .collect();
            SlotState {
                start: t,
                booked: !conflicts.is_empty(),
                conflicts,
            }
        })
        .collect();

    AvailabilityView {
        resource_id,
        date,
        hours,
        step,
        slots,
    }
}

/// View over a resource's current state.
pub fn view_of(resource: &ResourceState, date: NaiveDate, exclude: Option<Ulid>) -> AvailabilityView {
    compute(
        resource.id,
        date,
        resource.hours,
        resource.step,
        resource.active_on(date),
        exclude,
    )
}

// ── Free windows ──────────────────────────────────────────────────

/// Operating window minus active reservations, as disjoint spans.
pub fn free_windows(resource: &ResourceState, date: NaiveDate) -> Vec<Span> {
    let mut taken: Vec<Span> = resource.active_on(date).iter().map(|r| r.span()).collect();
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);
    subtract_intervals(&[resource.hours.span()], &taken)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
