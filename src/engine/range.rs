use crate::model::*;

use super::availability::AvailabilityView;
use super::grid::slot_fits;
use super::EngineError;

/// The exact slots a booking consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRange {
    /// Consecutive grid points, first is the requested start.
    pub slots: Vec<Minutes>,
    /// The booking's own interval `[start, start + duration)`.
    pub booking: Span,
    /// Slot-rounded interval; may extend past `booking` by a partial tail slot.
    pub covered: Span,
}

/// Resolve the contiguous slot range for a booking of `duration` starting at
/// `start`.
///
/// The slot count is `ceil(duration / step)`: a 2.5h booking on an hourly
/// grid consumes three slots and leaves the last half hour unused.
/// Any change to date or duration invalidates the result; resolve again.
pub fn resolve_range(
    start: Minutes,
    duration: Minutes,
    grid: &[Minutes],
    step: SlotStep,
    close: Minutes,
    view: &AvailabilityView,
) -> Result<ResolvedRange, EngineError> {
    if duration <= 0 {
        return Err(EngineError::InvalidDuration(format!(
            "{duration} minutes is not positive"
        )));
    }
    let needed = step.slots_for(duration);

    let idx = grid
        .binary_search(&start)
        .map_err(|_| EngineError::InvalidStart {
            start,
            reason: "not a slot boundary within operating hours",
        })?;

    let slots: Vec<Minutes> = grid[idx..]
        .iter()
        .copied()
        .take_while(|&t| slot_fits(t, step, close))
        .take(needed)
        .collect();
    if slots.len() < needed {
        return Err(EngineError::InsufficientTrailingSlots {
            start,
            needed,
            available: slots.len(),
        });
    }

    let mut conflicts: Vec<ConflictInfo> = Vec::new();
    for &t in &slots {
        if let Some(state) = view.slot(t)
            && state.booked {
                for c in &state.conflicts {
                    if !conflicts.iter().any(|seen| seen.reservation_id == c.reservation_id) {
                        conflicts.push(c.clone());
                    }
                }
            }
    }
    if !conflicts.is_empty() {
        return Err(EngineError::SlotConflict(conflicts));
    }

    let last = slots[slots.len() - 1];
    Ok(ResolvedRange {
        booking: Span::new(start, start + duration),
        covered: Span::new(start, last + step.minutes()),
        slots,
    })
}
