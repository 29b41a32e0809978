use crate::model::*;

use super::EngineError;

/// Every grid point `open + k·step` with `t <= close`, ascending.
///
/// The last point may equal `close`; it marks the closing boundary and
/// can never start a booking (its slot would end past closing).
pub fn slot_grid(hours: &OperatingHours, step: SlotStep) -> Vec<Minutes> {
    let step = step.minutes();
    let count = ((hours.close - hours.open) / step + 1) as usize;
    let mut grid = Vec::with_capacity(count);
    let mut t = hours.open;
    while t <= hours.close {
        grid.push(t);
        t += step;
    }
    grid
}

/// Validating form of [`slot_grid`] for raw inputs.
pub fn generate(open: Minutes, close: Minutes, step_minutes: Minutes) -> Result<Vec<Minutes>, EngineError> {
    let step = SlotStep::new(step_minutes)?;
    let hours = OperatingHours::new(open, close)?;
    Ok(slot_grid(&hours, step))
}

/// Whether a slot starting at `t` fits before closing.
pub fn slot_fits(t: Minutes, step: SlotStep, close: Minutes) -> bool {
    t + step.minutes() <= close
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Minutes = 60;

    #[test]
    fn hourly_grid_includes_both_ends() {
        let grid = generate(8 * H, 22 * H, 60).unwrap();
        assert_eq!(grid.len(), 15);
        assert_eq!(grid.first(), Some(&(8 * H)));
        assert_eq!(grid.last(), Some(&(22 * H)));
        assert!(grid.windows(2).all(|w| w[1] - w[0] == 60));
    }

    #[test]
    fn half_hour_grid() {
        let grid = generate(9 * H, 11 * H, 30).unwrap();
        assert_eq!(grid, vec![540, 570, 600, 630, 660]);
    }

    #[test]
    fn close_not_on_grid_is_excluded() {
        let grid = generate(8 * H, 10 * H + 30, 60).unwrap();
        assert_eq!(grid, vec![480, 540, 600]);
        assert!(slot_fits(540, SlotStep::default(), 630));
        assert!(!slot_fits(600, SlotStep::default(), 630));
    }

    #[test]
    fn step_larger_than_window_yields_open_only() {
        let grid = generate(8 * H, 9 * H, 1440).unwrap();
        assert_eq!(grid, vec![480]);
    }

    #[test]
    fn invalid_step_rejected() {
        assert!(matches!(generate(8 * H, 22 * H, 0), Err(EngineError::InvalidConfiguration(_))));
        assert!(matches!(generate(8 * H, 22 * H, -60), Err(EngineError::InvalidConfiguration(_))));
        assert!(matches!(generate(8 * H, 22 * H, 1441), Err(EngineError::InvalidConfiguration(_))));
    }

    #[test]
    fn inverted_hours_rejected() {
        assert!(matches!(generate(22 * H, 8 * H, 60), Err(EngineError::InvalidConfiguration(_))));
    }

    #[test]
    fn lenient_step_falls_back() {
        let hours = OperatingHours::new(8 * H, 22 * H).unwrap();
        let grid = slot_grid(&hours, SlotStep::or_default(0));
        assert_eq!(grid.len(), 15);
    }

    #[test]
    fn full_day_minute_grid() {
        let grid = generate(0, 24 * H, 1).unwrap();
        assert_eq!(grid.len(), 1441);
    }
}
