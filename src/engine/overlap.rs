use crate::model::{Minutes, Span};

/// Half-open overlap of `[start_a, start_a + duration_a)` and
/// `[start_b, start_b + duration_b)`. Touching endpoints do not overlap.
///
/// Durations must already be validated as positive.
pub fn overlaps(start_a: Minutes, duration_a: Minutes, start_b: Minutes, duration_b: Minutes) -> bool {
    debug_assert!(duration_a > 0 && duration_b > 0, "durations must be positive");
    Span::new(start_a, start_a + duration_a).overlaps(&Span::new(start_b, start_b + duration_b))
}
