//! Admission control.
//!
//! Live spans are admitted by an independent random draw per span. Backfill
//! pages are cut to a deterministic prefix so a replayed page always yields
//! the same subset.

use rand::Rng;

/// Resolution of the random draw.
pub const SAMPLE_RESOLUTION: u32 = 10_000;

/// Draw once against `rate` using the thread-local generator.
pub fn admit(rate: f64) -> bool {
    admit_with(&mut rand::thread_rng(), rate)
}

pub fn admit_with<R: Rng>(rng: &mut R, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    let threshold = (rate * f64::from(SAMPLE_RESOLUTION)) as u32;
    rng.gen_range(0..SAMPLE_RESOLUTION) <= threshold
}

/// Keep the first `round(len * rate)` items, at least one when `rate > 0`.
pub fn sample_page<T>(mut items: Vec<T>, rate: f64) -> Vec<T> {
    if rate >= 1.0 || items.is_empty() {
        return items;
    }
    if rate <= 0.0 {
        return Vec::new();
    }
    let keep = ((items.len() as f64) * rate).round() as usize;
    items.truncate(keep.max(1));
    items
}
