//! Concurrency-limited parallel iteration utilities.
//!
//! Wraps rayon's `par_iter` to process items in parallel while limiting
//! the number of items in flight at once.

use rayon::prelude::*;

/// Runs `f` over `items` in parallel, with at most `max_concurrent` items in flight.
///
/// Semantically equivalent to `items.par_iter().for_each(f)`, but processes
/// items in chunks of `max_concurrent` to limit resource usage.
///
/// # Panics
///
/// Panics if `max_concurrent` is 0.
pub fn par_for_each_limited<T, F>(items: &[T], max_concurrent: usize, f: F)
where
    T: Sync,
    F: Fn(&T) + Sync,
{
    assert!(max_concurrent > 0, "max_concurrent must be > 0");

    for chunk in items.chunks(max_concurrent) {
        chunk.par_iter().for_each(&f);
    }
}
