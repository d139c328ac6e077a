//! Per-agent parallel/sequential execution.
//!
//! With the `parallel` feature, agents are mapped with rayon's parallel
//! iterators; otherwise with a plain iterator. Output order always equals agent
//! order, so results do not depend on which path ran.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Map `f` over agent indices `0..count`.
///
/// # Parameters
/// - `force_sequential`: run on the calling thread even if the `parallel` feature is enabled
#[inline]
pub fn map_agents<F, R>(count: usize, f: F, force_sequential: bool) -> Vec<R>
where
    F: Fn(usize) -> R + Sync + Send,
    R: Send,
{
    #[cfg(feature = "parallel")]
    {
        if force_sequential {
            (0..count).map(f).collect()
        } else {
            (0..count).into_par_iter().map(f).collect()
        }
    }

    #[cfg(not(feature = "parallel"))]
    {
        let _ = force_sequential;
        (0..count).map(f).collect()
    }
}
