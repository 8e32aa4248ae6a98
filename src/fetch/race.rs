//! # Source Racer
//!
//! ## Purpose
//! Generic "first success of N concurrent operations" combinator. All
//! operations launch at once; the first `Ok` wins and the remaining
//! futures are dropped (cooperative cancellation, so a branch already
//! mid-flight is not torn down; its eventual result is simply discarded).
//! Only when every branch fails does the caller see a single aggregated
//! failure carrying all branch errors.

use crate::errors::{PipelineError, Result};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

/// Outcome of a race, pairing the winning value with the label of the
/// branch that produced it.
#[derive(Debug)]
pub struct RaceWin<T> {
    pub source_name: &'static str,
    pub value: T,
}

/// Race labelled futures; resolve to the first success. Losing branches
/// are dropped when the winner completes. If all branches fail, the
/// errors are folded into one `AllSourcesFailed`.
pub async fn first_success<T>(
    title: u16,
    period: &crate::Period,
    branches: Vec<(&'static str, BoxFuture<'_, Result<T>>)>,
) -> Result<RaceWin<T>> {
    let mut in_flight: FuturesUnordered<_> = branches
        .into_iter()
        .map(|(name, fut)| async move { (name, fut.await) })
        .collect();

    let mut failures: Vec<(&'static str, PipelineError)> = Vec::new();

    while let Some((source_name, outcome)) = in_flight.next().await {
        match outcome {
            Ok(value) => {
                debug!(source = source_name, title, %period, "race won");
                return Ok(RaceWin { source_name, value });
            }
            Err(e) => {
                debug!(source = source_name, title, %period, error = %e, "race branch failed");
                failures.push((source_name, e));
            }
        }
    }

    let details = failures
        .iter()
        .map(|(name, e)| format!("{}: {}", name, e))
        .collect::<Vec<_>>()
        .join("; ");

    Err(PipelineError::AllSourcesFailed {
        title,
        period: period.to_string(),
        details,
    })
}
