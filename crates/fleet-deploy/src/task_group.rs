//! Parallel-map helpers with explicit ordering contracts.
//!
//! Both helpers launch one task per item and join them all. The difference is
//! the contract on the returned vector: [`ordered`] matches input order,
//! [`unordered`] yields completion order. Pick per call site; callers that
//! need order after an [`unordered`] run must sort explicitly.

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};

/// Run one task per item concurrently; results come back in input order
pub async fn ordered<I, T, F, Fut>(items: I, f: F) -> Vec<T>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = T>,
{
    futures::future::join_all(items.into_iter().map(f)).await
}

/// Run one task per item concurrently; results come back in completion order
pub async fn unordered<I, T, F, Fut>(items: I, f: F) -> Vec<T>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = T>,
{
    let mut tasks: FuturesUnordered<Fut> = items.into_iter().map(f).collect();
    let mut results = Vec::with_capacity(tasks.len());
    while let Some(result) = tasks.next().await {
        results.push(result);
    }
    results
}
