//! Fan-out combinators which report every failure instead of the first one.
use std::future::Future;

use futures::{StreamExt, future, stream::FuturesUnordered};

/// Errors able to carry several failures at once.
pub trait Aggregate: Sized {
    fn aggregate(errors: Vec<Self>) -> Self;
}

/// Waits for every future, even when some fail.
///
/// A single failure is returned as is, several are merged with [`Aggregate::aggregate`].
pub async fn join_all<I, T, E>(futures: I) -> Result<Vec<T>, E>
where
    I: IntoIterator,
    I::Item: Future<Output = Result<T, E>>,
    E: Aggregate,
{
    collect_all(future::join_all(futures).await)
}

/// Synchronous counterpart of [`join_all`], keeps every failure of `results`.
pub fn collect_all<I, T, E>(results: I) -> Result<Vec<T>, E>
where
    I: IntoIterator<Item = Result<T, E>>,
    E: Aggregate,
{
    let mut values = Vec::new();
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(error) => errors.push(error),
        }
    }
    into_result(values, errors)
}

/// Resolves with the first success, dropping (cancelling) the remaining futures.
///
/// Fails only once every future failed, with all the failures. No future at all is a success.
pub async fn first_ok<I, E>(futures: I) -> Result<(), E>
where
    I: IntoIterator,
    I::Item: Future<Output = Result<(), E>>,
    E: Aggregate,
{
    let mut pending = futures.into_iter().collect::<FuturesUnordered<_>>();
    if pending.is_empty() {
        return Ok(());
    }

    let mut errors = Vec::new();
    while let Some(result) = pending.next().await {
        match result {
            Ok(()) => return Ok(()),
            Err(error) => errors.push(error),
        }
    }
    into_result((), errors)
}

/// Runs the futures one after the other, stopping at the first failure.
pub async fn chain<I, T, E>(futures: I) -> Result<Vec<T>, E>
where
    I: IntoIterator,
    I::Item: Future<Output = Result<T, E>>,
{
    let mut values = Vec::new();
    for future in futures {
        values.push(future.await?);
    }
    Ok(values)
}

fn into_result<T, E: Aggregate>(value: T, mut errors: Vec<E>) -> Result<T, E> {
    match errors.len() {
        0 => Ok(value),
        1 => Err(errors.remove(0)),
        _ => Err(E::aggregate(errors)),
    }
}
