//! Bounded retry over a sequence of picked items.

use std::future::Future;

/// Run `run` on items from `pick_item` until one succeeds.
///
/// Returns `Ok(None)` when `pick_item` runs dry or all `max_attempts` fail
/// with errors that `on_error` agreed to retry. When `on_error` returns
/// false the error is returned as-is. Attempts run one at a time.
///
/// `on_error` receives the failed item, the 1-based attempt number, the
/// attempt cap and the error.
pub async fn retry_with_item<T, R, E, P, F, Fut, C>(
    max_attempts: u32,
    mut pick_item: P,
    mut run: F,
    mut on_error: C,
) -> Result<Option<R>, E>
where
    T: Clone,
    P: FnMut() -> Option<T>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    C: FnMut(&T, u32, u32, &E) -> bool,
{
    for attempt in 1..=max_attempts {
        let Some(item) = pick_item() else {
            return Ok(None);
        };

        match run(item.clone()).await {
            Ok(result) => return Ok(Some(result)),
            Err(e) => {
                if !on_error(&item, attempt, max_attempts, &e) {
                    return Err(e);
                }
            }
        }
    }
    Ok(None)
}
