mod stream;
pub(crate) mod tls;

use std::{
    future::Future,
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;

pub(crate) use self::{stream::AsyncStream, tls::TlsConfig};

use crate::error::{Error, Result};

/// Spawn a task on the current tokio runtime, detaching it. If no runtime is active (e.g. a
/// `Drop` running after the runtime shut down), the future is silently discarded; cleanup work
/// scheduled this way is best-effort by contract.
pub(crate) fn spawn<F, O>(fut: F) -> Option<JoinHandle<O>>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn(fut)),
        Err(_) => None,
    }
}

/// Await a future, erroring with a network timeout if it does not complete within `duration`.
/// A zero duration means no timeout, matching `socketTimeoutMS=0` semantics.
pub(crate) async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    if duration.is_zero() {
        return Ok(future.await);
    }
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| Error::network_timeout())
}

/// Await a future, erroring with a network timeout once the absolute `deadline` passes.
pub(crate) async fn timeout_at<F: Future>(deadline: Instant, future: F) -> Result<F::Output> {
    tokio::time::timeout_at(deadline.into(), future)
        .await
        .map_err(|_| Error::network_timeout())
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}
