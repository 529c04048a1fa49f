//! Fetcher contract.

use async_trait::async_trait;
use std::future::Future;

use crate::cancel::CancelToken;
use crate::context::Params;

/// An external fetch operation driven by the request runner.
///
/// Failure is signalled through `Err`. Implementations must observe the
/// cancel token to release resources promptly, but are not required to
/// terminate synchronously on cancellation: late completions from aborted
/// requests are discarded by the runner's sequence check.
#[async_trait]
pub trait Fetch<R, E>: Send + Sync {
    async fn fetch(&self, params: Params, cancel: CancelToken) -> Result<R, E>;
}

/// Adapter turning an async closure into a [`Fetch`] implementation.
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut, R, E> Fetch<R, E> for FnFetcher<F>
where
    F: Fn(Params, CancelToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    async fn fetch(&self, params: Params, cancel: CancelToken) -> Result<R, E> {
        (self.f)(params, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[tokio::test]
    async fn closure_fetcher_runs() {
        let fetcher = FnFetcher::new(|_params, _cancel| async { Ok::<_, io::Error>(7u32) });
        let out = fetcher.fetch(Params::default(), CancelToken::new()).await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn closure_fetcher_observes_cancel() {
        let fetcher = FnFetcher::new(|_params, cancel: CancelToken| async move {
            cancel.cancelled().await;
            Err::<u32, _>(io::Error::new(io::ErrorKind::Interrupted, "cancelled"))
        });
        let token = CancelToken::new();
        token.cancel();
        let out = fetcher.fetch(Params::default(), token).await;
        assert!(out.is_err());
    }
}
