//! Fragment stream helpers.

use crate::backend::{Fragment, FragmentStream};
use crate::error::ModelError;
use futures::{Stream, StreamExt};
use std::time::Duration;

/// Bounds every wait for the next fragment.
///
/// When `limit` elapses without a fragment, the stream yields
/// [`ModelError::Timeout`] and ends. Any error from the inner stream also
/// ends it.
pub fn with_fragment_timeout<S>(inner: S, limit: Duration) -> FragmentStream
where
    S: Stream<Item = Result<Fragment, ModelError>> + Send + 'static,
{
    let inner = Box::pin(inner);
    let waited_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);

    Box::pin(futures::stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout(limit, inner.next()).await {
            Ok(Some(Ok(fragment))) => Some((Ok(fragment), Some(inner))),
            Ok(Some(Err(e))) => Some((Err(e), None)),
            Ok(None) => None,
            Err(_) => Some((Err(ModelError::Timeout { waited_ms }), None)),
        }
    }))
}
