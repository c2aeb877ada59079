use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{stream::BoxStream, Stream};
use pin_project::{pin_project, pinned_drop};

mod bounded;
mod tee;

pub use bounded::run_bounded;
pub use tee::{collect_bytes, tee};

/// Body stream shared by the origin client, the primary store and the
/// response path.
pub type ByteStream = BoxStream<'static, anyhow::Result<Bytes>>;

/// A [`Stream`] wrapper that runs a closure once the stream is dropped,
/// whether it was read to the end or abandoned by the client.
#[pin_project(PinnedDrop)]
pub struct StreamGuard<S, F>
where
    S: Stream,
    F: FnOnce(),
{
    #[pin]
    stream: S,
    on_drop: Option<F>,
}

impl<S, F> StreamGuard<S, F>
where
    S: Stream,
    F: FnOnce(),
{
    pub fn new(stream: S, on_drop: F) -> Self {
        Self {
            stream,
            on_drop: Some(on_drop),
        }
    }
}

impl<S, F> Stream for StreamGuard<S, F>
where
    S: Stream,
    F: FnOnce(),
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().stream.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.stream.size_hint()
    }
}

#[pinned_drop]
impl<S, F> PinnedDrop for StreamGuard<S, F>
where
    S: Stream,
    F: FnOnce(),
{
    fn drop(self: Pin<&mut Self>) {
        if let Some(on_drop) = self.project().on_drop.take() {
            on_drop();
        }
    }
}

pub trait GuardStreamExt: Stream + Sized {
    /// Wraps the [`Stream`], running `on_drop` when it is dropped.
    fn guard<F>(self, on_drop: F) -> StreamGuard<Self, F>
    where
        F: FnOnce();
}

impl<S> GuardStreamExt for S
where
    S: Stream + Sized,
{
    fn guard<F>(self, on_drop: F) -> StreamGuard<Self, F>
    where
        F: FnOnce(),
    {
        StreamGuard::new(self, on_drop)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use futures::{stream, StreamExt};

    use super::*;

    #[tokio::test]
    async fn test_guard_runs_on_early_drop() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let mut guarded = stream::iter(vec![1, 2, 3]).guard(move || flag.store(true, Ordering::SeqCst));

        assert_eq!(guarded.next().await, Some(1));
        assert!(!dropped.load(Ordering::SeqCst));
        drop(guarded);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
