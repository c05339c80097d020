//! Completion-order merging of independently advancing async sequences.
//!
//! [`merge`] interleaves N streams by arrival: whichever source produces an
//! element first is emitted first. Each source's own relative order is kept,
//! and the merged stream ends only once every source has ended.
//!
//! The playback tracker uses this to watch the application channel and the
//! receiver-status channel as one sequence; the player uses it to fan title
//! queries out to every handler.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, SelectAll, Stream, StreamExt};

/// Stream returned by [`merge`] and [`merge_tagged`].
#[must_use = "streams do nothing unless polled"]
pub struct Merge<T> {
    inner: SelectAll<BoxStream<'static, T>>,
}

impl<T> std::fmt::Debug for Merge<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Merge")
            .field("pending_sources", &self.inner.len())
            .finish()
    }
}

impl<T> Merge<T> {
    /// Number of sources that have not ended yet.
    pub fn pending_sources(&self) -> usize {
        self.inner.len()
    }
}

impl<T> Stream for Merge<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.poll_next_unpin(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Merges `streams` into one sequence ordered by arrival time.
///
/// An empty input produces a stream that ends immediately.
pub fn merge<I, S, T>(streams: I) -> Merge<T>
where
    I: IntoIterator<Item = S>,
    S: Stream<Item = T> + Send + 'static,
    T: 'static,
{
    Merge {
        inner: stream::select_all(streams.into_iter().map(StreamExt::boxed)),
    }
}

/// Like [`merge`], but pairs every element with the index of its source.
pub fn merge_tagged<I, S, T>(streams: I) -> Merge<(usize, T)>
where
    I: IntoIterator<Item = S>,
    S: Stream<Item = T> + Send + 'static,
    T: 'static,
{
    merge(
        streams
            .into_iter()
            .enumerate()
            .map(|(index, source)| source.map(move |item| (index, item))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test]
    async fn empty_input_ends_immediately() {
        let merged = merge(Vec::<stream::Iter<std::vec::IntoIter<u8>>>::new());
        let items: Vec<u8> = merged.collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn preserves_per_source_order() {
        let sources = vec![
            stream::iter(vec![("a", 1), ("a", 2), ("a", 3)]),
            stream::iter(vec![("b", 1), ("b", 2)]),
            stream::iter(vec![("c", 1)]),
        ];

        let items: Vec<(&str, i32)> = merge(sources).collect().await;
        assert_eq!(items.len(), 6);

        for source in ["a", "b", "c"] {
            let projected: Vec<i32> = items
                .iter()
                .filter(|(s, _)| *s == source)
                .map(|(_, n)| *n)
                .collect();
            let mut sorted = projected.clone();
            sorted.sort_unstable();
            assert_eq!(projected, sorted, "source {} out of order", source);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interleaves_by_arrival_not_declaration() {
        let (slow_tx, slow_rx) = mpsc::unbounded_channel();
        let (fast_tx, fast_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            slow_tx.send("slow-1").unwrap();
        });
        tokio::spawn(async move {
            fast_tx.send("fast-1").unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            fast_tx.send("fast-2").unwrap();
        });

        let merged = merge(vec![
            UnboundedReceiverStream::new(slow_rx),
            UnboundedReceiverStream::new(fast_rx),
        ]);
        let items: Vec<&str> = merged.collect().await;

        assert_eq!(items, vec!["fast-1", "slow-1", "fast-2"]);
    }

    #[tokio::test]
    async fn ends_only_after_every_source_ends() {
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        let mut merged = merge_tagged(vec![
            stream::iter(vec![7]).boxed(),
            UnboundedReceiverStream::new(rx).boxed(),
        ]);

        assert_eq!(merged.next().await, Some((0, 7)));

        tx.send(9).unwrap();
        assert_eq!(merged.next().await, Some((1, 9)));

        drop(tx);
        assert_eq!(merged.next().await, None);
    }
}
