use futures::{Stream, StreamExt, TryStreamExt};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

pin_project! {
    /// Text chunks of a reply, in generation order.
    ///
    /// Holds the pipeline's inference context until it is exhausted or dropped.
    pub struct CompletionStream<S> {
        #[pin]
        inner: Pin<Box<S>>,
    }
}

impl<S> CompletionStream<S>
where
    S: Stream<Item = anyhow::Result<String>>,
{
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner: Box::pin(inner),
        }
    }

    /// Next chunk, or `None` once the reply is complete.
    pub async fn next(&mut self) -> Option<anyhow::Result<String>> {
        self.inner.as_mut().next().await
    }

    /// Concatenate the remaining chunks.
    pub async fn collect(self) -> anyhow::Result<String> {
        self.inner.try_collect().await
    }

    /// Up to `n` chunks; fewer if the reply ends first.
    pub async fn take(self, n: usize) -> anyhow::Result<Vec<String>> {
        StreamExt::take(self.inner, n).try_collect().await
    }
}

impl<S> Stream for CompletionStream<S>
where
    S: Stream<Item = anyhow::Result<String>>,
{
    type Item = anyhow::Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        this.inner.get_mut().as_mut().poll_next(cx)
    }
}
