use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use super::error::GeneratorResult;
use super::fragment::{Fragment, GenerationParams, UNTERMINATED_STREAM_REASON};

pub type GeneratorWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

// Small buffer keeps generation roughly in step with consumption.
const FRAGMENT_BUFFER: usize = 4;

pub trait Generator: Send + Sync {
    fn id(&self) -> &str;

    /// Starts a generation. Nothing is produced until `worker` is polled, and a
    /// failure after this point arrives as a [`Fragment::Error`] on the stream.
    fn generate(
        &self,
        prompt: String,
        params: GenerationParams,
    ) -> GeneratorResult<GenerationHandle>;
}

/// A started generation: the fragment stream plus the future that feeds it.
pub struct GenerationHandle {
    pub stream: FragmentStream,
    pub worker: GeneratorWorker,
}

impl GenerationHandle {
    /// A generation that ends immediately with `reason`, for callers that must
    /// still hand a terminated sequence downstream when a generator fails to start.
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let (sender, stream, _cancel_rx) = make_fragment_stream();
        let worker: GeneratorWorker = Box::pin(async move {
            sender.error(reason).await;
        });
        Self { stream, worker }
    }
}

/// Producer half handed to generator workers.
pub struct FragmentSender {
    fragments: mpsc::Sender<Fragment>,
}

impl FragmentSender {
    /// Returns false once the consumer is gone.
    pub async fn send(&self, fragment: Fragment) -> bool {
        self.fragments.send(fragment).await.is_ok()
    }

    pub async fn text(&self, text: impl Into<String>) -> bool {
        self.send(Fragment::Text(text.into())).await
    }

    pub async fn done(&self) -> bool {
        self.send(Fragment::Done).await
    }

    pub async fn error(&self, reason: impl Into<String>) -> bool {
        self.send(Fragment::Error(reason.into())).await
    }
}

/// Consumer half of a generation.
///
/// Yields fragments in emission order and ends right after the first terminal
/// marker. A producer that disappears without one yields a synthesized
/// [`Fragment::Error`] so readers never mistake truncation for completion.
/// Dropping the stream asks the worker to stop.
pub struct FragmentStream {
    fragments: mpsc::Receiver<Fragment>,
    cancel_tx: Option<oneshot::Sender<()>>,
    finished: bool,
}

impl FragmentStream {
    /// Asks the worker to stop. Returns false if it already finished.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Stream for FragmentStream {
    type Item = Fragment;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Fragment>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.fragments.poll_recv(cx) {
            Poll::Ready(Some(fragment)) => {
                if fragment.is_terminal() {
                    this.finished = true;
                    this.fragments.close();
                }
                Poll::Ready(Some(fragment))
            }
            Poll::Ready(None) => {
                this.finished = true;
                tracing::warn!("generator channel closed without a terminal fragment");
                Poll::Ready(Some(Fragment::Error(UNTERMINATED_STREAM_REASON.to_string())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for FragmentStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Wires a producer, a consumer and the cancel signal the worker should watch.
pub fn make_fragment_stream() -> (FragmentSender, FragmentStream, oneshot::Receiver<()>) {
    let (fragments_tx, fragments_rx) = mpsc::channel(FRAGMENT_BUFFER);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        FragmentSender {
            fragments: fragments_tx,
        },
        FragmentStream {
            fragments: fragments_rx,
            cancel_tx: Some(cancel_tx),
            finished: false,
        },
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn ends_after_the_first_terminal_fragment() {
        let (sender, stream, _cancel_rx) = make_fragment_stream();
        let producer = tokio::spawn(async move {
            sender.text("Hel").await;
            sender.done().await;
            // Anything after the terminal is dropped.
            sender.text("ignored").await;
        });

        let fragments: Vec<Fragment> = stream.collect().await;
        producer.await.unwrap();
        assert_eq!(
            fragments,
            vec![Fragment::Text("Hel".to_string()), Fragment::Done]
        );
    }

    #[tokio::test]
    async fn synthesizes_an_error_when_the_producer_vanishes() {
        let (sender, stream, _cancel_rx) = make_fragment_stream();
        tokio::spawn(async move {
            sender.text("partial").await;
        });

        let fragments: Vec<Fragment> = stream.collect().await;
        assert_eq!(
            fragments,
            vec![
                Fragment::Text("partial".to_string()),
                Fragment::Error(UNTERMINATED_STREAM_REASON.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_handles_yield_a_single_error() {
        let handle = GenerationHandle::failed("no engine");
        tokio::spawn(handle.worker);
        let fragments: Vec<Fragment> = handle.stream.collect().await;
        assert_eq!(fragments, vec![Fragment::Error("no engine".to_string())]);
    }

    #[tokio::test]
    async fn dropping_the_stream_signals_cancel() {
        let (sender, stream, cancel_rx) = make_fragment_stream();
        drop(stream);
        assert!(cancel_rx.await.is_ok());
        assert!(!sender.text("late").await);
    }
}
