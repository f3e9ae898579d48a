use futures::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Watch-backed collection listener.
///
/// The first `next().await` resolves immediately with the current full
/// result set; every later call waits for the next change and yields the
/// complete set again. `None` means the owning store was dropped.
/// Dropping the listener is the explicit teardown; there is no implicit
/// timeout-based cancellation.
pub struct Snapshots<T> {
    rx: watch::Receiver<Vec<T>>,
    primed: bool,
}

impl<T: Clone + Send + Sync + 'static> Snapshots<T> {
    pub(crate) fn new(rx: watch::Receiver<Vec<T>>) -> Self {
        Self { rx, primed: false }
    }

    pub async fn next(&mut self) -> Option<Vec<T>> {
        if self.primed && self.rx.changed().await.is_err() {
            return None;
        }
        self.primed = true;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Latest snapshot without waiting.
    pub fn current(&self) -> Vec<T> {
        self.rx.borrow().clone()
    }

    pub fn into_stream(self) -> impl Stream<Item = Vec<T>> + Send {
        WatchStream::new(self.rx)
    }
}

/// Single-document analogue of [`Snapshots`]; yields `None` inside the
/// snapshot while the document does not exist yet.
pub struct DocSnapshots<T> {
    rx: watch::Receiver<Option<T>>,
    primed: bool,
}

impl<T: Clone + Send + Sync + 'static> DocSnapshots<T> {
    pub(crate) fn new(rx: watch::Receiver<Option<T>>) -> Self {
        Self { rx, primed: false }
    }

    pub async fn next(&mut self) -> Option<Option<T>> {
        if self.primed && self.rx.changed().await.is_err() {
            return None;
        }
        self.primed = true;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn current(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    pub fn into_stream(self) -> impl Stream<Item = Option<T>> + Send {
        WatchStream::new(self.rx)
    }
}
