//! Operation handles and the events they deliver to the host

use lockbox_core::{
    CipherMode, ErrorKind, FileDescriptor, LockboxError, LockboxResult, OperationState,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything the host needs to render one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoEvent {
    State(OperationState),
    /// Total size unknown; show a spinner instead of a percentage
    Indeterminate,
    /// Cumulative plaintext bytes transferred, at most once per progress step
    Progress { bytes: u64, total: u64 },
    Complete(FileDescriptor),
    Failed { kind: ErrorKind, message: String },
}

/// Sending half kept by the running operation. Events sent after the host
/// dropped its handle are discarded.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<CryptoEvent>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<CryptoEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: CryptoEvent) {
        let _ = self.tx.send(event);
    }
}

/// Handle to an operation running in the background.
///
/// Cancelling only has an effect while the operation waits for
/// authentication; once the transfer started it runs to completion.
pub struct OperationHandle {
    mode: CipherMode,
    cancel: CancellationToken,
    events: mpsc::UnboundedReceiver<CryptoEvent>,
    task: JoinHandle<LockboxResult<FileDescriptor>>,
}

impl OperationHandle {
    pub(crate) fn new(
        mode: CipherMode,
        cancel: CancellationToken,
        events: mpsc::UnboundedReceiver<CryptoEvent>,
        task: JoinHandle<LockboxResult<FileDescriptor>>,
    ) -> Self {
        Self {
            mode,
            cancel,
            events,
            task,
        }
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next event, or `None` once the operation finished and all events
    /// were drained.
    pub async fn next_event(&mut self) -> Option<CryptoEvent> {
        self.events.recv().await
    }

    /// Wait for the result, discarding undelivered events.
    pub async fn wait(self) -> LockboxResult<FileDescriptor> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(LockboxError::Other(anyhow::anyhow!(
                "{} task aborted: {e}",
                self.mode
            ))),
        }
    }

    /// Drain every event into a vector, then return it with the result.
    pub async fn collect(mut self) -> (Vec<CryptoEvent>, LockboxResult<FileDescriptor>) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        (events, self.wait().await)
    }
}
