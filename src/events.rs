use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::ErrorCode;

/// Asynchronous lifecycle notification for one session, delivered in order
/// on a dedicated channel: zero or more `Progress`/`ResourceLost`, then
/// exactly one of `Finished`, `Error`, `Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeEvent {
    /// Overall progress, 0..=100, strictly increasing.
    Progress(u32),
    Finished,
    Error(ErrorCode),
    /// Codec resources were reclaimed; carries the opaque pause-state token
    /// to hand back to `resume`. Not terminal by itself.
    ResourceLost(Bytes),
    /// Acknowledgement of `cancel()`; terminal.
    Cancelled,
}

impl TranscodeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TranscodeEvent::Finished | TranscodeEvent::Error(_) | TranscodeEvent::Cancelled
        )
    }
}

/// Terminal outcome mirrored onto the [`Completion`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Error(ErrorCode),
    Cancelled,
}

/// Client-side event stream for one session. Single consumer; ordering is
/// the session actor's emission order.
pub struct Events {
    inner: UnboundedReceiverStream<TranscodeEvent>,
}

impl Events {
    pub async fn recv(&mut self) -> Option<TranscodeEvent> {
        use futures::StreamExt;
        self.inner.next().await
    }
}

impl Stream for Events {
    type Item = TranscodeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// One-shot completion handle resolved with the terminal outcome, exactly
/// once. Callers typically await it under their own timeout and `cancel()`
/// the session on expiry.
#[derive(Debug)]
pub struct Completion {
    rx: tokio::sync::oneshot::Receiver<Outcome>,
}

impl Completion {
    pub async fn wait(self) -> Option<Outcome> {
        self.rx.await.ok()
    }
}

/// Producer half owned by the session actor. Terminal emission is
/// single-flight: the first of `finished`/`errored`/`cancelled` wins, later
/// attempts are no-ops.
pub(crate) struct EventSender {
    tx: tokio::sync::mpsc::UnboundedSender<TranscodeEvent>,
    completion: Option<tokio::sync::oneshot::Sender<Outcome>>,
    terminal_sent: bool,
}

impl EventSender {
    pub(crate) fn channel() -> (EventSender, Events) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let sender = EventSender {
            tx,
            completion: None,
            terminal_sent: false,
        };
        let events = Events {
            inner: UnboundedReceiverStream::new(rx),
        };
        (sender, events)
    }

    /// Arm a fresh completion handle; resolved together with the terminal
    /// event.
    pub(crate) fn completion_handle(&mut self) -> Completion {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.completion = Some(tx);
        Completion { rx }
    }

    pub(crate) fn progress(&self, percent: u32) {
        if self.terminal_sent {
            return;
        }
        let _ = self.tx.send(TranscodeEvent::Progress(percent));
    }

    pub(crate) fn resource_lost(&self, token: Bytes) {
        if self.terminal_sent {
            return;
        }
        let _ = self.tx.send(TranscodeEvent::ResourceLost(token));
    }

    pub(crate) fn finished(&mut self) {
        self.terminal(TranscodeEvent::Finished, Outcome::Finished);
    }

    pub(crate) fn errored(&mut self, code: ErrorCode) {
        self.terminal(TranscodeEvent::Error(code), Outcome::Error(code));
    }

    pub(crate) fn cancelled(&mut self) {
        self.terminal(TranscodeEvent::Cancelled, Outcome::Cancelled);
    }

    fn terminal(&mut self, event: TranscodeEvent, outcome: Outcome) {
        if self.terminal_sent {
            log::debug!("suppressing duplicate terminal event {event:?}");
            return;
        }
        self.terminal_sent = true;
        let _ = self.tx.send(event);
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(outcome);
        }
    }
}
