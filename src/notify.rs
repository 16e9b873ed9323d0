use std::{
    future::{Future, IntoFuture},
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::watch;

use crate::error::StreamError;
use crate::BoxFuture;

type Outcome = Option<Result<(), StreamError>>;

#[derive(Debug)]
pub(crate) struct Sender(watch::Sender<Outcome>);

impl Sender {
    pub(crate) fn send(&self, outcome: Result<(), StreamError>) {
        tracing::trace!(clean = outcome.is_ok(), "sending close signal");
        self.0.send_replace(Some(outcome));
    }
}

/// Resolves once the stream it was taken from has closed.
///
/// Await it to learn how the stream closed: `Ok(())` for a clean close, or the
/// error which tore the stream down. If the stream is dropped without closing,
/// the listener resolves with a `BrokenPipe` error.
#[derive(Debug, Clone)]
pub struct CloseListener(watch::Receiver<Outcome>);

impl CloseListener {
    /// Whether the stream has closed (or been dropped) already.
    pub fn is_closed(&self) -> bool {
        self.0.borrow().is_some() || self.0.has_changed().is_err()
    }
}

impl IntoFuture for CloseListener {
    type IntoFuture = Notified;
    type Output = Result<(), StreamError>;

    fn into_future(mut self) -> Self::IntoFuture {
        Notified(Box::pin(async move {
            let outcome = self
                .0
                .wait_for(Option::is_some)
                .await
                .map(|outcome| outcome.clone());

            match outcome {
                Ok(Some(outcome)) => outcome,
                Ok(None) | Err(_) => Err(StreamError::closed()),
            }
        }))
    }
}

/// Future returned by awaiting a [`CloseListener`].
#[pin_project::pin_project]
pub struct Notified(#[pin] BoxFuture<'static, Result<(), StreamError>>);

impl std::fmt::Debug for Notified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notified").finish()
    }
}

impl Future for Notified {
    type Output = Result<(), StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().0.poll(cx)
    }
}

pub(crate) fn channel() -> (Sender, CloseListener) {
    let (tx, rx) = watch::channel(None);
    (Sender(tx), CloseListener(rx))
}
