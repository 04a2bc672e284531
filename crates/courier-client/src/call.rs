//! Call futures.
//!
//! Every remote call hands back a [`CallFuture`] right away, whether the
//! request went out or was queued. The future resolves when the matching
//! response arrives, when the client is disconnected, or when the optional
//! call timeout expires.

use crate::client::ClientInner;
use courier_core::{ContractError, RemoteError, Token};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Sleep;

/// How a remote call can fail.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The connection went away before the response arrived.
    #[error("disconnected before the call completed")]
    Disconnected,
    /// No response within the configured call timeout.
    #[error("call timed out")]
    Timeout,
    /// A queued call did not match the contract received on connect.
    #[error("call rejected: {0}")]
    Rejected(#[source] ContractError),
    /// The host answered with an error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// Result delivered to a waiting call.
pub(crate) type CallOutcome = Result<Value, CallError>;

/// Resolves to the remote result of one call.
#[must_use = "a call's outcome is only observable by awaiting its future"]
pub struct CallFuture {
    id: Token,
    rx: oneshot::Receiver<CallOutcome>,
    deadline: Option<Pin<Box<Sleep>>>,
    client: Weak<ClientInner>,
}

impl CallFuture {
    pub(crate) fn new(
        id: Token,
        rx: oneshot::Receiver<CallOutcome>,
        deadline: Option<Pin<Box<Sleep>>>,
        client: Weak<ClientInner>,
    ) -> Self {
        Self {
            id,
            rx,
            deadline,
            client,
        }
    }

    /// Packet id of the request.
    pub fn id(&self) -> Token {
        self.id
    }
}

impl Future for CallFuture {
    type Output = CallOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Poll::Ready(outcome) = Pin::new(&mut this.rx).poll(cx) {
            // A dropped sender means the client itself went away.
            return Poll::Ready(outcome.unwrap_or(Err(CallError::Disconnected)));
        }

        if let Some(deadline) = this.deadline.as_mut()
            && deadline.as_mut().poll(cx).is_ready()
        {
            if let Some(client) = this.client.upgrade() {
                client.forget(this.id);
            }
            tracing::debug!(call = %this.id, "call timed out");
            return Poll::Ready(Err(CallError::Timeout));
        }

        Poll::Pending
    }
}

impl std::fmt::Debug for CallFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallFuture").field("id", &self.id).finish()
    }
}
