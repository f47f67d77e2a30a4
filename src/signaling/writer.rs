use std::fmt::Display;

use futures_util::{Sink, SinkExt};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use super::message::Envelope;

#[derive(Debug)]
pub enum Outgoing {
    Message(Envelope),
    /// Flush what is queued, close the socket and stop.
    Close,
}

/// Handle to a session's outbound queue. Every write to the socket goes through here so only
/// the writer task ever touches the sink.
#[derive(Debug, Clone)]
pub struct Outbound {
    sender: mpsc::Sender<Outgoing>,
}

impl Outbound {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outgoing>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Returns `false` once the writer has gone away.
    pub async fn send(&self, envelope: Envelope) -> bool {
        self.sender.send(Outgoing::Message(envelope)).await.is_ok()
    }

    /// For callbacks that cannot await. Falls back to a spawned send when the queue is full.
    pub fn send_nowait(&self, envelope: Envelope) {
        match self.sender.try_send(Outgoing::Message(envelope)) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(message)) => {
                tracing::warn!("outbound queue is full, sending in background");
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send(message).await;
                });
            }
        }
    }

    pub async fn close(&self) {
        let _ = self.sender.send(Outgoing::Close).await;
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Drains `receiver` into `sink` until a close request, a write failure, or every
/// [`Outbound`] handle is dropped.
pub fn spawn_writer<W>(mut receiver: mpsc::Receiver<Outgoing>, mut sink: W) -> JoinHandle<()>
where
    W: Sink<String> + Unpin + Send + 'static,
    W::Error: Display,
{
    tokio::spawn(async move {
        while let Some(outgoing) = receiver.recv().await {
            let envelope = match outgoing {
                Outgoing::Message(envelope) => envelope,
                Outgoing::Close => break,
            };
            let text = match envelope.to_text() {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!("failed to encode envelope: {}", err);
                    continue;
                }
            };
            if let Err(err) = sink.send(text).await {
                tracing::debug!("socket write failed: {}", err);
                break;
            }
        }
        receiver.close();
        if let Err(err) = sink.close().await {
            tracing::trace!("socket close failed: {}", err);
        }
        tracing::debug!("writer loop has finished");
    })
}
