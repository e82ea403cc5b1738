//! The write side of a connection, as seen by the connection managers.
//!
//! Managers never touch sockets directly.  Each accepted connection is
//! represented by an `Arc<dyn MessageWriter>`; the infrastructure layer
//! provides the WebSocket and TCP implementations and the tests provide a
//! recording one.  Implementations serialize concurrent writers internally so
//! frames from the relay loop and the ping loop never interleave.

use async_trait::async_trait;
use regap_core::{CodecError, Message, MsgType};
use thiserror::Error;

/// Error type for a failed connection write.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] CodecError),

    /// The underlying socket rejected the write.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
}

/// Error that ends a connection's serving loop.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The connection is not (or no longer) in its manager's table.
    #[error("unknown client {0}")]
    UnknownClient(String),

    /// Writing to the session's own connection failed.
    #[error("can not write {msg_type} message: {source}")]
    Write {
        msg_type: MsgType,
        #[source]
        source: WriteError,
    },
}

/// Serialized, message-level access to one connection's write half.
#[async_trait]
pub trait MessageWriter: Send + Sync {
    /// Encodes `msg` and writes it as one frame.
    async fn write_message(&self, msg: &Message) -> Result<(), WriteError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records every written message on a channel; can be told to fail.
    pub(crate) struct RecordingWriter {
        tx: mpsc::UnboundedSender<Message>,
        fail: AtomicBool,
    }

    impl RecordingWriter {
        pub(crate) fn new() -> (Arc<Self>, Inbox) {
            let (tx, rx) = mpsc::unbounded_channel();
            let writer = Arc::new(Self {
                tx,
                fail: AtomicBool::new(false),
            });
            (writer, Inbox(rx))
        }

        pub(crate) fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MessageWriter for RecordingWriter {
        async fn write_message(&self, msg: &Message) -> Result<(), WriteError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(WriteError::Transport("injected failure".to_string()));
            }
            self.tx.send(msg.clone()).map_err(|_| WriteError::Closed)
        }
    }

    /// Receiving end of a [`RecordingWriter`].
    pub(crate) struct Inbox(mpsc::UnboundedReceiver<Message>);

    impl Inbox {
        /// Waits up to one second for the next written message.
        pub(crate) async fn next(&mut self) -> Message {
            tokio::time::timeout(Duration::from_secs(1), self.0.recv())
                .await
                .expect("timed out waiting for a written message")
                .expect("writer dropped")
        }

        /// Asserts nothing was written within a short grace period.
        pub(crate) async fn assert_empty(&mut self) {
            let got = tokio::time::timeout(Duration::from_millis(50), self.0.recv()).await;
            if let Ok(Some(msg)) = got {
                panic!("unexpected message written: {msg:?}");
            }
        }
    }
}
