//! The seam between the session core and the byte-level plumbing.
//!
//! The engine speaks decoded [`Message`]s. Whatever frames them on the wire
//! (the tag=value codec, TCP, TLS) lives behind [`Transport`]; the in-process
//! [`ChannelTransport`] is what the tests and embedders with their own codec
//! use.

use crate::fix::message::Message;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from the underlying byte stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("An I/O error occured: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport closed by peer")]
    Closed,
}

/// A connected, full-duplex stream of decoded messages.
pub trait Transport: Send + 'static {
    fn send(&mut self, message: &Message)
        -> impl Future<Output = Result<(), TransportError>> + Send;
    fn recv(&mut self) -> impl Future<Output = Result<Message, TransportError>> + Send;
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Produces a fresh [`Transport`] per connection attempt, so the engine can
/// reconnect after a transport failure.
pub trait TransportFactory: Send + 'static {
    type Transport: Transport;

    fn connect(&mut self)
        -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// Reconnection behavior on [`TransportError`].
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Dials through `factory` with bounded exponential backoff.
pub async fn connect_with_backoff<F: TransportFactory>(
    factory: &mut F,
    policy: &ReconnectPolicy,
) -> Result<F::Transport, TransportError> {
    let mut delay = policy.initial_delay;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match factory.connect().await {
            Ok(transport) => return Ok(transport),
            Err(e) if attempt >= policy.max_attempts => {
                tracing::error!(attempt, error = %e, "connect failed, giving up");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "connect failed, backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
            }
        }
    }
}

/// An in-process transport over a pair of unbounded channels.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

/// Creates two connected [`ChannelTransport`] halves. Messages sent on one
/// side arrive on the other.
pub fn duplex() -> (ChannelTransport, ChannelTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport { tx: a_tx, rx: b_rx },
        ChannelTransport { tx: b_tx, rx: a_rx },
    )
}

impl Transport for ChannelTransport {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        self.tx
            .send(message.clone())
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Message, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

impl ChannelTransport {
    /// Drains whatever the peer has sent so far without waiting.
    pub fn drain_ready(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::admin;

    #[tokio::test]
    async fn duplex_halves_are_cross_wired() {
        let (mut near, mut far) = duplex();
        near.send(&admin::heartbeat()).await.unwrap();
        let got = far.recv().await.unwrap();
        assert_eq!(got, admin::heartbeat());
    }

    #[tokio::test]
    async fn recv_errors_once_the_peer_is_gone() {
        let (mut near, far) = duplex();
        drop(far);
        assert!(matches!(near.recv().await, Err(TransportError::Closed)));
        assert!(matches!(
            near.send(&admin::heartbeat()).await,
            Err(TransportError::Closed)
        ));
    }

    struct FlakyFactory {
        failures_left: u32,
    }

    impl TransportFactory for FlakyFactory {
        type Transport = ChannelTransport;

        async fn connect(&mut self) -> Result<ChannelTransport, TransportError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(TransportError::Closed);
            }
            let (near, _far) = duplex();
            Ok(near)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_retries_until_the_factory_recovers() {
        let mut factory = FlakyFactory { failures_left: 3 };
        let policy = ReconnectPolicy::default();
        connect_with_backoff(&mut factory, &policy).await.unwrap();
        assert_eq!(factory.failures_left, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_gives_up_after_max_attempts() {
        let mut factory = FlakyFactory { failures_left: 99 };
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        assert!(connect_with_backoff(&mut factory, &policy).await.is_err());
        assert_eq!(factory.failures_left, 96);
    }
}
