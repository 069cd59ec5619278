//! The transport-facing stage: connection lifecycle, resumption, and the
//! receive/send clocks the liveness monitor reads.

use crate::fix::admin;
use crate::fix::fields::{MsgType, Tags};
use crate::fix::message::Message;
use crate::fix::pipeline::{Context, Disposition, HookResult, SessionEvent};
use crate::fix::SessionError;
use crate::SessionSettings;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Snapshot of the conversation, the engine's answer to a status request.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub begin_string: String,
    pub heartbeat_interval: Duration,
    pub send_seq_num: u32,
    pub receive_seq_num: u32,
    pub is_resumed: bool,
    pub test_mode: bool,
}

struct ClockInner {
    epoch: Instant,
    last_receive_ms: AtomicU64,
    last_send_ms: AtomicU64,
}

/// Shared receive/send timestamps. The client session marks them as traffic
/// passes the transport edge; the heartbeat monitor reads them. Stored as
/// millisecond offsets from a fixed epoch so the handle stays `Clone` and
/// lock-free.
#[derive(Clone)]
pub(crate) struct LivenessClock(Arc<ClockInner>);

impl LivenessClock {
    pub(crate) fn new() -> LivenessClock {
        LivenessClock(Arc::new(ClockInner {
            epoch: Instant::now(),
            last_receive_ms: AtomicU64::new(0),
            last_send_ms: AtomicU64::new(0),
        }))
    }

    fn now_ms(&self) -> u64 {
        Instant::now().duration_since(self.0.epoch).as_millis() as u64
    }

    pub(crate) fn mark_receive(&self) {
        self.0.last_receive_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn mark_send(&self) {
        self.0.last_send_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn since_last_receive(&self) -> Duration {
        Duration::from_millis(self.now_ms() - self.0.last_receive_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn since_last_send(&self) -> Duration {
        Duration::from_millis(self.now_ms() - self.0.last_send_ms.load(Ordering::Relaxed))
    }
}

/// Stage 1 (transport end).
pub(crate) struct ClientSession {
    sender_comp_id: String,
    target_comp_id: String,
    begin_string: String,
    is_resumed: bool,
    logout_sent: bool,
    clock: LivenessClock,
}

impl ClientSession {
    pub(crate) const NAME: &'static str = "client_session";

    pub(crate) fn new(settings: &SessionSettings, is_resumed: bool) -> ClientSession {
        ClientSession {
            sender_comp_id: settings.sender_comp_id().to_string(),
            target_comp_id: settings.target_comp_id().to_string(),
            begin_string: settings.begin_string().to_string(),
            is_resumed,
            logout_sent: false,
            clock: LivenessClock::new(),
        }
    }

    pub(crate) fn clock(&self) -> LivenessClock {
        self.clock.clone()
    }

    pub(crate) fn is_resumed(&self) -> bool {
        self.is_resumed
    }

    /// A reconnect continues the previous conversation.
    pub(crate) fn set_resumed(&mut self, is_resumed: bool) {
        self.is_resumed = is_resumed;
    }

    pub(crate) fn sec_since_last_receive(&self) -> u64 {
        self.clock.since_last_receive().as_secs()
    }

    pub(crate) fn begin_string(&self) -> &str {
        &self.begin_string
    }

    pub(crate) fn sender_comp_id(&self) -> &str {
        &self.sender_comp_id
    }

    pub(crate) fn target_comp_id(&self) -> &str {
        &self.target_comp_id
    }

    pub(crate) fn start(&mut self) -> Result<(), SessionError> {
        self.clock.mark_receive();
        self.clock.mark_send();
        tracing::info!(
            sender = %self.sender_comp_id,
            target = %self.target_comp_id,
            resumed = self.is_resumed,
            "client session starting"
        );
        Ok(())
    }

    pub(crate) fn stop(&mut self) -> Result<(), SessionError> {
        tracing::info!("client session stopped");
        Ok(())
    }

    pub(crate) fn on_send(&mut self, mut message: Message, _ctx: &mut Context) -> HookResult {
        self.clock.mark_send();
        if message.sender_comp_id().is_none() {
            message.set_field(Tags::SenderCompID, self.sender_comp_id.clone());
        }
        if message.target_comp_id().is_none() {
            message.set_field(Tags::TargetCompID, self.target_comp_id.clone());
        }
        if message.msg_type() == Some(MsgType::LOGOUT) {
            self.logout_sent = true;
        }
        Ok(Disposition::Forward(message))
    }

    pub(crate) fn on_receive(&mut self, message: Message, ctx: &mut Context) -> HookResult {
        self.clock.mark_receive();

        // The counterparty's comp ids are ours, mirrored.
        if let Some(sender) = message.sender_comp_id() {
            if sender != self.target_comp_id {
                return Err(SessionError::CompIdMismatch {
                    expected: self.target_comp_id.clone(),
                    received: sender.to_string(),
                });
            }
        }
        if let Some(target) = message.target_comp_id() {
            if target != self.sender_comp_id {
                return Err(SessionError::CompIdMismatch {
                    expected: self.sender_comp_id.clone(),
                    received: target.to_string(),
                });
            }
        }

        if message.msg_type() == Some(MsgType::LOGOUT) {
            return self.on_logout(message, ctx);
        }
        Ok(Disposition::Forward(message))
    }

    fn on_logout(&mut self, message: Message, ctx: &mut Context) -> HookResult {
        if self.logout_sent {
            tracing::info!("received logout response");
        } else {
            tracing::info!("received logout request, confirming");
            ctx.queue_send(admin::logout());
        }
        ctx.raise(SessionEvent::LogoutComplete);
        ctx.request_stop();
        // Forwarded so the sequence manager still accounts for it.
        Ok(Disposition::Forward(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::fields::Tags;
    use crate::fix::pipeline::tests::test_settings;
    use assert_matches::assert_matches;

    fn inbound(msg: Message) -> Message {
        msg.with_field(Tags::SenderCompID, "TGT")
            .with_field(Tags::TargetCompID, "SND")
    }

    #[tokio::test]
    async fn outbound_messages_get_the_session_comp_ids() {
        let settings = test_settings();
        let mut session = ClientSession::new(&settings, false);
        let mut ctx = Context::new();

        let result = session.on_send(admin::heartbeat(), &mut ctx).unwrap();
        let msg = assert_matches!(result, Disposition::Forward(m) => m);
        assert_eq!(msg.sender_comp_id(), Some("SND"));
        assert_eq!(msg.target_comp_id(), Some("TGT"));
    }

    #[tokio::test]
    async fn mismatched_comp_id_is_a_session_error() {
        let settings = test_settings();
        let mut session = ClientSession::new(&settings, false);
        let mut ctx = Context::new();

        let msg = admin::heartbeat().with_field(Tags::SenderCompID, "SOMEONE_ELSE");
        let err = session.on_receive(msg, &mut ctx).unwrap_err();
        assert_matches!(err, SessionError::CompIdMismatch { .. });
    }

    #[tokio::test]
    async fn peer_initiated_logout_is_confirmed_and_stops_the_pipeline() {
        let settings = test_settings();
        let mut session = ClientSession::new(&settings, false);
        let mut ctx = Context::new();

        session.on_receive(inbound(admin::logout()), &mut ctx).unwrap();

        assert_eq!(ctx.to_send.len(), 1);
        assert_eq!(ctx.to_send[0].msg_type(), Some(MsgType::LOGOUT));
        assert!(ctx.stop_requested);
    }

    #[tokio::test]
    async fn logout_response_is_not_answered() {
        let settings = test_settings();
        let mut session = ClientSession::new(&settings, false);
        let mut ctx = Context::new();

        session.on_send(admin::logout(), &mut ctx).unwrap();
        session.on_receive(inbound(admin::logout()), &mut ctx).unwrap();

        assert!(ctx.to_send.is_empty());
        assert!(ctx.stop_requested);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_clock_tracks_inbound_traffic() {
        let settings = test_settings();
        let mut session = ClientSession::new(&settings, false);
        session.start().unwrap();

        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(session.sec_since_last_receive(), 7);

        let mut ctx = Context::new();
        session.on_receive(inbound(admin::heartbeat()), &mut ctx).unwrap();
        assert_eq!(session.sec_since_last_receive(), 0);
    }
}
