//! The ordered chain of session stages every message flows through.
//!
//! Inbound messages enter at the transport end and travel toward the
//! application; outbound messages travel the same chain in reverse. A stage
//! hook may forward the message (mutated or not), consume it, queue new
//! messages in either direction, raise engine events, or ask the whole
//! pipeline to stop. Queued work is drained iteratively after the current
//! traversal, so each direction stays strictly FIFO and hooks never recurse.

use crate::fix::auth::Authentication;
use crate::fix::heartbeat::Heartbeat;
use crate::fix::message::Message;
use crate::fix::seqnum::SeqNumManager;
use crate::fix::session::ClientSession;
use crate::fix::store::StoreStage;
use crate::fix::SessionError;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What a stage hook did with the message.
#[derive(Debug)]
pub(crate) enum Disposition {
    /// Keep propagating, possibly mutated.
    Forward(Message),
    /// The stage consumed the message; propagation halts for this hop.
    /// This is the benign per-message signal and never escapes the pipeline.
    Consumed,
}

pub(crate) type HookResult = Result<Disposition, SessionError>;

/// Out-of-band notifications stages raise for the engine loop.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    LogonAccepted,
    LogoutComplete,
    Fatal(SessionError),
}

/// The non-owning handle a stage uses to reach back into the pipeline
/// without holding a reference to it.
#[derive(Default)]
pub(crate) struct Context {
    pub(crate) to_send: VecDeque<Message>,
    pub(crate) to_receive: VecDeque<Message>,
    pub(crate) events: Vec<SessionEvent>,
    pub(crate) stop_requested: bool,
}

impl Context {
    pub(crate) fn new() -> Context {
        Default::default()
    }

    /// Queue a message for a full application -> transport traversal.
    pub(crate) fn queue_send(&mut self, message: Message) {
        self.to_send.push_back(message);
    }

    /// Queue a message for a full transport -> application traversal.
    pub(crate) fn queue_receive(&mut self, message: Message) {
        self.to_receive.push_back(message);
    }

    pub(crate) fn raise(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    pub(crate) fn request_stop(&mut self) {
        self.stop_requested = true;
    }
}

/// A named session stage. Dispatch is a closed set: the pipeline matches on
/// the variant and each stage routes administrative message types to its
/// typed handlers, falling back to the generic receive/send path.
pub(crate) enum Stage {
    Session(ClientSession),
    Store(StoreStage),
    Auth(Authentication),
    SeqNum(SeqNumManager),
    Heartbeat(Heartbeat),
}

impl Stage {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Stage::Session(_) => ClientSession::NAME,
            Stage::Store(_) => StoreStage::NAME,
            Stage::Auth(_) => Authentication::NAME,
            Stage::SeqNum(_) => SeqNumManager::NAME,
            Stage::Heartbeat(_) => Heartbeat::NAME,
        }
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        match self {
            Stage::SeqNum(stage) => stage.start().await,
            Stage::Session(stage) => stage.start(),
            _ => Ok(()),
        }
    }

    async fn stop(&mut self) -> Result<(), SessionError> {
        match self {
            Stage::Session(stage) => stage.stop(),
            _ => Ok(()),
        }
    }

    async fn on_receive(&mut self, message: Message, ctx: &mut Context) -> HookResult {
        match self {
            Stage::Session(stage) => stage.on_receive(message, ctx),
            Stage::Store(stage) => stage.on_receive(message).await,
            Stage::Auth(stage) => stage.on_receive(message, ctx),
            Stage::SeqNum(stage) => stage.on_receive(message, ctx).await,
            Stage::Heartbeat(stage) => stage.on_receive(message, ctx),
        }
    }

    async fn on_send(&mut self, message: Message, ctx: &mut Context) -> HookResult {
        match self {
            Stage::Session(stage) => stage.on_send(message, ctx),
            Stage::Store(stage) => stage.on_send(message).await,
            Stage::Auth(stage) => stage.on_send(message),
            Stage::SeqNum(stage) => stage.on_send(message),
            Stage::Heartbeat(stage) => stage.on_send(message),
        }
    }
}

/// The stage chain, stored in transport -> application order.
pub(crate) struct Pipeline {
    stages: Vec<Stage>,
    wire_out: VecDeque<Message>,
    app_tx: mpsc::UnboundedSender<Message>,
    events: Vec<SessionEvent>,
    stop_requested: bool,
    stopped: bool,
}

impl Pipeline {
    pub(crate) fn new(stages: Vec<Stage>, app_tx: mpsc::UnboundedSender<Message>) -> Pipeline {
        Pipeline {
            stages,
            wire_out: VecDeque::new(),
            app_tx,
            events: Vec::new(),
            stop_requested: false,
            stopped: false,
        }
    }

    /// Starts stages leaf-first: the transport-facing stage initializes
    /// last. The first failure aborts the startup.
    pub(crate) async fn start(&mut self) -> Result<(), SessionError> {
        for stage in self.stages.iter_mut().rev() {
            stage.start().await?;
        }
        Ok(())
    }

    /// Stops stages in reverse start order. Every stage gets its chance even
    /// if an earlier one errors; the errors are collected, not thrown.
    /// Calling it twice is a no-op.
    pub(crate) async fn stop(&mut self) -> Vec<(&'static str, SessionError)> {
        if self.stopped {
            return Vec::new();
        }
        self.stopped = true;
        let mut errors = Vec::new();
        for stage in self.stages.iter_mut() {
            if let Err(e) = stage.stop().await {
                tracing::warn!(stage = stage.name(), error = %e, "stage failed to stop");
                errors.push((stage.name(), e));
            }
        }
        errors
    }

    /// Pushes `message` application -> transport. On return the message sits
    /// in the wire outbox or was consumed by a stage.
    pub(crate) async fn send(&mut self, message: Message) -> Result<(), SessionError> {
        let mut ctx = Context::new();
        self.send_one(message, &mut ctx).await?;
        self.drain(&mut ctx).await?;
        self.absorb(ctx);
        Ok(())
    }

    /// Pushes `message` transport -> application.
    pub(crate) async fn receive(&mut self, message: Message) -> Result<(), SessionError> {
        let mut ctx = Context::new();
        self.receive_one(message, &mut ctx).await?;
        self.drain(&mut ctx).await?;
        self.absorb(ctx);
        Ok(())
    }

    async fn send_one(&mut self, message: Message, ctx: &mut Context) -> Result<(), SessionError> {
        let mut msg = message;
        for stage in self.stages.iter_mut().rev() {
            match stage.on_send(msg, ctx).await? {
                Disposition::Forward(next) => msg = next,
                Disposition::Consumed => return Ok(()),
            }
        }
        tracing::trace!(message = %msg, "handing message to transport");
        self.wire_out.push_back(msg);
        Ok(())
    }

    async fn receive_one(
        &mut self,
        message: Message,
        ctx: &mut Context,
    ) -> Result<(), SessionError> {
        let mut msg = message;
        for stage in self.stages.iter_mut() {
            match stage.on_receive(msg, ctx).await? {
                Disposition::Forward(next) => msg = next,
                Disposition::Consumed => return Ok(()),
            }
        }
        if msg.is_application() {
            // Receiver gone just means nobody wants application messages.
            let _ = self.app_tx.send(msg);
        }
        Ok(())
    }

    async fn drain(&mut self, ctx: &mut Context) -> Result<(), SessionError> {
        loop {
            if let Some(msg) = ctx.to_send.pop_front() {
                self.send_one(msg, ctx).await?;
                continue;
            }
            if let Some(msg) = ctx.to_receive.pop_front() {
                self.receive_one(msg, ctx).await?;
                continue;
            }
            break;
        }
        Ok(())
    }

    fn absorb(&mut self, ctx: Context) {
        self.events.extend(ctx.events);
        self.stop_requested |= ctx.stop_requested;
    }

    /// Look up a stage by its stable name.
    pub(crate) fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name() == name)
    }

    pub(crate) fn client_session_mut(&mut self) -> Option<&mut ClientSession> {
        self.stages.iter_mut().find_map(|s| match s {
            Stage::Session(stage) => Some(stage),
            _ => None,
        })
    }

    pub(crate) fn authentication(&self) -> Option<&Authentication> {
        self.stages.iter().find_map(|s| match s {
            Stage::Auth(stage) => Some(stage),
            _ => None,
        })
    }

    pub(crate) fn seq_num_manager(&self) -> Option<&SeqNumManager> {
        self.stages.iter().find_map(|s| match s {
            Stage::SeqNum(stage) => Some(stage),
            _ => None,
        })
    }

    fn heartbeat_mut(&mut self) -> Option<&mut Heartbeat> {
        self.stages.iter_mut().find_map(|s| match s {
            Stage::Heartbeat(stage) => Some(stage),
            _ => None,
        })
    }

    /// When the liveness monitor next wants to run.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.stages.iter().find_map(|s| match s {
            Stage::Heartbeat(stage) => Some(stage.next_deadline()),
            _ => None,
        })
    }

    /// Runs the liveness monitor, then any messages it queued.
    pub(crate) async fn handle_timeout(&mut self, now: Instant) -> Result<(), SessionError> {
        let mut ctx = Context::new();
        if let Some(heartbeat) = self.heartbeat_mut() {
            heartbeat.handle_timeout(now, &mut ctx);
        }
        self.drain(&mut ctx).await?;
        self.absorb(ctx);
        Ok(())
    }

    pub(crate) fn pop_wire(&mut self) -> Option<Message> {
        self.wire_out.pop_front()
    }

    /// Returns a message the transport refused, so the next flush retries it
    /// in order.
    pub(crate) fn push_wire_front(&mut self, message: Message) {
        self.wire_out.push_front(message);
    }

    /// Abandons unsent wire messages. They are already in the store, so the
    /// counterparty recovers them through a resend request after reconnect.
    pub(crate) fn clear_wire(&mut self) {
        self.wire_out.clear();
    }

    /// The conversation snapshot, assembled from the stages that own each
    /// piece of it.
    pub(crate) fn status(&self) -> crate::fix::session::SessionStatus {
        let session = self.stages.iter().find_map(|s| match s {
            Stage::Session(stage) => Some(stage),
            _ => None,
        });
        let heartbeat = self.stages.iter().find_map(|s| match s {
            Stage::Heartbeat(stage) => Some(stage),
            _ => None,
        });
        let seqnum = self.seq_num_manager();
        let auth = self.authentication();
        crate::fix::session::SessionStatus {
            sender_comp_id: session.map_or(String::new(), |s| s.sender_comp_id().to_string()),
            target_comp_id: session.map_or(String::new(), |s| s.target_comp_id().to_string()),
            begin_string: session.map_or(String::new(), |s| s.begin_string().to_string()),
            heartbeat_interval: heartbeat.map_or(std::time::Duration::ZERO, |h| h.interval()),
            send_seq_num: seqnum.map_or(0, |s| s.send_seq_num()),
            receive_seq_num: seqnum.map_or(0, |s| s.receive_seq_num()),
            is_resumed: session.map_or(false, |s| s.is_resumed()),
            test_mode: auth.map_or(false, |a| a.test_mode()),
        }
    }

    pub(crate) fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fix::admin;
    use crate::fix::fields::{MsgType, Tags};
    use crate::fix::store::MessageStore;
    use crate::SessionSettings;

    /// Logs from the stages under test land in the captured test output.
    pub(crate) fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    pub(crate) fn test_settings() -> SessionSettings {
        SessionSettings::builder()
            .with_sender_comp_id("SND")
            .with_target_comp_id("TGT")
            .build()
            .unwrap()
    }

    /// A standard five-stage pipeline over an in-memory store.
    pub(crate) fn test_pipeline(
        settings: &SessionSettings,
        resumed: bool,
    ) -> (Pipeline, mpsc::UnboundedReceiver<Message>, MessageStore) {
        let store = MessageStore::memory();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let session = ClientSession::new(settings, resumed);
        let clock = session.clock();
        let stages = vec![
            Stage::Session(session),
            Stage::Store(StoreStage::new(store.clone())),
            Stage::Auth(Authentication::new(settings)),
            Stage::SeqNum(SeqNumManager::new(store.clone(), resumed)),
            Stage::Heartbeat(Heartbeat::new(settings, clock)),
        ];
        (Pipeline::new(stages, app_tx), app_rx, store)
    }

    fn order(cl_ord_id: &str) -> Message {
        Message::new(MsgType::ORDER_SINGLE).with_field(Tags::ClOrdID, cl_ord_id)
    }

    fn received_order(seq_num: u32) -> Message {
        let mut msg = order("inbound")
            .with_field(Tags::SenderCompID, "TGT")
            .with_field(Tags::TargetCompID, "SND");
        msg.set_seq_num(seq_num);
        msg
    }

    #[tokio::test]
    async fn stages_sit_in_transport_to_application_order() {
        let settings = test_settings();
        let (pipeline, _app_rx, _store) = test_pipeline(&settings, false);
        let names: Vec<&str> = pipeline.stages.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "client_session",
                "message_store",
                "authentication",
                "seq_num_manager",
                "heartbeat",
            ]
        );
        assert!(pipeline.stage("seq_num_manager").is_some());
        assert!(pipeline.stage("nope").is_none());
    }

    #[tokio::test]
    async fn outbound_messages_land_in_the_wire_outbox() {
        let settings = test_settings();
        let (mut pipeline, _app_rx, _store) = test_pipeline(&settings, false);
        pipeline.start().await.unwrap();

        pipeline.send(order("a")).await.unwrap();
        pipeline.send(order("b")).await.unwrap();

        let first = pipeline.pop_wire().unwrap();
        let second = pipeline.pop_wire().unwrap();
        assert_eq!(first.seq_num(), Some(1));
        assert_eq!(second.seq_num(), Some(2));
        assert_eq!(first.sender_comp_id(), Some("SND"));
        assert_eq!(first.target_comp_id(), Some("TGT"));
        assert!(first.sending_time().is_some());
        assert!(pipeline.pop_wire().is_none());
    }

    #[tokio::test]
    async fn inbound_application_messages_reach_the_application_edge() {
        let settings = test_settings();
        let (mut pipeline, mut app_rx, _store) = test_pipeline(&settings, false);
        pipeline.start().await.unwrap();

        pipeline.receive(received_order(1)).await.unwrap();

        let got = app_rx.try_recv().unwrap();
        assert_eq!(got.seq_num(), Some(1));
    }

    #[tokio::test]
    async fn inbound_admin_messages_stay_inside_the_session_layer() {
        let settings = test_settings();
        let (mut pipeline, mut app_rx, _store) = test_pipeline(&settings, false);
        pipeline.start().await.unwrap();

        let mut hb = admin::heartbeat()
            .with_field(Tags::SenderCompID, "TGT")
            .with_field(Tags::TargetCompID, "SND");
        hb.set_seq_num(1);
        pipeline.receive(hb).await.unwrap();

        assert!(app_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_message_is_archived_on_the_way_through() {
        let settings = test_settings();
        let (mut pipeline, _app_rx, store) = test_pipeline(&settings, false);
        pipeline.start().await.unwrap();

        pipeline.send(order("a")).await.unwrap();
        pipeline.receive(received_order(1)).await.unwrap();

        assert_eq!(store.max_sent_seq_num().await.unwrap(), 1);
        assert_eq!(store.max_received_seq_num().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn gap_recovery_delivers_in_order() {
        let settings = test_settings();
        let (mut pipeline, mut app_rx, _store) = test_pipeline(&settings, false);
        pipeline.start().await.unwrap();

        for seq in 1..=3 {
            pipeline.receive(received_order(seq)).await.unwrap();
        }
        pipeline.receive(received_order(6)).await.unwrap();

        // One resend request on the wire, message 6 parked.
        let request = pipeline.pop_wire().unwrap();
        assert_eq!(request.msg_type(), Some(MsgType::RESEND_REQUEST));
        assert_eq!(request.begin_seq_no(), Some(4));
        assert_eq!(request.end_seq_no(), Some(0));
        assert!(pipeline.pop_wire().is_none());

        // The counterparty fills the gap.
        for seq in [4u32, 5] {
            let mut fill = received_order(seq);
            fill.set_poss_dup(true);
            pipeline.receive(fill).await.unwrap();
        }

        let delivered: Vec<u32> = (0..6)
            .map(|_| app_rx.try_recv().unwrap().seq_num().unwrap())
            .collect();
        assert_eq!(delivered, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(pipeline.seq_num_manager().unwrap().receive_seq_num(), 6);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let settings = test_settings();
        let (mut pipeline, _app_rx, _store) = test_pipeline(&settings, false);
        pipeline.start().await.unwrap();
        assert!(pipeline.stop().await.is_empty());
        assert!(pipeline.stop().await.is_empty());
    }
}
