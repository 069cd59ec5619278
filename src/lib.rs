//! A FIX session-layer engine for the buy-side.
//!
//! fixpipe implements the stateful, bidirectional session conversation of
//! the FIX protocol: logon negotiation, heartbeat liveness, strict
//! per-direction sequencing with gap recovery, and a durable record of every
//! message, organized as a pipeline of stages between a transport and the
//! application.
//!
//! ## Terminology
//! * `FIX Connection` -- a single transport connection to a FIX session. The
//!   connection starts with a logon handshake and ends properly with a
//!   logout, but is considered ended whenever the transport breaks.
//! * `FIX Session` -- the conceptual stream of ordered messages between two
//!   peers. A session can live across multiple connections; on reconnect the
//!   sequence numbers and message history are resumed from the store.
//! * `Pipeline` -- the ordered stage chain every message flows through:
//!   client session, message store, authentication, sequence number manager,
//!   heartbeat, then the application.
//!
//! The byte-level encoder/decoder and the socket itself stay outside the
//! engine: implement [`Transport`]/[`TransportFactory`] over your codec, or
//! wire the in-process [`duplex`] pair to it.
//!
//! ## Example
//! ```no_run
//! use fixpipe::{ApplicationError, SessionInitiator, SessionSettings};
//! use fixpipe::fix::transport::{duplex, ChannelTransport, TransportError, TransportFactory};
//!
//! struct Bridge(Option<ChannelTransport>);
//!
//! impl TransportFactory for Bridge {
//!     type Transport = ChannelTransport;
//!
//!     async fn connect(&mut self) -> Result<ChannelTransport, TransportError> {
//!         self.0.take().ok_or(TransportError::Closed)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ApplicationError> {
//!     let settings = SessionSettings::builder()
//!         .with_sender_comp_id("my_id")
//!         .with_target_comp_id("peer_id")
//!         .build()?;
//!
//!     let (engine_half, codec_half) = duplex();
//!     // hand `codec_half` to the encoder/decoder task that owns the socket
//!     # drop(codec_half);
//!
//!     let (handle, mut app_messages) = SessionInitiator::build(settings)?
//!         .initiate(Bridge(Some(engine_half)))
//!         .await?;
//!
//!     // handle incoming application messages in the background...
//!     tokio::spawn(async move {
//!         while let Some(msg) = app_messages.recv().await {
//!             println!("got an application message: {}", msg);
//!         }
//!     });
//!
//!     // start the FIX connection
//!     handle.start_async().await?;
//!
//!     // send messages here...
//!
//!     // end the FIX connection
//!     handle.end_async().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod fix;

use fix::store::StoreError;
use fix::transport::{ReconnectPolicy, TransportFactory};
use fix::Request;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use fix::message::Message;
pub use fix::store::MessageStore;
pub use fix::{SessionError, SessionStatus};

/// Errors that can occur while running fixpipe.
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("An I/O error occured: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Session ended unexpectedly")]
    SessionEnded,
    #[error("Logon has failed")]
    LogonFailed,
    #[error("Logout has failed")]
    LogoutFailed,
    #[error("MessageSend has failed")]
    SendMessageFailed,
    #[error("setting `{0}` is required")]
    SettingRequired(String),
    #[error("message store could not be opened: {0}")]
    Store(#[from] StoreError),
}

/// A collection of settings used to configurate a FIX session.
///
/// `SessionSettings` can be constructed using the [`SessionSettingsBuilder`].
#[derive(Clone, Debug)]
pub struct SessionSettings {
    begin_string: String,
    sender_comp_id: String,
    target_comp_id: String,
    session_id: String,
    heartbeat_int: Duration,
    reset_seq_nums: bool,
    test_mode: bool,
    max_lost_heartbeats: u32,
    store_path: Option<PathBuf>,
    reconnect: ReconnectPolicy,
}

impl SessionSettings {
    /// Creates a new [`SessionSettingsBuilder`].
    pub fn builder() -> SessionSettingsBuilder {
        SessionSettingsBuilder::new()
    }

    pub fn begin_string(&self) -> &str {
        &self.begin_string
    }

    pub fn sender_comp_id(&self) -> &str {
        &self.sender_comp_id
    }

    pub fn target_comp_id(&self) -> &str {
        &self.target_comp_id
    }

    /// The local identifier the store uses to key this session's messages.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn heartbeat_int(&self) -> Duration {
        self.heartbeat_int
    }

    pub fn reset_seq_nums(&self) -> bool {
        self.reset_seq_nums
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    pub fn max_lost_heartbeats(&self) -> u32 {
        self.max_lost_heartbeats
    }

    pub fn store_path(&self) -> Option<&PathBuf> {
        self.store_path.as_ref()
    }

    pub fn reconnect(&self) -> &ReconnectPolicy {
        &self.reconnect
    }
}

/// A builder for easily configuring all the fields of a [`SessionSettings`].
///
/// The following settings are required to be set:
/// * sender comp id
/// * target comp id
#[derive(Default)]
pub struct SessionSettingsBuilder {
    begin_string: Option<String>,
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    session_id: Option<String>,
    heartbeat_int: Option<Duration>,
    reset_seq_nums: bool,
    test_mode: bool,
    max_lost_heartbeats: Option<u32>,
    store_path: Option<PathBuf>,
    reconnect: Option<ReconnectPolicy>,
}

impl SessionSettingsBuilder {
    pub fn new() -> SessionSettingsBuilder {
        Default::default()
    }

    /// The `SenderCompID(49)` that will be included in each message.
    pub fn with_sender_comp_id(mut self, sender_comp_id: &str) -> Self {
        self.set_sender_comp_id(sender_comp_id);
        self
    }
    pub fn set_sender_comp_id(&mut self, sender_comp_id: &str) {
        self.sender_comp_id = Some(sender_comp_id.to_string());
    }

    /// The `TargetCompID(56)` that will be included in each message.
    pub fn with_target_comp_id(mut self, target_comp_id: &str) -> Self {
        self.set_target_comp_id(target_comp_id);
        self
    }
    pub fn set_target_comp_id(&mut self, target_comp_id: &str) {
        self.target_comp_id = Some(target_comp_id.to_string());
    }

    /// The `BeginString(8)` of the session, `"FIX.4.2"` unless set.
    pub fn with_begin_string(mut self, begin_string: &str) -> Self {
        self.set_begin_string(begin_string);
        self
    }
    pub fn set_begin_string(&mut self, begin_string: &str) {
        self.begin_string = Some(begin_string.to_string());
    }

    /// A local unique identifier for this FIX session.
    pub fn with_session_id(mut self, session_id: &str) -> Self {
        self.set_session_id(session_id);
        self
    }
    pub fn set_session_id(&mut self, session_id: &str) {
        self.session_id = Some(session_id.to_string());
    }

    /// The `HeartBtInt(108)` proposed at logon.
    pub fn with_heartbeat_int(mut self, heartbeat_int: Duration) -> Self {
        self.set_heartbeat_int(heartbeat_int);
        self
    }
    pub fn set_heartbeat_int(&mut self, heartbeat_int: Duration) {
        self.heartbeat_int = Some(heartbeat_int);
    }

    /// Request a sequence number reset at logon (`ResetSeqNumFlag(141)`).
    pub fn with_reset_seq_nums(mut self, reset: bool) -> Self {
        self.set_reset_seq_nums(reset);
        self
    }
    pub fn set_reset_seq_nums(&mut self, reset: bool) {
        self.reset_seq_nums = reset;
    }

    /// Set `TestMessageIndicator(464)` on the logon.
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.set_test_mode(test_mode);
        self
    }
    pub fn set_test_mode(&mut self, test_mode: bool) {
        self.test_mode = test_mode;
    }

    /// How many unanswered test requests declare the counterparty dead.
    pub fn with_max_lost_heartbeats(mut self, max_lost: u32) -> Self {
        self.set_max_lost_heartbeats(max_lost);
        self
    }
    pub fn set_max_lost_heartbeats(&mut self, max_lost: u32) {
        self.max_lost_heartbeats = Some(max_lost);
    }

    /// The file that should be used as the sqlite database file.
    pub fn with_store_path(mut self, store_path: PathBuf) -> Self {
        self.set_store_path(store_path);
        self
    }
    pub fn set_store_path(&mut self, store_path: PathBuf) {
        self.store_path = Some(store_path);
    }

    /// Reconnection behavior after a transport failure.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.set_reconnect(reconnect);
        self
    }
    pub fn set_reconnect(&mut self, reconnect: ReconnectPolicy) {
        self.reconnect = Some(reconnect);
    }

    /// Build the [`SessionSettings`] struct.
    ///
    /// Returns an `Err(ApplicationError::SettingRequired)` if not all of the
    /// required fields were set.
    pub fn build(self) -> Result<SessionSettings, ApplicationError> {
        let sender_comp_id = self
            .sender_comp_id
            .ok_or(ApplicationError::SettingRequired(
                "sender_comp_id".to_string(),
            ))?;
        let target_comp_id = self
            .target_comp_id
            .ok_or(ApplicationError::SettingRequired(
                "target_comp_id".to_string(),
            ))?;

        Ok(SessionSettings {
            begin_string: self.begin_string.unwrap_or(String::from("FIX.4.2")),
            session_id: self
                .session_id
                .unwrap_or(format!("{}_{}", &sender_comp_id, &target_comp_id)),
            heartbeat_int: self.heartbeat_int.unwrap_or(Duration::from_secs(30)),
            reset_seq_nums: self.reset_seq_nums,
            test_mode: self.test_mode,
            max_lost_heartbeats: self.max_lost_heartbeats.unwrap_or(3),
            store_path: self.store_path,
            reconnect: self.reconnect.unwrap_or_default(),
            sender_comp_id,
            target_comp_id,
        })
    }
}

/// A handle on a running FIX session engine.
///
/// The handle requests the basic operations of starting the connection,
/// sending a message to the peer, and ending the connection. It `impl`s
/// [`Clone`], so multiple tasks can send messages through the same session.
///
/// The underlying engine could stop running at any moment. An attempted
/// operation on a dead engine returns [`ApplicationError::SessionEnded`].
#[derive(Clone)]
pub struct SessionHandle {
    request_sender: mpsc::UnboundedSender<Request>,
}

impl SessionHandle {
    /// Ask the engine to perform the logon handshake and return immediately.
    ///
    /// The receiver eventually yields `true` once the counterparty confirmed
    /// the logon, `false` otherwise.
    pub fn start(&self) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        if self.request_sender.is_closed() {
            return Err(ApplicationError::SessionEnded);
        }
        let (resp_sender, resp_receiver) = oneshot::channel();
        let _ = self.request_sender.send(Request::Logon { resp_sender });
        Ok(resp_receiver)
    }

    /// Ask the engine to perform the logon handshake and await the outcome.
    pub async fn start_async(&self) -> Result<(), ApplicationError> {
        if Ok(true) != self.start()?.await {
            return Err(ApplicationError::LogonFailed);
        }
        Ok(())
    }

    /// Ask the engine to send `message` to the peer and return immediately.
    ///
    /// The receiver yields `true` once the message has been handed to the
    /// transport.
    pub fn send_message(
        &self,
        message: Message,
    ) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        if self.request_sender.is_closed() {
            return Err(ApplicationError::SessionEnded);
        }
        let (resp_sender, resp_receiver) = oneshot::channel();
        let _ = self.request_sender.send(Request::SendMessage {
            resp_sender,
            message,
        });
        Ok(resp_receiver)
    }

    /// Ask the engine to send `message` and await the outcome.
    pub async fn send_message_async(&self, message: Message) -> Result<(), ApplicationError> {
        if Ok(true) != self.send_message(message)?.await {
            return Err(ApplicationError::SendMessageFailed);
        }
        Ok(())
    }

    /// Ask the engine to end the FIX connection and return immediately.
    pub fn end(&self) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        let (resp_sender, resp_receiver) = oneshot::channel();
        let _ = self.request_sender.send(Request::Logout { resp_sender });
        Ok(resp_receiver)
    }

    /// Ask the engine to end the FIX connection and await the outcome.
    pub async fn end_async(&self) -> Result<(), ApplicationError> {
        if Ok(true) != self.end()?.await {
            return Err(ApplicationError::LogoutFailed);
        }
        Ok(())
    }

    /// Snapshot of the running conversation.
    pub async fn status_async(&self) -> Result<SessionStatus, ApplicationError> {
        if self.request_sender.is_closed() {
            return Err(ApplicationError::SessionEnded);
        }
        let (resp_sender, resp_receiver) = oneshot::channel();
        let _ = self.request_sender.send(Request::Status { resp_sender });
        resp_receiver
            .await
            .map_err(|_| ApplicationError::SessionEnded)
    }
}

/// Builds a FIX engine instance and connects it to a transport.
pub struct SessionInitiator {
    settings: SessionSettings,
    store: Option<MessageStore>,
}

impl SessionInitiator {
    pub fn build(settings: SessionSettings) -> Result<SessionInitiator, ApplicationError> {
        Ok(SessionInitiator {
            settings,
            store: None,
        })
    }

    /// Use an explicit store instead of the one implied by the settings.
    pub fn with_store(mut self, store: MessageStore) -> SessionInitiator {
        self.store = Some(store);
        self
    }

    /// Connects through `factory` and spawns the engine on the current
    /// runtime.
    ///
    /// Returns the session handle and the channel of inbound application
    /// messages. Administrative traffic never reaches that channel; it is
    /// handled and archived inside the pipeline.
    pub async fn initiate<F: TransportFactory>(
        self,
        factory: F,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<Message>), ApplicationError> {
        let store = match self.store {
            Some(store) => store,
            None => open_store(&self.settings).await?,
        };

        let (request_sender, request_receiver) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let settings = self.settings;

        tokio::spawn(async move {
            if let Err(e) =
                fix::run_session(factory, request_receiver, app_tx, store, settings).await
            {
                tracing::error!(error = %e, "session ended with error");
            }
        });

        Ok((SessionHandle { request_sender }, app_rx))
    }
}

async fn open_store(settings: &SessionSettings) -> Result<MessageStore, StoreError> {
    #[cfg(feature = "sqlite")]
    if let Some(path) = settings.store_path() {
        return MessageStore::sqlite(path.clone(), settings.session_id().to_string()).await;
    }
    #[cfg(not(feature = "sqlite"))]
    if settings.store_path().is_some() {
        tracing::warn!("store_path set but the sqlite feature is disabled, using memory store");
    }
    Ok(MessageStore::memory())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::admin;
    use crate::fix::fields::{MsgType, Tags};
    use crate::fix::transport::{duplex, ChannelTransport, Transport, TransportError};
    use assert_matches::assert_matches;

    struct OnceFactory(Option<ChannelTransport>);

    impl TransportFactory for OnceFactory {
        type Transport = ChannelTransport;

        async fn connect(&mut self) -> Result<ChannelTransport, TransportError> {
            self.0.take().ok_or(TransportError::Closed)
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings::builder()
            .with_sender_comp_id("SND")
            .with_target_comp_id("TGT")
            .with_heartbeat_int(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    fn from_peer(mut msg: Message, seq_num: u32) -> Message {
        msg.set_seq_num(seq_num);
        msg.set_field(Tags::SenderCompID, "TGT");
        msg.set_field(Tags::TargetCompID, "SND");
        msg
    }

    async fn initiate(
        settings: SessionSettings,
        store: MessageStore,
    ) -> (
        SessionHandle,
        mpsc::UnboundedReceiver<Message>,
        ChannelTransport,
    ) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (engine_half, peer) = duplex();
        let (handle, app_rx) = SessionInitiator::build(settings)
            .unwrap()
            .with_store(store)
            .initiate(OnceFactory(Some(engine_half)))
            .await
            .unwrap();
        (handle, app_rx, peer)
    }

    #[tokio::test]
    async fn logon_traffic_and_logout_round_trip() {
        let (handle, mut app_rx, mut peer) = initiate(settings(), MessageStore::memory()).await;

        // Logon goes out populated and numbered.
        let logon_recv = handle.start().unwrap();
        let outbound = peer.recv().await.unwrap();
        assert_eq!(outbound.msg_type(), Some(MsgType::LOGON));
        assert_eq!(outbound.seq_num(), Some(1));
        assert_eq!(outbound.encrypt_method(), Some(0));
        assert_eq!(outbound.heart_bt_int(), Some(30));
        assert_eq!(outbound.sender_comp_id(), Some("SND"));
        assert_eq!(outbound.target_comp_id(), Some("TGT"));

        // Mirrored response completes the handshake.
        peer.send(&from_peer(admin::logon(30), 1)).await.unwrap();
        assert_eq!(logon_recv.await, Ok(true));

        // Inbound application traffic surfaces on the application channel.
        let report =
            Message::new(MsgType::EXECUTION_REPORT).with_field(Tags::OrderID, "o-1");
        peer.send(&from_peer(report, 2)).await.unwrap();
        let got = app_rx.recv().await.unwrap();
        assert_eq!(got.msg_type(), Some(MsgType::EXECUTION_REPORT));
        assert_eq!(got.seq_num(), Some(2));

        // Outbound application traffic is numbered after the logon.
        let order = Message::new(MsgType::ORDER_SINGLE).with_field(Tags::ClOrdID, "c-1");
        handle.send_message_async(order).await.unwrap();
        let outbound = peer.recv().await.unwrap();
        assert_eq!(outbound.msg_type(), Some(MsgType::ORDER_SINGLE));
        assert_eq!(outbound.seq_num(), Some(2));

        // Logout completes once the peer confirms.
        let logout_recv = handle.end().unwrap();
        let outbound = peer.recv().await.unwrap();
        assert_eq!(outbound.msg_type(), Some(MsgType::LOGOUT));
        peer.send(&from_peer(admin::logout(), 3)).await.unwrap();
        assert_eq!(logout_recv.await, Ok(true));
    }

    #[tokio::test]
    async fn logon_mismatch_fails_the_start_and_logs_out() {
        let (handle, _app_rx, mut peer) = initiate(settings(), MessageStore::memory()).await;

        let logon_recv = handle.start().unwrap();
        let _outbound_logon = peer.recv().await.unwrap();

        // Counterparty disagrees on the heartbeat interval.
        peer.send(&from_peer(admin::logon(60), 1)).await.unwrap();

        assert_eq!(logon_recv.await, Ok(false));
        let logout = peer.recv().await.unwrap();
        assert_eq!(logout.msg_type(), Some(MsgType::LOGOUT));
        assert!(logout.field_str(Tags::Text).is_some());
    }

    #[tokio::test]
    async fn resumed_session_continues_its_counters() {
        let store = MessageStore::memory();
        for seq in 1..=5u32 {
            let mut msg = Message::new(MsgType::ORDER_SINGLE).with_field(Tags::ClOrdID, "c");
            msg.set_seq_num(seq);
            store.set_sent(msg).await.unwrap();
        }
        for seq in 1..=3u32 {
            let mut msg = Message::new(MsgType::EXECUTION_REPORT);
            msg.set_seq_num(seq);
            store.set_received(msg).await.unwrap();
        }

        let (handle, _app_rx, mut peer) = initiate(settings(), store).await;

        let logon_recv = handle.start().unwrap();
        let outbound = peer.recv().await.unwrap();
        // Counters picked up where the last connection left off.
        assert_eq!(outbound.seq_num(), Some(6));
        peer.send(&from_peer(admin::logon(30), 4)).await.unwrap();
        assert_eq!(logon_recv.await, Ok(true));

        let status = handle.status_async().await.unwrap();
        assert!(status.is_resumed);
        assert_eq!(status.send_seq_num, 6);
        assert_eq!(status.receive_seq_num, 4);
        assert_eq!(status.sender_comp_id, "SND");
    }

    #[tokio::test]
    async fn send_before_logon_is_refused() {
        let (handle, _app_rx, _peer) = initiate(settings(), MessageStore::memory()).await;

        let order = Message::new(MsgType::ORDER_SINGLE);
        let result = handle.send_message_async(order).await;
        assert_matches!(result, Err(ApplicationError::SendMessageFailed));
    }

    #[tokio::test]
    async fn missing_settings_are_reported() {
        let result = SessionSettings::builder().with_sender_comp_id("SND").build();
        assert_matches!(result, Err(ApplicationError::SettingRequired(field)) if field == "target_comp_id");
    }
}
