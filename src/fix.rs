//! The session engine: error taxonomy, stage assembly, and the event loop
//! that drives the pipeline against a transport.

use crate::fix::message::Message;
use crate::fix::pipeline::{Pipeline, SessionEvent, Stage};
use crate::fix::session::ClientSession;
use crate::fix::store::{MessageStore, StoreError};
use crate::fix::transport::{
    connect_with_backoff, Transport, TransportError, TransportFactory,
};
use crate::SessionSettings;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};

pub mod admin;
pub mod fields;
pub mod message;
pub mod store;
pub mod transport;

mod auth;
mod heartbeat;
mod pipeline;
mod seqnum;
mod session;
#[cfg(feature = "sqlite")]
mod sqlite_store;

pub use session::SessionStatus;

/// Unrecoverable protocol failures. Any of these stops the pipeline with a
/// best-effort Logout.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("An I/O error occured: {0}")]
    Io(#[from] std::io::Error),
    #[error("message store failure: {0}")]
    Store(#[from] StoreError),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("required tag {tag} missing")]
    MissingField { tag: u32 },
    #[error("logon response mismatch on {field}: sent {sent}, received {received}")]
    LogonMismatch {
        field: &'static str,
        sent: String,
        received: String,
    },
    #[error("CompID mismatch: expected {expected}, received {received}")]
    CompIdMismatch { expected: String, received: String },
    #[error("MsgSeqNum too low, expecting {expected} but received {received}")]
    SequenceTooLow { expected: u32, received: u32 },
    #[error("OrigSendingTime {orig} is later than SendingTime {sending}")]
    OrigSendingTimeAhead {
        orig: DateTime<Utc>,
        sending: DateTime<Utc>,
    },
    #[error("resend request begins at {begin} but highest sent seq num is {latest}")]
    ResendOutOfRange { begin: u32, latest: u32 },
    #[error("no heartbeat response after {attempts} test requests")]
    TestRequestTimeout { attempts: u32 },
}

/// What a [`SessionHandle`](crate::SessionHandle) asks of the engine.
pub(crate) enum Request {
    Logon {
        resp_sender: oneshot::Sender<bool>,
    },
    SendMessage {
        resp_sender: oneshot::Sender<bool>,
        message: Message,
    },
    Logout {
        resp_sender: oneshot::Sender<bool>,
    },
    Status {
        resp_sender: oneshot::Sender<session::SessionStatus>,
    },
}

fn build_pipeline(
    settings: &SessionSettings,
    store: MessageStore,
    resumed: bool,
    app_tx: mpsc::UnboundedSender<Message>,
) -> Pipeline {
    let session = ClientSession::new(settings, resumed);
    let clock = session.clock();
    let stages = vec![
        Stage::Session(session),
        Stage::Store(store::StoreStage::new(store.clone())),
        Stage::Auth(auth::Authentication::new(settings)),
        Stage::SeqNum(seqnum::SeqNumManager::new(store, resumed)),
        Stage::Heartbeat(heartbeat::Heartbeat::new(settings, clock)),
    ];
    Pipeline::new(stages, app_tx)
}

pub(crate) async fn run_session<F: TransportFactory>(
    mut factory: F,
    mut request_receiver: mpsc::UnboundedReceiver<Request>,
    app_tx: mpsc::UnboundedSender<Message>,
    store: MessageStore,
    settings: SessionSettings,
) -> Result<(), SessionError> {
    // SETUP

    let has_history =
        store.max_sent_seq_num().await? > 0 || store.max_received_seq_num().await? > 0;
    let resumed = has_history && !settings.reset_seq_nums();
    if has_history && settings.reset_seq_nums() {
        // A counter reset abandons the previous conversation; nothing from
        // it may ever be retransmitted.
        store.purge().await?;
    }

    let mut pipeline = build_pipeline(&settings, store.clone(), resumed, app_tx);
    pipeline.start().await?;

    let mut transport = connect_with_backoff(&mut factory, settings.reconnect()).await?;

    let mut logon_resp = match receive_logon_request(&mut request_receiver).await {
        Some(resp_sender) => Some(resp_sender),
        None => {
            let _ = pipeline.stop().await;
            let _ = store.close().await;
            return Ok(());
        }
    };
    let mut logout_resp: Option<oneshot::Sender<bool>> = None;
    let mut fatal: Option<SessionError> = None;
    let mut handles_gone = false;
    let heartbeat_secs = settings.heartbeat_int().as_secs() as u32;

    if let Err(e) = pipeline.send(admin::logon(heartbeat_secs)).await {
        let _ = pipeline.stop().await;
        return Err(e);
    }

    // LOOP

    let result = loop {
        if let Err(e) = flush_wire(&mut pipeline, &mut transport).await {
            tracing::warn!(error = %e, "transport write failed");
            match reestablish(&mut factory, &settings, &mut pipeline).await {
                Ok(fresh) => {
                    transport = fresh;
                    continue;
                }
                Err(e) => break Err(e),
            }
        }

        for event in pipeline.take_events() {
            match event {
                SessionEvent::LogonAccepted => {
                    if let Some(resp_sender) = logon_resp.take() {
                        let _ = resp_sender.send(true);
                    }
                }
                SessionEvent::LogoutComplete => {
                    if let Some(resp_sender) = logout_resp.take() {
                        let _ = resp_sender.send(true);
                    }
                }
                SessionEvent::Fatal(e) => fatal = Some(e),
            }
        }
        if pipeline.stop_requested() {
            break match fatal.take() {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }

        let deadline = pipeline
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        let step = tokio::select! {
            biased;

            maybe_req = request_receiver.recv(), if !handles_gone => match maybe_req {
                Some(req) => {
                    handle_request(
                        req,
                        &mut pipeline,
                        heartbeat_secs,
                        &mut logon_resp,
                        &mut logout_resp,
                    )
                    .await
                }
                // Every handle is gone; say goodbye on their behalf.
                None => {
                    handles_gone = true;
                    pipeline.send(admin::logout()).await
                }
            },
            maybe_msg = transport.recv() => match maybe_msg {
                Ok(msg) => pipeline.receive(msg).await,
                Err(e) => {
                    tracing::warn!(error = %e, "transport read failed");
                    match reestablish(&mut factory, &settings, &mut pipeline).await {
                        Ok(fresh) => {
                            transport = fresh;
                            continue;
                        }
                        Err(e) => break Err(e),
                    }
                }
            },
            _ = sleep_until(deadline) => {
                pipeline.handle_timeout(Instant::now()).await
            }
        };

        if let Err(e) = step {
            tracing::error!(error = %e, "session error, shutting down");
            let _ = pipeline.send(admin::logout_with_text(&e.to_string())).await;
            let _ = flush_wire(&mut pipeline, &mut transport).await;
            break Err(e);
        }
    };

    // SHUTDOWN

    let _ = flush_wire(&mut pipeline, &mut transport).await;
    let _ = pipeline.stop().await;
    transport.close().await;
    let _ = store.close().await;
    if let Some(resp_sender) = logon_resp.take() {
        let _ = resp_sender.send(false);
    }
    if let Some(resp_sender) = logout_resp.take() {
        let _ = resp_sender.send(result.is_ok());
    }
    result
}

/// Everything that arrives before the application asks for a logon is
/// answered without touching the wire.
async fn receive_logon_request(
    request_receiver: &mut mpsc::UnboundedReceiver<Request>,
) -> Option<oneshot::Sender<bool>> {
    loop {
        match request_receiver.recv().await {
            Some(Request::Logon { resp_sender }) => return Some(resp_sender),
            Some(Request::SendMessage { resp_sender, .. }) => {
                let _ = resp_sender.send(false);
            }
            Some(Request::Logout { resp_sender }) => {
                let _ = resp_sender.send(true);
            }
            Some(Request::Status { .. }) => {}
            None => return None,
        }
    }
}

async fn handle_request(
    req: Request,
    pipeline: &mut Pipeline,
    heartbeat_secs: u32,
    logon_resp: &mut Option<oneshot::Sender<bool>>,
    logout_resp: &mut Option<oneshot::Sender<bool>>,
) -> Result<(), SessionError> {
    match req {
        Request::SendMessage {
            resp_sender,
            message,
        } => {
            let result = pipeline.send(message).await;
            let _ = resp_sender.send(result.is_ok());
            result
        }
        Request::Logout { resp_sender } => {
            *logout_resp = Some(resp_sender);
            pipeline.send(admin::logout()).await
        }
        Request::Logon { resp_sender } => {
            let authenticated = pipeline
                .authentication()
                .map(|a| a.authenticated())
                .unwrap_or(false);
            if authenticated {
                let _ = resp_sender.send(true);
                Ok(())
            } else {
                *logon_resp = Some(resp_sender);
                pipeline.send(admin::logon(heartbeat_secs)).await
            }
        }
        Request::Status { resp_sender } => {
            let _ = resp_sender.send(pipeline.status());
            Ok(())
        }
    }
}

async fn flush_wire<T: Transport>(
    pipeline: &mut Pipeline,
    transport: &mut T,
) -> Result<(), TransportError> {
    while let Some(msg) = pipeline.pop_wire() {
        if let Err(e) = transport.send(&msg).await {
            pipeline.push_wire_front(msg);
            return Err(e);
        }
    }
    Ok(())
}

/// After a transport failure: reconnect with backoff, mark the session
/// resumed, and replay the logon handshake on the new connection.
async fn reestablish<F: TransportFactory>(
    factory: &mut F,
    settings: &SessionSettings,
    pipeline: &mut Pipeline,
) -> Result<F::Transport, SessionError> {
    let transport = connect_with_backoff(factory, settings.reconnect()).await?;
    if let Some(session) = pipeline.client_session_mut() {
        session.set_resumed(true);
    }
    // Anything still unsent is in the store; the logon must lead on the new
    // connection and the peer's resend request recovers the rest.
    pipeline.clear_wire();
    tracing::info!("transport reestablished, replaying logon");
    pipeline
        .send(admin::logon(settings.heartbeat_int().as_secs() as u32))
        .await?;
    Ok(transport)
}
