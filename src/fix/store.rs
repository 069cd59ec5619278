//! Durable record of every message sent and received, keyed by direction and
//! `MsgSeqNum(34)`.
//!
//! [`MessageStore`] is a cheap handle over a channel to a backend task, so
//! stages on the single-threaded pipeline never block on storage directly.
//! The in-memory backend lives here; the sqlite backend is behind the
//! `sqlite` feature.

use crate::fix::message::Message;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message store task is gone")]
    Closed,
    #[error("message is missing MsgSeqNum(34)")]
    MissingSeqNum,
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub(crate) enum StoreRequest {
    SetSent(Message, oneshot::Sender<Result<(), StoreError>>),
    SetReceived(Message, oneshot::Sender<Result<(), StoreError>>),
    GetSent(u32, u32, oneshot::Sender<Result<Vec<Message>, StoreError>>),
    GetReceived(u32, u32, oneshot::Sender<Result<Vec<Message>, StoreError>>),
    MaxSent(oneshot::Sender<Result<u32, StoreError>>),
    MaxReceived(oneshot::Sender<Result<u32, StoreError>>),
    Purge(oneshot::Sender<Result<(), StoreError>>),
    Close(oneshot::Sender<Result<(), StoreError>>),
}

/// Handle to the message store backend.
///
/// Writes are acknowledged only after the backend has made them durable;
/// the pipeline will not forward a message whose write failed.
#[derive(Clone)]
pub struct MessageStore {
    sender: mpsc::UnboundedSender<StoreRequest>,
}

impl MessageStore {
    /// An in-memory store. State dies with the process, so sessions backed
    /// by it never resume.
    pub fn memory() -> MessageStore {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_memory_backend(receiver));
        MessageStore { sender }
    }

    /// A sqlite-backed store at `path`, scoped to `session_id`.
    #[cfg(feature = "sqlite")]
    pub async fn sqlite(
        path: std::path::PathBuf,
        session_id: String,
    ) -> Result<MessageStore, StoreError> {
        let sender = crate::fix::sqlite_store::open(path, session_id).await?;
        Ok(MessageStore { sender })
    }

    pub async fn set_sent(&self, message: Message) -> Result<(), StoreError> {
        self.request(|tx| StoreRequest::SetSent(message, tx)).await
    }

    pub async fn set_received(&self, message: Message) -> Result<(), StoreError> {
        self.request(|tx| StoreRequest::SetReceived(message, tx))
            .await
    }

    /// Sent messages with `lo <= seq_num <= hi`, ascending.
    pub async fn get_sent(&self, lo: u32, hi: u32) -> Result<Vec<Message>, StoreError> {
        self.request(|tx| StoreRequest::GetSent(lo, hi, tx)).await
    }

    /// Received messages with `lo <= seq_num <= hi`, ascending.
    pub async fn get_received(&self, lo: u32, hi: u32) -> Result<Vec<Message>, StoreError> {
        self.request(|tx| StoreRequest::GetReceived(lo, hi, tx))
            .await
    }

    /// Highest sent seq_num on record, 0 when nothing was ever sent.
    pub async fn max_sent_seq_num(&self) -> Result<u32, StoreError> {
        self.request(StoreRequest::MaxSent).await
    }

    /// Highest received seq_num on record, 0 when nothing was ever received.
    pub async fn max_received_seq_num(&self) -> Result<u32, StoreError> {
        self.request(StoreRequest::MaxReceived).await
    }

    /// Drops every message of the session. Used when a logon resets the
    /// sequence numbers and on explicit retention cleanup.
    pub async fn purge(&self) -> Result<(), StoreError> {
        self.request(StoreRequest::Purge).await
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.request(StoreRequest::Close).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, StoreError>>) -> StoreRequest,
    ) -> Result<T, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(make(tx)).map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }
}

/// Stage 2: archives every message crossing the transport edge, in both
/// directions. A failed write is a session error; the message is not
/// forwarded past this stage until the store has acknowledged it.
pub(crate) struct StoreStage {
    store: MessageStore,
}

impl StoreStage {
    pub(crate) const NAME: &'static str = "message_store";

    pub(crate) fn new(store: MessageStore) -> StoreStage {
        StoreStage { store }
    }

    pub(crate) async fn on_send(&mut self, message: Message) -> crate::fix::pipeline::HookResult {
        self.store.set_sent(message.clone()).await?;
        Ok(crate::fix::pipeline::Disposition::Forward(message))
    }

    pub(crate) async fn on_receive(
        &mut self,
        message: Message,
    ) -> crate::fix::pipeline::HookResult {
        self.store.set_received(message.clone()).await?;
        Ok(crate::fix::pipeline::Disposition::Forward(message))
    }
}

struct MemoryDb {
    sent: BTreeMap<u32, Message>,
    received: BTreeMap<u32, Message>,
}

impl MemoryDb {
    // Entries are immutable once written: a PossDup replay must not
    // overwrite the original record.
    fn insert(map: &mut BTreeMap<u32, Message>, message: Message) -> Result<(), StoreError> {
        let seq_num = message.seq_num().ok_or(StoreError::MissingSeqNum)?;
        map.entry(seq_num).or_insert(message);
        Ok(())
    }

    fn range(map: &BTreeMap<u32, Message>, lo: u32, hi: u32) -> Vec<Message> {
        map.range(lo..=hi).map(|(_, m)| m.clone()).collect()
    }

    fn max(map: &BTreeMap<u32, Message>) -> u32 {
        map.keys().next_back().copied().unwrap_or(0)
    }
}

async fn run_memory_backend(mut receiver: mpsc::UnboundedReceiver<StoreRequest>) {
    let mut db = MemoryDb {
        sent: BTreeMap::new(),
        received: BTreeMap::new(),
    };
    while let Some(req) = receiver.recv().await {
        match req {
            StoreRequest::SetSent(message, tx) => {
                let _ = tx.send(MemoryDb::insert(&mut db.sent, message));
            }
            StoreRequest::SetReceived(message, tx) => {
                let _ = tx.send(MemoryDb::insert(&mut db.received, message));
            }
            StoreRequest::GetSent(lo, hi, tx) => {
                let _ = tx.send(Ok(MemoryDb::range(&db.sent, lo, hi)));
            }
            StoreRequest::GetReceived(lo, hi, tx) => {
                let _ = tx.send(Ok(MemoryDb::range(&db.received, lo, hi)));
            }
            StoreRequest::MaxSent(tx) => {
                let _ = tx.send(Ok(MemoryDb::max(&db.sent)));
            }
            StoreRequest::MaxReceived(tx) => {
                let _ = tx.send(Ok(MemoryDb::max(&db.received)));
            }
            StoreRequest::Purge(tx) => {
                db.sent.clear();
                db.received.clear();
                let _ = tx.send(Ok(()));
            }
            StoreRequest::Close(tx) => {
                let _ = tx.send(Ok(()));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::admin;
    use crate::fix::fields::{MsgType, Tags};

    fn app_message(seq_num: u32) -> Message {
        let mut msg = Message::new(MsgType::NEWS).with_field(Tags::Text, "headline");
        msg.set_seq_num(seq_num);
        msg
    }

    #[tokio::test]
    async fn range_queries_come_back_ascending() {
        let store = MessageStore::memory();
        for seq in [3u32, 1, 5, 2, 4] {
            store.set_sent(app_message(seq)).await.unwrap();
        }

        let got = store.get_sent(2, 4).await.unwrap();
        let seqs: Vec<u32> = got.iter().map(|m| m.seq_num().unwrap()).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn directions_are_independent() {
        let store = MessageStore::memory();
        store.set_sent(app_message(1)).await.unwrap();
        store.set_received(app_message(7)).await.unwrap();

        assert_eq!(store.max_sent_seq_num().await.unwrap(), 1);
        assert_eq!(store.max_received_seq_num().await.unwrap(), 7);
        assert!(store.get_sent(2, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_write_wins() {
        let store = MessageStore::memory();
        store.set_sent(app_message(4)).await.unwrap();

        let mut replay = admin::heartbeat();
        replay.set_seq_num(4);
        store.set_sent(replay).await.unwrap();

        let got = store.get_sent(4, 4).await.unwrap();
        assert_eq!(got[0].msg_type(), Some(MsgType::NEWS));
    }

    #[tokio::test]
    async fn missing_seq_num_is_rejected() {
        let store = MessageStore::memory();
        let err = store.set_sent(admin::heartbeat()).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingSeqNum));
    }

    #[tokio::test]
    async fn purge_empties_both_directions() {
        let store = MessageStore::memory();
        store.set_sent(app_message(1)).await.unwrap();
        store.set_received(app_message(1)).await.unwrap();
        store.purge().await.unwrap();

        assert_eq!(store.max_sent_seq_num().await.unwrap(), 0);
        assert_eq!(store.max_received_seq_num().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_stops_the_backend() {
        let store = MessageStore::memory();
        store.close().await.unwrap();
        assert!(matches!(
            store.set_sent(app_message(1)).await,
            Err(StoreError::Closed)
        ));
    }
}
