//! Sqlite backend for the [`MessageStore`](crate::fix::store::MessageStore).
//!
//! One database file holds every session; rows are keyed by
//! `(session_id, msg_seq_num)` per direction. Messages are stored in the
//! record layout of [`Message::encode`].

use crate::fix::message::Message;
use crate::fix::store::{StoreError, StoreRequest};
use rusqlite::OpenFlags;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_rusqlite::Connection;

const SQL_ENTER_WAL_MODE: &str = "PRAGMA journal_mode=WAL;";
const SQL_CREATE_SENT_TABLE: &str = "CREATE TABLE IF NOT EXISTS sent_messages (key INTEGER PRIMARY KEY AUTOINCREMENT, session_id VARCHAR, msg_seq_num INT, message BLOB, UNIQUE(session_id, msg_seq_num));";
const SQL_CREATE_RECEIVED_TABLE: &str = "CREATE TABLE IF NOT EXISTS received_messages (key INTEGER PRIMARY KEY AUTOINCREMENT, session_id VARCHAR, msg_seq_num INT, message BLOB, UNIQUE(session_id, msg_seq_num));";
// INSERT OR IGNORE keeps the first write: a replayed message never
// overwrites the original record.
const SQL_INSERT_SENT: &str =
    "INSERT OR IGNORE INTO sent_messages (session_id, msg_seq_num, message) VALUES (?,?,?)";
const SQL_INSERT_RECEIVED: &str =
    "INSERT OR IGNORE INTO received_messages (session_id, msg_seq_num, message) VALUES (?,?,?)";

pub(crate) async fn open(
    path: PathBuf,
    session_id: String,
) -> Result<mpsc::UnboundedSender<StoreRequest>, StoreError> {
    let conn = Connection::open_with_flags(path, OpenFlags::default())
        .await
        .map_err(backend_err)?;
    setup(&conn).await.map_err(backend_err)?;

    let session_id = Arc::new(session_id);
    let (sender, mut receiver) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(req) = receiver.recv().await {
            match req {
                StoreRequest::SetSent(message, tx) => {
                    let _ = tx.send(insert(&conn, SQL_INSERT_SENT, &session_id, message).await);
                }
                StoreRequest::SetReceived(message, tx) => {
                    let _ = tx.send(insert(&conn, SQL_INSERT_RECEIVED, &session_id, message).await);
                }
                StoreRequest::GetSent(lo, hi, tx) => {
                    let _ = tx.send(range(&conn, "sent_messages", &session_id, lo, hi).await);
                }
                StoreRequest::GetReceived(lo, hi, tx) => {
                    let _ = tx.send(range(&conn, "received_messages", &session_id, lo, hi).await);
                }
                StoreRequest::MaxSent(tx) => {
                    let _ = tx.send(max_seq_num(&conn, "sent_messages", &session_id).await);
                }
                StoreRequest::MaxReceived(tx) => {
                    let _ = tx.send(max_seq_num(&conn, "received_messages", &session_id).await);
                }
                StoreRequest::Purge(tx) => {
                    let _ = tx.send(purge(&conn, &session_id).await);
                }
                StoreRequest::Close(tx) => {
                    let _ = tx.send(Ok(()));
                    drop(conn);
                    break;
                }
            }
        }
    });

    Ok(sender)
}

async fn setup(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.call(move |conn| -> rusqlite::Result<()> {
        conn.query_row(SQL_ENTER_WAL_MODE, (), |_| Ok(()))?;
        conn.execute(SQL_CREATE_SENT_TABLE, ())?;
        conn.execute(SQL_CREATE_RECEIVED_TABLE, ())?;
        Ok(())
    })
    .await
}

async fn insert(
    conn: &Connection,
    sql: &'static str,
    session_id: &Arc<String>,
    message: Message,
) -> Result<(), StoreError> {
    let seq_num = message.seq_num().ok_or(StoreError::MissingSeqNum)?;
    let session_id = Arc::clone(session_id);
    conn.call(move |conn| conn.execute(sql, (session_id, seq_num, message.encode())))
        .await
        .map(|_| ())
        .map_err(backend_err)
}

async fn range(
    conn: &Connection,
    table: &'static str,
    session_id: &Arc<String>,
    lo: u32,
    hi: u32,
) -> Result<Vec<Message>, StoreError> {
    let session_id = Arc::clone(session_id);
    let rows: Vec<Vec<u8>> = conn
        .call(move |conn| -> rusqlite::Result<Vec<Vec<u8>>> {
            let mut stmt = conn.prepare(&format!(
                "SELECT message FROM {table} WHERE session_id = ?1 AND msg_seq_num BETWEEN ?2 AND ?3 ORDER BY msg_seq_num ASC;"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![Arc::clone(&session_id), &lo, &hi],
                |row| row.get(0),
            )?;
            rows.collect()
        })
        .await
        .map_err(backend_err)?;
    rows.iter()
        .map(|raw| Message::decode(raw).map_err(|e| StoreError::Backend(e.into())))
        .collect()
}

async fn max_seq_num(
    conn: &Connection,
    table: &'static str,
    session_id: &Arc<String>,
) -> Result<u32, StoreError> {
    let session_id = Arc::clone(session_id);
    conn.call(move |conn| {
        conn.query_row(
            &format!("SELECT COALESCE(MAX(msg_seq_num), 0) FROM {table} WHERE session_id = ?1;"),
            [session_id],
            |row| row.get(0),
        )
    })
    .await
    .map_err(backend_err)
}

async fn purge(conn: &Connection, session_id: &Arc<String>) -> Result<(), StoreError> {
    let session_id = Arc::clone(session_id);
    conn.call(move |conn| -> rusqlite::Result<()> {
        conn.execute(
            "DELETE FROM sent_messages WHERE session_id = ?1;",
            (Arc::clone(&session_id),),
        )?;
        conn.execute(
            "DELETE FROM received_messages WHERE session_id = ?1;",
            (session_id,),
        )?;
        Ok(())
    })
    .await
    .map_err(backend_err)
}

fn backend_err<E>(e: E) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StoreError::Backend(anyhow::Error::new(e))
}

#[cfg(test)]
mod tests {
    use crate::fix::fields::{MsgType, Tags};
    use crate::fix::message::Message;
    use crate::fix::store::MessageStore;

    fn order(seq_num: u32) -> Message {
        let mut msg = Message::new(MsgType::ORDER_SINGLE).with_field(Tags::ClOrdID, "c-1");
        msg.set_seq_num(seq_num);
        msg
    }

    #[tokio::test]
    async fn messages_survive_reopening() {
        let dir = std::env::temp_dir().join(format!("fixpipe-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("store-reopen.db");
        let _ = std::fs::remove_file(&path);

        let store = MessageStore::sqlite(path.clone(), "SND_TGT".into())
            .await
            .unwrap();
        for seq in 1..=3 {
            store.set_sent(order(seq)).await.unwrap();
        }
        store.set_received(order(1)).await.unwrap();
        store.close().await.unwrap();

        let store = MessageStore::sqlite(path, "SND_TGT".into()).await.unwrap();
        assert_eq!(store.max_sent_seq_num().await.unwrap(), 3);
        assert_eq!(store.max_received_seq_num().await.unwrap(), 1);
        let got = store.get_sent(1, 3).await.unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], order(1));
    }

    #[tokio::test]
    async fn sessions_do_not_leak_into_each_other() {
        let dir = std::env::temp_dir().join(format!("fixpipe-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("store-sessions.db");
        let _ = std::fs::remove_file(&path);

        let a = MessageStore::sqlite(path.clone(), "A_B".into()).await.unwrap();
        let b = MessageStore::sqlite(path, "C_D".into()).await.unwrap();
        a.set_sent(order(5)).await.unwrap();

        assert_eq!(a.max_sent_seq_num().await.unwrap(), 5);
        assert_eq!(b.max_sent_seq_num().await.unwrap(), 0);
    }
}
