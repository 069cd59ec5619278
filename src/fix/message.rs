//! The decoded message the pipeline operates on.
//!
//! A [`Message`] is an ordered multimap of `tag -> value` pairs. The session
//! layer only ever manipulates top-level fields; everything else, repeating
//! groups included, rides along in its original order so that a downstream
//! encoder can reproduce the wire layout byte for byte.

use crate::fix::fields::{MsgType, Tags};
use chrono::naive::NaiveDateTime;
use chrono::{DateTime, Utc};
use std::fmt::{Debug, Display, Write};

/// The FIX timestamp format in [chrono format syntax], millisecond precision.
///
/// [chrono format syntax]: https://docs.rs/chrono/latest/chrono/format/strftime/index.html
pub const TIME_FORMAT: &str = "%Y%m%d-%H:%M:%S%.3f";

/// Returns the current UTC time rendered in [`TIME_FORMAT`].
pub fn formatted_time() -> String {
    format!("{}", Utc::now().format(TIME_FORMAT))
}

/// An ordered `tag -> value` multimap.
///
/// Field order is insertion order. [`set_field`] replaces the first
/// occurrence of a tag in place, so rewriting a header field never disturbs
/// the position of the fields around it.
///
/// [`set_field`]: Message::set_field
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: Vec<(u32, Vec<u8>)>,
}

impl Message {
    /// Creates a message of the given type. `MsgType(35)` is always the first
    /// field.
    pub fn new(msg_type: MsgType) -> Message {
        let code: &'static [u8] = msg_type.into();
        Message {
            fields: vec![(Tags::MsgType.into(), code.to_vec())],
        }
    }

    /// Appends `tag=value`, builder style.
    pub fn with_field(mut self, tag: impl Into<u32>, value: impl Into<Vec<u8>>) -> Message {
        self.fields.push((tag.into(), value.into()));
        self
    }

    /// Replaces the first occurrence of `tag` in place, or appends if absent.
    pub fn set_field(&mut self, tag: impl Into<u32>, value: impl Into<Vec<u8>>) {
        let tag = tag.into();
        match self.fields.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, v)) => *v = value.into(),
            None => self.fields.push((tag, value.into())),
        }
    }

    /// Removes every occurrence of `tag`, returning the first removed value.
    pub fn remove_field(&mut self, tag: impl Into<u32>) -> Option<Vec<u8>> {
        let tag = tag.into();
        let first = self
            .fields
            .iter()
            .position(|(t, _)| *t == tag)
            .map(|idx| self.fields.remove(idx).1);
        self.fields.retain(|(t, _)| *t != tag);
        first
    }

    /// The first value stored under `tag`.
    pub fn field(&self, tag: impl Into<u32>) -> Option<&[u8]> {
        let tag = tag.into();
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_slice())
    }

    pub fn field_str(&self, tag: impl Into<u32>) -> Option<&str> {
        self.field(tag).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn field_u32(&self, tag: impl Into<u32>) -> Option<u32> {
        self.field_str(tag).and_then(|s| s.parse().ok())
    }

    /// `true` iff the first value under `tag` is the FIX boolean `Y`.
    pub fn field_bool(&self, tag: impl Into<u32>) -> bool {
        self.field(tag) == Some(b"Y")
    }

    pub fn contains(&self, tag: impl Into<u32>) -> bool {
        self.field(tag).is_some()
    }

    /// All `(tag, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.fields.iter().map(|(t, v)| (*t, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    // Typed accessors for the session-layer header and admin fields.

    pub fn msg_type(&self) -> Option<MsgType> {
        self.field(Tags::MsgType)
            .and_then(|v| MsgType::try_from(v).ok())
    }

    pub fn is_application(&self) -> bool {
        self.msg_type().map(|t| t.is_application()).unwrap_or(false)
    }

    pub fn seq_num(&self) -> Option<u32> {
        self.field_u32(Tags::MsgSeqNum)
    }

    pub fn set_seq_num(&mut self, seq_num: u32) {
        self.set_field(Tags::MsgSeqNum, seq_num.to_string());
    }

    pub fn sender_comp_id(&self) -> Option<&str> {
        self.field_str(Tags::SenderCompID)
    }

    pub fn target_comp_id(&self) -> Option<&str> {
        self.field_str(Tags::TargetCompID)
    }

    pub fn poss_dup(&self) -> bool {
        self.field_bool(Tags::PossDupFlag)
    }

    pub fn set_poss_dup(&mut self, flag: bool) {
        self.set_field(Tags::PossDupFlag, if flag { &b"Y"[..] } else { b"N" });
    }

    pub fn gap_fill(&self) -> bool {
        self.field_bool(Tags::GapFillFlag)
    }

    pub fn sending_time(&self) -> Option<DateTime<Utc>> {
        self.timestamp_field(Tags::SendingTime)
    }

    pub fn set_sending_time(&mut self, time: DateTime<Utc>) {
        self.set_field(Tags::SendingTime, format!("{}", time.format(TIME_FORMAT)));
    }

    pub fn orig_sending_time(&self) -> Option<DateTime<Utc>> {
        self.timestamp_field(Tags::OrigSendingTime)
    }

    pub fn set_orig_sending_time(&mut self, time: DateTime<Utc>) {
        self.set_field(
            Tags::OrigSendingTime,
            format!("{}", time.format(TIME_FORMAT)),
        );
    }

    pub fn heart_bt_int(&self) -> Option<u32> {
        self.field_u32(Tags::HeartBtInt)
    }

    pub fn test_req_id(&self) -> Option<&str> {
        self.field_str(Tags::TestReqID)
    }

    pub fn begin_seq_no(&self) -> Option<u32> {
        self.field_u32(Tags::BeginSeqNo)
    }

    pub fn end_seq_no(&self) -> Option<u32> {
        self.field_u32(Tags::EndSeqNo)
    }

    pub fn new_seq_no(&self) -> Option<u32> {
        self.field_u32(Tags::NewSeqNo)
    }

    pub fn reset_seq_num_flag(&self) -> bool {
        self.field_bool(Tags::ResetSeqNumFlag)
    }

    pub fn test_message_indicator(&self) -> bool {
        self.field_bool(Tags::TestMessageIndicator)
    }

    pub fn encrypt_method(&self) -> Option<u32> {
        self.field_u32(Tags::EncryptMethod)
    }

    fn timestamp_field(&self, tag: Tags) -> Option<DateTime<Utc>> {
        let raw = self.field_str(tag)?;
        NaiveDateTime::parse_from_str(raw, TIME_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Serializes as `tag=value` pairs joined by `SOH`. This is the message
    /// store's record layout, not the validating wire codec: no BeginString
    /// framing, BodyLength or CheckSum are produced here.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.fields.len() * 16);
        for (tag, value) in &self.fields {
            buf.extend_from_slice(tag.to_string().as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(value);
            buf.push(b'\x01');
        }
        buf
    }

    /// Parses the layout produced by [`encode`](Message::encode).
    pub fn decode(buf: &[u8]) -> Result<Message, MessageParseError> {
        let mut fields = Vec::new();
        for raw in buf.split(|b| *b == b'\x01') {
            if raw.is_empty() {
                continue;
            }
            let eq = raw
                .iter()
                .position(|b| *b == b'=')
                .ok_or(MessageParseError::MissingSeparator)?;
            let tag: u32 = std::str::from_utf8(&raw[..eq])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    MessageParseError::BadTag(String::from_utf8_lossy(&raw[..eq]).into_owned())
                })?;
            fields.push((tag, raw[eq + 1..].to_vec()));
        }
        if fields.is_empty() {
            return Err(MessageParseError::Empty);
        }
        Ok(Message { fields })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageParseError {
    #[error("empty message record")]
    Empty,
    #[error("field without a '=' separator")]
    MissingSeparator,
    #[error("tag {0:?} is not a number")]
    BadTag(String),
}

impl Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (tag, value) in &self.fields {
            write!(f, "{}=", tag)?;
            for b in value {
                if *b == 1 {
                    f.write_str("|")?;
                } else {
                    f.write_char(*b as char)?;
                }
            }
            f.write_str("|")?;
        }
        Ok(())
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
