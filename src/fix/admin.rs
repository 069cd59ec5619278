//! Constructors for the administrative messages the session layer emits.
//!
//! These build bare [`Message`] values; `MsgSeqNum(34)`, the comp ids and
//! `SendingTime(52)` are filled in by the pipeline stages on the way out.

use crate::fix::fields::{MsgType, Tags};
use crate::fix::message::Message;

pub fn logon(heart_bt_int: u32) -> Message {
    Message::new(MsgType::LOGON).with_field(Tags::HeartBtInt, heart_bt_int.to_string())
}

pub fn heartbeat() -> Message {
    Message::new(MsgType::HEARTBEAT)
}

/// A `Heartbeat<0>` answering the `TestRequest<1>` that carried `test_req_id`.
pub fn heartbeat_reply(test_req_id: &str) -> Message {
    Message::new(MsgType::HEARTBEAT).with_field(Tags::TestReqID, test_req_id)
}

pub fn test_request(test_req_id: &str) -> Message {
    Message::new(MsgType::TEST_REQUEST).with_field(Tags::TestReqID, test_req_id)
}

/// `EndSeqNo(16) = 0` means "everything from `begin_seq_no` onwards".
pub fn resend_request(begin_seq_no: u32, end_seq_no: u32) -> Message {
    Message::new(MsgType::RESEND_REQUEST)
        .with_field(Tags::BeginSeqNo, begin_seq_no.to_string())
        .with_field(Tags::EndSeqNo, end_seq_no.to_string())
}

/// A `SequenceReset-GapFill<4>` standing in for the admin messages that
/// occupied `[seq_num, new_seq_no)` and are never retransmitted.
pub fn sequence_reset_gap_fill(seq_num: u32, new_seq_no: u32) -> Message {
    let mut msg = Message::new(MsgType::SEQUENCE_RESET)
        .with_field(Tags::NewSeqNo, new_seq_no.to_string())
        .with_field(Tags::GapFillFlag, "Y");
    msg.set_seq_num(seq_num);
    msg.set_poss_dup(true);
    msg
}

pub fn logout() -> Message {
    Message::new(MsgType::LOGOUT)
}

pub fn logout_with_text(text: &str) -> Message {
    Message::new(MsgType::LOGOUT).with_field(Tags::Text, text)
}

pub fn reject(ref_seq_num: u32, text: &str) -> Message {
    Message::new(MsgType::REJECT)
        .with_field(Tags::RefSeqNum, ref_seq_num.to_string())
        .with_field(Tags::Text, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_fill_carries_the_resend_markers() {
        let msg = sequence_reset_gap_fill(4, 9);
        assert_eq!(msg.msg_type(), Some(MsgType::SEQUENCE_RESET));
        assert_eq!(msg.seq_num(), Some(4));
        assert_eq!(msg.new_seq_no(), Some(9));
        assert!(msg.gap_fill());
        assert!(msg.poss_dup());
    }

    #[test]
    fn resend_request_range_fields() {
        let msg = resend_request(7, 0);
        assert_eq!(msg.begin_seq_no(), Some(7));
        assert_eq!(msg.end_seq_no(), Some(0));
    }

    #[test]
    fn heartbeat_reply_echoes_the_request_id() {
        let msg = heartbeat_reply("probe-12");
        assert_eq!(msg.msg_type(), Some(MsgType::HEARTBEAT));
        assert_eq!(msg.test_req_id(), Some("probe-12"));
    }

    #[test]
    fn plain_heartbeat_has_no_request_id() {
        assert_eq!(heartbeat().test_req_id(), None);
    }
}
