//! Ordering and recovery: gap detection, resend requests, PossDup policing,
//! and the servicing of the counterparty's resend requests.

use crate::fix::admin;
use crate::fix::fields::MsgType;
use crate::fix::message::Message;
use crate::fix::pipeline::{Context, Disposition, HookResult};
use crate::fix::store::MessageStore;
use crate::fix::SessionError;
use chrono::Utc;
use std::collections::BTreeMap;

pub(crate) struct SeqNumManager {
    store: MessageStore,
    resumed: bool,
    send_seq_num: u32,
    receive_seq_num: u32,
    /// Messages received above the expected seq num, parked until the gap
    /// below them is filled.
    pending: BTreeMap<u32, Message>,
    /// At most one ResendRequest is ever in flight.
    resend_outstanding: bool,
}

impl SeqNumManager {
    pub(crate) const NAME: &'static str = "seq_num_manager";

    pub(crate) fn new(store: MessageStore, resumed: bool) -> SeqNumManager {
        SeqNumManager {
            store,
            resumed,
            send_seq_num: 0,
            receive_seq_num: 0,
            pending: BTreeMap::new(),
            resend_outstanding: false,
        }
    }

    /// A resumed session continues from the highest seq nums on record; a
    /// new session starts both counters at zero.
    pub(crate) async fn start(&mut self) -> Result<(), SessionError> {
        if self.resumed {
            self.send_seq_num = self.store.max_sent_seq_num().await?;
            self.receive_seq_num = self.store.max_received_seq_num().await?;
            tracing::info!(
                send_seq_num = self.send_seq_num,
                receive_seq_num = self.receive_seq_num,
                "resuming sequence numbers from store"
            );
        } else {
            self.send_seq_num = 0;
            self.receive_seq_num = 0;
        }
        Ok(())
    }

    pub(crate) fn send_seq_num(&self) -> u32 {
        self.send_seq_num
    }

    pub(crate) fn receive_seq_num(&self) -> u32 {
        self.receive_seq_num
    }

    #[cfg(test)]
    pub(crate) fn set_receive_seq_num(&mut self, seq_num: u32) {
        self.receive_seq_num = seq_num;
    }

    #[cfg(test)]
    pub(crate) fn set_send_seq_num(&mut self, seq_num: u32) {
        self.send_seq_num = seq_num;
    }

    /// Outbound: every first-time message takes the next seq num. The
    /// resend path already carries its original seq num and PossDupFlag.
    pub(crate) fn on_send(&mut self, mut message: Message) -> HookResult {
        if message.poss_dup() {
            return Ok(Disposition::Forward(message));
        }
        self.send_seq_num += 1;
        message.set_seq_num(self.send_seq_num);
        if message.sending_time().is_none() {
            message.set_sending_time(Utc::now());
        }
        Ok(Disposition::Forward(message))
    }

    pub(crate) async fn on_receive(&mut self, message: Message, ctx: &mut Context) -> HookResult {
        let seq_num = message.seq_num().ok_or(SessionError::MissingField {
            tag: crate::fix::fields::Tags::MsgSeqNum.into(),
        })?;

        if message.poss_dup() {
            self.check_sending_times(&message)?;
        }

        if message.msg_type() == Some(MsgType::SEQUENCE_RESET) {
            return self.on_sequence_reset(message, ctx);
        }

        let expected = self.receive_seq_num + 1;
        if seq_num == expected {
            // In order; a PossDup here is the gap being filled.
            self.receive_seq_num = seq_num;
            self.release_contiguous(ctx);
            if message.msg_type() == Some(MsgType::RESEND_REQUEST) {
                self.on_resend_request(&message, ctx).await?;
            }
            Ok(Disposition::Forward(message))
        } else if seq_num > expected {
            tracing::warn!(
                expected,
                received = seq_num,
                "sequence gap detected, buffering message"
            );
            self.pending.insert(seq_num, message);
            if !self.resend_outstanding {
                self.resend_outstanding = true;
                ctx.queue_send(admin::resend_request(expected, 0));
            }
            Ok(Disposition::Consumed)
        } else {
            self.check_poss_dup(&message)?;
            // A legitimate retransmission below the window. Forwarded with
            // the flag preserved; deduplication is the application's call.
            Ok(Disposition::Forward(message))
        }
    }

    /// A message below the expected seq num is only legal as a retransmission.
    fn check_poss_dup(&self, message: &Message) -> Result<(), SessionError> {
        if !message.poss_dup() {
            return Err(SessionError::SequenceTooLow {
                expected: self.receive_seq_num + 1,
                received: message.seq_num().unwrap_or(0),
            });
        }
        Ok(())
    }

    fn check_sending_times(&self, message: &Message) -> Result<(), SessionError> {
        if let (Some(orig), Some(sending)) = (message.orig_sending_time(), message.sending_time())
        {
            if orig > sending {
                return Err(SessionError::OrigSendingTimeAhead { orig, sending });
            }
        }
        Ok(())
    }

    fn on_sequence_reset(&mut self, message: Message, ctx: &mut Context) -> HookResult {
        let new_seq_no = message.new_seq_no().ok_or(SessionError::MissingField {
            tag: crate::fix::fields::Tags::NewSeqNo.into(),
        })?;
        let expected = self.receive_seq_num + 1;

        if message.gap_fill() {
            let seq_num = message.seq_num().unwrap_or(expected);
            if seq_num > expected {
                // A fill for a gap we have not reached yet.
                self.pending.insert(seq_num, message);
                if !self.resend_outstanding {
                    self.resend_outstanding = true;
                    ctx.queue_send(admin::resend_request(expected, 0));
                }
                return Ok(Disposition::Consumed);
            }
            if seq_num < expected {
                self.check_poss_dup(&message)?;
                return Ok(Disposition::Consumed);
            }
        }

        if new_seq_no <= self.receive_seq_num {
            // Not worth dropping the session over; tell the counterparty
            // the value is wrong and keep the counter where it is.
            tracing::warn!(
                new_seq_no,
                current = self.receive_seq_num,
                "sequence reset moves expected seq num backwards, rejecting"
            );
            let ref_seq_num = message.seq_num().unwrap_or(self.receive_seq_num);
            ctx.queue_send(admin::reject(
                ref_seq_num,
                "NewSeqNo(36) may not decrease the expected sequence number",
            ));
            return Ok(Disposition::Consumed);
        }

        tracing::info!(new_seq_no, "sequence reset, advancing expected seq num");
        self.receive_seq_num = new_seq_no - 1;
        // Buffered messages the reset skipped over are obsolete.
        self.pending = self.pending.split_off(&new_seq_no);
        self.release_contiguous(ctx);
        Ok(Disposition::Consumed)
    }

    /// Hands the next contiguous buffered message back to the pipeline for
    /// a fresh transport-side traversal. Its arrival loops back here, so
    /// the whole run drains one hop at a time, in order.
    fn release_contiguous(&mut self, ctx: &mut Context) {
        if let Some(msg) = self.pending.remove(&(self.receive_seq_num + 1)) {
            ctx.queue_receive(msg);
        }
        if self.pending.is_empty() {
            self.resend_outstanding = false;
        }
    }

    /// Services the counterparty's ResendRequest from the store: admin
    /// messages collapse into gap fills, application messages go out again
    /// under their original seq nums.
    async fn on_resend_request(
        &mut self,
        message: &Message,
        ctx: &mut Context,
    ) -> Result<(), SessionError> {
        let begin = message.begin_seq_no().ok_or(SessionError::MissingField {
            tag: crate::fix::fields::Tags::BeginSeqNo.into(),
        })?;
        if begin > self.send_seq_num {
            return Err(SessionError::ResendOutOfRange {
                begin,
                latest: self.send_seq_num,
            });
        }
        let end = message.end_seq_no().unwrap_or(0);
        let hi = if end == 0 {
            self.send_seq_num
        } else {
            end.min(self.send_seq_num)
        };
        tracing::info!(begin, through = hi, "servicing resend request");

        let mut admin_run: Option<(u32, u32)> = None;
        for original in self.store.get_sent(begin, hi).await? {
            let seq_num = original.seq_num().ok_or(SessionError::MissingField {
                tag: crate::fix::fields::Tags::MsgSeqNum.into(),
            })?;
            let is_admin = original
                .msg_type()
                .map(|t| t.is_session())
                .unwrap_or(false);

            if is_admin {
                admin_run = Some(match admin_run {
                    None => (seq_num, seq_num),
                    Some((first, _)) => (first, seq_num),
                });
                continue;
            }

            if let Some((first, last)) = admin_run.take() {
                ctx.queue_send(admin::sequence_reset_gap_fill(first, last + 1));
            }

            let mut dup = original.clone();
            if let Some(orig_time) = original.sending_time() {
                dup.set_orig_sending_time(orig_time);
            }
            dup.set_sending_time(Utc::now());
            dup.set_poss_dup(true);
            ctx.queue_send(dup);
        }
        if let Some((first, last)) = admin_run.take() {
            ctx.queue_send(admin::sequence_reset_gap_fill(first, last + 1));
        }
        Ok(())
    }
}
