//! The logon handshake: parameter negotiation on the way out, response
//! validation on the way back.

use crate::fix::fields::{MsgType, Tags};
use crate::fix::message::Message;
use crate::fix::pipeline::{Context, Disposition, HookResult, SessionEvent};
use crate::fix::SessionError;
use crate::SessionSettings;

pub(crate) struct Authentication {
    proposed_heart_bt_int: u32,
    reset_requested: bool,
    local_test_mode: bool,
    test_mode: bool,
    authenticated: bool,
}

impl Authentication {
    pub(crate) const NAME: &'static str = "authentication";

    pub(crate) fn new(settings: &SessionSettings) -> Authentication {
        Authentication {
            proposed_heart_bt_int: settings.heartbeat_int().as_secs() as u32,
            reset_requested: settings.reset_seq_nums(),
            local_test_mode: settings.test_mode(),
            test_mode: false,
            authenticated: false,
        }
    }

    /// Whether the counterparty confirmed `TestMessageIndicator(464)`.
    pub(crate) fn test_mode(&self) -> bool {
        self.test_mode
    }

    pub(crate) fn authenticated(&self) -> bool {
        self.authenticated
    }

    pub(crate) fn on_send(&mut self, mut message: Message) -> HookResult {
        if message.msg_type() == Some(MsgType::LOGON) {
            message.set_field(Tags::EncryptMethod, "0");
            message.set_field(Tags::HeartBtInt, self.proposed_heart_bt_int.to_string());
            if self.reset_requested {
                message.set_field(Tags::ResetSeqNumFlag, "Y");
            }
            if self.local_test_mode {
                message.set_field(Tags::TestMessageIndicator, "Y");
            }
        }
        Ok(Disposition::Forward(message))
    }

    pub(crate) fn on_receive(&mut self, message: Message, ctx: &mut Context) -> HookResult {
        match message.msg_type() {
            Some(MsgType::LOGON) => self.on_logon(message, ctx),
            _ => Ok(Disposition::Forward(message)),
        }
    }

    /// The counterparty's Logon must mirror what we proposed.
    fn on_logon(&mut self, message: Message, ctx: &mut Context) -> HookResult {
        let heart_bt_int = message.heart_bt_int();
        if heart_bt_int != Some(self.proposed_heart_bt_int) {
            return Err(SessionError::LogonMismatch {
                field: "HeartBtInt",
                sent: self.proposed_heart_bt_int.to_string(),
                received: heart_bt_int.map_or("absent".to_string(), |v| v.to_string()),
            });
        }

        let indicator = message.test_message_indicator();
        if indicator != self.local_test_mode {
            return Err(SessionError::LogonMismatch {
                field: "TestMessageIndicator",
                sent: self.local_test_mode.to_string(),
                received: indicator.to_string(),
            });
        }

        let reset_flag = message.reset_seq_num_flag();
        if reset_flag != self.reset_requested {
            return Err(SessionError::LogonMismatch {
                field: "ResetSeqNumFlag",
                sent: self.reset_requested.to_string(),
                received: reset_flag.to_string(),
            });
        }

        self.test_mode = indicator;
        self.authenticated = true;
        tracing::info!(
            heart_bt_int = self.proposed_heart_bt_int,
            test_mode = self.test_mode,
            "logon accepted"
        );
        ctx.raise(SessionEvent::LogonAccepted);
        Ok(Disposition::Forward(message))
    }
}
