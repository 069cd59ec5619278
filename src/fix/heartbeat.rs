//! Liveness: unsolicited heartbeats on outbound silence, test-request
//! escalation on inbound silence.

use crate::fix::admin;
use crate::fix::fields::MsgType;
use crate::fix::message::Message;
use crate::fix::pipeline::{Context, Disposition, HookResult, SessionEvent};
use crate::fix::session::LivenessClock;
use crate::fix::SessionError;
use crate::SessionSettings;
use std::time::Duration;
use tokio::time::Instant;

// Floor for rescheduling so a zero interval cannot spin the event loop.
const MIN_TICK: Duration = Duration::from_millis(100);

pub(crate) struct Heartbeat {
    interval: Duration,
    max_lost: u32,
    clock: LivenessClock,
    test_request_id: Option<String>,
    attempts: u32,
    server_not_responding: bool,
    ping_deadline: Instant,
    probe_deadline: Instant,
    test_req_counter: u64,
}

impl Heartbeat {
    pub(crate) const NAME: &'static str = "heartbeat";

    pub(crate) fn new(settings: &SessionSettings, clock: LivenessClock) -> Heartbeat {
        let interval = settings.heartbeat_int();
        let now = Instant::now();
        let tick = interval.max(MIN_TICK);
        Heartbeat {
            interval,
            max_lost: settings.max_lost_heartbeats(),
            clock,
            test_request_id: None,
            attempts: 0,
            server_not_responding: false,
            ping_deadline: now + tick,
            probe_deadline: now + tick,
            test_req_counter: 0,
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    pub(crate) fn server_not_responding(&self) -> bool {
        self.server_not_responding
    }

    #[cfg(test)]
    pub(crate) fn test_request_id(&self) -> Option<&str> {
        self.test_request_id.as_deref()
    }

    fn tick(&self) -> Duration {
        self.interval.max(MIN_TICK)
    }

    pub(crate) fn on_send(&mut self, message: Message) -> HookResult {
        self.ping_deadline = Instant::now() + self.tick();
        Ok(Disposition::Forward(message))
    }

    pub(crate) fn on_receive(&mut self, message: Message, ctx: &mut Context) -> HookResult {
        match message.msg_type() {
            Some(MsgType::TEST_REQUEST) => self.on_test_request(message, ctx),
            Some(MsgType::HEARTBEAT) => self.on_heartbeat(message),
            Some(MsgType::LOGON) => self.on_logon(message),
            _ => Ok(Disposition::Forward(message)),
        }
    }

    /// Every TestRequest gets a Heartbeat echoing its id.
    fn on_test_request(&mut self, message: Message, ctx: &mut Context) -> HookResult {
        if let Some(id) = message.test_req_id() {
            ctx.queue_send(admin::heartbeat_reply(id));
        }
        Ok(Disposition::Forward(message))
    }

    /// A Heartbeat answering our outstanding TestRequest ends the
    /// escalation. One without an id is just the peer's rhythm.
    fn on_heartbeat(&mut self, message: Message) -> HookResult {
        if self.test_request_id.is_some()
            && message.test_req_id() == self.test_request_id.as_deref()
        {
            self.test_request_id = None;
            self.attempts = 0;
            self.probe_deadline = Instant::now() + self.tick();
        }
        Ok(Disposition::Forward(message))
    }

    /// The negotiated HeartBtInt governs both directions.
    fn on_logon(&mut self, message: Message) -> HookResult {
        if let Some(secs) = message.heart_bt_int() {
            self.interval = Duration::from_secs(secs.into());
            let now = Instant::now();
            self.ping_deadline = now + self.tick();
            self.probe_deadline = now + self.tick();
        }
        Ok(Disposition::Forward(message))
    }

    pub(crate) fn next_deadline(&self) -> Instant {
        self.ping_deadline.min(self.probe_deadline)
    }

    /// The monitor body, run from the engine loop whenever a deadline
    /// passes. Inbound freshness comes from the client session's clock, so
    /// messages the sequence manager buffered still count as traffic.
    pub(crate) fn handle_timeout(&mut self, now: Instant, ctx: &mut Context) {
        if self.server_not_responding {
            return;
        }

        if now >= self.probe_deadline {
            let fresh = self.clock.since_last_receive() <= self.interval;
            if self.test_request_id.is_none() && fresh {
                // rhythm is healthy
            } else if self.attempts >= self.max_lost {
                self.server_not_responding = true;
                tracing::error!(
                    attempts = self.attempts,
                    "test requests went unanswered, declaring counterparty dead"
                );
                ctx.queue_send(admin::logout_with_text("test request timeout"));
                ctx.raise(SessionEvent::Fatal(SessionError::TestRequestTimeout {
                    attempts: self.attempts,
                }));
                ctx.request_stop();
                return;
            } else {
                let id = self.fresh_test_req_id();
                tracing::warn!(
                    attempt = self.attempts + 1,
                    test_req_id = %id,
                    "no inbound traffic, sending test request"
                );
                ctx.queue_send(admin::test_request(&id));
                self.test_request_id = Some(id);
                self.attempts += 1;
            }
            self.probe_deadline = now + self.tick();
        }

        if now >= self.ping_deadline {
            // A test request in flight is already outbound traffic.
            if self.test_request_id.is_none() && self.clock.since_last_send() >= self.interval {
                ctx.queue_send(admin::heartbeat());
            }
            self.ping_deadline = now + self.tick();
        }
    }

    fn fresh_test_req_id(&mut self) -> String {
        self.test_req_counter += 1;
        format!("TEST-{}", self.test_req_counter)
    }
}
