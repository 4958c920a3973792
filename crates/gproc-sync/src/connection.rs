//! Connection Manager: the single owner of the live transport.
//!
//! ```text
//! Idle --connect--> Connecting --open--> Open --error/close--> Reconnecting
//!                       ^                                          |
//!                       +----------------- timer fires ------------+
//! any --disconnect--> Closed (terminal until the next connect)
//! ```
//!
//! Transport and timer events arrive tagged with the generation or token they
//! were issued for. Anything tagged for a link or timer that is no longer
//! current is ignored, which is what makes teardown and cancellation immediate.

use crate::backoff::{Backoff, BackoffPolicy};
use crate::buffers::{BufferLimits, ChannelBuffers};
use crate::demux::{Demultiplexer, DemuxStats, Dispatch};
use crate::session::{BearerToken, Session};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transport needs to open one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub generation: u64,
    pub token: BearerToken,
}

/// Opens duplex links. Open results and inbound frames come back to the
/// manager as `on_open` / `on_frame` / `on_closed` calls carrying the
/// request's generation.
pub trait Transport {
    type Handle: TransportHandle;

    fn open(&mut self, request: &ConnectRequest) -> Self::Handle;
}

pub trait TransportHandle {
    /// Tears the link down. Must not report a close back for this link.
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// Schedules the reconnect timer. When it fires the runtime calls
/// [`ConnectionManager::on_reconnect_due`] with the same token.
pub trait Scheduler {
    type Timer: TimerHandle;

    fn schedule_reconnect(&mut self, token: TimerToken, delay: Duration) -> Self::Timer;
}

pub trait TimerHandle {
    fn cancel(&mut self);
}

struct Link<H> {
    generation: u64,
    handle: H,
}

struct PendingReconnect<R> {
    token: TimerToken,
    delay: Duration,
    timer: R,
}

enum Phase<H, R> {
    Idle,
    Connecting(Link<H>),
    Open(Link<H>),
    Reconnecting(PendingReconnect<R>),
    Closed,
}

impl<H, R> Phase<H, R> {
    fn state(&self) -> ConnectionState {
        match self {
            Phase::Idle => ConnectionState::Idle,
            Phase::Connecting(_) => ConnectionState::Connecting,
            Phase::Open(_) => ConnectionState::Open,
            Phase::Reconnecting(_) => ConnectionState::Reconnecting,
            Phase::Closed => ConnectionState::Closed,
        }
    }

    fn live_generation(&self) -> Option<u64> {
        match self {
            Phase::Connecting(link) | Phase::Open(link) => Some(link.generation),
            _ => None,
        }
    }
}

pub struct ConnectionManager<T: Transport, S: Scheduler> {
    transport: T,
    scheduler: S,
    backoff: Backoff,
    phase: Phase<T::Handle, S::Timer>,
    token: Option<BearerToken>,
    next_generation: u64,
    next_timer: u64,
    demux: Demultiplexer,
    buffers: ChannelBuffers,
    log_subscriptions: BTreeSet<String>,
}

impl<T: Transport, S: Scheduler> ConnectionManager<T, S> {
    pub fn new(transport: T, scheduler: S, policy: BackoffPolicy, limits: BufferLimits) -> Self {
        Self::with_backoff(transport, scheduler, Backoff::new(policy), limits)
    }

    pub fn with_backoff(
        transport: T,
        scheduler: S,
        backoff: Backoff,
        limits: BufferLimits,
    ) -> Self {
        Self {
            transport,
            scheduler,
            backoff,
            phase: Phase::Idle,
            token: None,
            next_generation: 0,
            next_timer: 0,
            demux: Demultiplexer::default(),
            buffers: ChannelBuffers::new(limits),
            log_subscriptions: BTreeSet::new(),
        }
    }

    pub fn with_demultiplexer(mut self, demux: Demultiplexer) -> Self {
        self.demux = demux;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.phase.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn buffers(&self) -> &ChannelBuffers {
        &self.buffers
    }

    pub fn demux_stats(&self) -> DemuxStats {
        self.demux.stats()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    /// Delay of the outstanding reconnect timer, if one is pending.
    pub fn pending_reconnect(&self) -> Option<(TimerToken, Duration)> {
        match &self.phase {
            Phase::Reconnecting(pending) => Some((pending.token, pending.delay)),
            _ => None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Establishes a link bound to `session`, or keeps the current one.
    ///
    /// Repeated calls with the same credentials while connecting, open, or
    /// waiting to reconnect change nothing. New credentials get a full
    /// teardown first, so nothing buffered for the previous session survives.
    pub fn connect(&mut self, session: &Session) {
        let same_credentials = self.token.as_ref() == Some(session.token());
        match self.phase {
            Phase::Connecting(_) | Phase::Open(_) | Phase::Reconnecting(_) if same_credentials => {
                debug!(event = "ws_connect_noop", state = %self.state());
                return;
            }
            _ => {}
        }
        if self.token.is_some() && !same_credentials {
            self.disconnect();
        } else {
            self.release_phase();
        }
        self.token = Some(session.token().clone());
        self.backoff.reset();
        self.open_link();
    }

    /// Tears everything down. Safe to call in any state, any number of times.
    pub fn disconnect(&mut self) {
        let previous = self.state();
        self.release_phase();
        self.phase = Phase::Closed;
        self.token = None;
        self.backoff.reset();
        self.buffers.clear();
        self.log_subscriptions.clear();
        if previous != ConnectionState::Closed {
            info!(event = "ws_closed", previous = %previous, reason = "disconnect");
        }
    }

    pub fn on_open(&mut self, generation: u64) {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        self.phase = match phase {
            Phase::Connecting(link) if link.generation == generation => {
                self.backoff.reset();
                info!(event = "ws_open", generation);
                Phase::Open(link)
            }
            other => {
                debug!(event = "ws_stale_open", generation);
                other
            }
        };
    }

    /// Feeds one raw text frame from the link identified by `generation`.
    pub fn on_frame(&mut self, generation: u64, raw: &str) -> Dispatch {
        if self.phase.live_generation() != Some(generation) {
            return Dispatch::Dropped;
        }
        self.demux.on_frame(raw, &mut self.buffers)
    }

    /// Transport-level failure or remote close. Never fatal: the manager
    /// moves to `Reconnecting` and schedules the next attempt.
    pub fn on_closed(&mut self, generation: u64, reason: &str) {
        if self.phase.live_generation() != Some(generation) {
            debug!(event = "ws_stale_close", generation, reason);
            return;
        }
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        if let Phase::Connecting(mut link) | Phase::Open(mut link) = phase {
            link.handle.close();
        }
        let delay = self.backoff.next_delay();
        self.next_timer += 1;
        let token = TimerToken(self.next_timer);
        let timer = self.scheduler.schedule_reconnect(token, delay);
        warn!(
            event = "ws_reconnect_scheduled",
            generation,
            reason,
            attempt = self.backoff.attempt(),
            delay_ms = delay.as_millis() as u64
        );
        self.phase = Phase::Reconnecting(PendingReconnect {
            token,
            delay,
            timer,
        });
    }

    pub fn on_reconnect_due(&mut self, token: TimerToken) {
        match &self.phase {
            Phase::Reconnecting(pending) if pending.token == token => {}
            _ => {
                debug!(event = "ws_stale_timer", token = token.0);
                return;
            }
        }
        self.phase = Phase::Idle;
        self.open_link();
    }

    pub fn subscribe_logs(&mut self, process_id: &str) -> bool {
        self.log_subscriptions.insert(process_id.to_string())
    }

    pub fn unsubscribe_logs(&mut self, process_id: &str) -> bool {
        self.buffers.drop_logs(process_id);
        self.log_subscriptions.remove(process_id)
    }

    pub fn log_subscriptions(&self) -> impl Iterator<Item = &str> + '_ {
        self.log_subscriptions.iter().map(String::as_str)
    }

    pub fn acknowledge_alert(&mut self, alert_id: &str) -> usize {
        self.buffers.acknowledge_alert(alert_id)
    }

    fn open_link(&mut self) {
        let Some(token) = self.token.clone() else {
            self.phase = Phase::Idle;
            return;
        };
        self.next_generation += 1;
        let request = ConnectRequest {
            generation: self.next_generation,
            token,
        };
        let handle = self.transport.open(&request);
        info!(event = "ws_connecting", generation = request.generation);
        self.phase = Phase::Connecting(Link {
            generation: request.generation,
            handle,
        });
    }

    /// Closes the live link or cancels the pending timer of the current phase.
    fn release_phase(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connecting(mut link) | Phase::Open(mut link) => link.handle.close(),
            Phase::Reconnecting(mut pending) => pending.timer.cancel(),
            Phase::Idle | Phase::Closed => {}
        }
    }
}

impl<T: Transport, S: Scheduler> Drop for ConnectionManager<T, S> {
    fn drop(&mut self) {
        self.release_phase();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::User;
    use crate::wire::Topic;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct LinkLog {
        opened: Vec<u64>,
        closed: Vec<u64>,
    }

    impl LinkLog {
        fn live(&self) -> usize {
            self.opened.len() - self.closed.len()
        }
    }

    #[derive(Clone, Default)]
    struct FakeTransport {
        log: Rc<RefCell<LinkLog>>,
    }

    struct FakeHandle {
        generation: u64,
        closed: bool,
        log: Rc<RefCell<LinkLog>>,
    }

    impl Transport for FakeTransport {
        type Handle = FakeHandle;

        fn open(&mut self, request: &ConnectRequest) -> FakeHandle {
            assert_eq!(
                self.log.borrow().live(),
                0,
                "opened a link while another was live"
            );
            self.log.borrow_mut().opened.push(request.generation);
            FakeHandle {
                generation: request.generation,
                closed: false,
                log: self.log.clone(),
            }
        }
    }

    impl TransportHandle for FakeHandle {
        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.log.borrow_mut().closed.push(self.generation);
            }
        }
    }

    #[derive(Default)]
    struct TimerLog {
        scheduled: Vec<(TimerToken, Duration)>,
        cancelled: Vec<TimerToken>,
    }

    #[derive(Clone, Default)]
    struct FakeScheduler {
        log: Rc<RefCell<TimerLog>>,
    }

    struct FakeTimer {
        token: TimerToken,
        log: Rc<RefCell<TimerLog>>,
    }

    impl Scheduler for FakeScheduler {
        type Timer = FakeTimer;

        fn schedule_reconnect(&mut self, token: TimerToken, delay: Duration) -> FakeTimer {
            self.log.borrow_mut().scheduled.push((token, delay));
            FakeTimer {
                token,
                log: self.log.clone(),
            }
        }
    }

    impl TimerHandle for FakeTimer {
        fn cancel(&mut self) {
            self.log.borrow_mut().cancelled.push(self.token);
        }
    }

    type Manager = ConnectionManager<FakeTransport, FakeScheduler>;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(800),
            jitter: 0.3,
        }
    }

    fn manager() -> (Manager, FakeTransport, FakeScheduler) {
        let transport = FakeTransport::default();
        let scheduler = FakeScheduler::default();
        let manager = ConnectionManager::with_backoff(
            transport.clone(),
            scheduler.clone(),
            Backoff::seeded(policy(), 11),
            BufferLimits::default(),
        );
        (manager, transport, scheduler)
    }

    fn session(token: &str) -> Session {
        Session::new(
            BearerToken::new(token).expect("token"),
            User {
                id: "u1".to_string(),
                username: "ops".to_string(),
                email: String::new(),
                roles: Default::default(),
                permissions: Default::default(),
                enabled: true,
                mfa_enabled: false,
            },
        )
    }

    const METRICS: &str = r#"{"type":"metrics_update","data":{"cpu":10}}"#;

    #[test]
    fn happy_path_reaches_open() {
        let (mut manager, transport, _) = manager();
        assert_eq!(manager.state(), ConnectionState::Idle);
        manager.connect(&session("abc"));
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(!manager.is_connected());
        manager.on_open(1);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert!(manager.is_connected());
        assert_eq!(transport.log.borrow().opened, vec![1]);
    }

    #[test]
    fn connect_twice_while_open_keeps_one_transport() {
        let (mut manager, transport, _) = manager();
        let session = session("abc");
        manager.connect(&session);
        manager.on_open(1);
        manager.connect(&session);
        manager.connect(&session);
        assert_eq!(manager.state(), ConnectionState::Open);
        let log = transport.log.borrow();
        assert_eq!(log.opened, vec![1]);
        assert_eq!(log.live(), 1);
    }

    #[test]
    fn new_credentials_swap_the_link() {
        let (mut manager, transport, _) = manager();
        manager.connect(&session("abc"));
        manager.on_open(1);
        manager.connect(&session("def"));
        assert_eq!(manager.state(), ConnectionState::Connecting);
        let log = transport.log.borrow();
        assert_eq!(log.opened, vec![1, 2]);
        assert_eq!(log.closed, vec![1]);
        assert_eq!(log.live(), 1);
    }

    #[test]
    fn new_credentials_start_from_empty_buffers() {
        let (mut manager, _, _) = manager();
        manager.connect(&session("alice"));
        manager.on_open(1);
        manager.subscribe_logs("secret-proc");
        manager.on_frame(
            1,
            r#"{"type":"log_stream","data":{"processId":"secret-proc","line":"alice only"}}"#,
        );
        manager.on_frame(1, METRICS);
        assert!(manager.buffers().logs("secret-proc").is_some());

        manager.connect(&session("bob"));
        manager.on_open(2);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert!(manager.buffers().is_empty());
        assert!(manager.buffers().logs("secret-proc").is_none());
        assert_eq!(manager.log_subscriptions().count(), 0);
    }

    #[test]
    fn transport_failure_schedules_one_reconnect() {
        let (mut manager, transport, scheduler) = manager();
        manager.connect(&session("abc"));
        manager.on_open(1);
        manager.on_closed(1, "reset by peer");
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert!(!manager.is_connected());
        assert_eq!(transport.log.borrow().live(), 0);

        let (token, _) = manager.pending_reconnect().expect("pending timer");
        assert_eq!(scheduler.log.borrow().scheduled.len(), 1);

        manager.on_reconnect_due(token);
        assert_eq!(manager.state(), ConnectionState::Connecting);
        manager.on_open(2);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert_eq!(manager.reconnect_attempt(), 0);
    }

    #[test]
    fn repeated_failures_back_off_monotonically_to_cap() {
        let (mut manager, _, scheduler) = manager();
        manager.connect(&session("abc"));
        for generation in 1..=12 {
            manager.on_closed(generation, "refused");
            let (token, _) = manager.pending_reconnect().expect("pending");
            manager.on_reconnect_due(token);
        }
        let delays: Vec<Duration> = scheduler
            .log
            .borrow()
            .scheduled
            .iter()
            .map(|(_, delay)| *delay)
            .collect();
        assert_eq!(delays.len(), 12);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= Duration::from_millis(800)));
        assert_eq!(delays.last(), Some(&Duration::from_millis(800)));
    }

    #[test]
    fn disconnect_while_reconnecting_cancels_the_timer() {
        let (mut manager, transport, scheduler) = manager();
        manager.connect(&session("abc"));
        manager.on_open(1);
        manager.on_closed(1, "timeout");
        let (token, _) = manager.pending_reconnect().expect("pending");

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(scheduler.log.borrow().cancelled, vec![token]);

        // A callback that was already queued must not reopen anything.
        manager.on_reconnect_due(token);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(transport.log.borrow().opened, vec![1]);
    }

    #[test]
    fn disconnect_is_idempotent_and_clears_state() {
        let (mut manager, transport, _) = manager();
        manager.connect(&session("abc"));
        manager.on_open(1);
        manager.subscribe_logs("api");
        manager.on_frame(1, METRICS);
        assert_eq!(manager.buffers().metrics().len(), 1);

        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.buffers().is_empty());
        assert_eq!(manager.log_subscriptions().count(), 0);
        assert_eq!(transport.log.borrow().closed, vec![1]);

        manager.connect(&session("abc"));
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[test]
    fn buffers_survive_reconnects() {
        let (mut manager, _, _) = manager();
        manager.connect(&session("abc"));
        manager.on_open(1);
        assert_eq!(manager.on_frame(1, METRICS), Dispatch::Routed(Topic::MetricsSample));
        manager.on_closed(1, "eof");
        let (token, _) = manager.pending_reconnect().expect("pending");
        manager.on_reconnect_due(token);
        manager.on_open(2);
        assert_eq!(manager.buffers().metrics().to_vec(), vec![json!({"cpu": 10})]);
    }

    #[test]
    fn events_from_stale_links_are_ignored() {
        let (mut manager, _, scheduler) = manager();
        manager.connect(&session("abc"));
        manager.on_open(1);
        manager.connect(&session("def"));

        assert_eq!(manager.on_frame(1, METRICS), Dispatch::Dropped);
        manager.on_closed(1, "old link");
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(scheduler.log.borrow().scheduled.is_empty());

        manager.on_open(1);
        assert_eq!(manager.state(), ConnectionState::Connecting);
        manager.on_open(2);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert!(manager.buffers().is_empty());
    }

    #[test]
    fn malformed_frames_do_not_disturb_the_link() {
        let (mut manager, _, _) = manager();
        manager.connect(&session("abc"));
        manager.on_open(1);
        assert_eq!(manager.on_frame(1, "not json"), Dispatch::Dropped);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert!(manager.buffers().is_empty());
        assert_eq!(manager.demux_stats().dropped, 1);
    }

    #[test]
    fn unsubscribing_drops_buffered_lines() {
        let (mut manager, _, _) = manager();
        manager.connect(&session("abc"));
        manager.on_open(1);
        assert!(manager.subscribe_logs("api"));
        assert!(!manager.subscribe_logs("api"));
        manager.on_frame(
            1,
            r#"{"type":"log_stream","data":{"processId":"api","line":"boot"}}"#,
        );
        assert!(manager.buffers().logs("api").is_some());
        assert!(manager.unsubscribe_logs("api"));
        assert!(manager.buffers().logs("api").is_none());
    }
}
