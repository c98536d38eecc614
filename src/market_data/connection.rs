// =============================================================================
// ConnectionManager — one live tick stream per subscription
// =============================================================================
//
// Each open() spawns a background task that owns the connection lifecycle:
//
//   Disconnected → Connecting → Connected → Reconnecting → Connecting → …
//                                        ↘ Disconnected (terminal close)
//                              Reconnecting, budget spent → GivenUp
//
// The retry counter lives inside the task, so it is scoped to one
// subscription's connection and starts at zero on every open. The reconnect
// delay is a select! against the handle's command channel, so close() and
// subscription changes cancel it before it fires. A handle closed mid-delay
// can never install a stale connection afterwards.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::market_data::transport::{build_stream_url, LinkEvent, TickTransport, TransportLink};
use crate::types::{ConnectionState, Subscription, Tick};

/// Sink receiving decoded ticks. Exactly one is active per handle.
pub type TickSink = Box<dyn Fn(Tick) + Send + Sync + 'static>;

/// Reconnection behavior, injected from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Reconnect attempts allowed before giving up.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Close-code classification
// ---------------------------------------------------------------------------

/// Whether a close warrants reconnection.
///
/// A normal closure (1000) is the peer explicitly ending the stream, and an
/// unsupported-data closure (1003) will fail the same way on every retry;
/// both are terminal. Everything else — protocol errors, abnormal closure,
/// internal errors, service restarts, temporary trouble, missing close
/// frames — is transient and worth retrying.
fn is_recoverable_close(code: Option<u16>) -> bool {
    !matches!(code, Some(1000) | Some(1003))
}

// ---------------------------------------------------------------------------
// Wire decoding
// ---------------------------------------------------------------------------

/// Inbound stream message shape: `{ "close": float, "timestamp": integer-ms }`.
#[derive(Debug, Deserialize)]
struct WireTick {
    close: f64,
    timestamp: i64,
}

/// Decode one stream message into a tick. Anything else is a decode failure
/// and the message is dropped by the caller; the stream itself continues.
fn decode_tick(text: &str) -> Result<Tick> {
    let wire: WireTick = serde_json::from_str(text).context("malformed tick payload")?;
    if !wire.close.is_finite() {
        bail!("tick price is not finite: {}", wire.close);
    }
    if wire.timestamp < 0 {
        bail!("tick timestamp is negative: {}", wire.timestamp);
    }
    Ok(Tick {
        timestamp_ms: wire.timestamp,
        price: wire.close,
    })
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

enum Command {
    Close,
}

/// Opens connection handles against a stream endpoint. Holds no per-stream
/// state itself; every handle owns its own machine.
pub struct ConnectionManager {
    endpoint: String,
    policy: ReconnectPolicy,
    transport: Arc<dyn TickTransport>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: impl Into<String>,
        policy: ReconnectPolicy,
        transport: Arc<dyn TickTransport>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            policy,
            transport,
        }
    }

    /// Start the state machine for one subscription.
    ///
    /// Fails only on a malformed subscription; connection establishment
    /// itself is asynchronous and reported through the handle's state.
    pub fn open(&self, subscription: &Subscription) -> Result<ConnectionHandle> {
        subscription.validate()?;

        let id = Uuid::new_v4();
        let url = build_stream_url(&self.endpoint, subscription);
        // The machine leaves Disconnected the moment open() succeeds.
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let sink: Arc<RwLock<Option<TickSink>>> = Arc::new(RwLock::new(None));
        let closed = Arc::new(AtomicBool::new(false));
        let decode_errors = Arc::new(AtomicU64::new(0));
        let (cmd_tx, cmd_rx) = mpsc::channel(4);

        let ctx = ConnectionCtx {
            id,
            subscription: subscription.clone(),
            url,
            policy: self.policy,
            transport: self.transport.clone(),
            state: state.clone(),
            sink: sink.clone(),
            closed: closed.clone(),
            decode_errors: decode_errors.clone(),
            cmd_rx,
        };
        let task = tokio::spawn(run_connection(ctx));

        info!(handle = %id, subscription = %subscription, "tick stream handle opened");

        Ok(ConnectionHandle {
            id,
            subscription: subscription.clone(),
            state,
            sink,
            closed,
            decode_errors,
            cmd_tx,
            task: Some(task),
        })
    }
}

// ---------------------------------------------------------------------------
// ConnectionHandle
// ---------------------------------------------------------------------------

/// Caller-side handle for one subscription's connection.
pub struct ConnectionHandle {
    id: Uuid,
    subscription: Subscription,
    state: Arc<RwLock<ConnectionState>>,
    sink: Arc<RwLock<Option<TickSink>>>,
    closed: Arc<AtomicBool>,
    decode_errors: Arc<AtomicU64>,
    cmd_tx: mpsc::Sender<Command>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Malformed messages dropped on this handle.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Register the sink that receives decoded ticks, replacing any previous
    /// registration. The dispatch path reads the current registration on
    /// every message, so the sink survives reconnects unchanged.
    pub fn set_tick_sink(&self, sink: impl Fn(Tick) + Send + Sync + 'static) {
        *self.sink.write() = Some(Box::new(sink));
    }

    /// Tear the connection down. Terminal: cancels any pending reconnect,
    /// releases the transport, and leaves the state at Disconnected. Safe to
    /// call from any state, any number of times.
    ///
    /// The sink is unregistered under the same lock the dispatch path reads
    /// it through, so once close() returns no further tick can reach the
    /// sink — even from messages already queued on the old link.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.sink.write() = None;
        *self.state.write() = ConnectionState::Disconnected;
        let _ = self.cmd_tx.try_send(Command::Close);
        info!(handle = %self.id, subscription = %self.subscription, "tick stream handle closed");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            // Dropping the task also drops its TransportLink, whose pump
            // sends the close frame.
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Background connection task
// ---------------------------------------------------------------------------

enum SessionEnd {
    /// close() or handle drop.
    ClosedByCaller,
    /// Terminal close code; no retry.
    Terminal { code: Option<u16> },
    /// Transient failure; retry within budget.
    Recoverable { reason: String },
}

struct ConnectionCtx {
    id: Uuid,
    subscription: Subscription,
    url: String,
    policy: ReconnectPolicy,
    transport: Arc<dyn TickTransport>,
    state: Arc<RwLock<ConnectionState>>,
    sink: Arc<RwLock<Option<TickSink>>>,
    closed: Arc<AtomicBool>,
    decode_errors: Arc<AtomicU64>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl ConnectionCtx {
    /// State writes are suppressed once the handle is closed, so a teardown
    /// racing the task can never be overwritten by a stale transition.
    fn set_state(&self, next: ConnectionState) {
        if self.closed.load(Ordering::SeqCst) && next != ConnectionState::Disconnected {
            return;
        }
        *self.state.write() = next;
    }

    /// Decode and forward one message. The current sink registration is read
    /// per message; nothing is captured across reconnects.
    fn dispatch(&self, text: &str) {
        match decode_tick(text) {
            Ok(tick) => {
                if let Some(sink) = self.sink.read().as_ref() {
                    sink(tick);
                }
            }
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(handle = %self.id, error = %e, "dropping malformed stream message");
            }
        }
    }

    /// Pump one connected session until it ends.
    async fn run_connected(&mut self, mut link: TransportLink) -> SessionEnd {
        loop {
            tokio::select! {
                event = link.next() => match event {
                    Some(LinkEvent::Message(text)) => self.dispatch(&text),
                    Some(LinkEvent::Closed { code, reason }) => {
                        if is_recoverable_close(code) {
                            return SessionEnd::Recoverable {
                                reason: format!("closed (code {code:?}): {reason}"),
                            };
                        }
                        return SessionEnd::Terminal { code };
                    }
                    Some(LinkEvent::Failed(err)) => {
                        return SessionEnd::Recoverable { reason: err };
                    }
                    None => {
                        return SessionEnd::Recoverable {
                            reason: "transport link ended".to_string(),
                        };
                    }
                },
                _ = self.cmd_rx.recv() => {
                    link.close();
                    return SessionEnd::ClosedByCaller;
                }
            }
        }
    }
}

async fn run_connection(mut ctx: ConnectionCtx) {
    // Reconnect attempts for this subscription's connection. Never shared;
    // a new subscription always starts from zero.
    let mut attempts: u32 = 0;

    loop {
        ctx.set_state(ConnectionState::Connecting);

        let connected = tokio::select! {
            res = ctx.transport.connect(&ctx.url) => res,
            _ = ctx.cmd_rx.recv() => {
                ctx.set_state(ConnectionState::Disconnected);
                return;
            }
        };

        match connected {
            Ok(link) => {
                ctx.set_state(ConnectionState::Connected);
                info!(handle = %ctx.id, subscription = %ctx.subscription, "tick stream connected");

                match ctx.run_connected(link).await {
                    SessionEnd::ClosedByCaller => {
                        ctx.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    SessionEnd::Terminal { code } => {
                        info!(
                            handle = %ctx.id,
                            code = ?code,
                            "tick stream closed by peer; not retrying"
                        );
                        ctx.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    SessionEnd::Recoverable { reason } => {
                        warn!(handle = %ctx.id, reason = %reason, "tick stream lost");
                    }
                }
            }
            Err(e) => {
                warn!(handle = %ctx.id, error = %e, "tick stream connect failed");
            }
        }

        // Recoverable path: retry within budget, or give up.
        if attempts >= ctx.policy.max_attempts {
            warn!(
                handle = %ctx.id,
                subscription = %ctx.subscription,
                attempts,
                "reconnect budget exhausted; giving up"
            );
            ctx.set_state(ConnectionState::GivenUp);
            return;
        }
        attempts += 1;
        ctx.set_state(ConnectionState::Reconnecting);
        info!(
            handle = %ctx.id,
            attempt = attempts,
            max_attempts = ctx.policy.max_attempts,
            delay_ms = ctx.policy.retry_delay.as_millis() as u64,
            "scheduling reconnect"
        );

        // The delay is cancelable: a close command wins the race.
        tokio::select! {
            _ = tokio::time::sleep(ctx.policy.retry_delay) => {}
            _ = ctx.cmd_rx.recv() => {
                ctx.set_state(ConnectionState::Disconnected);
                return;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU64;

    use futures_util::future::BoxFuture;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    // ── Scripted transport ──────────────────────────────────────────────

    /// One scripted connection attempt. An exhausted script refuses further
    /// connects (handshake failure).
    enum FakeSession {
        /// Connect never completes.
        Hang,
        /// Connect succeeds and yields these events, then the link ends.
        Events(Vec<LinkEvent>),
    }

    struct FakeTransport {
        connects: AtomicU64,
        sessions: Mutex<VecDeque<FakeSession>>,
    }

    impl FakeTransport {
        fn new(sessions: Vec<FakeSession>) -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicU64::new(0),
                sessions: Mutex::new(sessions.into()),
            })
        }

        fn connects(&self) -> u64 {
            self.connects.load(Ordering::SeqCst)
        }
    }

    impl TickTransport for FakeTransport {
        fn connect<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<TransportLink>> {
            Box::pin(async move {
                self.connects.fetch_add(1, Ordering::SeqCst);
                let session = self.sessions.lock().pop_front();
                match session {
                    None => bail!("connection refused"),
                    Some(FakeSession::Hang) => {
                        futures_util::future::pending::<()>().await;
                        unreachable!()
                    }
                    Some(FakeSession::Events(events)) => {
                        let (tx, rx) = mpsc::channel(64);
                        let (shutdown_tx, _shutdown_rx) = oneshot::channel();
                        for event in events {
                            tx.send(event).await.expect("scripted event fits buffer");
                        }
                        drop(tx);
                        Ok(TransportLink::new(rx, shutdown_tx))
                    }
                }
            })
        }
    }

    fn abnormal_close() -> FakeSession {
        FakeSession::Events(vec![LinkEvent::Closed {
            code: Some(1006),
            reason: "abnormal closure".to_string(),
        }])
    }

    fn manager(transport: Arc<FakeTransport>, max_attempts: u32) -> ConnectionManager {
        ConnectionManager::new(
            "wss://test.invalid/ticks",
            ReconnectPolicy {
                max_attempts,
                retry_delay: Duration::from_secs(5),
            },
            transport,
        )
    }

    fn sub() -> Subscription {
        Subscription::new("BINANCE", "BTCUSDT", 60_000)
    }

    async fn wait_for_state(handle: &ConnectionHandle, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(600), async {
            while handle.state() != want {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {want}, stuck at {}", handle.state()));
    }

    async fn wait_for_connects(transport: &FakeTransport, want: u64) {
        tokio::time::timeout(Duration::from_secs(600), async {
            while transport.connects() < want {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {want} connects"));
    }

    fn tick_json(timestamp: i64, close: f64) -> String {
        format!(r#"{{"close": {close}, "timestamp": {timestamp}}}"#)
    }

    // ── Decode ──────────────────────────────────────────────────────────

    #[test]
    fn decode_accepts_normalized_shape() {
        let tick = decode_tick(r#"{"close": 105.5, "timestamp": 1700000000123}"#).unwrap();
        assert_eq!(tick.timestamp_ms, 1_700_000_000_123);
        assert!((tick.price - 105.5).abs() < f64::EPSILON);
    }

    #[test]
    fn decode_tolerates_extra_fields() {
        let tick =
            decode_tick(r#"{"close": 99.0, "timestamp": 1000, "volume": 3.2}"#).unwrap();
        assert_eq!(tick.timestamp_ms, 1_000);
    }

    #[test]
    fn decode_rejects_other_shapes() {
        assert!(decode_tick("not json").is_err());
        assert!(decode_tick(r#"{"price": 1.0, "ts": 5}"#).is_err());
        assert!(decode_tick(r#"{"close": "105.5", "timestamp": 1000}"#).is_err());
        assert!(decode_tick(r#"{"close": 1.0}"#).is_err());
        assert!(decode_tick(r#"{"close": 1.0, "timestamp": -5}"#).is_err());
    }

    // ── Close classification ────────────────────────────────────────────

    #[test]
    fn normal_and_unsupported_data_closes_are_terminal() {
        assert!(!is_recoverable_close(Some(1000)));
        assert!(!is_recoverable_close(Some(1003)));
    }

    #[test]
    fn transient_closes_are_recoverable() {
        for code in [1002, 1006, 1011, 1012, 1013, 1014, 1015] {
            assert!(is_recoverable_close(Some(code)), "code {code}");
        }
        assert!(is_recoverable_close(None));
    }

    // ── Validation ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn open_rejects_malformed_subscription() {
        let transport = FakeTransport::new(vec![]);
        let mgr = manager(transport.clone(), 3);

        assert!(mgr.open(&Subscription::new("", "BTCUSDT", 60_000)).is_err());
        assert!(mgr.open(&Subscription::new("BINANCE", "", 60_000)).is_err());
        assert!(mgr.open(&Subscription::new("BINANCE", "BTCUSDT", 0)).is_err());
        // No connection was ever attempted for a rejected subscription.
        assert_eq!(transport.connects(), 0);
    }

    // ── Streaming ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn delivers_decoded_ticks_and_drops_malformed() {
        let transport = FakeTransport::new(vec![FakeSession::Events(vec![
            LinkEvent::Message(tick_json(1_000, 100.0)),
            LinkEvent::Message("garbage".to_string()),
            LinkEvent::Message(tick_json(1_500, 105.0)),
            LinkEvent::Closed {
                code: Some(1000),
                reason: "done".to_string(),
            },
        ])]);
        let mgr = manager(transport.clone(), 3);

        let handle = mgr.open(&sub()).unwrap();
        let received: Arc<Mutex<Vec<Tick>>> = Arc::new(Mutex::new(Vec::new()));
        let received_in_sink = received.clone();
        handle.set_tick_sink(move |tick| received_in_sink.lock().push(tick));

        wait_for_state(&handle, ConnectionState::Disconnected).await;

        let ticks = received.lock().clone();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].timestamp_ms, 1_000);
        assert_eq!(ticks[1].timestamp_ms, 1_500);
        // The malformed message was dropped without ending the stream.
        assert_eq!(handle.decode_errors(), 1);
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_close_does_not_retry() {
        let transport = FakeTransport::new(vec![FakeSession::Events(vec![LinkEvent::Closed {
            code: Some(1000),
            reason: "normal".to_string(),
        }])]);
        let mgr = manager(transport.clone(), 3);

        let handle = mgr.open(&sub()).unwrap();
        wait_for_state(&handle, ConnectionState::Disconnected).await;

        // Give any (wrong) retry timer a chance to fire.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_exactly_max_reconnect_attempts() {
        // Far more scripted sessions than the budget allows; every one
        // closes abnormally.
        let sessions = (0..10).map(|_| abnormal_close()).collect();
        let transport = FakeTransport::new(sessions);
        let mgr = manager(transport.clone(), 3);

        let handle = mgr.open(&sub()).unwrap();
        wait_for_state(&handle, ConnectionState::GivenUp).await;

        // Initial connect plus exactly three reconnect attempts.
        assert_eq!(transport.connects(), 4);

        // GivenUp is absorbing: no further attempts ever.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.connects(), 4);
        assert_eq!(handle.state(), ConnectionState::GivenUp);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_failures_consume_the_same_budget() {
        let transport = FakeTransport::new(vec![]); // every connect refused
        let mgr = manager(transport.clone(), 2);

        let handle = mgr.open(&sub()).unwrap();
        wait_for_state(&handle, ConnectionState::GivenUp).await;

        assert_eq!(transport.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_reconnect_delay_cancels_retry() {
        let transport = FakeTransport::new(vec![abnormal_close()]);
        let mgr = manager(transport.clone(), 5);

        let handle = mgr.open(&sub()).unwrap();
        wait_for_state(&handle, ConnectionState::Reconnecting).await;
        assert_eq!(transport.connects(), 1);

        handle.close();
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        // Sail well past the retry delay: the canceled timer must not
        // produce a stale connection attempt or state transition.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_connecting_is_effective() {
        let transport = FakeTransport::new(vec![FakeSession::Hang]);
        let mgr = manager(transport.clone(), 5);

        let handle = mgr.open(&sub()).unwrap();
        assert_eq!(handle.state(), ConnectionState::Connecting);
        // Let the attempt actually start before tearing it down.
        wait_for_connects(&transport, 1).await;

        handle.close();
        handle.close(); // idempotent
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_counters_are_independent_per_handle() {
        // First handle exhausts its budget. A second handle starts fresh
        // and connects fine; a shared counter would give up prematurely.
        let transport = FakeTransport::new(vec![
            abnormal_close(),
            abnormal_close(),
            FakeSession::Events(vec![
                LinkEvent::Message(tick_json(1_000, 100.0)),
                LinkEvent::Closed {
                    code: Some(1000),
                    reason: "done".to_string(),
                },
            ]),
        ]);
        let mgr = manager(transport.clone(), 1);

        let first = mgr.open(&sub()).unwrap();
        wait_for_state(&first, ConnectionState::GivenUp).await;
        assert_eq!(transport.connects(), 2);

        let second = mgr.open(&sub()).unwrap();
        wait_for_state(&second, ConnectionState::Disconnected).await;
        // One single successful connect: the fresh handle never touched the
        // first handle's spent budget.
        assert_eq!(transport.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_registered_after_open_still_receives() {
        // The dispatch path looks up the sink per message, so registration
        // only has to happen before messages flow, not before open returns.
        let transport = FakeTransport::new(vec![FakeSession::Events(vec![
            LinkEvent::Message(tick_json(2_000, 101.0)),
            LinkEvent::Closed {
                code: Some(1000),
                reason: "done".to_string(),
            },
        ])]);
        let mgr = manager(transport.clone(), 0);

        let handle = mgr.open(&sub()).unwrap();
        let received: Arc<Mutex<Vec<Tick>>> = Arc::new(Mutex::new(Vec::new()));
        let received_in_sink = received.clone();
        handle.set_tick_sink(move |tick| received_in_sink.lock().push(tick));

        wait_for_state(&handle, ConnectionState::Disconnected).await;
        assert_eq!(received.lock().len(), 1);
    }
}
