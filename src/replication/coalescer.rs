//! Pull Coalescer
//!
//! Collapses concurrent demands for freshness into at most one in-flight
//! pull per upstream and fans the outcome back out to every waiter.
//!
//! Each upstream has a slot cycling `Idle -> Scheduled -> Running -> Idle`.
//! A dedicated worker task per slot runs the pulls; callers only touch the
//! slot state under a short lock and then park on a oneshot.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::{AppliedRange, HaSettings, PullClient};
use crate::error::{Error, Result};
use crate::transport::Endpoint;
use crate::txlog::TxId;

/// Rounds of pulls `await_tx` runs before giving up
const MAX_AWAIT_ROUNDS: usize = 3;

/// Pull outcome shared by every waiter of one request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PullFailure {
    #[error("Failed to apply replicated tx {tx_id}: {cause}")]
    ApplyFailed { tx_id: TxId, cause: String },

    #[error("Log truncated: records after tx {requested} requested, oldest retained is {oldest}")]
    Truncated { requested: TxId, oldest: TxId },

    #[error("Replication unavailable: {0}")]
    Unavailable(String),
}

impl From<&Error> for PullFailure {
    fn from(err: &Error) -> Self {
        match err {
            Error::ReplicationApplyFailed { tx_id, cause } => PullFailure::ApplyFailed {
                tx_id: *tx_id,
                cause: cause.clone(),
            },
            Error::LogTruncated { requested, oldest } => PullFailure::Truncated {
                requested: *requested,
                oldest: *oldest,
            },
            other => PullFailure::Unavailable(other.to_string()),
        }
    }
}

impl From<PullFailure> for Error {
    fn from(failure: PullFailure) -> Self {
        match failure {
            PullFailure::ApplyFailed { tx_id, cause } => Error::ReplicationApplyFailed { tx_id, cause },
            PullFailure::Truncated { requested, oldest } => Error::LogTruncated { requested, oldest },
            PullFailure::Unavailable(reason) => Error::ReplicationUnavailable(reason),
        }
    }
}

type PullOutcome = std::result::Result<AppliedRange, PullFailure>;

/// Lifecycle phase of an upstream slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Idle,
    Scheduled,
    Running,
}

struct PullRequest {
    id: u64,
    /// Local tail when the request was made, refreshed when the pull starts
    requested_at_tx_id: TxId,
    waiters: Vec<(u64, oneshot::Sender<PullOutcome>)>,
}

impl PullRequest {
    fn new(id: u64, requested_at_tx_id: TxId) -> Self {
        Self {
            id,
            requested_at_tx_id,
            waiters: Vec::new(),
        }
    }
}

struct SlotState {
    phase: SlotPhase,
    /// Scheduled or running request
    current: Option<PullRequest>,
    /// Request to run right after the current one succeeds
    successor: Option<PullRequest>,
    /// Highest tx announced by a push while a pull was running
    pending_hint: TxId,
}

impl SlotState {
    fn remove_waiter(&mut self, waiter_id: u64) {
        for request in [self.current.as_mut(), self.successor.as_mut()].into_iter().flatten() {
            request.waiters.retain(|(id, _)| *id != waiter_id);
        }
    }
}

struct UpstreamSlot {
    upstream: Endpoint,
    state: Mutex<SlotState>,
    /// Wakes the worker; one pending wake is enough
    inbox: mpsc::Sender<()>,
    next_id: AtomicU64,
    pulls_dispatched: AtomicU64,
}

impl UpstreamSlot {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn wake(&self) {
        // Full means a wake is already pending
        let _ = self.inbox.try_send(());
    }

    /// Idle -> Scheduled with a waiter-less request; false if not idle
    fn schedule_if_idle(&self, tail: TxId) -> bool {
        let mut state = self.state.lock();
        if state.phase != SlotPhase::Idle {
            return false;
        }
        state.current = Some(PullRequest::new(self.next_id(), tail));
        state.phase = SlotPhase::Scheduled;
        true
    }

    /// Run scheduled pulls until the slot goes idle
    async fn drain(&self, client: &PullClient) {
        loop {
            let request_id = {
                let mut state = self.state.lock();
                if state.phase != SlotPhase::Scheduled {
                    return;
                }
                state.phase = SlotPhase::Running;
                let tail = client.local_tail();
                let request = state
                    .current
                    .get_or_insert_with(|| PullRequest::new(self.next_id(), tail));
                request.requested_at_tx_id = tail;
                request.id
            };

            self.pulls_dispatched.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Dispatching pull #{} from {}", request_id, self.upstream);
            let result = client.pull_from(&self.upstream).await;
            let tail = client.local_tail();

            let (current, dropped_successor, rescheduled) = {
                let mut state = self.state.lock();
                let current = state.current.take();
                let hint = std::mem::take(&mut state.pending_hint);

                match &result {
                    Ok(_) => {
                        if let Some(successor) = state.successor.take() {
                            state.current = Some(successor);
                            state.phase = SlotPhase::Scheduled;
                        } else if hint > tail {
                            state.current = Some(PullRequest::new(self.next_id(), tail));
                            state.phase = SlotPhase::Scheduled;
                        } else {
                            state.phase = SlotPhase::Idle;
                        }
                        (current, None, state.phase == SlotPhase::Scheduled)
                    }
                    Err(_) => {
                        state.phase = SlotPhase::Idle;
                        (current, state.successor.take(), false)
                    }
                }
            };

            let outcome: PullOutcome = result.as_ref().map(|range| *range).map_err(PullFailure::from);
            for request in [current, dropped_successor].into_iter().flatten() {
                let released = request.waiters.len();
                for (_, waiter) in request.waiters {
                    // Receiver gone means the waiter cancelled
                    let _ = waiter.send(outcome.clone());
                }
                if released > 0 {
                    tracing::trace!("Released {} waiters of pull #{}", released, request.id);
                }
            }

            if !rescheduled {
                return;
            }
        }
    }
}

/// Handle to one caller's place in a pull
///
/// Dropping it (or calling [`PullCompletion::cancel`]) removes the caller
/// from the waiter list; the shared pull keeps running.
pub struct PullCompletion {
    waiter_id: u64,
    slot: Weak<UpstreamSlot>,
    rx: Option<oneshot::Receiver<PullOutcome>>,
}

impl PullCompletion {
    /// Wait for the pull this caller joined
    pub async fn wait(mut self) -> Result<AppliedRange> {
        let outcome = match self.rx.as_mut() {
            Some(rx) => rx.await,
            None => return Err(Error::Cancelled),
        };
        self.rx = None;

        match outcome {
            Ok(Ok(range)) => Ok(range),
            Ok(Err(failure)) => Err(failure.into()),
            Err(_) => Err(Error::ReplicationUnavailable("pull abandoned".into())),
        }
    }

    /// Stop waiting
    pub fn cancel(self) {}
}

impl Drop for PullCompletion {
    fn drop(&mut self) {
        if self.rx.take().is_none() {
            return;
        }
        if let Some(slot) = self.slot.upgrade() {
            slot.state.lock().remove_waiter(self.waiter_id);
        }
    }
}

struct CoalescerInner {
    client: Arc<PullClient>,
    pull_interval: Duration,
    slots: Mutex<HashMap<String, Arc<UpstreamSlot>>>,
}

/// Per-upstream pull deduplication
#[derive(Clone)]
pub struct PullCoalescer {
    inner: Arc<CoalescerInner>,
}

impl PullCoalescer {
    pub fn new(client: Arc<PullClient>, settings: &HaSettings) -> Self {
        Self {
            inner: Arc::new(CoalescerInner {
                client,
                pull_interval: settings.pull_interval,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn client(&self) -> &Arc<PullClient> {
        &self.inner.client
    }

    /// Local committed tail
    pub fn local_tail(&self) -> TxId {
        self.inner.client.local_tail()
    }

    /// Join (or start) a pull that began no earlier than this call's
    /// observation of the local tail
    pub fn ensure_up_to_date(&self, upstream: &Endpoint) -> PullCompletion {
        let slot = self.slot_for(upstream);
        let observed = self.local_tail();
        let waiter_id = slot.next_id();
        let (tx, rx) = oneshot::channel();

        let wake = {
            let mut state = slot.state.lock();
            match state.phase {
                SlotPhase::Idle => {
                    let mut request = PullRequest::new(slot.next_id(), observed);
                    request.waiters.push((waiter_id, tx));
                    state.current = Some(request);
                    state.phase = SlotPhase::Scheduled;
                    true
                }
                SlotPhase::Scheduled => {
                    state
                        .current
                        .get_or_insert_with(|| PullRequest::new(slot.next_id(), observed))
                        .waiters
                        .push((waiter_id, tx));
                    false
                }
                SlotPhase::Running => {
                    let covers = state
                        .current
                        .as_ref()
                        .map(|running| running.requested_at_tx_id >= observed)
                        .unwrap_or(false);
                    if covers {
                        if let Some(running) = state.current.as_mut() {
                            running.waiters.push((waiter_id, tx));
                        }
                    } else {
                        tracing::trace!(
                            "Caller at tx {} waits for a successor pull from {}",
                            observed,
                            upstream
                        );
                        state
                            .successor
                            .get_or_insert_with(|| PullRequest::new(slot.next_id(), observed))
                            .waiters
                            .push((waiter_id, tx));
                    }
                    false
                }
            }
        };

        if wake {
            slot.wake();
        }

        PullCompletion {
            waiter_id,
            slot: Arc::downgrade(&slot),
            rx: Some(rx),
        }
    }

    /// Wait until the local tail covers `tx_id`, pulling from `upstream` as
    /// needed. Returns the local tail.
    pub async fn await_tx(&self, upstream: &Endpoint, tx_id: TxId) -> Result<TxId> {
        for _ in 0..MAX_AWAIT_ROUNDS {
            let tail = self.local_tail();
            if tail >= tx_id {
                return Ok(tail);
            }
            self.ensure_up_to_date(upstream).wait().await?;
        }

        let tail = self.local_tail();
        if tail >= tx_id {
            return Ok(tail);
        }
        Err(Error::ReplicationUnavailable(format!(
            "tx {} not received from {} after {} pulls (local tail {})",
            tx_id, upstream, MAX_AWAIT_ROUNDS, tail
        )))
    }

    /// Hint that `tx_id` is committed upstream
    pub fn notify_new_tx(&self, upstream: &Endpoint, tx_id: TxId) {
        if self.local_tail() >= tx_id {
            return;
        }
        let slot = self.slot_for(upstream);
        let wake = {
            let mut state = slot.state.lock();
            match state.phase {
                SlotPhase::Idle => {
                    state.current = Some(PullRequest::new(slot.next_id(), self.local_tail()));
                    state.phase = SlotPhase::Scheduled;
                    true
                }
                // Not started yet, will see the new tail
                SlotPhase::Scheduled => false,
                SlotPhase::Running => {
                    state.pending_hint = state.pending_hint.max(tx_id);
                    false
                }
            }
        };
        if wake {
            slot.wake();
        }
    }

    /// Schedule a waiter-less pull if the upstream is idle
    pub fn schedule(&self, upstream: &Endpoint) {
        let slot = self.slot_for(upstream);
        if slot.schedule_if_idle(self.local_tail()) {
            slot.wake();
        }
    }

    /// Drop the slot for an upstream; its waiters fail with
    /// `ReplicationUnavailable` unless a pull is already running
    pub fn forget(&self, upstream_id: &str) {
        if self.inner.slots.lock().remove(upstream_id).is_some() {
            tracing::debug!("Dropped pull slot for {}", upstream_id);
        }
    }

    pub fn phase(&self, upstream_id: &str) -> Option<SlotPhase> {
        let slot = self.inner.slots.lock().get(upstream_id).cloned()?;
        let phase = slot.state.lock().phase;
        Some(phase)
    }

    /// Callers waiting on the current and successor requests
    pub fn waiting(&self, upstream_id: &str) -> usize {
        let Some(slot) = self.inner.slots.lock().get(upstream_id).cloned() else {
            return 0;
        };
        let state = slot.state.lock();
        [state.current.as_ref(), state.successor.as_ref()]
            .into_iter()
            .flatten()
            .map(|request| request.waiters.len())
            .sum()
    }

    /// Pulls started against an upstream
    pub fn pulls_dispatched(&self, upstream_id: &str) -> u64 {
        self.inner
            .slots
            .lock()
            .get(upstream_id)
            .map(|slot| slot.pulls_dispatched.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn slot_for(&self, upstream: &Endpoint) -> Arc<UpstreamSlot> {
        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.get(&upstream.id) {
            if slot.upstream == *upstream {
                return Arc::clone(slot);
            }
        }

        let (inbox, rx) = mpsc::channel(1);
        let slot = Arc::new(UpstreamSlot {
            upstream: upstream.clone(),
            state: Mutex::new(SlotState {
                phase: SlotPhase::Idle,
                current: None,
                successor: None,
                pending_hint: 0,
            }),
            inbox,
            next_id: AtomicU64::new(1),
            pulls_dispatched: AtomicU64::new(0),
        });

        tokio::spawn(run_worker(
            Arc::downgrade(&slot),
            rx,
            Arc::clone(&self.inner.client),
            self.inner.pull_interval,
        ));
        tracing::debug!("Started pull worker for {}", upstream);

        slots.insert(upstream.id.clone(), Arc::clone(&slot));
        slot
    }
}

/// Worker loop for one upstream; exits when the slot is dropped
async fn run_worker(
    slot: Weak<UpstreamSlot>,
    mut inbox: mpsc::Receiver<()>,
    client: Arc<PullClient>,
    pull_interval: Duration,
) {
    let mut ticker = (!pull_interval.is_zero()).then(|| {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + pull_interval, pull_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let timed = tokio::select! {
            wake = inbox.recv() => match wake {
                Some(()) => false,
                None => break,
            },
            _ = next_tick(&mut ticker) => true,
        };

        let Some(slot) = slot.upgrade() else {
            break;
        };
        if timed {
            slot.schedule_if_idle(client.local_tail());
        }
        slot.drain(&client).await;
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Request, Response, Transport};
    use crate::txlog::{MemoryTxStore, TxRecord, TxStore};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Semaphore;

    /// Primary stand-in whose responses are held until the test opens the gate
    struct GatedPrimary {
        log: Arc<MemoryTxStore>,
        gate: Semaphore,
        calls: AtomicU64,
        failing: AtomicBool,
    }

    impl GatedPrimary {
        async fn new(records: TxId) -> Arc<Self> {
            let log = Arc::new(MemoryTxStore::new());
            for i in 1..=records {
                log.append(TxRecord::new(i, "primary", vec![i as u8])).await.unwrap();
            }
            Arc::new(Self {
                log,
                gate: Semaphore::new(0),
                calls: AtomicU64::new(0),
                failing: AtomicBool::new(false),
            })
        }

        fn open(&self, responses: usize) {
            self.gate.add_permits(responses);
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Transport for GatedPrimary {
        async fn call(&self, _endpoint: &Endpoint, request: Request) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Request::PullSince { since, up_to, max, .. } = request else {
                return Err(Error::Internal("unexpected request".into()));
            };
            // Served as of now, delivered once the gate opens
            let tail = self.log.last_committed_tx_id();
            let mut records = self.log.read_after(since, max).await?;
            records.retain(|r| r.tx_id <= up_to.unwrap_or(tail));

            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Network("primary went away".into()));
            }
            Ok(Response::TxStream {
                records,
                primary_tail: tail,
            })
        }
    }

    fn upstream() -> Endpoint {
        Endpoint::new("primary", "local")
    }

    fn coalescer(primary: Arc<GatedPrimary>, batch: usize) -> (PullCoalescer, Arc<MemoryTxStore>) {
        let local = Arc::new(MemoryTxStore::new());
        let settings = HaSettings {
            pull_interval: Duration::ZERO,
            pull_max_records: batch,
            pull_retry_max: 0,
            ..HaSettings::default()
        };
        let client = Arc::new(PullClient::new("replica-1", local.clone(), primary, settings.clone()));
        (PullCoalescer::new(client, &settings), local)
    }

    async fn until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_pull() {
        let primary = GatedPrimary::new(30).await;
        let (coalescer, local) = coalescer(primary.clone(), 100);

        let completions: Vec<_> = (0..10).map(|_| coalescer.ensure_up_to_date(&upstream())).collect();
        until(|| primary.calls() == 1).await;
        assert_eq!(coalescer.phase("primary"), Some(SlotPhase::Running));

        // Arrives while running at the same tail: joins the running pull
        let late = coalescer.ensure_up_to_date(&upstream());
        assert_eq!(coalescer.waiting("primary"), 11);

        primary.open(10);
        for completion in completions {
            assert_eq!(completion.wait().await.unwrap().last_applied, 30);
        }
        assert_eq!(late.wait().await.unwrap().count, 30);
        assert_eq!(local.last_committed_tx_id(), 30);
        assert_eq!(coalescer.pulls_dispatched("primary"), 1);
        assert_eq!(coalescer.phase("primary"), Some(SlotPhase::Idle));
    }

    #[tokio::test]
    async fn test_caller_ahead_of_running_pull_waits_for_successor() {
        let primary = GatedPrimary::new(10).await;
        let (coalescer, local) = coalescer(primary.clone(), 5);

        let first = coalescer.ensure_up_to_date(&upstream());
        primary.open(1);
        until(|| local.last_committed_tx_id() == 5 && primary.calls() == 2).await;

        // Observed tail 5 is past the running request's start (0)
        let second = coalescer.ensure_up_to_date(&upstream());
        primary.open(10);

        assert_eq!(first.wait().await.unwrap().last_applied, 10);
        let range = second.wait().await.unwrap();
        assert!(range.is_empty());
        assert_eq!(range.last_applied, 10);
        assert_eq!(coalescer.pulls_dispatched("primary"), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_stop_pull() {
        let primary = GatedPrimary::new(4).await;
        let (coalescer, local) = coalescer(primary.clone(), 100);

        let kept = coalescer.ensure_up_to_date(&upstream());
        let cancelled = coalescer.ensure_up_to_date(&upstream());
        until(|| primary.calls() == 1).await;

        cancelled.cancel();
        assert_eq!(coalescer.waiting("primary"), 1);

        primary.open(5);
        assert_eq!(kept.wait().await.unwrap().count, 4);
        assert_eq!(local.last_committed_tx_id(), 4);
    }

    #[tokio::test]
    async fn test_failure_releases_all_waiters_without_retry_pull() {
        let primary = GatedPrimary::new(10).await;
        primary.failing.store(true, Ordering::SeqCst);
        let (coalescer, local) = coalescer(primary.clone(), 5);

        let first = coalescer.ensure_up_to_date(&upstream());
        until(|| primary.calls() == 1).await;

        // Joins the running pull and shares its failure
        let second = coalescer.ensure_up_to_date(&upstream());
        coalescer.notify_new_tx(&upstream(), 10);
        primary.open(5);

        assert!(matches!(first.wait().await, Err(Error::ReplicationUnavailable(_))));
        assert!(matches!(second.wait().await, Err(Error::ReplicationUnavailable(_))));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coalescer.phase("primary"), Some(SlotPhase::Idle));
        assert_eq!(coalescer.pulls_dispatched("primary"), 1);
        assert_eq!(local.last_committed_tx_id(), 0);
    }

    #[tokio::test]
    async fn test_await_tx_skips_pull_when_applied() {
        let primary = GatedPrimary::new(6).await;
        let (coalescer, _local) = coalescer(primary.clone(), 100);
        primary.open(10);

        assert_eq!(coalescer.await_tx(&upstream(), 6).await.unwrap(), 6);
        assert_eq!(coalescer.await_tx(&upstream(), 3).await.unwrap(), 6);
        coalescer.notify_new_tx(&upstream(), 6);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn test_notify_schedules_waiterless_pull() {
        let primary = GatedPrimary::new(3).await;
        let (coalescer, local) = coalescer(primary.clone(), 100);
        primary.open(10);

        coalescer.notify_new_tx(&upstream(), 3);
        until(|| local.last_committed_tx_id() == 3).await;
        assert_eq!(coalescer.pulls_dispatched("primary"), 1);
    }

    #[tokio::test]
    async fn test_hint_during_pull_schedules_follow_up() {
        let primary = GatedPrimary::new(2).await;
        let (coalescer, local) = coalescer(primary.clone(), 100);

        let completion = coalescer.ensure_up_to_date(&upstream());
        until(|| primary.calls() == 1).await;

        // Committed after the running pull fixed its bound
        primary.log.append(TxRecord::new(3, "primary", vec![3])).await.unwrap();
        coalescer.notify_new_tx(&upstream(), 3);
        primary.open(10);

        assert_eq!(completion.wait().await.unwrap().last_applied, 2);
        until(|| local.last_committed_tx_id() == 3).await;
        assert_eq!(coalescer.pulls_dispatched("primary"), 2);
    }

    #[tokio::test]
    async fn test_timed_pull() {
        let primary = GatedPrimary::new(5).await;
        primary.open(100);
        let local = Arc::new(MemoryTxStore::new());
        let settings = HaSettings {
            pull_interval: Duration::from_millis(20),
            ..HaSettings::default()
        };
        let client = Arc::new(PullClient::new("replica-1", local.clone(), primary.clone(), settings.clone()));
        let coalescer = PullCoalescer::new(client, &settings);

        assert_eq!(coalescer.phase("primary"), None);
        coalescer.schedule(&upstream());
        until(|| local.last_committed_tx_id() == 5).await;

        primary.log.append(TxRecord::new(6, "primary", vec![6])).await.unwrap();
        until(|| local.last_committed_tx_id() == 6).await;
        assert!(coalescer.pulls_dispatched("primary") >= 2);
    }
}
