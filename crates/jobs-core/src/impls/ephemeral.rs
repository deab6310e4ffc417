//! Ephemeral broker - プロセス内のインメモリ pipeline
//!
//! # 学習ポイント
//! - ready キュー（VecDeque）+ 遅延ジョブの min-heap（BinaryHeap + Reverse 順序）
//! - tokio::sync::Mutex + Notify による reserve の待機
//! - visibility timeout: 期限切れの予約は attempt を 1 つ進めて戻す
//!
//! 非永続です。プロセスが落ちるとジョブは消えます。

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{BrokerStat, DeliveryId, Job, JobId, JobsError, PipelineName};
use crate::ports::{Broker, Clock, Delivery, SystemClock};

pub const DRIVER: &str = "ephemeral";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EphemeralOptions {
    /// How long a reservation stays valid without ack / nack.
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,

    /// Largest accepted payload in bytes.
    pub max_payload: usize,
}

impl Default for EphemeralOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            max_payload: 1024 * 1024,
        }
    }
}

/// Delayed job entry for the priority queue.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first);
/// `seq` keeps push order among jobs with the same eligible time.
struct ScheduledJob {
    eligible_at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for ScheduledJob {
    fn eq(&self, other: &Self) -> bool {
        self.eligible_at == other.eligible_at && self.seq == other.seq
    }
}

impl Eq for ScheduledJob {}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering: earlier times have higher priority
        (other.eligible_at, other.seq).cmp(&(self.eligible_at, self.seq))
    }
}

struct Reservation {
    job: Job,
    deadline: Instant,
}

struct EphemeralState {
    /// Eligible jobs, in eligible-time order.
    ready: VecDeque<Job>,

    /// Delayed jobs and lapsed reservations waiting to become eligible.
    scheduled: BinaryHeap<ScheduledJob>,

    /// Outstanding deliveries.
    reserved: HashMap<DeliveryId, Reservation>,

    next_seq: u64,
    stopped: bool,
}

impl EphemeralState {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            scheduled: BinaryHeap::new(),
            reserved: HashMap::new(),
            next_seq: 0,
            stopped: false,
        }
    }

    fn schedule(&mut self, eligible_at: Instant, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.scheduled.push(ScheduledJob {
            eligible_at,
            seq,
            job,
        });
    }

    /// Reclaim lapsed reservations, then move every job whose time has come
    /// to the ready queue. Runs before each push / reserve / resolve so the
    /// ready queue stays in eligible-time order.
    fn maintain(&mut self, now: Instant, clock: &dyn Clock) {
        let expired: Vec<DeliveryId> = self
            .reserved
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for delivery in expired {
            if let Some(Reservation { mut job, deadline }) = self.reserved.remove(&delivery) {
                job.record_failure(Duration::ZERO, clock.now());
                tracing::warn!(
                    pipeline = %job.pipeline(),
                    job_id = %job.id(),
                    %delivery,
                    attempts = job.attempts(),
                    "reservation expired, job returned to pipeline"
                );
                self.schedule(deadline, job);
            }
        }

        while let Some(entry) = self.scheduled.peek() {
            if entry.eligible_at > now {
                break; // Heap is sorted, so we can stop
            }
            if let Some(entry) = self.scheduled.pop() {
                self.ready.push_back(entry.job);
            }
        }
    }

    /// Earliest instant at which something changes on its own.
    fn next_wake(&self) -> Option<Instant> {
        let scheduled = self.scheduled.peek().map(|e| e.eligible_at);
        let lapse = self.reserved.values().map(|r| r.deadline).min();
        match (scheduled, lapse) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// In-process broker.
pub struct EphemeralBroker {
    pipeline: PipelineName,
    options: EphemeralOptions,
    state: Arc<Mutex<EphemeralState>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl EphemeralBroker {
    pub fn new(pipeline: PipelineName, options: EphemeralOptions) -> Self {
        Self {
            pipeline,
            options,
            state: Arc::new(Mutex::new(EphemeralState::new())),
            notify: Arc::new(Notify::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn stopped(&self) -> JobsError {
        JobsError::unavailable(&self.pipeline, "ephemeral broker is stopped")
    }
}

#[async_trait]
impl Broker for EphemeralBroker {
    fn driver(&self) -> &'static str {
        DRIVER
    }

    fn pipeline(&self) -> &PipelineName {
        &self.pipeline
    }

    async fn check(&self) -> Result<(), JobsError> {
        if self.state.lock().await.stopped {
            return Err(self.stopped());
        }
        Ok(())
    }

    async fn push(&self, job: Job) -> Result<JobId, JobsError> {
        if job.payload().len() > self.options.max_payload {
            return Err(JobsError::InvalidJob(format!(
                "payload of {} bytes exceeds the {} byte limit",
                job.payload().len(),
                self.options.max_payload
            )));
        }

        let id = job.id();
        {
            let mut state = self.state.lock().await;
            if state.stopped {
                return Err(self.stopped());
            }
            let now = Instant::now();
            state.maintain(now, self.clock.as_ref());
            match job.remaining_delay(self.clock.now()) {
                Some(delay) => state.schedule(now + delay, job),
                None => state.ready.push_back(job),
            }
        }

        // Notify waiting consumers
        self.notify.notify_one();
        Ok(id)
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Box<dyn Delivery>>, JobsError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let next_wake = {
                let mut state = self.state.lock().await;
                if state.stopped {
                    return Err(self.stopped());
                }
                let now = Instant::now();
                state.maintain(now, self.clock.as_ref());

                if let Some(job) = state.ready.pop_front() {
                    let id = DeliveryId::generate();
                    state.reserved.insert(
                        id,
                        Reservation {
                            job: job.clone(),
                            deadline: now + self.options.visibility_timeout,
                        },
                    );
                    return Ok(Some(Box::new(EphemeralDelivery {
                        id,
                        job,
                        state: Arc::clone(&self.state),
                        notify: Arc::clone(&self.notify),
                        clock: Arc::clone(&self.clock),
                    })));
                }

                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_wake()
                    .map_or(deadline, |wake| wake.min(deadline))
            };

            // Wait for a push OR the next scheduled change OR the caller's deadline
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep_until(next_wake) => {},
            }
        }
    }

    async fn stat(&self) -> Result<BrokerStat, JobsError> {
        let mut state = self.state.lock().await;
        state.maintain(Instant::now(), self.clock.as_ref());
        Ok(BrokerStat {
            active: state.ready.len() as u64,
            delayed: state.scheduled.len() as u64,
            reserved: state.reserved.len() as u64,
        })
    }

    async fn stop(&self) -> Result<(), JobsError> {
        {
            let mut state = self.state.lock().await;
            if state.stopped {
                return Ok(());
            }
            state.stopped = true;
            let left = state.ready.len() + state.scheduled.len() + state.reserved.len();
            if left > 0 {
                tracing::warn!(pipeline = %self.pipeline, jobs = left, "dropping in-memory jobs on stop");
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

struct EphemeralDelivery {
    id: DeliveryId,
    job: Job,
    state: Arc<Mutex<EphemeralState>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl EphemeralDelivery {
    fn expired(&self) -> JobsError {
        JobsError::HandleExpired {
            delivery: self.id,
            job_id: self.job.id(),
        }
    }
}

#[async_trait]
impl Delivery for EphemeralDelivery {
    fn id(&self) -> DeliveryId {
        self.id
    }

    fn job(&self) -> &Job {
        &self.job
    }

    async fn ack(self: Box<Self>) -> Result<(), JobsError> {
        let mut state = self.state.lock().await;
        state.maintain(Instant::now(), self.clock.as_ref());
        match state.reserved.remove(&self.id) {
            Some(_) => Ok(()),
            None => Err(self.expired()),
        }
    }

    async fn nack(self: Box<Self>, delay: Duration) -> Result<(), JobsError> {
        {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            state.maintain(now, self.clock.as_ref());
            let Some(Reservation { mut job, .. }) = state.reserved.remove(&self.id) else {
                return Err(self.expired());
            };

            job.record_failure(delay, self.clock.now());
            match job.remaining_delay(self.clock.now()) {
                Some(delay) => state.schedule(now + delay, job),
                None => state.ready.push_back(job),
            }
        } // Lock released here

        // Notify outside the lock
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetryPolicy;
    use crate::ports::{FixedClock, HandlerError, JobHandler, Reply};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;
    use chrono::{DateTime, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn broker() -> EphemeralBroker {
        EphemeralBroker::new(PipelineName::new("test"), EphemeralOptions::default())
            .with_clock(Arc::new(FixedClock::new(now())))
    }

    fn job(payload: &'static str) -> Job {
        Job::new(
            JobId::generate(),
            PipelineName::new("test"),
            Bytes::from_static(payload.as_bytes()),
            RetryPolicy::default(),
            now(),
        )
    }

    fn delayed(payload: &'static str, delay: Duration) -> Job {
        let until = now() + chrono::Duration::from_std(delay).unwrap();
        job(payload).with_delay_until(Some(until))
    }

    #[tokio::test(start_paused = true)]
    async fn push_reserve_ack() {
        let broker = broker();
        let id = broker.push(job("a")).await.unwrap();

        let delivery = broker.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(delivery.job().id(), id);
        assert_eq!(broker.stat().await.unwrap().reserved, 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.stat().await.unwrap(), BrokerStat::default());
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_times_out_on_empty_pipeline() {
        let broker = broker();
        let start = Instant::now();
        let got = broker.reserve(Duration::from_millis(500)).await.unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_is_not_delivered_early() {
        let broker = broker();
        broker.push(delayed("later", Duration::from_secs(2))).await.unwrap();
        assert_eq!(broker.stat().await.unwrap().delayed, 1);

        let start = Instant::now();
        assert!(broker.reserve(Duration::from_secs(1)).await.unwrap().is_none());

        let delivery = broker.reserve(Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(delivery.job().payload().as_ref(), b"later");
    }

    #[tokio::test(start_paused = true)]
    async fn nack_increments_attempts_and_delays() {
        let broker = broker();
        broker.push(job("a")).await.unwrap();

        let delivery = broker.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(delivery.job().attempts(), 0);
        delivery.nack(Duration::from_secs(3)).await.unwrap();

        let stat = broker.stat().await.unwrap();
        assert_eq!((stat.active, stat.delayed, stat.reserved), (0, 1, 0));

        let start = Instant::now();
        let again = broker.reserve(Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(again.job().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_reservation_returns_job_and_expires_handle() {
        let broker = EphemeralBroker::new(
            PipelineName::new("test"),
            EphemeralOptions {
                visibility_timeout: Duration::from_secs(5),
                ..EphemeralOptions::default()
            },
        );
        broker.push(job("a")).await.unwrap();

        let stale = broker.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let fresh = broker.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(fresh.job().id(), stale.job().id());
        assert_eq!(fresh.job().attempts(), 1);

        assert!(matches!(
            stale.ack().await,
            Err(JobsError::HandleExpired { .. })
        ));
        fresh.ack().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_eligible_time_order() {
        let broker = broker();
        broker.push(delayed("first", Duration::from_millis(100))).await.unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        broker.push(job("second")).await.unwrap();

        let a = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        let b = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a.job().payload().as_ref(), b"first");
        assert_eq!(b.job().payload().as_ref(), b"second");
    }

    #[tokio::test(start_paused = true)]
    async fn job_is_visible_to_one_consumer_at_a_time() {
        let broker = broker();
        broker.push(job("a")).await.unwrap();

        let first = broker.reserve(Duration::ZERO).await.unwrap();
        let second = broker.reserve(Duration::ZERO).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn push_wakes_waiting_reserve() {
        let broker = Arc::new(broker());
        let waiter = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move {
                broker
                    .reserve(Duration::from_secs(30))
                    .await
                    .unwrap()
                    .map(|d| d.job().id())
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let id = broker.push(job("a")).await.unwrap();
        assert_eq!(waiter.await.unwrap(), Some(id));
    }

    /// Acks `ok`, fails everything else, stops after `limit` calls.
    struct Picky {
        cancel: CancellationToken,
        calls: AtomicUsize,
        limit: usize,
    }

    #[async_trait]
    impl JobHandler for Picky {
        async fn handle(&self, job: &Job) -> Result<Reply, HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
                self.cancel.cancel();
            }
            if job.payload().as_ref() == b"ok" {
                Ok(Reply::Ack)
            } else {
                Err("unexpected payload".into())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn consume_runs_handler_until_cancelled() {
        let broker = broker();
        broker.push(job("ok")).await.unwrap();
        broker.push(job("bad")).await.unwrap();

        let cancel = CancellationToken::new();
        let handler = Picky {
            cancel: cancel.clone(),
            calls: AtomicUsize::new(0),
            limit: 2,
        };
        broker
            .consume(Duration::from_secs(1), cancel, &handler)
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        // the failed job went back with the policy's first backoff
        let stat = broker.stat().await.unwrap();
        assert_eq!((stat.active, stat.delayed, stat.reserved), (0, 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn consume_drops_job_after_its_last_attempt() {
        let broker = Arc::new(broker());
        let single = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let once = Job::new(
            JobId::generate(),
            PipelineName::new("test"),
            Bytes::from_static(b"bad"),
            single,
            now(),
        );
        broker.push(once).await.unwrap();

        let cancel = CancellationToken::new();
        let handler = Arc::new(Picky {
            cancel: cancel.clone(),
            calls: AtomicUsize::new(0),
            limit: usize::MAX,
        });
        let consuming = tokio::spawn({
            let broker = Arc::clone(&broker);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            async move { broker.consume(Duration::from_millis(200), cancel, handler.as_ref()).await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        consuming.await.unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.stat().await.unwrap(), BrokerStat::default());
    }

    #[tokio::test]
    async fn rejects_oversized_payload() {
        let broker = EphemeralBroker::new(
            PipelineName::new("test"),
            EphemeralOptions {
                max_payload: 4,
                ..EphemeralOptions::default()
            },
        );
        let err = broker.push(job("too long")).await.unwrap_err();
        assert!(matches!(err, JobsError::InvalidJob(_)));
    }

    #[tokio::test]
    async fn stopped_broker_is_unavailable() {
        let broker = broker();
        broker.stop().await.unwrap();
        assert!(broker.check().await.unwrap_err().is_retryable());
        assert!(broker.push(job("a")).await.is_err());
    }
}
