//! Beanstalk broker
//!
//! beanstalkd の機能がそのまま対応します:
//! - push(delay) = `put <pri> <delay> <ttr>`
//! - reserve     = `reserve-with-timeout`
//! - ack         = `delete`
//! - nack(delay) = `release <id> <pri> <delay>`
//!
//! `release` ではジョブ本体を書き換えられないため、attempt 数は `stats-job` の
//! `reserves` カウンタから復元します。TTR が切れたジョブはサーバーが自動で ready に戻します。

pub mod client;
pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use self::client::{BeanstalkConnection, Connector, Pool, TcpConnector};
use self::protocol::{Command, Response, parse_stats, stat_u64, validate_tube};
use super::transport::TransportError;
use crate::domain::{BrokerStat, DeliveryId, Job, JobId, JobsError, PipelineName};
use crate::ports::{Broker, Clock, Delivery, SystemClock};

pub const DRIVER: &str = "beanstalk";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeanstalkOptions {
    pub addr: String,

    /// Tube name; defaults to the pipeline name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tube: Option<String>,

    /// 0 is most urgent.
    pub priority: u32,

    /// Time-to-run: how long a reservation lasts before the server releases it.
    #[serde(with = "humantime_serde")]
    pub ttr: Duration,

    /// Server-side `max-job-size`.
    pub max_job_size: usize,

    pub max_idle: usize,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for BeanstalkOptions {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:11300".to_string(),
            tube: None,
            priority: 1024,
            ttr: Duration::from_secs(60),
            max_job_size: 65_535,
            max_idle: 4,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Whole seconds, rounded up.
fn ceil_secs(d: Duration) -> u32 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

struct BeanstalkShared<C: Connector> {
    pipeline: PipelineName,
    options: BeanstalkOptions,
    pool: Pool<C>,
    clock: Arc<dyn Clock>,
}

impl<C: Connector> BeanstalkShared<C> {
    fn err(&self, err: TransportError) -> JobsError {
        err.into_jobs(&self.pipeline)
    }

    fn unexpected(&self, response: Response) -> JobsError {
        JobsError::unavailable(&self.pipeline, format!("unexpected response {response:?}"))
    }
}

pub struct BeanstalkBroker<C: Connector = TcpConnector> {
    shared: Arc<BeanstalkShared<C>>,
}

impl BeanstalkBroker<TcpConnector> {
    pub fn connect(pipeline: PipelineName, options: BeanstalkOptions) -> Result<Self, JobsError> {
        let connector = TcpConnector::new(options.addr.clone(), options.connect_timeout)
            .with_max_body(options.max_job_size);
        Self::new(pipeline, options, connector)
    }
}

impl<C: Connector> BeanstalkBroker<C> {
    pub fn new(pipeline: PipelineName, options: BeanstalkOptions, connector: C) -> Result<Self, JobsError> {
        Self::with_clock(pipeline, options, connector, Arc::new(SystemClock))
    }

    pub fn with_clock(
        pipeline: PipelineName,
        options: BeanstalkOptions,
        connector: C,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, JobsError> {
        let tube = options
            .tube
            .clone()
            .unwrap_or_else(|| pipeline.as_str().to_string());
        validate_tube(&tube).map_err(|e| JobsError::Config(e.to_string()))?;
        let pool = Pool::new(connector, tube, options.max_idle);
        Ok(Self {
            shared: Arc::new(BeanstalkShared {
                pipeline,
                options,
                pool,
                clock,
            }),
        })
    }
}

#[async_trait]
impl<C: Connector> Broker for BeanstalkBroker<C> {
    fn driver(&self) -> &'static str {
        DRIVER
    }

    fn pipeline(&self) -> &PipelineName {
        &self.shared.pipeline
    }

    async fn check(&self) -> Result<(), JobsError> {
        let conn = self.shared.pool.acquire().await.map_err(|e| self.shared.err(e))?;
        self.shared.pool.put_back(conn).await;
        Ok(())
    }

    async fn push(&self, job: Job) -> Result<JobId, JobsError> {
        let shared = &self.shared;
        let body = job.to_wire()?;
        if body.len() > shared.options.max_job_size {
            return Err(JobsError::InvalidJob(format!(
                "encoded job of {} bytes exceeds the {} byte limit",
                body.len(),
                shared.options.max_job_size
            )));
        }
        let delay = job
            .remaining_delay(shared.clock.now())
            .map_or(0, ceil_secs);

        let response = shared
            .pool
            .call(Command::Put {
                priority: shared.options.priority,
                delay,
                ttr: ceil_secs(shared.options.ttr).max(1),
                body: Bytes::from(body),
            })
            .await
            .map_err(|e| shared.err(e))?;

        match response {
            Response::Inserted(server_id) => {
                tracing::trace!(pipeline = %shared.pipeline, job_id = %job.id(), server_id, "job put");
                Ok(job.id())
            }
            Response::JobTooBig => Err(JobsError::InvalidJob(
                "job exceeds the server's max-job-size".into(),
            )),
            Response::Draining => Err(JobsError::unavailable(
                &shared.pipeline,
                "server is draining",
            )),
            Response::Buried(_) => Err(JobsError::unavailable(
                &shared.pipeline,
                "server out of memory, job buried",
            )),
            other => Err(shared.unexpected(other)),
        }
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Box<dyn Delivery>>, JobsError> {
        let shared = &self.shared;
        let mut conn = shared.pool.acquire().await.map_err(|e| shared.err(e))?;

        let response = conn
            .call(Command::ReserveWithTimeout(ceil_secs(wait)))
            .await
            .map_err(|e| shared.err(e))?;

        let (server_id, body) = match response {
            Response::Reserved { id, body } => (id, body),
            Response::TimedOut | Response::DeadlineSoon => {
                shared.pool.put_back(conn).await;
                return Ok(None);
            }
            other => return Err(shared.unexpected(other)),
        };

        let mut job = match Job::from_wire(&body) {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(pipeline = %shared.pipeline, server_id, error = %err, "burying undecodable job");
                let buried = conn
                    .call(Command::Bury {
                        id: server_id,
                        priority: shared.options.priority,
                    })
                    .await
                    .map_err(|e| shared.err(e))?;
                if matches!(buried, Response::Buried(_)) {
                    shared.pool.put_back(conn).await;
                }
                return Ok(None);
            }
        };

        let stats = conn
            .call(Command::StatsJob(server_id))
            .await
            .map_err(|e| shared.err(e))?;
        if let Response::Ok(yaml) = stats {
            let reserves = stat_u64(&parse_stats(&yaml), "reserves");
            let reserves = u32::try_from(reserves).unwrap_or(u32::MAX);
            job.observe_attempts(job.attempts().saturating_add(reserves.saturating_sub(1)));
        }

        Ok(Some(Box::new(BeanstalkDelivery {
            id: DeliveryId::generate(),
            server_id,
            job,
            conn: Some(conn),
            shared: Arc::clone(shared),
        })))
    }

    async fn stat(&self) -> Result<BrokerStat, JobsError> {
        let shared = &self.shared;
        let response = shared
            .pool
            .call(Command::StatsTube(shared.pool.tube().to_string()))
            .await
            .map_err(|e| shared.err(e))?;
        match response {
            Response::Ok(yaml) => {
                let stats = parse_stats(&yaml);
                Ok(BrokerStat {
                    active: stat_u64(&stats, "current-jobs-ready"),
                    delayed: stat_u64(&stats, "current-jobs-delayed"),
                    reserved: stat_u64(&stats, "current-jobs-reserved"),
                })
            }
            // tubes exist only while something uses them
            Response::NotFound => Ok(BrokerStat::default()),
            other => Err(shared.unexpected(other)),
        }
    }

    async fn stop(&self) -> Result<(), JobsError> {
        self.shared.pool.clear().await;
        Ok(())
    }
}

struct BeanstalkDelivery<C: Connector> {
    id: DeliveryId,
    server_id: u64,
    job: Job,
    /// The reserving connection; only it may delete / release the job.
    conn: Option<C::Conn>,
    shared: Arc<BeanstalkShared<C>>,
}

impl<C: Connector> BeanstalkDelivery<C> {
    async fn resolve(mut self: Box<Self>, command: Command, ok: Response) -> Result<(), JobsError> {
        let expired = JobsError::HandleExpired {
            delivery: self.id,
            job_id: self.job.id(),
        };
        let Some(mut conn) = self.conn.take() else {
            return Err(expired);
        };

        let response = conn.call(command).await.map_err(|e| self.shared.err(e))?;
        self.shared.pool.put_back(conn).await;
        match response {
            r if r == ok => Ok(()),
            Response::NotFound => Err(expired),
            other => Err(self.shared.unexpected(other)),
        }
    }
}

#[async_trait]
impl<C: Connector> Delivery for BeanstalkDelivery<C> {
    fn id(&self) -> DeliveryId {
        self.id
    }

    fn job(&self) -> &Job {
        &self.job
    }

    async fn ack(self: Box<Self>) -> Result<(), JobsError> {
        let command = Command::Delete(self.server_id);
        self.resolve(command, Response::Deleted).await
    }

    async fn nack(self: Box<Self>, delay: Duration) -> Result<(), JobsError> {
        let command = Command::Release {
            id: self.server_id,
            priority: self.shared.options.priority,
            delay: ceil_secs(delay),
        };
        self.resolve(command, Response::Released).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetryPolicy;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum FakeState {
        Ready,
        Delayed(Instant),
        Reserved { conn: u64, until: Instant },
        Buried,
    }

    struct FakeJob {
        body: Bytes,
        state: FakeState,
        reserves: u64,
        ready_since: u64,
    }

    /// Minimal single-tube beanstalkd.
    #[derive(Default)]
    struct FakeServer {
        jobs: BTreeMap<u64, FakeJob>,
        next_id: u64,
        next_conn: u64,
        ready_seq: u64,
        ttr: Duration,
    }

    impl FakeServer {
        /// Time-driven transitions: delays end, TTRs lapse.
        fn tick(&mut self) {
            let now = Instant::now();
            let mut seq = self.ready_seq;
            for job in self.jobs.values_mut() {
                let due = match job.state {
                    FakeState::Delayed(at) => at <= now,
                    FakeState::Reserved { until, .. } => until <= now,
                    _ => false,
                };
                if due {
                    seq += 1;
                    job.state = FakeState::Ready;
                    job.ready_since = seq;
                }
            }
            self.ready_seq = seq;
        }

        fn count(&self, pred: impl Fn(&FakeState) -> bool) -> usize {
            self.jobs.values().filter(|j| pred(&j.state)).count()
        }
    }

    #[derive(Clone)]
    struct FakeConnector {
        server: Arc<Mutex<FakeServer>>,
    }

    impl FakeConnector {
        fn new() -> Self {
            Self {
                server: Arc::new(Mutex::new(FakeServer {
                    ttr: Duration::from_secs(60),
                    ..FakeServer::default()
                })),
            }
        }
    }

    struct FakeConn {
        id: u64,
        server: Arc<Mutex<FakeServer>>,
    }

    impl Drop for FakeConn {
        fn drop(&mut self) {
            // closing a connection releases its reservations
            let mut server = self.server.lock().unwrap();
            let mut seq = server.ready_seq;
            for job in server.jobs.values_mut() {
                if matches!(job.state, FakeState::Reserved { conn, .. } if conn == self.id) {
                    seq += 1;
                    job.state = FakeState::Ready;
                    job.ready_since = seq;
                }
            }
            server.ready_seq = seq;
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Conn = FakeConn;

        async fn connect(&self) -> Result<FakeConn, TransportError> {
            let mut server = self.server.lock().unwrap();
            server.next_conn += 1;
            Ok(FakeConn {
                id: server.next_conn,
                server: Arc::clone(&self.server),
            })
        }
    }

    #[async_trait]
    impl BeanstalkConnection for FakeConn {
        async fn call(&mut self, command: Command) -> Result<Response, TransportError> {
            let mut server = self.server.lock().unwrap();
            server.tick();
            let now = Instant::now();
            let response = match command {
                Command::Use(tube) => Response::Using(tube),
                Command::Watch(_) => Response::Watching(2),
                Command::Ignore(_) => Response::Watching(1),
                Command::Put { delay, body, .. } => {
                    if body.len() > 65_535 {
                        return Ok(Response::JobTooBig);
                    }
                    server.next_id += 1;
                    server.ready_seq += 1;
                    let id = server.next_id;
                    let state = if delay == 0 {
                        FakeState::Ready
                    } else {
                        FakeState::Delayed(now + Duration::from_secs(u64::from(delay)))
                    };
                    let ready_since = server.ready_seq;
                    server.jobs.insert(
                        id,
                        FakeJob {
                            body,
                            state,
                            reserves: 0,
                            ready_since,
                        },
                    );
                    Response::Inserted(id)
                }
                Command::ReserveWithTimeout(_) => {
                    let ttr = server.ttr;
                    let next = server
                        .jobs
                        .iter_mut()
                        .filter(|(_, j)| j.state == FakeState::Ready)
                        .min_by_key(|(_, j)| j.ready_since);
                    match next {
                        Some((id, job)) => {
                            job.state = FakeState::Reserved {
                                conn: self.id,
                                until: now + ttr,
                            };
                            job.reserves += 1;
                            Response::Reserved {
                                id: *id,
                                body: job.body.clone(),
                            }
                        }
                        None => Response::TimedOut,
                    }
                }
                Command::Delete(id) => {
                    let owned = server.jobs.get(&id).is_some_and(|job| {
                        matches!(job.state, FakeState::Reserved { conn, .. } if conn == self.id)
                    });
                    if owned {
                        server.jobs.remove(&id);
                        Response::Deleted
                    } else {
                        Response::NotFound
                    }
                }
                Command::Release { id, delay, .. } => match server.jobs.get_mut(&id) {
                    Some(job) if matches!(job.state, FakeState::Reserved { conn, .. } if conn == self.id) => {
                        job.state = if delay == 0 {
                            FakeState::Ready
                        } else {
                            FakeState::Delayed(now + Duration::from_secs(u64::from(delay)))
                        };
                        Response::Released
                    }
                    _ => Response::NotFound,
                },
                Command::Bury { id, .. } => match server.jobs.get_mut(&id) {
                    Some(job) => {
                        job.state = FakeState::Buried;
                        Response::Buried(None)
                    }
                    None => Response::NotFound,
                },
                Command::Touch(_) => Response::Touched,
                Command::StatsJob(id) => match server.jobs.get(&id) {
                    Some(job) => Response::Ok(Bytes::from(format!(
                        "---\nid: {id}\ntube: test\nreserves: {}\n",
                        job.reserves
                    ))),
                    None => Response::NotFound,
                },
                Command::StatsTube(tube) => {
                    let ready = server.count(|s| *s == FakeState::Ready);
                    let delayed = server.count(|s| matches!(s, FakeState::Delayed(_)));
                    let reserved = server.count(|s| matches!(s, FakeState::Reserved { .. }));
                    Response::Ok(Bytes::from(format!(
                        "---\nname: {tube}\ncurrent-jobs-ready: {ready}\ncurrent-jobs-delayed: {delayed}\ncurrent-jobs-reserved: {reserved}\n"
                    )))
                }
            };
            Ok(response)
        }
    }

    fn broker(connector: FakeConnector) -> BeanstalkBroker<FakeConnector> {
        BeanstalkBroker::new(PipelineName::new("emails"), BeanstalkOptions::default(), connector)
            .unwrap()
    }

    fn job(payload: &'static [u8]) -> Job {
        Job::new(
            JobId::generate(),
            PipelineName::new("emails"),
            payload,
            RetryPolicy::default(),
            chrono::Utc::now(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn push_reserve_ack() {
        let connector = FakeConnector::new();
        let broker = broker(connector.clone());
        broker.check().await.unwrap();

        let id = broker.push(job(b"a")).await.unwrap();
        let delivery = broker.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(delivery.job().id(), id);
        assert_eq!(delivery.job().attempts(), 0);
        assert_eq!(broker.stat().await.unwrap().reserved, 1);

        delivery.ack().await.unwrap();
        assert!(connector.server.lock().unwrap().jobs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn release_with_delay_and_attempts_from_reserves() {
        let broker = broker(FakeConnector::new());
        broker.push(job(b"a")).await.unwrap();

        let delivery = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        delivery.nack(Duration::from_millis(1_500)).await.unwrap();
        assert_eq!(broker.stat().await.unwrap().delayed, 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(broker.reserve(Duration::ZERO).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let again = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.job().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ttr_lapse_expires_handle() {
        let broker = broker(FakeConnector::new());
        broker.push(job(b"a")).await.unwrap();

        let stale = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(fresh.job().attempts(), 1);

        assert!(matches!(
            stale.ack().await,
            Err(JobsError::HandleExpired { .. })
        ));
        fresh.ack().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_delivery_releases_job() {
        let broker = broker(FakeConnector::new());
        broker.push(job(b"a")).await.unwrap();

        let abandoned = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        drop(abandoned);

        let again = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.job().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_put_keeps_eligible_order() {
        let broker = broker(FakeConnector::new());
        let delayed = job(b"first").with_delay_until(Some(chrono::Utc::now() + chrono::Duration::seconds(1)));
        broker.push(delayed).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        broker.push(job(b"second")).await.unwrap();

        let a = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a.job().payload().as_ref(), b"first");
    }

    #[tokio::test]
    async fn oversized_job_is_invalid() {
        let broker = broker(FakeConnector::new());
        let big: &'static [u8] = Box::leak(vec![b'x'; 70_000].into_boxed_slice());
        assert!(matches!(
            broker.push(job(big)).await,
            Err(JobsError::InvalidJob(_))
        ));
    }

    #[test]
    fn rejects_invalid_tube_name() {
        let result = BeanstalkBroker::new(
            PipelineName::new("emails"),
            BeanstalkOptions {
                tube: Some("has space".into()),
                ..BeanstalkOptions::default()
            },
            FakeConnector::new(),
        );
        assert!(matches!(result, Err(JobsError::Config(_))));
    }
}
