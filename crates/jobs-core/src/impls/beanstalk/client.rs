//! beanstalkd connections and a small idle pool.
//!
//! A job reserved on a connection can only be deleted or released from that
//! same connection, so a delivery takes its connection out of the pool and
//! hands it back when resolved. Closing a connection releases whatever it
//! still holds reserved.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use super::protocol::{BeanstalkCodec, Command, ProtocolError, Response};
use crate::impls::transport::TransportError;

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(io) => TransportError::Io(io),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

/// One request / response exchange at a time.
#[async_trait]
pub trait BeanstalkConnection: Send + 'static {
    async fn call(&mut self, command: Command) -> Result<Response, TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: BeanstalkConnection;

    async fn connect(&self) -> Result<Self::Conn, TransportError>;
}

pub struct TcpConnection {
    framed: Framed<TcpStream, BeanstalkCodec>,
}

#[async_trait]
impl BeanstalkConnection for TcpConnection {
    async fn call(&mut self, command: Command) -> Result<Response, TransportError> {
        self.framed.send(command).await?;
        match self.framed.next().await {
            Some(response) => Ok(response?),
            None => Err(TransportError::connection("connection closed by server")),
        }
    }
}

pub struct TcpConnector {
    addr: String,
    timeout: Duration,
    codec: BeanstalkCodec,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            codec: BeanstalkCodec::default(),
        }
    }

    /// Largest response body accepted from the server.
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.codec = BeanstalkCodec::new(max_body);
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Conn = TcpConnection;

    async fn connect(&self) -> Result<TcpConnection, TransportError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                TransportError::connection(format!("connect to {} timed out", self.addr))
            })??;
        stream.set_nodelay(true)?;
        tracing::debug!(addr = %self.addr, "beanstalk connection opened");
        Ok(TcpConnection {
            framed: Framed::new(stream, self.codec),
        })
    }
}

/// Connections bound to one tube (`use` + `watch`, `default` ignored).
pub struct Pool<C: Connector> {
    connector: C,
    tube: String,
    idle: Mutex<Vec<C::Conn>>,
    max_idle: usize,
}

impl<C: Connector> Pool<C> {
    pub fn new(connector: C, tube: impl Into<String>, max_idle: usize) -> Self {
        Self {
            connector,
            tube: tube.into(),
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    pub fn tube(&self) -> &str {
        &self.tube
    }

    pub async fn acquire(&self) -> Result<C::Conn, TransportError> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }

        let mut conn = self.connector.connect().await?;
        expect(
            conn.call(Command::Use(self.tube.clone())).await?,
            |r| matches!(r, Response::Using(_)),
        )?;
        expect(
            conn.call(Command::Watch(self.tube.clone())).await?,
            |r| matches!(r, Response::Watching(_)),
        )?;
        if self.tube != "default" {
            expect(
                conn.call(Command::Ignore("default".into())).await?,
                |r| matches!(r, Response::Watching(_)),
            )?;
        }
        Ok(conn)
    }

    /// Return a healthy connection. Connections that failed mid-call must be
    /// dropped instead.
    pub async fn put_back(&self, conn: C::Conn) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    pub async fn clear(&self) {
        self.idle.lock().await.clear();
    }

    /// Acquire, run one command, put the connection back on success.
    pub async fn call(&self, command: Command) -> Result<Response, TransportError> {
        let mut conn = self.acquire().await?;
        let response = conn.call(command).await?;
        self.put_back(conn).await;
        Ok(response)
    }
}

fn expect(response: Response, ok: impl Fn(&Response) -> bool) -> Result<(), TransportError> {
    if ok(&response) {
        Ok(())
    } else {
        Err(TransportError::Protocol(format!("unexpected response {response:?}")))
    }
}
