//! Getting from nothing to one connected stream.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use protocol::Command;
use tokio::net::{TcpListener, TcpStream};

use crate::transport::{ConnectionHandle, ConnectionTasks, Dispatch};
use crate::worker::Worker;
use crate::{EngineConfig, EngineError};

/// Listens on a port and takes the first peer that connects.
#[derive(Debug)]
pub(crate) struct Acceptor {
    listener: std::net::TcpListener,
    port: u16,
}

impl Acceptor {
    /// Bind the listening socket straight away, so a busy port is reported by
    /// the start call rather than by the worker.
    ///
    /// Listens on every IPv4 interface. Port 0 picks a free port.
    pub(crate) fn bind(port: u16) -> Result<Self, EngineError> {
        let listener = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|source| EngineError::Bind { port, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| EngineError::Bind { port, source })?;

        tracing::debug!(port, "listening");
        Ok(Self { listener, port })
    }

    #[cfg(test)]
    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn accept(self, retry_delay: Duration) -> Result<TcpStream, EngineError> {
        let port = self.port;
        let listener = TcpListener::from_std(self.listener)
            .map_err(|source| EngineError::Bind { port, source })?;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "accepted connection");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed, retrying");
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
}

/// Resolves a host and keeps trying to connect to it.
#[derive(Debug, Clone)]
pub(crate) struct Connector {
    host: String,
    service: String,
    port: u16,
}

impl Connector {
    pub(crate) fn new(
        host: impl Into<String>,
        service: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let service = service.into();
        let port = service
            .trim()
            .parse()
            .map_err(|_| EngineError::InvalidService(service.clone()))?;
        Ok(Self {
            host: host.into(),
            service,
            port,
        })
    }

    #[cfg(test)]
    fn port(&self) -> u16 {
        self.port
    }

    /// Only the first resolved endpoint is ever tried. A failed attempt is
    /// retried against that same endpoint after `retry_delay`.
    async fn connect(self, retry_delay: Duration) -> Result<TcpStream, EngineError> {
        let endpoint = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|source| EngineError::Resolve {
                host: self.host.clone(),
                service: self.service.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| EngineError::NoEndpoints {
                host: self.host.clone(),
            })?;
        tracing::debug!(host = %self.host, %endpoint, "resolved");

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match TcpStream::connect(endpoint).await {
                Ok(stream) => {
                    tracing::debug!(%endpoint, attempt, "connected");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(%endpoint, attempt, error = %e, "connect failed, retrying");
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
}

/// How a connection gets made.
#[derive(Debug)]
pub(crate) enum Strategy {
    Acceptor(Acceptor),
    Connector(Connector),
}

impl Strategy {
    /// Spawn the worker that establishes and then drives the connection.
    ///
    /// With a `timeout` this blocks until the stream is connected, failing
    /// with [`EngineError::ConnectTimeout`] once it expires. Without one it
    /// returns as soon as the worker is running.
    pub(crate) fn start(
        self,
        connection: ConnectionHandle,
        tasks: ConnectionTasks,
        dispatch: Arc<dyn Dispatch>,
        greeting: Option<Command>,
        config: &EngineConfig,
        timeout: Option<Duration>,
    ) -> Result<Worker, EngineError> {
        let worker = Worker::spawn(self, connection, tasks, dispatch, greeting, config.clone())?;

        if let Some(timeout) = timeout {
            // dropping the worker cancels and joins it
            worker.wait_established(timeout)?;
        }
        Ok(worker)
    }

    pub(crate) async fn establish(self, retry_delay: Duration) -> Result<TcpStream, EngineError> {
        let stream = match self {
            Strategy::Acceptor(acceptor) => acceptor.accept(retry_delay).await?,
            Strategy::Connector(connector) => connector.connect(retry_delay).await?,
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "could not disable nagle");
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_must_be_a_port() {
        assert!(matches!(
            Connector::new("localhost", "http"),
            Err(EngineError::InvalidService(s)) if s == "http"
        ));
        assert_eq!(Connector::new("localhost", "51123").unwrap().port(), 51123);
    }

    #[test]
    fn binding_a_busy_port_fails() {
        let first = Acceptor::bind(0).unwrap();
        let port = first.local_addr().unwrap().port();

        assert!(matches!(
            Acceptor::bind(port),
            Err(EngineError::Bind { port: p, .. }) if p == port
        ));
    }

    #[tokio::test]
    async fn acceptor_takes_ipv4_peers() {
        let acceptor = Acceptor::bind(0).unwrap();
        let addr = acceptor.local_addr().unwrap();
        assert!(addr.is_ipv4());
        assert!(addr.ip().is_unspecified());

        let accepting = tokio::spawn(acceptor.accept(Duration::from_millis(20)));
        let _client = TcpStream::connect((Ipv4Addr::LOCALHOST, addr.port()))
            .await
            .unwrap();

        let stream = accepting.await.unwrap().unwrap();
        assert!(stream.peer_addr().unwrap().ip().is_loopback());
    }

    #[tokio::test]
    async fn connector_retries_until_the_listener_appears() {
        let port = {
            let vacant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            vacant.local_addr().unwrap().port()
        };
        let connector = Connector::new("127.0.0.1", port.to_string()).unwrap();
        let connecting = tokio::spawn(connector.connect(Duration::from_millis(20)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let (_accepted, _) = listener.accept().await.unwrap();

        let stream = connecting.await.unwrap().unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }
}
