use crate::handler::RequestHandler;
use crate::protocol::{binary, http, messages, Request, Response, WorkerPool};
use crate::telemetry::ServerMetrics;
use anyhow::Result;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Binary,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Binary => f.write_str("binary"),
            Protocol::Http => f.write_str("http"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        protocol: Protocol,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// State shared by every connection on both listeners.
pub struct ServiceContext {
    handler: Arc<dyn RequestHandler>,
    pool: WorkerPool,
    metrics: Arc<ServerMetrics>,
}

impl ServiceContext {
    pub async fn dispatch(&self, protocol: Protocol, request: Request) -> Result<Response> {
        self.metrics.increment_requests(protocol);

        let handler = self.handler.clone();
        let response = self
            .pool
            .run(move || messages::dispatch(handler.as_ref(), request))
            .await?;

        if response.is_error() {
            self.metrics.increment_failures();
        }
        Ok(response)
    }
}

pub struct DualProtocolServer;

impl DualProtocolServer {
    /// Binds both listeners, then starts an accept loop for each.
    ///
    /// Nothing is accepted unless both binds succeed.
    pub async fn start(
        handler: Arc<dyn RequestHandler>,
        pool_size: usize,
        binary_addr: SocketAddr,
        http_addr: SocketAddr,
    ) -> Result<ServerPair, TransportError> {
        let binary_listener = bind(Protocol::Binary, binary_addr).await?;
        let http_listener = bind(Protocol::Http, http_addr).await?;

        let binary_addr = local_addr(Protocol::Binary, &binary_listener, binary_addr)?;
        let http_addr = local_addr(Protocol::Http, &http_listener, http_addr)?;

        let pool = WorkerPool::new(pool_size);
        let metrics = Arc::new(ServerMetrics::new());
        let ctx = Arc::new(ServiceContext {
            handler,
            pool: pool.clone(),
            metrics: metrics.clone(),
        });

        let binary_task = tokio::spawn(accept_loop(Protocol::Binary, binary_listener, ctx.clone()));
        let http_task = tokio::spawn(accept_loop(Protocol::Http, http_listener, ctx));

        Ok(ServerPair {
            binary_addr,
            http_addr,
            pool,
            metrics,
            binary_task,
            http_task,
        })
    }
}

pub struct ServerPair {
    binary_addr: SocketAddr,
    http_addr: SocketAddr,
    pool: WorkerPool,
    metrics: Arc<ServerMetrics>,
    binary_task: JoinHandle<()>,
    http_task: JoinHandle<()>,
}

impl ServerPair {
    pub fn local_addrs(&self) -> (SocketAddr, SocketAddr) {
        (self.binary_addr, self.http_addr)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Blocks until both accept loops have ended.
    pub async fn wait(self) {
        let (binary, http) = tokio::join!(self.binary_task, self.http_task);
        for (protocol, result) in [(Protocol::Binary, binary), (Protocol::Http, http)] {
            if let Err(e) = result {
                tracing::error!("{} listener task failed: {}", protocol, e);
            }
        }
    }
}

async fn bind(protocol: Protocol, addr: SocketAddr) -> Result<TcpListener, TransportError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| TransportError::Bind {
            protocol,
            addr,
            source,
        })
}

fn local_addr(
    protocol: Protocol,
    listener: &TcpListener,
    requested: SocketAddr,
) -> Result<SocketAddr, TransportError> {
    listener.local_addr().map_err(|source| TransportError::Bind {
        protocol,
        addr: requested,
        source,
    })
}

async fn accept_loop(protocol: Protocol, listener: TcpListener, ctx: Arc<ServiceContext>) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("{} server listening on {}", protocol, addr);
    }

    let listener = Arc::new(listener);
    serve_connections(protocol, ctx, move || {
        let listener = listener.clone();
        async move { listener.accept().await }
    })
    .await
}

/// Serves every connection `accept` yields until it returns an error.
async fn serve_connections<A, F>(protocol: Protocol, ctx: Arc<ServiceContext>, mut accept: A)
where
    A: FnMut() -> F,
    F: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        let (stream, peer_addr) = match accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!("{} listener stopped: {}", protocol, e);
                break;
            }
        };
        tracing::debug!("New {} connection from {}", protocol, peer_addr);
        ctx.metrics.increment_connections();

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = match protocol {
                Protocol::Binary => binary::handle_connection(stream, ctx).await,
                Protocol::Http => http::handle_connection(stream, ctx).await,
            };
            if let Err(e) = result {
                tracing::debug!("{} connection from {} closed: {:#}", protocol, peer_addr, e);
            }
        });
    }
}
