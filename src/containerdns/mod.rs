pub mod docker;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::config::ContainerDnsConfig;
use crate::containerdns::store::{ChainStore, RecordStore};

/// Recursive fallback for questions no container answers.
const DEFAULT_UPSTREAM: &str = "8.8.8.8:53";

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The reply already carries answers; this resolver has nothing
    /// to add.
    #[error("already set")]
    AlreadySet,
    /// This resolver produced answers; stop the chain.
    #[error("break")]
    Break,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
trait Exchanger: Send + Sync {
    async fn exchange(&self, req: &Message, reply: &mut Message) -> Result<(), ResolveError>;
}

/// Answers from the store chain (memory cache, then live engine
/// lookup). Per-question failures log and continue; any answer at
/// all stops the pipeline.
struct InternalExchange {
    stores: Arc<ChainStore>,
}

#[async_trait]
impl Exchanger for InternalExchange {
    async fn exchange(&self, req: &Message, reply: &mut Message) -> Result<(), ResolveError> {
        for query in req.queries() {
            tracing::debug!(
                name = %query.name(),
                rtype = %query.query_type(),
                "resolving dns"
            );

            match self.stores.get(query).await {
                Ok(records) => {
                    reply.add_answers(records);
                }
                Err(err) => {
                    tracing::warn!(
                        name = %query.name(),
                        rtype = %query.query_type(),
                        error = %err,
                        "fetch record failed"
                    );
                }
            }
        }

        if reply.answers().is_empty() {
            Ok(())
        } else {
            Err(ResolveError::Break)
        }
    }
}

/// Forwards the whole question to the upstream recursive resolver,
/// but only when the internal pass produced nothing.
struct ExternalExchange {
    upstream: String,
}

#[async_trait]
impl Exchanger for ExternalExchange {
    async fn exchange(&self, req: &Message, reply: &mut Message) -> Result<(), ResolveError> {
        if !reply.answers().is_empty() {
            return Err(ResolveError::AlreadySet);
        }

        tracing::debug!(upstream = %self.upstream, "exchange with upstream resolver");

        let payload = req.to_vec().context("failed encoding upstream query")?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed binding upstream socket")?;
        socket
            .connect(&self.upstream)
            .await
            .with_context(|| format!("failed connecting to upstream {}", self.upstream))?;
        socket
            .send(&payload)
            .await
            .with_context(|| format!("failed sending to upstream {}", self.upstream))?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| anyhow::anyhow!("upstream {} timed out", self.upstream))?
            .with_context(|| format!("failed receiving from upstream {}", self.upstream))?;

        let response =
            Message::from_vec(&buf[..len]).context("failed parsing upstream response")?;

        reply.add_answers(response.answers().iter().cloned());
        reply.set_response_code(response.response_code());

        Ok(())
    }
}

/// The query pipeline: resolvers in order, stopping at the first
/// non-empty answer or explicit short-circuit; the reply is always
/// produced, even when every resolver came up empty.
pub struct Handler {
    resolvers: Vec<Box<dyn Exchanger>>,
}

impl Handler {
    pub fn new(stores: ChainStore) -> Self {
        Self::with_upstream(stores, DEFAULT_UPSTREAM)
    }

    pub fn with_upstream(stores: ChainStore, upstream: impl Into<String>) -> Self {
        Self {
            resolvers: vec![
                Box::new(InternalExchange {
                    stores: Arc::new(stores),
                }),
                Box::new(ExternalExchange {
                    upstream: upstream.into(),
                }),
            ],
        }
    }

    pub async fn handle(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let req = match Message::from_vec(payload) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(error = %err, "could not parse query");
                return None;
            }
        };

        let mut reply = Message::new();
        reply
            .set_id(req.id())
            .set_message_type(MessageType::Response)
            .set_op_code(req.op_code())
            .set_recursion_desired(req.recursion_desired())
            .set_recursion_available(true)
            .add_queries(req.queries().iter().cloned());

        self.resolve(&req, &mut reply).await;

        match reply.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::error!(error = %err, "could not encode reply");
                None
            }
        }
    }

    async fn resolve(&self, req: &Message, reply: &mut Message) {
        for resolver in &self.resolvers {
            match resolver.exchange(req, reply).await {
                Ok(()) if !reply.answers().is_empty() => break,
                Ok(()) => {}
                Err(ResolveError::AlreadySet) | Err(ResolveError::Break) => break,
                Err(ResolveError::Other(err)) => {
                    tracing::warn!(error = %err, "resolver failed");
                }
            }
        }
    }
}

/// UDP DNS front-end for the handler. The socket is opened with
/// SO_REUSEADDR (and SO_REUSEPORT on Linux) so a restarting daemon
/// can rebind immediately.
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    handler: Arc<Handler>,
}

impl DnsServer {
    pub async fn bind(cfg: &ContainerDnsConfig, handler: Arc<Handler>) -> Result<Self> {
        let addr = listen_addr(&cfg.address)
            .with_context(|| format!("invalid DNS_ADDRESS {}", cfg.address))?;

        let socket = reuse_socket(addr)
            .with_context(|| format!("failed binding dns socket {addr}"))?;
        let socket = UdpSocket::from_std(socket).context("failed registering dns socket")?;

        tracing::info!(address = %cfg.address, "dns server listening");

        Ok(Self {
            socket: Arc::new(socket),
            handler,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Into::into)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("dns server stopped");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(error = %err, "dns receive failed");
                            continue;
                        }
                    };

                    let payload = buf[..len].to_vec();
                    let handler = Arc::clone(&self.handler);
                    let socket = Arc::clone(&self.socket);
                    tokio::spawn(async move {
                        if let Some(reply) = handler.handle(&payload).await {
                            if let Err(err) = socket.send_to(&reply, peer).await {
                                tracing::error!(peer = %peer, error = %err, "could not write reply");
                            }
                        }
                    });
                }
            }
        }
    }
}

fn listen_addr(address: &str) -> Result<SocketAddr> {
    if let Some(port) = address.strip_prefix(':') {
        let port: u16 = port.parse().context("invalid listen port")?;
        return Ok(SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port));
    }

    address.parse().map_err(Into::into)
}

fn reuse_socket(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(target_os = "linux")]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}
