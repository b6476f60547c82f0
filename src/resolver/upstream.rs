use std::net::Ipv4Addr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// One upstream answer: every A-record address plus the minimum TTL
/// across them.
#[derive(Debug, Clone)]
pub struct Answer {
    pub addresses: Vec<Ipv4Addr>,
    pub min_ttl: u32,
}

/// Seam over the upstream exchange so the tick machinery can be
/// driven by a scripted resolver in tests.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Performs a single A-record exchange with `server`, bounded by
    /// the caller's deadline.
    async fn query_a(&self, server: &str, fqdn: &str, deadline: Instant) -> Result<Answer>;
}

/// Production upstream: one dedicated UDP socket per query, so
/// concurrent domain tasks cannot steal each other's responses.
pub struct UdpUpstream;

#[async_trait]
impl Upstream for UdpUpstream {
    async fn query_a(&self, server: &str, fqdn: &str, deadline: Instant) -> Result<Answer> {
        tokio::time::timeout_at(deadline, exchange(server, fqdn))
            .await
            .map_err(|_| anyhow!("query to {server} for {fqdn} timed out"))?
    }
}

async fn exchange(server: &str, fqdn: &str) -> Result<Answer> {
    let name = Name::from_ascii(fqdn).with_context(|| format!("invalid domain name {fqdn}"))?;

    let mut request = Message::new();
    request
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));

    let payload = request.to_vec().context("failed encoding DNS query")?;

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed binding query socket")?;
    socket
        .send_to(&payload, server)
        .await
        .with_context(|| format!("failed sending query to {server}"))?;

    // 4096 bytes covers EDNS-extended responses.
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, _) = socket
            .recv_from(&mut buf)
            .await
            .with_context(|| format!("failed receiving answer from {server}"))?;

        let response = match Message::from_vec(&buf[..len]) {
            Ok(msg) => msg,
            Err(_) => continue,
        };
        if response.id() != request.id() {
            continue;
        }

        let mut addresses = Vec::new();
        let mut min_ttl: Option<u32> = None;
        for record in response.answers() {
            if let Some(RData::A(a)) = record.data() {
                addresses.push(a.0);
                min_ttl = Some(min_ttl.map_or(record.ttl(), |cur| cur.min(record.ttl())));
            }
        }

        return Ok(Answer {
            addresses,
            min_ttl: min_ttl.unwrap_or(0),
        });
    }
}
