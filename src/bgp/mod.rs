use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bgpkit_parser::bgp::parse_bgp_message;
use bgpkit_parser::models::{
    AsPath, AsnLength, AttributeValue, Attributes, BgpMessage, BgpOpenMessage, BgpUpdateMessage,
    NetworkPrefix, Origin,
};
use bytes::Bytes;
use ipnet::{IpNet, Ipv4Net};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::broadcast::Broadcaster;
use crate::config::{AttributesConfig, BgpConfig};

/// Both sides of every session; this is a one-way iBGP announcer.
pub const LOCAL_AS: u32 = 65000;
pub const REMOTE_AS: u32 = 65000;

const HOLD_TIME: u16 = 90;

/// Fixed per-message overhead: 16 marker bytes, a two-byte length,
/// and the type octet.
const FRAME_HEADER_LEN: usize = 19;
const MAX_FRAME_LEN: usize = 4096;
const MESSAGE_TYPE_UPDATE: u8 = 2;

/// Frame-level failures on a peer session. Anything here tears the
/// session down; the peer reconnects and starts over.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame marker is not all-ones")]
    BadMarker,
    #[error("frame length {0} outside 19..=4096")]
    BadLength(usize),
    #[error("encoded message shorter than the fixed header")]
    TruncatedFrame,
    #[error("undecodable message: {0}")]
    Undecodable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Grace period between session establishment and the first frame;
/// peer implementations commonly need a short settle.
const SETTLE: Duration = Duration::from_secs(1);

/// Capability to hand raw UPDATE frames to one peer's session task.
/// The queue is unbounded: the initial push is enqueued while the
/// session task is still inside `on_established`, and backpressure
/// for a slow peer is the TCP socket itself.
#[derive(Clone, Debug)]
pub struct UpdateWriter {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl UpdateWriter {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn write_update(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| anyhow!("peer session closed"))
    }
}

/// The session-plugin contract: the server drives the FSM and calls
/// out at the state transitions an announcer cares about. Inbound
/// UPDATEs are never surfaced; this system receives nothing.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Called once the peer's OPEN arrived; returning an error
    /// rejects the session.
    async fn on_open(&self, _peer: IpAddr) -> Result<()> {
        Ok(())
    }

    async fn on_established(&self, peer: IpAddr, writer: UpdateWriter);

    async fn on_close(&self, peer: IpAddr);
}

/// Adapter between the session server and the broadcaster: register
/// the writer, give the peer a moment to settle, then signal an
/// empty table end with one End-of-RIB marker.
pub struct AnnouncerHooks {
    broadcaster: Broadcaster,
}

impl AnnouncerHooks {
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self { broadcaster }
    }
}

#[async_trait]
impl SessionHooks for AnnouncerHooks {
    async fn on_established(&self, peer: IpAddr, writer: UpdateWriter) {
        self.broadcaster.add_peer(peer.to_string(), writer.clone()).await;

        tokio::time::sleep(SETTLE).await;

        if let Err(err) = writer.write_update(end_of_rib_frame()) {
            tracing::warn!(peer = %peer, error = %err, "could not write end-of-rib");
        }
    }

    async fn on_close(&self, peer: IpAddr) {
        self.broadcaster.del_peer(peer.to_string()).await;
    }
}

/// Passive BGP listener: accepts sessions from the configured client
/// addresses only, runs the OPEN/KEEPALIVE handshake, then relays
/// queued UPDATE frames while keeping the timers honest.
pub struct BgpServer {
    cfg: BgpConfig,
    router_id: Ipv4Addr,
    clients: HashSet<IpAddr>,
    hooks: Arc<dyn SessionHooks>,
}

impl BgpServer {
    pub fn new(cfg: BgpConfig, hooks: Arc<dyn SessionHooks>) -> Result<Arc<Self>> {
        let router_id = cfg
            .router_id
            .parse::<Ipv4Addr>()
            .context("BGP_ROUTER_ID must be IPv4")?;

        let clients = cfg
            .clients
            .iter()
            .map(|client| {
                client
                    .parse::<IpAddr>()
                    .with_context(|| format!("invalid BGP client address {client}"))
            })
            .collect::<Result<HashSet<_>>>()?;

        for client in &clients {
            tracing::info!(peer = %client, router_id = %cfg.router_id, "adding peer");
        }

        Ok(Arc::new(Self {
            cfg,
            router_id,
            clients,
            hooks,
        }))
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Binds the listener up front so an unusable address is a
    /// startup failure, not a background one.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listen = listen_addr(&self.cfg.address)
            .with_context(|| format!("invalid BGP_ADDRESS {}", self.cfg.address))?;
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed binding bgp listener {listen}"))?;

        tracing::info!(address = %self.cfg.address, "bgp server listening");

        Ok(listener)
    }

    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: broadcast::Sender<()>,
    ) -> Result<()> {
        let mut stop = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    tracing::info!("bgp server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(error = %err, "bgp accept failed");
                            continue;
                        }
                    };

                    if !self.clients.contains(&remote.ip()) {
                        tracing::warn!(peer = %remote, "rejecting unconfigured peer");
                        continue;
                    }

                    let server = Arc::clone(&self);
                    let session_stop = shutdown.subscribe();
                    tokio::spawn(async move {
                        let peer = remote.ip();
                        if let Err(err) = server.run_session(peer, stream, session_stop).await {
                            tracing::info!(peer = %peer, error = %err, "bgp session ended");
                        }
                    });
                }
            }
        }
    }

    async fn run_session(
        &self,
        peer: IpAddr,
        mut stream: TcpStream,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let open = BgpMessage::Open(BgpOpenMessage {
            version: 4,
            asn: LOCAL_AS.into(),
            hold_time: HOLD_TIME,
            sender_ip: self.router_id,
            extended_length: false,
            opt_params: vec![],
        });
        write_bgp_message(&mut stream, &open).await?;

        let incoming = read_bgp_message(&mut stream).await?;
        if !matches!(incoming, BgpMessage::Open(_)) {
            return Err(anyhow!("expected OPEN from peer"));
        }
        self.hooks.on_open(peer).await?;

        write_bgp_message(&mut stream, &BgpMessage::KeepAlive).await?;
        let incoming = read_bgp_message(&mut stream).await?;
        if !matches!(incoming, BgpMessage::KeepAlive) {
            return Err(anyhow!("expected KEEPALIVE from peer after OPEN"));
        }

        tracing::info!(peer = %peer, "peer established");

        let (writer, mut frames) = UpdateWriter::pair();
        self.hooks.on_established(peer, writer).await;

        let (read_half, mut write_half) = stream.into_split();
        let (in_tx, mut inbound) = mpsc::channel(16);
        let reader = tokio::spawn(read_loop(read_half, in_tx));

        let hold = Duration::from_secs(u64::from(HOLD_TIME));
        let keepalive_interval = Duration::from_secs((u64::from(HOLD_TIME) / 3).max(1));
        let mut next_keepalive = Instant::now() + keepalive_interval;
        let mut hold_deadline = Instant::now() + hold;

        let keepalive = encode_frame(&BgpMessage::KeepAlive)?;

        let result = loop {
            tokio::select! {
                _ = shutdown.recv() => break Ok(()),
                Some(frame) = frames.recv() => {
                    if let Err(err) = write_half.write_all(&frame).await {
                        break Err(err.into());
                    }
                }
                _ = tokio::time::sleep_until(next_keepalive) => {
                    if let Err(err) = write_half.write_all(&keepalive).await {
                        break Err(err.into());
                    }
                    next_keepalive = Instant::now() + keepalive_interval;
                }
                _ = tokio::time::sleep_until(hold_deadline) => {
                    break Err(anyhow!("hold timer expired"));
                }
                msg = inbound.recv() => match msg {
                    None => break Err(anyhow!("peer closed the session")),
                    Some(BgpMessage::Notification(_)) => {
                        break Err(anyhow!("received NOTIFICATION from peer"));
                    }
                    // KEEPALIVE and (ignored) UPDATE both refresh the
                    // hold timer.
                    Some(_) => hold_deadline = Instant::now() + hold,
                }
            }
        };

        reader.abort();
        self.hooks.on_close(peer).await;

        result
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, out: mpsc::Sender<BgpMessage>) {
    loop {
        match read_bgp_message(&mut read_half).await {
            Ok(msg) => {
                if out.send(msg).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "bgp read failed");
                return;
            }
        }
    }
}

fn listen_addr(address: &str) -> Result<SocketAddr> {
    if let Some(port) = address.strip_prefix(':') {
        let port: u16 = port.parse().context("invalid listen port")?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    address.parse().map_err(Into::into)
}

/// Serialises one UPDATE frame: the shared announcer attribute set,
/// the given withdrawals, and the given /32 NLRI batch.
pub fn build_update_frame(
    cfg: &AttributesConfig,
    withdrawals: &[Ipv4Addr],
    nlri: &[Ipv4Addr],
) -> Result<Bytes> {
    let next_hop = cfg
        .next_hop
        .parse::<Ipv4Addr>()
        .context("BGP_ATTRIBUTES_NEXT_HOP must be IPv4")?;

    let mut attrs = Attributes::default();
    attrs.add_attr(AttributeValue::Origin(Origin::IGP).into());
    attrs.add_attr(
        AttributeValue::AsPath {
            path: AsPath::from_sequence(Vec::<u32>::new()),
            is_as4: false,
        }
        .into(),
    );
    attrs.add_attr(AttributeValue::NextHop(IpAddr::V4(next_hop)).into());
    attrs.add_attr(AttributeValue::LocalPreference(cfg.local_pref).into());

    let msg = BgpMessage::Update(BgpUpdateMessage {
        withdrawn_prefixes: withdrawals.iter().map(|addr| host_prefix(*addr)).collect(),
        attributes: attrs,
        announced_prefixes: nlri.iter().map(|addr| host_prefix(*addr)).collect(),
    });

    Ok(encode_frame(&msg)?)
}

fn host_prefix(addr: Ipv4Addr) -> NetworkPrefix {
    NetworkPrefix::new(IpNet::V4(Ipv4Net::from(addr)), None)
}

/// The End-of-RIB marker: an UPDATE whose body is four zero bytes.
pub fn end_of_rib_frame() -> Bytes {
    let mut frame = vec![0xffu8; 16];
    frame.extend_from_slice(&(FRAME_HEADER_LEN as u16 + 4).to_be_bytes());
    frame.push(MESSAGE_TYPE_UPDATE);
    frame.extend_from_slice(&[0, 0, 0, 0]);
    Bytes::from(frame)
}

pub fn encode_frame(msg: &BgpMessage) -> Result<Bytes, WireError> {
    let mut frame = msg.encode(AsnLength::Bits32).to_vec();
    if frame.len() < FRAME_HEADER_LEN {
        return Err(WireError::TruncatedFrame);
    }

    // bgpkit-parser leaves the marker zeroed; RFC 4271 wants all
    // ones on sessions without authentication.
    frame[..16].fill(0xff);

    Ok(Bytes::from(frame))
}

pub async fn write_bgp_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    msg: &BgpMessage,
) -> Result<(), WireError> {
    stream.write_all(&encode_frame(msg)?).await?;
    Ok(())
}

pub async fn read_bgp_message<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<BgpMessage, WireError> {
    let mut fixed = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut fixed).await?;

    if fixed[..16].iter().any(|&octet| octet != 0xff) {
        return Err(WireError::BadMarker);
    }

    let total = usize::from(u16::from_be_bytes([fixed[16], fixed[17]]));
    if !(FRAME_HEADER_LEN..=MAX_FRAME_LEN).contains(&total) {
        return Err(WireError::BadLength(total));
    }

    let mut frame = vec![0u8; total];
    frame[..FRAME_HEADER_LEN].copy_from_slice(&fixed);
    stream.read_exact(&mut frame[FRAME_HEADER_LEN..]).await?;

    decode_frame(frame)
}

/// bgpkit-parser needs the AS_PATH octet width up front, but a
/// passive listener learns it only from the peer's OPEN, which this
/// server does not inspect. Inbound traffic is keepalives and the
/// odd UPDATE that gets discarded anyway, so try the four-octet
/// width and fall back to the two-octet one.
fn decode_frame(frame: Vec<u8>) -> Result<BgpMessage, WireError> {
    let mut wide = Bytes::from(frame.clone());
    if let Ok(msg) = parse_bgp_message(&mut wide, false, &AsnLength::Bits32) {
        return Ok(msg);
    }

    let mut narrow = Bytes::from(frame);
    parse_bgp_message(&mut narrow, false, &AsnLength::Bits16)
        .map_err(|err| WireError::Undecodable(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_of_rib_is_a_23_byte_update() {
        let frame = end_of_rib_frame();
        assert_eq!(frame.len(), 23);
        assert_eq!(&frame[0..16], &[0xff; 16]);
        assert_eq!(frame[18], 2);
        assert_eq!(&frame[19..], &[0, 0, 0, 0]);

        let mut raw = frame.clone();
        let parsed = parse_bgp_message(&mut raw, false, &AsnLength::Bits32)
            .expect("end-of-rib should parse");
        assert!(matches!(parsed, BgpMessage::Update(_)));
    }

    #[test]
    fn update_frame_round_trips_prefixes() {
        let cfg = AttributesConfig::default();
        let withdraw = Ipv4Addr::new(198, 51, 100, 1);
        let announce = Ipv4Addr::new(198, 51, 100, 2);

        let frame =
            build_update_frame(&cfg, &[withdraw], &[announce]).expect("frame should build");

        let mut raw = frame;
        let parsed = parse_bgp_message(&mut raw, false, &AsnLength::Bits32)
            .expect("frame should parse");
        let BgpMessage::Update(update) = parsed else {
            panic!("expected UPDATE");
        };

        assert_eq!(update.withdrawn_prefixes.len(), 1);
        assert_eq!(
            update.withdrawn_prefixes[0].prefix,
            IpNet::V4(Ipv4Net::from(withdraw))
        );
        assert_eq!(update.announced_prefixes.len(), 1);
        assert_eq!(
            update.announced_prefixes[0].prefix,
            IpNet::V4(Ipv4Net::from(announce))
        );
    }

    #[tokio::test]
    async fn keepalive_frame_round_trips() {
        let frame = encode_frame(&BgpMessage::KeepAlive).expect("keepalive should encode");
        let mut reader = &frame[..];
        let msg = read_bgp_message(&mut reader)
            .await
            .expect("keepalive should decode");
        assert!(matches!(msg, BgpMessage::KeepAlive));
    }

    #[tokio::test]
    async fn read_rejects_bad_marker_and_length() {
        // Zeroed marker.
        let mut bogus = vec![0u8; FRAME_HEADER_LEN];
        bogus[16..18].copy_from_slice(&(FRAME_HEADER_LEN as u16).to_be_bytes());
        let mut reader = &bogus[..];
        assert!(matches!(
            read_bgp_message(&mut reader).await,
            Err(WireError::BadMarker)
        ));

        // Valid marker, absurd length field.
        let mut frame = end_of_rib_frame().to_vec();
        frame[16] = 0xff;
        frame[17] = 0xff;
        let mut reader = &frame[..];
        assert!(matches!(
            read_bgp_message(&mut reader).await,
            Err(WireError::BadLength(_))
        ));
    }

    #[test]
    fn listen_addr_accepts_bare_port_form() {
        let addr = listen_addr(":51179").expect("bare port should parse");
        assert_eq!(addr.port(), 51179);
        assert!(addr.ip().is_unspecified());

        assert!(listen_addr("not-an-address").is_err());
    }
}
