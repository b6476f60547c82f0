use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};

use crate::bgp::{build_update_frame, end_of_rib_frame, UpdateWriter};
use crate::config::AttributesConfig;
use crate::types::UpdateMessage;

const QUEUE_CAPACITY: usize = 10;

/// Upper bound on NLRI prefixes per UPDATE frame; a larger table is
/// split across frames.
const NLRI_BATCH: usize = 1000;

enum PeerAction {
    Add { peer: String, writer: UpdateWriter },
    Remove { peer: String },
}

/// Handle feeding the broadcaster's serving loop. Cheap to clone;
/// all senders funnel into the single task that owns the route set
/// and the peer table.
#[derive(Clone)]
pub struct Broadcaster {
    act: mpsc::Sender<PeerAction>,
    out: mpsc::Sender<UpdateMessage>,
    closed: Arc<AtomicBool>,
}

impl Broadcaster {
    pub fn new(cfg: AttributesConfig) -> (Self, Serve) {
        let (act_tx, act_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(QUEUE_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        let handle = Self {
            act: act_tx,
            out: out_tx,
            closed: Arc::clone(&closed),
        };
        let serve = Serve {
            cfg,
            act: act_rx,
            out: out_rx,
            closed,
        };

        (handle, serve)
    }

    pub async fn add_peer(&self, peer: String, writer: UpdateWriter) {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(peer = %peer, "could not send add peer");
            return;
        }

        let _ = self.act.send(PeerAction::Add { peer, writer }).await;
    }

    pub async fn del_peer(&self, peer: String) {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(peer = %peer, "could not send remove peer");
            return;
        }

        let _ = self.act.send(PeerAction::Remove { peer }).await;
    }

    pub async fn broadcast(&self, msg: UpdateMessage) {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!("could not broadcast, broadcaster closed");
            return;
        }

        let _ = self.out.send(msg).await;
    }
}

/// The serving half: a single task exclusively owning the announced
/// route set and the peer table, so no mutation ever needs a lock.
pub struct Serve {
    cfg: AttributesConfig,
    act: mpsc::Receiver<PeerAction>,
    out: mpsc::Receiver<UpdateMessage>,
    closed: Arc<AtomicBool>,
}

impl Serve {
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut list: HashSet<Ipv4Addr> = HashSet::new();
        let mut peers: HashMap<String, UpdateWriter> = HashMap::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("broadcaster stopped");
                    self.closed.store(true, Ordering::Release);
                    self.act.close();
                    self.out.close();
                    return Ok(());
                }
                Some(action) = self.act.recv() => match action {
                    PeerAction::Add { peer, writer } => {
                        let initial = UpdateMessage {
                            to_update: list.iter().copied().collect(),
                            to_remove: Vec::new(),
                        };

                        match send_tables(&self.cfg, &writer, &initial) {
                            Ok(()) => tracing::info!(
                                peer = %peer,
                                updates = initial.to_update.len(),
                                "send initial table"
                            ),
                            Err(err) => tracing::info!(
                                peer = %peer,
                                error = %err,
                                "could not send initial table"
                            ),
                        }

                        peers.insert(peer, writer);
                    }
                    PeerAction::Remove { peer } => {
                        peers.remove(&peer);
                    }
                },
                Some(msg) = self.out.recv() => {
                    if msg.is_empty() {
                        continue;
                    }

                    for addr in &msg.to_remove {
                        list.remove(addr);
                    }
                    list.extend(msg.to_update.iter().copied());

                    for (peer, writer) in &peers {
                        match send_tables(&self.cfg, writer, &msg) {
                            Ok(()) => tracing::info!(
                                peer = %peer,
                                updates = msg.to_update.len(),
                                removes = msg.to_remove.len(),
                                "send update message"
                            ),
                            // The session notices the dead socket on
                            // its own and deregisters via on_close.
                            Err(err) => tracing::info!(
                                peer = %peer,
                                error = %err,
                                "could not send update message"
                            ),
                        }
                    }
                }
                else => return Ok(()),
            }
        }
    }
}

/// Serialises one delta as UPDATE frames: withdrawals ride the first
/// frame only, NLRI is split into batches, and every frame is
/// followed by an End-of-RIB marker.
fn send_tables(cfg: &AttributesConfig, writer: &UpdateWriter, msg: &UpdateMessage) -> Result<()> {
    let mut batches = msg.to_update.chunks(NLRI_BATCH);

    let first = batches.next().unwrap_or(&[]);
    writer.write_update(build_update_frame(cfg, &msg.to_remove, first)?)?;
    writer.write_update(end_of_rib_frame())?;

    for batch in batches {
        writer.write_update(build_update_frame(cfg, &[], batch)?)?;
        writer.write_update(end_of_rib_frame())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgpkit_parser::bgp::parse_bgp_message;
    use bgpkit_parser::models::{AsnLength, BgpMessage};
    use bytes::Bytes;
    use std::time::Duration;

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(203, 0, 113, last)
    }

    fn parse(frame: &Bytes) -> BgpMessage {
        let mut raw = frame.clone();
        parse_bgp_message(&mut raw, false, &AsnLength::Bits32).expect("frame should parse")
    }

    fn announced(frame: &Bytes) -> Vec<Ipv4Addr> {
        let BgpMessage::Update(update) = parse(frame) else {
            panic!("expected UPDATE");
        };
        update
            .announced_prefixes
            .iter()
            .map(|p| match p.prefix {
                ipnet::IpNet::V4(net) => net.addr(),
                _ => panic!("expected IPv4 prefix"),
            })
            .collect()
    }

    fn withdrawn(frame: &Bytes) -> Vec<Ipv4Addr> {
        let BgpMessage::Update(update) = parse(frame) else {
            panic!("expected UPDATE");
        };
        update
            .withdrawn_prefixes
            .iter()
            .map(|p| match p.prefix {
                ipnet::IpNet::V4(net) => net.addr(),
                _ => panic!("expected IPv4 prefix"),
            })
            .collect()
    }

    // An End-of-RIB marker is an UPDATE whose body is four zero
    // bytes: a 23-byte frame in total.
    fn is_end_of_rib(frame: &Bytes) -> bool {
        frame.len() == 23 && frame[19..] == [0, 0, 0, 0]
    }

    async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame should arrive")
            .expect("writer should stay open")
    }

    async fn assert_no_frame(rx: &mut mpsc::UnboundedReceiver<Bytes>) {
        let res = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(res.is_err(), "expected no frame, got one");
    }

    #[test]
    fn send_tables_batches_and_withdraws_on_first_frame_only() {
        let (writer, mut rx) = UpdateWriter::pair();
        let msg = UpdateMessage {
            to_update: (0..1500u16)
                .map(|i| Ipv4Addr::new(10, 0, (i >> 8) as u8, (i & 0xff) as u8))
                .collect(),
            to_remove: vec![addr(9)],
        };

        send_tables(&AttributesConfig::default(), &writer, &msg).expect("send should succeed");
        drop(writer);

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }

        // frame, EoR, frame, EoR
        assert_eq!(frames.len(), 4);
        assert_eq!(announced(&frames[0]).len(), 1000);
        assert_eq!(withdrawn(&frames[0]), vec![addr(9)]);
        assert!(is_end_of_rib(&frames[1]));
        assert_eq!(announced(&frames[2]).len(), 500);
        assert!(withdrawn(&frames[2]).is_empty());
        assert!(is_end_of_rib(&frames[3]));
    }

    #[test]
    fn send_tables_withdraw_only_emits_single_frame() {
        let (writer, mut rx) = UpdateWriter::pair();
        let msg = UpdateMessage {
            to_update: vec![],
            to_remove: vec![addr(1)],
        };

        send_tables(&AttributesConfig::default(), &writer, &msg).expect("send should succeed");
        drop(writer);

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(withdrawn(&frames[0]), vec![addr(1)]);
        assert!(announced(&frames[0]).is_empty());
        assert!(is_end_of_rib(&frames[1]));
    }

    #[tokio::test]
    async fn empty_broadcast_changes_nothing_and_writes_nothing() {
        let (handle, serve) = Broadcaster::new(AttributesConfig::default());
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(serve.run(shutdown_tx.subscribe()));

        let (writer, mut rx) = UpdateWriter::pair();
        handle.add_peer("192.0.2.1".to_string(), writer).await;

        // Initial push for an empty table: one empty UPDATE + EoR.
        let first = recv_frame(&mut rx).await;
        assert!(announced(&first).is_empty());
        assert!(is_end_of_rib(&recv_frame(&mut rx).await));

        handle.broadcast(UpdateMessage::default()).await;
        assert_no_frame(&mut rx).await;

        let _ = shutdown_tx.send(());
        task.abort();
    }

    #[tokio::test]
    async fn peer_gets_initial_push_then_deltas_in_order() {
        let (handle, serve) = Broadcaster::new(AttributesConfig::default());
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(serve.run(shutdown_tx.subscribe()));

        // Two deltas carrying the same address: the set keeps one.
        handle
            .broadcast(UpdateMessage {
                to_update: vec![addr(1), addr(2)],
                to_remove: vec![],
            })
            .await;
        handle
            .broadcast(UpdateMessage {
                to_update: vec![addr(2)],
                to_remove: vec![],
            })
            .await;

        let (writer, mut rx) = UpdateWriter::pair();
        handle.add_peer("192.0.2.1".to_string(), writer).await;

        let push = recv_frame(&mut rx).await;
        let mut table = announced(&push);
        table.sort();
        assert_eq!(table, vec![addr(1), addr(2)]);
        assert!(is_end_of_rib(&recv_frame(&mut rx).await));

        handle
            .broadcast(UpdateMessage {
                to_update: vec![addr(3)],
                to_remove: vec![],
            })
            .await;
        let delta = recv_frame(&mut rx).await;
        assert_eq!(announced(&delta), vec![addr(3)]);
        assert!(is_end_of_rib(&recv_frame(&mut rx).await));

        handle.del_peer("192.0.2.1".to_string()).await;
        handle
            .broadcast(UpdateMessage {
                to_update: vec![addr(4)],
                to_remove: vec![],
            })
            .await;
        assert_no_frame(&mut rx).await;

        let _ = shutdown_tx.send(());
        task.abort();
    }

    #[tokio::test]
    async fn withdrawals_remove_from_the_route_set() {
        let (handle, serve) = Broadcaster::new(AttributesConfig::default());
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(serve.run(shutdown_tx.subscribe()));

        handle
            .broadcast(UpdateMessage {
                to_update: vec![addr(1), addr(2)],
                to_remove: vec![],
            })
            .await;
        handle
            .broadcast(UpdateMessage {
                to_update: vec![],
                to_remove: vec![addr(1)],
            })
            .await;

        let (writer, mut rx) = UpdateWriter::pair();
        handle.add_peer("192.0.2.1".to_string(), writer).await;

        let push = recv_frame(&mut rx).await;
        assert_eq!(announced(&push), vec![addr(2)]);

        let _ = shutdown_tx.send(());
        task.abort();
    }

    #[tokio::test]
    async fn closed_broadcaster_ignores_operations() {
        let (handle, serve) = Broadcaster::new(AttributesConfig::default());
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(serve.run(shutdown_tx.subscribe()));

        let _ = shutdown_tx.send(());
        let _ = task.await;

        // All of these must be silent no-ops after shutdown.
        let (writer, mut rx) = UpdateWriter::pair();
        handle.add_peer("192.0.2.1".to_string(), writer).await;
        handle.del_peer("192.0.2.1".to_string()).await;
        handle
            .broadcast(UpdateMessage {
                to_update: vec![addr(1)],
                to_remove: vec![],
            })
            .await;
        assert_no_frame(&mut rx).await;
    }
}
