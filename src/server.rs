// src/server.rs

//! Glue: accept loop on the cluster port, outbound connector, and the
//! periodic "are we still a member?" check (spec.md §2 item 10).
//! Grounded on `spineldb::server::spawner::spawn_all` (JoinSet of
//! background tasks, per-task broadcast shutdown subscription) and
//! `spineldb::server::connection_loop::run` (biased select! over
//! shutdown / accept / task reaping).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::api::{Dispatcher, PeerStatusEvent, StatusRegistry};
use crate::backend::{CacheBackend, NullCacheBackend};
use crate::channel::LinkRole;
use crate::config::ClusterTransportConfig;
use crate::error::Result;
use crate::peer::{Peer, PeerIdentity, ProtocolVersion};
use crate::rpc::PendingTable;
use crate::session::Session;
use crate::topology::{PeerDescriptor, Topology};

/// Cluster protocol version this build speaks (spec.md §4.1 hello exchange).
pub const PROTOCOL_MAJOR: u16 = 1;
pub const PROTOCOL_MINOR: u16 = 0;
pub const PROTOCOL_MIN_MAJOR: u16 = 1;
pub const PROTOCOL_MIN_MINOR: u16 = 0;

/// Shared state handed to every accepted/connected session. Construction
/// mirrors `spineldb::server::context::ServerContext`'s bundling of state
/// behind `Arc` for cheap clone-per-task.
pub struct ServerContext {
    pub local: PeerIdentity,
    pub config: ClusterTransportConfig,
    pub topology: Arc<Topology>,
    pub peers: Arc<DashMap<IpAddr, Mutex<Peer>>>,
    pub dispatcher: Arc<Dispatcher>,
    pub status: Arc<StatusRegistry>,
    /// Cluster-wide pending table for in-flight cache-op continuations,
    /// shared by every session on this node (spec.md §4.5).
    pub pending: Arc<PendingTable>,
    /// The local cache engine a session's RPC layer calls into when it
    /// decodes a `Lookup`/`CacheOp` request (spec.md §1, §4.5). Defaults
    /// to [`NullCacheBackend`]; embedders wire a real one in with
    /// [`Self::with_cache_backend`].
    pub cache: Arc<dyn CacheBackend>,
    next_link_id: std::sync::atomic::AtomicU64,
}

impl ServerContext {
    pub fn new(local: PeerIdentity, config: ClusterTransportConfig) -> Self {
        Self::with_cache_backend(local, config, Arc::new(NullCacheBackend))
    }

    pub fn with_cache_backend(local: PeerIdentity, config: ClusterTransportConfig, cache: Arc<dyn CacheBackend>) -> Self {
        Self {
            topology: Arc::new(Topology::with_settle_interval(local.id, config.config_settle_interval)),
            config,
            local,
            peers: Arc::new(DashMap::new()),
            dispatcher: Arc::new(Dispatcher::new()),
            status: Arc::new(StatusRegistry::new()),
            pending: Arc::new(PendingTable::new()),
            cache,
            next_link_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn next_link_id(&self) -> u64 {
        self.next_link_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Publishes a new topology generation and drops any tracked peer no
    /// longer present, firing `Down` status events for them (spec.md
    /// §4.4 "discovery that this peer is no longer in the membership
    /// list").
    pub fn apply_membership(&self, members: Vec<PeerDescriptor>) {
        let still_present: std::collections::HashSet<IpAddr> = members.iter().map(|m| m.ip).collect();
        self.topology.rebuild(members);

        self.peers.retain(|ip, peer| {
            let keep = still_present.contains(ip);
            if !keep {
                peer.lock().mark_dead();
                self.status.broadcast(*ip, PeerStatusEvent::Down);
            }
            keep
        });
    }
}

/// Spawns the accept loop and the periodic membership checker into
/// `background` (spec.md §2 item 10). Mirrors `spawner::spawn_all`'s
/// per-task shutdown subscription pattern.
pub fn spawn_all(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    shutdown: &broadcast::Sender<()>,
    background: &mut JoinSet<Result<()>>,
) {
    let accept_ctx = ctx.clone();
    let mut accept_shutdown = shutdown.subscribe();
    background.spawn(async move {
        accept_loop(listener, accept_ctx, &mut accept_shutdown).await;
        Ok(())
    });

    let membership_ctx = ctx;
    let mut membership_shutdown = shutdown.subscribe();
    background.spawn(async move {
        membership_check_loop(membership_ctx, &mut membership_shutdown).await;
        Ok(())
    });
}

/// Accepts inbound links and spawns a session per connection (spec.md
/// §3 "Session" lifecycle: "created on accept or connect").
async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>, shutdown: &mut broadcast::Receiver<()>) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                info!("cluster accept loop shutting down");
                break;
            }
            Some(res) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(err) = res {
                    if err.is_panic() {
                        error!(%err, "cluster session task panicked");
                    }
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        info!(%addr, "accepted cluster link");
                        let ctx = ctx.clone();
                        sessions.spawn(async move { run_accepted_session(stream, ctx).await });
                    }
                    Err(err) => warn!(%err, "failed to accept cluster link"),
                }
            }
        }
    }
    sessions.shutdown().await;
}

async fn run_accepted_session(stream: TcpStream, ctx: Arc<ServerContext>) {
    let link_id = ctx.next_link_id();
    let local_port = ctx.local.port;
    match Session::handshake_with_monitor(
        stream,
        LinkRole::Acceptor,
        link_id,
        PROTOCOL_MAJOR,
        PROTOCOL_MINOR,
        PROTOCOL_MIN_MAJOR,
        PROTOCOL_MIN_MINOR,
        ctx.local.id,
        local_port,
        ctx.config.load_monitor.clone(),
        ctx.pending.clone(),
        ctx.dispatcher.clone(),
        ctx.cache.clone(),
    )
    .await
    {
        Ok(mut session) => {
            register_session(&ctx, &session);
            session.run().await;
        }
        Err(err) => warn!(%err, "cluster handshake failed"),
    }
}

/// Outbound connector: dials `identity` and runs its session to
/// completion (spec.md §3 "Session" lifecycle: "created on accept or
/// connect").
pub async fn connect_to_peer(ctx: Arc<ServerContext>, identity: PeerIdentity) -> Result<()> {
    let addr = SocketAddr::new(identity.ip, identity.port);
    let stream = TcpStream::connect(addr).await?;
    let link_id = ctx.next_link_id();
    let mut session = Session::handshake_with_monitor(
        stream,
        LinkRole::Initiator,
        link_id,
        PROTOCOL_MAJOR,
        PROTOCOL_MINOR,
        PROTOCOL_MIN_MAJOR,
        PROTOCOL_MIN_MINOR,
        ctx.local.id,
        ctx.local.port,
        ctx.config.load_monitor.clone(),
        ctx.pending.clone(),
        ctx.dispatcher.clone(),
        ctx.cache.clone(),
    )
    .await?;
    register_session(&ctx, &session);
    session.run().await;
    Ok(())
}

/// Records the new session against its peer's connection-slot array,
/// allocating a `Peer` entry on first contact. The accepted-side peer id
/// is unknown until topology lookup resolves it from the IP, so slot 0
/// is used as the provisional entry point (spec.md §3 "Peer").
fn register_session(ctx: &Arc<ServerContext>, session: &Session) {
    let ip = session.peer_addr.ip();
    let handle = session.handle();
    let slot_count = ctx.config.cluster_threads.max(1);
    let entry = ctx
        .peers
        .entry(ip)
        .or_insert_with(|| Mutex::new(Peer::new(PeerIdentity { ip, port: session.peer_addr.port(), id: 0 }, slot_count)));

    let mut peer = entry.lock();
    let was_dead = peer.is_dead();
    peer.attach_session(0, handle, ProtocolVersion { major: PROTOCOL_MAJOR, minor: PROTOCOL_MINOR });
    drop(peer);

    if was_dead {
        ctx.status.broadcast(ip, PeerStatusEvent::Up);
    }
}

/// Periodically checks this node is still in its own topology's peer
/// list (spec.md §4.4 "discovery that this peer is no longer in the
/// membership list").
async fn membership_check_loop(ctx: Arc<ServerContext>, shutdown: &mut broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                if !is_still_member(&ctx) {
                    warn!(local = ?ctx.local, "this node is no longer a cluster member");
                }
            }
        }
    }
}

fn is_still_member(ctx: &Arc<ServerContext>) -> bool {
    ctx.topology.current().peers.iter().any(|p| p.id == ctx.local.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> PeerIdentity {
        PeerIdentity { ip: IpAddr::from([10, 0, 0, 1]), port: 8086, id: 1 }
    }

    #[test]
    fn is_still_member_true_when_local_id_present() {
        let ctx = Arc::new(ServerContext::new(local(), ClusterTransportConfig::default()));
        ctx.topology.rebuild(vec![
            PeerDescriptor { ip: local().ip, port: 8086, id: 1, dead: false },
            PeerDescriptor { ip: IpAddr::from([10, 0, 0, 2]), port: 8086, id: 2, dead: false },
        ]);
        assert!(is_still_member(&ctx));
    }

    #[test]
    fn is_still_member_false_once_evicted() {
        let ctx = Arc::new(ServerContext::new(local(), ClusterTransportConfig::default()));
        ctx.topology.rebuild(vec![PeerDescriptor { ip: IpAddr::from([10, 0, 0, 2]), port: 8086, id: 2, dead: false }]);
        assert!(!is_still_member(&ctx));
    }

    #[test]
    fn apply_membership_marks_dropped_peers_dead() {
        let ctx = Arc::new(ServerContext::new(local(), ClusterTransportConfig::default()));
        let (commands, _rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = crate::session::SessionHandle::for_test(commands);
        let gone_ip = IpAddr::from([10, 0, 0, 9]);
        ctx.peers.insert(gone_ip, Mutex::new(Peer::new(PeerIdentity { ip: gone_ip, port: 8086, id: 9 }, 1)));
        ctx.peers.get(&gone_ip).unwrap().lock().attach_session(0, handle, ProtocolVersion::default());

        ctx.apply_membership(vec![PeerDescriptor { ip: local().ip, port: 8086, id: 1, dead: false }]);
        assert!(!ctx.peers.contains_key(&gone_ip));
    }
}
