// src/session/mod.rs

//! The cluster session: one per peer TCP link, driving a read pump and a
//! write pump on a periodic tick plus I/O completion (spec.md §4.4).
//! Grounded on `spineldb::core::replication::worker::ReplicaWorker::run`
//! (the `tokio::select!`-driven reconnect/process loop shape) and
//! `original_source/iocore/cluster/ClusterHandler.cc` for the pump state
//! names and policies.

pub mod byte_bank;
pub mod read_pump;
pub mod write_pump;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::api::Dispatcher;
use crate::backend::{CacheBackend, NullCacheBackend};
use crate::channel::{ChannelTable, LinkRole};
use crate::config::LoadMonitorConfig;
use crate::error::{ClusterError, Result};
use crate::monitor::LoadMonitor;
use crate::rpc::messages::{
    CacheKey, CacheOpFlags, CacheOpRequest, CacheOpReplyBody, CacheOpcode, FragType, KeyOpRequest, LinkRequest,
    LookupReply, LookupRequest, OpenReadReply, OpenReadRequest, OpenReadResult, OpenWriteReply, OpenWriteRequest,
};
use crate::rpc::{self, Continuation, OpOutcome, PendingTable, next_sequence_number};
use crate::vc::{VcEvent, VcToken, VirtualConnection};
use crate::wire::{
    ClusterFrame, ClusterFrameCodec, ControlMessage, FunctionCode, HelloMessage, HELLO_LEN, negotiate_version,
};

use byte_bank::ByteBank;
use read_pump::{DEFAULT_LOCK_SPIN_ATTEMPTS, ReadPumpOutcome};
use write_pump::{ControlOutQueues, WriteCursor};

/// One tick of the session pump runs roughly this often (spec.md §4.4).
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Dead,
    Zombie,
    Destroyed,
}

/// Commands delivered to the session thread from other threads via the
/// lock-free MPSC queue (spec.md §4.4 "Thread model"): external
/// continuations reenabling a VC or queuing outgoing control.
pub enum SessionCommand {
    Reenable(u16, VcEvent),
    SendControl { high_priority: bool, message: ControlMessage },
    /// Channel allocation is the one piece of session state a caller
    /// cannot touch directly (`ChannelTable` is session-thread-owned, per
    /// spec.md §4.4's concurrency model), so `read`/`write` route through
    /// the command queue and wait for the reply.
    AllocateVc { reply: oneshot::Sender<Result<u16>> },
}

/// Cheap, cloneable handle other threads use to talk to a running
/// session without touching its internals directly. This is also the
/// caller-facing surface for the remote cache-op API (spec.md §6):
/// `PendingTable` is a shared, lock-striped structure any thread may
/// insert into directly, so these methods need not run on the session
/// thread at all except where a VC must be allocated first.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) commands: mpsc::UnboundedSender<SessionCommand>,
    pending: Arc<PendingTable>,
    peer_ip: IpAddr,
}

impl SessionHandle {
    pub fn reenable(&self, channel: u16, event: VcEvent) {
        let _ = self.commands.send(SessionCommand::Reenable(channel, event));
    }

    pub fn send_control(&self, message: ControlMessage, high_priority: bool) {
        let _ = self.commands.send(SessionCommand::SendControl { high_priority, message });
    }

    fn send_control_encoded<T: Serialize>(&self, function_code: FunctionCode, msg: &T, high_priority: bool) {
        match rpc::messages::encode_body(msg) {
            Ok(body) => self.send_control(ControlMessage::new(function_code, body), high_priority),
            Err(err) => warn!(%err, function_code = ?function_code, "failed to encode outgoing cache-op message"),
        }
    }

    /// `Lookup` (spec.md §4.5/§6): key only, resolves to success/failure
    /// once the peer's reply lands.
    pub fn lookup(&self, key: CacheKey, frag_type: FragType) -> oneshot::Receiver<OpOutcome> {
        let seq = next_sequence_number();
        let (cont, rx) = Continuation::new(CacheOpcode::Lookup, seq, self.peer_ip, key, frag_type, CacheOpFlags::empty());
        self.pending.insert(cont);
        self.send_control_encoded(FunctionCode::Lookup, &LookupRequest { seq_number: seq, key, frag_type }, false);
        rx
    }

    /// `Update`, `Remove`, `Deref` (spec.md §4.5/§6): key and flags only.
    pub fn key_op(&self, opcode: CacheOpcode, key: CacheKey, frag_type: FragType, flags: CacheOpFlags) -> oneshot::Receiver<OpOutcome> {
        let seq = next_sequence_number();
        let (cont, rx) = Continuation::new(opcode, seq, self.peer_ip, key, frag_type, flags);
        self.pending.insert(cont);
        let req = CacheOpRequest::KeyOp(KeyOpRequest { seq_number: seq, opcode, key, frag_type, flags });
        self.send_control_encoded(FunctionCode::CacheOp, &req, false);
        rx
    }

    pub fn remove(&self, key: CacheKey, frag_type: FragType) -> oneshot::Receiver<OpOutcome> {
        self.key_op(CacheOpcode::Remove, key, frag_type, CacheOpFlags::empty())
    }

    pub fn deref(&self, key: CacheKey, frag_type: FragType) -> oneshot::Receiver<OpOutcome> {
        self.key_op(CacheOpcode::Deref, key, frag_type, CacheOpFlags::empty())
    }

    /// `Link` (spec.md §4.5/§6): aliases `from_key` to `to_key`.
    pub fn link(&self, from_key: CacheKey, to_key: CacheKey, frag_type: FragType) -> oneshot::Receiver<OpOutcome> {
        let seq = next_sequence_number();
        let (cont, rx) = Continuation::new(CacheOpcode::Link, seq, self.peer_ip, from_key, frag_type, CacheOpFlags::empty());
        self.pending.insert(cont);
        let req = CacheOpRequest::Link(LinkRequest { seq_number: seq, from_key, to_key, frag_type });
        self.send_control_encoded(FunctionCode::CacheOp, &req, false);
        rx
    }

    /// `OpenRead`/`OpenReadLong` (spec.md §4.5/§6): allocates a local
    /// return-channel VC before sending the request, so the responder can
    /// bind its own VC to the same numeric id (spec.md §4.2). Returns the
    /// allocated channel id alongside the completion receiver.
    #[allow(clippy::too_many_arguments)]
    pub async fn read(
        &self,
        opcode: CacheOpcode,
        key: CacheKey,
        frag_type: FragType,
        pin_time: Option<u32>,
        max_initial_bytes: u32,
        long_form: Option<Bytes>,
    ) -> Result<(u16, oneshot::Receiver<OpOutcome>)> {
        let channel = self.allocate_vc().await?;
        let seq = next_sequence_number();
        let (cont, rx) = Continuation::new(opcode, seq, self.peer_ip, key, frag_type, CacheOpFlags::empty());
        self.pending.insert(cont);
        let req = CacheOpRequest::OpenRead(OpenReadRequest {
            seq_number: seq,
            key,
            frag_type,
            opcode,
            channel,
            pin_time,
            max_initial_bytes,
            long_form,
        });
        self.send_control_encoded(FunctionCode::CacheOp, &req, false);
        Ok((channel, rx))
    }

    /// `OpenWrite`/`OpenWriteLong` (spec.md §4.5/§6).
    #[allow(clippy::too_many_arguments)]
    pub async fn write(
        &self,
        key: CacheKey,
        frag_type: FragType,
        flags: CacheOpFlags,
        pin_time: Option<u32>,
        opcode: CacheOpcode,
        old_info: Option<Bytes>,
    ) -> Result<(u16, oneshot::Receiver<OpOutcome>)> {
        let channel = self.allocate_vc().await?;
        let seq = next_sequence_number();
        let (cont, rx) = Continuation::new(opcode, seq, self.peer_ip, key, frag_type, flags);
        self.pending.insert(cont);
        let req = CacheOpRequest::OpenWrite(OpenWriteRequest {
            seq_number: seq,
            key,
            frag_type,
            flags,
            pin_time,
            opcode,
            channel,
            old_info,
        });
        self.send_control_encoded(FunctionCode::CacheOp, &req, false);
        Ok((channel, rx))
    }

    async fn allocate_vc(&self) -> Result<u16> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::AllocateVc { reply })
            .map_err(|_| ClusterError::PeerDown)?;
        rx.await.map_err(|_| ClusterError::PeerDown)?
    }

    /// Builds a handle around a bare command sender for tests elsewhere in
    /// the crate that only exercise `Peer`'s slot bookkeeping and never
    /// touch the cache-op API.
    #[cfg(test)]
    pub fn for_test(commands: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { commands, pending: Arc::new(PendingTable::new()), peer_ip: IpAddr::from([0, 0, 0, 0]) }
    }
}

pub struct Session {
    pub link_id: u64,
    pub peer_addr: SocketAddr,
    role: LinkRole,
    state: SessionState,

    socket: Framed<TcpStream, ClusterFrameCodec>,
    channels: ChannelTable<Arc<Mutex<VirtualConnection>>>,
    byte_bank: ByteBank,
    write_cursor: WriteCursor,
    control_out: ControlOutQueues,
    sequence_tx: u16,

    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,

    spin_attempts: u32,

    monitor: LoadMonitor,
    ping_nonce: u64,
    ping_sent_at: Option<(u64, Instant)>,

    pending: Arc<PendingTable>,
    dispatcher: Arc<Dispatcher>,
    cache: Arc<dyn CacheBackend>,
    /// Per-session counter minting fresh `VcToken::sequence_number`s for
    /// the VCs this side creates (spec.md §4.3).
    vc_sequence: u32,
}

impl Session {
    /// Performs the 128-byte hello exchange and version negotiation, then
    /// wraps the socket in the byte-order-aware frame codec
    /// (spec.md §6).
    pub async fn handshake(
        stream: TcpStream,
        role: LinkRole,
        link_id: u64,
        local_major: u16,
        local_minor: u16,
        local_min_major: u16,
        local_min_minor: u16,
        peer_id: u16,
        port: u16,
    ) -> Result<Self> {
        Self::handshake_with_monitor(
            stream,
            role,
            link_id,
            local_major,
            local_minor,
            local_min_major,
            local_min_minor,
            peer_id,
            port,
            LoadMonitorConfig::default(),
            Arc::new(PendingTable::new()),
            Arc::new(Dispatcher::new()),
            Arc::new(NullCacheBackend),
        )
        .await
    }

    /// Same as [`Self::handshake`], but lets the caller supply the load
    /// monitor's ping/compute cadence and hysteresis thresholds, plus the
    /// shared cluster-wide RPC state (pending table, plugin dispatcher,
    /// local cache backend) that `dispatch_control` drives (spec.md §4.5,
    /// §4.7, §4.8).
    #[allow(clippy::too_many_arguments)]
    pub async fn handshake_with_monitor(
        mut stream: TcpStream,
        role: LinkRole,
        link_id: u64,
        local_major: u16,
        local_minor: u16,
        local_min_major: u16,
        local_min_minor: u16,
        peer_id: u16,
        port: u16,
        load_monitor_config: LoadMonitorConfig,
        pending: Arc<PendingTable>,
        dispatcher: Arc<Dispatcher>,
        cache: Arc<dyn CacheBackend>,
    ) -> Result<Self> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let peer_addr = stream.peer_addr()?;
        let hello = HelloMessage::new(local_major, local_minor, local_min_major, local_min_minor, peer_id, port);
        stream.write_all(&hello.encode()).await?;

        let mut buf = BytesMut::with_capacity(HELLO_LEN);
        buf.resize(HELLO_LEN, 0);
        stream.read_exact(&mut buf).await?;
        let (peer_hello, swap) = HelloMessage::decode(buf.freeze())?;

        let (major, _minor) = negotiate_version(
            local_major,
            local_minor,
            local_min_major,
            peer_hello.major,
            peer_hello.min_major,
        )
        .ok_or(ClusterError::VersionMismatch)?;

        info!(peer = %peer_addr, major, swap, "cluster session handshake complete");

        let socket = Framed::new(stream, ClusterFrameCodec::new(swap));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Ok(Self {
            link_id,
            peer_addr,
            role,
            state: SessionState::Active,
            socket,
            channels: ChannelTable::new(role),
            byte_bank: ByteBank::new(),
            write_cursor: WriteCursor::new(),
            control_out: ControlOutQueues::default(),
            sequence_tx: 1,
            commands_rx,
            commands_tx,
            spin_attempts: DEFAULT_LOCK_SPIN_ATTEMPTS,
            monitor: LoadMonitor::new(load_monitor_config),
            ping_nonce: 0,
            ping_sent_at: None,
            pending,
            dispatcher,
            cache,
            vc_sequence: 0,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.commands_tx.clone(),
            pending: self.pending.clone(),
            peer_ip: self.peer_addr.ip(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn channels_mut(&mut self) -> &mut ChannelTable<Arc<Mutex<VirtualConnection>>> {
        &mut self.channels
    }

    /// Drives the session until a fatal transport error or the caller
    /// drops it. Runs the periodic tick, reacts to inbound frames, and
    /// drains cross-thread commands (spec.md §4.4).
    pub async fn run(&mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut ping_ticker = tokio::time::interval(self.monitor.ping_interval());
        ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut compute_ticker = tokio::time::interval(self.monitor.compute_interval());
        compute_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.state != SessionState::Active {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        self.machine_down(&err.to_string());
                    }
                }
                _ = ping_ticker.tick() => {
                    self.send_ping();
                }
                _ = compute_ticker.tick() => {
                    self.monitor.compute_tick();
                    if self.monitor.overloaded() {
                        warn!(peer = %self.peer_addr, "cluster link flagged overloaded by the load monitor");
                    }
                }
                frame = self.socket.next() => {
                    match frame {
                        Some(Ok(frame)) => self.on_frame(frame),
                        Some(Err(err)) => {
                            warn!(peer = %self.peer_addr, %err, "wire corruption, declaring session dead");
                            self.machine_down(&err.to_string());
                        }
                        None => {
                            info!(peer = %self.peer_addr, "peer closed the link");
                            self.machine_down("peer closed connection");
                        }
                    }
                }
                cmd = self.commands_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.on_command(cmd),
                        None => break,
                    }
                }
            }
        }
    }

    fn on_frame(&mut self, frame: ClusterFrame) {
        let ReadPumpOutcome { control, events } =
            read_pump::process_frame(frame, &mut self.channels, &mut self.byte_bank, self.spin_attempts);
        for msg in control {
            self.dispatch_control(msg);
        }
        for (channel, event) in events {
            debug!(channel, ?event, "vc event from read pump");
        }
    }

    /// Routes a decoded control message to its handler (spec.md §4.4/§4.5):
    /// ping/pong intrinsics, the cache-op RPC layer, or, for plugin codes,
    /// the registered `api::Dispatcher` entry.
    fn dispatch_control(&mut self, msg: ControlMessage) {
        match msg.function_code {
            FunctionCode::Ping => {
                self.control_out.high.push_back(ControlMessage::new(FunctionCode::PingReply, msg.body));
            }
            FunctionCode::PingReply => self.on_ping_reply(&msg.body),
            FunctionCode::Lookup => self.handle_lookup_request(&msg.body),
            FunctionCode::LookupReply => self.handle_lookup_reply(&msg.body),
            FunctionCode::CacheOp => self.handle_cache_op_request(&msg.body),
            FunctionCode::CacheOpReply => self.handle_cache_op_reply(&msg.body),
            FunctionCode::CloseChannel => self.handle_close_channel(&msg.body),
            FunctionCode::MachineList => {
                debug!("machine list control message received, ignored by the RPC layer");
            }
            FunctionCode::SetChannelData | FunctionCode::SetChannelPin | FunctionCode::SetChannelPriority => {
                // Already applied by the read pump before control dispatch runs (spec.md §4.4).
            }
            FunctionCode::Plugin(code) => {
                if !self.dispatcher.dispatch(&msg) {
                    debug!(code, "no plugin handler registered for function code");
                }
            }
        }
    }

    /// Queues `msg` encoded as `function_code`'s body, logging and
    /// dropping it on an encode failure rather than poisoning the
    /// outbound queue with an unreadable item.
    fn queue_control<T: Serialize>(&mut self, function_code: FunctionCode, msg: &T, high_priority: bool) {
        match rpc::messages::encode_body(msg) {
            Ok(body) => {
                let queue = if high_priority { &mut self.control_out.high } else { &mut self.control_out.normal };
                queue.push_back(ControlMessage::new(function_code, body));
            }
            Err(err) => warn!(%err, function_code = ?function_code, "failed to encode outgoing control message"),
        }
    }

    /// Mints a fresh token for a VC this session is about to create
    /// (spec.md §4.3). `creator_ip` records the peer this session talks
    /// to — the only address this session layer has on hand — since the
    /// wire protocol itself never transmits the token's IP field; only
    /// `sequence_number` round-trips via descriptors.
    fn next_vc_token(&mut self) -> VcToken {
        self.vc_sequence = self.vc_sequence.wrapping_add(1);
        VcToken { creator_ip: self.peer_addr.ip(), session_id: self.link_id, sequence_number: self.vc_sequence }
    }

    /// Allocates a VC at a local id of this end's parity (spec.md §4.2),
    /// used by `SessionCommand::AllocateVc` for an outbound `read`/`write`.
    fn alloc_local_vc(&mut self) -> Result<u16> {
        let token = self.next_vc_token();
        let (vc, _events) = VirtualConnection::new(0, token);
        self.channels.alloc(Arc::new(Mutex::new(vc)), None)
    }

    /// Binds a new VC at the exact channel id the peer pre-allocated
    /// (spec.md §4.2 "return channel"), used when responding to an
    /// `OpenRead`/`OpenWrite` request.
    fn bind_remote_channel(&mut self, requested: u16) -> Result<u16> {
        let token = self.next_vc_token();
        let (vc, _events) = VirtualConnection::new(requested, token);
        self.channels.alloc(Arc::new(Mutex::new(vc)), Some(requested))
    }

    fn handle_lookup_request(&mut self, body: &Bytes) {
        let req: LookupRequest = match rpc::messages::decode_body(body) {
            Ok(req) => req,
            Err(err) => {
                warn!(%err, "malformed lookup request");
                return;
            }
        };
        let outcome = self.cache.lookup(req.key, req.frag_type);
        let reply = LookupReply { seq_number: req.seq_number, found: outcome.found };
        self.queue_control(FunctionCode::LookupReply, &reply, true);
    }

    fn handle_lookup_reply(&mut self, body: &Bytes) {
        let reply: LookupReply = match rpc::messages::decode_body(body) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, "malformed lookup reply");
                return;
            }
        };
        let outcome = if reply.found { OpOutcome::Success } else { OpOutcome::Failure(ClusterError::CacheMiss) };
        self.complete_pending(reply.seq_number, outcome);
    }

    fn handle_cache_op_request(&mut self, body: &Bytes) {
        let req: CacheOpRequest = match rpc::messages::decode_body(body) {
            Ok(req) => req,
            Err(err) => {
                warn!(%err, "malformed cache-op request");
                return;
            }
        };
        match req {
            CacheOpRequest::OpenRead(r) => self.handle_open_read(r),
            CacheOpRequest::OpenWrite(r) => self.handle_open_write(r),
            CacheOpRequest::KeyOp(r) => self.handle_key_op(r),
            CacheOpRequest::Link(r) => self.handle_link(r),
        }
    }

    /// `OpenRead`/`OpenReadLong` responder side (spec.md §4.5). A miss on
    /// an HTTP fragment (never PURGE/DELETE) silently converts to an
    /// `OpenWrite` and replies with that write's token (edge case (d)).
    fn handle_open_read(&mut self, req: OpenReadRequest) {
        let outcome = self.cache.open_read(req.key, req.frag_type, req.opcode);
        let reply = match outcome {
            crate::backend::OpenReadOutcome::Hit { cache_info, initial_data_bytes, is_ram_cache_hit } => {
                match self.bind_remote_channel(req.channel) {
                    Ok(channel) => OpenReadReply {
                        seq_number: req.seq_number,
                        result: OpenReadResult::Hit,
                        token: Some(channel as u32),
                        is_ram_cache_hit,
                        cache_info,
                        initial_data_bytes,
                    },
                    Err(err) => {
                        warn!(%err, "failed to bind return channel for open-read hit");
                        open_read_failed(req.seq_number)
                    }
                }
            }
            crate::backend::OpenReadOutcome::Miss if req.frag_type == FragType::Http => {
                let write = self.cache.open_write(req.key, req.frag_type, CacheOpFlags::empty(), CacheOpcode::OpenWrite);
                if write.accepted {
                    match self.bind_remote_channel(req.channel) {
                        Ok(channel) => OpenReadReply {
                            seq_number: req.seq_number,
                            result: OpenReadResult::FailedConvertedToWrite { write_token: channel as u32 },
                            token: Some(channel as u32),
                            is_ram_cache_hit: false,
                            cache_info: None,
                            initial_data_bytes: 0,
                        },
                        Err(err) => {
                            warn!(%err, "failed to bind return channel for open-write conversion");
                            open_read_failed(req.seq_number)
                        }
                    }
                } else {
                    open_read_failed(req.seq_number)
                }
            }
            crate::backend::OpenReadOutcome::Miss => open_read_failed(req.seq_number),
        };
        self.queue_control(FunctionCode::CacheOpReply, &CacheOpReplyBody::OpenRead(reply), true);
    }

    fn handle_open_write(&mut self, req: OpenWriteRequest) {
        let outcome = self.cache.open_write(req.key, req.frag_type, req.flags, req.opcode);
        let reply = if outcome.accepted {
            match self.bind_remote_channel(req.channel) {
                Ok(channel) => OpenWriteReply { seq_number: req.seq_number, success: true, token: Some(channel as u32) },
                Err(err) => {
                    warn!(%err, "failed to bind return channel for open-write");
                    OpenWriteReply { seq_number: req.seq_number, success: false, token: None }
                }
            }
        } else {
            OpenWriteReply { seq_number: req.seq_number, success: false, token: None }
        };
        self.queue_control(FunctionCode::CacheOpReply, &CacheOpReplyBody::OpenWrite(reply), true);
    }

    fn handle_key_op(&mut self, req: KeyOpRequest) {
        let success = self.cache.key_op(req.opcode, req.key, req.frag_type, req.flags);
        let reply = crate::rpc::messages::CacheOpReply { seq_number: req.seq_number, success };
        self.queue_control(FunctionCode::CacheOpReply, &CacheOpReplyBody::Plain(reply), false);
    }

    fn handle_link(&mut self, req: LinkRequest) {
        let success = self.cache.link(req.from_key, req.to_key, req.frag_type);
        let reply = crate::rpc::messages::CacheOpReply { seq_number: req.seq_number, success };
        self.queue_control(FunctionCode::CacheOpReply, &CacheOpReplyBody::Plain(reply), false);
    }

    fn handle_cache_op_reply(&mut self, body: &Bytes) {
        let reply: CacheOpReplyBody = match rpc::messages::decode_body(body) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, "malformed cache-op reply");
                return;
            }
        };
        let seq = reply.seq_number();
        let outcome = match reply {
            CacheOpReplyBody::OpenRead(r) => match r.result {
                OpenReadResult::Hit => OpOutcome::Success,
                OpenReadResult::FailedConvertedToWrite { write_token } => OpOutcome::ConvertedToWrite(write_token),
                OpenReadResult::Failed => OpOutcome::Failure(ClusterError::CacheMiss),
            },
            CacheOpReplyBody::OpenWrite(r) => {
                if r.success {
                    OpOutcome::Success
                } else {
                    OpOutcome::Failure(ClusterError::CacheOpFailure("open-write rejected".to_string()))
                }
            }
            CacheOpReplyBody::Plain(r) => {
                if r.success {
                    OpOutcome::Success
                } else {
                    OpOutcome::Failure(ClusterError::CacheOpFailure("cache operation rejected".to_string()))
                }
            }
        };
        self.complete_pending(seq, outcome);
    }

    fn complete_pending(&self, seq_number: u32, outcome: OpOutcome) {
        if !self.pending.complete(self.peer_addr.ip(), seq_number, outcome) {
            debug!(seq_number, "cache-op reply for unknown or already-resolved sequence number");
        }
    }

    fn handle_close_channel(&mut self, body: &Bytes) {
        let Some(channel) = leading_channel_id(body) else {
            warn!("close-channel control message missing channel id");
            return;
        };
        if let Some(vc) = self.channels.get(channel) {
            let mut guard = vc.lock();
            guard.set_remote_closed(0);
            let freeable = guard.is_freeable();
            drop(guard);
            if freeable {
                self.channels.free(channel);
            }
        }
    }

    /// Queues an outgoing ping carrying a nonce so the matching reply can
    /// be timed against it (spec.md §4.8).
    fn send_ping(&mut self) {
        self.ping_nonce = self.ping_nonce.wrapping_add(1);
        let mut body = BytesMut::with_capacity(8);
        body.put_u64(self.ping_nonce);
        self.ping_sent_at = Some((self.ping_nonce, Instant::now()));
        self.control_out.high.push_back(ControlMessage::new(FunctionCode::Ping, body.freeze()));
    }

    fn on_ping_reply(&mut self, body: &Bytes) {
        let Some((nonce, sent_at)) = self.ping_sent_at else { return };
        if body.len() < 8 || body.clone().get_u64() != nonce {
            return;
        }
        self.ping_sent_at = None;
        self.monitor.record_round_trip(sent_at.elapsed());
    }

    /// This link's current load-monitor snapshot (spec.md §4.8).
    pub fn load_monitor(&self) -> &LoadMonitor {
        &self.monitor
    }

    fn on_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Reenable(channel, event) => {
                if let Some(vc) = self.channels.get(channel) {
                    vc.lock().reenable(event);
                }
            }
            SessionCommand::SendControl { high_priority, message } => {
                if high_priority {
                    self.control_out.high.push_back(message);
                } else {
                    self.control_out.normal.push_back(message);
                }
            }
            SessionCommand::AllocateVc { reply } => {
                let _ = reply.send(self.alloc_local_vc());
            }
        }
    }

    /// One tick: finish deferred reads, then run the write pump
    /// (spec.md §4.4).
    async fn tick(&mut self) -> Result<()> {
        // Thread-stealing callers (`maybe_drive`) may run a tick without
        // ever reaching `run`'s select loop, so drain whatever commands
        // already queued up instead of waiting for the next full cycle
        // (spec.md §4.4 / §9).
        while let Ok(cmd) = self.commands_rx.try_recv() {
            self.on_command(cmd);
        }

        let mut events = Vec::new();
        read_pump::drain_byte_bank(&mut self.channels, &mut self.byte_bank, &mut events);
        for (channel, event) in events {
            debug!(channel, ?event, "vc event from byte bank retry");
        }

        if let Some(frame) = write_pump::build_frame(
            &mut self.channels,
            &mut self.write_cursor,
            &mut self.control_out,
            &mut self.sequence_tx,
        ) {
            self.socket.send(frame.clone()).await?;
            write_pump::on_write_complete(&frame, &mut self.channels);
        }
        Ok(())
    }

    /// Fatal socket error or membership loss: cancel in-flight I/O,
    /// surface an error to every VC, and transition through zombie to
    /// destruction (spec.md §4.4 "Cancellation / failure").
    pub fn machine_down(&mut self, reason: &str) {
        if self.state != SessionState::Active {
            return;
        }
        error!(peer = %self.peer_addr, reason, "session declared dead");
        self.state = SessionState::Dead;

        for channel in 0..self.channels.capacity() as u16 {
            if let Some(vc) = self.channels.get(channel) {
                let mut guard = vc.lock();
                guard.remote_reports_unknown_channel();
                guard.do_io_close(-1);
                guard.reenable(VcEvent::Error);
            }
        }

        self.state = SessionState::Zombie;
    }

    pub fn is_drained(&self) -> bool {
        (0..self.channels.capacity() as u16).all(|c| self.channels.get(c).is_none())
    }

    pub fn destroy(&mut self) {
        if self.state == SessionState::Zombie && self.is_drained() {
            self.state = SessionState::Destroyed;
        }
    }

    /// Thread-stealing entry point: a non-cluster thread that just
    /// enqueued a command may run one bounded iteration of the pump
    /// itself instead of waiting for the next tick, provided it can
    /// opportunistically take the session's run (spec.md §4.4 / §9).
    pub async fn maybe_drive(&mut self) -> Result<()> {
        if self.state != SessionState::Active {
            return Ok(());
        }
        self.tick().await
    }
}

fn open_read_failed(seq_number: u32) -> OpenReadReply {
    OpenReadReply {
        seq_number,
        result: OpenReadResult::Failed,
        token: None,
        is_ram_cache_hit: false,
        cache_info: None,
        initial_data_bytes: 0,
    }
}

/// The channel a close-channel message targets is carried as the first
/// two bytes of its body (big-endian), matching the convention
/// `read_pump::set_data_channel` uses for set-data control messages.
fn leading_channel_id(body: &Bytes) -> Option<u16> {
    if body.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([body[0], body[1]]))
}
