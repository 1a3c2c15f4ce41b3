use crate::{
    check_trailing,
    in_half_window,
    read_u16,
    read_u32,
    read_u8,
    Channel,
    CtlType,
    Error,
    PeerId,
    Pkt,
    PktInfo,
    RawType,
    Seqnum,
    CHANNEL_COUNT,
    CONN_TIMEOUT,
    INIT_SEQNUM,
    MAX_NET_PKT_SIZE,
    NET_HDR_SIZE,
    ORIG_HDR_SIZE,
    PEER_ID_NIL,
    PEER_ID_SRV,
    PING_TIMEOUT,
    PROTO_ID,
    REL_HDR_SIZE,
    REL_RESEND_AFTER,
    SPLIT_HDR_SIZE,
};
use flume::{
    Receiver as ChannelRx,
    Sender as ChannelTx,
};
use futures_lite::future::FutureExt;
use log::{
    debug,
    warn,
};
use std::{
    array,
    collections::HashMap,
    future::Future,
    io::{
        self,
        Cursor,
    },
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex as SyncMutex,
        RwLock as SyncRwLock,
    },
};
use tokio::{
    net::UdpSocket,
    sync::{
        watch,
        Mutex as AsyncMutex,
        RwLock as AsyncRwLock,
    },
    time::{
        self,
        Instant,
    },
};

// Errors are dropped rather than queued when nobody drains them, an unread
// error queue must never stall packet processing.
const ERR_QUEUE_LENGTH: usize = 32;

/// The UDP side of a connection.
pub(crate) enum Endpoint {
    /// Socket owned exclusively by a client-side connection, already
    /// connected to the server address.
    Client { socket: UdpSocket },
    /// Listener-owned socket shared by all accepted connections. Inbound
    /// datagrams are routed into `datagrams` by the listener read task.
    Accepted {
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        datagrams: ChannelRx<Vec<u8>>,
        unregister: Box<dyn Fn() + Send + Sync>,
    },
}

impl Endpoint {
    async fn write(&self, datagram: &[u8]) -> io::Result<()> {
        match self {
            Endpoint::Client { socket } => socket.send(datagram).await.map(|_| ()),
            Endpoint::Accepted { socket, remote, .. } => {
                socket.send_to(datagram, *remote).await.map(|_| ())
            },
        }
    }

    /// Non-blocking write for close paths that cannot await.
    fn try_write(&self, datagram: &[u8]) {
        let _ = match self {
            Endpoint::Client { socket } => socket.try_send(datagram),
            Endpoint::Accepted { socket, remote, .. } => socket.try_send_to(datagram, *remote),
        };
    }

    async fn read(&self) -> Result<Vec<u8>, Error> {
        match self {
            Endpoint::Client { socket } => {
                let mut buf = vec![0; MAX_NET_PKT_SIZE];
                let len = socket.recv(&mut buf).await?;
                buf.truncate(len);
                Ok(buf)
            },
            Endpoint::Accepted { datagrams, .. } => {
                datagrams.recv_async().await.map_err(|_| Error::Closed)
            },
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Endpoint::Client { socket } => socket.local_addr(),
            Endpoint::Accepted { socket, .. } => socket.local_addr(),
        }
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Endpoint::Client { socket } => socket.peer_addr(),
            Endpoint::Accepted { remote, .. } => Ok(*remote),
        }
    }
}

struct InSplit {
    chunks: Vec<Option<Vec<u8>>>,
    got: u16,
    size: usize,
    /// Completion tombstone, late duplicate chunks are dropped silently.
    done: bool,
    /// Eviction deadline, refreshed by every chunk. Only unreliable splits
    /// have an eviction task watching it.
    deadline: Instant,
    /// Distinguishes reincarnations of the same split seqnum.
    epoch: u64,
}

struct OutRel {
    sn: Seqnum,
    win: Seqnum,
}

struct ChannelShared {
    /// Only one reliable send on a channel progresses at a time.
    out_rel: AsyncMutex<OutRel>,
    /// Outgoing reliable seqnum to its fired-once ack signal.
    acks: SyncMutex<HashMap<Seqnum, watch::Sender<bool>>>,
    out_split_sn: SyncMutex<Seqnum>,
    /// Incoming split reassembly, also touched by the eviction tasks.
    in_splits: SyncRwLock<HashMap<Seqnum, InSplit>>,
}

impl ChannelShared {
    fn new() -> Self {
        Self {
            out_rel: AsyncMutex::new(OutRel {
                sn: INIT_SEQNUM,
                win: INIT_SEQNUM,
            }),
            acks: SyncMutex::new(HashMap::new()),
            out_split_sn: SyncMutex::new(INIT_SEQNUM),
            in_splits: SyncRwLock::new(HashMap::new()),
        }
    }
}

/// Reliable-in reassembly state. Owned by the processor task alone, no
/// locking involved.
struct ChannelProc {
    in_rels: HashMap<Seqnum, Vec<u8>>,
    in_rel_sn: Seqnum,
}

impl ChannelProc {
    fn new() -> Self {
        Self {
            in_rels: HashMap::new(),
            in_rel_sn: INIT_SEQNUM,
        }
    }
}

pub(crate) struct Core {
    endpoint: Endpoint,
    id: PeerId,
    /// Our own id as assigned by the remote, stamped into every outgoing
    /// datagram header. The SetPeerID handler takes the exclusive side,
    /// every sender stamping a header takes the shared side.
    remote_id: AsyncRwLock<PeerId>,
    chans: [ChannelShared; CHANNEL_COUNT as usize],

    pkts_tx: ChannelTx<Pkt>,
    pkts_rx: ChannelRx<Pkt>,
    errs_tx: ChannelTx<Error>,
    errs_rx: ChannelRx<Error>,

    closing: AtomicBool,
    why: SyncMutex<Option<Error>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,

    last_recv: SyncMutex<Instant>,
    last_send: SyncMutex<Instant>,
    split_epoch: AtomicU64,
}

impl Core {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed_rx.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    fn mark_recv(&self) {
        *self.last_recv.lock().unwrap() = Instant::now();
    }

    fn mark_send(&self) {
        *self.last_send.lock().unwrap() = Instant::now();
    }

    fn last_recv(&self) -> Instant {
        *self.last_recv.lock().unwrap()
    }

    fn last_send(&self) -> Instant {
        *self.last_send.lock().unwrap()
    }

    /// Captures the close cause. Only the first closer proceeds.
    fn begin_close(&self, why: Option<Error>) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.why.lock().unwrap() = why;
        true
    }

    fn finish_close(&self) {
        // Dropping the registered senders makes pending ack waiters and
        // retransmit tasks observe the close.
        for chan in &self.chans {
            chan.acks.lock().unwrap().clear();
        }
        if let Endpoint::Accepted { unregister, .. } = &self.endpoint {
            unregister();
        }
        self.closed_tx.send_replace(true);
    }

    fn disco_datagram(&self, remote_id: PeerId) -> Vec<u8> {
        frame_datagram(remote_id, 0, &[RawType::CTL, CtlType::DISCO])
    }

    /// Closes after a best-effort disconnect datagram. The peer would time
    /// out without it, the write result is irrelevant.
    async fn close_disco(&self, why: Option<Error>) -> Result<(), Error> {
        if !self.begin_close(why) {
            return Err(Error::Closed);
        }
        let remote_id = *self.remote_id.read().await;
        let _ = self.endpoint.write(&self.disco_datagram(remote_id)).await;
        self.finish_close();
        Ok(())
    }

    /// Closes without notifying the peer, for when the peer disconnected
    /// first.
    fn close_quiet(&self, why: Option<Error>) -> Result<(), Error> {
        if !self.begin_close(why) {
            return Err(Error::Closed);
        }
        self.finish_close();
        Ok(())
    }

    /// Non-blocking close used when the user handle is dropped.
    fn close_now(&self) {
        if !self.begin_close(None) {
            return;
        }
        if let Ok(remote_id) = self.remote_id.try_read() {
            self.endpoint.try_write(&self.disco_datagram(*remote_id));
        }
        self.finish_close();
    }

    fn report(&self, kind: &str, err: Error) {
        warn!("{} pkt: {}", kind, err);
        let _ = self.errs_tx.try_send(err);
    }

    async fn deliver(&self, pkt: Pkt) {
        async {
            let _ = self.pkts_tx.send_async(pkt).await;
        }
        .or(async {
            self.wait_closed().await;
        })
        .await;
    }

    /// Writes a finished datagram. A failed write is fatal to the
    /// connection.
    async fn write_datagram(&self, datagram: &[u8]) -> Result<(), Error> {
        if let Err(err) = self.endpoint.write(datagram).await {
            let err = Error::from(err);
            if self.begin_close(Some(err.clone())) {
                self.finish_close();
            }
            return Err(err);
        }
        self.mark_send();
        Ok(())
    }
}

fn frame_datagram(remote_id: PeerId, channel: Channel, raw: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(NET_HDR_SIZE + raw.len());
    datagram.extend_from_slice(&PROTO_ID.to_be_bytes());
    datagram.extend_from_slice(&remote_id.to_be_bytes());
    datagram.push(channel);
    datagram.extend_from_slice(raw);
    datagram
}

/// Sends a raw pkt, reliably if the info says so.
async fn send_raw(core: &Arc<Core>, raw: &[u8], info: PktInfo) -> Result<Option<AckWait>, Error> {
    if core.is_closing() {
        return Err(Error::Closed);
    }
    if !info.unrel {
        return send_rel(core, raw, info.channel).await.map(Some);
    }
    send_unrel(core, raw, info.channel).await?;
    Ok(None)
}

/// Stamps the header under the shared side of the remote id lock and writes
/// the datagram.
async fn send_unrel(core: &Arc<Core>, raw: &[u8], channel: Channel) -> Result<(), Error> {
    let remote_id = core.remote_id.read().await;
    if core.is_closing() {
        return Err(Error::Closed);
    }
    let datagram = frame_datagram(*remote_id, channel, raw);
    if datagram.len() > MAX_NET_PKT_SIZE {
        return Err(Error::PktTooLong);
    }
    let result = core.write_datagram(&datagram).await;
    drop(remote_id);
    result
}

/// Wraps a raw pkt into a reliable frame and keeps resending it until the
/// peer acknowledges the seqnum.
async fn send_rel(core: &Arc<Core>, raw: &[u8], channel: Channel) -> Result<AckWait, Error> {
    let chan = &core.chans[channel as usize];
    let mut out = chan.out_rel.lock().await;

    // Backpressure: at most a half-space of unacknowledged seqnums. An
    // absent registry entry means the seqnum was already acknowledged.
    while !in_half_window(out.win, out.sn) {
        let pending = chan
            .acks
            .lock()
            .unwrap()
            .get(&out.win)
            .map(|ack| ack.subscribe());
        if let Some(mut ack) = pending {
            if ack.wait_for(|acked| *acked).await.is_err() {
                return Err(Error::Closed);
            }
        }
        out.win = out.win.wrapping_add(1);
    }

    let sn = out.sn;
    let (ack_tx, ack_rx) = watch::channel(false);
    let retransmit_rx = ack_tx.subscribe();
    {
        // The close path clears this registry under the same lock, checking
        // the flag here keeps a racing close from leaving the entry behind.
        let mut acks = chan.acks.lock().unwrap();
        if core.is_closing() {
            return Err(Error::Closed);
        }
        acks.insert(sn, ack_tx);
    }

    let mut rel = Vec::with_capacity(REL_HDR_SIZE + raw.len());
    rel.push(RawType::REL);
    rel.extend_from_slice(&sn.to_be_bytes());
    rel.extend_from_slice(raw);

    // The datagram is framed once and retransmitted verbatim. A remote id
    // assigned after this point does not reach frames already queued.
    let remote_id = core.remote_id.read().await;
    let datagram = frame_datagram(*remote_id, channel, &rel);
    drop(remote_id);

    if datagram.len() > MAX_NET_PKT_SIZE {
        chan.acks.lock().unwrap().remove(&sn);
        return Err(Error::PktTooLong);
    }

    if let Err(err) = core.write_datagram(&datagram).await {
        chan.acks.lock().unwrap().remove(&sn);
        return Err(err);
    }

    out.sn = out.sn.wrapping_add(1);
    drop(out);

    tokio::spawn(retransmit(core.clone(), datagram, retransmit_rx));

    Ok(AckWait {
        signals: vec![ack_rx],
    })
}

enum Resend {
    Again,
    Stop,
}

async fn retransmit(core: Arc<Core>, datagram: Vec<u8>, mut ack: watch::Receiver<bool>) {
    loop {
        let next = async {
            time::sleep(REL_RESEND_AFTER).await;
            Resend::Again
        }
        .or(async {
            // Err means the connection closed with the ack outstanding.
            let _ = ack.wait_for(|acked| *acked).await;
            Resend::Stop
        })
        .or(async {
            core.wait_closed().await;
            Resend::Stop
        })
        .await;

        match next {
            Resend::Stop => return,
            Resend::Again => {
                if core.write_datagram(&datagram).await.is_err() {
                    return;
                }
            },
        }
    }
}

async fn send_pkt(core: &Arc<Core>, pkt: &Pkt) -> Result<Option<AckWait>, Error> {
    let PktInfo { channel, unrel } = pkt.info;
    if channel >= CHANNEL_COUNT {
        return Err(Error::ChannelOutOfRange(channel));
    }

    let mut hdr_size = NET_HDR_SIZE;
    if !unrel {
        hdr_size += REL_HDR_SIZE;
    }

    if hdr_size + ORIG_HDR_SIZE + pkt.data.len() <= MAX_NET_PKT_SIZE {
        let mut raw = Vec::with_capacity(ORIG_HDR_SIZE + pkt.data.len());
        raw.push(RawType::ORIG);
        raw.extend_from_slice(&pkt.data);
        return send_raw(core, &raw, pkt.info).await;
    }

    let chunk_size = MAX_NET_PKT_SIZE - (hdr_size + SPLIT_HDR_SIZE);
    let count = pkt.data.len().div_ceil(chunk_size);
    if count > u16::MAX as usize {
        return Err(Error::PktTooLong);
    }

    let sn = {
        let mut out_split_sn = core.chans[channel as usize].out_split_sn.lock().unwrap();
        let sn = *out_split_sn;
        *out_split_sn = out_split_sn.wrapping_add(1);
        sn
    };

    let mut signals = Vec::new();
    for (index, chunk) in pkt.data.chunks(chunk_size).enumerate() {
        let mut raw = Vec::with_capacity(SPLIT_HDR_SIZE + chunk.len());
        raw.push(RawType::SPLIT);
        raw.extend_from_slice(&sn.to_be_bytes());
        raw.extend_from_slice(&(count as u16).to_be_bytes());
        raw.extend_from_slice(&(index as u16).to_be_bytes());
        raw.extend_from_slice(chunk);
        if let Some(mut ack) = send_raw(core, &raw, pkt.info).await? {
            signals.append(&mut ack.signals);
        }
    }

    if unrel {
        Ok(None)
    } else {
        Ok(Some(AckWait { signals }))
    }
}

async fn read_loop(core: Arc<Core>) {
    let mut chans: [ChannelProc; CHANNEL_COUNT as usize] = array::from_fn(|_| ChannelProc::new());

    loop {
        let next = async { Some(core.endpoint.read().await) }
            .or(async {
                core.wait_closed().await;
                None
            })
            .await;

        let datagram = match next {
            None => return,
            Some(Ok(datagram)) => datagram,
            Some(Err(Error::Closed)) => return,
            Some(Err(err)) => {
                // The socket is beyond use.
                let _ = core.close_disco(Some(err)).await;
                return;
            },
        };

        if let Err(err) = process_udp(&core, &mut chans, &datagram).await {
            core.report("udp", err);
        }
    }
}

async fn process_udp(
    core: &Arc<Core>,
    chans: &mut [ChannelProc; CHANNEL_COUNT as usize],
    datagram: &[u8],
) -> Result<(), Error> {
    // Any inbound datagram, even a malformed one, resets the idle timer.
    core.mark_recv();

    let mut cursor = Cursor::new(datagram);
    let proto_id = read_u32(&mut cursor)?;
    if proto_id != PROTO_ID {
        return Err(Error::UnsupportedProtoId(proto_id));
    }

    // Src peer id. Peers are identified by address, not by this field.
    let _ = read_u16(&mut cursor)?;

    let channel = read_u8(&mut cursor)?;
    if channel >= CHANNEL_COUNT {
        return Err(Error::ChannelOutOfRange(channel));
    }

    process_raw(
        core,
        chans,
        &datagram[NET_HDR_SIZE ..],
        PktInfo {
            channel,
            unrel: true,
        },
    )
    .await
}

/// Indirection that lets `process_raw` recurse into reliable payloads.
fn process_raw_boxed<'a>(
    core: &'a Arc<Core>,
    chans: &'a mut [ChannelProc; CHANNEL_COUNT as usize],
    data: &'a [u8],
    info: PktInfo,
) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
    Box::pin(process_raw(core, chans, data, info))
}

async fn process_raw(
    core: &Arc<Core>,
    chans: &mut [ChannelProc; CHANNEL_COUNT as usize],
    data: &[u8],
    info: PktInfo,
) -> Result<(), Error> {
    let mut cursor = Cursor::new(data);

    match read_u8(&mut cursor)? {
        RawType::CTL => match read_u8(&mut cursor)? {
            CtlType::ACK => {
                let sn = read_u16(&mut cursor)?;
                let ack = core.chans[info.channel as usize]
                    .acks
                    .lock()
                    .unwrap()
                    .remove(&sn);
                if let Some(ack) = ack {
                    // Fires at most once, the registry entry is gone now.
                    ack.send_replace(true);
                }
                check_trailing(&cursor)
            },
            CtlType::SET_PEER_ID => {
                let id = read_u16(&mut cursor)?;
                {
                    // Exclusive side of the lock every header-stamping
                    // sender shares.
                    let mut remote_id = core.remote_id.write().await;
                    if *remote_id != PEER_ID_NIL {
                        return Err(Error::PeerIdAlreadySet);
                    }
                    *remote_id = id;
                }
                check_trailing(&cursor)
            },
            CtlType::PING => check_trailing(&cursor),
            CtlType::DISCO => {
                let _ = core.close_quiet(None);
                check_trailing(&cursor)
            },
            other => Err(Error::UnsupportedCtlType(other)),
        },
        RawType::ORIG => {
            core.deliver(Pkt {
                data: data[ORIG_HDR_SIZE ..].to_vec(),
                info,
            })
            .await;
            Ok(())
        },
        RawType::SPLIT => process_split(core, &mut cursor, info).await,
        RawType::REL => {
            let sn = read_u16(&mut cursor)?;

            // Ack unconditionally, duplicates included: the previous ack
            // may have been lost.
            let mut ack_raw = [RawType::CTL, CtlType::ACK, 0, 0];
            ack_raw[2 .. 4].copy_from_slice(&sn.to_be_bytes());
            if let Err(err) = send_raw(
                core,
                &ack_raw,
                PktInfo {
                    channel: info.channel,
                    unrel: true,
                },
            )
            .await
            {
                if matches!(err, Error::Closed) {
                    return Ok(());
                }
                return Err(err);
            }

            let index = info.channel as usize;
            {
                let chan = &mut chans[index];
                if !in_half_window(chan.in_rel_sn, sn) {
                    // Already received.
                    return Ok(());
                }
                chan.in_rels
                    .insert(sn, data[cursor.position() as usize ..].to_vec());
            }

            // Drain every consecutive buffered seqnum.
            loop {
                let inner = {
                    let chan = &mut chans[index];
                    let expected = chan.in_rel_sn;
                    match chan.in_rels.remove(&expected) {
                        Some(inner) => inner,
                        None => break,
                    }
                };
                let inner_info = PktInfo {
                    channel: info.channel,
                    unrel: false,
                };
                if let Err(err) = process_raw_boxed(core, chans, &inner, inner_info).await {
                    core.report("rel", err);
                }
                chans[index].in_rel_sn = chans[index].in_rel_sn.wrapping_add(1);
            }

            Ok(())
        },
        other => Err(Error::UnsupportedRawType(other)),
    }
}

async fn process_split(
    core: &Arc<Core>,
    cursor: &mut Cursor<&[u8]>,
    info: PktInfo,
) -> Result<(), Error> {
    let sn = read_u16(cursor)?;
    let count = read_u16(cursor)?;
    let index = read_u16(cursor)?;

    if index >= count {
        return Err(Error::BadChunkIndex { index, count });
    }

    let chunk = &cursor.get_ref()[cursor.position() as usize ..];
    let chan = &core.chans[info.channel as usize];

    let mut armed = None;
    let completed = {
        let mut splits = chan.in_splits.write().unwrap();

        // Drop whatever was left at the opposite half of the seqnum space
        // so stale entries can't accumulate.
        splits.remove(&sn.wrapping_sub(0x8000));

        let now = Instant::now();
        let entry = splits.entry(sn).or_insert_with(|| {
            let epoch = core.split_epoch.fetch_add(1, Ordering::Relaxed);
            if info.unrel {
                armed = Some(epoch);
            }
            InSplit {
                chunks: vec![None; count as usize],
                got: 0,
                size: 0,
                done: false,
                deadline: now + CONN_TIMEOUT,
                epoch,
            }
        });

        if entry.done {
            // Late chunk of an already delivered packet.
            None
        } else {
            if entry.chunks.len() != count as usize {
                return Err(Error::ChunkCountMismatch {
                    was: entry.chunks.len() as u16,
                    now: count,
                });
            }

            if entry.chunks[index as usize].is_none() {
                entry.size += chunk.len();
                entry.chunks[index as usize] = Some(chunk.to_vec());
                entry.got += 1;
            }
            entry.deadline = now + CONN_TIMEOUT;

            if entry.got == count {
                entry.done = true;
                let mut data = Vec::with_capacity(entry.size);
                for chunk in entry.chunks.drain(..) {
                    data.extend_from_slice(&chunk.unwrap());
                }
                Some(data)
            } else {
                None
            }
        }
    };

    if let Some(epoch) = armed {
        tokio::spawn(evict_split(core.clone(), info.channel, sn, epoch));
    }

    if let Some(data) = completed {
        core.deliver(Pkt { data, info }).await;
    }

    Ok(())
}

/// Removes an unreliable split entry that stopped making progress. Chunk
/// arrivals push the deadline forward.
async fn evict_split(core: Arc<Core>, channel: Channel, sn: Seqnum, epoch: u64) {
    let chan = &core.chans[channel as usize];

    loop {
        let deadline = {
            let splits = chan.in_splits.read().unwrap();
            match splits.get(&sn) {
                Some(entry) if entry.epoch == epoch => entry.deadline,
                _ => return,
            }
        };

        if Instant::now() >= deadline {
            let mut splits = chan.in_splits.write().unwrap();
            if splits.get(&sn).map(|entry| entry.epoch) == Some(epoch) {
                splits.remove(&sn);
                debug!("evicted stale split {} on channel {}", sn, channel);
            }
            return;
        }

        let closed = async {
            time::sleep_until(deadline).await;
            false
        }
        .or(async {
            core.wait_closed().await;
            true
        })
        .await;

        if closed {
            return;
        }
    }
}

/// Pings after [`PING_TIMEOUT`] of outbound silence. Every outgoing
/// datagram, acks and retransmits included, pushes the deadline forward.
async fn ping_loop(core: Arc<Core>) {
    let ping = [RawType::CTL, CtlType::PING];

    loop {
        let deadline = core.last_send() + PING_TIMEOUT;

        if Instant::now() >= deadline {
            let info = PktInfo {
                channel: 0,
                unrel: true,
            };
            if send_raw(&core, &ping, info).await.is_err() {
                return;
            }
            continue;
        }

        if sleep_or_closed(&core, deadline).await {
            return;
        }
    }
}

/// Disconnects after [`CONN_TIMEOUT`] without any inbound datagram.
async fn timeout_loop(core: Arc<Core>) {
    loop {
        let deadline = core.last_recv() + CONN_TIMEOUT;

        if Instant::now() >= deadline {
            let _ = core.close_disco(Some(Error::TimedOut)).await;
            return;
        }

        if sleep_or_closed(&core, deadline).await {
            return;
        }
    }
}

/// Returns `true` if the connection closed before the deadline.
async fn sleep_or_closed(core: &Core, deadline: Instant) -> bool {
    async {
        time::sleep_until(deadline).await;
        false
    }
    .or(async {
        core.wait_closed().await;
        true
    })
    .await
}

/// One-shot signal that an outgoing reliable packet, every chunk of a split
/// one included, was acknowledged by the peer.
pub struct AckWait {
    signals: Vec<watch::Receiver<bool>>,
}

impl AckWait {
    /// Resolves once the packet is fully acknowledged. Returns
    /// [`Error::Closed`] if the connection closes with the ack outstanding.
    pub async fn wait(mut self) -> Result<(), Error> {
        for signal in &mut self.signals {
            signal
                .wait_for(|acked| *acked)
                .await
                .map_err(|_| Error::Closed)?;
        }
        Ok(())
    }
}

/// A connection to a client or server.
///
/// All methods take `&self` and are safe for concurrent use. Reliable
/// delivery depends on the peer acknowledging what it receives, so `recv`
/// should be polled in a loop even if the incoming packets are of no
/// interest.
pub struct Conn {
    core: Arc<Core>,
}

impl Conn {
    /// Must be called within a tokio runtime, the connection drives itself
    /// with background tasks.
    pub(crate) fn open(endpoint: Endpoint, id: PeerId, remote_id: PeerId) -> Self {
        let (pkts_tx, pkts_rx) = flume::bounded(0);
        let (errs_tx, errs_rx) = flume::bounded(ERR_QUEUE_LENGTH);
        let (closed_tx, closed_rx) = watch::channel(false);
        let now = Instant::now();

        let core = Arc::new(Core {
            endpoint,
            id,
            remote_id: AsyncRwLock::new(remote_id),
            chans: array::from_fn(|_| ChannelShared::new()),
            pkts_tx,
            pkts_rx,
            errs_tx,
            errs_rx,
            closing: AtomicBool::new(false),
            why: SyncMutex::new(None),
            closed_tx,
            closed_rx,
            last_recv: SyncMutex::new(now),
            last_send: SyncMutex::new(now),
            split_epoch: AtomicU64::new(0),
        });

        tokio::spawn(read_loop(core.clone()));
        tokio::spawn(ping_loop(core.clone()));
        tokio::spawn(timeout_loop(core.clone()));

        Conn { core }
    }

    /// Tells the peer which id was assigned to it. Sent reliably so the
    /// assignment survives datagram loss.
    pub(crate) async fn assign_peer_id(&self, id: PeerId) -> Result<(), Error> {
        let mut raw = [RawType::CTL, CtlType::SET_PEER_ID, 0, 0];
        raw[2 .. 4].copy_from_slice(&id.to_be_bytes());
        send_raw(
            &self.core,
            &raw,
            PktInfo {
                channel: 0,
                unrel: false,
            },
        )
        .await?;
        Ok(())
    }

    /// Sends a packet to the peer.
    ///
    /// For a reliable packet, returns an [`AckWait`] that fires when every
    /// chunk was acknowledged. Blocks while the channel's reliable send
    /// window is exhausted.
    pub async fn send(&self, pkt: &Pkt) -> Result<Option<AckWait>, Error> {
        send_pkt(&self.core, pkt).await
    }

    /// Receives a packet from the peer.
    ///
    /// Besides packets, this surfaces per-datagram processing errors of the
    /// connection. Such an error does not mean the connection is dead, only
    /// [`Error::Closed`] does.
    pub async fn recv(&self) -> Result<Pkt, Error> {
        let core = &self.core;

        async { core.pkts_rx.recv_async().await.map_err(|_| Error::Closed) }
            .or(async {
                match core.errs_rx.recv_async().await {
                    Ok(err) => Err(err),
                    Err(_) => Err(Error::Closed),
                }
            })
            .or(async {
                core.wait_closed().await;
                Err(Error::Closed)
            })
            .await
    }

    /// Closes the connection, telling the peer with a best-effort
    /// disconnect datagram. Blocked `send` and `recv` calls return
    /// [`Error::Closed`].
    pub async fn close(&self) -> Result<(), Error> {
        self.core.close_disco(None).await
    }

    /// Resolves when the connection is closed.
    pub async fn closed(&self) {
        self.core.wait_closed().await;
    }

    pub fn is_closed(&self) -> bool {
        *self.core.closed_rx.borrow()
    }

    /// The error that caused the connection to close, if any. `None` while
    /// the connection is open, and also after a local close or a peer
    /// disconnect.
    pub fn why_closed(&self) -> Option<Error> {
        if !self.is_closed() {
            return None;
        }
        self.core.why.lock().unwrap().clone()
    }

    /// The peer id of the connection: [`PEER_ID_SRV`](crate::PEER_ID_SRV)
    /// for a client-side connection, the assigned client id for an accepted
    /// one.
    pub fn id(&self) -> PeerId {
        self.core.id
    }

    /// Whether this is a connection to a server.
    pub fn is_srv(&self) -> bool {
        self.core.id == PEER_ID_SRV
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.endpoint.local_addr()
    }

    pub fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.core.endpoint.remote_addr()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.core.close_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_framing() {
        let datagram = frame_datagram(2, 1, &[RawType::ORIG, 0xaa]);
        assert_eq!(
            datagram,
            vec![0x4f, 0x45, 0x74, 0x03, 0x00, 0x02, 0x01, 0x01, 0xaa]
        );
        assert_eq!(datagram.len(), NET_HDR_SIZE + 2);
    }

    #[test]
    fn control_frames() {
        let disco = frame_datagram(0, 0, &[RawType::CTL, CtlType::DISCO]);
        assert_eq!(disco, vec![0x4f, 0x45, 0x74, 0x03, 0, 0, 0, 0, 3]);

        let mut ack = [RawType::CTL, CtlType::ACK, 0, 0];
        ack[2 .. 4].copy_from_slice(&INIT_SEQNUM.to_be_bytes());
        assert_eq!(ack, [0, 0, 0xff, 0xdc]);
    }
}
