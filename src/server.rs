//! Server side of the transport.
//!
//! A listener demultiplexes one UDP socket by source address. The first
//! datagram from an unknown address allocates a fresh peer id, sends it to
//! the peer and queues a new connection for [`Listener::accept`].
//!
//! # Examples
//!
//! ```no_run
//! use voxel_rudp::server::ListenerParameters;
//!
//! async fn example() {
//!     let listener = ListenerParameters::default()
//!         .bind(([127, 0, 0, 1], 30000))
//!         .await
//!         .expect("socket bound");
//!
//!     while let Ok(conn) = listener.accept().await {
//!         tokio::spawn(async move {
//!             while let Ok(pkt) = conn.recv().await {
//!                 println!(
//!                     "peer {} channel {}: {} bytes",
//!                     conn.id(),
//!                     pkt.info.channel,
//!                     pkt.data.len()
//!                 );
//!             }
//!         });
//!     }
//! }
//! ```

use crate::{
    conn::{
        Conn,
        Endpoint,
    },
    Error,
    PeerId,
    MAX_NET_PKT_SIZE,
    PEER_ID_CLT_MIN,
    PEER_ID_NIL,
    PEER_ID_SRV,
};
use flume::{
    Receiver as ChannelRx,
    Sender as ChannelTx,
    TrySendError,
};
use futures_lite::future::FutureExt;
use log::{
    debug,
    warn,
};
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex as SyncMutex,
    },
};
use tokio::{
    net::UdpSocket,
    sync::watch,
};

/// Default per-connection buffer of inbound datagrams nobody consumed yet.
pub const DEFAULT_QUEUE_LENGTH: usize = 256;

const ERR_QUEUE_LENGTH: usize = 32;

#[derive(Clone)]
struct Entry {
    datagrams: ChannelTx<Vec<u8>>,
    accepted: Arc<AtomicBool>,
    closed: watch::Receiver<bool>,
}

struct Conns {
    by_addr: HashMap<SocketAddr, Entry>,
    ids: HashMap<PeerId, SocketAddr>,
    next_id: PeerId,
}

struct Shared {
    socket: Arc<UdpSocket>,
    queue_length: usize,
    conns: SyncMutex<Conns>,
    accept_tx: ChannelTx<(Conn, Arc<AtomicBool>)>,
    accept_rx: ChannelRx<(Conn, Arc<AtomicBool>)>,
    errs_tx: ChannelTx<Error>,
    errs_rx: ChannelRx<Error>,
    closing: AtomicBool,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    // Fires once the listener is closed and the last accepted connection
    // has deregistered. Stops the read task.
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Shared {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed_rx.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn wait_shutdown(&self) {
        let mut shutdown = self.shutdown_rx.clone();
        let _ = shutdown.wait_for(|shutdown| *shutdown).await;
    }

    fn maybe_shutdown(&self) {
        if self.is_closing() && self.conns.lock().unwrap().by_addr.is_empty() {
            self.shutdown_tx.send_replace(true);
        }
    }

    fn report(&self, err: Error) {
        warn!("listener: {}", err);
        let _ = self.errs_tx.try_send(err);
    }
}

/// Listener parameters.
#[derive(Debug)]
pub struct ListenerParameters {
    /// How many inbound datagrams are buffered per connection that is not
    /// consuming them yet. A connection nobody accepted loses datagrams
    /// beyond this, an accepted one backpressures the shared read task.
    pub queue_length: usize,
}

impl Default for ListenerParameters {
    fn default() -> Self {
        Self {
            queue_length: DEFAULT_QUEUE_LENGTH,
        }
    }
}

impl ListenerParameters {
    /// Binds a socket and serves connections over it.
    pub async fn bind<A>(self, bind_address: A) -> Result<Listener, Error>
    where
        A: Into<SocketAddr>,
    {
        let socket = UdpSocket::bind(bind_address.into()).await?;
        Ok(self.listen(socket))
    }

    /// Serves connections over an already bound socket. Must be called
    /// within a tokio runtime.
    pub fn listen(self, socket: UdpSocket) -> Listener {
        let (accept_tx, accept_rx) = flume::bounded(0);
        let (errs_tx, errs_rx) = flume::bounded(ERR_QUEUE_LENGTH);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            socket: Arc::new(socket),
            queue_length: self.queue_length,
            conns: SyncMutex::new(Conns {
                by_addr: HashMap::new(),
                ids: HashMap::new(),
                next_id: PEER_ID_NIL,
            }),
            accept_tx,
            accept_rx,
            errs_tx,
            errs_rx,
            closing: AtomicBool::new(false),
            closed_tx,
            closed_rx,
            shutdown_tx,
            shutdown_rx,
        });

        tokio::spawn(listen_loop(shared.clone()));

        Listener { shared }
    }
}

/// Serves connections over an already bound socket, with default
/// parameters.
pub fn listen(socket: UdpSocket) -> Listener {
    ListenerParameters::default().listen(socket)
}

/// Accepts connections on one UDP socket. All methods take `&self` and are
/// safe for concurrent use.
pub struct Listener {
    shared: Arc<Shared>,
}

impl Listener {
    /// Waits for the next incoming connection.
    pub async fn accept(&self) -> Result<Conn, Error> {
        let shared = &self.shared;

        let (conn, accepted) = async {
            shared
                .accept_rx
                .recv_async()
                .await
                .map_err(|_| Error::Closed)
        }
        .or(async {
            match shared.errs_rx.recv_async().await {
                Ok(err) => Err(err),
                Err(_) => Err(Error::Closed),
            }
        })
        .or(async {
            shared.wait_closed().await;
            Err(Error::Closed)
        })
        .await?;

        // From now on a full datagram queue means backpressure, not loss.
        accepted.store(true, Ordering::SeqCst);

        Ok(conn)
    }

    /// Stops accepting connections. Blocked [`accept`](Self::accept) calls
    /// return [`Error::Closed`]. Connections already accepted keep working,
    /// the shared socket is serviced until the last of them closes.
    pub fn close(&self) -> Result<(), Error> {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.shared.closed_tx.send_replace(true);
        self.shared.maybe_shutdown();
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

async fn listen_loop(shared: Arc<Shared>) {
    let mut buf = vec![0; MAX_NET_PKT_SIZE];

    loop {
        let next = async { Some(shared.socket.recv_from(&mut buf).await) }
            .or(async {
                shared.wait_shutdown().await;
                None
            })
            .await;

        let (len, addr) = match next {
            None => return,
            Some(Ok(from)) => from,
            Some(Err(err)) => {
                shared.report(err.into());
                continue;
            },
        };

        dispatch(&shared, addr, buf[.. len].to_vec()).await;
    }
}

async fn dispatch(shared: &Arc<Shared>, addr: SocketAddr, datagram: Vec<u8>) {
    let entry = shared.conns.lock().unwrap().by_addr.get(&addr).cloned();

    let entry = match entry {
        Some(entry) => entry,
        None => {
            if shared.is_closing() {
                return;
            }
            match add_conn(shared, addr) {
                Ok(entry) => entry,
                Err(err) => {
                    shared.report(err);
                    return;
                },
            }
        },
    };

    match entry.datagrams.try_send(datagram) {
        Ok(()) => {},
        // The connection is gone. The next datagram from this address
        // starts a fresh one.
        Err(TrySendError::Disconnected(_)) => {},
        Err(TrySendError::Full(datagram)) => {
            if entry.accepted.load(Ordering::SeqCst) {
                // An accepted connection must not lose datagrams to a slow
                // consumer, so the read task waits here, but never on a
                // connection that closed under it.
                let mut closed = entry.closed.clone();
                async {
                    let _ = entry.datagrams.send_async(datagram).await;
                }
                .or(async {
                    let _ = closed.wait_for(|closed| *closed).await;
                })
                .await;
            } else {
                debug!("dropped datagram for unaccepted connection {}", addr);
            }
        },
    }
}

/// Registers a connection for a new source address and queues it for
/// accept.
fn add_conn(shared: &Arc<Shared>, addr: SocketAddr) -> Result<Entry, Error> {
    let (entry_closed_tx, entry_closed_rx) = watch::channel(false);

    let (id, datagrams_rx, entry) = {
        let mut conns = shared.conns.lock().unwrap();

        // Rolling id allocation: skip the reserved ids and ids in use,
        // fail once the counter comes around to where it started.
        let start = conns.next_id;
        conns.next_id = conns.next_id.wrapping_add(1);
        while conns.next_id < PEER_ID_CLT_MIN || conns.ids.contains_key(&conns.next_id) {
            if conns.next_id == start {
                return Err(Error::OutOfPeerIds);
            }
            conns.next_id = conns.next_id.wrapping_add(1);
        }
        let id = conns.next_id;

        let (datagrams_tx, datagrams_rx) = flume::bounded(shared.queue_length);
        let entry = Entry {
            datagrams: datagrams_tx,
            accepted: Arc::new(AtomicBool::new(false)),
            closed: entry_closed_rx,
        };

        conns.ids.insert(id, addr);
        conns.by_addr.insert(addr, entry.clone());

        (id, datagrams_rx, entry)
    };

    let unregister = {
        let shared = shared.clone();
        Box::new(move || {
            {
                let mut conns = shared.conns.lock().unwrap();
                conns.ids.remove(&id);
                conns.by_addr.remove(&addr);
            }
            entry_closed_tx.send_replace(true);
            shared.maybe_shutdown();
        }) as Box<dyn Fn() + Send + Sync>
    };

    let conn = Conn::open(
        Endpoint::Accepted {
            socket: shared.socket.clone(),
            remote: addr,
            datagrams: datagrams_rx,
            unregister,
        },
        id,
        PEER_ID_SRV,
    );

    let accepted = entry.accepted.clone();
    let shared = shared.clone();
    tokio::spawn(async move {
        // Greet the peer with its assigned id. A send failure has already
        // closed the connection, accept surfaces that soon enough.
        let _ = conn.assign_peer_id(id).await;

        async {
            let _ = shared.accept_tx.send_async((conn, accepted)).await;
        }
        .or(async {
            // Listener closed with the connection still pending. Dropping
            // the queued connection closes it.
            shared.wait_closed().await;
        })
        .await;
    });

    Ok(entry)
}
