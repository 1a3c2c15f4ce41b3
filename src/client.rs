//! Client side of the transport.
//!
//! # Examples
//!
//! ```no_run
//! use futures_lite::future;
//! use voxel_rudp::{
//!     client::Client,
//!     Pkt,
//!     PktInfo,
//! };
//!
//! async fn example() {
//!     let conn = Client::bind(([127, 0, 0, 1], 0))
//!         .await
//!         .expect("socket bound")
//!         .connect(([127, 0, 0, 1], 30000))
//!         .await
//!         .expect("connected to server");
//!
//!     let hello = Pkt {
//!         data: b"hello".to_vec(),
//!         info: PktInfo {
//!             channel: 0,
//!             unrel: false,
//!         },
//!     };
//!
//!     let ack = conn
//!         .send(&hello)
//!         .await
//!         .expect("packet sent")
//!         .expect("reliable sends return an ack handle");
//!
//!     // Receiving drains the inbound processor, keep polling it even if
//!     // the packets themselves are of no interest.
//!     let recv_future = async {
//!         while let Ok(pkt) = conn.recv().await {
//!             println!("channel {}: {:?}", pkt.info.channel, pkt.data);
//!         }
//!     };
//!
//!     let ack_future = async {
//!         ack.wait().await.expect("acknowledged");
//!     };
//!
//!     future::or(recv_future, ack_future).await;
//! }
//! ```

use crate::{
    conn::{
        Conn,
        Endpoint,
    },
    Error,
    PEER_ID_NIL,
    PEER_ID_SRV,
};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Connection builder.
pub struct Client {
    socket: UdpSocket,
}

impl Client {
    /// Binds the local socket.
    pub async fn bind<A>(bind_address: A) -> Result<Self, Error>
    where
        A: Into<SocketAddr>,
    {
        let socket = UdpSocket::bind(bind_address.into()).await?;
        Ok(Self { socket })
    }

    /// Uses the bound socket to connect to the server.
    pub async fn connect<A>(self, server_address: A) -> Result<Conn, Error>
    where
        A: Into<SocketAddr>,
    {
        let Client { socket } = self;
        socket.connect(server_address.into()).await?;
        Ok(connect(socket))
    }
}

/// Produces a client-side connection over a socket that is already
/// connected to the server address.
///
/// There is no handshake, the connection is usable at once. The server
/// assigns our peer id with its first control packet; datagrams sent before
/// that are stamped with the nil id, which the server ignores anyway.
pub fn connect(socket: UdpSocket) -> Conn {
    Conn::open(Endpoint::Client { socket }, PEER_ID_SRV, PEER_ID_NIL)
}
