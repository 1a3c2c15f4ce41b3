use futures_lite::future;
use std::{
    iter,
    time::Duration,
};
use tokio::time;
use voxel_rudp::{
    client::Client,
    server::ListenerParameters,
    Pkt,
    PktInfo,
};

fn unrel(channel: u8, data: &[u8]) -> Pkt {
    Pkt {
        data: data.to_vec(),
        info: PktInfo {
            channel,
            unrel: true,
        },
    }
}

#[tokio::test]
async fn small_packets_both_directions() {
    let _ = env_logger::try_init();

    let listener = ListenerParameters::default()
        .bind(([127, 0, 0, 1], 0))
        .await
        .expect("server socket bind");
    let server_addr = listener.local_addr().expect("server addr");

    let server_task = async {
        let conn = listener.accept().await.expect("connection accepted");

        let pkt = conn.recv().await.expect("server message receive");
        assert_eq!(pkt.data, b"2HelloWorld2");
        assert_eq!(pkt.info.channel, 1);
        assert!(pkt.info.unrel);

        let ack = conn
            .send(&unrel(0, b"1HelloWorld1"))
            .await
            .expect("server sent packet");
        assert!(ack.is_none());

        conn
    };

    let client_task = async {
        time::sleep(Duration::from_millis(5)).await;

        let conn = Client::bind(([127, 0, 0, 1], 0))
            .await
            .expect("client bound")
            .connect(server_addr)
            .await
            .expect("client connection");

        let ack = conn
            .send(&unrel(1, b"2HelloWorld2"))
            .await
            .expect("client sent packet");
        assert!(ack.is_none());

        let pkt = conn.recv().await.expect("client message receive");
        assert_eq!(pkt.data, b"1HelloWorld1");
        assert_eq!(pkt.info.channel, 0);
        assert!(pkt.info.unrel);

        conn
    };

    future::zip(server_task, client_task).await;
}

#[tokio::test]
async fn split_packet_reassembled() {
    let _ = env_logger::try_init();

    // Five chunks at the 498-byte unreliable chunk capacity.
    let data = iter::repeat([1u8, 2, 3, 4, 5])
        .take(400)
        .flatten()
        .collect::<Vec<_>>();

    let listener = ListenerParameters::default()
        .bind(([127, 0, 0, 1], 0))
        .await
        .expect("server socket bind");
    let server_addr = listener.local_addr().expect("server addr");

    let server_task = async {
        let conn = listener.accept().await.expect("connection accepted");

        let pkt = conn.recv().await.expect("server message receive");
        assert_eq!(pkt.data, data);
        assert_eq!(pkt.info.channel, 2);
        assert!(pkt.info.unrel);

        conn
    };

    let client_task = async {
        time::sleep(Duration::from_millis(5)).await;

        let conn = Client::bind(([127, 0, 0, 1], 0))
            .await
            .expect("client bound")
            .connect(server_addr)
            .await
            .expect("client connection");

        conn.send(&unrel(2, &data))
            .await
            .expect("client sent packet");

        conn
    };

    future::zip(server_task, client_task).await;
}

#[tokio::test]
async fn boundary_payload_sizes() {
    let _ = env_logger::try_init();

    let listener = ListenerParameters::default()
        .bind(([127, 0, 0, 1], 0))
        .await
        .expect("server socket bind");
    let server_addr = listener.local_addr().expect("server addr");

    let server_task = async {
        let conn = listener.accept().await.expect("connection accepted");

        // One byte.
        let pkt = conn.recv().await.expect("server message receive");
        assert_eq!(pkt.data, b"x");

        // Largest payload that still fits a single unreliable datagram.
        let pkt = conn.recv().await.expect("server message receive");
        assert_eq!(pkt.data.len(), 504);
        assert!(pkt.data.iter().all(|byte| *byte == 0xab));

        // One byte past that, delivered via split.
        let pkt = conn.recv().await.expect("server message receive");
        assert_eq!(pkt.data.len(), 505);
        assert!(pkt.data.iter().all(|byte| *byte == 0xcd));

        conn
    };

    let client_task = async {
        time::sleep(Duration::from_millis(5)).await;

        let conn = Client::bind(([127, 0, 0, 1], 0))
            .await
            .expect("client bound")
            .connect(server_addr)
            .await
            .expect("client connection");

        conn.send(&unrel(0, b"x")).await.expect("one byte sent");
        time::sleep(Duration::from_millis(20)).await;

        conn.send(&unrel(0, &[0xab; 504])).await.expect("504 sent");
        time::sleep(Duration::from_millis(20)).await;

        conn.send(&unrel(0, &[0xcd; 505])).await.expect("505 sent");

        conn
    };

    future::zip(server_task, client_task).await;
}
