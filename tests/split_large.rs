use futures_lite::future;
use std::time::Duration;
use tokio::time;
use voxel_rudp::{
    client::Client,
    server::ListenerParameters,
    Error,
    Pkt,
    PktInfo,
    MAX_REL_PKT_SIZE,
    MAX_UNREL_PKT_SIZE,
};

fn pkt(channel: u8, unrel: bool, data: Vec<u8>) -> Pkt {
    Pkt {
        data,
        info: PktInfo { channel, unrel },
    }
}

#[tokio::test]
async fn large_reliable_split() {
    let _ = env_logger::try_init();

    // 102 chunks at the 495-byte reliable chunk capacity.
    let data = (0 .. 50_000u32).map(|i| i as u8).collect::<Vec<_>>();

    let listener = ListenerParameters::default()
        .bind(([127, 0, 0, 1], 0))
        .await
        .expect("server socket bind");
    let server_addr = listener.local_addr().expect("server addr");

    let server_task = async {
        let conn = listener.accept().await.expect("connection accepted");

        let pkt = conn.recv().await.expect("server message receive");
        assert_eq!(pkt.data.len(), 50_000);
        assert_eq!(pkt.data, data);
        assert_eq!(pkt.info.channel, 1);
        assert!(!pkt.info.unrel);

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
            .send(&pkt(1, false, data.clone()))
            .await
            .expect("client sent packet")
            .expect("reliable send returns an ack handle");

        // Fires only once every chunk is acknowledged.
        ack.wait().await.expect("all chunks acknowledged");

        conn
    };

    future::zip(server_task, client_task).await;
}

#[tokio::test]
async fn mixed_size_reliable_stream() {
    let _ = env_logger::try_init();

    let listener = ListenerParameters::default()
        .bind(([127, 0, 0, 1], 0))
        .await
        .expect("server socket bind");
    let server_addr = listener.local_addr().expect("server addr");

    let sizes = [1usize, 400, 501, 502, 1500, 4000, 10_000];

    let server_task = async {
        let conn = listener.accept().await.expect("connection accepted");

        for (round, size) in sizes.iter().enumerate() {
            let pkt = conn.recv().await.expect("server message receive");
            assert_eq!(pkt.data.len(), *size);
            assert!(pkt.data.iter().all(|byte| *byte == round as u8));
            assert!(!pkt.info.unrel);
        }

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

        for (round, size) in sizes.iter().enumerate() {
            conn.send(&pkt(0, false, vec![round as u8; *size]))
                .await
                .expect("client sent packet");
        }

        conn
    };

    future::zip(server_task, client_task).await;
}

#[tokio::test]
async fn oversized_payloads_are_rejected() {
    let _ = env_logger::try_init();

    let listener = ListenerParameters::default()
        .bind(([127, 0, 0, 1], 0))
        .await
        .expect("server socket bind");
    let server_addr = listener.local_addr().expect("server addr");

    let conn = Client::bind(([127, 0, 0, 1], 0))
        .await
        .expect("client bound")
        .connect(server_addr)
        .await
        .expect("client connection");

    // One byte past the chunk count space of each kind.
    let result = conn
        .send(&pkt(0, false, vec![0; MAX_REL_PKT_SIZE + 1]))
        .await;
    assert!(matches!(result, Err(Error::PktTooLong)));

    let result = conn
        .send(&pkt(0, true, vec![0; MAX_UNREL_PKT_SIZE + 1]))
        .await;
    assert!(matches!(result, Err(Error::PktTooLong)));

    // Unreliable chunks are larger, so the unreliable limit is higher.
    assert!(MAX_REL_PKT_SIZE < MAX_UNREL_PKT_SIZE);

    drop(listener);
}
