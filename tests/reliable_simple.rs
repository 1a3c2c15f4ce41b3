use futures_lite::future;
use std::time::Duration;
use tokio::time;
use voxel_rudp::{
    client::Client,
    server::ListenerParameters,
    Pkt,
    PktInfo,
};

fn rel(channel: u8, data: &[u8]) -> Pkt {
    Pkt {
        data: data.to_vec(),
        info: PktInfo {
            channel,
            unrel: false,
        },
    }
}

#[tokio::test]
async fn hello_round_trip() {
    let _ = env_logger::try_init();

    let listener = ListenerParameters::default()
        .bind(([127, 0, 0, 1], 0))
        .await
        .expect("server socket bind");
    let server_addr = listener.local_addr().expect("server addr");

    let server_task = async {
        let conn = listener.accept().await.expect("connection accepted");

        let pkt = conn.recv().await.expect("server message receive");
        assert_eq!(pkt.data, b"0123456789");
        assert_eq!(pkt.info.channel, 0);
        assert!(!pkt.info.unrel);

        assert_eq!(conn.id(), 2);
        assert!(!conn.is_srv());

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

        assert!(conn.is_srv());

        let ack = conn
            .send(&rel(0, b"0123456789"))
            .await
            .expect("client sent packet")
            .expect("reliable send returns an ack handle");

        ack.wait().await.expect("packet acknowledged");

        conn
    };

    future::zip(server_task, client_task).await;
}

#[tokio::test]
async fn ordered_stream_both_directions() {
    let _ = env_logger::try_init();

    let listener = ListenerParameters::default()
        .bind(([127, 0, 0, 1], 0))
        .await
        .expect("server socket bind");
    let server_addr = listener.local_addr().expect("server addr");

    let server_task = async {
        let conn = listener.accept().await.expect("connection accepted");

        for i in 0 .. 1000 {
            conn.send(&rel(0, format!("HelloWorld{}", i).as_bytes()))
                .await
                .expect("server sent packet");
        }

        for i in 0 .. 1000 {
            let pkt = conn.recv().await.expect("server message receive");
            assert_eq!(pkt.data, format!("HelloWorld{}", i).as_bytes());
            assert_eq!(pkt.info.channel, 0);
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

        for i in 0 .. 1000 {
            let pkt = conn.recv().await.expect("client message receive");
            assert_eq!(pkt.data, format!("HelloWorld{}", i).as_bytes());
            assert_eq!(pkt.info.channel, 0);
        }

        for i in 0 .. 1000 {
            conn.send(&rel(0, format!("HelloWorld{}", i).as_bytes()))
                .await
                .expect("client sent packet");
        }

        conn
    };

    future::zip(server_task, client_task).await;
}

#[tokio::test]
async fn channels_are_ordered_independently() {
    let _ = env_logger::try_init();

    let listener = ListenerParameters::default()
        .bind(([127, 0, 0, 1], 0))
        .await
        .expect("server socket bind");
    let server_addr = listener.local_addr().expect("server addr");

    let server_task = async {
        let conn = listener.accept().await.expect("connection accepted");

        let mut next = [0u32; 3];
        for _ in 0 .. 300 {
            let pkt = conn.recv().await.expect("server message receive");
            let channel = pkt.info.channel as usize;
            assert_eq!(
                pkt.data,
                format!("ch{}-{}", channel, next[channel]).as_bytes()
            );
            next[channel] += 1;
        }
        assert_eq!(next, [100, 100, 100]);

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

        for i in 0 .. 100 {
            for channel in 0 .. 3 {
                conn.send(&rel(channel, format!("ch{}-{}", channel, i).as_bytes()))
                    .await
                    .expect("client sent packet");
            }
        }

        conn
    };

    future::zip(server_task, client_task).await;
}

#[tokio::test]
async fn rejects_out_of_range_channel() {
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

    let result = conn.send(&rel(3, b"nope")).await;
    assert!(matches!(
        result,
        Err(voxel_rudp::Error::ChannelOutOfRange(3))
    ));

    drop(listener);
}
