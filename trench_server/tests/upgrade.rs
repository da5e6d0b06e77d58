//! The in-place transport upgrade and direct WebSocket sessions, end to
//! end over real sockets.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use async_tungstenite::tokio::connect_async;
use async_tungstenite::tungstenite::Message;
use futures::{SinkExt, StreamExt};
use testresult::TestResult;
use tokio::net::TcpListener;
use trench_core::{payload, ConnParameters, PacketType};
use trench_server::{FrameKind, Server, ServerConfig, TransportKind};

fn init_tracing() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

async fn start_server(config: ServerConfig) -> (Server, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = Server::new(config);
    tokio::spawn({
        let server = server.clone();
        async move {
            let _ = server.serve(listener).await;
        }
    });
    (server, addr)
}

async fn open_polling(client: &reqwest::Client, addr: SocketAddr) -> ConnParameters {
    let body = client
        .get(format!("http://{addr}/engine.io/?EIO=3&transport=polling"))
        .send()
        .await
        .expect("open request")
        .text()
        .await
        .expect("open body");
    let packets = payload::decode(body.as_bytes()).expect("open payload");
    assert_eq!(packets[0].ptype, PacketType::Open);
    ConnParameters::from_json(&packets[0].data).expect("open params")
}

#[tokio::test]
async fn polling_session_upgrades_to_websocket_without_losing_packets() -> TestResult {
    init_tracing();
    let (server, addr) = start_server(ServerConfig::default()).await;

    // Application side: read messages in arrival order.
    let app = tokio::spawn({
        let server = server.clone();
        async move {
            let session = server.accept().await.expect("accept");
            let mut got = Vec::new();
            while got.len() < 2 {
                let (_frame, data) = session.recv().await.expect("recv");
                got.push(String::from_utf8(data.to_vec()).expect("utf8"));
            }
            (session, got)
        }
    });

    let client = reqwest::Client::new();
    let params = open_polling(&client, addr).await;
    let sid = params.sid;
    assert_eq!(params.upgrades, vec!["websocket".to_owned()]);

    // A message queued on polling just before the upgrade begins.
    let resp = client
        .post(format!(
            "http://{addr}/engine.io/?EIO=3&transport=polling&sid={sid}"
        ))
        .body("6:4later")
        .send()
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    // Probe, commit the upgrade, then talk over the new transport.
    let (mut ws, _) = connect_async(format!(
        "ws://{addr}/engine.io/?EIO=3&transport=websocket&sid={sid}"
    ))
    .await?;
    ws.send(Message::Text("2probe".into())).await?;
    let reply = ws.next().await.expect("probe reply")?;
    assert_eq!(reply, Message::Text("3probe".into()));
    ws.send(Message::Text("5".into())).await?;
    ws.send(Message::Text("4after".into())).await?;

    // Nothing lost, nothing reordered across the swap.
    let (session, got) = app.await?;
    assert_eq!(got, vec!["later".to_owned(), "after".to_owned()]);
    assert_eq!(session.transport().await, TransportKind::Websocket);

    // The upgraded session works in both directions.
    session.send(FrameKind::Text, "down").await?;
    let frame = ws.next().await.expect("server frame")?;
    assert_eq!(frame, Message::Text("4down".into()));
    Ok(())
}

#[tokio::test]
async fn websocket_sessions_open_directly() -> TestResult {
    init_tracing();
    let (server, addr) = start_server(ServerConfig::default()).await;

    let app = tokio::spawn({
        let server = server.clone();
        async move {
            let session = server.accept().await.expect("accept");
            let (frame, data) = session.recv().await.expect("recv");
            assert_eq!(frame, FrameKind::Text);
            session.send(frame, data).await.expect("echo");
            session
        }
    });

    let (mut ws, _) = connect_async(format!(
        "ws://{addr}/engine.io/?EIO=3&transport=websocket"
    ))
    .await?;

    // The first frame is the OPEN packet; no upgrade targets remain.
    let open = ws.next().await.expect("open frame")?;
    let Message::Text(text) = open else {
        panic!("expected a text frame, got {open:?}");
    };
    assert!(text.starts_with('0'));
    let params = ConnParameters::from_json(&text.as_bytes()[1..])?;
    assert!(params.upgrades.is_empty());
    assert_eq!(params.sid.len(), 20);

    ws.send(Message::Text("4echo".into())).await?;
    let reply = ws.next().await.expect("echo reply")?;
    assert_eq!(reply, Message::Text("4echo".into()));

    let session = app.await?;
    assert_eq!(session.transport().await, TransportKind::Websocket);
    Ok(())
}

#[tokio::test]
async fn failed_probe_leaves_the_session_on_polling() -> TestResult {
    init_tracing();
    let (server, addr) = start_server(ServerConfig::default()).await;

    let app = tokio::spawn({
        let server = server.clone();
        async move { server.accept().await.expect("accept") }
    });

    let client = reqwest::Client::new();
    let sid = open_polling(&client, addr).await.sid;
    let session = app.await?;

    // A MESSAGE where the probe PING belongs aborts the upgrade.
    let (mut ws, _) = connect_async(format!(
        "ws://{addr}/engine.io/?EIO=3&transport=websocket&sid={sid}"
    ))
    .await?;
    ws.send(Message::Text("4nope".into())).await?;

    // The fresh conn is torn down; the client sees the stream end.
    loop {
        match ws.next().await {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
            Some(Ok(_)) => {}
        }
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.transport().await, TransportKind::Polling);
    assert_eq!(server.session_count().await, 1);

    // The original transport still carries traffic.
    let resp = client
        .post(format!(
            "http://{addr}/engine.io/?EIO=3&transport=polling&sid={sid}"
        ))
        .body("6:4still")
        .send()
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let (frame, data) = session.recv().await?;
    assert_eq!(frame, FrameKind::Text);
    assert_eq!(&data[..], b"still");
    Ok(())
}
