//! TcpWorker against an in-process server

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use toyvpn_proto::{AttemptId, ConnectionConfig, StatusEvent};
use toyvpn_supervisor::{LinkState, Supervisor};
use toyvpn_worker::frame::{read_packet, secret_packet, write_packet};
use toyvpn_worker::{TcpWorker, WorkerSettings};

const SECRET: &str = "test-secret";

/// What the fake server does once a client connects
#[derive(Clone, Copy)]
enum Behaviour {
    /// Check the secret, send parameters, then wait for the client to hang up
    Accept,
    /// Hang up as soon as the secret arrives
    Reject,
    /// Never answer
    Silent,
}

async fn serve_one(listener: TcpListener, behaviour: Behaviour) -> bool {
    let (mut stream, _) = listener.accept().await.unwrap();
    serve_stream(&mut stream, behaviour).await
}

/// Returns true once the client closes its side after a successful handshake
async fn serve_stream(stream: &mut TcpStream, behaviour: Behaviour) -> bool {
    let packet = read_packet(stream).await.unwrap().unwrap();
    match behaviour {
        Behaviour::Reject => false,
        Behaviour::Silent => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            false
        }
        Behaviour::Accept => {
            assert_eq!(packet.as_ref(), secret_packet(SECRET.as_bytes()).as_slice());
            write_packet(stream, b"\x00m,1400 a,10.0.0.2,32 r,0.0.0.0,0")
                .await
                .unwrap();
            matches!(read_packet(stream).await, Ok(None))
        }
    }
}

fn config_for(addr: std::net::SocketAddr) -> ConnectionConfig {
    ConnectionConfig::builder()
        .server(addr.ip().to_string(), addr.port())
        .shared_secret(SECRET)
        .build()
        .unwrap()
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<StatusEvent>) -> StatusEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for status")
        .expect("status channel closed")
}

fn short_timeouts() -> WorkerSettings {
    WorkerSettings {
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_millis(200),
        ..WorkerSettings::default()
    }
}

#[tokio::test]
async fn test_tunnel_established_and_closed() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_one(listener, Behaviour::Accept));

    let (tx, mut events) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(TcpWorker::default(), tx).unwrap();

    let attempt = supervisor.connect(config_for(addr));
    assert_eq!(
        next_event(&mut events).await,
        StatusEvent::Connecting { attempt }
    );
    assert_eq!(
        next_event(&mut events).await,
        StatusEvent::Connected {
            attempt,
            interface: "toyvpn1".to_string()
        }
    );
    assert!(matches!(supervisor.state(), LinkState::Connected { .. }));

    supervisor.disconnect();
    assert_eq!(next_event(&mut events).await, StatusEvent::Disconnected);

    let saw_hangup = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(saw_hangup, "server should see the tunnel closed");
    assert!(supervisor.state().is_idle());
}

#[tokio::test]
async fn test_rejected_secret_fails_attempt() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_one(listener, Behaviour::Reject));

    let (tx, mut events) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(TcpWorker::new(short_timeouts()), tx).unwrap();

    let attempt = supervisor.connect(config_for(addr));
    next_event(&mut events).await;
    match next_event(&mut events).await {
        StatusEvent::Failed {
            attempt: failed,
            reason,
        } => {
            assert_eq!(failed, attempt);
            assert!(reason.contains("Handshake failed"), "reason: {}", reason);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(supervisor.state().is_idle());
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_one(listener, Behaviour::Silent));

    let (tx, mut events) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(TcpWorker::new(short_timeouts()), tx).unwrap();

    supervisor.connect(config_for(addr));
    next_event(&mut events).await;
    match next_event(&mut events).await {
        StatusEvent::Failed { reason, .. } => assert!(reason.contains("timed out")),
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_server_fails() {
    // Grab a free port and release it so nothing is listening there
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (tx, mut events) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(TcpWorker::new(short_timeouts()), tx).unwrap();

    supervisor.connect(config_for(addr));
    next_event(&mut events).await;
    assert!(matches!(
        next_event(&mut events).await,
        StatusEvent::Failed { .. }
    ));
}

#[tokio::test]
async fn test_disconnect_during_negotiation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_one(listener, Behaviour::Silent));

    let (tx, mut events) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(TcpWorker::default(), tx).unwrap();

    let attempt = supervisor.connect(config_for(addr));
    assert_eq!(
        next_event(&mut events).await,
        StatusEvent::Connecting { attempt }
    );
    supervisor.disconnect();
    assert_eq!(next_event(&mut events).await, StatusEvent::Disconnected);

    // The cancelled worker exits quietly: no Failed event follows
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    assert!(supervisor.state().is_idle());
}

#[tokio::test]
async fn test_connect_through_proxy() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();

    // Minimal CONNECT proxy that only accepts the configured server
    let proxy_task = tokio::spawn(async move {
        let (mut client, _) = proxy.accept().await.unwrap();
        let mut request = Vec::new();
        while !request.ends_with(b"\r\n\r\n") {
            request.push(client.read_u8().await.unwrap());
        }
        let request = String::from_utf8(request).unwrap();
        assert!(request.starts_with(&format!("CONNECT {} HTTP/1.1", server_addr)));

        let mut upstream = TcpStream::connect(server_addr).await.unwrap();
        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    });
    let server_task = tokio::spawn(serve_one(server, Behaviour::Accept));

    let config = ConnectionConfig::builder()
        .server(server_addr.ip().to_string(), server_addr.port())
        .shared_secret(SECRET)
        .proxy(proxy_addr.ip().to_string(), proxy_addr.port())
        .build()
        .unwrap();

    let (tx, mut events) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(TcpWorker::default(), tx).unwrap();

    let attempt = supervisor.connect(config);
    next_event(&mut events).await;
    assert_eq!(
        next_event(&mut events).await,
        StatusEvent::Connected {
            attempt,
            interface: "toyvpn1".to_string()
        }
    );

    supervisor.disconnect();
    assert!(tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap());
    proxy_task.abort();
}

#[tokio::test]
async fn test_server_hangup_retires_tunnel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_packet(&mut stream).await.unwrap();
        write_packet(&mut stream, b"\x00a,10.0.0.2,32").await.unwrap();
        // Drop the connection right after negotiating
    });

    let (tx, mut events) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(TcpWorker::default(), tx).unwrap();

    let attempt = supervisor.connect(config_for(addr));
    assert_eq!(attempt, AttemptId(1));
    next_event(&mut events).await;
    assert!(matches!(
        next_event(&mut events).await,
        StatusEvent::Connected { .. }
    ));
    assert_eq!(next_event(&mut events).await, StatusEvent::Disconnected);
    assert!(supervisor.state().is_idle());
}
