//! End-to-end relay tests: a simulated agent answers the gateway's control
//! protocol while public clients exercise the tunneled services.

use backhaul_connection::Connection;
use backhaul_proto::{ControlMessage, ServiceType};
use backhaul_server::{PassthroughJoiner, ServiceConfig, ServiceRegistry};
use backhaul_vhost::VhostMux;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// `RUST_LOG=trace cargo test` shows the relay internals.
fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Two `Connection` ends of one real TCP stream.
async fn conn_pair() -> (Connection, Connection) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (
        Connection::from_stream(server),
        Connection::from_stream(client),
    )
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn base_cfg(name: &str) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        service_type: ServiceType::Tcp,
        auth_token: "secret".to_string(),
        bind_addr: "127.0.0.1".to_string(),
        listen_port: 0,
        use_encryption: false,
        use_gzip: false,
        pool_count: 0,
        custom_domains: Vec::new(),
        subdomain: None,
        locations: Vec::new(),
        host_header_rewrite: None,
        http_user: None,
        http_pwd: None,
        privileged: false,
    }
}

/// Drive the agent side of the control protocol: every `NewWorkConn`
/// request is answered by delivering a fresh work connection whose agent
/// end is handed to `serve`.
fn run_agent<F, Fut>(
    registry: Arc<ServiceRegistry>,
    agent_control: Connection,
    proxy_name: &'static str,
    serve: F,
) where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let serve = Arc::new(serve);
        while let Ok(Some(line)) = agent_control.read_line().await {
            match ControlMessage::from_line(&line) {
                Ok(ControlMessage::NewWorkConn { proxy_name: name, .. }) => {
                    assert_eq!(name, proxy_name);
                    let (gateway_end, agent_end) = conn_pair().await;
                    registry
                        .deliver_work_conn(proxy_name, gateway_end)
                        .await
                        .unwrap();
                    let serve = serve.clone();
                    tokio::spawn(async move { serve(agent_end).await });
                }
                Ok(other) => panic!("unexpected control message: {:?}", other),
                Err(e) => panic!("bad control line {:?}: {}", line, e),
            }
        }
    });
}

/// Echo every byte back until EOF.
async fn echo(conn: Connection) {
    let mut buf = vec![0u8; 4096];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if conn.write(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    conn.close().await;
}

#[tokio::test]
async fn test_tcp_relay_round_trip() {
    init_logs();
    let registry = ServiceRegistry::with_work_conn_timeout(
        "",
        Arc::new(PassthroughJoiner),
        Duration::from_secs(2),
    );

    let port = free_port().await;
    let mut cfg = base_cfg("echo");
    cfg.listen_port = port;
    registry.insert(cfg).await.unwrap();

    let (control, agent_control) = conn_pair().await;
    registry
        .start_service("echo", Arc::new(control))
        .await
        .unwrap();
    run_agent(registry.clone(), agent_control, "echo", echo);

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"hello through the tunnel").await.unwrap();

    let mut buf = vec![0u8; 64];
    let mut got = Vec::new();
    while got.len() < b"hello through the tunnel".len() {
        let n = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
            .await
            .expect("relay stalled")
            .unwrap();
        assert!(n > 0, "relay closed early");
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, b"hello through the tunnel".to_vec());
}

#[tokio::test]
async fn test_tcp_relay_with_pool() {
    init_logs();
    let registry = ServiceRegistry::with_work_conn_timeout(
        "",
        Arc::new(PassthroughJoiner),
        Duration::from_secs(2),
    );

    let port = free_port().await;
    let mut cfg = base_cfg("pooled");
    cfg.listen_port = port;
    cfg.pool_count = 3;
    registry.insert(cfg).await.unwrap();

    let (control, agent_control) = conn_pair().await;
    registry
        .start_service("pooled", Arc::new(control))
        .await
        .unwrap();
    run_agent(registry.clone(), agent_control, "pooled", echo);

    // several clients in sequence; the pool refills between them
    for i in 0..3u8 {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let payload = vec![i; 32];
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = Vec::new();
        let mut buf = vec![0u8; 64];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
                .await
                .expect("relay stalled")
                .unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, payload);
    }
}

#[tokio::test]
async fn test_public_connection_dropped_without_agent() {
    init_logs();
    let registry = ServiceRegistry::with_work_conn_timeout(
        "",
        Arc::new(PassthroughJoiner),
        Duration::from_millis(200),
    );

    let port = free_port().await;
    let mut cfg = base_cfg("lonely");
    cfg.listen_port = port;
    registry.insert(cfg).await.unwrap();

    let (control, _agent_control) = conn_pair().await;
    registry
        .start_service("lonely", Arc::new(control))
        .await
        .unwrap();
    // no agent loop: NewWorkConn requests go unanswered

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    // the handoff times out and hangs up; the service itself stays up
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("expected the gateway to hang up")
        .unwrap();
    assert_eq!(n, 0);

    let svc = registry.get("lonely").await.unwrap();
    assert_eq!(svc.status(), backhaul_server::ServiceStatus::Working);
}

#[tokio::test]
async fn test_http_vhost_relay_with_rewrite() {
    init_logs();
    let registry = ServiceRegistry::with_work_conn_timeout(
        "tunnel.test",
        Arc::new(PassthroughJoiner),
        Duration::from_secs(2),
    );

    let mut cfg = base_cfg("web");
    cfg.service_type = ServiceType::Http;
    cfg.subdomain = Some("app".to_string());
    cfg.host_header_rewrite = Some("backend.local".to_string());
    registry.insert(cfg).await.unwrap();

    // shared vhost listener
    let mux_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mux_addr = mux_listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    {
        let table = registry.http_table();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            VhostMux::http(table, Duration::from_secs(1))
                .serve(mux_listener, shutdown)
                .await;
        });
    }

    let (control, agent_control) = conn_pair().await;
    registry
        .start_service("web", Arc::new(control))
        .await
        .unwrap();

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel::<String>(1);
    run_agent(registry.clone(), agent_control, "web", move |conn| {
        let seen_tx = seen_tx.clone();
        async move {
            // collect the request head, then answer
            let mut request = String::new();
            loop {
                match conn.read_line().await {
                    Ok(Some(line)) => {
                        let done = line.is_empty();
                        request.push_str(&line);
                        request.push('\n');
                        if done {
                            break;
                        }
                    }
                    _ => return,
                }
            }
            let _ = seen_tx.send(request).await;
            let _ = conn
                .write(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await;
            conn.close().await;
        }
    });

    let mut client = TcpStream::connect(mux_addr).await.unwrap();
    client
        .write_all(b"GET /hello HTTP/1.1\r\nHost: app.tunnel.test:8080\r\n\r\n")
        .await
        .unwrap();

    // the tunneled service saw the rewritten host, original port kept
    let seen = tokio::time::timeout(Duration::from_secs(3), seen_rx.recv())
        .await
        .expect("request never reached the agent")
        .unwrap();
    assert!(seen.starts_with("GET /hello HTTP/1.1\n"));
    assert!(seen.contains("Host: backend.local:8080\n"));

    // and the client got the tunneled response
    let mut response = Vec::new();
    let mut buf = vec![0u8; 256];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
            .await
            .expect("response stalled")
            .unwrap();
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
        if response.ends_with(b"ok") {
            break;
        }
    }
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.ends_with("ok"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_vhost_routes_follow_service_lifecycle() {
    init_logs();
    let registry = ServiceRegistry::with_work_conn_timeout(
        "tunnel.test",
        Arc::new(PassthroughJoiner),
        Duration::from_millis(300),
    );

    let mut cfg = base_cfg("web");
    cfg.service_type = ServiceType::Http;
    cfg.custom_domains = vec!["web.example.com".to_string()];
    cfg.locations = vec!["/".to_string(), "/api".to_string()];
    registry.insert(cfg).await.unwrap();

    let (control, _agent_control) = conn_pair().await;
    let svc = registry
        .start_service("web", Arc::new(control))
        .await
        .unwrap();
    // one route per (domain, location)
    assert_eq!(registry.http_table().len(), 2);

    svc.close().await;
    assert_eq!(registry.http_table().len(), 0);
}
