//! End-to-end tunnel tests over loopback
//!
//! A real server and relay pair talk through the full SMTP+STARTTLS
//! handshake with a self-signed certificate; the relay runs without a CA
//! bundle, so verification is disabled.

use mailpipe::config::{ForwardRule, RelayConfig, ServerConfig, User};
use mailpipe::relay::{self, Tunnel};
use mailpipe::server::Server;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

const USERNAME: &str = "alice";
const SECRET: &str = "integration-secret";

const TEST_DEADLINE: Duration = Duration::from_secs(30);

struct Stack {
    tunnel: Arc<Tunnel>,
    server_addr: SocketAddr,
    _certs: tempfile::TempDir,
}

/// Spawn a server on an ephemeral port and a relay tunnel dialing it
async fn start_stack() -> Stack {
    let certs = tempfile::tempdir().unwrap();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = certs.path().join("server.crt");
    let key_path = certs.path().join("server.key");
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

    let mut users = HashMap::new();
    users.insert(
        USERNAME.to_string(),
        User {
            secret: SECRET.to_string(),
            logging: true,
        },
    );

    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        hostname: "mail.test".to_string(),
        cert_file: cert_path.to_string_lossy().into_owned(),
        key_file: key_path.to_string_lossy().into_owned(),
        users_file: String::new(),
    };
    let server = Arc::new(Server::new(config, users).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let relay_config = RelayConfig {
        server_host: "127.0.0.1".to_string(),
        server_port: server_addr.port(),
        username: USERNAME.to_string(),
        secret: SECRET.to_string(),
        tls_server_name: None,
        ca_cert: None,
    };
    let tunnel = Arc::new(Tunnel::new(relay_config).unwrap());
    tokio::spawn(Arc::clone(&tunnel).run());

    Stack {
        tunnel,
        server_addr,
        _certs: certs,
    }
}

/// Echo service used as the dial target
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = sock.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// A connected TCP pair: (accepted side, connecting side)
async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted, connected) = tokio::join!(
        async { listener.accept().await.unwrap().0 },
        async { TcpStream::connect(addr).await.unwrap() },
    );
    (accepted, connected)
}

/// A port that nothing is listening on
fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn forwarded_connection_echoes_through_the_tunnel() {
    timeout(TEST_DEADLINE, async {
        let stack = start_stack().await;
        let echo_addr = spawn_echo().await;

        let forward = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let forward_addr = forward.local_addr().unwrap();
        let rule = ForwardRule {
            listen_host: "127.0.0.1".to_string(),
            listen_port: forward_addr.port(),
            target_host: "127.0.0.1".to_string(),
            target_port: echo_addr.port(),
        };
        tokio::spawn(relay::serve_forward(Arc::clone(&stack.tunnel), forward, rule));

        let mut client = TcpStream::connect(forward_addr).await.unwrap();
        client.write_all(b"HELLO").await.unwrap();

        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HELLO");

        // Half-close propagates through the tunnel and back as EOF
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    })
    .await
    .expect("test deadline exceeded");
}

#[tokio::test]
async fn refused_target_fails_the_open_and_ids_keep_advancing() {
    timeout(TEST_DEADLINE, async {
        let stack = start_stack().await;
        let echo_addr = spawn_echo().await;

        // First channel: nothing listens on the target port
        let (local, mut client) = socket_pair().await;
        let (_read, write) = local.into_split();
        let err = stack
            .tunnel
            .open_channel("127.0.0.1", dead_port(), write)
            .await;
        assert!(err.is_err());

        // The inbound socket is closed without any data
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // The tunnel stays usable and the next channel takes the next id
        let (local, mut client) = socket_pair().await;
        let (_read, write) = local.into_split();
        let id = stack
            .tunnel
            .open_channel("127.0.0.1", echo_addr.port(), write)
            .await
            .unwrap();
        assert_eq!(id, 2);

        stack.tunnel.send_data(id, b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        stack.tunnel.close_channel(id, true).await;
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    })
    .await
    .expect("test deadline exceeded");
}

#[tokio::test]
async fn first_channel_gets_id_one() {
    timeout(TEST_DEADLINE, async {
        let stack = start_stack().await;
        let echo_addr = spawn_echo().await;

        let (local, _client) = socket_pair().await;
        let (_read, write) = local.into_split();
        let id = stack
            .tunnel
            .open_channel("127.0.0.1", echo_addr.port(), write)
            .await
            .unwrap();
        assert_eq!(id, 1);
    })
    .await
    .expect("test deadline exceeded");
}

#[tokio::test]
async fn mid_session_drop_reconnects_and_restarts_channel_ids() {
    timeout(TEST_DEADLINE, async {
        let stack = start_stack().await;
        let echo_addr = spawn_echo().await;

        // A severable hop between relay and server so the tunnel's TCP
        // stream can be killed mid-session.
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        let server_addr = stack.server_addr;
        let current: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>> =
            Arc::new(std::sync::Mutex::new(None));
        let conns = Arc::clone(&current);
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = proxy.accept().await {
                let Ok(mut outbound) = TcpStream::connect(server_addr).await else {
                    continue;
                };
                let task = tokio::spawn(async move {
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                });
                *conns.lock().unwrap() = Some(task);
            }
        });

        let tunnel = Arc::new(
            Tunnel::new(RelayConfig {
                server_host: "127.0.0.1".to_string(),
                server_port: proxy_addr.port(),
                username: USERNAME.to_string(),
                secret: SECRET.to_string(),
                tls_server_name: None,
                ca_cert: None,
            })
            .unwrap(),
        );
        tokio::spawn(Arc::clone(&tunnel).run());

        // First session: one live channel
        let (local, mut client) = socket_pair().await;
        let (_read, write) = local.into_split();
        let id = tunnel
            .open_channel("127.0.0.1", echo_addr.port(), write)
            .await
            .unwrap();
        assert_eq!(id, 1);

        // Kill the tunnel stream out from under the session
        let conn = current.lock().unwrap().take().unwrap();
        conn.abort();

        // The torn-down channel surfaces as EOF on the local socket
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // The supervisor redials and the id space starts over at 1
        let (local, mut client) = socket_pair().await;
        let (_read, write) = local.into_split();
        let id = tunnel
            .open_channel("127.0.0.1", echo_addr.port(), write)
            .await
            .unwrap();
        assert_eq!(id, 1);

        tunnel.send_data(id, b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
    })
    .await
    .expect("test deadline exceeded");
}

#[tokio::test]
async fn wrong_secret_never_reaches_binary_mode() {
    timeout(TEST_DEADLINE, async {
        let stack = start_stack().await;

        // A second relay against the same server, holding the wrong secret
        let bad = Arc::new(
            Tunnel::new(RelayConfig {
                server_host: "127.0.0.1".to_string(),
                server_port: stack.server_addr.port(),
                username: USERNAME.to_string(),
                secret: "not-the-secret".to_string(),
                tls_server_name: None,
                ca_cert: None,
            })
            .unwrap(),
        );
        tokio::spawn(Arc::clone(&bad).run());

        // The session never becomes ready, so an open blocks until we give up
        let (local, _client) = socket_pair().await;
        let (_read, write) = local.into_split();
        let attempt = timeout(
            Duration::from_secs(3),
            bad.open_channel("127.0.0.1", 9, write),
        )
        .await;
        assert!(attempt.is_err());
    })
    .await
    .expect("test deadline exceeded");
}
