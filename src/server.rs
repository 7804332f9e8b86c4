//! Server node
//!
//! Accepts any number of tunnel sessions. Each runs the SMTP side of the
//! handshake, authenticates the peer, then dials targets on demand and pumps
//! frames for the channels the relay opens.

use crate::config::{ServerConfig, User};
use crate::proto::{smtp, smtp::Reply, Frame, FrameCodec, FrameType, CHUNK_SIZE};
use crate::{auth, tls, Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

/// Outbound dial timeout; failures become CONNECT_FAIL
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Cap on CONNECT_FAIL diagnostic payloads
const REASON_LIMIT: usize = 120;

type SessionStream = TlsStream<TcpStream>;

/// The tunnel server: TLS material plus the immutable user table
pub struct Server {
    config: ServerConfig,
    users: Arc<HashMap<String, User>>,
    acceptor: TlsAcceptor,
}

impl Server {
    pub fn new(config: ServerConfig, users: HashMap<String, User>) -> Result<Self> {
        let acceptor = tls::acceptor(&config.cert_file, &config.key_file)?;
        Ok(Self {
            config,
            users: Arc::new(users),
            acceptor,
        })
    }

    pub async fn run(&self) -> Result<()> {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!("tunnel server listening on {addr}");
        info!("{} users loaded", self.users.len());
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            info!("session from {peer}");
            let hostname = self.config.hostname.clone();
            let users = Arc::clone(&self.users);
            let acceptor = self.acceptor.clone();
            tokio::spawn(async move {
                if let Err(e) = run_session(stream, peer, hostname, users, acceptor).await {
                    debug!("session from {peer} failed: {e}");
                }
            });
        }
    }
}

/// Run the server: load TLS material, bind, accept forever.
pub async fn run_server(config: ServerConfig, users: HashMap<String, User>) -> Result<()> {
    let server = Server::new(config, users)?;
    server.run().await
}

/// One accepted connection: handshake, then the frame loop until EOF
async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    hostname: String,
    users: Arc<HashMap<String, User>>,
    acceptor: TlsAcceptor,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(1024);
    let (stream, username) = handshake(stream, peer, &hostname, &users, acceptor, &mut buf).await?;

    let log = users.get(&username).map(|u| u.logging).unwrap_or(true);
    let (reader, writer) = tokio::io::split(stream);
    let session = Arc::new(Session {
        username,
        log,
        writer: Mutex::new(writer),
        channels: Mutex::new(HashMap::new()),
    });

    let result = Arc::clone(&session).frame_loop(reader, buf).await;
    session.cleanup().await;
    session.activity("session ended".to_string());
    result
}

/// SMTP side of the handshake: greeting through `299 Binary mode activated`.
///
/// Any deviation from the expected dialogue terminates the session; only a
/// bad AUTH gets a diagnostic reply before the connection drops.
async fn handshake(
    mut stream: TcpStream,
    peer: SocketAddr,
    hostname: &str,
    users: &HashMap<String, User>,
    acceptor: TlsAcceptor,
    buf: &mut BytesMut,
) -> Result<(SessionStream, String)> {
    send_reply(&mut stream, &Reply::greeting(hostname)).await?;

    let line = read_required(&mut stream, buf).await?;
    if !smtp::is_ehlo(&line) {
        return Err(Error::Handshake(format!("expected EHLO, got '{line}'")));
    }
    send_reply(&mut stream, &Reply::capabilities(hostname, true)).await?;

    let line = read_required(&mut stream, buf).await?;
    if !smtp::is_starttls(&line) {
        return Err(Error::Handshake(format!("expected STARTTLS, got '{line}'")));
    }
    send_reply(&mut stream, &Reply::starttls_ready()).await?;
    if !buf.is_empty() {
        return Err(Error::Handshake(
            "unexpected cleartext bytes after STARTTLS go-ahead".into(),
        ));
    }

    let mut stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;

    let line = read_required(&mut stream, buf).await?;
    if !smtp::is_ehlo(&line) {
        return Err(Error::Handshake(format!("expected EHLO after TLS, got '{line}'")));
    }
    send_reply(&mut stream, &Reply::capabilities(hostname, false)).await?;

    let line = read_required(&mut stream, buf).await?;
    if !smtp::is_auth(&line) {
        // Anything but an AUTH command ends the session without a reply
        return Err(Error::Handshake(format!("expected AUTH, got '{line}'")));
    }
    let username = match smtp::auth_token(&line).and_then(|t| auth::verify(t, users, auth::MAX_TOKEN_AGE)) {
        Some(username) => username,
        None => {
            warn!("authentication failed from {peer}");
            send_reply(&mut stream, &Reply::auth_failed()).await?;
            return Err(Error::AuthFailed);
        }
    };
    send_reply(&mut stream, &Reply::auth_success()).await?;
    info!("user {username} authenticated from {peer}");

    let line = read_required(&mut stream, buf).await?;
    if line != "BINARY" {
        return Err(Error::Handshake(format!("expected BINARY, got '{line}'")));
    }
    send_reply(&mut stream, &Reply::binary_mode()).await?;

    Ok((stream, username))
}

/// A dialed target: the write side plus the task pumping its reads back
struct Channel {
    target: OwnedWriteHalf,
    reader_task: Option<JoinHandle<()>>,
}

/// Per-session state shared between the frame loop and channel readers
struct Session {
    username: String,
    log: bool,
    writer: Mutex<WriteHalf<SessionStream>>,
    channels: Mutex<HashMap<u16, Channel>>,
}

impl Session {
    /// Per-user activity lines; demoted to debug when logging is off
    fn activity(&self, msg: String) {
        if self.log {
            info!("[{}] {msg}", self.username);
        } else {
            debug!("[{}] {msg}", self.username);
        }
    }

    async fn frame_loop(self: Arc<Self>, mut reader: ReadHalf<SessionStream>, mut buf: BytesMut) -> Result<()> {
        let mut codec = FrameCodec;
        loop {
            while let Some(frame) = codec.decode(&mut buf)? {
                Arc::clone(&self).handle_frame(frame).await;
            }
            buf.reserve(65536);
            let n = reader.read_buf(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
        }
    }

    async fn handle_frame(self: Arc<Self>, frame: Frame) {
        match frame.frame_type {
            FrameType::Connect => self.handle_connect(frame).await,
            FrameType::Data => {
                let mut failed = false;
                {
                    let mut channels = self.channels.lock().await;
                    if let Some(ch) = channels.get_mut(&frame.channel_id) {
                        failed = ch.target.write_all(&frame.payload).await.is_err();
                    }
                }
                if failed {
                    self.close_channel(frame.channel_id).await;
                }
            }
            FrameType::Close => self.close_channel(frame.channel_id).await,
            // Replies only travel server-to-relay
            FrameType::ConnectOk | FrameType::ConnectFail => {}
        }
    }

    /// Dial the requested target and answer CONNECT_OK/CONNECT_FAIL
    async fn handle_connect(self: Arc<Self>, frame: Frame) {
        let id = frame.channel_id;
        let Some((host, port)) = frame.parse_connect() else {
            let _ = self.send_frame(Frame::connect_fail(id, b"bad connect payload")).await;
            return;
        };

        self.activity(format!("CONNECT ch={id} -> {host}:{port}"));
        match timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(socket)) => {
                let (read, write) = socket.into_split();
                self.channels.lock().await.insert(
                    id,
                    Channel {
                        target: write,
                        reader_task: None,
                    },
                );
                if self.send_frame(Frame::connect_ok(id)).await.is_err() {
                    self.close_channel(id).await;
                    return;
                }
                // The reader starts only after CONNECT_OK is on the wire, so
                // no DATA can overtake it.
                let task = tokio::spawn(Arc::clone(&self).channel_reader(id, read));
                let mut channels = self.channels.lock().await;
                match channels.get_mut(&id) {
                    Some(ch) => ch.reader_task = Some(task),
                    None => task.abort(),
                }
            }
            Ok(Err(e)) => {
                let reason = e.to_string();
                let reason = &reason.as_bytes()[..reason.len().min(REASON_LIMIT)];
                let _ = self.send_frame(Frame::connect_fail(id, reason)).await;
            }
            Err(_) => {
                let _ = self.send_frame(Frame::connect_fail(id, b"connect timed out")).await;
            }
        }
    }

    /// Stream target-to-relay bytes as DATA frames. EOF sends CLOSE; a read
    /// error tears the channel down silently.
    async fn channel_reader(self: Arc<Self>, id: u16, mut reader: OwnedReadHalf) {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    let _ = self.send_frame(Frame::close(id)).await;
                    self.close_channel(id).await;
                    break;
                }
                Ok(n) => {
                    if self
                        .send_frame(Frame::data(id, Bytes::copy_from_slice(&chunk[..n])))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => {
                    self.close_channel(id).await;
                    break;
                }
            }
        }
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Idempotent: closing an unknown channel is a no-op
    async fn close_channel(&self, id: u16) {
        let Some(mut ch) = self.channels.lock().await.remove(&id) else {
            return;
        };
        let _ = ch.target.shutdown().await;
        if let Some(task) = ch.reader_task.take() {
            // Holding the writer lock here means the reader cannot be
            // cancelled in the middle of a frame write.
            let _writer = self.writer.lock().await;
            task.abort();
        }
    }

    /// Drain every channel when the session ends
    async fn cleanup(&self) {
        let ids: Vec<u16> = self.channels.lock().await.keys().copied().collect();
        for id in ids {
            self.close_channel(id).await;
        }
    }
}

async fn send_reply<S>(stream: &mut S, reply: &str) -> Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    stream.write_all(reply.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_required<S>(stream: &mut S, buf: &mut BytesMut) -> Result<String>
where
    S: AsyncReadExt + Unpin,
{
    smtp::read_line(stream, buf)
        .await?
        .ok_or_else(|| Error::Handshake("connection closed during handshake".into()))
}
