//! Relay node
//!
//! Keeps exactly one tunnel session alive against the server and bridges
//! local TCP listeners into multiplexed channels over it. The supervisor
//! redials with exponential backoff whenever the session drops.

use crate::config::{ForwardRule, RelayConfig};
use crate::proto::{smtp, Frame, FrameCodec, FrameType, CHUNK_SIZE};
use crate::{auth, tls, Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

/// Reconnect backoff bounds, seconds
const RECONNECT_MIN: u64 = 2;
const RECONNECT_MAX: u64 = 30;

/// How long to wait for the server's CONNECT_OK/CONNECT_FAIL
const CONNECT_REPLY_TIMEOUT: Duration = Duration::from_secs(20);

type TunnelStream = TlsStream<TcpStream>;

/// One multiplexed channel, relay end: the write side of the local socket
struct Channel {
    local: OwnedWriteHalf,
}

/// The single tunnel session, shared by the supervisor and the forwarders
pub struct Tunnel {
    config: RelayConfig,
    connector: TlsConnector,
    writer: Mutex<Option<WriteHalf<TunnelStream>>>,
    channels: Mutex<HashMap<u16, Channel>>,
    waiters: StdMutex<HashMap<u16, oneshot::Sender<bool>>>,
    next_id: StdMutex<u16>,
    ready: watch::Sender<bool>,
}

impl Tunnel {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let connector = tls::connector(config.ca_cert.as_deref())?;
        let (ready, _) = watch::channel(false);
        Ok(Self {
            config,
            connector,
            writer: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            waiters: StdMutex::new(HashMap::new()),
            next_id: StdMutex::new(1),
            ready,
        })
    }

    /// Dial, handshake, then pump frames until the session drops; repeat
    /// with exponential backoff.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = RECONNECT_MIN;
        loop {
            match self.connect().await {
                Ok((reader, leftover)) => {
                    backoff = RECONNECT_MIN;
                    match self.receiver_loop(reader, leftover).await {
                        Ok(()) => info!("tunnel closed by server"),
                        Err(e) => warn!("tunnel disconnected: {e}"),
                    }
                }
                Err(e) => warn!("tunnel connect failed: {e}"),
            }
            self.mark_disconnected().await;
            info!("reconnecting in {backoff}s");
            sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    /// Block until the session is in binary mode
    async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.ready.subscribe();
        rx.wait_for(|ready| *ready)
            .await
            .map_err(|_| Error::NotConnected)?;
        Ok(())
    }

    /// Dial the server and run the relay side of the handshake.
    ///
    /// Returns the read half plus any bytes buffered past the final `299`
    /// line, which already belong to the frame stream.
    async fn connect(&self) -> Result<(ReadHalf<TunnelStream>, BytesMut)> {
        let host = &self.config.server_host;
        let port = self.config.server_port;
        info!("connecting to {host}:{port}");
        let mut stream = TcpStream::connect((host.as_str(), port)).await?;
        let mut buf = BytesMut::with_capacity(1024);

        // Cleartext preamble up to the STARTTLS go-ahead
        expect_prefix(&mut stream, &mut buf, "220").await?;
        send_line(&mut stream, "EHLO relay.local").await?;
        expect_250(&mut stream, &mut buf).await?;
        send_line(&mut stream, "STARTTLS").await?;
        expect_prefix(&mut stream, &mut buf, "220").await?;
        if !buf.is_empty() {
            return Err(Error::Handshake(
                "unexpected cleartext bytes after STARTTLS go-ahead".into(),
            ));
        }

        let name = tls::server_name(self.config.tls_server_name.as_deref().unwrap_or(host.as_str()))?;
        let mut stream = self
            .connector
            .connect(name, stream)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;

        // Authenticate inside TLS, then flip to binary mode
        send_line(&mut stream, "EHLO relay.local").await?;
        expect_250(&mut stream, &mut buf).await?;

        let token = auth::generate_now(&self.config.username, &self.config.secret);
        send_line(&mut stream, &format!("AUTH PLAIN {token}")).await?;
        let line = read_required(&mut stream, &mut buf).await?;
        if !line.starts_with("235") {
            warn!("authentication rejected: {line}");
            return Err(Error::AuthFailed);
        }

        send_line(&mut stream, "BINARY").await?;
        expect_prefix(&mut stream, &mut buf, "299").await?;

        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);
        *self.next_id.lock().unwrap() = 1;
        self.ready.send_replace(true);
        info!("tunnel established, binary mode active");
        Ok((reader, buf))
    }

    /// Frame pump: everything the server sends from here on is frames
    async fn receiver_loop(&self, mut reader: ReadHalf<TunnelStream>, mut buf: BytesMut) -> Result<()> {
        let mut codec = FrameCodec;
        loop {
            while let Some(frame) = codec.decode(&mut buf)? {
                self.handle_frame(frame).await;
            }
            buf.reserve(65536);
            let n = reader.read_buf(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame.frame_type {
            FrameType::ConnectOk | FrameType::ConnectFail => {
                let ok = frame.frame_type == FrameType::ConnectOk;
                if !ok && !frame.payload.is_empty() {
                    debug!(
                        channel = frame.channel_id,
                        reason = %String::from_utf8_lossy(&frame.payload),
                        "server refused connect"
                    );
                }
                let waiter = self.waiters.lock().unwrap().remove(&frame.channel_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(ok);
                }
            }
            FrameType::Data => {
                let mut failed = false;
                {
                    let mut channels = self.channels.lock().await;
                    if let Some(ch) = channels.get_mut(&frame.channel_id) {
                        failed = ch.local.write_all(&frame.payload).await.is_err();
                    }
                }
                if failed {
                    self.close_channel(frame.channel_id, false).await;
                }
            }
            FrameType::Close => self.close_channel(frame.channel_id, false).await,
            // Only the server dials; CONNECT arriving here is a peer bug
            FrameType::Connect => {}
        }
    }

    /// Open a channel to `host:port` and bind it to a local socket's write
    /// half. Blocks until the tunnel is ready, then waits up to 20 s for the
    /// server's verdict. On failure the channel is already torn down.
    pub async fn open_channel(&self, host: &str, port: u16, local: OwnedWriteHalf) -> Result<u16> {
        self.wait_ready().await?;

        let id = self.allocate_id()?;
        self.channels.lock().await.insert(id, Channel { local });
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id, tx);

        let outcome = self.exchange_connect(id, host, port, rx).await;
        self.waiters.lock().unwrap().remove(&id);

        match outcome {
            Ok(true) => Ok(id),
            Ok(false) => {
                self.close_channel(id, false).await;
                Err(Error::Protocol(format!("server could not reach {host}:{port}")))
            }
            Err(e) => {
                self.close_channel(id, false).await;
                Err(e)
            }
        }
    }

    async fn exchange_connect(
        &self,
        id: u16,
        host: &str,
        port: u16,
        rx: oneshot::Receiver<bool>,
    ) -> Result<bool> {
        self.send_frame(Frame::connect(id, host, port)).await?;
        match timeout(CONNECT_REPLY_TIMEOUT, rx).await {
            Ok(Ok(ok)) => Ok(ok),
            // Waiter cancelled: the session dropped mid-negotiation
            Ok(Err(_)) => Ok(false),
            Err(_) => Err(Error::Protocol(format!("connect to {host}:{port} timed out"))),
        }
    }

    fn allocate_id(&self) -> Result<u16> {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        if id == 0 {
            // 16-bit space spent; only a reconnect resets it
            return Err(Error::Protocol("channel ids exhausted".into()));
        }
        *next = next.wrapping_add(1);
        Ok(id)
    }

    pub async fn send_data(&self, id: u16, data: &[u8]) -> Result<()> {
        self.send_frame(Frame::data(id, Bytes::copy_from_slice(data))).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        writer.write_all(&frame.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Drop a channel. `notify_remote` sends a best-effort CLOSE first;
    /// closing an absent channel is a no-op.
    pub async fn close_channel(&self, id: u16, notify_remote: bool) {
        let Some(mut ch) = self.channels.lock().await.remove(&id) else {
            return;
        };
        if notify_remote {
            let _ = self.send_frame(Frame::close(id)).await;
        }
        let _ = ch.local.shutdown().await;
    }

    /// Tear down session state: every waiter resolves to failure, every
    /// channel closes locally, the transport is dropped.
    async fn mark_disconnected(&self) {
        self.ready.send_replace(false);
        let waiters: Vec<_> = {
            let mut guard = self.waiters.lock().unwrap();
            guard.drain().collect()
        };
        for (_, tx) in waiters {
            let _ = tx.send(false);
        }
        let ids: Vec<u16> = self.channels.lock().await.keys().copied().collect();
        for id in ids {
            self.close_channel(id, false).await;
        }
        *self.writer.lock().await = None;
    }
}

/// Accept loop for one forward rule
pub async fn serve_forward(tunnel: Arc<Tunnel>, listener: TcpListener, rule: ForwardRule) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed on {}:{}: {e}", rule.listen_host, rule.listen_port);
                sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        info!("inbound {peer} -> {}:{}", rule.target_host, rule.target_port);
        let tunnel = Arc::clone(&tunnel);
        let rule = rule.clone();
        tokio::spawn(handle_inbound(tunnel, socket, rule));
    }
}

/// Bridge one accepted socket: open a channel, then copy local reads into
/// DATA frames until EOF. The tunnel-to-local direction is driven by the
/// session's frame receiver.
async fn handle_inbound(tunnel: Arc<Tunnel>, socket: TcpStream, rule: ForwardRule) {
    let (mut reader, writer) = socket.into_split();
    let id = match tunnel
        .open_channel(&rule.target_host, rule.target_port, writer)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            debug!("channel open failed: {e}");
            return;
        }
    };

    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tunnel.send_data(id, &chunk[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    tunnel.close_channel(id, true).await;
}

/// Run the relay: one tunnel supervisor plus one listener per forward rule.
pub async fn run_relay(config: RelayConfig, rules: Vec<ForwardRule>) -> Result<()> {
    config.validate()?;
    if rules.is_empty() {
        return Err(Error::Config("no forwards configured".into()));
    }
    if config.ca_cert.as_deref().filter(|p| std::path::Path::new(p).exists()).is_none() {
        warn!("no CA bundle available; TLS certificate verification is disabled");
    }

    let tunnel = Arc::new(Tunnel::new(config)?);
    tokio::spawn(Arc::clone(&tunnel).run());

    let mut listeners = Vec::new();
    for rule in rules {
        let listener = TcpListener::bind((rule.listen_host.as_str(), rule.listen_port)).await?;
        info!(
            "listening on {}:{} -> {}:{}",
            rule.listen_host, rule.listen_port, rule.target_host, rule.target_port
        );
        listeners.push(tokio::spawn(serve_forward(Arc::clone(&tunnel), listener, rule)));
    }

    for task in listeners {
        let _ = task.await;
    }
    Ok(())
}

async fn send_line<S>(stream: &mut S, line: &str) -> Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    stream.write_all(format!("{line}\r\n").as_bytes()).await?;
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

async fn expect_prefix<S>(stream: &mut S, buf: &mut BytesMut, prefix: &str) -> Result<String>
where
    S: AsyncReadExt + Unpin,
{
    let line = read_required(stream, buf).await?;
    if !line.starts_with(prefix) {
        return Err(Error::Handshake(format!("expected {prefix}, got '{line}'")));
    }
    Ok(line)
}

/// Consume a multi-line EHLO reply: `250-...` continuations, `250 ` final
async fn expect_250<S>(stream: &mut S, buf: &mut BytesMut) -> Result<()>
where
    S: AsyncReadExt + Unpin,
{
    loop {
        let line = read_required(stream, buf).await?;
        if line.starts_with("250 ") {
            return Ok(());
        }
        if !line.starts_with("250-") {
            return Err(Error::Handshake(format!("unexpected EHLO reply '{line}'")));
        }
    }
}
