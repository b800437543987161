/// Remote console (RCON) client
///
/// Every packet is `[size: i32 LE][request id: i32 LE][type: i32 LE][payload][0x00 0x00]`
/// where `size` counts every byte after itself. A session authenticates once with an
/// AUTH packet, then exchanges one COMMAND packet for exactly one RESPONSE packet.

use futures::future::BoxFuture;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::utils::CMD_LIST;

pub const PACKET_AUTH: i32 = 3;
pub const PACKET_COMMAND: i32 = 2;
pub const PACKET_RESPONSE: i32 = 0;

/// Request id the server answers with when the password is wrong
pub const AUTH_FAILED_ID: i32 = -1;

/// request id + type + two terminator bytes
const HEADER_AND_TERMINATOR: usize = 10;
const MAX_PACKET_SIZE: usize = 1024 * 1024;
const REQUEST_ID_MODULUS: i64 = 1 << 31;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("console I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication rejected by server")]
    AuthFailed,

    #[error("connection closed by server")]
    ConnectionClosed,

    #[error("session is not connected")]
    NotConnected,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed packet: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub request_id: i32,
    pub packet_type: i32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(request_id: i32, packet_type: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id,
            packet_type,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = (self.payload.len() + HEADER_AND_TERMINATOR) as i32;
        let mut buf = Vec::with_capacity(4 + size as usize);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.packet_type.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    /// Payload as text, silently dropping invalid UTF-8 sequences
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(self.payload.len());
        for chunk in self.payload.utf8_chunks() {
            text.push_str(chunk.valid());
        }
        text
    }
}

/// Read one packet: the size header, then exactly `size` further bytes
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, ConsoleError>
where
    R: AsyncRead + Unpin,
{
    let mut size_buf = [0u8; 4];
    read_full(reader, &mut size_buf).await?;

    let size = i32::from_le_bytes(size_buf);
    if size < HEADER_AND_TERMINATOR as i32 || size as usize > MAX_PACKET_SIZE {
        return Err(ConsoleError::Malformed(format!("invalid packet size {}", size)));
    }

    let mut body = vec![0u8; size as usize];
    read_full(reader, &mut body).await?;

    let request_id = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let packet_type = i32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    let payload = body[8..body.len() - 2].to_vec();

    Ok(Packet {
        request_id,
        packet_type,
        payload,
    })
}

/// Loop over short reads until `buf` is full; a zero-length read means the peer closed
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ConsoleError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ConsoleError::ConnectionClosed);
        }
        filled += n;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// One console connection. Not shared between tasks; open one per command batch.
pub struct ConsoleClient {
    host: String,
    port: u16,
    password: String,
    stream: Option<TcpStream>,
    request_id: i32,
    state: SessionState,
    connect_timeout: Duration,
    command_timeout: Option<Duration>,
}

impl ConsoleClient {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            stream: None,
            request_id: 0,
            state: SessionState::Unauthenticated,
            connect_timeout: Duration::from_secs(10),
            command_timeout: None,
        }
    }

    /// Bound every command round trip; without it a wedged server blocks the caller indefinitely
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Connect and authenticate. Any failure leaves the session closed.
    pub async fn connect(&mut self, timeout: Duration) -> bool {
        self.disconnect();
        self.connect_timeout = timeout;
        self.state = SessionState::Unauthenticated;

        match self.open(timeout).await {
            Ok(()) => {
                debug!(host = %self.host, port = self.port, "console session authenticated");
                true
            }
            Err(e) => {
                error!(host = %self.host, port = self.port, "console connection failed: {}", e);
                self.disconnect();
                false
            }
        }
    }

    async fn open(&mut self, timeout: Duration) -> Result<(), ConsoleError> {
        let addr = (self.host.as_str(), self.port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConsoleError::Timeout(timeout))??;
        self.stream = Some(stream);

        tokio::time::timeout(timeout, self.authenticate())
            .await
            .map_err(|_| ConsoleError::Timeout(timeout))?
    }

    async fn authenticate(&mut self) -> Result<(), ConsoleError> {
        let password = self.password.clone();
        self.send_packet(PACKET_AUTH, password.as_bytes()).await?;
        let response = self.receive_packet().await?;

        if response.request_id == AUTH_FAILED_ID {
            return Err(ConsoleError::AuthFailed);
        }

        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// Send one command and return its response text, or `None` on any failure.
    /// A failed exchange closes the session; no retry is attempted.
    pub async fn send_command(&mut self, command: &str) -> Option<String> {
        if !self.is_authenticated() && !self.connect(self.connect_timeout).await {
            return None;
        }

        match self.exchange(command).await {
            Ok(text) => Some(text),
            Err(e) => {
                error!(host = %self.host, port = self.port, command, "console command failed: {}", e);
                self.disconnect();
                None
            }
        }
    }

    async fn exchange(&mut self, command: &str) -> Result<String, ConsoleError> {
        self.send_packet(PACKET_COMMAND, command.as_bytes()).await?;

        let response = match self.command_timeout {
            Some(limit) => tokio::time::timeout(limit, self.receive_packet())
                .await
                .map_err(|_| ConsoleError::Timeout(limit))??,
            None => self.receive_packet().await?,
        };

        Ok(response.text())
    }

    /// Close the connection. Safe to call any number of times.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!(host = %self.host, port = self.port, "console session closed");
        }
        self.state = SessionState::Closed;
    }

    fn next_request_id(&mut self) -> i32 {
        self.request_id = ((self.request_id as i64 + 1) % REQUEST_ID_MODULUS) as i32;
        self.request_id
    }

    async fn send_packet(&mut self, packet_type: i32, payload: &[u8]) -> Result<i32, ConsoleError> {
        let request_id = self.next_request_id();
        let packet = Packet::new(request_id, packet_type, payload);
        let stream = self.stream.as_mut().ok_or(ConsoleError::NotConnected)?;
        stream.write_all(&packet.encode()).await?;
        Ok(request_id)
    }

    async fn receive_packet(&mut self) -> Result<Packet, ConsoleError> {
        let stream = self.stream.as_mut().ok_or(ConsoleError::NotConnected)?;
        read_packet(stream).await
    }
}

/// Where and how to reach one instance's console
#[derive(Debug, Clone)]
pub struct ConsoleTarget {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub timeout: Duration,
    pub command_timeout: Option<Duration>,
}

impl ConsoleTarget {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            timeout: Duration::from_secs(10),
            command_timeout: None,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, command: Option<Duration>) -> Self {
        self.timeout = connect;
        self.command_timeout = command;
        self
    }

    pub fn client(&self) -> ConsoleClient {
        let client = ConsoleClient::new(self.host.clone(), self.port, self.password.clone());
        match self.command_timeout {
            Some(limit) => client.with_command_timeout(limit),
            None => client,
        }
    }

    /// Run `f` over a freshly authenticated session. The connection is closed on every
    /// exit path; `None` means the session could not be opened.
    pub async fn session<T, F>(&self, f: F) -> Option<T>
    where
        F: for<'c> FnOnce(&'c mut ConsoleClient) -> BoxFuture<'c, T>,
    {
        let mut client = self.client();
        if !client.connect(self.timeout).await {
            return None;
        }

        let output = f(&mut client).await;
        client.disconnect();
        Some(output)
    }

    /// Execute a single command in its own session
    pub async fn execute(&self, command: &str) -> Option<String> {
        let command = command.to_string();
        self.session(|c| Box::pin(async move { c.send_command(&command).await }))
            .await
            .flatten()
    }

    /// Online players, or `None` when the console was unreachable
    pub async fn online_players(&self) -> Option<PlayerList> {
        self.execute(CMD_LIST).await.map(|response| PlayerList::parse(&response))
    }

    /// True when the server reports the kick
    pub async fn kick(&self, player: &str, reason: Option<&str>) -> bool {
        let command = with_reason(format!("kick {}", player), reason);
        self.execute(&command)
            .await
            .map(|response| response.contains("Kicked"))
            .unwrap_or(false)
    }

    pub async fn ban(&self, player: &str, reason: Option<&str>) -> bool {
        let command = with_reason(format!("ban {}", player), reason);
        self.execute(&command).await.is_some()
    }

    pub async fn pardon(&self, player: &str) -> bool {
        self.execute(&format!("pardon {}", player)).await.is_some()
    }

    pub async fn broadcast(&self, message: &str) -> bool {
        self.execute(&format!("say {}", message)).await.is_some()
    }

    /// Force a world save; true when the server confirms it
    pub async fn save_world(&self) -> bool {
        match self.execute("save-all").await {
            Some(response) => response.contains("Saved"),
            None => {
                warn!(host = %self.host, "save-all could not be delivered");
                false
            }
        }
    }
}

fn with_reason(mut command: String, reason: Option<&str>) -> String {
    if let Some(reason) = reason.filter(|r| !r.is_empty()) {
        command.push(' ');
        command.push_str(reason);
    }
    command
}

/// Parsed answer to `list`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerList {
    /// Count the server advertised, when the response carries one
    pub online: Option<usize>,
    pub max: Option<usize>,
    pub names: Vec<String>,
}

fn count_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"There are (\d+) of a max(?: of)? (\d+) players online").expect("valid regex")
    })
}

impl PlayerList {
    /// Parse "There are X of a max of Y players online: a, b, c"
    pub fn parse(response: &str) -> Self {
        let (online, max) = match count_pattern().captures(response) {
            Some(caps) => (
                caps.get(1).and_then(|m| m.as_str().parse().ok()),
                caps.get(2).and_then(|m| m.as_str().parse().ok()),
            ),
            None => (None, None),
        };

        Self {
            online,
            max,
            names: parse_player_names(response),
        }
    }
}

/// Names after "players online:"; empty when the fragment is absent or blank
pub fn parse_player_names(response: &str) -> Vec<String> {
    match response.split_once("players online:") {
        Some((_, rest)) => rest
            .split(',')
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(|name| name.to_string())
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-process console server used by the protocol, metrics and backup tests

    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Received {
        pub request_id: i32,
        pub command: String,
    }

    pub struct FakeConsole {
        pub addr: SocketAddr,
        pub received: Arc<Mutex<Vec<Received>>>,
        /// Connections the client has hung up
        pub closed: Arc<AtomicUsize>,
    }

    impl FakeConsole {
        pub fn commands(&self) -> Vec<String> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.command.clone())
                .collect()
        }

        /// Wait up to a second for `count` connections to be closed by the client
        pub async fn wait_closed(&self, count: usize) -> bool {
            for _ in 0..100 {
                if self.closed.load(Ordering::SeqCst) >= count {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            false
        }

        pub fn target(&self, password: &str) -> ConsoleTarget {
            ConsoleTarget::new(self.addr.ip().to_string(), self.addr.port(), password)
                .with_timeouts(Duration::from_secs(2), Some(Duration::from_secs(2)))
        }
    }

    /// Accepts any number of connections. `respond` maps a command to its reply text.
    pub async fn spawn<F>(password: &'static str, respond: F) -> FakeConsole
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));
        let respond = Arc::new(respond);

        let log = received.clone();
        let hangups = closed.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let log = log.clone();
                let respond = respond.clone();
                let hangups = hangups.clone();
                tokio::spawn(async move {
                    while let Ok(packet) = read_packet(&mut socket).await {
                        let reply = match packet.packet_type {
                            PACKET_AUTH if packet.payload == password.as_bytes() => {
                                Packet::new(packet.request_id, PACKET_COMMAND, Vec::new())
                            }
                            PACKET_AUTH => Packet::new(AUTH_FAILED_ID, PACKET_COMMAND, Vec::new()),
                            _ => {
                                let command = packet.text();
                                log.lock().unwrap().push(Received {
                                    request_id: packet.request_id,
                                    command: command.clone(),
                                });
                                Packet::new(packet.request_id, PACKET_RESPONSE, (*respond)(&command))
                            }
                        };
                        if socket.write_all(&reply.encode()).await.is_err() {
                            break;
                        }
                    }
                    hangups.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        FakeConsole {
            addr,
            received,
            closed,
        }
    }
}
