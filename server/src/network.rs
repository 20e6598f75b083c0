//! Server network layer: the TCP game port, UDP discovery and the loop driving a hosted game
//!
//! Each accepted connection gets a reader task that frames W3GS/GPS packets
//! and a writer task fed through an unbounded channel. Everything else runs on
//! the main loop, which owns the [`Game`] and is the only place that touches
//! it. Closing a connection means dropping its writer and reporting the close
//! back to the game.

use crate::collaborators::LogAnnouncer;
use crate::config::ServerConfig;
use crate::error::GameError;
use crate::map::MapCache;
use crate::persistence::Persistence;
use crate::session::{Game, GameEvent, GameSetup, Outgoing};
use crate::user::ConnId;
use log::{debug, error, info, warn};
use shared::w3gs::{self, peek_packet_len, W3GS_HEADER};
use shared::ProtocolError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Host counters are 24 bits wide; the high byte carries the realm id
pub const HOST_COUNTER_MASK: u32 = 0x00FF_FFFF;
/// A peer that buffers more than this without completing a packet is cut off
const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Process-wide lifecycle flags shared with the signal handler
#[derive(Debug)]
pub struct AppContext {
    exiting: AtomicBool,
    started: Instant,
    maps: Mutex<MapCache>,
}

impl AppContext {
    pub fn new() -> Self {
        Self {
            exiting: AtomicBool::new(false),
            started: Instant::now(),
            maps: Mutex::new(MapCache::new()),
        }
    }

    /// Map bytes shared by every session hosting the same file
    pub fn load_map(&self, path: &str) -> Result<Arc<Vec<u8>>, GameError> {
        let mut maps = self.maps.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let purged = maps.purge();
        if purged > 0 {
            debug!("[MAP] evicted {} unused maps", purged);
        }
        maps.get_or_load(path)
    }

    pub fn request_exit(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Milliseconds since the process started; the clock every session runs on
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out host counters and history ids for new and remade games
#[derive(Debug, Clone)]
pub struct IdentitySource {
    host_counter: u32,
    game_id: u64,
}

impl IdentitySource {
    pub fn new(last_game_id: u64) -> Self {
        Self {
            host_counter: 0,
            game_id: last_game_id,
        }
    }

    /// Next 24-bit host counter; zero is skipped when wrapping
    pub fn next_host_counter(&mut self) -> u32 {
        self.host_counter = (self.host_counter + 1) & HOST_COUNTER_MASK;
        if self.host_counter == 0 {
            self.host_counter = 1;
        }
        self.host_counter
    }

    pub fn next_game_id(&mut self) -> u64 {
        self.game_id += 1;
        self.game_id
    }
}

/// Messages sent from network tasks to the main loop
#[derive(Debug)]
pub enum ServerMessage {
    Accepted {
        conn: ConnId,
        addr: SocketAddr,
        writer: mpsc::UnboundedSender<Vec<u8>>,
        read_half: OwnedReadHalf,
    },
    PacketReceived {
        conn: ConnId,
        addr: SocketAddr,
        data: Vec<u8>,
    },
    Closed {
        conn: ConnId,
    },
    /// A LAN client asked which games are open
    Search {
        addr: SocketAddr,
    },
}

struct Connection {
    addr: SocketAddr,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

/// Splits every complete packet off the front of `buffer`
pub fn drain_packets(buffer: &mut Vec<u8>) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let mut packets = Vec::new();
    while let Some(len) = peek_packet_len(buffer) {
        if len < 4 {
            return Err(ProtocolError::LengthMismatch {
                declared: len,
                actual: buffer.len(),
            });
        }
        if buffer.len() < len {
            break;
        }
        packets.push(buffer.drain(..len).collect());
    }
    Ok(packets)
}

/// Main server coordinating the sockets and one hosted game
pub struct Server {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    discovery: Arc<UdpSocket>,
    config: ServerConfig,
    game: Game,
    identity: IdentitySource,
    context: Arc<AppContext>,
    connections: HashMap<ConnId, Connection>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn new(
        config: ServerConfig,
        mut setup: GameSetup,
        persistence: Box<dyn Persistence + Send>,
        context: Arc<AppContext>,
    ) -> Result<Self, GameError> {
        let listener = TcpListener::bind(config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        let discovery = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], config.discovery_port))).await?;
        discovery.set_broadcast(true)?;
        info!("[NET] listening on {}, discovery on {}", local_addr, discovery.local_addr()?);

        let mut identity = IdentitySource::new(setup.game_id.saturating_sub(1));
        setup.host_counter = identity.next_host_counter();
        setup.game_id = identity.next_game_id();
        setup.host_port = local_addr.port();
        setup.game_version = config.game_version;
        setup.config = config.game.clone();
        let game = Game::new(setup, persistence, Box::new(LogAnnouncer), context.now_ms())?;

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        Ok(Server {
            listener: Some(listener),
            local_addr,
            discovery: Arc::new(discovery),
            config,
            game,
            identity,
            context,
            connections: HashMap::new(),
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    /// Spawns the task accepting game connections
    fn spawn_acceptor(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut next_conn: ConnId = 1;
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("[NET] could not disable nagle for {}: {}", addr, e);
                        }
                        let conn = next_conn;
                        next_conn = next_conn.wrapping_add(1).max(1);
                        let (read_half, write_half) = stream.into_split();
                        let (writer, writer_rx) = mpsc::unbounded_channel();
                        tokio::spawn(write_packets(conn, write_half, writer_rx));
                        let accepted = ServerMessage::Accepted {
                            conn,
                            addr,
                            writer,
                            read_half,
                        };
                        if server_tx.send(accepted).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("[NET] accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task answering LAN game searches
    fn spawn_discovery_listener(&self) {
        let socket = Arc::clone(&self.discovery);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let data = &buffer[..len];
                        if len >= 4 && data[0] == W3GS_HEADER && data[1] == w3gs::id::SEARCHGAME {
                            if server_tx.send(ServerMessage::Search { addr }).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("[NET] discovery receive failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    async fn handle_message(&mut self, message: ServerMessage, now: u64) {
        match message {
            ServerMessage::Accepted {
                conn,
                addr,
                writer,
                read_half,
            } => {
                debug!("[NET] connection {} from {}", conn, addr);
                // reading starts only once the connection is known here
                let reader = tokio::spawn(read_packets(conn, addr, read_half, self.server_tx.clone()));
                self.connections.insert(conn, Connection { addr, writer, reader });
            }
            ServerMessage::PacketReceived { conn, addr, data } => {
                if self.connections.contains_key(&conn) {
                    self.game.receive(conn, addr, &data, now);
                }
            }
            ServerMessage::Closed { conn } => {
                if let Some(connection) = self.connections.remove(&conn) {
                    debug!("[NET] connection {} from {} closed by peer", conn, connection.addr);
                }
                self.game.connection_closed(conn, now);
            }
            ServerMessage::Search { addr } => {
                if let Some(reply) = self.game.game_info_reply(now) {
                    if let Err(e) = self.discovery.send_to(&reply, addr).await {
                        debug!("[NET] search reply to {} failed: {}", addr, e);
                    }
                }
            }
        }
    }

    /// Delivers everything the game queued, including work caused by closing connections
    async fn flush_outgoing(&mut self, now: u64) {
        loop {
            let outgoing = self.game.take_outgoing();
            if outgoing.is_empty() {
                break;
            }
            for item in outgoing {
                match item {
                    Outgoing::Send { conn, data } => {
                        if let Some(connection) = self.connections.get(&conn) {
                            if connection.writer.send(data).is_err() {
                                warn!("[NET] writer for connection {} is gone", conn);
                            }
                        }
                    }
                    Outgoing::Close { conn } => {
                        if let Some(connection) = self.connections.remove(&conn) {
                            connection.reader.abort();
                        }
                        self.game.connection_closed(conn, now);
                    }
                    Outgoing::Discovery(data) => {
                        if let Err(e) = self.discovery.send_to(&data, self.config.broadcast_address).await {
                            debug!("[NET] discovery broadcast failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    fn handle_events(&mut self) -> bool {
        let mut ended = false;
        for event in self.game.take_events() {
            match event {
                GameEvent::Started => info!("[NET] game [{}] started loading", self.game.name()),
                GameEvent::Remade => {
                    let host_counter = self.identity.next_host_counter();
                    let game_id = self.identity.next_game_id();
                    if let Err(e) = self.game.set_identity(host_counter, game_id) {
                        error!("[NET] could not give the remade game a new identity: {}", e);
                    }
                }
                GameEvent::Ended { game_id } => {
                    info!("[NET] game {} ended", game_id);
                    ended = true;
                }
            }
        }
        ended
    }

    /// Main loop: waits for the earliest timer or network message, then updates the game
    pub async fn run(&mut self) -> Result<(), GameError> {
        self.spawn_acceptor();
        self.spawn_discovery_listener();
        info!("[NET] hosting [{}]", self.game.name());

        loop {
            let now = self.context.now_ms();
            if self.context.is_exiting() {
                info!("[NET] shutting down");
                self.game.shutdown(now);
                self.flush_outgoing(now).await;
                self.handle_events();
                break;
            }
            let wait = self.game.next_timeout(now).min(self.config.max_tick_ms);

            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(message) => self.handle_message(message, self.context.now_ms()).await,
                        None => break,
                    }
                },
                _ = tokio::time::sleep(Duration::from_millis(wait)) => {},
            }

            let now = self.context.now_ms();
            self.game.update(now);
            self.flush_outgoing(now).await;
            if self.handle_events() || self.game.is_exiting() {
                self.flush_outgoing(now).await;
                break;
            }
        }

        // writers drain their queues before the sockets close
        self.connections.clear();
        Ok(())
    }
}

/// Frames packets off a connection until it closes or misbehaves
async fn read_packets(
    conn: ConnId,
    addr: SocketAddr,
    mut reader: OwnedReadHalf,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(len) => {
                buffer.extend_from_slice(&chunk[..len]);
                let packets = match drain_packets(&mut buffer) {
                    Ok(packets) => packets,
                    Err(e) => {
                        warn!("[NET] connection {} from {} broke framing: {}", conn, addr, e);
                        // the session rejects or removes the sender
                        let _ = server_tx.send(ServerMessage::PacketReceived {
                            conn,
                            addr,
                            data: std::mem::take(&mut buffer),
                        });
                        break;
                    }
                };
                for data in packets {
                    if server_tx.send(ServerMessage::PacketReceived { conn, addr, data }).is_err() {
                        return;
                    }
                }
                if buffer.len() > MAX_PENDING_BYTES {
                    warn!("[NET] connection {} from {} sent an oversized packet", conn, addr);
                    break;
                }
            }
            Err(e) => {
                debug!("[NET] read from connection {} failed: {}", conn, e);
                break;
            }
        }
    }

    let _ = server_tx.send(ServerMessage::Closed { conn });
}

/// Writes queued packets until the main loop drops the sender
async fn write_packets(conn: ConnId, mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!("[NET] write to connection {} failed: {}", conn, e);
            break;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("[NET] shutdown of connection {} failed: {}", conn, e);
    }
}
