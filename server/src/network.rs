//! Server network layer: TCP framing, per-client sessions and seating

use crate::client::{Client, ConnectedClient};
use crate::client_manager::ClientManager;
use crate::error::{NetworkError, OrderError};
use crate::game::{Game, GameNamespace, SharedGame};
use crate::manager::AiManager;
use crate::orders::PendingOrder;
use crate::peer::EventSender;
use log::{debug, error, info, warn};
use shared::{Packet, PlayerId, Value, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

/// Largest frame body accepted from or sent to a client
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// How often a session checks its client's time budget
const BUDGET_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Reads one length-prefixed packet. Returns None on a clean EOF.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(Packet::from_bytes(&body)?))
}

/// Writes one packet behind a big-endian u32 length prefix
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let body = packet.to_bytes()?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(body.len()));
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_clients: usize,
    /// Total thinking time each client gets for the whole game
    pub time_budget: Duration,
    /// How long a new connection may take to send `Play`
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 2,
            time_budget: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Messages sent from session tasks to the server
#[derive(Debug)]
pub enum ServerMessage {
    Seated(SessionHandle),
    SessionEnded { client_id: u32, reason: String },
}

#[derive(Debug)]
enum SessionRequest {
    Order {
        name: String,
        args: Vec<Value>,
        reply: oneshot::Sender<PendingOrder>,
    },
}

/// Game-side handle on a seated client's session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub client_id: u32,
    pub player: PlayerId,
    requests: mpsc::UnboundedSender<SessionRequest>,
}

impl SessionHandle {
    /// Orders the client and waits for its valid reply
    pub async fn order(&self, name: &str, args: Vec<Value>) -> Result<Value, OrderError> {
        let closed = || OrderError::Disconnected("Session closed".to_string());
        let (reply, pending) = oneshot::channel();

        self.requests
            .send(SessionRequest::Order {
                name: name.to_string(),
                args,
                reply,
            })
            .map_err(|_| closed())?;

        pending.await.map_err(|_| closed())?.await
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

/// State shared by every session task
struct SessionContext<G: Game> {
    clients: Arc<RwLock<ClientManager>>,
    namespace: Arc<GameNamespace<G>>,
    game: SharedGame<G>,
    players: Arc<Vec<PlayerId>>,
    config: ServerConfig,
    events: Option<EventSender>,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl<G: Game> Clone for SessionContext<G> {
    fn clone(&self) -> Self {
        Self {
            clients: Arc::clone(&self.clients),
            namespace: Arc::clone(&self.namespace),
            game: Arc::clone(&self.game),
            players: Arc::clone(&self.players),
            config: self.config.clone(),
            events: self.events.clone(),
            server_tx: self.server_tx.clone(),
        }
    }
}

/// Accepts AI connections and seats them as the game's players
pub struct Server<G: Game> {
    listener: TcpListener,
    ctx: SessionContext<G>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl<G: Game> Server<G> {
    pub async fn bind(
        addr: &str,
        namespace: Arc<GameNamespace<G>>,
        game: SharedGame<G>,
        players: Vec<PlayerId>,
        config: ServerConfig,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        info!("{} server listening on {}", namespace.name, listener.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        Ok(Server {
            listener,
            ctx: SessionContext {
                clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
                namespace,
                game,
                players: Arc::new(players),
                config,
                events: None,
                server_tx,
            },
            server_rx,
        })
    }

    /// Feeds every session's protocol events to `events`
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.ctx.events = Some(events);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until every player has a client.
    ///
    /// Handles come back in the order of the player list.
    pub async fn wait_for_players(&mut self) -> Result<Vec<SessionHandle>, NetworkError> {
        let mut seated: Vec<SessionHandle> = Vec::new();

        while seated.len() < self.ctx.players.len() {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    self.admit(stream, addr).await;
                }
                Some(message) = self.server_rx.recv() => match message {
                    ServerMessage::Seated(handle) => {
                        info!("{} ready ({}/{})", handle.player, seated.len() + 1, self.ctx.players.len());
                        seated.push(handle);
                    }
                    ServerMessage::SessionEnded { client_id, reason } => {
                        debug!("Client {} left during setup: {}", client_id, reason);
                        seated.retain(|handle| handle.client_id != client_id);
                    }
                }
            }
        }

        let order = Arc::clone(&self.ctx.players);
        seated.sort_by_key(|handle| order.iter().position(|p| p == &handle.player));
        Ok(seated)
    }

    /// Turns away every later connection once the game is full
    pub fn spawn_rejector(self) {
        let listener = self.listener;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, addr)) => {
                        debug!("Rejecting {}: game is full", addr);
                        let fatal = Packet::Fatal {
                            message: "Game is full".to_string(),
                        };
                        if let Err(e) = write_packet(&mut stream, &fatal).await {
                            debug!("Failed to reject {}: {}", addr, e);
                        }
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    async fn admit(&self, mut stream: TcpStream, addr: SocketAddr) {
        let client_id = self.ctx.clients.write().await.add_client(addr);
        let Some(client_id) = client_id else {
            warn!("Refusing {}: server at capacity", addr);
            let fatal = Packet::Fatal {
                message: "Server is full".to_string(),
            };
            if let Err(e) = write_packet(&mut stream, &fatal).await {
                debug!("Failed to refuse {}: {}", addr, e);
            }
            return;
        };

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let reason = run_session(stream, client_id, addr, &ctx).await;
            ctx.clients.write().await.remove_client(&client_id);
            if ctx
                .server_tx
                .send(ServerMessage::SessionEnded { client_id, reason })
                .is_err()
            {
                debug!("Server gone before client {} ended", client_id);
            }
        });
    }
}

/// Reader half of a session. The task is aborted when this is dropped, so a
/// silent peer cannot keep it parked in a read after the session ends.
struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Forwards decoded packets from `reader` until EOF, a bad frame, or the
/// receiving side going away
fn spawn_reader<R>(mut reader: R, client_id: u32) -> (mpsc::UnboundedReceiver<Packet>, ReaderTask)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        loop {
            match read_packet(&mut reader).await {
                Ok(Some(packet)) => {
                    if inbound_tx.send(packet).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping client {}: {}", client_id, e);
                    break;
                }
            }
        }
    });
    (inbound_rx, ReaderTask(task))
}

/// Writes queued packets until a `Fatal` has gone out or the queue closes.
///
/// Resolves to the write error that stopped it early, if any.
fn spawn_writer<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    client_id: u32,
) -> JoinHandle<Result<(), NetworkError>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut result = Ok(());
        while let Some(packet) = outbound.recv().await {
            let fatal = matches!(packet, Packet::Fatal { .. });
            if let Err(e) = write_packet(&mut writer, &packet).await {
                warn!("Failed to write to client {}: {}", client_id, e);
                result = Err(e);
                break;
            }
            if fatal {
                break;
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Failed to close client {}: {}", client_id, e);
        }
        result
    })
}

/// Runs one client connection end to end, returning why it ended
async fn run_session<G: Game>(
    stream: TcpStream,
    client_id: u32,
    addr: SocketAddr,
    ctx: &SessionContext<G>,
) -> String {
    let (reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Packet>();
    let writer = spawn_writer(writer, outbound_rx, client_id);
    let (mut inbound_rx, _reader) = spawn_reader(reader, client_id);

    let mut client = ConnectedClient::new(client_id, addr, outbound_tx, ctx.config.time_budget);

    let name = match timeout(ctx.config.handshake_timeout, inbound_rx.recv()).await {
        Ok(Some(Packet::Play {
            client_version,
            player_name,
        })) if client_version == PROTOCOL_VERSION => player_name,
        Ok(Some(Packet::Play { client_version, .. })) => {
            let reason = format!("Unsupported protocol version {}", client_version);
            client.disconnect(&reason);
            return reason;
        }
        Ok(Some(other)) => {
            let reason = format!("Expected 'play' but got '{}'", other.event_name());
            client.disconnect(&reason);
            return reason;
        }
        Ok(None) => return "Connection closed before playing".to_string(),
        Err(_) => {
            let reason = "Never sent 'play'".to_string();
            client.disconnect(&reason);
            return reason;
        }
    };

    let seat = ctx
        .clients
        .write()
        .await
        .seat_client(client_id, &name, &ctx.players);
    let Some(player) = seat else {
        let reason = "No free player seats".to_string();
        client.disconnect(&reason);
        return reason;
    };

    client.authenticate(player.clone());
    client.send(Packet::Started {
        player: player.clone(),
    });

    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        client_id,
        player,
        requests: requests_tx,
    };
    if ctx.server_tx.send(ServerMessage::Seated(handle)).is_err() {
        debug!("Server gone before client {} was seated", client_id);
    }

    let mut builder = AiManager::builder(client, Arc::clone(&ctx.namespace));
    if let Some(events) = &ctx.events {
        builder = builder.events(events.clone());
    }
    let manager = builder.game(Arc::clone(&ctx.game));

    drive_session(manager, inbound_rx, requests_rx, writer).await
}

/// Pumps inbound packets and order requests through `manager` until the
/// client is gone.
///
/// A writer that stops on its own counts as the client going away.
async fn drive_session<G: Game>(
    mut manager: AiManager<G, ConnectedClient>,
    mut inbound: mpsc::UnboundedReceiver<Packet>,
    mut requests: mpsc::UnboundedReceiver<SessionRequest>,
    mut writer: JoinHandle<Result<(), NetworkError>>,
) -> String {
    let mut budget_check = interval(BUDGET_CHECK_INTERVAL);

    loop {
        tokio::select! {
            packet = inbound.recv() => match packet {
                Some(packet) => {
                    if let Err(defect) = manager.handle_packet(packet).await {
                        error!("Game defect while serving client {}: {}", manager.client().id, defect);
                        manager.disconnect("Server error");
                    }
                }
                None => manager.client_closed("Connection closed"),
            },
            request = requests.recv() => match request {
                Some(SessionRequest::Order { name, args, reply }) => {
                    let pending = manager.execute_order(&name, &args).await;
                    if reply.send(pending).is_err() {
                        debug!("Nobody waiting on order '{}'", name);
                    }
                }
                None => manager.disconnect("The game is over"),
            },
            written = &mut writer => {
                let reason = match written {
                    Ok(Err(e)) => format!("Connection lost: {}", e),
                    _ => "Connection lost".to_string(),
                };
                manager.client_closed(&reason);
            }
            _ = budget_check.tick() => {
                if manager.client().clock().is_out_of_time() {
                    manager.disconnect("Ran out of time");
                }
            }
        }

        if let Some(reason) = manager.disconnect_reason() {
            let player = manager.client().player().cloned();
            info!(
                "Session for client {} ({}) ended: {}",
                manager.client().id,
                player.map(|p| p.to_string()).unwrap_or_default(),
                reason
            );
            return reason.to_string();
        }
    }
}
