//! Transport layer: TCP sessions, message framing, and the tick driver.
//!
//! One task accepts connections, one task per connection reads
//! newline-delimited JSON envelopes, and one writer task per connection owns
//! the socket's write half so outbound delivery is strictly serialized per
//! session. Inbound messages become [`GameEvent`]s on a single queue the tick
//! driver drains; snapshots fan out through per-session bounded channels with
//! no waiting, so a slow session misses frames instead of stalling the tick.

use crate::game::{GameEvent, GameWorld};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use shared::{Envelope, MessageKind, ShotData, Vec2, WorldSnapshot};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Outbound frames a session may fall behind by before dropping frames.
const SESSION_QUEUE_DEPTH: usize = 32;
/// A session silent for this long is disconnected.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period for writer tasks to flush the shutdown notice.
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Envelope(serde_json::Error),
    #[error("malformed {kind:?} payload: {source}")]
    Payload {
        kind: MessageKind,
        source: serde_json::Error,
    },
    #[error("unexpected {0:?} from client")]
    UnexpectedKind(MessageKind),
}

/// A client-to-server message after both decode steps.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Movement(Vec2),
    Fire(ShotData),
    Ping,
    Pong,
}

/// Decodes one line from a client. Server-to-client tags arriving inbound are
/// rejected as unexpected.
pub fn decode_client_message(line: &str) -> Result<ClientMessage, ProtocolError> {
    let envelope = Envelope::decode(line).map_err(ProtocolError::Envelope)?;
    match envelope.tipo {
        MessageKind::Movement => serde_json::from_str(&envelope.dados)
            .map(ClientMessage::Movement)
            .map_err(|source| ProtocolError::Payload {
                kind: MessageKind::Movement,
                source,
            }),
        MessageKind::Shot => serde_json::from_str(&envelope.dados)
            .map(ClientMessage::Fire)
            .map_err(|source| ProtocolError::Payload {
                kind: MessageKind::Shot,
                source,
            }),
        MessageKind::Ping => Ok(ClientMessage::Ping),
        MessageKind::Pong => Ok(ClientMessage::Pong),
        other => Err(ProtocolError::UnexpectedKind(other)),
    }
}

struct Session {
    addr: SocketAddr,
    tx: mpsc::Sender<String>,
    last_seen: Instant,
}

/// Registry of live sessions. Registration assigns the player id; all
/// outbound delivery goes through the per-session bounded channel.
pub struct SessionManager {
    sessions: DashMap<u32, Session>,
    next_session_id: AtomicU32,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_session_id: AtomicU32::new(1),
            max_sessions,
        }
    }

    /// Assigns the next player id, or `None` when the server is full.
    fn allocate(&self) -> Option<u32> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }
        Some(self.next_session_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Makes the session visible to `broadcast` and `send_to`. Anything
    /// queued on `tx` beforehand is delivered before any broadcast frame.
    fn attach(&self, id: u32, addr: SocketAddr, tx: mpsc::Sender<String>) {
        self.sessions.insert(
            id,
            Session {
                addr,
                tx,
                last_seen: Instant::now(),
            },
        );
    }

    /// Drops the session, which closes its outbound channel and thereby stops
    /// its writer task. Unknown ids are a no-op.
    fn unregister(&self, id: u32) -> bool {
        self.sessions.remove(&id).is_some()
    }

    fn touch(&self, id: u32) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.last_seen = Instant::now();
        }
    }

    /// Queues a line for one session. Best-effort: a full queue or unknown id
    /// drops the message.
    fn send_to(&self, id: u32, line: String) -> bool {
        match self.sessions.get(&id) {
            Some(session) => session.tx.try_send(line).is_ok(),
            None => false,
        }
    }

    /// Fans a line out to every session without waiting. A session whose
    /// queue is full misses this frame and is not retried.
    fn broadcast(&self, line: &str) {
        for entry in self.sessions.iter() {
            match entry.value().tx.try_send(line.to_string()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("Session {} lagging, frame dropped", entry.key());
                }
                // Teardown in flight, the read loop cleans up.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    fn idle_sessions(&self, timeout: Duration) -> Vec<(u32, SocketAddr)> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().last_seen.elapsed() > timeout)
            .map(|entry| (*entry.key(), entry.value().addr))
            .collect()
    }

    fn clear(&self) {
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Clonable trigger that stops the accept loop, the receive loops, and the
/// tick driver.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn signal(&self) {
        let _ = self.0.send(true);
    }
}

/// The game server: listener, session table, world, and tick driver.
pub struct Server {
    listener: TcpListener,
    sessions: Arc<SessionManager>,
    world: Arc<Mutex<GameWorld>>,
    tick_duration: Duration,
    event_tx: mpsc::UnboundedSender<GameEvent>,
    event_rx: mpsc::UnboundedReceiver<GameEvent>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Binds the listening socket. A bind failure is fatal and surfaces here
    /// before any task is spawned.
    pub async fn new(
        addr: &str,
        tick_duration: Duration,
        max_sessions: usize,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!("Server listening on {}", addr);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            listener,
            sessions: Arc::new(SessionManager::new(max_sessions)),
            world: Arc::new(Mutex::new(GameWorld::new())),
            tick_duration,
            event_tx,
            event_rx,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown_tx))
    }

    /// Runs the accept loop, the idle checker, and the fixed-cadence tick
    /// driver until shutdown is signaled.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            sessions,
            world,
            tick_duration,
            event_tx,
            mut event_rx,
            shutdown_tx,
        } = self;

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&sessions),
            event_tx.clone(),
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(idle_loop(
            Arc::clone(&sessions),
            event_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        let mut ticker = interval(tick_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; swallow it so dt stays sane.
        ticker.tick().await;

        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut last_tick = Instant::now();

        info!("Tick driver running at {:?} per tick", tick_duration);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;

                    // Event application and the tick share one exclusion
                    // section; the lock drops before any socket write.
                    let snapshot = {
                        let mut world = world.lock().await;
                        while let Ok(event) = event_rx.try_recv() {
                            world.apply_event(event);
                        }
                        world.tick(dt)
                    };

                    broadcast_snapshot(&sessions, &snapshot);

                    if snapshot.frame_count % 300 == 0 {
                        debug!(
                            "Frame {}: {} sessions, {} players, {} asteroids, {} projectiles",
                            snapshot.frame_count,
                            sessions.len(),
                            snapshot.jogadores.len(),
                            snapshot.asteroides.len(),
                            snapshot.tiros.len(),
                        );
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                },
            }
        }

        info!("Server shutting down");
        notify_shutdown(&sessions).await;
        Ok(())
    }
}

fn broadcast_snapshot(sessions: &SessionManager, snapshot: &WorldSnapshot) {
    if sessions.is_empty() {
        return;
    }

    let dados = match serde_json::to_string(snapshot) {
        Ok(dados) => dados,
        Err(e) => {
            error!("Failed to serialize snapshot: {}", e);
            return;
        }
    };
    match Envelope::new(MessageKind::GameState, dados, 0).encode() {
        Ok(line) => sessions.broadcast(&line),
        Err(e) => error!("Failed to encode snapshot envelope: {}", e),
    }
}

/// Best-effort `SERVIDOR_PARANDO` to every session, then closes them all.
async fn notify_shutdown(sessions: &SessionManager) {
    if let Ok(line) = Envelope::new(MessageKind::ServerStopping, String::new(), 0).encode() {
        sessions.broadcast(&line);
    }
    tokio::time::sleep(SHUTDOWN_FLUSH).await;
    sessions.clear();
}

/// Periodically disconnects sessions that have gone silent.
async fn idle_loop(
    sessions: Arc<SessionManager>,
    event_tx: mpsc::UnboundedSender<GameEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                for (player_id, addr) in sessions.idle_sessions(SESSION_IDLE_TIMEOUT) {
                    warn!("Session {} ({}) timed out", player_id, addr);
                    sessions.unregister(player_id);
                    let _ = event_tx.send(GameEvent::PlayerLeft { player_id });
                }
            },
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    sessions: Arc<SessionManager>,
    event_tx: mpsc::UnboundedSender<GameEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("Accept loop stopping");
                break;
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    spawn_session(stream, addr, &sessions, &event_tx, shutdown_rx.clone());
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }
}

fn spawn_session(
    stream: TcpStream,
    addr: SocketAddr,
    sessions: &Arc<SessionManager>,
    event_tx: &mpsc::UnboundedSender<GameEvent>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let Some(player_id) = sessions.allocate() else {
        warn!("Rejecting connection from {}: server full", addr);
        return;
    };
    info!("Session {} connected from {}", player_id, addr);

    let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);

    // Identity assignment is queued before the session is attached, so it
    // reaches the client ahead of any broadcast frame.
    match Envelope::new(MessageKind::PlayerId, player_id.to_string(), player_id).encode() {
        Ok(line) => {
            let _ = tx.try_send(line);
        }
        Err(e) => error!("Failed to encode id assignment: {}", e),
    }

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(write_loop(player_id, write_half, rx));
    sessions.attach(player_id, addr, tx);

    let _ = event_tx.send(GameEvent::PlayerJoined { player_id });

    tokio::spawn(read_loop(
        player_id,
        read_half,
        Arc::clone(sessions),
        event_tx.clone(),
        shutdown_rx,
    ));
}

/// Sole writer for one connection; consuming the channel serializes all
/// outbound delivery for the session.
async fn write_loop(player_id: u32, mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if write_half.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if write_half.write_all(b"\n").await.is_err() {
            break;
        }
    }
    debug!("Writer for session {} stopped", player_id);
}

/// Reads newline-delimited envelopes until EOF, error, or shutdown. The line
/// split also separates messages that arrived concatenated in one read.
async fn read_loop(
    player_id: u32,
    read_half: OwnedReadHalf,
    sessions: Arc<SessionManager>,
    event_tx: mpsc::UnboundedSender<GameEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            next = lines.next_line() => match next {
                Ok(Some(line)) => handle_line(player_id, &line, &sessions, &event_tx),
                Ok(None) => {
                    info!("Session {} disconnected", player_id);
                    break;
                }
                Err(e) => {
                    // Transport errors are isolated to this session.
                    error!("Read error on session {}: {}", player_id, e);
                    break;
                }
            },
        }
    }

    sessions.unregister(player_id);
    let _ = event_tx.send(GameEvent::PlayerLeft { player_id });
}

fn handle_line(
    player_id: u32,
    line: &str,
    sessions: &SessionManager,
    event_tx: &mpsc::UnboundedSender<GameEvent>,
) {
    if line.trim().is_empty() {
        return;
    }
    sessions.touch(player_id);

    match decode_client_message(line) {
        Ok(ClientMessage::Movement(position)) => {
            let _ = event_tx.send(GameEvent::Movement {
                player_id,
                position,
            });
        }
        Ok(ClientMessage::Fire(shot)) => {
            let _ = event_tx.send(GameEvent::Fire {
                player_id,
                position: shot.posicao,
                velocity: shot.velocidade,
            });
        }
        Ok(ClientMessage::Ping) => {
            if let Ok(line) = Envelope::new(MessageKind::Pong, String::new(), player_id).encode() {
                sessions.send_to(player_id, line);
            }
        }
        // Keepalive answer; the touch above is all it is for.
        Ok(ClientMessage::Pong) => {}
        // Protocol errors discard the message, never the session.
        Err(e) => warn!("Session {}: discarding message: {}", player_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::now_ms;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn register(manager: &SessionManager, tx: mpsc::Sender<String>) -> Option<u32> {
        let id = manager.allocate()?;
        manager.attach(id, test_addr(), tx);
        Some(id)
    }

    fn movement_line(player_id: u32, x: f32, y: f32) -> String {
        let dados = serde_json::to_string(&Vec2::new(x, y)).unwrap();
        Envelope::new(MessageKind::Movement, dados, player_id)
            .encode()
            .unwrap()
    }

    #[test]
    fn decode_movement() {
        let line = movement_line(3, 120.0, 80.0);
        match decode_client_message(&line).unwrap() {
            ClientMessage::Movement(position) => {
                assert_eq!(position, Vec2::new(120.0, 80.0));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn decode_fire() {
        let dados = serde_json::to_string(&ShotData {
            posicao: Vec2::new(400.0, 500.0),
            velocidade: Vec2::new(0.0, -1.0),
        })
        .unwrap();
        let line = Envelope::new(MessageKind::Shot, dados, 3).encode().unwrap();

        match decode_client_message(&line).unwrap() {
            ClientMessage::Fire(shot) => {
                assert_eq!(shot.posicao, Vec2::new(400.0, 500.0));
                assert_eq!(shot.velocidade, Vec2::new(0.0, -1.0));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn decode_ping() {
        let line = Envelope::new(MessageKind::Ping, String::new(), 3)
            .encode()
            .unwrap();
        assert_eq!(decode_client_message(&line).unwrap(), ClientMessage::Ping);
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(matches!(
            decode_client_message("{not json"),
            Err(ProtocolError::Envelope(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let line = format!(
            r#"{{"tipo":"EXPLOSAO","dados":"","jogadorId":1,"timestamp":{}}}"#,
            now_ms()
        );
        assert!(matches!(
            decode_client_message(&line),
            Err(ProtocolError::Envelope(_))
        ));
    }

    #[test]
    fn decode_rejects_server_tags_from_client() {
        let line = Envelope::new(MessageKind::GameState, String::new(), 1)
            .encode()
            .unwrap();
        assert!(matches!(
            decode_client_message(&line),
            Err(ProtocolError::UnexpectedKind(MessageKind::GameState))
        ));
    }

    #[test]
    fn decode_rejects_bad_payload() {
        let line = Envelope::new(MessageKind::Movement, "not json".to_string(), 1)
            .encode()
            .unwrap();
        assert!(matches!(
            decode_client_message(&line),
            Err(ProtocolError::Payload {
                kind: MessageKind::Movement,
                ..
            })
        ));
    }

    #[test]
    fn concatenated_messages_split_on_newline() {
        // Two envelopes in one read: the framing layer splits on '\n' and
        // each piece must decode on its own.
        let buffer = format!("{}\n{}\n", movement_line(1, 1.0, 2.0), movement_line(1, 3.0, 4.0));
        let decoded: Vec<ClientMessage> = buffer
            .lines()
            .map(|line| decode_client_message(line).unwrap())
            .collect();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1], ClientMessage::Movement(Vec2::new(3.0, 4.0)));
    }

    #[tokio::test]
    async fn session_registration_assigns_unique_ids() {
        let manager = SessionManager::new(4);
        let (tx, _rx) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        let a = register(&manager, tx).unwrap();
        let b = register(&manager, tx2).unwrap();
        assert_ne!(a, b);
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn session_capacity_is_enforced() {
        let manager = SessionManager::new(1);
        let (tx, _rx) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        assert!(register(&manager, tx).is_some());
        assert!(register(&manager, tx2).is_none());
    }

    #[tokio::test]
    async fn unregister_unknown_session_is_noop() {
        let manager = SessionManager::new(4);
        assert!(!manager.unregister(42));
    }

    #[tokio::test]
    async fn broadcast_skips_full_queues() {
        let manager = SessionManager::new(4);
        let (tx, mut rx) = mpsc::channel(1);
        let id = register(&manager, tx).unwrap();

        manager.broadcast("frame-1");
        // Queue of one is now full; this frame is dropped for the session.
        manager.broadcast("frame-2");

        assert_eq!(rx.recv().await.unwrap(), "frame-1");
        assert!(rx.try_recv().is_err());
        assert!(manager.unregister(id));
    }

    #[tokio::test]
    async fn send_to_unknown_session_reports_failure() {
        let manager = SessionManager::new(4);
        assert!(!manager.send_to(9, "hello".to_string()));
    }

    #[tokio::test]
    async fn idle_sessions_are_reported() {
        let manager = SessionManager::new(4);
        let (tx, _rx) = mpsc::channel(1);
        let id = register(&manager, tx).unwrap();

        assert!(manager.idle_sessions(Duration::from_secs(1)).is_empty());

        // Backdate the session to look idle.
        manager
            .sessions
            .get_mut(&id)
            .unwrap()
            .last_seen = Instant::now() - Duration::from_secs(5);
        let idle = manager.idle_sessions(Duration::from_secs(1));
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].0, id);
        assert_eq!(idle[0].1, test_addr());
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let first = Server::new("127.0.0.1:0", Duration::from_millis(16), 4)
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        let second = Server::new(&addr.to_string(), Duration::from_millis(16), 4).await;
        assert!(matches!(second, Err(ServerError::Bind { .. })));
    }
}
