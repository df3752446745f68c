//! The AI client as seen by the protocol: somewhere to send packets, a way to
//! kick it, and its thinking clock.

use log::{debug, info, warn};
use shared::{Packet, PlayerId};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Connection to one AI client
pub trait Client: Send {
    /// Authenticated player, once the client has sent `Play`
    fn player(&self) -> Option<&PlayerId>;

    fn send(&mut self, packet: Packet);

    /// Terminates the connection, telling the client why
    fn disconnect(&mut self, reason: &str);

    fn start_ticking(&mut self);

    fn pause_ticking(&mut self);
}

/// Per-client thinking-time budget.
///
/// Time only accrues while the clock is ticking.
#[derive(Debug, Clone)]
pub struct TickClock {
    budget: Duration,
    spent: Duration,
    running_since: Option<Instant>,
}

impl TickClock {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            spent: Duration::ZERO,
            running_since: None,
        }
    }

    /// Starts accruing time; no-op if already ticking
    pub fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    /// Stops accruing time; no-op if already paused
    pub fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.spent += since.elapsed();
        }
    }

    pub fn is_ticking(&self) -> bool {
        self.running_since.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.spent + self.running_since.map(|since| since.elapsed()).unwrap_or_default()
    }

    pub fn is_out_of_time(&self) -> bool {
        self.elapsed() > self.budget
    }
}

/// Client reachable through the session's outbound packet queue
#[derive(Debug)]
pub struct ConnectedClient {
    /// Roster id assigned by the server
    pub id: u32,
    pub addr: SocketAddr,
    player: Option<PlayerId>,
    outbound: mpsc::UnboundedSender<Packet>,
    clock: TickClock,
    disconnected: Option<String>,
}

impl ConnectedClient {
    pub fn new(
        id: u32,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Packet>,
        time_budget: Duration,
    ) -> Self {
        Self {
            id,
            addr,
            player: None,
            outbound,
            clock: TickClock::new(time_budget),
            disconnected: None,
        }
    }

    pub fn authenticate(&mut self, player: PlayerId) {
        info!("Client {} from {} plays as {}", self.id, self.addr, player);
        self.player = Some(player);
    }

    pub fn clock(&self) -> &TickClock {
        &self.clock
    }

    /// Reason the client was disconnected, if it was
    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnected.as_deref()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.is_some()
    }
}

impl Client for ConnectedClient {
    fn player(&self) -> Option<&PlayerId> {
        self.player.as_ref()
    }

    fn send(&mut self, packet: Packet) {
        if self.disconnected.is_some() {
            debug!(
                "Dropping {} for disconnected client {}",
                packet.event_name(),
                self.id
            );
            return;
        }

        if let Err(e) = self.outbound.send(packet) {
            warn!("Failed to queue packet for client {}: {}", self.id, e);
        }
    }

    fn disconnect(&mut self, reason: &str) {
        if self.disconnected.is_some() {
            return;
        }

        warn!("Disconnecting client {} ({}): {}", self.id, self.addr, reason);
        self.clock.pause();
        if let Err(e) = self.outbound.send(Packet::Fatal {
            message: reason.to_string(),
        }) {
            debug!("Client {} already gone: {}", self.id, e);
        }
        self.disconnected = Some(reason.to_string());
    }

    fn start_ticking(&mut self) {
        self.clock.start();
    }

    fn pause_ticking(&mut self) {
        self.clock.pause();
    }
}

/// In-memory client that records everything the protocol does to it.
///
/// Used by headless harnesses and tests.
#[derive(Debug, Default)]
pub struct RecordingClient {
    pub player: Option<PlayerId>,
    pub sent: Vec<Packet>,
    pub disconnects: Vec<String>,
    pub ticking: bool,
    pub tick_starts: usize,
    pub tick_pauses: usize,
}

impl RecordingClient {
    pub fn playing(player: PlayerId) -> Self {
        Self {
            player: Some(player),
            ..Self::default()
        }
    }

    pub fn last_sent(&self) -> Option<&Packet> {
        self.sent.last()
    }
}

impl Client for RecordingClient {
    fn player(&self) -> Option<&PlayerId> {
        self.player.as_ref()
    }

    fn send(&mut self, packet: Packet) {
        self.sent.push(packet);
    }

    fn disconnect(&mut self, reason: &str) {
        self.ticking = false;
        self.disconnects.push(reason.to_string());
    }

    fn start_ticking(&mut self) {
        self.ticking = true;
        self.tick_starts += 1;
    }

    fn pause_ticking(&mut self) {
        self.ticking = false;
        self.tick_pauses += 1;
    }
}
