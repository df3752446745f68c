//! Connection roster for the arena server
//!
//! This module tracks which AI clients are connected and which player each
//! one controls:
//! - Capacity enforcement when new connections arrive
//! - Player seat assignment once a client sends `Play`
//! - Freeing the seat when a session ends
//!
//! The roster only holds bookkeeping. Per-client protocol state lives in each
//! session's `AiManager`.

use log::info;
use shared::PlayerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// A connected client and the seat it occupies
#[derive(Debug)]
pub struct RosterEntry {
    /// Unique client identifier assigned by the server
    pub id: u32,
    /// Remote address of the TCP connection
    pub addr: SocketAddr,
    /// Name the client announced in `Play`
    pub name: Option<String>,
    /// Player the client controls, once seated
    pub player: Option<PlayerId>,
    pub connected_at: Instant,
}

impl RosterEntry {
    pub fn new(id: u32, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            name: None,
            player: None,
            connected_at: Instant::now(),
        }
    }
}

/// Manages all connected clients and their seats
///
/// Seats are handed out in join order from the list of players the game
/// provides, so the first client to send `Play` controls the first player.
pub struct ClientManager {
    clients: HashMap<u32, RosterEntry>,
    next_client_id: u32,
    max_clients: usize,
}

impl ClientManager {
    /// Creates an empty roster. Client IDs start from 1.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Attempts to add a new client connection
    ///
    /// Returns Some(client_id) if successful, None if the server is full.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, RosterEntry::new(client_id, addr));

        Some(client_id)
    }

    /// Removes a client, returning true if it was present
    pub fn remove_client(&mut self, client_id: &u32) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            match &client.player {
                Some(player) => info!(
                    "Client {} ({}) left after {:?}",
                    client.id,
                    player,
                    client.connected_at.elapsed()
                ),
                None => info!("Client {} disconnected", client.id),
            }
            true
        } else {
            false
        }
    }

    /// Seats `client_id` as the first player in `players` nobody controls yet
    ///
    /// Returns None when the client is unknown, already seated, or every
    /// player is taken.
    pub fn seat_client(
        &mut self,
        client_id: u32,
        name: &str,
        players: &[PlayerId],
    ) -> Option<PlayerId> {
        let taken: Vec<&PlayerId> = self
            .clients
            .values()
            .filter_map(|client| client.player.as_ref())
            .collect();
        let free = players.iter().find(|p| !taken.contains(p))?.clone();

        let client = self.clients.get_mut(&client_id)?;
        if client.player.is_some() {
            return None;
        }

        info!("Client {} ('{}') seated as {}", client_id, name, free);
        client.name = Some(name.to_string());
        client.player = Some(free.clone());
        Some(free)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
