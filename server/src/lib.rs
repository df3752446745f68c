//! # Arena Server Library
//!
//! Server side of the AI RPC protocol used to let untrusted AI programs play
//! turn-based games. Every call crossing the trust boundary between the game
//! and a client is validated here before it touches game state.
//!
//! ## Core Responsibilities
//!
//! ### Orders (server -> client)
//! The game orders a client to run one of its own functions, such as
//! `runTurn`. Each order carries an index; the client answers with a
//! `finished` packet naming that index. Replies that fail validation are
//! reported back with `invalid` and the order is resent, until the same
//! order has collected `MAX_ORDER_ERRORS` errors and the client is evicted.
//!
//! ### Runs (client -> server)
//! While thinking, a client asks game objects to do things on its behalf
//! (`Unit.attack`, `Player.log`). Requests go through two phases:
//! structural checks against the declared schema, then game-rule checks
//! through each function's invalidate hook. Only requests that pass both
//! reach the game.
//!
//! ### Thinking time
//! Each client's clock ticks only while it owes the server an answer. It is
//! paused while the server processes a run request and whenever no order is
//! outstanding.
//!
//! ## Module Organization
//!
//! - `schema`: declared order and game-object function signatures
//! - `sanitize`: coercion of wire values into declared types
//! - `game`: the traits a game implements and its function table
//! - `client`: the client seam, its clock, and a TCP-backed implementation
//! - `orders`: pending-order table and retry ceiling
//! - `runs`: two-phase run request handling
//! - `manager`: the per-client facade tying the pipelines together
//! - `client_manager`: connection roster and player seats
//! - `network`: framing, sessions and the accept loop
//! - `demo`: a small two-player game served by the binary
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::demo::{self, Skirmish};
//! use server::network::{Server, ServerConfig};
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let game = Skirmish::with_random_units(0);
//!     let players = vec![game.player(0).unwrap().clone(), game.player(1).unwrap().clone()];
//!     let game = Arc::new(RwLock::new(game));
//!
//!     let mut server = Server::bind(
//!         "127.0.0.1:8080",
//!         Arc::new(demo::namespace()),
//!         Arc::clone(&game),
//!         players,
//!         ServerConfig::default(),
//!     )
//!     .await?;
//!
//!     let sessions = server.wait_for_players().await?;
//!     let done = sessions[0].order("runTurn", Vec::new()).await?;
//!     println!("first turn returned {}", done);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod client_manager;
pub mod demo;
pub mod error;
pub mod game;
pub mod manager;
pub mod network;
pub mod orders;
pub mod peer;
pub mod runs;
pub mod sanitize;
pub mod schema;

pub use client::{Client, ConnectedClient, RecordingClient, TickClock};
pub use error::{DefectError, NetworkError, OrderError};
pub use game::{Call, FunctionTable, Game, GameFunction, GameNamespace, Invalidation, SharedGame};
pub use manager::{AiManager, AiManagerBuilder};
pub use orders::PendingOrder;
pub use peer::AiEvent;
