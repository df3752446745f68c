//! The game as seen by the AI protocol: an id-indexed object graph plus a table
//! of callable functions keyed by (object type, function name).

use crate::sanitize::{ObjectLookup, RunArgs};
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use shared::{GameObjectId, PlayerId, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Game state shared by every client's manager
pub type SharedGame<G> = Arc<RwLock<G>>;

/// Live game state consumed by the protocol
pub trait Game: ObjectLookup + Send + Sync + 'static {
    /// Session-wide gate checked before any per-function hook.
    ///
    /// Returning a reason rejects the run as invalid.
    fn invalidate_run(
        &self,
        _player: &PlayerId,
        _object: &GameObjectId,
        _function: &str,
    ) -> Option<String> {
        None
    }
}

/// Result of a semantic check on structurally valid run arguments
#[derive(Debug, Clone, PartialEq)]
pub enum Invalidation {
    Valid,
    /// Human readable reason sent back to the client
    Reject(String),
    /// Replacement values merged over the sanitized args, then re-sanitized once
    Amend(BTreeMap<String, Value>),
}

/// Arguments of one run, after sanitizing
pub struct Call<'a> {
    pub player: &'a PlayerId,
    pub object: &'a GameObjectId,
    pub args: &'a RunArgs,
}

/// A function clients may run on one game-object type
#[async_trait]
pub trait GameFunction<G: Game>: Send + Sync {
    fn invalidate(&self, _game: &G, _call: &Call<'_>) -> Invalidation {
        Invalidation::Valid
    }

    async fn run(&self, game: &mut G, call: &Call<'_>) -> Value;
}

/// Registry of implementations keyed by (object type, function name)
pub struct FunctionTable<G: Game> {
    functions: HashMap<(String, String), Arc<dyn GameFunction<G>>>,
}

impl<G: Game> FunctionTable<G> {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn register<F>(mut self, type_name: &str, function: &str, implementation: F) -> Self
    where
        F: GameFunction<G> + 'static,
    {
        self.functions.insert(
            (type_name.to_string(), function.to_string()),
            Arc::new(implementation),
        );
        self
    }

    pub fn get(&self, type_name: &str, function: &str) -> Option<Arc<dyn GameFunction<G>>> {
        self.functions
            .get(&(type_name.to_string(), function.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl<G: Game> Default for FunctionTable<G> {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the protocol knows about one game: its name, schema and function table
pub struct GameNamespace<G: Game> {
    pub name: String,
    pub schemas: SchemaRegistry,
    pub functions: FunctionTable<G>,
}

impl<G: Game> GameNamespace<G> {
    pub fn new(name: &str, schemas: SchemaRegistry, functions: FunctionTable<G>) -> Self {
        Self {
            name: name.to_string(),
            schemas,
            functions,
        }
    }

    /// Declared functions with no registered implementation
    pub fn missing_functions(&self) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for (type_name, function) in self.schemas.declared_functions() {
            if self.functions.get(type_name, function).is_none() {
                missing.push((type_name.to_string(), function.to_string()));
            }
        }
        missing.sort();
        missing
    }
}
