use serde::{de, Deserialize, Deserializer, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;

/// Invalid `finished` replies tolerated for one order before the client is evicted.
pub const MAX_ORDER_ERRORS: u32 = 10;
pub const PROTOCOL_VERSION: u32 = 1;

/// Deepest nesting of values accepted off the wire. A scalar counts as one
/// level and every enclosing `List` or `Dictionary` adds one.
pub const MAX_VALUE_DEPTH: usize = 32;

/// Longest client-supplied text echoed back inside `invalid` and `fatal` messages.
pub const MAX_ECHO_LEN: usize = 96;

/// Cuts `text` to `limit` characters, marking the cut with `...`.
pub fn clip(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Opaque id of a live game object, as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GameObjectId(pub String);

impl GameObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GameObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GameObjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Handle of an authenticated player. Players are game objects too.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub GameObjectId);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(GameObjectId::new(id))
    }

    pub fn object_id(&self) -> &GameObjectId {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Player #{}", self.0)
    }
}

/// Dynamically typed value crossing the trust boundary
///
/// Decoding is depth-limited: a frame nesting lists or dictionaries deeper
/// than [`MAX_VALUE_DEPTH`] fails to deserialize instead of recursing until
/// the stack runs out. Encoding is unrestricted since only the server builds
/// outbound values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Dictionary(BTreeMap<String, Value>),
    GameObject(GameObjectId),
}

// Mirrors `Value` variant for variant so both share one encoding; nested
// values recurse through `Value::deserialize` and its depth check.
#[derive(Deserialize)]
#[serde(rename = "Value")]
enum ValueRepr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Dictionary(BTreeMap<String, Value>),
    GameObject(GameObjectId),
}

thread_local! {
    static DECODE_DEPTH: Cell<usize> = Cell::new(0);
}

/// One level of `Value` nesting on the current thread's decode stack.
struct DepthGuard;

impl DepthGuard {
    fn enter<E: de::Error>() -> Result<Self, E> {
        DECODE_DEPTH.with(|depth| {
            let next = depth.get() + 1;
            if next > MAX_VALUE_DEPTH {
                return Err(E::custom(format!(
                    "value nested deeper than {} levels",
                    MAX_VALUE_DEPTH
                )));
            }
            depth.set(next);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DECODE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let _level = DepthGuard::enter::<D::Error>()?;
        Ok(match ValueRepr::deserialize(deserializer)? {
            ValueRepr::Null => Value::Null,
            ValueRepr::Bool(b) => Value::Bool(b),
            ValueRepr::Int(i) => Value::Int(i),
            ValueRepr::Float(x) => Value::Float(x),
            ValueRepr::String(s) => Value::String(s),
            ValueRepr::List(items) => Value::List(items),
            ValueRepr::Dictionary(entries) => Value::Dictionary(entries),
            ValueRepr::GameObject(id) => Value::GameObject(id),
        })
    }
}

impl Value {
    /// Display text clipped to [`MAX_ECHO_LEN`] characters, for echoing
    /// untrusted values back to the client that sent them.
    pub fn preview(&self) -> String {
        clip(&self.to_string(), MAX_ECHO_LEN)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_game_object(&self) -> Option<&GameObjectId> {
        match self {
            Value::GameObject(id) => Some(id),
            _ => None,
        }
    }
}

/// Renders values the way they appear in client-facing messages: strings quoted,
/// game objects as `#id`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Dictionary(entries) => {
                f.write_str("{")?;
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", key, item)?;
                }
                f.write_str("}")
            }
            Value::GameObject(id) => write!(f, "#{}", id),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<GameObjectId> for Value {
    fn from(id: GameObjectId) -> Self {
        Value::GameObject(id)
    }
}

/// Packets exchanged between the game server and an AI client
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    // Client -> server
    Play {
        client_version: u32,
        player_name: String,
    },
    Finished {
        order_index: u32,
        returned: Value,
    },
    Run {
        caller: GameObjectId,
        function_name: String,
        args: BTreeMap<String, Value>,
    },

    // Server -> client
    Started {
        player: PlayerId,
    },
    Order {
        index: u32,
        name: String,
        args: Vec<Value>,
    },
    Ran {
        returned: Value,
    },
    Invalid {
        message: String,
    },
    Fatal {
        message: String,
    },
}

impl Packet {
    pub fn event_name(&self) -> &'static str {
        match self {
            Packet::Play { .. } => "play",
            Packet::Finished { .. } => "finished",
            Packet::Run { .. } => "run",
            Packet::Started { .. } => "start",
            Packet::Order { .. } => "order",
            Packet::Ran { .. } => "ran",
            Packet::Invalid { .. } => "invalid",
            Packet::Fatal { .. } => "fatal",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
