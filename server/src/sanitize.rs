//! Structural validation and coercion of values against declared types
//!
//! Everything here is pure: no I/O, no locks, no mutation of the game. The only
//! outside knowledge a sanitizer needs is which game objects exist and what type
//! they are, supplied through [`ObjectLookup`].

use crate::schema::{ArgDescriptor, SchemaRegistry, TypeDescriptor};
use shared::{clip, GameObjectId, Value, MAX_ECHO_LEN};
use std::collections::BTreeMap;
use thiserror::Error;

/// Read-only view of the live object graph used to resolve references
pub trait ObjectLookup {
    /// Type name of the object with this id, if it exists
    fn object_type(&self, id: &GameObjectId) -> Option<&str>;
}

/// Why a value did not fit its declared type.
///
/// The distinction matters for run requests: a malformed arg means the client
/// does not speak the protocol and is disconnected, while an out-of-range one
/// is a recoverable mistake answered with `invalid`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SanitizeError {
    /// Value cannot be made to fit the declared type
    #[error("{0}")]
    Malformed(String),
    /// Well-typed value outside the declared bounds
    #[error("{0}")]
    OutOfRange(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrderArgsError {
    #[error("no order named '{0}' is declared")]
    UnknownOrder(String),
    #[error("order '{name}' takes {expected} args but was given {given}")]
    Arity {
        name: String,
        expected: usize,
        given: usize,
    },
    #[error("order '{name}' arg '{arg}' was given {value} - {source}")]
    BadArg {
        name: String,
        arg: String,
        value: Value,
        source: SanitizeError,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunArgsError {
    #[error("no game object type named '{0}' is declared")]
    UnknownType(String),
    #[error("{type_name} has no function named '{function}'")]
    UnknownFunction { type_name: String, function: String },
    /// Carries the full client-facing message
    #[error("{0}")]
    BadArg(SanitizeError),
}

/// Sanitized run arguments in declared order
///
/// Every declared argument is present, defaults filled in, and each value
/// already coerced to its declared type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunArgs(Vec<(String, Value)>);

impl RunArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn to_keyed(&self) -> BTreeMap<String, Value> {
        self.0.iter().cloned().collect()
    }

    /// Keyed copy of these args with `amend` written over them
    pub fn merged(&self, amend: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut keyed = self.to_keyed();
        for (name, value) in amend {
            keyed.insert(name.clone(), value.clone());
        }
        keyed
    }
}

impl FromIterator<(String, Value)> for RunArgs {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Coerces `value` into `kind`, failing when no sensible coercion exists
///
/// Scalars coerce leniently: numeric strings become numbers, `null` becomes
/// `false`, and booleans and numbers stringify. Lists and dictionaries are
/// sanitized element by element and report the position of the first bad
/// element. Game object references must name a live object of the declared
/// type, or of any type when it is `GameObject`.
pub fn sanitize_value(
    kind: &TypeDescriptor,
    value: &Value,
    lookup: &dyn ObjectLookup,
) -> Result<Value, SanitizeError> {
    match kind {
        TypeDescriptor::Void => Ok(Value::Null),
        TypeDescriptor::Boolean => sanitize_boolean(value),
        TypeDescriptor::Int => sanitize_int(value),
        TypeDescriptor::Float => sanitize_float(value),
        TypeDescriptor::String => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            Value::Int(i) => Ok(Value::String(i.to_string())),
            Value::Float(x) => Ok(Value::String(x.to_string())),
            _ => Err(malformed(kind)),
        },
        TypeDescriptor::List(inner) => match value {
            Value::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    sanitize_value(inner, item, lookup).map_err(|e| nested(format!("element {}", i), e))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            _ => Err(malformed(kind)),
        },
        TypeDescriptor::Dictionary(inner) => match value {
            Value::Dictionary(entries) => entries
                .iter()
                .map(|(key, item)| {
                    sanitize_value(inner, item, lookup)
                        .map(|v| (key.clone(), v))
                        .map_err(|e| nested(format!("key '{}'", clip(key, MAX_ECHO_LEN)), e))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Dictionary),
            _ => Err(malformed(kind)),
        },
        TypeDescriptor::GameObject {
            type_name,
            nullable,
        } => match value {
            Value::Null if *nullable => Ok(Value::Null),
            Value::Null => Err(SanitizeError::Malformed(format!(
                "cannot be null, expected a {}",
                type_name
            ))),
            Value::GameObject(id) => match lookup.object_type(id) {
                None => Err(SanitizeError::Malformed(format!(
                    "no game object with id '{}' exists",
                    clip(id.as_str(), MAX_ECHO_LEN)
                ))),
                Some(actual) if type_name == "GameObject" || actual == type_name => {
                    Ok(Value::GameObject(id.clone()))
                }
                Some(actual) => Err(SanitizeError::Malformed(format!(
                    "#{} is a {}, expected a {}",
                    id, actual, type_name
                ))),
            },
            _ => Err(malformed(kind)),
        },
    }
}

fn sanitize_boolean(value: &Value) -> Result<Value, SanitizeError> {
    match value {
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::Null => Ok(Value::Bool(false)),
        Value::Int(i) => Ok(Value::Bool(*i != 0)),
        Value::Float(x) => Ok(Value::Bool(*x != 0.0)),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
        _ => Err(malformed(&TypeDescriptor::Boolean)),
    }
}

fn sanitize_int(value: &Value) -> Result<Value, SanitizeError> {
    match value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(x) if x.is_finite() && x.fract() == 0.0 && x.abs() < i64::MAX as f64 => {
            Ok(Value::Int(*x as i64))
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| malformed(&TypeDescriptor::Int)),
        _ => Err(malformed(&TypeDescriptor::Int)),
    }
}

fn sanitize_float(value: &Value) -> Result<Value, SanitizeError> {
    let parsed = match value {
        Value::Float(x) => Some(*x),
        Value::Int(i) => Some(*i as f64),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(x) if x.is_finite() => Ok(Value::Float(x)),
        _ => Err(malformed(&TypeDescriptor::Float)),
    }
}

fn malformed(kind: &TypeDescriptor) -> SanitizeError {
    SanitizeError::Malformed(format!("expected a value of type {}", kind))
}

fn nested(at: String, err: SanitizeError) -> SanitizeError {
    match err {
        SanitizeError::Malformed(reason) => SanitizeError::Malformed(format!("{}: {}", at, reason)),
        SanitizeError::OutOfRange(reason) => SanitizeError::OutOfRange(format!("{}: {}", at, reason)),
    }
}

/// Sanitizes one argument, then enforces its declared bounds
pub fn sanitize_arg(
    arg: &ArgDescriptor,
    value: &Value,
    lookup: &dyn ObjectLookup,
) -> Result<Value, SanitizeError> {
    let sanitized = sanitize_value(&arg.kind, value, lookup)?;

    if let Some(number) = sanitized.as_f64() {
        if let Some(min) = arg.min {
            if number < min {
                return Err(SanitizeError::OutOfRange(format!("must be at least {}", min)));
            }
        }
        if let Some(max) = arg.max {
            if number > max {
                return Err(SanitizeError::OutOfRange(format!("must be at most {}", max)));
            }
        }
    }

    Ok(sanitized)
}

/// Sanitizes server-supplied positional args for an order.
///
/// Failure here means server code built a bad order, never the client.
pub fn sanitize_order_args(
    schemas: &SchemaRegistry,
    lookup: &dyn ObjectLookup,
    name: &str,
    args: &[Value],
) -> Result<Vec<Value>, OrderArgsError> {
    let schema = schemas
        .order(name)
        .ok_or_else(|| OrderArgsError::UnknownOrder(name.to_string()))?;

    if args.len() > schema.args.len() {
        return Err(OrderArgsError::Arity {
            name: name.to_string(),
            expected: schema.args.len(),
            given: args.len(),
        });
    }

    let mut sanitized = Vec::with_capacity(schema.args.len());
    for (i, arg) in schema.args.iter().enumerate() {
        let value = match (args.get(i), &arg.default) {
            (Some(value), _) => value.clone(),
            (None, Some(default)) => default.clone(),
            (None, None) => {
                return Err(OrderArgsError::Arity {
                    name: name.to_string(),
                    expected: schema.args.len(),
                    given: args.len(),
                })
            }
        };

        let clean = sanitize_arg(arg, &value, lookup).map_err(|source| OrderArgsError::BadArg {
            name: name.to_string(),
            arg: arg.name.clone(),
            value: value.clone(),
            source,
        })?;
        sanitized.push(clean);
    }

    Ok(sanitized)
}

/// Maps a client's keyed run args onto the declared arguments of
/// `type_name.function`, applying defaults and sanitizing each value.
///
/// Keys the function does not declare are ignored. A missing arg with no
/// default is sent through as `null` and has to coerce like any other value.
///
/// Errors name the object, function and arg, and echo the offending value
/// clipped to a readable length.
pub fn validate_run_args(
    schemas: &SchemaRegistry,
    lookup: &dyn ObjectLookup,
    type_name: &str,
    object_id: &GameObjectId,
    function: &str,
    keyed: &BTreeMap<String, Value>,
) -> Result<RunArgs, RunArgsError> {
    let object_schema = schemas
        .game_object(type_name)
        .ok_or_else(|| RunArgsError::UnknownType(type_name.to_string()))?;
    let schema = object_schema
        .function(function)
        .ok_or_else(|| RunArgsError::UnknownFunction {
            type_name: type_name.to_string(),
            function: function.to_string(),
        })?;

    let mut sanitized = Vec::with_capacity(schema.args.len());
    for arg in &schema.args {
        let value = keyed
            .get(&arg.name)
            .or(arg.default.as_ref())
            .cloned()
            .unwrap_or(Value::Null);

        let clean = sanitize_arg(arg, &value, lookup).map_err(|err| {
            let describe = |reason: String| {
                format!(
                    "{} #{}.{}()'s '{}' arg was sent {} - {}",
                    type_name,
                    object_id,
                    function,
                    arg.name,
                    value.preview(),
                    reason
                )
            };
            RunArgsError::BadArg(match err {
                SanitizeError::Malformed(reason) => SanitizeError::Malformed(describe(reason)),
                SanitizeError::OutOfRange(reason) => SanitizeError::OutOfRange(describe(reason)),
            })
        })?;
        sanitized.push((arg.name.clone(), clean));
    }

    Ok(RunArgs(sanitized))
}

/// Sanitizes what a server-side game function returned.
///
/// Failure means the game code broke its own contract.
pub fn validate_ran_returned(
    schemas: &SchemaRegistry,
    lookup: &dyn ObjectLookup,
    type_name: &str,
    function: &str,
    value: &Value,
) -> Result<Value, SanitizeError> {
    let schema = schemas.function(type_name, function).ok_or_else(|| {
        SanitizeError::Malformed(format!("{}.{} has no declared return type", type_name, function))
    })?;
    sanitize_value(&schema.returns, value, lookup)
}

/// Sanitizes what a client returned for an order
pub fn validate_finished_returned(
    schemas: &SchemaRegistry,
    lookup: &dyn ObjectLookup,
    order: &str,
    value: &Value,
) -> Result<Value, SanitizeError> {
    let schema = schemas
        .order(order)
        .ok_or_else(|| SanitizeError::Malformed(format!("order '{}' has no declared return type", order)))?;
    sanitize_value(&schema.returns, value, lookup)
}
