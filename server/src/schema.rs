//! Declared argument and return types for every function crossing the wire
//!
//! A game namespace ships one [`SchemaRegistry`]: the `ai` section describes the
//! functions the server may order a client to run, the `game_objects` section
//! describes, per game-object type, the functions a client may ask the server
//! to run. Registries are built once and never mutated afterwards.

use shared::Value;
use std::collections::HashMap;
use std::fmt;

/// Shape a value must have after sanitizing
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDescriptor {
    Void,
    Boolean,
    Int,
    Float,
    String,
    List(Box<TypeDescriptor>),
    Dictionary(Box<TypeDescriptor>),
    /// Reference to a live game object; `type_name` "GameObject" accepts any type.
    GameObject { type_name: String, nullable: bool },
}

impl TypeDescriptor {
    pub fn list(inner: TypeDescriptor) -> Self {
        TypeDescriptor::List(Box::new(inner))
    }

    pub fn dictionary(inner: TypeDescriptor) -> Self {
        TypeDescriptor::Dictionary(Box::new(inner))
    }

    pub fn game_object(type_name: &str) -> Self {
        TypeDescriptor::GameObject {
            type_name: type_name.to_string(),
            nullable: false,
        }
    }

    pub fn nullable_game_object(type_name: &str) -> Self {
        TypeDescriptor::GameObject {
            type_name: type_name.to_string(),
            nullable: true,
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Void => f.write_str("void"),
            TypeDescriptor::Boolean => f.write_str("boolean"),
            TypeDescriptor::Int => f.write_str("int"),
            TypeDescriptor::Float => f.write_str("float"),
            TypeDescriptor::String => f.write_str("string"),
            TypeDescriptor::List(inner) => write!(f, "list<{}>", inner),
            TypeDescriptor::Dictionary(inner) => write!(f, "dictionary<string, {}>", inner),
            TypeDescriptor::GameObject { type_name, nullable } => {
                write!(f, "{}", type_name)?;
                if *nullable {
                    f.write_str(" or null")?;
                }
                Ok(())
            }
        }
    }
}

/// One positional argument of a function
#[derive(Debug, Clone, PartialEq)]
pub struct ArgDescriptor {
    pub name: String,
    pub kind: TypeDescriptor,
    /// Used when the client omits the argument
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ArgDescriptor {
    pub fn new(name: &str, kind: TypeDescriptor) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default: None,
            min: None,
            max: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSchema {
    pub args: Vec<ArgDescriptor>,
    pub returns: TypeDescriptor,
}

impl FunctionSchema {
    pub fn new(returns: TypeDescriptor) -> Self {
        Self {
            args: Vec::new(),
            returns,
        }
    }

    pub fn arg(mut self, arg: ArgDescriptor) -> Self {
        self.args.push(arg);
        self
    }
}

/// Functions declared on one game-object type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameObjectSchema {
    pub functions: HashMap<String, FunctionSchema>,
}

impl GameObjectSchema {
    pub fn function(&self, name: &str) -> Option<&FunctionSchema> {
        self.functions.get(name)
    }
}

/// Immutable schema set of one game namespace
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    ai: HashMap<String, FunctionSchema>,
    game_objects: HashMap<String, GameObjectSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a function the server may order clients to run
    pub fn with_order(mut self, name: &str, schema: FunctionSchema) -> Self {
        self.ai.insert(name.to_string(), schema);
        self
    }

    /// Declares a function clients may run on objects of `type_name`
    pub fn with_function(mut self, type_name: &str, name: &str, schema: FunctionSchema) -> Self {
        self.game_objects
            .entry(type_name.to_string())
            .or_default()
            .functions
            .insert(name.to_string(), schema);
        self
    }

    /// Declares a game-object type, possibly without any callable functions
    pub fn with_type(mut self, type_name: &str) -> Self {
        self.game_objects.entry(type_name.to_string()).or_default();
        self
    }

    pub fn order(&self, name: &str) -> Option<&FunctionSchema> {
        self.ai.get(name)
    }

    pub fn game_object(&self, type_name: &str) -> Option<&GameObjectSchema> {
        self.game_objects.get(type_name)
    }

    pub fn function(&self, type_name: &str, name: &str) -> Option<&FunctionSchema> {
        self.game_object(type_name)?.function(name)
    }

    /// Every (type, function) pair clients may call
    pub fn declared_functions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.game_objects.iter().flat_map(|(type_name, schema)| {
            schema
                .functions
                .keys()
                .map(move |function| (type_name.as_str(), function.as_str()))
        })
    }
}
