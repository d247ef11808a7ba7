// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Named value transformers invoked by the route matcher.
//!
//! A route like `/users/:id{^[0-9]+$<Int>}` names a transformer, `Int`,
//! that converts the captured string into a typed value at match time.
//! Transformers are registered by the host application; a route that names
//! an unregistered transformer fails the whole match with a 500-class
//! error rather than falling through to another route.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A value produced by a transformer, or the raw capture when no
/// transformer is attached.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteValue {
    Text(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

impl RouteValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RouteValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            RouteValue::Int(n) => Some(*n),
            RouteValue::UInt(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            RouteValue::UInt(n) => Some(*n),
            RouteValue::Int(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            RouteValue::Float(x) => Some(*x),
            RouteValue::Int(n) => Some(*n as f64),
            RouteValue::UInt(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RouteValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for RouteValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RouteValue::Text(s) => write!(f, "{}", s),
            RouteValue::Int(n) => write!(f, "{}", n),
            RouteValue::UInt(n) => write!(f, "{}", n),
            RouteValue::Float(x) => write!(f, "{}", x),
            RouteValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// A host-supplied conversion from a captured string to a typed value.
/// Returning `None` fails the match for that candidate.
pub type Transformer = Arc<dyn Fn(&str) -> Option<RouteValue> + Send + Sync>;

/// The set of transformers known to a route table.
#[derive(Clone, Default)]
pub struct TransformerRegistry {
    transformers: HashMap<String, Transformer>,
}

impl TransformerRegistry {
    /// An empty registry.
    pub fn new() -> TransformerRegistry {
        TransformerRegistry { transformers: HashMap::new() }
    }

    /// A registry preloaded with `Int`, `UInt`, `Float`, `Bool`,
    /// `Lowercased` and `Uppercased`.
    pub fn with_defaults() -> TransformerRegistry {
        let mut registry = TransformerRegistry::new();
        registry.register("Int", |s| s.parse().ok().map(RouteValue::Int));
        registry.register("UInt", |s| s.parse().ok().map(RouteValue::UInt));
        registry.register("Float", |s| s.parse().ok().map(RouteValue::Float));
        registry.register("Bool", |s| match s {
            "true" | "1" | "yes" => Some(RouteValue::Bool(true)),
            "false" | "0" | "no" => Some(RouteValue::Bool(false)),
            _ => None,
        });
        registry.register("Lowercased", |s| {
            Some(RouteValue::Text(s.to_lowercase()))
        });
        registry.register("Uppercased", |s| {
            Some(RouteValue::Text(s.to_uppercase()))
        });
        registry
    }

    /// Registers a transformer under a name, replacing any previous one.
    pub fn register<N, F>(&mut self, name: N, transformer: F)
    where
        N: Into<String>,
        F: Fn(&str) -> Option<RouteValue> + Send + Sync + 'static,
    {
        self.transformers.insert(name.into(), Arc::new(transformer));
    }

    /// Looks a transformer up by name.
    pub fn get(&self, name: &str) -> Option<&Transformer> {
        self.transformers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transformers.contains_key(name)
    }
}
