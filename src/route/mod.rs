// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The route-pattern DSL: a string grammar for path matching.
//!
//! A route string is `/` followed by `/`-separated components. Each
//! component is `(":" IDENT | "**" | "*" | LITERAL)? ("{" BODY "}")?`:
//!
//! - `users` matches the segment `users` exactly;
//! - `*` matches any single segment, `**` the entire remaining suffix;
//! - `:id` captures any segment under the identifier `id`;
//! - the optional `{…}` body holds, in order: a pattern (a bareword, a
//!   `^…$` regex, or a `&&`/`||` expression over them), a `<Transformer>`
//!   name, and a `{@param:{…},…}` dictionary of query-parameter
//!   conditions.
//!
//! A parameter condition is `"?"? ("[" "{" group "}" ("," "{" group "}")*
//! "]")? ("<" transformer ">")?`: `?` makes the parameter optional, each
//! listed group is an alternative at least one of which every actual value
//! must satisfy, and the transformer converts the values at match time.
//!
//! ```
//! use estaminet::route::RoutePath;
//!
//! let route: RoutePath = "/users/:id{^[0-9]+$<Int>}".parse().unwrap();
//! assert_eq!(route.to_string(), "/users/:id{^[0-9]+$<Int>}");
//! ```
//!
//! Parsing and serialisation are mutually inverse: for every successfully
//! parsed route `r`, parsing `r.to_string()` yields a value equal to `r`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

pub mod matcher;
pub mod parser;
pub mod pattern;
pub mod transformer;

pub use self::matcher::MatchError;
pub use self::matcher::RouteMatch;
pub use self::parser::ParseError;
pub use self::pattern::ComponentPattern;
pub use self::pattern::Pattern;
pub use self::pattern::PatternGroup;
pub use self::pattern::PatternTerm;
pub use self::transformer::RouteValue;
pub use self::transformer::TransformerRegistry;

/// Condition applied to one query parameter by a route component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterCondition {
    /// When true, a request without this parameter still matches.
    pub optional: bool,
    /// Alternatives; every actual value must satisfy at least one. An
    /// empty list accepts any value.
    pub alternatives: Vec<PatternGroup>,
    /// Transformer applied to every value at match time.
    pub transformer: Option<String>,
}

impl fmt::Display for ParameterCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.optional {
            write!(f, "?")?;
        }
        if !self.alternatives.is_empty() {
            write!(f, "[")?;
            for (i, group) in self.alternatives.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{{{}}}", group)?;
            }
            write!(f, "]")?;
        }
        if let Some(name) = &self.transformer {
            write!(f, "<{}>", name)?;
        }
        Ok(())
    }
}

/// One `/`-delimited component of a parsed route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteComponent {
    /// Identifier capturing the matched segment, from a `:name` prefix.
    pub identifier: Option<String>,
    /// The predicate the segment must satisfy.
    pub pattern: ComponentPattern,
    /// Transformer applied to the matched segment.
    pub transformer: Option<String>,
    /// Query-parameter conditions, in declaration order.
    pub parameters: Vec<(String, ParameterCondition)>,
}

impl RouteComponent {
    pub(crate) fn folder() -> RouteComponent {
        RouteComponent {
            identifier: None,
            pattern: ComponentPattern::Folder,
            transformer: None,
            parameters: Vec::new(),
        }
    }

    /// The parameter condition for `name`, if declared.
    pub fn parameter(&self, name: &str) -> Option<&ParameterCondition> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    // The body pattern text, when the pattern cannot live in the prefix.
    fn body_pattern(&self) -> Option<String> {
        match (&self.identifier, &self.pattern) {
            // `:id` alone means Anything; no body pattern needed.
            (Some(_), ComponentPattern::Anything) => None,
            (Some(_), ComponentPattern::AnythingHereafter) => Some("**".to_owned()),
            (Some(_), ComponentPattern::Condition(g)) => Some(g.to_string()),
            (Some(_), ComponentPattern::Folder) => None,
            (None, ComponentPattern::Condition(g)) => match literal_prefix(g) {
                // A single exact leaf serialises as the literal prefix.
                Some(_) => None,
                None => Some(g.to_string()),
            },
            (None, _) => None,
        }
    }
}

// The literal of a group that is exactly one exact-match leaf and can be
// written as a bare component prefix: a literal starting with `:` or `*`
// would re-parse as an identifier or a wildcard, so it stays in the body.
fn literal_prefix(group: &PatternGroup) -> Option<&str> {
    match group {
        PatternGroup::Single(PatternTerm::Pattern(Pattern::ExactMatch(s)))
            if !s.is_empty() && !s.starts_with(':') && !s.starts_with('*') =>
        {
            Some(s)
        }
        _ => None,
    }
}

impl fmt::Display for RouteComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Prefix.
        match &self.identifier {
            Some(id) => write!(f, ":{}", id)?,
            None => match &self.pattern {
                ComponentPattern::Folder => {}
                ComponentPattern::Anything => write!(f, "*")?,
                ComponentPattern::AnythingHereafter => write!(f, "**")?,
                ComponentPattern::Condition(g) => {
                    if let Some(literal) = literal_prefix(g) {
                        write!(f, "{}", literal)?;
                    }
                }
            },
        }

        // Body.
        let body_pattern = self.body_pattern();
        if body_pattern.is_none() && self.transformer.is_none() && self.parameters.is_empty() {
            return Ok(());
        }
        write!(f, "{{")?;
        if let Some(pattern) = body_pattern {
            write!(f, "{}", pattern)?;
        }
        if let Some(name) = &self.transformer {
            write!(f, "<{}>", name)?;
        }
        if !self.parameters.is_empty() {
            write!(f, "{{")?;
            for (i, (key, cond)) in self.parameters.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "@{}:{{{}}}", key, cond)?;
            }
            write!(f, "}}")?;
        }
        write!(f, "}}")
    }
}

/// A parsed route path, immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePath {
    components: Vec<RouteComponent>,
    absolute: bool,
}

impl RoutePath {
    pub(crate) fn new(components: Vec<RouteComponent>, absolute: bool) -> RoutePath {
        RoutePath { components, absolute }
    }

    /// Parses a full route path; the string must start with `/`.
    pub fn parse(s: &str) -> Result<RoutePath, ParseError> {
        parser::parse_route_path(s)
    }

    /// Parses a route slice for appending under a prefix; the string must
    /// not start with `/`.
    pub fn parse_slice(s: &str) -> Result<RoutePath, ParseError> {
        parser::parse_route_slice(s)
    }

    pub fn components(&self) -> &[RouteComponent] {
        &self.components
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Orders routes for a route table: at each position `Folder <
    /// ExactMatch < Regex < Anything < AnythingHereafter`, so that
    /// exact-match routes are tried before wildcard routes.
    pub fn cmp_precedence(&self, other: &RoutePath) -> Ordering {
        for (mine, theirs) in self.components.iter().zip(other.components.iter()) {
            match mine.pattern.cmp(&theirs.pattern) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.components.len().cmp(&other.components.len())
    }
}

impl fmt::Display for RoutePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.absolute {
            write!(f, "/")?;
        }
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", component)?;
        }
        Ok(())
    }
}

impl FromStr for RoutePath {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<RoutePath, ParseError> {
        RoutePath::parse(s)
    }
}
