// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Pattern types the route grammar compiles into.
//!
//! A leaf [`Pattern`] is either an exact string or a compiled regular
//! expression (a token written `^…$`). Leaves combine into a
//! [`PatternGroup`] with `&&` and `||`, left-associatively: `a&&b||c`
//! evaluates as `(a&&b)||c`. A parenthesised group nests as a term.
//!
//! Patterns also define the precedence used when several routes could
//! match the same path: `Folder < ExactMatch < Regex < Anything <
//! AnythingHereafter`, and within condition groups `single < and < or`,
//! ties broken by comparing leaf sources lexicographically.

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;

/// A regular expression leaf, remembering its source text so patterns can
/// be compared and serialised.
#[derive(Debug, Clone)]
pub struct CompiledRegex {
    source: String,
    regex: Regex,
}

impl CompiledRegex {
    /// Compiles a `^…$` token.
    pub fn new(source: &str) -> Result<CompiledRegex, regex::Error> {
        Ok(CompiledRegex {
            source: source.to_owned(),
            regex: Regex::new(source)?,
        })
    }

    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[inline]
    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

impl PartialEq for CompiledRegex {
    fn eq(&self, other: &CompiledRegex) -> bool {
        self.source == other.source
    }
}

impl Eq for CompiledRegex {}

/// A leaf pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Matches a path component byte-for-byte.
    ExactMatch(String),
    /// Matches when the compiled regex matches.
    Regex(CompiledRegex),
}

impl Pattern {
    /// True if this leaf accepts the candidate string.
    pub fn test(&self, candidate: &str) -> bool {
        match self {
            Pattern::ExactMatch(s) => s == candidate,
            Pattern::Regex(r) => r.is_match(candidate),
        }
    }

    /// The source text the leaf was parsed from.
    pub fn source(&self) -> &str {
        match self {
            Pattern::ExactMatch(s) => s,
            Pattern::Regex(r) => r.source(),
        }
    }

    fn is_regex(&self) -> bool {
        matches!(self, Pattern::Regex(_))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.source())
    }
}

/// One term of a pattern group: a leaf or a parenthesised sub-group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternTerm {
    Pattern(Pattern),
    Group(Box<PatternGroup>),
}

impl PatternTerm {
    pub fn test(&self, candidate: &str) -> bool {
        match self {
            PatternTerm::Pattern(p) => p.test(candidate),
            PatternTerm::Group(g) => g.test(candidate),
        }
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Pattern>) {
        match self {
            PatternTerm::Pattern(p) => out.push(p),
            PatternTerm::Group(g) => g.collect_leaves(out),
        }
    }
}

impl fmt::Display for PatternTerm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PatternTerm::Pattern(p) => write!(f, "{}", p),
            PatternTerm::Group(g) => write!(f, "({})", g),
        }
    }
}

/// A boolean combination of patterns, built left-associatively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternGroup {
    Single(PatternTerm),
    And(Box<PatternGroup>, PatternTerm),
    Or(Box<PatternGroup>, PatternTerm),
}

impl PatternGroup {
    /// A group made of one exact-match leaf.
    pub fn exact<S>(s: S) -> PatternGroup
    where
        S: Into<String>,
    {
        PatternGroup::Single(PatternTerm::Pattern(Pattern::ExactMatch(s.into())))
    }

    /// True if the candidate satisfies the whole expression.
    pub fn test(&self, candidate: &str) -> bool {
        match self {
            PatternGroup::Single(t) => t.test(candidate),
            PatternGroup::And(g, t) => g.test(candidate) && t.test(candidate),
            PatternGroup::Or(g, t) => g.test(candidate) || t.test(candidate),
        }
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Pattern>) {
        match self {
            PatternGroup::Single(t) => t.collect_leaves(out),
            PatternGroup::And(g, t) | PatternGroup::Or(g, t) => {
                g.collect_leaves(out);
                t.collect_leaves(out);
            }
        }
    }

    /// All leaves of the expression, left to right.
    pub fn leaves(&self) -> Vec<&Pattern> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    /// True when no leaf is a regex.
    pub fn is_all_exact(&self) -> bool {
        self.leaves().iter().all(|p| !p.is_regex())
    }

    // single < and < or
    fn shape_rank(&self) -> u8 {
        match self {
            PatternGroup::Single(_) => 0,
            PatternGroup::And(_, _) => 1,
            PatternGroup::Or(_, _) => 2,
        }
    }
}

impl PartialOrd for PatternGroup {
    fn partial_cmp(&self, other: &PatternGroup) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PatternGroup {
    fn cmp(&self, other: &PatternGroup) -> Ordering {
        self.shape_rank()
            .cmp(&other.shape_rank())
            .then_with(|| {
                let mine: Vec<&str> = self.leaves().iter().map(|p| p.source()).collect();
                let theirs: Vec<&str> = other.leaves().iter().map(|p| p.source()).collect();
                mine.cmp(&theirs)
            })
    }
}

impl fmt::Display for PatternGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PatternGroup::Single(t) => write!(f, "{}", t),
            PatternGroup::And(g, t) => write!(f, "{}&&{}", g, t),
            PatternGroup::Or(g, t) => write!(f, "{}||{}", g, t),
        }
    }
}

/// The predicate attached to one `/`-delimited segment of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentPattern {
    /// Matches the empty segment produced by a trailing slash.
    Folder,
    /// Matches any single segment.
    Anything,
    /// Matches the entire remaining path suffix; only valid as the last
    /// component.
    AnythingHereafter,
    /// Matches a segment satisfying the expression.
    Condition(PatternGroup),
}

impl ComponentPattern {
    /// Tests one candidate segment. `AnythingHereafter` accepts whatever
    /// suffix the matcher hands it.
    pub fn test(&self, candidate: &str) -> bool {
        match self {
            ComponentPattern::Folder => candidate.is_empty(),
            ComponentPattern::Anything => true,
            ComponentPattern::AnythingHereafter => true,
            ComponentPattern::Condition(g) => g.test(candidate),
        }
    }

    // Folder < ExactMatch < Regex < Anything < AnythingHereafter
    fn rank(&self) -> u8 {
        match self {
            ComponentPattern::Folder => 0,
            ComponentPattern::Condition(g) if g.is_all_exact() => 1,
            ComponentPattern::Condition(_) => 2,
            ComponentPattern::Anything => 3,
            ComponentPattern::AnythingHereafter => 4,
        }
    }
}

impl PartialOrd for ComponentPattern {
    fn partial_cmp(&self, other: &ComponentPattern) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComponentPattern {
    fn cmp(&self, other: &ComponentPattern) -> Ordering {
        self.rank().cmp(&other.rank()).then_with(|| match (self, other) {
            (ComponentPattern::Condition(a), ComponentPattern::Condition(b)) => a.cmp(b),
            _ => Ordering::Equal,
        })
    }
}
