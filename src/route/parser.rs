// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Recursive-descent parser for the route-pattern grammar.
//!
//! The tokenizer is aware of the four block containers (object `{}`,
//! array `[]`, dictionary `{@k:{v},…}` and transformer `<>`), so `/` only
//! separates components outside of them. Regex tokens start at `^` and run
//! to the first `$` that is followed by a delimiter, so container
//! characters inside a regex don't confuse the scanner.

use std::fmt;

use super::pattern::CompiledRegex;
use super::pattern::ComponentPattern;
use super::pattern::Pattern;
use super::pattern::PatternGroup;
use super::pattern::PatternTerm;
use super::ParameterCondition;
use super::RouteComponent;
use super::RoutePath;

/// Structured error describing why a route string did not parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A full route path must start with `/`.
    MissingLeadingSlash,
    /// A route slice must not start with `/`.
    UnexpectedLeadingSlash,
    /// A required separator (`@`, `:`, `{`…) was not found.
    MissingSeparator { expected: char, offset: usize },
    /// A container opened here was never closed.
    MissingClosing { container: char, offset: usize },
    /// The input ended where a token was still expected.
    MissingSuffix { offset: usize },
    /// The same query parameter was declared twice in one component.
    DuplicateParameter { key: String },
    /// A character that cannot appear at this position.
    InvalidCharacter { character: char, offset: usize },
    /// Leftover input after a component body.
    TrailingCharacters { offset: usize },
    /// `**` somewhere else than the last component.
    NestedHereafter { offset: usize },
    /// An identifier or parameter key was empty.
    EmptyIdentifier { offset: usize },
    /// A `^…$` token that the regex engine rejected.
    InvalidRegex { source: String, detail: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::MissingLeadingSlash => write!(f, "a route path must start with `/`"),
            ParseError::UnexpectedLeadingSlash => {
                write!(f, "a route slice must not start with `/`")
            }
            ParseError::MissingSeparator { expected, offset } => {
                write!(f, "expected `{}` at offset {}", expected, offset)
            }
            ParseError::MissingClosing { container, offset } => {
                write!(f, "container opened at offset {} is missing its `{}`", offset, container)
            }
            ParseError::MissingSuffix { offset } => {
                write!(f, "input ended at offset {} where a token was expected", offset)
            }
            ParseError::DuplicateParameter { key } => {
                write!(f, "query parameter `{}` is declared twice", key)
            }
            ParseError::InvalidCharacter { character, offset } => {
                write!(f, "unexpected `{}` at offset {}", character, offset)
            }
            ParseError::TrailingCharacters { offset } => {
                write!(f, "leftover input at offset {}", offset)
            }
            ParseError::NestedHereafter { offset } => {
                write!(f, "`**` at offset {} must be the last component", offset)
            }
            ParseError::EmptyIdentifier { offset } => {
                write!(f, "empty identifier at offset {}", offset)
            }
            ParseError::InvalidRegex { source, detail } => {
                write!(f, "invalid regex `{}`: {}", source, detail)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parses a full route path starting with `/`.
pub fn parse_route_path(s: &str) -> Result<RoutePath, ParseError> {
    Parser::new(s).parse_path(true)
}

/// Parses a route slice, which must not start with `/`.
pub fn parse_route_slice(s: &str) -> Result<RoutePath, ParseError> {
    Parser::new(s).parse_path(false)
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            '&' | '|' | '(' | ')' | '{' | '}' | '<' | '>' | ',' | '[' | ']' | '/'
        )
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(s: &str) -> Parser {
        Parser { chars: s.chars().collect(), pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn parse_path(mut self, absolute: bool) -> Result<RoutePath, ParseError> {
        if absolute {
            if !self.eat('/') {
                return Err(ParseError::MissingLeadingSlash);
            }
        } else if self.peek() == Some('/') {
            return Err(ParseError::UnexpectedLeadingSlash);
        }

        let mut components = Vec::new();
        if self.at_end() {
            if absolute {
                components.push(RouteComponent::folder());
            }
        } else {
            loop {
                components.push(self.parse_component()?);
                if self.at_end() {
                    break;
                }
                // parse_component only stops at `/` or the end.
                self.eat('/');
                if self.at_end() {
                    components.push(RouteComponent::folder());
                    break;
                }
            }
        }

        for (index, component) in components.iter().enumerate() {
            if component.pattern == ComponentPattern::AnythingHereafter
                && index + 1 != components.len()
            {
                return Err(ParseError::NestedHereafter { offset: 0 });
            }
        }

        Ok(RoutePath::new(components, absolute))
    }

    fn parse_component(&mut self) -> Result<RouteComponent, ParseError> {
        let mut identifier = None;
        let mut prefix = None;

        match self.peek() {
            Some(':') => {
                self.bump();
                identifier = Some(self.read_identifier()?);
            }
            Some('*') => {
                self.bump();
                prefix = Some(if self.eat('*') {
                    ComponentPattern::AnythingHereafter
                } else {
                    ComponentPattern::Anything
                });
            }
            Some('{') | Some('/') | None => {}
            Some(_) => {
                let literal = self.read_literal()?;
                prefix = Some(ComponentPattern::Condition(PatternGroup::exact(literal)));
            }
        }

        let mut body_pattern = None;
        let mut transformer = None;
        let mut parameters = Vec::new();
        if self.peek() == Some('{') {
            let body_offset = self.pos;
            let body = self.parse_body()?;
            body_pattern = body.0;
            transformer = body.1;
            parameters = body.2;
            if prefix.is_some() && body_pattern.is_some() {
                // A literal or wildcard prefix already fixes the pattern.
                return Err(ParseError::InvalidCharacter { character: '{', offset: body_offset });
            }
        }

        let pattern = match (prefix, body_pattern, &identifier) {
            (Some(p), None, _) => p,
            (None, Some(p), _) => p,
            (None, None, Some(_)) => ComponentPattern::Anything,
            (None, None, None) => ComponentPattern::Folder,
            (Some(_), Some(_), _) => unreachable!(),
        };

        // Anything left after the body is extra input.
        match self.peek() {
            None | Some('/') => {}
            Some(_) => {
                return Err(ParseError::TrailingCharacters { offset: self.pos });
            }
        }

        Ok(RouteComponent { identifier, pattern, transformer, parameters })
    }

    fn read_identifier(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == '/' || c == '{' {
                break;
            }
            if c == '\\' || is_delimiter(c) || c == '*' || c == '?' {
                return Err(ParseError::InvalidCharacter { character: c, offset: self.pos });
            }
            out.push(c);
            self.pos += 1;
        }
        if out.is_empty() {
            return Err(ParseError::EmptyIdentifier { offset: start });
        }
        Ok(out)
    }

    fn read_literal(&mut self) -> Result<String, ParseError> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == '/' || c == '{' {
                break;
            }
            if c == '\\' {
                return Err(ParseError::InvalidCharacter { character: c, offset: self.pos });
            }
            out.push(c);
            self.pos += 1;
        }
        Ok(out)
    }

    // Parses `{ [pattern] [<transformer>] [{@k:{cond},…}] }`.
    #[allow(clippy::type_complexity)]
    fn parse_body(
        &mut self,
    ) -> Result<
        (Option<ComponentPattern>, Option<String>, Vec<(String, ParameterCondition)>),
        ParseError,
    > {
        let open = self.pos;
        self.bump(); // '{'
        self.skip_ws();

        let mut body_pattern = None;
        match self.peek() {
            Some('<') | Some('{') | Some('}') | None => {}
            Some('*') => {
                let offset = self.pos;
                self.bump();
                body_pattern = Some(if self.eat('*') {
                    ComponentPattern::AnythingHereafter
                } else {
                    ComponentPattern::Anything
                });
                self.skip_ws();
                match self.peek() {
                    Some('<') | Some('{') | Some('}') => {}
                    Some(c) => {
                        return Err(ParseError::InvalidCharacter { character: c, offset });
                    }
                    None => {
                        return Err(ParseError::MissingClosing { container: '}', offset: open });
                    }
                }
            }
            Some(_) => {
                let group = self.parse_group()?;
                self.skip_ws();
                match self.peek() {
                    Some('<') | Some('{') | Some('}') => {}
                    Some(c) => {
                        return Err(ParseError::InvalidCharacter { character: c, offset: self.pos });
                    }
                    None => {
                        return Err(ParseError::MissingClosing { container: '}', offset: open });
                    }
                }
                body_pattern = Some(ComponentPattern::Condition(group));
            }
        }

        self.skip_ws();
        let mut transformer = None;
        if self.peek() == Some('<') {
            transformer = Some(self.parse_transformer()?);
        }

        self.skip_ws();
        let mut parameters = Vec::new();
        if self.peek() == Some('{') {
            parameters = self.parse_param_dict()?;
        }

        self.skip_ws();
        if !self.eat('}') {
            return Err(ParseError::MissingClosing { container: '}', offset: open });
        }
        Ok((body_pattern, transformer, parameters))
    }

    fn parse_transformer(&mut self) -> Result<String, ParseError> {
        let open = self.pos;
        self.bump(); // '<'
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('>') => break,
                Some(c) if c == '/' || c == '\\' || c == '<' => {
                    return Err(ParseError::InvalidCharacter { character: c, offset: self.pos - 1 });
                }
                Some(c) => out.push(c),
                None => {
                    return Err(ParseError::MissingClosing { container: '>', offset: open });
                }
            }
        }
        let out = out.trim().to_owned();
        if out.is_empty() {
            return Err(ParseError::EmptyIdentifier { offset: open });
        }
        Ok(out)
    }

    // term (("&&" | "||") term)*, left-associative.
    fn parse_group(&mut self) -> Result<PatternGroup, ParseError> {
        let mut group = PatternGroup::Single(self.parse_term()?);
        loop {
            self.skip_ws();
            match self.peek() {
                Some('&') => {
                    let offset = self.pos;
                    self.bump();
                    if !self.eat('&') {
                        return Err(ParseError::MissingSeparator { expected: '&', offset });
                    }
                    let term = self.parse_term()?;
                    group = PatternGroup::And(Box::new(group), term);
                }
                Some('|') => {
                    let offset = self.pos;
                    self.bump();
                    if !self.eat('|') {
                        return Err(ParseError::MissingSeparator { expected: '|', offset });
                    }
                    let term = self.parse_term()?;
                    group = PatternGroup::Or(Box::new(group), term);
                }
                _ => return Ok(group),
            }
        }
    }

    fn parse_term(&mut self) -> Result<PatternTerm, ParseError> {
        self.skip_ws();
        match self.peek() {
            Some('(') => {
                let open = self.pos;
                self.bump();
                let group = self.parse_group()?;
                self.skip_ws();
                if !self.eat(')') {
                    return Err(ParseError::MissingClosing { container: ')', offset: open });
                }
                Ok(PatternTerm::Group(Box::new(group)))
            }
            Some('^') => {
                let source = self.read_regex_token()?;
                let compiled = CompiledRegex::new(&source).map_err(|err| {
                    ParseError::InvalidRegex { source: source.clone(), detail: err.to_string() }
                })?;
                Ok(PatternTerm::Pattern(Pattern::Regex(compiled)))
            }
            Some(_) => {
                let offset = self.pos;
                let word = self.read_bareword()?;
                if word == "**" {
                    return Err(ParseError::NestedHereafter { offset });
                }
                if word == "*" {
                    return Err(ParseError::InvalidCharacter { character: '*', offset });
                }
                Ok(PatternTerm::Pattern(Pattern::ExactMatch(word)))
            }
            None => Err(ParseError::MissingSuffix { offset: self.pos }),
        }
    }

    // A regex token runs from `^` to the first `$` that is followed by a
    // delimiter (or the end of input), so `$` inside the expression does
    // not cut it short.
    fn read_regex_token(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let mut out = String::new();
        out.push(self.bump().unwrap()); // '^'
        loop {
            match self.bump() {
                Some('$') => {
                    out.push('$');
                    match self.peek() {
                        None => return Ok(out),
                        Some(c) if is_delimiter(c) => return Ok(out),
                        Some(_) => continue,
                    }
                }
                Some(c) => out.push(c),
                None => return Err(ParseError::MissingSuffix { offset: start }),
            }
        }
    }

    fn read_bareword(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if is_delimiter(c) {
                break;
            }
            if c == '\\' {
                return Err(ParseError::InvalidCharacter { character: c, offset: self.pos });
            }
            out.push(c);
            self.pos += 1;
        }
        if out.is_empty() {
            return Err(ParseError::MissingSuffix { offset: start });
        }
        Ok(out)
    }

    fn parse_param_dict(&mut self) -> Result<Vec<(String, ParameterCondition)>, ParseError> {
        let open = self.pos;
        self.bump(); // '{'
        let mut params: Vec<(String, ParameterCondition)> = Vec::new();
        loop {
            self.skip_ws();
            if self.eat('}') {
                return Ok(params);
            }
            if !self.eat('@') {
                return Err(ParseError::MissingSeparator { expected: '@', offset: self.pos });
            }
            let key = self.read_param_key()?;
            self.skip_ws();
            if !self.eat(':') {
                return Err(ParseError::MissingSeparator { expected: ':', offset: self.pos });
            }
            self.skip_ws();
            let cond_open = self.pos;
            if !self.eat('{') {
                return Err(ParseError::MissingSeparator { expected: '{', offset: self.pos });
            }
            let condition = self.parse_param_condition()?;
            self.skip_ws();
            if !self.eat('}') {
                return Err(ParseError::MissingClosing { container: '}', offset: cond_open });
            }
            if params.iter().any(|(k, _)| k == &key) {
                return Err(ParseError::DuplicateParameter { key });
            }
            params.push((key, condition));
            self.skip_ws();
            if self.eat(',') {
                continue;
            }
            if self.eat('}') {
                return Ok(params);
            }
            return Err(ParseError::MissingClosing { container: '}', offset: open });
        }
    }

    fn read_param_key(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == ':' || c.is_whitespace() || matches!(c, '{' | '}' | ',') {
                break;
            }
            if c == '\\' || c == '/' {
                return Err(ParseError::InvalidCharacter { character: c, offset: self.pos });
            }
            out.push(c);
            self.pos += 1;
        }
        if out.is_empty() {
            return Err(ParseError::EmptyIdentifier { offset: start });
        }
        Ok(out)
    }

    fn parse_param_condition(&mut self) -> Result<ParameterCondition, ParseError> {
        self.skip_ws();
        let optional = self.eat('?');
        self.skip_ws();

        let mut alternatives = Vec::new();
        if self.peek() == Some('[') {
            let open = self.pos;
            self.bump();
            loop {
                self.skip_ws();
                let alt_open = self.pos;
                if !self.eat('{') {
                    return Err(ParseError::MissingSeparator { expected: '{', offset: self.pos });
                }
                let group = self.parse_group()?;
                self.skip_ws();
                if !self.eat('}') {
                    return Err(ParseError::MissingClosing { container: '}', offset: alt_open });
                }
                alternatives.push(group);
                self.skip_ws();
                if self.eat(',') {
                    continue;
                }
                if self.eat(']') {
                    break;
                }
                return Err(ParseError::MissingClosing { container: ']', offset: open });
            }
        }

        self.skip_ws();
        let mut transformer = None;
        if self.peek() == Some('<') {
            transformer = Some(self.parse_transformer()?);
        }

        Ok(ParameterCondition { optional, alternatives, transformer })
    }
}

#[cfg(test)]
mod tests {
    use super::parse_route_path;
    use super::parse_route_slice;
    use super::ParseError;
    use crate::route::pattern::ComponentPattern;
    use crate::route::pattern::PatternGroup;
    use crate::route::RoutePath;

    fn parse(s: &str) -> RoutePath {
        parse_route_path(s).unwrap()
    }

    #[test]
    fn root_is_a_single_folder() {
        let route = parse("/");
        assert_eq!(route.components().len(), 1);
        assert_eq!(route.components()[0].pattern, ComponentPattern::Folder);
    }

    #[test]
    fn literal_components() {
        let route = parse("/users/list");
        assert_eq!(route.components().len(), 2);
        assert_eq!(
            route.components()[0].pattern,
            ComponentPattern::Condition(PatternGroup::exact("users"))
        );
    }

    #[test]
    fn trailing_slash_appends_folder() {
        let route = parse("/a/");
        assert_eq!(route.components().len(), 2);
        assert_eq!(route.components()[1].pattern, ComponentPattern::Folder);
    }

    #[test]
    fn identifier_with_regex_and_transformer() {
        let route = parse("/users/:id{^[0-9]+$<Int>}");
        let component = &route.components()[1];
        assert_eq!(component.identifier.as_deref(), Some("id"));
        assert_eq!(component.transformer.as_deref(), Some("Int"));
        match &component.pattern {
            ComponentPattern::Condition(group) => {
                assert!(group.test("42"));
                assert!(!group.test("abc"));
            }
            other => panic!("unexpected pattern: {:?}", other),
        }
    }

    #[test]
    fn bare_identifier_matches_anything() {
        let route = parse("/users/:id");
        assert_eq!(route.components()[1].pattern, ComponentPattern::Anything);
    }

    #[test]
    fn wildcards() {
        let route = parse("/files/**");
        assert_eq!(
            route.components()[1].pattern,
            ComponentPattern::AnythingHereafter
        );
        let route = parse("/a/*/c");
        assert_eq!(route.components()[1].pattern, ComponentPattern::Anything);
    }

    #[test]
    fn hereafter_must_be_last() {
        assert!(matches!(
            parse_route_path("/a/**/b"),
            Err(ParseError::NestedHereafter { .. })
        ));
    }

    #[test]
    fn group_is_left_associative() {
        let route = parse("/x{^a.*$&&^.*z$||literal}");
        match &route.components()[1].pattern {
            ComponentPattern::Condition(group) => {
                // (a && z) || literal
                assert!(group.test("abz"));
                assert!(group.test("literal"));
                assert!(!group.test("ab"));
                assert!(matches!(group, PatternGroup::Or(_, _)));
            }
            other => panic!("unexpected pattern: {:?}", other),
        }
    }

    #[test]
    fn parenthesised_group_nests() {
        let route = parse("/x{^a.*$&&(^.*z$||^.*y$)}");
        match &route.components()[1].pattern {
            ComponentPattern::Condition(group) => {
                assert!(group.test("abz"));
                assert!(group.test("aby"));
                assert!(!group.test("bz"));
            }
            other => panic!("unexpected pattern: {:?}", other),
        }
    }

    #[test]
    fn parameter_conditions() {
        let route = parse("/search{@q:{[{^.+$}]},@page:{?<Int>},@sort:{?[{asc||desc}]}}");
        let component = &route.components()[1];
        assert_eq!(component.parameters.len(), 3);

        let q = component.parameter("q").unwrap();
        assert!(!q.optional);
        assert_eq!(q.alternatives.len(), 1);

        let page = component.parameter("page").unwrap();
        assert!(page.optional);
        assert_eq!(page.transformer.as_deref(), Some("Int"));

        let sort = component.parameter("sort").unwrap();
        assert!(sort.optional);
        assert!(sort.alternatives[0].test("asc"));
        assert!(sort.alternatives[0].test("desc"));
        assert!(!sort.alternatives[0].test("sideways"));
    }

    #[test]
    fn duplicate_parameter_rejected() {
        assert!(matches!(
            parse_route_path("/s{@q:{},@q:{}}"),
            Err(ParseError::DuplicateParameter { .. })
        ));
    }

    #[test]
    fn missing_leading_slash() {
        assert_eq!(parse_route_path("a/b"), Err(ParseError::MissingLeadingSlash));
        assert_eq!(
            parse_route_slice("/a"),
            Err(ParseError::UnexpectedLeadingSlash)
        );
        assert!(parse_route_slice("a/b").is_ok());
    }

    #[test]
    fn prefix_plus_body_pattern_conflict() {
        assert!(matches!(
            parse_route_path("/users{^u.*$}x"),
            Err(ParseError::InvalidCharacter { .. }) | Err(ParseError::TrailingCharacters { .. })
        ));
        assert!(matches!(
            parse_route_path("/*{^a$}"),
            Err(ParseError::InvalidCharacter { .. })
        ));
    }

    #[test]
    fn unclosed_body() {
        assert!(matches!(
            parse_route_path("/x{^a$"),
            Err(ParseError::MissingClosing { .. }) | Err(ParseError::MissingSuffix { .. })
        ));
    }

    #[test]
    fn invalid_regex_reported() {
        assert!(matches!(
            parse_route_path("/x{^[$}"),
            Err(ParseError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn hereafter_inside_group_rejected() {
        assert!(matches!(
            parse_route_path("/x{a&&**}"),
            Err(ParseError::NestedHereafter { .. })
        ));
    }

    #[test]
    fn backslash_rejected() {
        assert!(matches!(
            parse_route_path("/a\\b"),
            Err(ParseError::InvalidCharacter { character: '\\', .. })
        ));
    }

    #[test]
    fn round_trip_is_idempotent() {
        let samples = [
            "/",
            "/a",
            "/a/",
            "/a/b/c",
            "/*",
            "/files/**",
            "/users/:id",
            "/users/:id{^[0-9]+$<Int>}",
            "/x{^a.*$&&^.*z$||literal}",
            "/x{^a$&&(b||c)}",
            "/search{@q:{[{^.+$}]},@page:{?<Int>}}",
            "/s{@flag:{?}}",
            "/:rest{**}",
            "/mixed/:name{^[a-z]+$<Lowercased>{@v:{?[{^[0-9]+$},{none}]<Int>}}}",
        ];
        for sample in samples {
            let parsed = parse_route_path(sample).unwrap();
            let serialised = parsed.to_string();
            let reparsed = parse_route_path(&serialised)
                .unwrap_or_else(|err| panic!("`{}` did not reparse: {}", serialised, err));
            assert_eq!(parsed, reparsed, "round trip of `{}` via `{}`", sample, serialised);
        }
    }

    #[test]
    fn whitespace_is_tolerated_inside_bodies() {
        let spaced = parse("/users/:id{ ^[0-9]+$ <Int> { @sort : { ?[{asc||desc}] } } }");
        let tight = parse("/users/:id{^[0-9]+$<Int>{@sort:{?[{asc||desc}]}}}");
        assert_eq!(spaced, tight);
    }
}
