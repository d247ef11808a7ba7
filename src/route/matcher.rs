// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Runtime matching of a parsed route against a request.
//!
//! Matching walks the route components against the request's path
//! components; `**` consumes the whole remaining suffix and must come
//! last. A component with a transformer only matches if the transformer
//! accepts the candidate; parameter conditions check every actual value of
//! the named query parameter. Matching is a pure function of the path
//! components and query parameters, so the same request always yields the
//! same bindings.

use std::collections::HashMap;
use std::fmt;

use super::pattern::ComponentPattern;
use super::transformer::RouteValue;
use super::transformer::TransformerRegistry;
use super::ParameterCondition;
use super::RoutePath;
use crate::request::Request;

/// Error that aborts a match instead of failing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// The route names a transformer nobody registered. This is a
    /// configuration defect, reported as a server error rather than a
    /// fall-through to the next route.
    MissingTransformer(String),
}

impl fmt::Display for MatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MatchError::MissingTransformer(name) => {
                write!(f, "no transformer registered under the name `{}`", name)
            }
        }
    }
}

impl std::error::Error for MatchError {}

/// The bindings produced by a successful match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteMatch {
    /// `identifier → value` for every `:name` component; transformed when
    /// the component has a transformer, the raw segment otherwise.
    pub identifiers: HashMap<String, RouteValue>,
    /// `parameter → transformed values` for every parameter condition that
    /// carries a transformer.
    pub parameters: HashMap<String, Vec<RouteValue>>,
}

impl RouteMatch {
    /// The value captured under an identifier.
    pub fn get(&self, identifier: &str) -> Option<&RouteValue> {
        self.identifiers.get(identifier)
    }

    /// The transformed values of a query parameter.
    pub fn parameter(&self, name: &str) -> Option<&[RouteValue]> {
        self.parameters.get(name).map(|v| v.as_slice())
    }
}

impl RoutePath {
    /// Matches the route against path components and query parameters.
    ///
    /// Returns `Ok(None)` when the route simply does not match, and an
    /// error only for configuration defects such as a missing transformer.
    pub fn matches(
        &self,
        path_components: &[String],
        query_params: &[(String, String)],
        transformers: &TransformerRegistry,
    ) -> Result<Option<RouteMatch>, MatchError> {
        let mut bindings = RouteMatch::default();
        let mut consumed = 0;

        for component in self.components() {
            let candidate: String;
            if component.pattern == ComponentPattern::AnythingHereafter {
                candidate = path_components[consumed.min(path_components.len())..].join("/");
                consumed = path_components.len();
            } else {
                if consumed >= path_components.len() {
                    return Ok(None);
                }
                candidate = path_components[consumed].clone();
                consumed += 1;
            }

            if !component.pattern.test(&candidate) {
                return Ok(None);
            }

            let value = match &component.transformer {
                Some(name) => {
                    let transformer = transformers
                        .get(name)
                        .ok_or_else(|| MatchError::MissingTransformer(name.clone()))?;
                    match transformer.as_ref()(&candidate) {
                        Some(value) => value,
                        None => return Ok(None),
                    }
                }
                None => RouteValue::Text(candidate.clone()),
            };

            for (param, condition) in &component.parameters {
                match check_parameter(param, condition, query_params, transformers)? {
                    ParameterOutcome::NoMatch => return Ok(None),
                    ParameterOutcome::Accepted => {}
                    ParameterOutcome::Transformed(values) => {
                        bindings.parameters.insert(param.clone(), values);
                    }
                }
            }

            if let Some(identifier) = &component.identifier {
                bindings.identifiers.insert(identifier.clone(), value);
            }
        }

        // Every request path component must have been consumed.
        if consumed != path_components.len() {
            return Ok(None);
        }

        Ok(Some(bindings))
    }

    /// Convenience wrapper matching against a request directly.
    pub fn matches_request(
        &self,
        request: &Request,
        transformers: &TransformerRegistry,
    ) -> Result<Option<RouteMatch>, MatchError> {
        self.matches(
            request.path_components(),
            request.query_params(),
            transformers,
        )
    }
}

enum ParameterOutcome {
    NoMatch,
    Accepted,
    Transformed(Vec<RouteValue>),
}

fn check_parameter(
    param: &str,
    condition: &ParameterCondition,
    query_params: &[(String, String)],
    transformers: &TransformerRegistry,
) -> Result<ParameterOutcome, MatchError> {
    let values: Vec<&str> = query_params
        .iter()
        .filter(|(name, _)| name == param)
        .map(|(_, value)| value.as_str())
        .collect();

    if values.is_empty() {
        return Ok(if condition.optional {
            ParameterOutcome::Accepted
        } else {
            ParameterOutcome::NoMatch
        });
    }

    for value in &values {
        let satisfied = condition.alternatives.is_empty()
            || condition.alternatives.iter().any(|alt| alt.test(value));
        if !satisfied {
            return Ok(ParameterOutcome::NoMatch);
        }
    }

    if let Some(name) = &condition.transformer {
        let transformer = transformers
            .get(name)
            .ok_or_else(|| MatchError::MissingTransformer(name.clone()))?;
        let mut transformed = Vec::with_capacity(values.len());
        for value in &values {
            match transformer.as_ref()(value) {
                Some(value) => transformed.push(value),
                None => return Ok(ParameterOutcome::NoMatch),
            }
        }
        return Ok(ParameterOutcome::Transformed(transformed));
    }

    Ok(ParameterOutcome::Accepted)
}
