// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./enforce_test.rs"]
mod enforce_test;

use promguard_ql::ast::Expr;
use promguard_ql::dedupe::dedupe_matchers;
use promguard_ql::matcher::{matchers_to_string, LabelMatcher};
use promguard_ql::parser::{self, ParseError};
use std::collections::BTreeMap;

const MATCHERS_PARAM: &str = "match[]";

//
// ConflictMode
//

/// What to do when a caller supplied matcher names an enforced label with a
/// value the enforced matcher rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictMode {
  /// Drop the caller's matcher and enforce ours.
  #[default]
  Lenient,
  /// Refuse the request.
  Strict,
}

impl std::str::FromStr for ConflictMode {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "lenient" => Ok(Self::Lenient),
      "strict" => Ok(Self::Strict),
      other => Err(anyhow::anyhow!(
        "invalid conflict mode {other:?}, expected \"lenient\" or \"strict\""
      )),
    }
  }
}

//
// IllegalMatcherError
//

#[derive(Debug, Clone, thiserror::Error)]
#[error("allowed label matcher ({allowed}) conflicts with given label matcher ({given})")]
pub struct IllegalMatcherError {
  allowed: String,
  given: String,
}

impl IllegalMatcherError {
  pub(crate) fn new(allowed: &LabelMatcher, given: &LabelMatcher) -> Self {
    Self {
      allowed: allowed.to_string(),
      given: given.to_string(),
    }
  }
}

//
// RewriteError
//

/// Failure modes of a query rewrite. Parse failures are dropped silently by
/// the dispatcher, matcher conflicts surface as `bad_data`.
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
  #[error(transparent)]
  Parse(#[from] ParseError),
  #[error(transparent)]
  Conflict(#[from] IllegalMatcherError),
}

//
// MatcherEnforcer
//

/// Enforces a fixed set of label matchers (typically the caller's primary
/// matcher) on every selector of a query.
pub struct MatcherEnforcer {
  // Keyed by label name; deterministic iteration keeps the appended matcher
  // order stable.
  matchers: BTreeMap<String, LabelMatcher>,
  mode: ConflictMode,
}

impl MatcherEnforcer {
  pub fn new(mode: ConflictMode, matchers: impl IntoIterator<Item = LabelMatcher>) -> Self {
    Self {
      matchers: matchers
        .into_iter()
        .map(|m| (m.name().to_string(), m))
        .collect(),
      mode,
    }
  }

  /// Parse, enforce every selector, and return the canonical rewritten text.
  pub fn enforce_query(&self, query: &str) -> Result<String, RewriteError> {
    let mut expr = parser::parse(query)?;
    self.enforce_node(&mut expr)?;
    Ok(expr.to_string())
  }

  /// Recursively enforce the configured matchers on every selector of the
  /// expression.
  pub fn enforce_node(&self, expr: &mut Expr) -> Result<(), IllegalMatcherError> {
    match expr {
      Expr::NumberLiteral(_) | Expr::StringLiteral(_) => Ok(()),
      Expr::VectorSelector(vs) => {
        let targets = std::mem::take(&mut vs.matchers);
        vs.matchers = dedupe_matchers(self.enforce_matchers(targets)?);
        Ok(())
      },
      Expr::MatrixSelector(matrix) => {
        let targets = std::mem::take(&mut matrix.selector.matchers);
        matrix.selector.matchers = dedupe_matchers(self.enforce_matchers(targets)?);
        Ok(())
      },
      Expr::Call(call) => {
        for arg in &mut call.args {
          self.enforce_node(arg)?;
        }
        Ok(())
      },
      Expr::Binary(binary) => {
        self.enforce_node(&mut binary.lhs)?;
        self.enforce_node(&mut binary.rhs)
      },
      Expr::Unary(unary) => self.enforce_node(&mut unary.expr),
      Expr::Paren(paren) => self.enforce_node(&mut paren.expr),
      Expr::Aggregate(aggregate) => self.enforce_node(&mut aggregate.expr),
      Expr::Subquery(subquery) => self.enforce_node(&mut subquery.expr),
    }
  }

  /// Append the enforced matchers to a target list. A target naming an
  /// enforced label is kept when the enforced matcher accepts its value;
  /// otherwise the conflict mode decides between refusal and replacement.
  pub fn enforce_matchers(
    &self,
    targets: Vec<LabelMatcher>,
  ) -> Result<Vec<LabelMatcher>, IllegalMatcherError> {
    let mut pending = self.matchers.clone();
    let mut result = Vec::with_capacity(targets.len() + pending.len());
    for target in targets {
      if let Some(enforced) = self.matchers.get(target.name()) {
        if !enforced.matches(target.value()) {
          match self.mode {
            ConflictMode::Strict => return Err(IllegalMatcherError::new(enforced, &target)),
            ConflictMode::Lenient => continue,
          }
        }
        pending.remove(target.name());
      }
      result.push(target);
    }
    result.extend(pending.into_values());
    Ok(result)
  }
}

/// Selector list strategy: append the primary matcher to every `match[]`
/// value of a form, or set a single bracketed matcher when none is present.
pub fn inject_matcher(
  values: &mut Vec<(String, String)>,
  matcher: &LabelMatcher,
) -> Result<(), ParseError> {
  let mut found = false;
  for (key, value) in values.iter_mut() {
    if key != MATCHERS_PARAM {
      continue;
    }
    found = true;
    let mut matchers = parser::parse_metric_selector(value)?;
    matchers.push(matcher.clone());
    *value = matchers_to_string(&matchers);
  }
  if !found {
    values.push((
      MATCHERS_PARAM.to_string(),
      matchers_to_string(std::slice::from_ref(matcher)),
    ));
  }
  Ok(())
}
