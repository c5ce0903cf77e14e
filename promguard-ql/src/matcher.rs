// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./matcher_test.rs"]
mod matcher_test;

use regex::Regex;
use std::fmt;

/// Label that carries the metric name when a selector is expressed as a bare
/// matcher list.
pub const METRIC_NAME_LABEL: &str = "__name__";

pub const NONE_LABEL_NAME: &str = "__";
pub const NONE_LABEL_VALUE: &str = "none";

#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
  #[error("invalid regex {pattern:?} in label matcher: {source}")]
  InvalidRegex {
    pattern: String,
    source: regex::Error,
  },
}

//
// MatchOp
//

/// The four matcher operators of the upstream selector grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOp {
  Eq,
  Neq,
  Re,
  Nre,
}

impl MatchOp {
  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::Eq => "=",
      Self::Neq => "!=",
      Self::Re => "=~",
      Self::Nre => "!~",
    }
  }

  #[must_use]
  pub const fn is_regex(self) -> bool {
    matches!(self, Self::Re | Self::Nre)
  }
}

impl fmt::Display for MatchOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

//
// LabelMatcher
//

/// A single label predicate `name OP "value"`. Regex operators compile their
/// pattern at construction, anchored to the full string the way the upstream
/// does, so `matches()` never recompiles.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
  name: String,
  op: MatchOp,
  value: String,
  re: Option<Regex>,
}

impl LabelMatcher {
  pub fn new(
    op: MatchOp,
    name: impl Into<String>,
    value: impl Into<String>,
  ) -> Result<Self, MatcherError> {
    let name = name.into();
    let value = value.into();
    let re = if op.is_regex() {
      Some(
        Regex::new(&format!("^(?:{value})$")).map_err(|source| MatcherError::InvalidRegex {
          pattern: value.clone(),
          source,
        })?,
      )
    } else {
      None
    };
    Ok(Self {
      name,
      op,
      value,
      re,
    })
  }

  /// Infallible constructor for the equality case.
  #[must_use]
  pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      op: MatchOp::Eq,
      value: value.into(),
      re: None,
    }
  }

  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }

  #[must_use]
  pub const fn op(&self) -> MatchOp {
    self.op
  }

  #[must_use]
  pub fn value(&self) -> &str {
    &self.value
  }

  /// Whether this matcher accepts the given label value.
  #[must_use]
  pub fn matches(&self, value: &str) -> bool {
    match self.op {
      MatchOp::Eq => self.value == value,
      MatchOp::Neq => self.value != value,
      MatchOp::Re => self.re.as_ref().is_some_and(|re| re.is_match(value)),
      MatchOp::Nre => !self.re.as_ref().is_some_and(|re| re.is_match(value)),
    }
  }
}

// The compiled regex is derived state and does not participate in equality.
impl PartialEq for LabelMatcher {
  fn eq(&self, other: &Self) -> bool {
    self.name == other.name && self.op == other.op && self.value == other.value
  }
}

impl Eq for LabelMatcher {}

impl fmt::Display for LabelMatcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{}", self.name, self.op)?;
    write_quoted(f, &self.value)
  }
}

/// The canonical "matches nothing" matcher list. A conjunction found to be
/// unsatisfiable is replaced wholesale by this list so that the printed
/// selector stays valid in the upstream's grammar.
#[must_use]
pub fn none_matchers() -> Vec<LabelMatcher> {
  vec![LabelMatcher::equal(NONE_LABEL_NAME, NONE_LABEL_VALUE)]
}

/// Render a matcher list in its bracketed selector form, e.g.
/// `{app="web",env!="dev"}`.
#[must_use]
pub fn matchers_to_string(matchers: &[LabelMatcher]) -> String {
  let mut out = String::from("{");
  for (i, matcher) in matchers.iter().enumerate() {
    if i > 0 {
      out.push(',');
    }
    out.push_str(&matcher.to_string());
  }
  out.push('}');
  out
}

/// Double-quote a string value, escaping quotes, backslashes and control
/// characters.
pub(crate) fn write_quoted(f: &mut impl fmt::Write, s: &str) -> fmt::Result {
  f.write_char('"')?;
  for c in s.chars() {
    match c {
      '"' => f.write_str("\\\"")?,
      '\\' => f.write_str("\\\\")?,
      '\n' => f.write_str("\\n")?,
      '\r' => f.write_str("\\r")?,
      '\t' => f.write_str("\\t")?,
      '\x07' => f.write_str("\\a")?,
      '\x08' => f.write_str("\\b")?,
      '\x0b' => f.write_str("\\v")?,
      '\x0c' => f.write_str("\\f")?,
      c if (c as u32) < 0x20 || c == '\x7f' => write!(f, "\\x{:02x}", c as u32)?,
      c => f.write_char(c)?,
    }
  }
  f.write_char('"')
}
