// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./printer_test.rs"]
mod printer_test;

use crate::ast::{
  AggregateExpr,
  BinaryExpr,
  Call,
  Expr,
  Grouping,
  MatrixSelector,
  NumberLiteral,
  ParenExpr,
  StringLiteral,
  SubqueryExpr,
  UnaryExpr,
  UnaryOp,
  VectorSelector,
};
use crate::matcher::{write_quoted, LabelMatcher};
use std::fmt;
use std::time::Duration;

// Serialization of the AST back to query text. The emitted form is canonical:
// matchers inside a selector come out sorted by label name (stable, so the
// deduplicator's bucket order breaks ties), durations use the largest unit
// that divides evenly, numbers use their shortest round-trip form.

impl fmt::Display for Expr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::NumberLiteral(e) => e.fmt(f),
      Self::StringLiteral(e) => e.fmt(f),
      Self::VectorSelector(e) => e.fmt(f),
      Self::MatrixSelector(e) => e.fmt(f),
      Self::Call(e) => e.fmt(f),
      Self::Binary(e) => e.fmt(f),
      Self::Unary(e) => e.fmt(f),
      Self::Paren(e) => e.fmt(f),
      Self::Aggregate(e) => e.fmt(f),
      Self::Subquery(e) => e.fmt(f),
    }
  }
}

impl fmt::Display for NumberLiteral {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.value.is_nan() {
      f.write_str("NaN")
    } else if self.value.is_infinite() {
      f.write_str(if self.value > 0.0 { "+Inf" } else { "-Inf" })
    } else {
      write!(f, "{}", self.value)
    }
  }
}

impl fmt::Display for StringLiteral {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write_quoted(f, &self.value)
  }
}

impl fmt::Display for VectorSelector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if let Some(name) = &self.name {
      f.write_str(name)?;
    }
    if !self.matchers.is_empty() {
      let mut sorted: Vec<&LabelMatcher> = self.matchers.iter().collect();
      sorted.sort_by(|a, b| a.name().cmp(b.name()));
      f.write_str("{")?;
      for (i, matcher) in sorted.iter().enumerate() {
        if i > 0 {
          f.write_str(",")?;
        }
        write!(f, "{matcher}")?;
      }
      f.write_str("}")?;
    }
    if let Some(offset) = self.offset {
      write!(f, " offset {}", fmt_duration(offset))?;
    }
    Ok(())
  }
}

impl fmt::Display for MatrixSelector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}[{}]", self.selector, fmt_duration(self.range))?;
    if let Some(offset) = self.offset {
      write!(f, " offset {}", fmt_duration(offset))?;
    }
    Ok(())
  }
}

impl fmt::Display for SubqueryExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}[{}:", self.expr, fmt_duration(self.range))?;
    if let Some(step) = self.step {
      f.write_str(&fmt_duration(step))?;
    }
    f.write_str("]")?;
    if let Some(offset) = self.offset {
      write!(f, " offset {}", fmt_duration(offset))?;
    }
    Ok(())
  }
}

impl fmt::Display for Call {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}(", self.name)?;
    for (i, arg) in self.args.iter().enumerate() {
      if i > 0 {
        f.write_str(", ")?;
      }
      write!(f, "{arg}")?;
    }
    f.write_str(")")
  }
}

impl fmt::Display for BinaryExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.lhs, self.op.as_str())?;
    if self.return_bool {
      f.write_str(" bool")?;
    }
    if let Some(matching) = &self.matching {
      if matching.on {
        write!(f, " on({})", matching.labels.join(", "))?;
      } else if !matching.labels.is_empty() || matching.grouping.is_some() {
        write!(f, " ignoring({})", matching.labels.join(", "))?;
      }
      match &matching.grouping {
        Some(Grouping::Left(include)) => write!(f, " group_left({})", include.join(", "))?,
        Some(Grouping::Right(include)) => write!(f, " group_right({})", include.join(", "))?,
        None => {},
      }
    }
    write!(f, " {}", self.rhs)
  }
}

impl fmt::Display for UnaryExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let sign = match self.op {
      UnaryOp::Pos => "+",
      UnaryOp::Neg => "-",
    };
    write!(f, "{}{}", sign, self.expr)
  }
}

impl fmt::Display for ParenExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({})", self.expr)
  }
}

impl fmt::Display for AggregateExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.op.as_str())?;
    let mut clause = false;
    if self.without {
      write!(f, " without({})", self.grouping.join(", "))?;
      clause = true;
    } else if !self.grouping.is_empty() {
      write!(f, " by({})", self.grouping.join(", "))?;
      clause = true;
    }
    f.write_str(if clause { " (" } else { "(" })?;
    if let Some(param) = &self.param {
      write!(f, "{param}, ")?;
    }
    write!(f, "{})", self.expr)
  }
}

/// Render a duration using the largest time unit that divides it evenly.
pub(crate) fn fmt_duration(d: Duration) -> String {
  let ms = d.as_millis();
  if ms == 0 {
    return "0s".to_string();
  }
  if ms % 1000 != 0 {
    return format!("{ms}ms");
  }
  let secs = ms / 1000;
  const UNITS: &[(u128, &str)] = &[
    (31_536_000, "y"),
    (604_800, "w"),
    (86_400, "d"),
    (3_600, "h"),
    (60, "m"),
  ];
  for (factor, unit) in UNITS {
    if secs % factor == 0 {
      return format!("{}{}", secs / factor, unit);
    }
  }
  format!("{secs}s")
}
