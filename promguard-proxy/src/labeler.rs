// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./labeler_test.rs"]
mod labeler_test;

use crate::acl::Acl;
use crate::enforce::{ConflictMode, IllegalMatcherError, RewriteError};
use prometheus::{exponential_buckets, Histogram, HistogramOpts, Registry};
use promguard_ql::ast::{Expr, VectorSelector};
use promguard_ql::dedupe::dedupe_matchers;
use promguard_ql::parser;
use std::time::Instant;

//
// Stats
//

struct Stats {
  parse_duration: Histogram,
  label_duration: Histogram,
}

impl Stats {
  fn new(registry: &Registry) -> anyhow::Result<Self> {
    let parse_duration = Histogram::with_opts(
      HistogramOpts::new(
        "promguard_parser_duration_seconds",
        "Time taken to parse incoming queries.",
      )
      .buckets(exponential_buckets(0.001, 2.0, 11)?),
    )?;
    let label_duration = Histogram::with_opts(
      HistogramOpts::new(
        "promguard_labeler_duration_seconds",
        "Time taken to inject ACL labels and dedupe matchers.",
      )
      .buckets(exponential_buckets(0.001, 2.0, 11)?),
    )?;
    registry.register(Box::new(parse_duration.clone()))?;
    registry.register(Box::new(label_duration.clone()))?;
    Ok(Self {
      parse_duration,
      label_duration,
    })
  }
}

//
// Labeler
//

/// Walks a query AST and augments every selector with the matchers the ACL
/// yields for its metric name, deduplicating the result. Policy lives
/// entirely in the ACL; the walker never looks at metric names itself.
pub struct Labeler {
  stats: Stats,
}

impl Labeler {
  pub fn new(registry: &Registry) -> anyhow::Result<Self> {
    Ok(Self {
      stats: Stats::new(registry)?,
    })
  }

  /// Parse a query, inject the ACL matchers into every selector, and return
  /// the canonical rewritten text.
  pub fn rewrite_query(
    &self,
    query: &str,
    acl: &Acl,
    mode: ConflictMode,
  ) -> Result<String, RewriteError> {
    let start = Instant::now();
    let parsed = parser::parse(query);
    self.stats.parse_duration.observe(start.elapsed().as_secs_f64());
    let mut expr = parsed?;

    let start = Instant::now();
    let labeled = self.add_labels(&mut expr, acl, mode);
    self.stats.label_duration.observe(start.elapsed().as_secs_f64());
    labeled?;

    Ok(expr.to_string())
  }

  /// Recursive descent over the expression, mutating selector leaves in
  /// place. Children are visited left to right; aggregation parameters are
  /// not expressions the upstream selects series from and stay untouched.
  pub fn add_labels(
    &self,
    expr: &mut Expr,
    acl: &Acl,
    mode: ConflictMode,
  ) -> Result<(), IllegalMatcherError> {
    match expr {
      Expr::NumberLiteral(_) | Expr::StringLiteral(_) => Ok(()),
      Expr::VectorSelector(vs) => inject(vs, acl, mode),
      Expr::MatrixSelector(matrix) => inject(&mut matrix.selector, acl, mode),
      Expr::Call(call) => {
        for arg in &mut call.args {
          self.add_labels(arg, acl, mode)?;
        }
        Ok(())
      },
      Expr::Binary(binary) => {
        self.add_labels(&mut binary.lhs, acl, mode)?;
        self.add_labels(&mut binary.rhs, acl, mode)
      },
      Expr::Unary(unary) => self.add_labels(&mut unary.expr, acl, mode),
      Expr::Paren(paren) => self.add_labels(&mut paren.expr, acl, mode),
      Expr::Aggregate(aggregate) => self.add_labels(&mut aggregate.expr, acl, mode),
      Expr::Subquery(subquery) => self.add_labels(&mut subquery.expr, acl, mode),
    }
  }
}

fn inject(
  vs: &mut VectorSelector,
  acl: &Acl,
  mode: ConflictMode,
) -> Result<(), IllegalMatcherError> {
  let acl_matchers = acl.matchers_for(vs.name.as_deref().unwrap_or(""));
  let mut merged = std::mem::take(&mut vs.matchers);

  // A caller matcher naming an ACL-enforced label with a value the ACL
  // matcher rejects either refuses the request or is silently replaced by
  // the ACL matcher appended below.
  for acl_matcher in &acl_matchers {
    match mode {
      ConflictMode::Strict => {
        for existing in &merged {
          if existing.name() == acl_matcher.name() && !acl_matcher.matches(existing.value()) {
            return Err(IllegalMatcherError::new(acl_matcher, existing));
          }
        }
      },
      ConflictMode::Lenient => {
        merged.retain(|existing| {
          existing.name() != acl_matcher.name() || acl_matcher.matches(existing.value())
        });
      },
    }
  }

  merged.extend(acl_matchers);
  vs.matchers = dedupe_matchers(merged);
  Ok(())
}
