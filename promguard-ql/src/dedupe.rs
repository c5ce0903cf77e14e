// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./dedupe_test.rs"]
mod dedupe_test;

use crate::matcher::{none_matchers, LabelMatcher, MatchOp};

//
// MatcherDeduper
//

/// The input conjunction partitioned by operator. Each phase inspects one
/// bucket against the pinned `=` values and its own tail.
#[derive(Default)]
struct MatcherDeduper {
  eq: Vec<LabelMatcher>,
  neq: Vec<LabelMatcher>,
  re: Vec<LabelMatcher>,
  nre: Vec<LabelMatcher>,
}

/// Simplify a matcher conjunction: drop matchers implied by an equality on
/// the same label, collapse duplicates, and collapse the whole list to the
/// "matches nothing" sentinel when two matchers contradict each other.
///
/// The result keeps bucket order `!=`, `=`, `!~`, `=~` with stable order
/// inside each bucket; the printer's name sort produces the canonical form.
#[must_use]
pub fn dedupe_matchers(matchers: Vec<LabelMatcher>) -> Vec<LabelMatcher> {
  let mut deduper = MatcherDeduper::default();
  for matcher in matchers {
    match matcher.op() {
      MatchOp::Eq => deduper.eq.push(matcher),
      MatchOp::Neq => deduper.neq.push(matcher),
      MatchOp::Re => deduper.re.push(matcher),
      MatchOp::Nre => deduper.nre.push(matcher),
    }
  }

  let phases = [
    MatcherDeduper::dedupe_neq,
    MatcherDeduper::dedupe_eq,
    MatcherDeduper::dedupe_nre,
    MatcherDeduper::dedupe_re,
  ];
  let mut all = Vec::new();
  for phase in phases {
    match phase(&deduper) {
      Some(kept) => all.extend(kept),
      None => return none_matchers(),
    }
  }
  all
}

impl MatcherDeduper {
  /// A `name != v` matcher is implied by any `name = v'` with `v' != v`;
  /// duplicates collapse.
  fn dedupe_neq(&self) -> Option<Vec<LabelMatcher>> {
    let mut deduped = Vec::new();
    'outer: for (i, not_matcher) in self.neq.iter().enumerate() {
      for matcher in &self.eq {
        if not_matcher.name() == matcher.name() && not_matcher.value() != matcher.value() {
          continue 'outer;
        }
      }
      for other in &self.neq[i + 1 ..] {
        if not_matcher.name() == other.name() && not_matcher.value() == other.value() {
          continue 'outer;
        }
      }
      deduped.push(not_matcher.clone());
    }
    Some(deduped)
  }

  /// Two equalities on the same label with different values cannot both
  /// hold; duplicates collapse.
  fn dedupe_eq(&self) -> Option<Vec<LabelMatcher>> {
    let mut deduped = Vec::new();
    'outer: for (i, matcher) in self.eq.iter().enumerate() {
      for other in &self.eq[i + 1 ..] {
        if matcher.name() == other.name() {
          if matcher.value() == other.value() {
            continue 'outer;
          }
          return None;
        }
      }
      deduped.push(matcher.clone());
    }
    Some(deduped)
  }

  /// A `name !~ r` matcher against a pinned `name = v`: if `r` matches `v`
  /// the conjunction is unsatisfiable, otherwise the negative regex is
  /// already implied and dropped. Duplicates collapse.
  fn dedupe_nre(&self) -> Option<Vec<LabelMatcher>> {
    let mut deduped = Vec::new();
    'outer: for (i, nre_matcher) in self.nre.iter().enumerate() {
      for matcher in &self.eq {
        if nre_matcher.name() == matcher.name() {
          if nre_matcher.matches(matcher.value()) {
            continue 'outer;
          }
          return None;
        }
      }
      for other in &self.nre[i + 1 ..] {
        if nre_matcher.name() == other.name() && nre_matcher.value() == other.value() {
          continue 'outer;
        }
      }
      deduped.push(nre_matcher.clone());
    }
    Some(deduped)
  }

  /// A `name =~ r` matcher against a pinned `name = v`: if `r` matches `v`
  /// the regex is implied and dropped, otherwise the conjunction is
  /// unsatisfiable. Duplicates collapse.
  fn dedupe_re(&self) -> Option<Vec<LabelMatcher>> {
    let mut deduped = Vec::new();
    'outer: for (i, re_matcher) in self.re.iter().enumerate() {
      for matcher in &self.eq {
        if re_matcher.name() == matcher.name() {
          if re_matcher.matches(matcher.value()) {
            continue 'outer;
          }
          return None;
        }
      }
      for other in &self.re[i + 1 ..] {
        if re_matcher.name() == other.name() && re_matcher.value() == other.value() {
          continue 'outer;
        }
      }
      deduped.push(re_matcher.clone());
    }
    Some(deduped)
  }
}
