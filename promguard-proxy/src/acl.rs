// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./acl_test.rs"]
mod acl_test;

use anyhow::{bail, Context};
use log::warn;
use promguard_ql::matcher::{none_matchers, LabelMatcher};
use promguard_ql::parser::parse_matchers;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// Metric patterns with this prefix are regex rules; the remainder is the
/// pattern.
const REGEX_RULE_PREFIX: &str = "re!";

//
// Acl
//

#[derive(Debug)]
struct RegexRule {
  regex: Regex,
  matchers: Vec<LabelMatcher>,
}

/// The matchers a caller is allowed to use, keyed by metric name. Lookup
/// order: exact name, regex rules in configuration order (first match wins),
/// the `*` wildcard, and finally DENY via the "matches nothing" sentinel.
#[derive(Debug, Default)]
pub struct Acl {
  named: HashMap<String, Vec<LabelMatcher>>,
  regex: Vec<RegexRule>,
}

impl Acl {
  /// Add one `metric-pattern -> matcher-string` rule. `None` denies the
  /// metric outright, an empty string allows it unconstrained.
  pub fn insert_rule(&mut self, pattern: &str, matcher_source: Option<&str>) -> anyhow::Result<()> {
    let matchers = match matcher_source {
      None => none_matchers(),
      Some("") => Vec::new(),
      Some(source) => parse_matchers(source)
        .with_context(|| format!("invalid matcher list {source:?} for pattern {pattern:?}"))?,
    };
    if let Some(expr) = pattern.strip_prefix(REGEX_RULE_PREFIX) {
      if !expr.starts_with('^') {
        warn!("regex ACL rule {expr:?} is unanchored, consider matching from '^'");
      }
      let regex = Regex::new(expr)
        .with_context(|| format!("invalid regex in ACL pattern {pattern:?}"))?;
      self.regex.push(RegexRule {
        regex,
        matchers: matchers.clone(),
      });
    }
    self.named.insert(pattern.to_string(), matchers);
    Ok(())
  }

  /// The matchers to inject for a metric.
  #[must_use]
  pub fn matchers_for(&self, metric_name: &str) -> Vec<LabelMatcher> {
    if let Some(matchers) = self.named.get(metric_name) {
      return matchers.clone();
    }
    for rule in &self.regex {
      if rule.regex.is_match(metric_name) {
        return rule.matchers.clone();
      }
    }
    if let Some(matchers) = self.named.get("*") {
      return matchers.clone();
    }
    none_matchers()
  }
}

//
// AclMap
//

/// Role name to ACL, loaded from the YAML ACL source.
#[derive(Debug, Default, Clone)]
pub struct AclMap {
  acls: HashMap<String, Arc<Acl>>,
}

impl AclMap {
  pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
    let source = std::fs::read_to_string(path)
      .with_context(|| format!("unable to read ACL file {path}"))?;
    Self::from_yaml(&source).with_context(|| format!("unable to load ACL file {path}"))
  }

  /// The source format is a mapping `role -> { metric-pattern ->
  /// matcher-string | null | "" }`. Rule order within a role is preserved so
  /// that regex rules match in configuration order.
  pub fn from_yaml(source: &str) -> anyhow::Result<Self> {
    let roles: HashMap<String, serde_yaml::Mapping> =
      serde_yaml::from_str(source).context("ACL source is not a role mapping")?;
    let mut acls = HashMap::new();
    for (role, rules) in roles {
      let mut acl = Acl::default();
      for (pattern, matcher_source) in &rules {
        let pattern = pattern
          .as_str()
          .with_context(|| format!("non-string metric pattern in role {role:?}"))?;
        let matcher_source = match matcher_source {
          serde_yaml::Value::Null => None,
          serde_yaml::Value::String(s) => Some(s.as_str()),
          other => bail!("invalid matcher value {other:?} for pattern {pattern:?} in role {role:?}"),
        };
        acl
          .insert_rule(pattern, matcher_source)
          .with_context(|| format!("invalid rule in role {role:?}"))?;
      }
      acls.insert(role, Arc::new(acl));
    }
    Ok(Self { acls })
  }

  #[must_use]
  pub fn acl(&self, role: &str) -> Option<Arc<Acl>> {
    self.acls.get(role).cloned()
  }

  /// The ACL for the first role that has one configured; callers without any
  /// configured role get the deny ACL.
  #[must_use]
  pub fn acl_for_roles(&self, roles: &[String]) -> Arc<Acl> {
    for role in roles {
      if let Some(acl) = self.acl(role) {
        return acl;
      }
    }
    Self::deny_acl()
  }

  /// An empty ACL denies every metric.
  #[must_use]
  pub fn deny_acl() -> Arc<Acl> {
    Arc::new(Acl::default())
  }
}
