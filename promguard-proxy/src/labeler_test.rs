// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;
use prometheus::Registry;

fn labeler() -> Labeler {
  Labeler::new(&Registry::new()).unwrap()
}

/// Every metric name maps to `app="awesome"`.
fn awesome_acl() -> Acl {
  let mut acl = Acl::default();
  acl.insert_rule("*", Some(r#"app="awesome""#)).unwrap();
  acl
}

/// Every metric name maps to an empty matcher list, so only deduplication of
/// the caller's own matchers is observable.
fn empty_acl() -> Acl {
  let mut acl = Acl::default();
  acl.insert_rule("*", Some("")).unwrap();
  acl
}

fn rewrite(labeler: &Labeler, acl: &Acl, query: &str) -> String {
  labeler
    .rewrite_query(query, acl, ConflictMode::Lenient)
    .unwrap()
}

#[test]
fn literals_stay_untouched() {
  let labeler = labeler();
  let acl = awesome_acl();
  let cases = &[
    ("1", "1"),
    ("+Inf", "+Inf"),
    ("-Inf", "-Inf"),
    ("123.4567", "123.4567"),
    ("5e3", "5000"),
    ("1 + 1", "1 + 1"),
    ("1 == bool 1", "1 == bool 1"),
    ("1 and 1", "1 and 1"),
  ];
  for (input, expected) in cases {
    assert_eq!(rewrite(&labeler, &acl, input), *expected, "input: {input}");
  }
}

#[test]
fn selectors_get_acl_matchers() {
  let labeler = labeler();
  let acl = awesome_acl();
  let cases = &[
    ("foo", r#"foo{app="awesome"}"#),
    ("-some_metric", r#"-some_metric{app="awesome"}"#),
    ("+some_metric", r#"+some_metric{app="awesome"}"#),
    ("foo offset 5m", r#"foo{app="awesome"} offset 5m"#),
    (r#"foo:bar{a="bc"}"#, r#"foo:bar{a="bc",app="awesome"}"#),
    (
      r#"foo{a="b", foo!="bar", test=~"test", bar!~"baz"}"#,
      r#"foo{a="b",app="awesome",bar!~"baz",foo!="bar",test=~"test"}"#,
    ),
    ("test[5s]", r#"test{app="awesome"}[5s]"#),
    ("test[5h] OFFSET 5m", r#"test{app="awesome"}[5h] offset 5m"#),
    (
      r#"test{a="b"}[5y] OFFSET 3d"#,
      r#"test{a="b",app="awesome"}[5y] offset 3d"#,
    ),
    ("-test[5m]", r#"-test{app="awesome"}[5m]"#),
  ];
  for (input, expected) in cases {
    assert_eq!(rewrite(&labeler, &acl, input), *expected, "input: {input}");
  }
}

#[test]
fn binary_expressions_label_both_sides() {
  let labeler = labeler();
  let acl = awesome_acl();
  let cases = &[
    ("foo * bar", r#"foo{app="awesome"} * bar{app="awesome"}"#),
    ("foo == 1", r#"foo{app="awesome"} == 1"#),
    ("2.5 / bar", r#"2.5 / bar{app="awesome"}"#),
    (
      "foo and bar",
      r#"foo{app="awesome"} and bar{app="awesome"}"#,
    ),
    (
      "foo + bar or bla and blub",
      r#"foo{app="awesome"} + bar{app="awesome"} or bla{app="awesome"} and blub{app="awesome"}"#,
    ),
    (
      "bar + on(foo) bla / on(baz, buz) group_right(test) blub",
      r#"bar{app="awesome"} + on(foo) bla{app="awesome"} / on(baz, buz) group_right(test) blub{app="awesome"}"#,
    ),
    (
      "foo * on(test,blub) group_left bar",
      r#"foo{app="awesome"} * on(test, blub) group_left() bar{app="awesome"}"#,
    ),
    (
      "foo and ignoring() bar",
      r#"foo{app="awesome"} and bar{app="awesome"}"#,
    ),
    ("1 and foo", r#"1 and foo{app="awesome"}"#),
  ];
  for (input, expected) in cases {
    assert_eq!(rewrite(&labeler, &acl, input), *expected, "input: {input}");
  }
}

#[test]
fn aggregations_label_the_body_not_the_param() {
  let labeler = labeler();
  let acl = awesome_acl();
  let cases = &[
    (
      "sum by (foo)(some_metric)",
      r#"sum by(foo) (some_metric{app="awesome"})"#,
    ),
    (
      "sum (some_metric) without (foo)",
      r#"sum without(foo) (some_metric{app="awesome"})"#,
    ),
    ("stddev(some_metric)", r#"stddev(some_metric{app="awesome"})"#),
    ("sum by ()(some_metric)", r#"sum(some_metric{app="awesome"})"#),
    ("topk(5, some_metric)", r#"topk(5, some_metric{app="awesome"})"#),
    (
      r#"count_values("value", some_metric)"#,
      r#"count_values("value", some_metric{app="awesome"})"#,
    ),
    (
      "topk(some_metric, other_metric)",
      r#"topk(some_metric, other_metric{app="awesome"})"#,
    ),
    (
      "count_values(5, other_metric)",
      r#"count_values(5, other_metric{app="awesome"})"#,
    ),
  ];
  for (input, expected) in cases {
    assert_eq!(rewrite(&labeler, &acl, input), *expected, "input: {input}");
  }
}

#[test]
fn calls_label_every_argument() {
  let labeler = labeler();
  let acl = awesome_acl();
  let cases = &[
    ("time()", "time()"),
    (
      r#"floor(some_metric{foo!="bar"})"#,
      r#"floor(some_metric{app="awesome",foo!="bar"})"#,
    ),
    (
      "rate(some_metric[5m])",
      r#"rate(some_metric{app="awesome"}[5m])"#,
    ),
    (
      "floor(some_metric, other_metric)",
      r#"floor(some_metric{app="awesome"}, other_metric{app="awesome"})"#,
    ),
    ("floor(1)", "floor(1)"),
  ];
  for (input, expected) in cases {
    assert_eq!(rewrite(&labeler, &acl, input), *expected, "input: {input}");
  }
}

#[test]
fn subqueries_label_the_inner_selectors() {
  let labeler = labeler();
  let acl = awesome_acl();
  let cases = &[
    (
      r#"foo{bar="baz"}[10m:6s]"#,
      r#"foo{app="awesome",bar="baz"}[10m:6s]"#,
    ),
    ("foo[10m:]", r#"foo{app="awesome"}[10m:]"#),
    (
      r#"min_over_time(rate(foo{bar="baz"}[2s])[5m:5s])"#,
      r#"min_over_time(rate(foo{app="awesome",bar="baz"}[2s])[5m:5s])"#,
    ),
    (
      r#"min_over_time(rate(foo{bar="baz"}[2s])[5m:])[4m:3s]"#,
      r#"min_over_time(rate(foo{app="awesome",bar="baz"}[2s])[5m:])[4m:3s]"#,
    ),
    (
      "some_metric OFFSET 1m [10m:5s]",
      r#"some_metric{app="awesome"} offset 1m[10m:5s]"#,
    ),
    (
      r#"(foo + bar{nm="val"})[5m:]"#,
      r#"(foo{app="awesome"} + bar{app="awesome",nm="val"})[5m:]"#,
    ),
  ];
  for (input, expected) in cases {
    assert_eq!(rewrite(&labeler, &acl, input), *expected, "input: {input}");
  }
}

#[test]
fn conflicting_caller_matchers_collapse_to_none() {
  let labeler = labeler();
  let acl = empty_acl();
  let cases = &[
    (
      r#"up{name="hello",name="hello2"}"#,
      r#"up{__="none"}"#,
    ),
    (
      r#"up{name!~"hel.*",name="hello"}"#,
      r#"up{__="none"}"#,
    ),
    (
      r#"up{name="hello",name=~"hel.*"}"#,
      r#"up{name="hello"}"#,
    ),
    (
      r#"up{name!="hello",name!="hello"}"#,
      r#"up{name!="hello"}"#,
    ),
    (
      r#"up{name!="hello",name="hello2"}"#,
      r#"up{name="hello2"}"#,
    ),
    (
      r#"up{name!~"hel.*",name="foo"}"#,
      r#"up{name="foo"}"#,
    ),
    (
      r#"up{name="hello",name=~"xhel.*"}"#,
      r#"up{__="none"}"#,
    ),
    (
      r#"up{name="hello",nami=~"hel.*"}"#,
      r#"up{name="hello",nami=~"hel.*"}"#,
    ),
  ];
  for (input, expected) in cases {
    assert_eq!(rewrite(&labeler, &acl, input), *expected, "input: {input}");
  }
}

#[test]
fn denied_metrics_get_the_none_matcher() {
  let labeler = labeler();
  // No rules at all: every metric resolves to DENY.
  let acl = Acl::default();
  assert_eq!(rewrite(&labeler, &acl, "foo"), r#"foo{__="none"}"#);
  assert_eq!(
    rewrite(&labeler, &acl, r#"foo{bar="baz"}"#),
    r#"foo{__="none",bar="baz"}"#
  );
}

#[test]
fn injection_is_idempotent() {
  let labeler = labeler();
  for acl in [awesome_acl(), empty_acl(), Acl::default()] {
    for query in [
      "foo",
      "foo * bar",
      "rate(some_metric[5m])",
      "sum by (foo)(some_metric)",
      r#"foo{bar="baz"}[10m:6s]"#,
    ] {
      let once = rewrite(&labeler, &acl, query);
      let twice = rewrite(&labeler, &acl, &once);
      assert_eq!(twice, once, "query: {query}");
    }
  }
}

#[test]
fn lenient_mode_replaces_a_conflicting_caller_matcher() {
  let labeler = labeler();
  let acl = awesome_acl();
  assert_eq!(
    rewrite(&labeler, &acl, r#"up{app="other"}"#),
    r#"up{app="awesome"}"#
  );
  // Unrelated caller matchers survive the replacement.
  assert_eq!(
    rewrite(&labeler, &acl, r#"up{app="other",job="api"}"#),
    r#"up{app="awesome",job="api"}"#
  );
}

#[test]
fn strict_mode_rejects_conflicting_caller_matchers() {
  let labeler = labeler();
  let acl = awesome_acl();
  let result = labeler.rewrite_query(r#"up{app="other"}"#, &acl, ConflictMode::Strict);
  assert!(matches!(result, Err(RewriteError::Conflict(_))));

  // A caller matcher the ACL matcher accepts passes through.
  assert_eq!(
    labeler
      .rewrite_query(r#"up{app="awesome"}"#, &acl, ConflictMode::Strict)
      .unwrap(),
    r#"up{app="awesome"}"#
  );
}

#[test]
fn parse_failures_surface_as_parse_errors() {
  let labeler = labeler();
  let acl = awesome_acl();
  let result = labeler.rewrite_query("foo{", &acl, ConflictMode::Lenient);
  assert!(matches!(result, Err(RewriteError::Parse(_))));
}

#[test]
fn per_metric_rules_win_over_the_wildcard() {
  let labeler = labeler();
  let mut acl = Acl::default();
  acl
    .insert_rule("http_requests_total", Some(r#"job="api""#))
    .unwrap();
  acl.insert_rule("*", Some(r#"app="awesome""#)).unwrap();

  assert_eq!(
    rewrite(&labeler, &acl, "http_requests_total + foo"),
    r#"http_requests_total{job="api"} + foo{app="awesome"}"#
  );
}
