// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::matcher::matchers_to_string;
use pretty_assertions::assert_eq;

fn roundtrip(input: &str) -> String {
  parse(input).unwrap().to_string()
}

#[test]
fn literals() {
  let cases = &[
    ("1", "1"),
    ("+Inf", "+Inf"),
    ("-Inf", "-Inf"),
    (".5", "0.5"),
    ("5.", "5"),
    ("123.4567", "123.4567"),
    ("5e-3", "0.005"),
    ("5e3", "5000"),
    ("0xc", "12"),
    ("0755", "493"),
    ("+5.5e-3", "0.0055"),
    ("-0755", "-493"),
    ("NaN", "NaN"),
  ];
  for (input, expected) in cases {
    assert_eq!(roundtrip(input), *expected, "input: {input}");
  }
}

#[test]
fn binary_expressions() {
  let cases = &[
    ("1 + 1", "1 + 1"),
    ("1 - 1", "1 - 1"),
    ("1 * 1", "1 * 1"),
    ("1 % 1", "1 % 1"),
    ("1 / 1", "1 / 1"),
    ("1 == bool 1", "1 == bool 1"),
    ("1 != bool 1", "1 != bool 1"),
    ("1 > bool 1", "1 > bool 1"),
    ("1 >= bool 1", "1 >= bool 1"),
    ("1 < bool 1", "1 < bool 1"),
    ("1 <= bool 1", "1 <= bool 1"),
    ("+1 + -2 * 1", "1 + -2 * 1"),
    ("1 + 2/(3*1)", "1 + 2 / (3 * 1)"),
    ("1 < bool 2 - 1 * 2", "1 < bool 2 - 1 * 2"),
    ("foo * bar", "foo * bar"),
    ("foo == 1", "foo == 1"),
    ("foo == bool 1", "foo == bool 1"),
    ("2.5 / bar", "2.5 / bar"),
    ("foo and bar", "foo and bar"),
    ("foo or bar", "foo or bar"),
    ("foo unless bar", "foo unless bar"),
    (
      "foo + bar or bla and blub",
      "foo + bar or bla and blub",
    ),
    (
      "foo and bar unless baz or qux",
      "foo and bar unless baz or qux",
    ),
    (
      "bar + on(foo) bla / on(baz, buz) group_right(test) blub",
      "bar + on(foo) bla / on(baz, buz) group_right(test) blub",
    ),
    ("foo * on(test,blub) bar", "foo * on(test, blub) bar"),
    (
      "foo * on(test,blub) group_left bar",
      "foo * on(test, blub) group_left() bar",
    ),
    ("foo and on(test,blub) bar", "foo and on(test, blub) bar"),
    ("foo and on() bar", "foo and on() bar"),
    (
      "foo and ignoring(test,blub) bar",
      "foo and ignoring(test, blub) bar",
    ),
    ("foo and ignoring() bar", "foo and bar"),
    ("foo unless on(bar) baz", "foo unless on(bar) baz"),
    (
      "foo / on(test,blub) group_left(bar) bar",
      "foo / on(test, blub) group_left(bar) bar",
    ),
    (
      "foo / ignoring(test,blub) group_left(blub) bar",
      "foo / ignoring(test, blub) group_left(blub) bar",
    ),
    (
      "foo - on(test,blub) group_right(bar,foo) bar",
      "foo - on(test, blub) group_right(bar, foo) bar",
    ),
  ];
  for (input, expected) in cases {
    assert_eq!(roundtrip(input), *expected, "input: {input}");
  }
}

#[test]
fn selectors() {
  let cases = &[
    ("foo", "foo"),
    ("foo offset 5m", "foo offset 5m"),
    (r#"foo:bar{a="bc"}"#, r#"foo:bar{a="bc"}"#),
    (r#"foo{NaN='bc'}"#, r#"foo{NaN="bc"}"#),
    // Matchers come out sorted by label name.
    (
      r#"foo{a="b", foo!="bar", test=~"test", bar!~"baz"}"#,
      r#"foo{a="b",bar!~"baz",foo!="bar",test=~"test"}"#,
    ),
    ("test[5s]", "test[5s]"),
    ("test[5m]", "test[5m]"),
    ("test[5h] OFFSET 5m", "test[5h] offset 5m"),
    ("test[5d] OFFSET 10s", "test[5d] offset 10s"),
    ("test[5w] offset 2w", "test[5w] offset 2w"),
    (r#"test{a="b"}[5y] OFFSET 3d"#, r#"test{a="b"}[5y] offset 3d"#),
    (r#"{a="b"}"#, r#"{a="b"}"#),
    (r#"{__name__=~"job:.*"}"#, r#"{__name__=~"job:.*"}"#),
  ];
  for (input, expected) in cases {
    assert_eq!(roundtrip(input), *expected, "input: {input}");
  }
}

#[test]
fn subqueries() {
  let cases = &[
    (r#"foo{bar="baz"}[10m:6s]"#, r#"foo{bar="baz"}[10m:6s]"#),
    ("foo[10m:]", "foo[10m:]"),
    (
      r#"min_over_time(rate(foo{bar="baz"}[2s])[5m:5s])"#,
      r#"min_over_time(rate(foo{bar="baz"}[2s])[5m:5s])"#,
    ),
    (
      r#"min_over_time(rate(foo{bar="baz"}[2s])[5m:])[4m:3s]"#,
      r#"min_over_time(rate(foo{bar="baz"}[2s])[5m:])[4m:3s]"#,
    ),
    (
      "sum without(and, by, avg, count, alert, annotations)(some_metric) [30m:10s]",
      "sum without(and, by, avg, count, alert, annotations) (some_metric)[30m:10s]",
    ),
    ("some_metric OFFSET 1m [10m:5s]", "some_metric offset 1m[10m:5s]"),
    (
      r#"(foo + bar{nm="val"})[5m:]"#,
      r#"(foo + bar{nm="val"})[5m:]"#,
    ),
    (
      r#"(foo + bar{nm="val"})[5m:] offset 10m"#,
      r#"(foo + bar{nm="val"})[5m:] offset 10m"#,
    ),
  ];
  for (input, expected) in cases {
    assert_eq!(roundtrip(input), *expected, "input: {input}");
  }
}

#[test]
fn aggregations() {
  let cases = &[
    ("sum by (foo)(some_metric)", "sum by(foo) (some_metric)"),
    ("avg by (foo)(some_metric)", "avg by(foo) (some_metric)"),
    ("max by (foo)(some_metric)", "max by(foo) (some_metric)"),
    (
      "sum without (foo) (some_metric)",
      "sum without(foo) (some_metric)",
    ),
    (
      "sum (some_metric) without (foo)",
      "sum without(foo) (some_metric)",
    ),
    ("stddev(some_metric)", "stddev(some_metric)"),
    ("stdvar by (foo)(some_metric)", "stdvar by(foo) (some_metric)"),
    ("sum by ()(some_metric)", "sum(some_metric)"),
    ("topk(5, some_metric)", "topk(5, some_metric)"),
    (
      r#"count_values("value", some_metric)"#,
      r#"count_values("value", some_metric)"#,
    ),
    (
      "sum without(and, by, avg, count, alert, annotations)(some_metric)",
      "sum without(and, by, avg, count, alert, annotations) (some_metric)",
    ),
    ("MAX(some_metric)", "max(some_metric)"),
  ];
  for (input, expected) in cases {
    assert_eq!(roundtrip(input), *expected, "input: {input}");
  }
}

#[test]
fn calls() {
  let cases = &[
    ("time()", "time()"),
    (
      r#"floor(some_metric{foo!="bar"})"#,
      r#"floor(some_metric{foo!="bar"})"#,
    ),
    ("rate(some_metric[5m])", "rate(some_metric[5m])"),
    ("round(some_metric)", "round(some_metric)"),
    ("round(some_metric, 5)", "round(some_metric, 5)"),
    ("-some_metric", "-some_metric"),
    ("+some_metric", "+some_metric"),
    ("-test[5m]", "-test[5m]"),
  ];
  for (input, expected) in cases {
    assert_eq!(roundtrip(input), *expected, "input: {input}");
  }
}

#[test]
fn strings() {
  let cases = &[
    (
      r#""double-quoted string \" with escaped quote""#,
      r#""double-quoted string \" with escaped quote""#,
    ),
    (
      r#"'single-quoted string \' with escaped quote'"#,
      r#""single-quoted string ' with escaped quote""#,
    ),
    ("`backtick-quoted string`", r#""backtick-quoted string""#),
    (r#""tab\tand\nnewline""#, r#""tab\tand\nnewline""#),
  ];
  for (input, expected) in cases {
    assert_eq!(roundtrip(input), *expected, "input: {input}");
  }
}

#[test]
fn invalid_input() {
  let cases = &[
    "",
    "# just a comment\n\n",
    "1+",
    ".",
    "2.5.",
    "100..4",
    "0deadbeef",
    "1 /",
    "*1",
    "(1))",
    "((1)",
    "(",
    "1 !~ 1",
    "1 =~ 1",
    "-=",
    "++-++-+-+-<",
    "e-+=/(0)",
    "1 offset 1d",
    "a - on(b) ignoring(c) d",
    "foo + bool bar",
    "foo + bool 10",
    "foo and bool 10",
    "`\\``",
    r#""\"#,
    r#""\c""#,
    r#""\x.""#,
    "{",
    "}",
    "some{",
    "some}",
    r#"some_metric{a=b}"#,
    r#"some_metric{a:b="b"}"#,
    r#"foo{a*"b"}"#,
    r#"foo{a>="b"}"#,
    "foo{gibberish}",
    "foo{1}",
    "{}",
    r#"{x=""}"#,
    r#"{x=~".*"}"#,
    r#"{x!~".+"}"#,
    r#"{x!="a"}"#,
    r#"foo{__name__="bar"}"#,
    "foo[5mm]",
    "foo[0m]",
    "foo[5m30s]",
    "foo[5m] OFFSET 1h30m",
    r#"foo["5m"]"#,
    "foo[]",
    "foo[1]",
    "some_metric[5m] OFFSET 1",
    "some_metric[5m] OFFSET 1mm",
    "some_metric[5m] OFFSET",
    "some_metric OFFSET 1m[5m]",
    "(foo + bar)[5m]",
    "test[5d] OFFSET 10s [10m:5s]",
    r#"(foo + bar{nm="val"})[5m:][10m:5s]"#,
    "sum without(==)(some_metric)",
    "sum some_metric by (test)",
    "sum (some_metric) by test",
    "sum () by (test)",
    "MIN keep_common (some_metric)",
    "MIN (some_metric) keep_common",
    "sum (some_metric) without (test) by (test)",
    "sum without (test) (some_metric) by (test)",
    "topk(some_metric)",
    "non_existent_function_far_bar()",
  ];
  for input in cases {
    assert!(parse(input).is_err(), "should not parse: {input}");
  }
}

#[test]
fn stable_under_repeated_printing() {
  let queries = &[
    r#"foo{a="b", foo!="bar", test=~"test", bar!~"baz"}"#,
    "sum by (foo)(some_metric)",
    r#"min_over_time(rate(foo{bar="baz"}[2s])[5m:5s])"#,
    "bar + on(foo) bla / on(baz, buz) group_right(test) blub",
    "foo * on(test,blub) group_left bar",
    "test[5h] OFFSET 5m",
    r#"count_values("value", some_metric)"#,
  ];
  for query in queries {
    let first = roundtrip(query);
    assert_eq!(roundtrip(&first), first, "input: {query}");
  }
}

#[test]
fn bare_matcher_lists() {
  let matchers = parse_matchers(r#"app="web",env!="dev""#).unwrap();
  assert_eq!(matchers.len(), 2);
  assert_eq!(matchers_to_string(&matchers), r#"{app="web",env!="dev"}"#);

  assert!(parse_matchers("").is_err());
  assert!(parse_matchers(r#"env!="dev""#).is_err());
  assert!(parse_matchers("foo + bar").is_err());
}

#[test]
fn metric_selectors() {
  let matchers = parse_metric_selector("up").unwrap();
  assert_eq!(matchers_to_string(&matchers), r#"{__name__="up"}"#);

  let matchers = parse_metric_selector(r#"up{job="api"}"#).unwrap();
  assert_eq!(
    matchers_to_string(&matchers),
    r#"{__name__="up",job="api"}"#
  );

  let matchers = parse_metric_selector(r#"{__name__=~"job:.*"}"#).unwrap();
  assert_eq!(matchers_to_string(&matchers), r#"{__name__=~"job:.*"}"#);

  assert!(parse_metric_selector("up offset 5m").is_err());
  assert!(parse_metric_selector("rate(up[5m])").is_err());
}
