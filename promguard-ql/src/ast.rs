// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::matcher::LabelMatcher;
use std::time::Duration;

//
// Expr
//

/// A parsed query expression. Only the selector leaves carry label matchers;
/// every traversal in the workspace matches exhaustively on this enum so that
/// a new node kind fails to compile rather than slipping through a walk.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  NumberLiteral(NumberLiteral),
  StringLiteral(StringLiteral),
  VectorSelector(VectorSelector),
  MatrixSelector(MatrixSelector),
  Call(Call),
  Binary(BinaryExpr),
  Unary(UnaryExpr),
  Paren(ParenExpr),
  Aggregate(AggregateExpr),
  Subquery(SubqueryExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberLiteral {
  pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringLiteral {
  pub value: String,
}

/// An instant selector: optional metric name plus a conjunctive matcher list.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSelector {
  pub name: Option<String>,
  pub matchers: Vec<LabelMatcher>,
  pub offset: Option<Duration>,
}

/// A range selector: an instant selector with a time window. The inner
/// selector never carries its own offset; the parser rejects an offset
/// placed before the range.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixSelector {
  pub selector: VectorSelector,
  pub range: Duration,
  pub offset: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
  pub name: String,
  pub args: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Div,
  Mod,
  Pow,
  Eql,
  Neq,
  Gtr,
  Gte,
  Lss,
  Lte,
  And,
  Or,
  Unless,
}

impl BinaryOp {
  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::Add => "+",
      Self::Sub => "-",
      Self::Mul => "*",
      Self::Div => "/",
      Self::Mod => "%",
      Self::Pow => "^",
      Self::Eql => "==",
      Self::Neq => "!=",
      Self::Gtr => ">",
      Self::Gte => ">=",
      Self::Lss => "<",
      Self::Lte => "<=",
      Self::And => "and",
      Self::Or => "or",
      Self::Unless => "unless",
    }
  }

  #[must_use]
  pub const fn is_comparison(self) -> bool {
    matches!(
      self,
      Self::Eql | Self::Neq | Self::Gtr | Self::Gte | Self::Lss | Self::Lte
    )
  }

  #[must_use]
  pub const fn is_set_operator(self) -> bool {
    matches!(self, Self::And | Self::Or | Self::Unless)
  }

  /// Binding strength, higher binds tighter. `^` is right associative.
  #[must_use]
  pub const fn precedence(self) -> u8 {
    match self {
      Self::Or => 1,
      Self::And | Self::Unless => 2,
      Self::Eql | Self::Neq | Self::Gtr | Self::Gte | Self::Lss | Self::Lte => 3,
      Self::Add | Self::Sub => 4,
      Self::Mul | Self::Div | Self::Mod => 5,
      Self::Pow => 6,
    }
  }
}

/// Which side of a binary expression carries the higher cardinality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grouping {
  Left(Vec<String>),
  Right(Vec<String>),
}

/// The `on`/`ignoring` (+ optional `group_left`/`group_right`) modifier of a
/// binary expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorMatching {
  /// `on` when true, `ignoring` otherwise.
  pub on: bool,
  pub labels: Vec<String>,
  pub grouping: Option<Grouping>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
  pub op: BinaryOp,
  pub lhs: Box<Expr>,
  pub rhs: Box<Expr>,
  pub return_bool: bool,
  pub matching: Option<VectorMatching>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
  Pos,
  Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryExpr {
  pub op: UnaryOp,
  pub expr: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParenExpr {
  pub expr: Box<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
  Sum,
  Avg,
  Min,
  Max,
  StdDev,
  StdVar,
  Count,
  CountValues,
  TopK,
  BottomK,
  Quantile,
}

impl AggregateOp {
  /// Case insensitive keyword lookup; `None` when the identifier is not an
  /// aggregation operator.
  #[must_use]
  pub fn from_keyword(ident: &str) -> Option<Self> {
    Some(match ident.to_ascii_lowercase().as_str() {
      "sum" => Self::Sum,
      "avg" => Self::Avg,
      "min" => Self::Min,
      "max" => Self::Max,
      "stddev" => Self::StdDev,
      "stdvar" => Self::StdVar,
      "count" => Self::Count,
      "count_values" => Self::CountValues,
      "topk" => Self::TopK,
      "bottomk" => Self::BottomK,
      "quantile" => Self::Quantile,
      _ => return None,
    })
  }

  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::Sum => "sum",
      Self::Avg => "avg",
      Self::Min => "min",
      Self::Max => "max",
      Self::StdDev => "stddev",
      Self::StdVar => "stdvar",
      Self::Count => "count",
      Self::CountValues => "count_values",
      Self::TopK => "topk",
      Self::BottomK => "bottomk",
      Self::Quantile => "quantile",
    }
  }

  /// Operators that take a scalar/string parameter before the body.
  #[must_use]
  pub const fn takes_param(self) -> bool {
    matches!(
      self,
      Self::CountValues | Self::TopK | Self::BottomK | Self::Quantile
    )
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
  pub op: AggregateOp,
  pub expr: Box<Expr>,
  pub param: Option<Box<Expr>>,
  pub grouping: Vec<String>,
  pub without: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubqueryExpr {
  pub expr: Box<Expr>,
  pub range: Duration,
  pub step: Option<Duration>,
  pub offset: Option<Duration>,
}
