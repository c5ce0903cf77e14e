// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./parser_test.rs"]
mod parser_test;

use crate::ast::{
  AggregateExpr,
  AggregateOp,
  BinaryExpr,
  BinaryOp,
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
  VectorMatching,
  VectorSelector,
};
use crate::functions;
use crate::lexer::{lex, Lexeme, Token};
use crate::matcher::{LabelMatcher, MatchOp, METRIC_NAME_LABEL};
use std::time::Duration;

//
// ParseError
//

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parse error at char {pos}: {message}")]
pub struct ParseError {
  pub pos: usize,
  pub message: String,
}

impl ParseError {
  pub(crate) fn new(pos: usize, message: impl Into<String>) -> Self {
    Self {
      pos,
      message: message.into(),
    }
  }
}

/// Identifiers that never name a metric.
const RESERVED: &[&str] = &[
  "and",
  "bool",
  "by",
  "group_left",
  "group_right",
  "ignoring",
  "offset",
  "on",
  "or",
  "unless",
  "without",
];

fn is_label_name(s: &str) -> bool {
  let mut chars = s.chars();
  chars
    .next()
    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse a full query expression into its AST.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
  let lexemes = lex(input)?;
  if lexemes.is_empty() {
    return Err(ParseError::new(input.len(), "no expression found in input"));
  }
  let mut parser = Parser {
    lexemes,
    idx: 0,
    eof_pos: input.len(),
  };
  let expr = parser.parse_binary(1)?;
  if let Some(lexeme) = parser.peek() {
    return Err(ParseError::new(
      lexeme.pos,
      "could not parse remaining input",
    ));
  }
  Ok(expr)
}

/// Parse a brace-less matcher list, e.g. `app="web",env!="dev"`.
pub fn parse_matchers(input: &str) -> Result<Vec<LabelMatcher>, ParseError> {
  match parse(&format!("{{{input}}}"))? {
    Expr::VectorSelector(vs) => Ok(vs.matchers),
    _ => Err(ParseError::new(
      0,
      format!("unable to load label matchers from {input:?}"),
    )),
  }
}

/// Parse a metric selector as used by `match[]` parameters. A metric name is
/// returned as a leading `__name__` equality matcher.
pub fn parse_metric_selector(input: &str) -> Result<Vec<LabelMatcher>, ParseError> {
  match parse(input)? {
    Expr::VectorSelector(vs) if vs.offset.is_none() => {
      let mut matchers = Vec::with_capacity(vs.matchers.len() + 1);
      if let Some(name) = vs.name {
        matchers.push(LabelMatcher::equal(METRIC_NAME_LABEL, name));
      }
      matchers.extend(vs.matchers);
      Ok(matchers)
    },
    _ => Err(ParseError::new(
      0,
      "expected label matchers or metric name",
    )),
  }
}

//
// Parser
//

struct Parser {
  lexemes: Vec<Lexeme>,
  idx: usize,
  eof_pos: usize,
}

impl Parser {
  fn peek(&self) -> Option<&Lexeme> {
    self.lexemes.get(self.idx)
  }

  fn peek_tok(&self) -> Option<&Token> {
    self.peek().map(|l| &l.tok)
  }

  fn bump(&mut self) -> Lexeme {
    let lexeme = self.lexemes[self.idx].clone();
    self.idx += 1;
    lexeme
  }

  fn pos(&self) -> usize {
    self.peek().map_or(self.eof_pos, |l| l.pos)
  }

  fn error(&self, message: impl Into<String>) -> ParseError {
    ParseError::new(self.pos(), message)
  }

  fn eat(&mut self, tok: &Token) -> bool {
    if self.peek_tok() == Some(tok) {
      self.idx += 1;
      true
    } else {
      false
    }
  }

  fn expect(&mut self, tok: &Token, what: &str) -> Result<(), ParseError> {
    if self.eat(tok) {
      Ok(())
    } else {
      Err(self.error(format!("expected {what}")))
    }
  }

  /// Keywords are case insensitive.
  fn is_keyword(&self, keyword: &str) -> bool {
    matches!(self.peek_tok(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(keyword))
  }

  fn eat_keyword(&mut self, keyword: &str) -> bool {
    if self.is_keyword(keyword) {
      self.idx += 1;
      true
    } else {
      false
    }
  }

  fn binary_op_at(&self) -> Option<BinaryOp> {
    match self.peek_tok()? {
      Token::Add => Some(BinaryOp::Add),
      Token::Sub => Some(BinaryOp::Sub),
      Token::Mul => Some(BinaryOp::Mul),
      Token::Div => Some(BinaryOp::Div),
      Token::Mod => Some(BinaryOp::Mod),
      Token::Pow => Some(BinaryOp::Pow),
      Token::Eql => Some(BinaryOp::Eql),
      Token::Neq => Some(BinaryOp::Neq),
      Token::Gt => Some(BinaryOp::Gtr),
      Token::Gte => Some(BinaryOp::Gte),
      Token::Lt => Some(BinaryOp::Lss),
      Token::Lte => Some(BinaryOp::Lte),
      Token::Ident(s) if s.eq_ignore_ascii_case("and") => Some(BinaryOp::And),
      Token::Ident(s) if s.eq_ignore_ascii_case("or") => Some(BinaryOp::Or),
      Token::Ident(s) if s.eq_ignore_ascii_case("unless") => Some(BinaryOp::Unless),
      _ => None,
    }
  }

  fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr, ParseError> {
    let mut lhs = self.parse_unary()?;
    while let Some(op) = self.binary_op_at() {
      let precedence = op.precedence();
      if precedence < min_precedence {
        break;
      }
      self.idx += 1;

      let return_bool = self.eat_keyword("bool");
      if return_bool && !op.is_comparison() {
        return Err(self.error("bool modifier can only be used on comparison operators"));
      }
      let matching = self.parse_vector_matching(op)?;

      // `^` is right associative, everything else binds left.
      let next_min = if op == BinaryOp::Pow {
        precedence
      } else {
        precedence + 1
      };
      let rhs = self.parse_binary(next_min)?;
      lhs = Expr::Binary(BinaryExpr {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        return_bool,
        matching,
      });
    }
    Ok(lhs)
  }

  fn parse_vector_matching(&mut self, op: BinaryOp) -> Result<Option<VectorMatching>, ParseError> {
    let on = if self.eat_keyword("on") {
      true
    } else if self.eat_keyword("ignoring") {
      false
    } else {
      return Ok(None);
    };
    let labels = self.parse_label_list()?;

    let grouping = if self.is_keyword("group_left") || self.is_keyword("group_right") {
      if op.is_set_operator() {
        return Err(self.error("no grouping allowed for set operations"));
      }
      let left = self.eat_keyword("group_left");
      if !left {
        self.idx += 1;
      }
      let include = if self.peek_tok() == Some(&Token::LParen) {
        self.parse_label_list()?
      } else {
        Vec::new()
      };
      Some(if left {
        Grouping::Left(include)
      } else {
        Grouping::Right(include)
      })
    } else {
      None
    };

    Ok(Some(VectorMatching {
      on,
      labels,
      grouping,
    }))
  }

  fn parse_unary(&mut self) -> Result<Expr, ParseError> {
    let op = match self.peek_tok() {
      Some(Token::Add) => Some(UnaryOp::Pos),
      Some(Token::Sub) => Some(UnaryOp::Neg),
      _ => None,
    };
    let Some(op) = op else {
      return self.parse_postfix();
    };
    self.idx += 1;
    let inner = self.parse_unary()?;

    // A sign in front of a number folds into the literal.
    if let Expr::NumberLiteral(n) = &inner {
      let value = n.value;
      return Ok(Expr::NumberLiteral(NumberLiteral {
        value: if op == UnaryOp::Neg { -value } else { value },
      }));
    }
    Ok(Expr::Unary(UnaryExpr {
      op,
      expr: Box::new(inner),
    }))
  }

  fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
    let mut expr = self.parse_primary()?;
    loop {
      if self.eat(&Token::LBracket) {
        let range = self.expect_duration("range")?;
        if self.eat(&Token::Colon) {
          let step = if matches!(self.peek_tok(), Some(Token::Duration(_))) {
            Some(self.expect_duration("subquery step")?)
          } else {
            None
          };
          self.expect(&Token::RBracket, "] in subquery")?;
          if matches!(expr, Expr::MatrixSelector(_) | Expr::Subquery(_)) {
            return Err(self.error("subquery is only allowed on instant vector"));
          }
          expr = Expr::Subquery(SubqueryExpr {
            expr: Box::new(expr),
            range,
            step,
            offset: None,
          });
        } else {
          self.expect(&Token::RBracket, "] in range selector")?;
          expr = match expr {
            Expr::VectorSelector(vs) => {
              if vs.offset.is_some() {
                return Err(self.error("no offset modifiers allowed before range"));
              }
              Expr::MatrixSelector(MatrixSelector {
                selector: vs,
                range,
                offset: None,
              })
            },
            _ => return Err(self.error("range specification must be preceded by a vector selector")),
          };
        }
      } else if self.is_keyword("offset") {
        self.idx += 1;
        let duration = self.expect_duration("offset")?;
        let slot = match &mut expr {
          Expr::VectorSelector(vs) => &mut vs.offset,
          Expr::MatrixSelector(m) => &mut m.offset,
          Expr::Subquery(sq) => &mut sq.offset,
          _ => return Err(self.error("offset modifier must be preceded by a selector")),
        };
        if slot.is_some() {
          return Err(self.error("offset may not be set multiple times"));
        }
        *slot = Some(duration);
      } else {
        break;
      }
    }
    Ok(expr)
  }

  fn expect_duration(&mut self, what: &str) -> Result<Duration, ParseError> {
    match self.peek_tok() {
      Some(&Token::Duration(d)) => {
        self.idx += 1;
        Ok(d)
      },
      _ => Err(self.error(format!("expected duration in {what}"))),
    }
  }

  fn parse_primary(&mut self) -> Result<Expr, ParseError> {
    let Some(lexeme) = self.peek() else {
      return Err(self.error("unexpected end of input"));
    };
    let pos = lexeme.pos;
    match &lexeme.tok {
      Token::Number(_) => {
        let Lexeme {
          tok: Token::Number(value),
          ..
        } = self.bump()
        else {
          unreachable!()
        };
        Ok(Expr::NumberLiteral(NumberLiteral { value }))
      },
      Token::Str(_) => {
        let Lexeme {
          tok: Token::Str(value),
          ..
        } = self.bump()
        else {
          unreachable!()
        };
        Ok(Expr::StringLiteral(StringLiteral { value }))
      },
      Token::LParen => {
        self.idx += 1;
        let inner = self.parse_binary(1)?;
        self.expect(&Token::RParen, ") in paren expression")?;
        Ok(Expr::Paren(ParenExpr {
          expr: Box::new(inner),
        }))
      },
      Token::LBrace => {
        let matchers = self.parse_matcher_braces()?;
        let vs = VectorSelector {
          name: None,
          matchers,
          offset: None,
        };
        self.validate_selector(&vs, pos)?;
        Ok(Expr::VectorSelector(vs))
      },
      Token::Ident(_) => {
        let Lexeme {
          tok: Token::Ident(name),
          ..
        } = self.bump()
        else {
          unreachable!()
        };
        self.parse_ident_expr(name, pos)
      },
      _ => Err(ParseError::new(pos, "no valid expression found")),
    }
  }

  fn parse_ident_expr(&mut self, name: String, pos: usize) -> Result<Expr, ParseError> {
    if name.eq_ignore_ascii_case("inf") {
      return Ok(Expr::NumberLiteral(NumberLiteral {
        value: f64::INFINITY,
      }));
    }
    if name.eq_ignore_ascii_case("nan") {
      return Ok(Expr::NumberLiteral(NumberLiteral { value: f64::NAN }));
    }

    if let Some(op) = AggregateOp::from_keyword(&name) {
      if matches!(self.peek_tok(), Some(Token::LParen))
        || self.is_keyword("by")
        || self.is_keyword("without")
      {
        return self.parse_aggregate(op);
      }
      return Err(ParseError::new(
        pos,
        format!("expected ( or grouping after aggregation operator {}", op.as_str()),
      ));
    }

    if RESERVED.contains(&name.to_ascii_lowercase().as_str()) {
      return Err(ParseError::new(pos, format!("unexpected keyword {name:?}")));
    }

    if self.peek_tok() == Some(&Token::LParen) {
      if !functions::is_function(&name) {
        return Err(ParseError::new(pos, format!("unknown function {name:?}")));
      }
      self.idx += 1;
      let args = self.parse_expr_list()?;
      self.expect(&Token::RParen, ") in function call")?;
      return Ok(Expr::Call(Call { name, args }));
    }

    let matchers = if self.peek_tok() == Some(&Token::LBrace) {
      self.parse_matcher_braces()?
    } else {
      Vec::new()
    };
    let vs = VectorSelector {
      name: Some(name),
      matchers,
      offset: None,
    };
    self.validate_selector(&vs, pos)?;
    Ok(Expr::VectorSelector(vs))
  }

  fn parse_aggregate(&mut self, op: AggregateOp) -> Result<Expr, ParseError> {
    let before = self.try_parse_grouping()?;
    self.expect(&Token::LParen, "( in aggregation")?;
    let mut args = self.parse_expr_list()?;
    self.expect(&Token::RParen, ") in aggregation")?;
    let after = self.try_parse_grouping()?;

    let (without, grouping) = match (before, after) {
      (Some(_), Some(_)) => {
        return Err(self.error("aggregation must only contain one grouping clause"))
      },
      (Some(g), None) | (None, Some(g)) => g,
      (None, None) => (false, Vec::new()),
    };

    let (param, expr) = if op.takes_param() {
      if args.len() != 2 {
        return Err(self.error(format!(
          "wrong number of arguments for aggregation {}, expected 2",
          op.as_str()
        )));
      }
      let body = args.pop().unwrap();
      let param = args.pop().unwrap();
      (Some(Box::new(param)), Box::new(body))
    } else {
      if args.len() != 1 {
        return Err(self.error(format!(
          "wrong number of arguments for aggregation {}, expected 1",
          op.as_str()
        )));
      }
      (None, Box::new(args.pop().unwrap()))
    };

    Ok(Expr::Aggregate(AggregateExpr {
      op,
      expr,
      param,
      grouping,
      without,
    }))
  }

  fn try_parse_grouping(&mut self) -> Result<Option<(bool, Vec<String>)>, ParseError> {
    let without = if self.eat_keyword("by") {
      false
    } else if self.eat_keyword("without") {
      true
    } else {
      return Ok(None);
    };
    let labels = self.parse_label_list()?;
    Ok(Some((without, labels)))
  }

  fn parse_expr_list(&mut self) -> Result<Vec<Expr>, ParseError> {
    let mut args = Vec::new();
    if self.peek_tok() == Some(&Token::RParen) {
      return Ok(args);
    }
    loop {
      args.push(self.parse_binary(1)?);
      if !self.eat(&Token::Comma) {
        return Ok(args);
      }
    }
  }

  fn parse_label_list(&mut self) -> Result<Vec<String>, ParseError> {
    self.expect(&Token::LParen, "( in label list")?;
    let mut labels = Vec::new();
    if self.eat(&Token::RParen) {
      return Ok(labels);
    }
    loop {
      match self.peek_tok() {
        Some(Token::Ident(name)) if is_label_name(name) => {
          labels.push(name.clone());
          self.idx += 1;
        },
        _ => return Err(self.error("expected label name in label list")),
      }
      if !self.eat(&Token::Comma) {
        break;
      }
    }
    self.expect(&Token::RParen, ") in label list")?;
    Ok(labels)
  }

  fn parse_matcher_braces(&mut self) -> Result<Vec<LabelMatcher>, ParseError> {
    self.expect(&Token::LBrace, "{ in label matchers")?;
    let mut matchers = Vec::new();
    loop {
      if self.eat(&Token::RBrace) {
        return Ok(matchers);
      }
      let name_pos = self.pos();
      let name = match self.peek_tok() {
        Some(Token::Ident(name)) if is_label_name(name) => {
          let name = name.clone();
          self.idx += 1;
          name
        },
        _ => return Err(self.error("expected label name in label matchers")),
      };
      let op = match self.peek_tok() {
        Some(Token::Assign) => MatchOp::Eq,
        Some(Token::Neq) => MatchOp::Neq,
        Some(Token::EqlRegex) => MatchOp::Re,
        Some(Token::NeqRegex) => MatchOp::Nre,
        _ => return Err(self.error("expected label matching operator")),
      };
      self.idx += 1;
      let value = match self.peek_tok() {
        Some(Token::Str(_)) => {
          let Lexeme {
            tok: Token::Str(value),
            ..
          } = self.bump()
          else {
            unreachable!()
          };
          value
        },
        _ => return Err(self.error("expected string literal as match value")),
      };
      matchers.push(
        LabelMatcher::new(op, name, value).map_err(|e| ParseError::new(name_pos, e.to_string()))?,
      );
      if self.eat(&Token::Comma) {
        continue;
      }
      if self.eat(&Token::RBrace) {
        return Ok(matchers);
      }
      return Err(self.error("expected , or } in label matchers"));
    }
  }

  fn validate_selector(&self, vs: &VectorSelector, pos: usize) -> Result<(), ParseError> {
    if vs.name.is_some() {
      if vs.matchers.iter().any(|m| m.name() == METRIC_NAME_LABEL) {
        return Err(ParseError::new(pos, "metric name must not be set twice"));
      }
      return Ok(());
    }
    if vs.matchers.is_empty() {
      return Err(ParseError::new(
        pos,
        "vector selector must contain label matchers or metric name",
      ));
    }
    if vs.matchers.iter().all(|m| m.matches("")) {
      return Err(ParseError::new(
        pos,
        "vector selector must contain at least one non-empty matcher",
      ));
    }
    Ok(())
  }
}
