// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./lexer_test.rs"]
mod lexer_test;

use crate::parser::ParseError;
use nom::bytes::complete::take_while;
use nom::character::complete::satisfy;
use nom::combinator::recognize;
use nom::sequence::pair;
use nom::IResult;
use std::time::Duration;

//
// Token
//

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
  /// Identifiers and keywords; keyword classification is contextual and left
  /// to the parser so that e.g. `NaN` stays usable as a label name.
  Ident(String),
  Number(f64),
  Str(String),
  Duration(Duration),
  LParen,
  RParen,
  LBrace,
  RBrace,
  LBracket,
  RBracket,
  Comma,
  Colon,
  Assign,
  Eql,
  Neq,
  EqlRegex,
  NeqRegex,
  Lt,
  Gt,
  Lte,
  Gte,
  Add,
  Sub,
  Mul,
  Div,
  Mod,
  Pow,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Lexeme {
  pub tok: Token,
  pub pos: usize,
}

/// Metric identifier: letters, digits, underscores and colons, not starting
/// with a digit or colon.
fn ident(input: &str) -> IResult<&str, &str> {
  recognize(pair(
    satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
    take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == ':'),
  ))(input)
}

fn skip_ignored(mut rest: &str) -> &str {
  loop {
    let trimmed = rest.trim_start();
    if let Some(after) = trimmed.strip_prefix('#') {
      match after.find('\n') {
        Some(i) => rest = &after[i + 1 ..],
        None => return "",
      }
    } else {
      return trimmed;
    }
  }
}

pub(crate) fn lex(input: &str) -> Result<Vec<Lexeme>, ParseError> {
  let mut out = Vec::new();
  let mut rest = input;
  loop {
    rest = skip_ignored(rest);
    let Some(c) = rest.chars().next() else {
      return Ok(out);
    };
    let pos = input.len() - rest.len();
    let (consumed, tok) = if c == '"' || c == '\'' {
      lex_quoted(rest, pos)?
    } else if c == '`' {
      lex_raw(rest, pos)?
    } else if c.is_ascii_digit() || (c == '.' && starts_with_digit(&rest[1 ..])) {
      lex_number_or_duration(rest, pos)?
    } else if c.is_ascii_alphabetic() || c == '_' {
      let (remaining, text) =
        ident(rest).map_err(|_| ParseError::new(pos, "invalid identifier"))?;
      (rest.len() - remaining.len(), Token::Ident(text.to_string()))
    } else {
      lex_operator(rest, pos)?
    };
    out.push(Lexeme { tok, pos });
    rest = &rest[consumed ..];
  }
}

fn starts_with_digit(s: &str) -> bool {
  s.as_bytes().first().is_some_and(u8::is_ascii_digit)
}

fn lex_quoted(rest: &str, pos: usize) -> Result<(usize, Token), ParseError> {
  let mut chars = rest.char_indices();
  let quote = chars.next().map(|(_, c)| c).unwrap_or('"');
  let mut value = String::new();
  while let Some((i, c)) = chars.next() {
    match c {
      c if c == quote => return Ok((i + c.len_utf8(), Token::Str(value))),
      '\n' => break,
      '\\' => {
        let (esc_pos, esc) = chars
          .next()
          .ok_or_else(|| ParseError::new(pos, "unterminated quoted string"))?;
        match esc {
          'a' => value.push('\x07'),
          'b' => value.push('\x08'),
          'f' => value.push('\x0c'),
          'n' => value.push('\n'),
          'r' => value.push('\r'),
          't' => value.push('\t'),
          'v' => value.push('\x0b'),
          '\\' => value.push('\\'),
          '\'' => value.push('\''),
          '"' => value.push('"'),
          'x' => value.push(hex_escape(&mut chars, 2, pos)?),
          'u' => value.push(hex_escape(&mut chars, 4, pos)?),
          'U' => value.push(hex_escape(&mut chars, 8, pos)?),
          '0' ..= '7' => value.push(octal_escape(esc, &mut chars, pos)?),
          _ => {
            return Err(ParseError::new(
              pos + esc_pos,
              "unknown escape sequence in string",
            ))
          },
        }
      },
      c => value.push(c),
    }
  }
  Err(ParseError::new(pos, "unterminated quoted string"))
}

fn lex_raw(rest: &str, pos: usize) -> Result<(usize, Token), ParseError> {
  match rest[1 ..].find('`') {
    Some(i) => Ok((i + 2, Token::Str(rest[1 .. 1 + i].to_string()))),
    None => Err(ParseError::new(pos, "unterminated raw string")),
  }
}

fn hex_escape(
  chars: &mut std::str::CharIndices<'_>,
  digits: u32,
  pos: usize,
) -> Result<char, ParseError> {
  let mut value: u32 = 0;
  for _ in 0 .. digits {
    let d = chars
      .next()
      .and_then(|(_, c)| c.to_digit(16))
      .ok_or_else(|| ParseError::new(pos, "invalid escape sequence in string"))?;
    value = value * 16 + d;
  }
  char::from_u32(value)
    .ok_or_else(|| ParseError::new(pos, "invalid code point in escape sequence"))
}

fn octal_escape(
  first: char,
  chars: &mut std::str::CharIndices<'_>,
  pos: usize,
) -> Result<char, ParseError> {
  let mut value = first.to_digit(8).unwrap_or(0);
  for _ in 0 .. 2 {
    let d = chars
      .next()
      .and_then(|(_, c)| c.to_digit(8))
      .ok_or_else(|| ParseError::new(pos, "invalid escape sequence in string"))?;
    value = value * 8 + d;
  }
  char::from_u32(value)
    .ok_or_else(|| ParseError::new(pos, "invalid code point in escape sequence"))
}

const DURATION_UNITS: &[(&str, u64)] = &[
  ("ms", 1),
  ("s", 1_000),
  ("m", 60_000),
  ("h", 3_600_000),
  ("d", 86_400_000),
  ("w", 604_800_000),
  ("y", 31_536_000_000),
];

fn lex_number_or_duration(rest: &str, pos: usize) -> Result<(usize, Token), ParseError> {
  let bytes = rest.as_bytes();

  if rest.starts_with("0x") || rest.starts_with("0X") {
    let digits = bytes[2 ..]
      .iter()
      .take_while(|b| b.is_ascii_hexdigit())
      .count();
    if digits == 0 {
      return Err(ParseError::new(pos, "invalid number"));
    }
    let value = u64::from_str_radix(&rest[2 .. 2 + digits], 16)
      .map_err(|_| ParseError::new(pos, "invalid number"))?;
    #[allow(clippy::cast_precision_loss)]
    return Ok((2 + digits, Token::Number(value as f64)));
  }

  let mut end = 0;
  while end < bytes.len() && bytes[end].is_ascii_digit() {
    end += 1;
  }
  let int_len = end;

  let mut has_dot = false;
  if end < bytes.len() && bytes[end] == b'.' {
    let mut frac = end + 1;
    while frac < bytes.len() && bytes[frac].is_ascii_digit() {
      frac += 1;
    }
    if frac > end + 1 || int_len > 0 {
      has_dot = true;
      end = frac;
    }
  }

  let mut has_exp = false;
  if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
    let mut exp = end + 1;
    if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
      exp += 1;
    }
    let exp_digits = exp;
    while exp < bytes.len() && bytes[exp].is_ascii_digit() {
      exp += 1;
    }
    if exp > exp_digits {
      has_exp = true;
      end = exp;
    }
  }

  if !has_dot && !has_exp && int_len > 0 {
    let after_int = &rest[int_len ..];
    if let Some((unit, millis)) = DURATION_UNITS
      .iter()
      .find(|(unit, _)| after_int.starts_with(unit))
    {
      let after_unit = &after_int[unit.len() ..];
      if after_unit.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        return Err(ParseError::new(pos, "bad duration syntax"));
      }
      let count: u64 = rest[.. int_len]
        .parse()
        .map_err(|_| ParseError::new(pos, "invalid duration"))?;
      if count == 0 {
        return Err(ParseError::new(pos, "duration must be greater than 0"));
      }
      let total = count
        .checked_mul(*millis)
        .ok_or_else(|| ParseError::new(pos, "duration out of range"))?;
      return Ok((int_len + unit.len(), Token::Duration(Duration::from_millis(total))));
    }

    // Legacy octal literals.
    if int_len > 1 && bytes[0] == b'0' {
      let value = u64::from_str_radix(&rest[1 .. int_len], 8)
        .map_err(|_| ParseError::new(pos, "invalid number"))?;
      #[allow(clippy::cast_precision_loss)]
      return Ok((int_len, Token::Number(value as f64)));
    }
  }

  if end == 0 {
    return Err(ParseError::new(pos, "invalid number"));
  }
  let value: f64 = rest[.. end]
    .parse()
    .map_err(|_| ParseError::new(pos, "invalid number"))?;
  Ok((end, Token::Number(value)))
}

fn lex_operator(rest: &str, pos: usize) -> Result<(usize, Token), ParseError> {
  let bytes = rest.as_bytes();
  let tok = match bytes[0] {
    b'(' => Token::LParen,
    b')' => Token::RParen,
    b'{' => Token::LBrace,
    b'}' => Token::RBrace,
    b'[' => Token::LBracket,
    b']' => Token::RBracket,
    b',' => Token::Comma,
    b':' => Token::Colon,
    b'+' => Token::Add,
    b'-' => Token::Sub,
    b'*' => Token::Mul,
    b'/' => Token::Div,
    b'%' => Token::Mod,
    b'^' => Token::Pow,
    b'=' => match bytes.get(1) {
      Some(b'=') => return Ok((2, Token::Eql)),
      Some(b'~') => return Ok((2, Token::EqlRegex)),
      _ => Token::Assign,
    },
    b'!' => match bytes.get(1) {
      Some(b'=') => return Ok((2, Token::Neq)),
      Some(b'~') => return Ok((2, Token::NeqRegex)),
      _ => {
        return Err(ParseError::new(
          pos,
          "unexpected character after '!': expected '=' or '~'",
        ))
      },
    },
    b'<' => match bytes.get(1) {
      Some(b'=') => return Ok((2, Token::Lte)),
      _ => Token::Lt,
    },
    b'>' => match bytes.get(1) {
      Some(b'=') => return Ok((2, Token::Gte)),
      _ => Token::Gt,
    },
    _ => {
      let c = rest.chars().next().unwrap_or('\0');
      return Err(ParseError::new(
        pos,
        format!("unexpected character: {c:?}"),
      ));
    },
  };
  Ok((1, tok))
}
