// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! The query surface of the proxy: AST, parser, canonical printer, label
//! matcher model and the matcher deduplicator. This crate performs no I/O.

pub mod ast;
pub mod dedupe;
pub mod functions;
mod lexer;
pub mod matcher;
pub mod parser;
mod printer;
