// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./api_test.rs"]
mod api_test;

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::StatusCode;
use serde::Serialize;

//
// ErrorKind
//

/// Error taxonomy of the upstream API. Proxy generated errors use the same
/// kinds and wire shape so that clients cannot tell them apart from upstream
/// responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Timeout,
  Canceled,
  Execution,
  BadData,
  Internal,
  NoPermission,
}

impl ErrorKind {
  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::Timeout => "timeout",
      Self::Canceled => "canceled",
      Self::Execution => "execution",
      Self::BadData => "bad_data",
      Self::Internal => "internal",
      Self::NoPermission => "no_permission",
    }
  }

  #[must_use]
  pub const fn status_code(self) -> StatusCode {
    match self {
      Self::BadData => StatusCode::BAD_REQUEST,
      Self::Execution => StatusCode::UNPROCESSABLE_ENTITY,
      Self::Canceled | Self::Timeout => StatusCode::SERVICE_UNAVAILABLE,
      Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
      Self::NoPermission => StatusCode::UNAUTHORIZED,
    }
  }
}

impl std::fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

//
// ApiError
//

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ApiError {
  pub kind: ErrorKind,
  pub message: String,
}

impl ApiError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  pub fn bad_data(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::BadData, message)
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Internal, message)
  }

  pub fn no_permission(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::NoPermission, message)
  }
}

#[derive(Serialize)]
struct ErrorBody {
  status: &'static str,
  #[serde(rename = "errorType")]
  error_type: &'static str,
  error: String,
  data: Option<()>,
  warnings: Vec<String>,
}

impl ApiError {
  /// The upstream's JSON error shape with an explicit status code, for the
  /// rare spots that deviate from the kind's default mapping.
  #[must_use]
  pub fn into_response_with_status(self, status: StatusCode) -> Response {
    let body = ErrorBody {
      status: "error",
      error_type: self.kind.as_str(),
      error: self.message,
      data: None,
      warnings: Vec::new(),
    };
    (
      status,
      [
        (CONTENT_TYPE, "application/json"),
        (CACHE_CONTROL, "no-store"),
      ],
      Json(body),
    )
      .into_response()
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.kind.status_code();
    self.into_response_with_status(status)
  }
}
