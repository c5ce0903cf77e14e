// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;

#[test]
fn kind_to_status_mapping() {
  let cases = &[
    (ErrorKind::BadData, StatusCode::BAD_REQUEST),
    (ErrorKind::Execution, StatusCode::UNPROCESSABLE_ENTITY),
    (ErrorKind::Timeout, StatusCode::SERVICE_UNAVAILABLE),
    (ErrorKind::Canceled, StatusCode::SERVICE_UNAVAILABLE),
    (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR),
    (ErrorKind::NoPermission, StatusCode::UNAUTHORIZED),
  ];
  for (kind, status) in cases {
    assert_eq!(kind.status_code(), *status);
  }
}

#[tokio::test]
async fn error_body_shape() {
  let response = ApiError::bad_data("query conflicts with ACL").into_response();
  assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  assert_eq!(
    response.headers().get(CONTENT_TYPE).unwrap(),
    "application/json"
  );

  let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
    .await
    .unwrap();
  let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
  assert_eq!(value["status"], "error");
  assert_eq!(value["errorType"], "bad_data");
  assert_eq!(value["error"], "query conflicts with ACL");
  assert_eq!(value["data"], serde_json::Value::Null);
  assert_eq!(value["warnings"], serde_json::json!([]));
}
