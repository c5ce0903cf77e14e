// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::acl::Acl;
use promguard_ql::matcher::LabelMatcher;
use std::sync::Arc;

//
// PrimaryLabel
//

/// The caller's tenancy identity used by the selector list strategy. A
/// missing matcher on a non-admin caller denies access outright.
#[derive(Debug, Clone)]
pub struct PrimaryLabel {
  pub matcher: Option<LabelMatcher>,
  pub admin: bool,
}

//
// EnforcementContext
//

/// Everything the dispatcher needs to enforce a request. The auth middleware
/// attaches this as a request extension before routing; a request reaching
/// the dispatcher without it is a wiring bug and answered with an internal
/// error.
#[derive(Debug, Clone)]
pub struct EnforcementContext {
  pub acl: Arc<Acl>,
  pub primary: PrimaryLabel,
}
