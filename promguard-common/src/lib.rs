// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod api;

/// One-time process initialization. Call before anything logs.
pub fn global_initialize() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
