// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use crate::enforce::ConflictMode;
use crate::routes::EnforcementMode;
use anyhow::{bail, Context};
use log::{info, warn};
use rand::RngCore;
use std::net::SocketAddr;
use url::Url;

//
// Config
//

/// Process configuration, read from the environment. Anything invalid here
/// aborts startup.
#[derive(Debug, Clone)]
pub struct Config {
  pub listen: SocketAddr,
  pub public_url: String,
  pub upstream_url: Url,
  pub cookie_secret: Vec<u8>,

  pub auth_provider: String,
  pub oidc_issuer: String,
  pub oidc_client_id: String,
  pub oidc_client_secret: String,
  pub oidc_roles_claim: String,

  pub acl_file: String,
  pub primary_label: String,
  pub primary_label_claim: String,
  pub admin_role: String,
  pub enforcement_mode: EnforcementMode,
  pub conflict_mode: ConflictMode,
}

impl Config {
  pub fn from_env() -> anyhow::Result<Self> {
    Self::from_lookup(|name| std::env::var(name).ok())
  }

  pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
    let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());
    let required = |name: &str| {
      lookup(name).with_context(|| format!("missing required environment variable {name}"))
    };

    let listen_raw = var("LISTEN", ":8080");
    let listen_raw = if listen_raw.starts_with(':') {
      format!("0.0.0.0{listen_raw}")
    } else {
      listen_raw
    };
    let listen: SocketAddr = listen_raw
      .parse()
      .with_context(|| format!("unable to parse LISTEN address {listen_raw:?}"))?;

    let upstream_raw = var("PROMETHEUS_URL", "http://localhost:9090");
    let upstream_url =
      Url::parse(&upstream_raw).with_context(|| format!("unable to parse prometheus url {upstream_raw:?}"))?;

    let cookie_secret = match lookup("COOKIE_SECRET") {
      Some(secret) => {
        let bytes = secret.into_bytes();
        match bytes.len() {
          32 | 64 => {
            info!("cookie secret provided via environment");
            bytes
          },
          other => bail!("unable to use provided cookie secret with {other} bytes, use 32 or 64"),
        }
      },
      None => {
        warn!("no cookie secret provided, generating a random one");
        let mut bytes = vec![0u8; 64];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
      },
    };

    Ok(Self {
      listen,
      public_url: var("URL", "http://localhost:8080"),
      upstream_url,
      cookie_secret,
      auth_provider: var("AUTH_PROVIDER", "oidc"),
      oidc_issuer: required("OIDC_ISSUER")?,
      oidc_client_id: required("OIDC_CLIENT_ID")?,
      oidc_client_secret: required("OIDC_CLIENT_SECRET")?,
      oidc_roles_claim: var("OIDC_ROLES_CLAIM", "roles"),
      acl_file: var("ACL_FILE", "promguard-acls.yml"),
      primary_label: var("PRIMARY_LABEL", "tenant"),
      primary_label_claim: var("PRIMARY_LABEL_CLAIM", "tenant"),
      admin_role: var("ADMIN_ROLE", "admin"),
      enforcement_mode: var("ENFORCEMENT_MODE", "rewrite").parse()?,
      conflict_mode: var("CONFLICT_MODE", "lenient").parse()?,
    })
  }
}
