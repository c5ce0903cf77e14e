// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./auth_test.rs"]
mod auth_test;

use crate::acl::AclMap;
use crate::config::Config;
use crate::context::{EnforcementContext, PrimaryLabel};
use anyhow::{bail, Context};
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use http::header::{AUTHORIZATION, COOKIE, LOCATION, SET_COOKIE};
use http::{HeaderMap, StatusCode};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use log::{debug, error};
use parking_lot::RwLock;
use promguard_common::api::{ApiError, ErrorKind};
use promguard_ql::matcher::LabelMatcher;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

const TOKEN_COOKIE: &str = "promguard_token";
const STATE_COOKIE: &str = "promguard_oauth_state";

//
// AuthError
//

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
  #[error("missing credentials")]
  MissingCredentials,
  #[error("unable to verify token: {0}")]
  InvalidToken(String),
  #[error("unable to refresh signing keys: {0}")]
  Jwks(String),
}

impl AuthError {
  #[must_use]
  pub const fn kind(&self) -> ErrorKind {
    match self {
      Self::MissingCredentials | Self::InvalidToken(_) => ErrorKind::NoPermission,
      Self::Jwks(_) => ErrorKind::Internal,
    }
  }
}

//
// AuthProvider
//

/// The auth collaborator: owns the login and callback routes and resolves a
/// request to its enforcement context before the dispatcher runs.
#[async_trait]
pub trait AuthProvider: Send + Sync {
  async fn login(&self, req: Request) -> Response;
  async fn callback(&self, req: Request) -> Response;
  async fn identify(&self, headers: &HeaderMap) -> Result<EnforcementContext, AuthError>;
  fn login_url(&self) -> &str;
}

/// Instantiate the configured auth provider.
pub async fn new_auth(config: &Config, acl_map: AclMap) -> anyhow::Result<Arc<dyn AuthProvider>> {
  match config.auth_provider.as_str() {
    "oidc" => Ok(Arc::new(OidcAuth::new(config, acl_map).await?)),
    other => bail!("unable to find auth provider {other:?}"),
  }
}

/// Middleware wrapping the enforced catch-all: resolves the caller identity
/// and attaches the enforcement context, or bounces the caller to the login
/// flow. API paths get the inline JSON error shape instead of a redirect.
pub async fn middleware(
  State(auth): State<Arc<dyn AuthProvider>>,
  mut req: Request,
  next: Next,
) -> Response {
  match auth.identify(req.headers()).await {
    Ok(ctx) => {
      req.extensions_mut().insert(ctx);
      next.run(req).await
    },
    Err(err) => {
      debug!("request not authenticated: {err}");
      if req.uri().path().starts_with("/api/") {
        ApiError::new(err.kind(), err.to_string()).into_response()
      } else {
        Redirect::temporary(auth.login_url()).into_response()
      }
    },
  }
}

//
// OidcAuth
//

#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDocument {
  authorization_endpoint: String,
  token_endpoint: String,
  jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
  id_token: Option<String>,
}

/// Bearer token verification against the issuer's JWKS, with a cookie
/// carried ID token as the browser fallback. The Authorization header is
/// preferred so Grafana style data sources work without a login flow. State
/// for the authorization code round trip is HMAC signed with the cookie
/// secret instead of being stored server side.
pub struct OidcAuth {
  http: reqwest::Client,
  discovery: DiscoveryDocument,
  issuer: String,
  client_id: String,
  client_secret: String,
  redirect_url: String,
  login_url: String,
  cookie_secret: Vec<u8>,
  mapper: IdentityMapper,
  keys: RwLock<HashMap<String, DecodingKey>>,
}

impl OidcAuth {
  pub async fn new(config: &Config, acl_map: AclMap) -> anyhow::Result<Self> {
    let http = reqwest::Client::builder().build()?;
    let discovery_url = format!(
      "{}/.well-known/openid-configuration",
      config.oidc_issuer.trim_end_matches('/')
    );
    let discovery: DiscoveryDocument = http
      .get(&discovery_url)
      .send()
      .await
      .and_then(reqwest::Response::error_for_status)
      .context("unable to connect to oidc provider")?
      .json()
      .await
      .context("unable to parse oidc discovery document")?;

    let public_url = config.public_url.trim_end_matches('/');
    let auth = Self {
      http,
      discovery,
      issuer: config.oidc_issuer.clone(),
      client_id: config.oidc_client_id.clone(),
      client_secret: config.oidc_client_secret.clone(),
      redirect_url: format!("{public_url}/oauth/callback"),
      login_url: format!("{public_url}/oauth/login"),
      cookie_secret: config.cookie_secret.clone(),
      mapper: IdentityMapper {
        roles_claim: config.oidc_roles_claim.clone(),
        primary_label: config.primary_label.clone(),
        primary_label_claim: config.primary_label_claim.clone(),
        admin_role: config.admin_role.clone(),
        acl_map,
      },
      keys: RwLock::new(HashMap::new()),
    };
    auth
      .refresh_keys()
      .await
      .map_err(|err| anyhow::anyhow!("unable to fetch oidc signing keys: {err}"))?;
    Ok(auth)
  }

  async fn refresh_keys(&self) -> Result<(), AuthError> {
    let jwks: JwkSet = self
      .http
      .get(&self.discovery.jwks_uri)
      .send()
      .await
      .and_then(reqwest::Response::error_for_status)
      .map_err(|err| AuthError::Jwks(err.to_string()))?
      .json()
      .await
      .map_err(|err| AuthError::Jwks(err.to_string()))?;

    let mut keys = HashMap::new();
    for jwk in &jwks.keys {
      let Some(kid) = jwk.common.key_id.clone() else {
        continue;
      };
      match DecodingKey::from_jwk(jwk) {
        Ok(key) => {
          keys.insert(kid, key);
        },
        Err(err) => debug!("skipping unusable JWKS key {kid}: {err}"),
      }
    }
    *self.keys.write() = keys;
    Ok(())
  }

  async fn verify(&self, token: &str) -> Result<serde_json::Value, AuthError> {
    let header = decode_header(token).map_err(|err| AuthError::InvalidToken(err.to_string()))?;
    let kid = header
      .kid
      .clone()
      .ok_or_else(|| AuthError::InvalidToken("token has no key id".to_string()))?;

    let cached = self.keys.read().get(&kid).cloned();
    let key = match cached {
      Some(key) => key,
      None => {
        // Key rotation; refetch before giving up.
        self.refresh_keys().await?;
        let refreshed = self.keys.read().get(&kid).cloned();
        refreshed.ok_or_else(|| AuthError::InvalidToken(format!("unknown key id {kid:?}")))?
      },
    };

    let mut validation = Validation::new(header.alg);
    validation.set_issuer(&[&self.issuer]);
    validation.set_audience(&[&self.client_id]);
    let data = decode::<serde_json::Value>(token, &key, &validation)
      .map_err(|err| AuthError::InvalidToken(err.to_string()))?;
    Ok(data.claims)
  }
}

#[async_trait]
impl AuthProvider for OidcAuth {
  async fn login(&self, _req: Request) -> Response {
    let state = sign_state(&self.cookie_secret);
    let mut url = match Url::parse(&self.discovery.authorization_endpoint) {
      Ok(url) => url,
      Err(err) => {
        error!("invalid authorization endpoint: {err}");
        return ApiError::internal("invalid authorization endpoint").into_response();
      },
    };
    url
      .query_pairs_mut()
      .append_pair("response_type", "code")
      .append_pair("client_id", &self.client_id)
      .append_pair("redirect_uri", &self.redirect_url)
      .append_pair("scope", "openid")
      .append_pair("state", &state);

    let cookie = format!("{STATE_COOKIE}={state}; Path=/oauth/; HttpOnly; Max-Age=600");
    (
      StatusCode::TEMPORARY_REDIRECT,
      [(SET_COOKIE, cookie), (LOCATION, url.to_string())],
    )
      .into_response()
  }

  async fn callback(&self, req: Request) -> Response {
    let params: HashMap<String, String> =
      form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
        .into_owned()
        .collect();

    let Some(state) = params.get("state") else {
      return (StatusCode::FORBIDDEN, "state missing").into_response();
    };
    let cookie_state = cookie_value(req.headers(), STATE_COOKIE);
    if cookie_state.as_deref() != Some(state.as_str())
      || !verify_state(&self.cookie_secret, state)
    {
      return (StatusCode::FORBIDDEN, "oauth state invalid").into_response();
    }
    let Some(code) = params.get("code") else {
      return (StatusCode::FORBIDDEN, "code missing").into_response();
    };

    let form = [
      ("grant_type", "authorization_code"),
      ("code", code.as_str()),
      ("redirect_uri", self.redirect_url.as_str()),
      ("client_id", self.client_id.as_str()),
      ("client_secret", self.client_secret.as_str()),
    ];
    let token: TokenResponse = match self
      .http
      .post(&self.discovery.token_endpoint)
      .form(&form)
      .send()
      .await
      .and_then(reqwest::Response::error_for_status)
    {
      Ok(response) => match response.json().await {
        Ok(token) => token,
        Err(err) => {
          error!("unable to parse oauth token response: {err}");
          return (StatusCode::FORBIDDEN, "unable to exchange oauth token").into_response();
        },
      },
      Err(err) => {
        error!("unable to exchange oauth token: {err}");
        return (StatusCode::FORBIDDEN, "unable to exchange oauth token").into_response();
      },
    };

    let Some(id_token) = token.id_token else {
      return (StatusCode::FORBIDDEN, "id_token missing").into_response();
    };
    if let Err(err) = self.verify(&id_token).await {
      debug!("callback id_token rejected: {err}");
      return (StatusCode::FORBIDDEN, "unable to verify id_token").into_response();
    }

    let cookie = format!("{TOKEN_COOKIE}={id_token}; Path=/; HttpOnly");
    (
      StatusCode::TEMPORARY_REDIRECT,
      [(SET_COOKIE, cookie), (LOCATION, "/".to_string())],
    )
      .into_response()
  }

  async fn identify(&self, headers: &HeaderMap) -> Result<EnforcementContext, AuthError> {
    let token = bearer_token(headers)
      .or_else(|| cookie_value(headers, TOKEN_COOKIE))
      .ok_or(AuthError::MissingCredentials)?;
    let claims = self.verify(&token).await?;
    Ok(self.mapper.context_for(&claims))
  }

  fn login_url(&self) -> &str {
    &self.login_url
  }
}

//
// IdentityMapper
//

/// Maps verified token claims to the enforcement context: roles resolve the
/// ACL (first configured role wins, deny otherwise), the tenancy claim forms
/// the primary matcher, and the admin role bypasses enforcement.
struct IdentityMapper {
  roles_claim: String,
  primary_label: String,
  primary_label_claim: String,
  admin_role: String,
  acl_map: AclMap,
}

impl IdentityMapper {
  fn context_for(&self, claims: &serde_json::Value) -> EnforcementContext {
    let roles: Vec<String> = claims
      .get(&self.roles_claim)
      .and_then(serde_json::Value::as_array)
      .map(|values| {
        values
          .iter()
          .filter_map(|v| v.as_str().map(str::to_string))
          .collect()
      })
      .unwrap_or_default();

    let acl = self.acl_map.acl_for_roles(&roles);
    let admin = roles.iter().any(|role| *role == self.admin_role);
    let matcher = claims
      .get(&self.primary_label_claim)
      .and_then(serde_json::Value::as_str)
      .map(|tenant| LabelMatcher::equal(&self.primary_label, tenant));

    EnforcementContext {
      acl,
      primary: PrimaryLabel { matcher, admin },
    }
  }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
  headers
    .get(AUTHORIZATION)?
    .to_str()
    .ok()?
    .strip_prefix("Bearer ")
    .map(str::to_string)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
  for header in headers.get_all(COOKIE) {
    let Ok(cookies) = header.to_str() else {
      continue;
    };
    for pair in cookies.split(';') {
      if let Some((key, value)) = pair.trim().split_once('=') {
        if key == name {
          return Some(value.to_string());
        }
      }
    }
  }
  None
}

/// `nonce.mac` with the MAC keyed by the cookie secret, so the callback can
/// check the state without server side session storage.
fn sign_state(secret: &[u8]) -> String {
  let mut nonce = [0u8; 16];
  rand::thread_rng().fill_bytes(&mut nonce);
  let nonce = URL_SAFE_NO_PAD.encode(nonce);
  let mac = URL_SAFE_NO_PAD.encode(hmac_sha256(secret, nonce.as_bytes()));
  format!("{nonce}.{mac}")
}

fn verify_state(secret: &[u8], state: &str) -> bool {
  let Some((nonce, mac)) = state.split_once('.') else {
    return false;
  };
  URL_SAFE_NO_PAD.encode(hmac_sha256(secret, nonce.as_bytes())) == mac
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
  let mut key_block = [0u8; 64];
  if key.len() > 64 {
    key_block[.. 32].copy_from_slice(&Sha256::digest(key));
  } else {
    key_block[.. key.len()].copy_from_slice(key);
  }

  let inner_pad: Vec<u8> = key_block.iter().map(|b| b ^ 0x36).collect();
  let outer_pad: Vec<u8> = key_block.iter().map(|b| b ^ 0x5c).collect();

  let mut inner = Sha256::new();
  inner.update(&inner_pad);
  inner.update(message);
  let inner_digest = inner.finalize();

  let mut outer = Sha256::new();
  outer.update(&outer_pad);
  outer.update(inner_digest);
  outer.finalize().into()
}
