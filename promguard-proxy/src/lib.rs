// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod acl;
pub mod auth;
pub mod config;
pub mod context;
pub mod enforce;
pub mod labeler;
pub mod routes;

use crate::acl::AclMap;
use crate::auth::AuthProvider;
use crate::config::Config;
use crate::routes::Routes;
use anyhow::Context;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::header::CONTENT_TYPE;
use http::StatusCode;
use log::info;
use prometheus::{Encoder, Registry, TextEncoder};
use promguard_common::api::ApiError;
use std::future::Future;
use std::sync::Arc;

/// Assemble the full routing surface: the fixed routes, and the enforced
/// catch-all proxy wrapped in the auth middleware.
fn router(routes: Arc<Routes>, auth: Arc<dyn AuthProvider>, registry: Registry) -> Router {
  let enforced = Router::new()
    .fallback(routes::dispatch)
    .with_state(routes)
    .layer(axum::middleware::from_fn_with_state(
      auth.clone(),
      auth::middleware,
    ));

  let login_auth = auth.clone();
  let callback_auth = auth;
  Router::new()
    .route(
      "/metrics",
      get(move || {
        let registry = registry.clone();
        async move { metrics(&registry) }
      }),
    )
    .route("/-/ready", get(|| async { StatusCode::OK }))
    .route(
      "/oauth/login",
      get(move |req: Request| {
        let auth = login_auth.clone();
        async move { auth.login(req).await }
      }),
    )
    .route(
      "/oauth/callback",
      get(move |req: Request| {
        let auth = callback_auth.clone();
        async move { auth.callback(req).await }
      }),
    )
    .merge(enforced)
}

fn metrics(registry: &Registry) -> Response {
  let metric_families = registry.gather();
  let encoder = TextEncoder::new();
  let mut buffer = Vec::new();
  if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
    return ApiError::internal(format!("unable to encode metrics: {err}")).into_response();
  }
  ([(CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

/// Bring the proxy up and serve until the shutdown future resolves.
pub async fn run_server(
  config: Config,
  shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
  let registry = Registry::new();

  let acl_map = AclMap::load_from_file(&config.acl_file)?;
  let auth = auth::new_auth(&config, acl_map)
    .await
    .context("unable to setup auth")?;
  let routes = Arc::new(Routes::new(
    config.upstream_url.clone(),
    config.enforcement_mode,
    config.conflict_mode,
    &registry,
  )?);

  let app = router(routes, auth, registry);
  let listener = tokio::net::TcpListener::bind(config.listen)
    .await
    .with_context(|| format!("unable to bind {}", config.listen))?;
  info!("listening on {}", config.listen);
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown)
    .await
    .context("unable to start webserver")
}
