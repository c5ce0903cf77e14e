// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./routes_test.rs"]
mod routes_test;

use crate::context::EnforcementContext;
use crate::enforce::{inject_matcher, ConflictMode, MatcherEnforcer, RewriteError};
use crate::labeler::Labeler;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use http::header::{
  HeaderName,
  CONTENT_LENGTH,
  CONTENT_TYPE,
  HOST,
  TRANSFER_ENCODING,
};
use http::{Method, StatusCode};
use log::{debug, info, warn};
use prometheus::{exponential_buckets, Histogram, HistogramOpts, IntCounter, Registry};
use promguard_common::api::ApiError;
use promguard_ql::matcher::LabelMatcher;
use promguard_ql::parser::ParseError;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

const QUERY_PARAM: &str = "query";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const MAX_FORM_BODY_BYTES: usize = 10 * 1024 * 1024;

//
// EnforcementMode
//

/// The two deployment modes of the proxy: rewrite queries from the caller's
/// ACL, or inject only the caller's primary matcher the way the selector
/// list endpoints do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementMode {
  Rewrite,
  Inject,
}

impl std::str::FromStr for EnforcementMode {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "rewrite" => Ok(Self::Rewrite),
      "inject" => Ok(Self::Inject),
      other => Err(anyhow::anyhow!(
        "invalid enforcement mode {other:?}, expected \"rewrite\" or \"inject\""
      )),
    }
  }
}

//
// Stats
//

struct Stats {
  upstream_duration: Histogram,
  requests_denied: IntCounter,
}

impl Stats {
  fn new(registry: &Registry) -> anyhow::Result<Self> {
    let upstream_duration = Histogram::with_opts(
      HistogramOpts::new(
        "promguard_upstream_response_seconds",
        "Response latency of the upstream.",
      )
      .buckets(exponential_buckets(0.001, 2.0, 16)?),
    )?;
    let requests_denied = IntCounter::new(
      "promguard_requests_denied_total",
      "Requests refused before reaching the upstream.",
    )?;
    registry.register(Box::new(upstream_duration.clone()))?;
    registry.register(Box::new(requests_denied.clone()))?;
    Ok(Self {
      upstream_duration,
      requests_denied,
    })
  }
}

enum Endpoint {
  Query,
  SelectorList,
  PassThrough,
}

enum ForwardBody {
  /// Stream the caller's body through untouched.
  Stream(Body),
  /// The body was rewritten; content-length is recomputed from it.
  Replaced(String),
}

//
// Routes
//

/// Per endpoint dispatcher: classifies the request path, rewrites the query
/// string and form body as the endpoint demands, and proxies to the
/// upstream.
pub struct Routes {
  upstream: Url,
  client: reqwest::Client,
  mode: EnforcementMode,
  conflict_mode: ConflictMode,
  labeler: Labeler,
  label_values_re: Regex,
  stats: Stats,
}

impl Routes {
  pub fn new(
    upstream: Url,
    mode: EnforcementMode,
    conflict_mode: ConflictMode,
    registry: &Registry,
  ) -> anyhow::Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(600))
      .pool_idle_timeout(Duration::from_secs(90))
      .pool_max_idle_per_host(100)
      .tcp_keepalive(Duration::from_secs(30))
      .redirect(reqwest::redirect::Policy::none())
      .build()?;
    Ok(Self {
      upstream,
      client,
      mode,
      conflict_mode,
      labeler: Labeler::new(registry)?,
      label_values_re: Regex::new("/api/v1/label/.+/values$").expect("static regex"),
      stats: Stats::new(registry)?,
    })
  }

  fn classify(&self, path: &str) -> Endpoint {
    if path.ends_with("/api/v1/query")
      || path.ends_with("/api/v1/query_range")
      || path.ends_with("/api/v1/query_exemplars")
    {
      Endpoint::Query
    } else if path.ends_with("/api/v1/series")
      || path.ends_with("/api/v1/labels")
      || self.label_values_re.is_match(path)
    {
      Endpoint::SelectorList
    } else {
      Endpoint::PassThrough
    }
  }

  async fn dispatch_with_context(&self, req: Request, ctx: &EnforcementContext) -> Response {
    if ctx.primary.admin {
      return self.forward_unmodified(req).await;
    }
    let Some(matcher) = ctx.primary.matcher.clone() else {
      self.stats.requests_denied.inc();
      return ApiError::no_permission("caller has no label matcher configured").into_response();
    };

    match self.classify(req.uri().path()) {
      Endpoint::Query => self.query(req, ctx, &matcher).await,
      Endpoint::SelectorList => self.matcher(req, &matcher).await,
      Endpoint::PassThrough => self.forward_unmodified(req).await,
    }
  }

  /// Query rewrite strategy. The `query` field can arrive in the URL query
  /// string and/or the POST body; both surfaces are enforced independently.
  async fn query(&self, req: Request, ctx: &EnforcementContext, matcher: &LabelMatcher) -> Response {
    let (parts, body) = req.into_parts();

    let mut url_values = parse_form(parts.uri.query().unwrap_or("").as_bytes());
    let found_url = match self.enforce_query_values(&mut url_values, ctx, matcher) {
      Ok(found) => found,
      Err(err) => return self.rewrite_failure(err),
    };

    let mut found_body = false;
    let forward_body = if parts.method == Method::POST && has_form_content_type(&parts.headers) {
      let bytes = match axum::body::to_bytes(body, MAX_FORM_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
          return ApiError::bad_data(format!("unable to read request body: {err}")).into_response()
        },
      };
      let mut body_values = parse_form(&bytes);
      found_body = match self.enforce_query_values(&mut body_values, ctx, matcher) {
        Ok(found) => found,
        Err(err) => return self.rewrite_failure(err),
      };
      ForwardBody::Replaced(encode_form(&body_values))
    } else {
      ForwardBody::Stream(body)
    };

    if found_url || found_body {
      info!(
        "{} {} rewritten for enforcement",
        parts.method,
        parts.uri.path()
      );
    }
    let query = encode_query(&url_values);
    self.forward(&parts, query.as_deref(), forward_body).await
  }

  /// Rewrite every `query` field of a form through the strategy selected at
  /// construction. Returns whether any query field was present.
  fn enforce_query_values(
    &self,
    values: &mut [(String, String)],
    ctx: &EnforcementContext,
    matcher: &LabelMatcher,
  ) -> Result<bool, RewriteError> {
    let mut found = false;
    for (key, value) in values.iter_mut() {
      if key != QUERY_PARAM {
        continue;
      }
      *value = match self.mode {
        EnforcementMode::Rewrite => self.labeler.rewrite_query(value, &ctx.acl, self.conflict_mode)?,
        EnforcementMode::Inject => MatcherEnforcer::new(self.conflict_mode, [matcher.clone()])
          .enforce_query(value)?,
      };
      found = true;
    }
    Ok(found)
  }

  fn rewrite_failure(&self, err: RewriteError) -> Response {
    match err {
      // Syntax errors are not surfaced to the client; the request is
      // answered empty the way the upstream's own proxy chain behaves.
      RewriteError::Parse(err) => {
        debug!("dropping unparseable query: {err}");
        StatusCode::OK.into_response()
      },
      RewriteError::Conflict(err) => {
        self.stats.requests_denied.inc();
        ApiError::bad_data(err.to_string()).into_response()
      },
    }
  }

  /// Selector list strategy for the metadata endpoints, which accept
  /// `match[]` matcher lists instead of query expressions.
  async fn matcher(&self, req: Request, matcher: &LabelMatcher) -> Response {
    let (parts, body) = req.into_parts();

    let mut url_values = parse_form(parts.uri.query().unwrap_or("").as_bytes());
    if let Err(err) = inject_matcher(&mut url_values, matcher) {
      return self.selector_failure(&err);
    }

    let forward_body = if parts.method == Method::POST && has_form_content_type(&parts.headers) {
      let bytes = match axum::body::to_bytes(body, MAX_FORM_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
          return ApiError::bad_data(format!("unable to read request body: {err}")).into_response()
        },
      };
      let mut body_values = parse_form(&bytes);
      if let Err(err) = inject_matcher(&mut body_values, matcher) {
        return self.selector_failure(&err);
      }
      ForwardBody::Replaced(encode_form(&body_values))
    } else {
      ForwardBody::Stream(body)
    };

    let query = encode_query(&url_values);
    self.forward(&parts, query.as_deref(), forward_body).await
  }

  fn selector_failure(&self, err: &ParseError) -> Response {
    debug!("dropping request with unparseable match[] selector: {err}");
    StatusCode::OK.into_response()
  }

  async fn forward_unmodified(&self, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let query = parts.uri.query().map(str::to_string);
    self
      .forward(&parts, query.as_deref(), ForwardBody::Stream(body))
      .await
  }

  /// Proxy the request to the upstream. The Host header is replaced by the
  /// upstream host; a replaced body gets its content-length recomputed; the
  /// response streams back unmodified.
  async fn forward(
    &self,
    parts: &http::request::Parts,
    query: Option<&str>,
    body: ForwardBody,
  ) -> Response {
    let mut url = self.upstream.clone();
    url.set_path(parts.uri.path());
    url.set_query(query);

    let replaced = matches!(body, ForwardBody::Replaced(_));
    let mut builder = self.client.request(parts.method.clone(), url);
    for (name, value) in &parts.headers {
      if should_forward_header(name, replaced) {
        builder = builder.header(name, value);
      }
    }
    builder = match body {
      ForwardBody::Replaced(contents) => builder.body(contents),
      ForwardBody::Stream(stream) => {
        if has_request_body(&parts.headers) {
          builder.body(reqwest::Body::wrap_stream(stream.into_data_stream()))
        } else {
          builder
        }
      },
    };

    let start = Instant::now();
    let result = builder.send().await;
    self
      .stats
      .upstream_duration
      .observe(start.elapsed().as_secs_f64());

    match result {
      Ok(upstream) => {
        let mut response = http::Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
          if !is_hop_by_hop(name) {
            response = response.header(name, value);
          }
        }
        response
          .body(Body::from_stream(upstream.bytes_stream()))
          .unwrap_or_else(|err| {
            ApiError::internal(format!("unable to build upstream response: {err}")).into_response()
          })
      },
      Err(err) => {
        warn!("upstream request failed: {err}");
        ApiError::internal(format!("upstream request failed: {err}"))
          .into_response_with_status(StatusCode::BAD_GATEWAY)
      },
    }
  }
}

/// Entry point for the catch-all route. The auth middleware must have
/// attached the enforcement context already.
pub async fn dispatch(State(routes): State<Arc<Routes>>, req: Request) -> Response {
  let Some(ctx) = req.extensions().get::<EnforcementContext>().cloned() else {
    return ApiError::internal("unable to load enforcement context for request").into_response();
  };
  routes.dispatch_with_context(req, &ctx).await
}

fn parse_form(input: &[u8]) -> Vec<(String, String)> {
  form_urlencoded::parse(input).into_owned().collect()
}

fn encode_form(values: &[(String, String)]) -> String {
  let mut serializer = form_urlencoded::Serializer::new(String::new());
  for (key, value) in values {
    serializer.append_pair(key, value);
  }
  serializer.finish()
}

fn encode_query(values: &[(String, String)]) -> Option<String> {
  if values.is_empty() {
    None
  } else {
    Some(encode_form(values))
  }
}

fn has_form_content_type(headers: &http::HeaderMap) -> bool {
  headers
    .get(CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.starts_with(FORM_CONTENT_TYPE))
}

fn has_request_body(headers: &http::HeaderMap) -> bool {
  if headers.contains_key(TRANSFER_ENCODING) {
    return true;
  }
  headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse::<u64>().ok())
    .is_some_and(|n| n > 0)
}

fn should_forward_header(name: &HeaderName, body_replaced: bool) -> bool {
  if is_hop_by_hop(name) || *name == HOST {
    return false;
  }
  if body_replaced && *name == CONTENT_LENGTH {
    return false;
  }
  true
}

/// RFC 2616 hop-by-hop headers must not cross the proxy.
fn is_hop_by_hop(name: &HeaderName) -> bool {
  matches!(
    name.as_str(),
    "connection"
      | "keep-alive"
      | "proxy-authenticate"
      | "proxy-authorization"
      | "te"
      | "trailers"
      | "transfer-encoding"
      | "upgrade"
  )
}
