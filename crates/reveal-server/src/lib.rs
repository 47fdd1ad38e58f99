//! Webhook and HTTP surface for the reveal pipeline.
//!
//! Exposes an axum [`Router`] with the provider callback, a health check, and
//! the JSON API under `/api`, backed by any [`ContactStore`] and
//! [`RevealProvider`].

pub mod auth;
pub mod callback;
pub mod error;
pub mod sweeper;

pub use error::Error;

use std::{path::PathBuf, sync::Arc};

use axum::{
  Router, middleware,
  routing::{get, post},
};
use reveal_api::ApiState;
use reveal_core::store::ContactStore;
use reveal_pipeline::{
  CallbackReceiver, MergeEngine, PipelineConfig, RateLimitError, RevealProvider, Submitter,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use auth::AuthConfig;

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `config.toml`.
#[derive(Deserialize, Clone)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:                  String,
  #[serde(default = "default_port")]
  pub port:                  u16,
  pub store_path:            PathBuf,
  /// Public URL of `POST /callback`, handed to the provider with each batch.
  pub callback_url:          String,
  pub provider_base_url:     String,
  pub provider_api_key:      Option<String>,
  #[serde(default = "default_provider_timeout_secs")]
  pub provider_timeout_secs: u64,
  pub auth_username:         Option<String>,
  pub auth_password_hash:    Option<String>,
  #[serde(default = "default_sweep_interval_secs")]
  pub sweep_interval_secs:   u64,
  #[serde(default)]
  pub pipeline:              PipelineConfig,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8080 }
fn default_provider_timeout_secs() -> u64 { 30 }
fn default_sweep_interval_secs() -> u64 { 60 }

impl ServerConfig {
  /// Credentials guarding `/api`, if both halves are configured.
  pub fn auth_config(&self) -> Option<AuthConfig> {
    match (&self.auth_username, &self.auth_password_hash) {
      (Some(username), Some(password_hash)) => Some(AuthConfig {
        username:      username.clone(),
        password_hash: password_hash.clone(),
      }),
      _ => None,
    }
  }
}

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
pub struct AppState<S, P> {
  pub auth:     Option<Arc<AuthConfig>>,
  pub receiver: Arc<CallbackReceiver<S>>,
  pub api:      ApiState<S, P>,
}

impl<S, P> Clone for AppState<S, P> {
  fn clone(&self) -> Self {
    Self {
      auth:     self.auth.clone(),
      receiver: self.receiver.clone(),
      api:      self.api.clone(),
    }
  }
}

impl<S: ContactStore, P: RevealProvider> AppState<S, P> {
  /// Wire the pipeline: one rate limiter, tracker and merge engine shared by
  /// submission, callbacks and the API.
  ///
  /// Fails if the rate-limit settings cannot describe a bucket.
  pub fn new(store: Arc<S>, provider: P, config: ServerConfig) -> Result<Self, RateLimitError> {
    let pipeline = &config.pipeline;
    let tracker = Arc::new(pipeline.request_tracker());
    let merge = Arc::new(MergeEngine::new(store.clone()));
    let submitter = Submitter::new(
      provider,
      Arc::new(pipeline.rate_limiter()?),
      tracker.clone(),
      pipeline.retry_policy(),
      config.callback_url.clone(),
      pipeline.batch_size(),
    );

    Ok(Self {
      auth:     config.auth_config().map(Arc::new),
      receiver: Arc::new(CallbackReceiver::new(tracker.clone(), merge.clone())),
      api:      ApiState {
        store,
        merge,
        tracker,
        submitter: Arc::new(submitter),
      },
    })
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build the server's axum [`Router`].
pub fn router<S, P>(state: AppState<S, P>) -> Router
where
  S: ContactStore + 'static,
  P: RevealProvider + 'static,
{
  let api = reveal_api::api_router(state.api.clone()).route_layer(
    middleware::from_fn_with_state(state.auth.clone(), auth::require_auth),
  );

  Router::new()
    .route("/callback", post(callback::handler::<S, P>))
    .route("/health",   get(|| async { "ok" }))
    .with_state(state)
    .nest("/api", api)
    .layer(TraceLayer::new_for_http())
}

// ─── Integration tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;

  use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
  use axum::{
    body::Body,
    http::{Request, StatusCode, header},
  };
  use base64::Engine as _;
  use base64::engine::general_purpose::STANDARD as B64;
  use rand_core::OsRng;
  use reveal_core::{request::RequestState, subject::SubjectId};
  use reveal_pipeline::{
    ProviderError,
    provider::{RevealAccepted, RevealRequest},
  };
  use reveal_store_sqlite::SqliteStore;
  use serde_json::Value;
  use tower::ServiceExt as _;

  struct AcceptAll;

  impl RevealProvider for AcceptAll {
    async fn reveal(&self, request: &RevealRequest) -> Result<RevealAccepted, ProviderError> {
      Ok(RevealAccepted { request_id: format!("req-{}", request.subject_ids[0]) })
    }
  }

  fn config(auth: Option<(&str, &str)>) -> ServerConfig {
    let (auth_username, auth_password_hash) = match auth {
      Some((user, password)) => {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
          .hash_password(password.as_bytes(), &salt)
          .unwrap()
          .to_string();
        (Some(user.to_string()), Some(hash))
      }
      None => (None, None),
    };
    ServerConfig {
      host:                  "127.0.0.1".to_string(),
      port:                  8080,
      store_path:            PathBuf::from(":memory:"),
      callback_url:          "http://localhost:8080/callback".to_string(),
      provider_base_url:     "http://provider.invalid".to_string(),
      provider_api_key:      None,
      provider_timeout_secs: 30,
      auth_username,
      auth_password_hash,
      sweep_interval_secs:   60,
      pipeline:              PipelineConfig::default(),
    }
  }

  async fn make_state(auth: Option<(&str, &str)>) -> AppState<SqliteStore, AcceptAll> {
    let store = SqliteStore::open_in_memory().await.unwrap();
    AppState::new(Arc::new(store), AcceptAll, config(auth)).unwrap()
  }

  fn auth_header(user: &str, pass: &str) -> String {
    format!("Basic {}", B64.encode(format!("{user}:{pass}")))
  }

  async fn oneshot_raw(
    state:   AppState<SqliteStore, AcceptAll>,
    method:  &str,
    uri:     &str,
    headers: Vec<(header::HeaderName, &str)>,
    body:    &str,
  ) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (k, v) in headers {
      builder = builder.header(k, v);
    }
    let req  = builder.body(Body::from(body.to_string())).unwrap();
    let resp = router(state).oneshot(req).await.unwrap();
    let status  = resp.status();
    let headers = resp.headers().clone();
    let bytes   = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value   = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, value)
  }

  fn sid(s: &str) -> SubjectId { SubjectId::new(s).unwrap() }

  // ── Health ──────────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn health_is_open() {
    let state = make_state(Some(("user", "secret"))).await;
    let (status, _, _) = oneshot_raw(state, "GET", "/health", vec![], "").await;
    assert_eq!(status, StatusCode::OK);
  }

  // ── Callback ────────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn callback_resolves_and_merges() {
    let state = make_state(None).await;
    state.api.tracker.register("r1", vec![sid("a"), sid("b")]).unwrap();

    let (status, _, body) = oneshot_raw(
      state.clone(),
      "POST",
      "/callback",
      vec![(header::HeaderName::from_static("request-id"), "r1")],
      r#"[{"subjectId": "a", "status": "success", "email": "a@x.com"},
          {"subjectId": "b", "status": "not_found"}]"#,
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["accepted"], 2);
    assert_eq!(body["unknownRequest"], 0);
    assert_eq!(state.api.tracker.get("r1").unwrap().state, RequestState::Resolved);

    let (_, _, contacts) = oneshot_raw(state, "GET", "/api/contacts", vec![], "").await;
    assert_eq!(contacts.as_array().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn callback_for_unknown_request_is_still_accepted() {
    let state = make_state(None).await;
    let (status, _, body) = oneshot_raw(
      state,
      "POST",
      "/callback",
      vec![(header::HeaderName::from_static("x-request-id"), "ghost")],
      r#"[{"subjectId": "a", "status": "success"}, {"nonsense": 1}]"#,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["accepted"], 0);
    assert_eq!(body["unknownRequest"], 1);
    assert_eq!(body["parseErrors"], 1);
  }

  #[tokio::test]
  async fn unreadable_callback_is_400() {
    let state = make_state(None).await;
    let (status, _, body) =
      oneshot_raw(state, "POST", "/callback", vec![], "this is not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("not valid JSON"));
  }

  #[tokio::test]
  async fn callback_does_not_require_auth() {
    let state = make_state(Some(("user", "secret"))).await;
    let (status, _, _) = oneshot_raw(state, "POST", "/callback", vec![], "[]").await;
    assert_eq!(status, StatusCode::ACCEPTED);
  }

  // ── Submit → callback round trip ───────────────────────────────────────────

  #[tokio::test]
  async fn submitted_request_is_settled_by_callback() {
    let state = make_state(None).await;
    let (status, _, summary) = oneshot_raw(
      state.clone(),
      "POST",
      "/api/submit",
      vec![(header::CONTENT_TYPE, "application/json")],
      r#"{"subjectIds": ["s1"]}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["requestIds"][0], "req-s1");

    let (_, _, outcome) = oneshot_raw(
      state.clone(),
      "POST",
      "/callback",
      vec![],
      r#"{"version": 1, "requestId": "req-s1", "results": [{"item": "s1", "status": "ok", "phone": "555"}]}"#,
    )
    .await;
    assert_eq!(outcome["accepted"], 1);

    let (_, _, request) = oneshot_raw(state, "GET", "/api/requests/req-s1", vec![], "").await;
    assert_eq!(request["state"], "resolved");
  }

  // ── Auth ─────────────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn api_requires_credentials_when_configured() {
    let state = make_state(Some(("user", "secret"))).await;

    let (status, headers, _) =
      oneshot_raw(state.clone(), "GET", "/api/requests", vec![], "").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers.contains_key(header::WWW_AUTHENTICATE));

    let wrong = auth_header("user", "wrong");
    let (status, _, _) = oneshot_raw(
      state.clone(),
      "GET",
      "/api/requests",
      vec![(header::AUTHORIZATION, wrong.as_str())],
      "",
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let right = auth_header("user", "secret");
    let (status, _, body) = oneshot_raw(
      state,
      "GET",
      "/api/requests",
      vec![(header::AUTHORIZATION, right.as_str())],
      "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
  }

  #[test]
  fn partial_auth_config_disables_auth() {
    let mut cfg = config(None);
    cfg.auth_username = Some("user".into());
    assert!(cfg.auth_config().is_none());
  }

  #[tokio::test]
  async fn unusable_rate_limit_settings_are_rejected() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());

    let mut cfg = config(None);
    cfg.pipeline.rate_limit_capacity = 0;
    assert!(matches!(
      AppState::new(store.clone(), AcceptAll, cfg),
      Err(RateLimitError::ZeroCapacity)
    ));

    let mut cfg = config(None);
    cfg.pipeline.rate_limit_refill_per_second = -2.0;
    assert!(matches!(
      AppState::new(store, AcceptAll, cfg),
      Err(RateLimitError::InvalidRate(_))
    ));
  }
}
