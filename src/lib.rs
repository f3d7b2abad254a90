//! Core library for wordroot. This module wires together the prompt
//! builder, the completion client and the normalizer behind a small axum
//! router, and maps every failure to a uniform JSON envelope.

pub mod completion;
mod config;
pub mod error;
pub mod normalize;
pub mod prompt;
pub mod telemetry;

pub use config::{AppConfig, RotationConfig};

use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    DefaultBodyLimit, State,
};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, get_service, post};
use axum::{Json, Router};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::services::{ServeDir, ServeFile};

use crate::completion::{CompletionClient, CompletionOptions, OpenAiClient, TransportError};
use crate::error::{error_chain, ErrorBody, QueryError};
use crate::normalize::{normalize_report, Normalized};
use crate::prompt::build_prompt;
use crate::telemetry::{FailureLogFields, TelemetrySink};

pub use crate::normalize::{EtymologyResult, OldestRoot};

/// Response header listing top-level fields that were coerced to strings.
pub const COERCED_HEADER: &str = "x-wordroot-coerced";

/// axum's own limit, applied when no explicit limit is configured.
const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome labels, index aligned with `Metrics::outcome_counts`.
const OUTCOMES: [&str; 8] = [
    "ok",
    "input",
    "payload_too_large",
    "unconfigured",
    "transport",
    "parse",
    "schema",
    "panic",
];

/// Completion latency histogram upper bounds (ms).
const LATENCY_BUCKETS_MS: [u64; 9] = [50, 100, 250, 500, 1000, 2000, 5000, 10_000, 30_000];

pub struct Metrics {
    pub requests_total: AtomicU64,
    outcome_counts: Vec<AtomicU64>,
    pub coerced_fields_total: AtomicU64,
    hist_counts: Vec<AtomicU64>,
    hist_sum_ms: AtomicU64,
    hist_count: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            outcome_counts: OUTCOMES.iter().map(|_| AtomicU64::new(0)).collect(),
            coerced_fields_total: AtomicU64::new(0),
            hist_counts: LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
        }
    }

    fn record_outcome(&self, outcome: &str) {
        if let Some(idx) = OUTCOMES.iter().position(|o| *o == outcome) {
            self.outcome_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn outcome(&self, outcome: &str) -> u64 {
        OUTCOMES
            .iter()
            .position(|o| *o == outcome)
            .map(|idx| self.outcome_counts[idx].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn observe_completion(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.hist_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        // first bucket >= value; larger values only land in +Inf
        if let Some(idx) = LATENCY_BUCKETS_MS.iter().position(|ub| ms <= *ub) {
            self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Application state shared across handlers. The completion client is
/// built once at startup; `None` means no credential was configured.
#[derive(Clone)]
pub struct AppState {
    pub completion: Option<Arc<dyn CompletionClient>>,
    pub completion_options: CompletionOptions,
    pub completion_timeout: Duration,
    pub dev_mode: bool,
    pub static_dir: PathBuf,
    pub max_request_bytes: Option<usize>,
    pub telemetry: TelemetrySink,
    pub metrics: Arc<Metrics>,
    pub process_start_instant: Instant,
}

/// Construct the production completion client from configuration.
/// Returns `None` (and logs) when no credential is available or the HTTP
/// client cannot be built; the server still binds and answers `/query`
/// with a 500.
pub fn completion_from_config(config: &AppConfig) -> Option<Arc<dyn CompletionClient>> {
    let Some(api_key) = config.api_key.as_deref() else {
        tracing::warn!("OPENAI_API_KEY not set; /query will answer 500 until configured");
        return None;
    };
    match OpenAiClient::new(api_key, config.base_url.as_str(), CONNECT_TIMEOUT) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to build completion client; /query disabled");
            None
        }
    }
}

/// Assemble state from parsed configuration and an injected completion
/// client.
pub fn build_state(config: AppConfig, completion: Option<Arc<dyn CompletionClient>>) -> AppState {
    if config.dev_mode {
        tracing::warn!("development mode: error responses include diagnostic details");
    }
    let telemetry = TelemetrySink::from_config(config.log_file.as_deref(), &config.rotation);
    AppState {
        completion,
        completion_options: config.completion_options(),
        completion_timeout: config.completion_timeout(),
        dev_mode: config.dev_mode,
        static_dir: config.static_dir,
        max_request_bytes: config.max_request_bytes,
        telemetry,
        metrics: Arc::new(Metrics::new()),
        process_start_instant: Instant::now(),
    }
}

/// Build state from environment variables, see [`AppConfig::from_env`].
pub fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    let completion = completion_from_config(&config);
    Ok(build_state(config, completion))
}

/// Build the axum router. Unknown paths fall back to files under the
/// static directory.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;
    let index = state.static_dir.join("index.html");
    let metrics = state.metrics.clone();
    let telemetry = state.telemetry.clone();

    let router = Router::new()
        .route("/", get_service(ServeFile::new(index)))
        .route("/query", post(query_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .fallback_service(ServeDir::new(&state.static_dir));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router
        .with_state(state)
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn Any + Send + 'static>| {
                panic_response(&metrics, &telemetry, panic)
            },
        ))
}

/// Fallback for panics that escape a handler. `/query` catches its own
/// panics so those records carry the query text.
fn panic_response(
    metrics: &Metrics,
    telemetry: &TelemetrySink,
    panic: Box<dyn Any + Send + 'static>,
) -> Response {
    let err = QueryError::Panic(panic_message(panic.as_ref()).to_string());
    let report = FailureReport::new(&err, None, None);
    telemetry.emit_failure_blocking(&report.record, &report.fields(&err, None));
    metrics.record_outcome(err.kind());
    err.into_response_with(false)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic payload"
    }
}

/// Handler for `POST /query`. Validates the body, asks the completion
/// client for an etymology and normalises the answer.
async fn query_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let word = match extract_word(payload, state.max_request_bytes) {
        Ok(word) => word,
        Err(Rejected { err, offending }) => {
            return fail(&state, err, offending.as_deref(), None).await
        }
    };

    match AssertUnwindSafe(answer(&state, &word)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let err = QueryError::Panic(panic_message(panic.as_ref()).to_string());
            fail(&state, err, Some(&word), None).await
        }
    }
}

async fn answer(state: &AppState, word: &str) -> Response {
    let raw = match request_completion(state, word).await {
        Ok(raw) => raw,
        Err(err) => return fail(state, err, Some(word), None).await,
    };

    match normalize_report(&raw) {
        Ok(normalized) => respond(state, word, normalized),
        Err(err) => fail(state, err.into(), Some(word), Some(&raw)).await,
    }
}

/// A rejected body, with the `query` value as the client sent it when
/// there was one.
#[derive(Debug)]
struct Rejected {
    err: QueryError,
    offending: Option<String>,
}

impl Rejected {
    fn new(err: QueryError, offending: Option<String>) -> Self {
        Self { err, offending }
    }
}

fn extract_word(
    payload: Result<Json<Value>, JsonRejection>,
    max_request_bytes: Option<usize>,
) -> Result<String, Rejected> {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        ))) => {
            let err = QueryError::PayloadTooLarge {
                limit: max_request_bytes.unwrap_or(DEFAULT_BODY_LIMIT),
            };
            return Err(Rejected::new(err, None));
        }
        Err(rejection) => {
            return Err(Rejected::new(QueryError::Input(rejection.body_text()), None))
        }
    };
    match body.get("query") {
        Some(Value::String(raw)) => {
            let word = raw.trim();
            if word.is_empty() {
                Err(Rejected::new(
                    QueryError::Input("`query` must not be empty".into()),
                    Some(raw.clone()),
                ))
            } else {
                Ok(word.to_string())
            }
        }
        Some(other) => Err(Rejected::new(
            QueryError::Input("`query` must be a string".into()),
            Some(other.to_string()),
        )),
        None => Err(Rejected::new(
            QueryError::Input("missing `query` field".into()),
            None,
        )),
    }
}

async fn request_completion(state: &AppState, word: &str) -> Result<String, QueryError> {
    let client = state.completion.as_ref().ok_or(QueryError::Unconfigured)?;
    let prompt = build_prompt(word);
    let start = Instant::now();
    let outcome = tokio::time::timeout(
        state.completion_timeout,
        client.complete(&prompt, &state.completion_options),
    )
    .await;
    state.metrics.observe_completion(start.elapsed());
    match outcome {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransportError::Timeout {
            ms: state.completion_timeout.as_millis() as u64,
        }
        .into()),
    }
}

fn respond(state: &AppState, word: &str, normalized: Normalized) -> Response {
    state.metrics.record_outcome("ok");
    let Normalized { result, coerced } = normalized;
    let mut response = (StatusCode::OK, Json(result)).into_response();
    if !coerced.is_empty() {
        tracing::warn!(query = %word, fields = ?coerced, "coerced non-string fields in completion");
        state
            .metrics
            .coerced_fields_total
            .fetch_add(coerced.len() as u64, Ordering::Relaxed);
        if let Ok(value) = HeaderValue::from_str(&coerced.join(",")) {
            response.headers_mut().insert(COERCED_HEADER, value);
        }
    }
    response
}

async fn fail(state: &AppState, err: QueryError, query: Option<&str>, raw: Option<&str>) -> Response {
    let report = FailureReport::new(&err, query, raw);
    state
        .telemetry
        .emit_failure(&report.record, &report.fields(&err, query))
        .await;
    state.metrics.record_outcome(err.kind());
    err.into_response_with(state.dev_mode)
}

/// One failure record plus the rendered message and cause chain it was
/// built from.
struct FailureReport {
    record: Value,
    message: String,
    chain: Vec<String>,
}

impl FailureReport {
    fn new(err: &QueryError, query: Option<&str>, raw: Option<&str>) -> Self {
        let message = err.to_string();
        let chain = error_chain(err);
        let backtrace = Backtrace::capture();
        let backtrace =
            (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());
        let record = serde_json::json!({
            "schemaVersion": 1,
            "ts": chrono::Utc::now().to_rfc3339(),
            "kind": err.kind(),
            "status": err.status().as_u16(),
            "query": query,
            "error": &message,
            "chain": &chain,
            "rawCompletion": raw,
            "backtrace": backtrace,
        });
        Self {
            record,
            message,
            chain,
        }
    }

    fn fields<'a>(&'a self, err: &QueryError, query: Option<&'a str>) -> FailureLogFields<'a> {
        FailureLogFields {
            kind: err.kind(),
            status: err.status().as_u16(),
            query,
            error: &self.message,
            chain: &self.chain,
        }
    }
}

/// Health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "completionConfigured": state.completion.is_some(),
        "model": state.completion_options.model,
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    use std::fmt::Write as _;
    let m = &state.metrics;
    let mut buf = String::new();

    writeln!(&mut buf, "# HELP wordroot_requests_total Total /query requests received").ok();
    writeln!(&mut buf, "# TYPE wordroot_requests_total counter").ok();
    writeln!(
        &mut buf,
        "wordroot_requests_total {}",
        m.requests_total.load(Ordering::Relaxed)
    )
    .ok();

    writeln!(&mut buf, "# HELP wordroot_outcomes_total /query outcomes by kind").ok();
    writeln!(&mut buf, "# TYPE wordroot_outcomes_total counter").ok();
    for (idx, outcome) in OUTCOMES.iter().enumerate() {
        writeln!(
            &mut buf,
            "wordroot_outcomes_total{{outcome=\"{}\"}} {}",
            outcome,
            m.outcome_counts[idx].load(Ordering::Relaxed)
        )
        .ok();
    }

    writeln!(
        &mut buf,
        "# HELP wordroot_coerced_fields_total Text fields coerced from non-string JSON"
    )
    .ok();
    writeln!(&mut buf, "# TYPE wordroot_coerced_fields_total counter").ok();
    writeln!(
        &mut buf,
        "wordroot_coerced_fields_total {}",
        m.coerced_fields_total.load(Ordering::Relaxed)
    )
    .ok();

    writeln!(
        &mut buf,
        "# HELP wordroot_failure_records_total Failure records written to LOG_FILE"
    )
    .ok();
    writeln!(&mut buf, "# TYPE wordroot_failure_records_total counter").ok();
    writeln!(
        &mut buf,
        "wordroot_failure_records_total {}",
        state.telemetry.lines_total()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP wordroot_failure_record_errors_total Failure records that could not be written"
    )
    .ok();
    writeln!(&mut buf, "# TYPE wordroot_failure_record_errors_total counter").ok();
    writeln!(
        &mut buf,
        "wordroot_failure_record_errors_total {}",
        state.telemetry.write_errors_total()
    )
    .ok();

    writeln!(
        &mut buf,
        "# HELP wordroot_completion_latency_ms Completion call latency histogram milliseconds"
    )
    .ok();
    writeln!(&mut buf, "# TYPE wordroot_completion_latency_ms histogram").ok();
    let count = m.hist_count.load(Ordering::Relaxed);
    let mut cumulative: u64 = 0;
    for (i, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
        cumulative += m.hist_counts[i].load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "wordroot_completion_latency_ms_bucket{{le=\"{}\"}} {}",
            ub, cumulative
        )
        .ok();
    }
    writeln!(
        &mut buf,
        "wordroot_completion_latency_ms_bucket{{le=\"+Inf\"}} {}",
        count
    )
    .ok();
    writeln!(
        &mut buf,
        "wordroot_completion_latency_ms_sum {}",
        m.hist_sum_ms.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(&mut buf, "wordroot_completion_latency_ms_count {}", count).ok();

    writeln!(
        &mut buf,
        "# HELP wordroot_build_info Build information\n# TYPE wordroot_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "wordroot_build_info{{version=\"{}\",model=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION"),
        state.completion_options.model
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP wordroot_process_uptime_seconds Process uptime seconds\n# TYPE wordroot_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "wordroot_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
