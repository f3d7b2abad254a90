#[path = "common/mod.rs"]
mod common;

use common::{client_of, spawn_app, StubCompletion, NIGHT};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::fs;
use wordroot::AppConfig;

#[tokio::test]
async fn serves_index_and_static_assets() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("index.html"), "<h1>wordroot test page</h1>").unwrap();
    fs::write(dir.path().join("app.css"), "body { color: black; }").unwrap();
    let config = AppConfig {
        static_dir: dir.path().to_path_buf(),
        ..AppConfig::default()
    };
    let (base, handle) = spawn_app(config, None).await;
    let client = Client::new();

    let resp = client.get(format!("{}/", base)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .starts_with("text/html"));
    assert!(resp.text().await.unwrap().contains("wordroot test page"));

    let css = client.get(format!("{}/app.css", base)).send().await.unwrap();
    assert_eq!(css.status(), StatusCode::OK);

    let missing = client.get(format!("{}/nope.js", base)).send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    handle.abort();
}

#[tokio::test]
async fn healthz_reports_configuration() {
    let stub = StubCompletion::text(NIGHT);
    let (base, handle) = spawn_app(AppConfig::default(), client_of(&stub)).await;
    let body: Value = Client::new()
        .get(format!("{}/healthz", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    handle.abort();
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["completionConfigured"], json!(true));
    assert_eq!(body["model"], json!(AppConfig::default().model));

    let (base, handle) = spawn_app(AppConfig::default(), None).await;
    let body: Value = Client::new()
        .get(format!("{}/healthz", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    handle.abort();
    assert_eq!(body["completionConfigured"], json!(false));
}

#[tokio::test]
async fn metrics_count_outcomes_and_latency() {
    let stub = StubCompletion::text(
        r#"{"oldest_root":{"word":"w","pronunciation":"p","language":"l","meaning":"m"},"evolution":{"stage":"one"},"related_words":["a"]}"#,
    );
    let state = wordroot::build_state(AppConfig::default(), client_of(&stub));
    let metrics = state.metrics.clone();
    let (base, handle) = common::serve(state).await;
    let client = Client::new();

    for body in [json!({"query": "night"}), json!({"query": "day"}), json!({"query": ""})] {
        let _ = client
            .post(format!("{}/query", base))
            .json(&body)
            .send()
            .await
            .unwrap();
    }

    let resp = client.get(format!("{}/metrics", base)).send().await.unwrap();
    assert!(resp.status().is_success());
    let text = resp.text().await.unwrap();
    handle.abort();

    assert!(text.contains("wordroot_requests_total 3"));
    assert!(text.contains("wordroot_outcomes_total{outcome=\"ok\"} 2"));
    assert!(text.contains("wordroot_outcomes_total{outcome=\"input\"} 1"));
    assert!(text.contains("wordroot_coerced_fields_total 4"));
    assert!(text.contains("wordroot_completion_latency_ms_bucket{le=\"+Inf\"} 2"));
    assert!(text.contains("wordroot_completion_latency_ms_count 2"));
    assert_eq!(
        text.matches("# HELP wordroot_completion_latency_ms ").count(),
        1
    );
    assert_eq!(metrics.outcome("ok"), 2);

    for line in text.lines().filter(|l| l.starts_with("# TYPE ")) {
        let name = line.split_whitespace().nth(2).unwrap();
        assert!(
            text.contains(&format!("# HELP {} ", name)),
            "{name} has no HELP line"
        );
    }
}
