use std::sync::Arc;

use chrono::NaiveDateTime;
use mockito::Matcher;
use serde_json::json;
use tickerpulse::news::NewsApiSource;
use tickerpulse::record_store::RecordStore;
use tickerpulse::refresh::{RefreshOutcome, RefreshService, LIMIT_REACHED_MESSAGE};
use tickerpulse::sentiment::inference::InferenceClassifier;
use tickerpulse::sink::{read_news_rows, CsvNewsSink};

fn fixed_clock(ts: &str) -> Arc<dyn Fn() -> NaiveDateTime + Send + Sync> {
    let now = NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S").expect("valid timestamp");
    Arc::new(move || now)
}

#[tokio::test]
async fn test_refresh_writes_csv_and_enforces_daily_limit() {
    let mut server = mockito::Server::new_async().await;

    let news_mock = server
        .mock("GET", "/v2/top-headlines")
        .match_query(Matcher::UrlEncoded("country".into(), "us".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"status":"ok","totalResults":2,"articles":[
                {"title":"Apple posts record revenue"},
                {"title":"Markets slide on rate fears"}
            ]}"#,
        )
        .expect(2)
        .create_async()
        .await;

    let positive = server
        .mock("POST", "/models/sst2")
        .match_body(Matcher::Json(json!({"inputs": "Apple posts record revenue"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[[{"label":"NEGATIVE","score":0.02},{"label":"POSITIVE","score":0.98}]]"#)
        .expect(2)
        .create_async()
        .await;

    // Model still loading: the headline is kept with the UNKNOWN sentinel
    let loading = server
        .mock("POST", "/models/sst2")
        .match_body(Matcher::Json(json!({"inputs": "Markets slide on rate fears"})))
        .with_status(503)
        .with_body(r#"{"error":"Model sst2 is currently loading"}"#)
        .expect(2)
        .create_async()
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let info = dir.path().join("data").join("news_update_info.txt");
    let csv_path = dir.path().join("data").join("integrated_news_data.csv");

    let news = NewsApiSource::new(format!("{}/v2/top-headlines", server.url()), "test-key", 5)
        .expect("news client")
        .with_retries(1);
    let classifier = InferenceClassifier::new(&format!("{}/models", server.url()), "sst2", None).with_timeout(5);

    let service = RefreshService::new(
        RecordStore::new(&info),
        2,
        "us",
        Arc::new(news),
        Arc::new(classifier),
        Arc::new(CsvNewsSink::new(&csv_path)),
    )
    .with_clock(fixed_clock("2025-03-17 09:30:00"));

    let first = service.do_refresh_if_allowed().await.expect("first refresh");
    assert_eq!(first.kind(), "succeeded");
    assert_eq!(
        first.message(),
        "News data updated successfully at 2025-03-17 09:30:00 with refresh count: 1 (2 headlines)"
    );

    let rows = read_news_rows(&csv_path).expect("news csv");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].headline, "Apple posts record revenue");
    assert_eq!(rows[0].sentiment_label, "POSITIVE");
    assert!((rows[0].sentiment_score - 0.98).abs() < 1e-9);
    assert_eq!(rows[1].sentiment_label, "UNKNOWN");
    assert_eq!(rows[1].sentiment_score, 0.0);

    let second = service.do_refresh_if_allowed().await.expect("second refresh");
    assert!(matches!(second, RefreshOutcome::Succeeded { record, .. } if record.refresh_count == 2));

    let third = service.do_refresh_if_allowed().await.expect("third refresh");
    assert!(matches!(third, RefreshOutcome::Denied { refresh_count: 2, max_per_day: 2 }));
    assert_eq!(third.message(), LIMIT_REACHED_MESSAGE);

    assert_eq!(std::fs::read_to_string(&info).expect("info file"), "2025-03-17 09:30:00\n2");
    assert!(!dir.path().join("data").join("news_update_info.txt.lock").exists());

    news_mock.assert_async().await;
    positive.assert_async().await;
    loading.assert_async().await;
}

#[tokio::test]
async fn test_failed_fetch_consumes_budget_and_keeps_old_csv() {
    let mut server = mockito::Server::new_async().await;
    let news_mock = server
        .mock("GET", "/v2/top-headlines")
        .match_query(Matcher::Any)
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status":"error","code":"apiKeyInvalid","message":"Your API key is invalid"}"#)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let info = dir.path().join("news_update_info.txt");
    let csv_path = dir.path().join("news.csv");
    std::fs::write(&csv_path, "headline,sentiment_label,sentiment_score\nOld story,POSITIVE,0.9\n").expect("seed csv");
    std::fs::write(&info, "2025-03-17 08:00:00\n1").expect("seed record");

    let news = NewsApiSource::new(format!("{}/v2/top-headlines", server.url()), "bad-key", 5)
        .expect("news client")
        .with_retries(3);
    let classifier = InferenceClassifier::new(&server.url(), "unused", None);

    let service = RefreshService::new(
        RecordStore::new(&info),
        2,
        "us",
        Arc::new(news),
        Arc::new(classifier),
        Arc::new(CsvNewsSink::new(&csv_path)),
    )
    .with_clock(fixed_clock("2025-03-17 12:00:00"));

    let outcome = service.do_refresh_if_allowed().await.expect("refresh recorded");
    assert_eq!(outcome.kind(), "failed");
    assert!(outcome.message().starts_with("Failed to update news data:"));

    let status = service.status().await;
    assert_eq!(status.refresh_count, 2);
    assert_eq!(status.remaining, 0);
    assert!(!status.allowed);
    assert_eq!(status.last_update.as_deref(), Some("2025-03-17 12:00:00"));

    let rows = read_news_rows(&csv_path).expect("old csv kept");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].headline, "Old story");

    news_mock.assert_async().await;
}
