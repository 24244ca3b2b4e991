//! Gated news refresh: fetch headlines, score them, write the CSV, and record
//! the attempt against the daily budget.

use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::gate::{self, RefreshRecord};
use crate::news::{FetchError, NewsSource};
use crate::record_store::{absent_on_error, PersistenceError, RecordGuard, RecordStore};
use crate::sentiment::{classify_or_unknown, SentimentClassifier};
use crate::sink::{NewsRow, ResultSink, StorageError};

/// User-facing notice for a denied refresh.
pub const LIMIT_REACHED_MESSAGE: &str =
    "Maximum news refreshes reached for today. Please try again tomorrow.";

/// Source of the local wall-clock time.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Local::now().naive_local())
}

/// Failure of the external fetch/score/persist work of an allowed refresh.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("result writer task failed: {0}")]
    Writer(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Succeeded { rows: usize, record: RefreshRecord },
    Failed { error: PipelineError, record: RefreshRecord },
    Denied { refresh_count: u32, max_per_day: u32 },
}

impl RefreshOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            RefreshOutcome::Succeeded { .. } => "succeeded",
            RefreshOutcome::Failed { .. } => "failed",
            RefreshOutcome::Denied { .. } => "denied",
        }
    }

    pub fn message(&self) -> String {
        match self {
            RefreshOutcome::Succeeded { rows, record } => format!(
                "News data updated successfully at {} with refresh count: {} ({} headlines)",
                record.formatted_last_update(),
                record.refresh_count,
                rows
            ),
            RefreshOutcome::Failed { error, .. } => format!("Failed to update news data: {error}"),
            RefreshOutcome::Denied { .. } => LIMIT_REACHED_MESSAGE.to_string(),
        }
    }
}

/// Read-only view of the refresh budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshStatus {
    pub last_update: Option<String>,
    pub refresh_count: u32,
    pub max_per_day: u32,
    pub remaining: u32,
    pub allowed: bool,
}

pub struct RefreshService {
    store: RecordStore,
    max_per_day: u32,
    country: String,
    news: Arc<dyn NewsSource>,
    classifier: Arc<dyn SentimentClassifier>,
    sink: Arc<dyn ResultSink>,
    clock: Clock,
}

impl RefreshService {
    pub fn new(
        store: RecordStore,
        max_per_day: u32,
        country: impl Into<String>,
        news: Arc<dyn NewsSource>,
        classifier: Arc<dyn SentimentClassifier>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            store,
            max_per_day,
            country: country.into(),
            news,
            classifier,
            sink,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_per_day(&self) -> u32 {
        self.max_per_day
    }

    /// Whether a refresh would be admitted right now.
    pub async fn may_refresh(&self) -> bool {
        let record = self.store.load_or_absent().await;
        gate::may_refresh(record.as_ref(), (self.clock)(), self.max_per_day)
    }

    pub async fn status(&self) -> RefreshStatus {
        let record = self.store.load_or_absent().await;
        let now = (self.clock)();
        let refresh_count = record
            .as_ref()
            .map(|r| r.effective_count(now.date()))
            .unwrap_or(0);
        RefreshStatus {
            last_update: record.as_ref().map(RefreshRecord::formatted_last_update),
            refresh_count,
            max_per_day: self.max_per_day,
            remaining: self.max_per_day.saturating_sub(refresh_count),
            allowed: gate::may_refresh(record.as_ref(), now, self.max_per_day),
        }
    }

    /// Run one refresh if the daily budget allows it. The attempt is recorded
    /// whether or not the fetch/score/write work succeeds; only failure to
    /// save the record is returned as an error.
    pub async fn do_refresh_if_allowed(&self) -> Result<RefreshOutcome, RefreshError> {
        let guard = self.store.lock().await?;
        let record = absent_on_error(guard.load().await);
        let now = (self.clock)();

        if !gate::may_refresh(record.as_ref(), now, self.max_per_day) {
            let refresh_count = record
                .as_ref()
                .map(|r| r.effective_count(now.date()))
                .unwrap_or(0);
            info!(refresh_count, max_per_day = self.max_per_day, "news refresh denied");
            return Ok(RefreshOutcome::Denied {
                refresh_count,
                max_per_day: self.max_per_day,
            });
        }

        let result = self.run_pipeline_holding(&guard).await;

        // Count from what is on disk now, not from the snapshot taken before the pipeline.
        let latest = absent_on_error(guard.load().await);
        let updated = gate::record_refresh(latest.as_ref(), (self.clock)());
        guard.save(&updated).await?;

        Ok(match result {
            Ok(rows) => {
                info!(rows, refresh_count = updated.refresh_count, "news refresh succeeded");
                RefreshOutcome::Succeeded { rows, record: updated }
            }
            Err(error) => {
                error!(%error, refresh_count = updated.refresh_count, "news refresh failed");
                RefreshOutcome::Failed { error, record: updated }
            }
        })
    }

    /// Run the pipeline while keeping the record lock fresh.
    async fn run_pipeline_holding(&self, guard: &RecordGuard<'_>) -> Result<usize, PipelineError> {
        let pipeline = self.run_pipeline();
        tokio::pin!(pipeline);
        let mut heartbeat = tokio::time::interval(self.store.heartbeat_period());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut pipeline => return result,
                _ = heartbeat.tick() => {
                    if let Err(e) = guard.touch().await {
                        warn!(%e, "could not refresh the record lock");
                    }
                }
            }
        }
    }

    async fn run_pipeline(&self) -> Result<usize, PipelineError> {
        let headlines = self.news.fetch_top_headlines(&self.country).await?;

        let mut rows = Vec::with_capacity(headlines.len());
        for headline in headlines {
            let sentiment = classify_or_unknown(self.classifier.as_ref(), &headline.title).await;
            rows.push(NewsRow {
                headline: headline.title,
                sentiment_label: sentiment.label,
                sentiment_score: sentiment.score,
            });
        }

        let count = rows.len();
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || sink.write_rows(&rows)).await??;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::TIMESTAMP_FORMAT;
    use crate::news::Headline;
    use crate::sentiment::{ClassificationError, Sentiment};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct CountingNews {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl NewsSource for CountingNews {
        async fn fetch_top_headlines(&self, country_code: &str) -> Result<Vec<Headline>, FetchError> {
            assert_eq!(country_code, "us");
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(FetchError::Api {
                    code: "rateLimited".to_string(),
                    message: "too many requests".to_string(),
                });
            }
            Ok(vec![
                Headline { title: "Apple posts record revenue".to_string() },
                Headline { title: "classifier will fail here".to_string() },
            ])
        }
    }

    struct ScriptedClassifier;

    #[async_trait::async_trait]
    impl SentimentClassifier for ScriptedClassifier {
        async fn classify_all(&self, text: &str) -> Result<Vec<Sentiment>, ClassificationError> {
            if text.contains("fail") {
                return Err(ClassificationError::Timeout(1));
            }
            Ok(vec![Sentiment { label: "POSITIVE".to_string(), score: 0.99 }])
        }
    }

    #[derive(Default)]
    struct MemorySink {
        rows: Mutex<Vec<NewsRow>>,
    }

    impl ResultSink for MemorySink {
        fn write_rows(&self, rows: &[NewsRow]) -> Result<(), StorageError> {
            *self.rows.lock().unwrap() = rows.to_vec();
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        info: PathBuf,
        news: Arc<CountingNews>,
        sink: Arc<MemorySink>,
        now: Arc<Mutex<NaiveDateTime>>,
        service: RefreshService,
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
    }

    fn fixture(fail_fetch: bool, start: &str) -> Fixture {
        fixture_with(fail_fetch, Duration::ZERO, Duration::from_secs(300), start)
    }

    fn fixture_with(fail_fetch: bool, fetch_delay: Duration, stale_after: Duration, start: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let info = dir.path().join("news_update_info.txt");
        let news = Arc::new(CountingNews {
            calls: AtomicUsize::new(0),
            fail: fail_fetch,
            delay: fetch_delay,
        });
        let sink = Arc::new(MemorySink::default());
        let now = Arc::new(Mutex::new(at(start)));
        let clock_now = now.clone();

        let service = RefreshService::new(
            RecordStore::new(&info).with_stale_after(stale_after),
            2,
            "us",
            news.clone(),
            Arc::new(ScriptedClassifier),
            sink.clone(),
        )
        .with_clock(Arc::new(move || *clock_now.lock().unwrap()));

        Fixture { _dir: dir, info, news, sink, now, service }
    }

    #[tokio::test]
    async fn two_refreshes_then_denied_without_fetching() {
        let f = fixture(false, "2025-03-17 09:00:00");

        assert!(f.service.may_refresh().await);
        let first = f.service.do_refresh_if_allowed().await.unwrap();
        assert!(matches!(first, RefreshOutcome::Succeeded { rows: 2, record } if record.refresh_count == 1));

        assert!(f.service.may_refresh().await);
        let second = f.service.do_refresh_if_allowed().await.unwrap();
        assert!(matches!(second, RefreshOutcome::Succeeded { record, .. } if record.refresh_count == 2));

        assert!(!f.service.may_refresh().await);
        let third = f.service.do_refresh_if_allowed().await.unwrap();
        assert!(matches!(third, RefreshOutcome::Denied { refresh_count: 2, max_per_day: 2 }));
        assert_eq!(third.message(), LIMIT_REACHED_MESSAGE);

        assert_eq!(f.news.calls.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read_to_string(&f.info).unwrap(), "2025-03-17 09:00:00\n2");
    }

    #[tokio::test]
    async fn classifier_failure_records_unknown_row() {
        let f = fixture(false, "2025-03-17 09:00:00");
        f.service.do_refresh_if_allowed().await.unwrap();

        let rows = f.sink.rows.lock().unwrap().clone();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sentiment_label, "POSITIVE");
        assert_eq!(rows[1].headline, "classifier will fail here");
        assert_eq!(rows[1].sentiment_label, "UNKNOWN");
        assert_eq!(rows[1].sentiment_score, 0.0);
    }

    #[tokio::test]
    async fn failed_fetch_still_counts_as_attempt() {
        let f = fixture(true, "2025-03-17 09:00:00");

        let outcome = f.service.do_refresh_if_allowed().await.unwrap();
        assert!(matches!(
            outcome,
            RefreshOutcome::Failed { error: PipelineError::Fetch(_), record } if record.refresh_count == 1
        ));
        assert!(f.sink.rows.lock().unwrap().is_empty());
        assert_eq!(f.service.status().await.refresh_count, 1);
    }

    #[tokio::test]
    async fn yesterdays_full_budget_is_reset() {
        let f = fixture(false, "2025-03-17 10:00:00");
        std::fs::write(&f.info, "2025-03-16 18:00:00\n2").unwrap();

        let status = f.service.status().await;
        assert_eq!(status.refresh_count, 0);
        assert_eq!(status.remaining, 2);
        assert!(status.allowed);

        let outcome = f.service.do_refresh_if_allowed().await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Succeeded { record, .. }
            if record.refresh_count == 1 && record.last_update == at("2025-03-17 10:00:00")));
    }

    #[tokio::test]
    async fn corrupt_record_fails_open() {
        let f = fixture(false, "2025-03-17 10:00:00");
        std::fs::write(&f.info, "not-a-date\nabc").unwrap();

        assert!(f.service.may_refresh().await);
        f.service.do_refresh_if_allowed().await.unwrap();
        assert_eq!(std::fs::read_to_string(&f.info).unwrap(), "2025-03-17 10:00:00\n1");
    }

    #[tokio::test]
    async fn budget_returns_after_midnight() {
        let f = fixture(false, "2025-03-17 22:00:00");
        f.service.do_refresh_if_allowed().await.unwrap();
        f.service.do_refresh_if_allowed().await.unwrap();
        assert!(!f.service.may_refresh().await);

        *f.now.lock().unwrap() = at("2025-03-18 00:00:01");
        assert!(f.service.may_refresh().await);
        let status = f.service.status().await;
        assert_eq!(status.last_update.as_deref(), Some("2025-03-17 22:00:00"));
        assert_eq!(status.remaining, 2);
    }

    #[tokio::test]
    async fn concurrent_refresh_is_refused_while_locked() {
        let f = fixture(false, "2025-03-17 09:00:00");
        let lock_path = PathBuf::from(format!("{}.lock", f.info.display()));
        std::fs::write(&lock_path, "4242\n").unwrap();

        let err = f.service.do_refresh_if_allowed().await.unwrap_err();
        assert!(matches!(err, RefreshError::Persistence(PersistenceError::Locked { .. })));
        assert_eq!(f.news.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_outlasting_stale_threshold_keeps_its_lock() {
        let f = fixture_with(false, Duration::from_millis(700), Duration::from_millis(300), "2025-03-17 09:00:00");

        let first = f.service.do_refresh_if_allowed();
        let second = async {
            tokio::time::sleep(Duration::from_millis(450)).await;
            f.service.do_refresh_if_allowed().await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(matches!(first.unwrap(), RefreshOutcome::Succeeded { record, .. } if record.refresh_count == 1));
        assert!(matches!(second, Err(RefreshError::Persistence(PersistenceError::Locked { .. }))));
        assert_eq!(std::fs::read_to_string(&f.info).unwrap(), "2025-03-17 09:00:00\n1");

        let third = f.service.do_refresh_if_allowed().await.unwrap();
        assert!(matches!(third, RefreshOutcome::Succeeded { record, .. } if record.refresh_count == 2));
        let fourth = f.service.do_refresh_if_allowed().await.unwrap();
        assert!(matches!(fourth, RefreshOutcome::Denied { .. }));
        assert_eq!(f.news.calls.load(Ordering::SeqCst), 2);
    }
}
