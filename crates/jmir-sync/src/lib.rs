//! Sync pass orchestration: query window, upsert decisions, and scheduling.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use jmir_adapters::{
    IssueNormalizer, JiraSearchAdapter, NormalizeError, PageFetcher, DEFAULT_CLASSIFICATION_FIELD,
};
use jmir_core::{Fingerprint, IssueQuery, NormalizedIssue};
use jmir_storage::{
    content_fingerprint, FetchError, HttpClientConfig, IssueStore, JiraCredentials, JiraHttpClient,
    LivenessPing, StoreError,
};
use serde::Serialize;
use sqlx::SqliteConnection;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jmir-sync";

pub const DEFAULT_SERVER_URL: &str = "https://quadram-institute.atlassian.net";
pub const DEFAULT_DATABASE: &str = "jira-mirror.db";
pub const DEFAULT_PROJECT: &str = "BSUP";
pub const DEFAULT_WINDOW_DAYS: u32 = 30;
pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub server_url: String,
    pub email: Option<String>,
    pub token: Option<String>,
    pub project: String,
    pub window_days: u32,
    pub page_size: usize,
    pub classification_field: String,
    pub health_check_url: Option<String>,
    pub schedule_minutes: Option<u64>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE),
            server_url: DEFAULT_SERVER_URL.to_string(),
            email: None,
            token: None,
            project: DEFAULT_PROJECT.to_string(),
            window_days: DEFAULT_WINDOW_DAYS,
            page_size: DEFAULT_PAGE_SIZE,
            classification_field: DEFAULT_CLASSIFICATION_FIELD.to_string(),
            health_check_url: None,
            schedule_minutes: None,
            http_timeout_secs: 20,
            user_agent: "jira-mirror/0.1".to_string(),
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    parse_setting(name, env_opt(name))
}

/// Unparsable values are reported and treated as unset.
fn parse_setting<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable setting; using default");
            None
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: env_opt("JMIR_DATABASE")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            server_url: env_opt("JIRA_SERVER").unwrap_or(defaults.server_url),
            email: env_opt("JIRA_EMAIL"),
            token: env_opt("JIRA_TOKEN"),
            project: env_opt("JMIR_PROJECT").unwrap_or(defaults.project),
            window_days: env_parsed("JMIR_DAYS").unwrap_or(defaults.window_days),
            page_size: env_parsed("JMIR_PAGE_SIZE").unwrap_or(defaults.page_size),
            classification_field: env_opt("JMIR_CUSTOM_FIELD")
                .unwrap_or(defaults.classification_field),
            health_check_url: env_opt("HEALTH_CHECK_URL"),
            schedule_minutes: env_parsed("JMIR_SCHEDULE_MINUTES"),
            http_timeout_secs: env_parsed("JMIR_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: env_opt("JMIR_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    /// Checks everything a pass needs before the first remote call.
    pub fn validate(&self) -> Result<JiraCredentials, SyncError> {
        let (Some(email), Some(token)) = (self.email.clone(), self.token.clone()) else {
            return Err(SyncError::Validation(
                "Jira email and token are required (JIRA_EMAIL / JIRA_TOKEN)".to_string(),
            ));
        };
        if self.project.trim().is_empty() {
            return Err(SyncError::Validation("project key must not be empty".to_string()));
        }
        if self.page_size == 0 {
            return Err(SyncError::Validation("page size must be at least 1".to_string()));
        }
        Ok(JiraCredentials { email, token })
    }

    pub fn pass_options(&self) -> PassOptions {
        PassOptions {
            project: self.project.clone(),
            window_days: self.window_days,
            page_size: self.page_size,
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("database_path", &self.database_path)
            .field("server_url", &self.server_url)
            .field("email", &self.email)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("project", &self.project)
            .field("window_days", &self.window_days)
            .field("page_size", &self.page_size)
            .field("classification_field", &self.classification_field)
            .field("health_check_url", &self.health_check_url)
            .field("schedule_minutes", &self.schedule_minutes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    Validation,
    Fetch,
    Write,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid sync input: {0}")]
    Validation(String),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            Self::Validation(_) | Self::Normalize(_) => SyncErrorKind::Validation,
            Self::Fetch(_) => SyncErrorKind::Fetch,
            Self::Store(_) => SyncErrorKind::Write,
        }
    }
}

/// JQL for issues created and updated on or after `now - window_days` in `project`.
pub fn build_issue_query(
    now: DateTime<Utc>,
    window_days: u32,
    project: &str,
) -> Result<IssueQuery, SyncError> {
    let project = project.trim();
    if project.is_empty() {
        return Err(SyncError::Validation("project key must not be empty".to_string()));
    }
    let since = now
        .checked_sub_signed(chrono::Duration::days(i64::from(window_days)))
        .ok_or_else(|| SyncError::Validation(format!("window of {window_days} days is out of range")))?
        .format("%Y-%m-%d");
    Ok(IssueQuery::new(format!(
        "createdDate >= '{since}' AND updated >= '{since}' AND project={project}"
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertDecision {
    Skip,
    Update,
    Insert,
}

impl UpsertDecision {
    /// A matching fingerprint wins regardless of which key it is stored under.
    pub fn from_lookup(fingerprint_present: bool, issue_key_present: bool) -> Self {
        if fingerprint_present {
            Self::Skip
        } else if issue_key_present {
            Self::Update
        } else {
            Self::Insert
        }
    }
}

/// Looks up the fingerprint first and only falls back to the key when it is unseen.
pub async fn decide_upsert(
    conn: &mut SqliteConnection,
    record: &NormalizedIssue,
    fingerprint: &Fingerprint,
) -> Result<UpsertDecision, StoreError> {
    if IssueStore::fingerprint_exists(conn, fingerprint).await? {
        return Ok(UpsertDecision::Skip);
    }
    let key_present = IssueStore::issue_key_exists(conn, &record.issue_key).await?;
    Ok(UpsertDecision::from_lookup(false, key_present))
}

pub async fn apply_upsert(
    conn: &mut SqliteConnection,
    decision: UpsertDecision,
    record: &NormalizedIssue,
    fingerprint: &Fingerprint,
) -> Result<(), StoreError> {
    match decision {
        UpsertDecision::Skip => {
            debug!(issue_key = %record.issue_key, "unchanged; skipping");
        }
        UpsertDecision::Update => {
            info!(issue_key = %record.issue_key, "updating issue");
            IssueStore::update_issue(conn, record, fingerprint).await?;
        }
        UpsertDecision::Insert => {
            info!(issue_key = %record.issue_key, "inserting issue");
            IssueStore::insert_issue(conn, record, fingerprint).await?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PassOptions {
    pub project: String,
    pub window_days: u32,
    pub page_size: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassCounts {
    pub pages_fetched: usize,
    pub issues_seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl PassCounts {
    fn record(&mut self, decision: UpsertDecision) {
        self.issues_seen += 1;
        match decision {
            UpsertDecision::Skip => self.skipped += 1,
            UpsertDecision::Update => self.updated += 1,
            UpsertDecision::Insert => self.inserted += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub project: String,
    #[serde(flatten)]
    pub counts: PassCounts,
}

pub struct SyncPipeline {
    store: IssueStore,
    fetcher: Box<dyn PageFetcher>,
    normalizer: IssueNormalizer,
    options: PassOptions,
    liveness: Option<LivenessPing>,
}

impl SyncPipeline {
    pub fn new(store: IssueStore, fetcher: Box<dyn PageFetcher>, options: PassOptions) -> Self {
        Self {
            store,
            fetcher,
            normalizer: IssueNormalizer::default(),
            options,
            liveness: None,
        }
    }

    /// Validates the config, opens the store, and wires the Jira adapter.
    pub async fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        let credentials = config.validate()?;
        let http = JiraHttpClient::new(
            &config.server_url,
            credentials,
            HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
            },
        )?;
        let liveness = config
            .health_check_url
            .as_deref()
            .map(LivenessPing::new)
            .transpose()?;
        let store = IssueStore::connect(&config.database_path).await?;

        Ok(
            Self::new(store, Box::new(JiraSearchAdapter::new(http)), config.pass_options())
                .with_normalizer(IssueNormalizer::new(config.classification_field.clone()))
                .with_liveness(liveness),
        )
    }

    pub fn with_normalizer(mut self, normalizer: IssueNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_liveness(mut self, liveness: Option<LivenessPing>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn store(&self) -> &IssueStore {
        &self.store
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        self.run_once_at(Utc::now()).await
    }

    /// One full pass. Either every page lands in a single commit or nothing does.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_pass", %run_id, project = %self.options.project);
        self.run_pass(run_id, now).instrument(span).await
    }

    async fn run_pass(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<SyncRunSummary, SyncError> {
        if self.options.page_size == 0 {
            return Err(SyncError::Validation("page size must be at least 1".to_string()));
        }
        let query = build_issue_query(now, self.options.window_days, &self.options.project)?;
        let started_at = Utc::now();
        info!(jql = %query, page_size = self.options.page_size, "starting sync pass");

        let mut tx = self.store.begin().await?;
        let counts = match self.sync_pages(&mut tx, &query).await {
            Ok(counts) => counts,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "explicit rollback failed; transaction dropped");
                }
                error!(error = %err, "sync pass aborted; no changes persisted");
                return Err(err);
            }
        };
        tx.commit().await.map_err(StoreError::from)?;

        let finished_at = Utc::now();
        info!(
            pages = counts.pages_fetched,
            seen = counts.issues_seen,
            inserted = counts.inserted,
            updated = counts.updated,
            skipped = counts.skipped,
            "sync pass completed"
        );

        if let Some(liveness) = &self.liveness {
            liveness.ping().await;
        }

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            project: self.options.project.clone(),
            counts,
        })
    }

    async fn sync_pages(
        &self,
        conn: &mut SqliteConnection,
        query: &IssueQuery,
    ) -> Result<PassCounts, SyncError> {
        let page_size = self.options.page_size;
        let mut counts = PassCounts::default();
        let mut start_at = 0usize;

        loop {
            info!(start_at, end = start_at + page_size, "fetching issues");
            let page = self.fetcher.fetch_page(query, start_at, page_size).await?;
            counts.pages_fetched += 1;

            for issue in &page {
                let record = self.normalizer.normalize(issue)?;
                let fingerprint = content_fingerprint(&record);
                let decision = decide_upsert(conn, &record, &fingerprint).await?;
                apply_upsert(conn, decision, &record, &fingerprint).await?;
                counts.record(decision);
            }

            if page.len() < page_size {
                break;
            }
            start_at += page_size;
        }

        Ok(counts)
    }
}

/// Lets at most one pass run at a time; a pass that finds it busy is skipped, not queued.
#[derive(Debug, Default)]
pub struct SingleRunGuard {
    lock: Mutex<()>,
}

impl SingleRunGuard {
    pub async fn try_run<F: Future>(&self, pass: F) -> Option<F::Output> {
        let _lease = self.lock.try_lock().ok()?;
        Some(pass.await)
    }
}

async fn guarded_pass(pipeline: &SyncPipeline, guard: &SingleRunGuard) {
    match guard.try_run(pipeline.run_once()).await {
        Some(Ok(summary)) => debug!(run_id = %summary.run_id, "scheduled pass finished"),
        Some(Err(err)) => warn!(kind = ?err.kind(), error = %err, "scheduled pass failed; waiting for next tick"),
        None => warn!("previous sync pass still running; skipping this tick"),
    }
}

/// Runs a pass now and then every `every` until Ctrl-C.
pub async fn run_scheduled(config: SyncConfig, every: Duration) -> anyhow::Result<()> {
    let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
    let guard = Arc::new(SingleRunGuard::default());

    guarded_pass(&pipeline, &guard).await;

    let mut sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(every, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let guard = Arc::clone(&guard);
        Box::pin(async move {
            guarded_pass(&pipeline, &guard).await;
        })
    })
    .with_context(|| format!("creating repeating sync job every {}s", every.as_secs()))?;
    sched.add(job).await.context("adding sync job")?;
    sched.start().await.context("starting scheduler")?;
    info!(every_secs = every.as_secs(), "scheduler running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncRunSummary, SyncError> {
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once().await
}
