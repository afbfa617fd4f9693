//! Local SQLite issue store, content fingerprints, and Jira HTTP utilities.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use jmir_core::{Fingerprint, NormalizedIssue, SearchResponse, StoredIssue, FINGERPRINT_COLUMN, ISSUE_COLUMNS};
use md5::{Digest, Md5};
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "jmir-storage";

pub const ISSUES_TABLE: &str = "issues";

/// Digest over the non-null column values, concatenated in column order.
///
/// Null fields contribute nothing, so a null and an empty string in the same
/// position produce the same fingerprint. Change detection only; MD5 is not
/// used here for integrity or authenticity.
pub fn content_fingerprint(record: &NormalizedIssue) -> Fingerprint {
    let mut hasher = Md5::new();
    for value in record.column_values().into_iter().flatten() {
        hasher.update(value.as_bytes());
    }
    Fingerprint::from_hex(hex::encode(hasher.finalize()))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

fn create_table_sql() -> String {
    let columns = ISSUE_COLUMNS
        .iter()
        .chain(std::iter::once(&FINGERPRINT_COLUMN))
        .map(|c| format!("{c} TEXT"))
        .collect::<Vec<_>>()
        .join(",\n    ");
    format!("CREATE TABLE IF NOT EXISTS {ISSUES_TABLE} (\n    {columns}\n)")
}

fn insert_sql() -> String {
    let columns = ISSUE_COLUMNS
        .iter()
        .chain(std::iter::once(&FINGERPRINT_COLUMN))
        .copied()
        .collect::<Vec<_>>();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {ISSUES_TABLE} ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
}

fn update_sql() -> String {
    let assignments = ISSUE_COLUMNS
        .iter()
        .chain(std::iter::once(&FINGERPRINT_COLUMN))
        .map(|c| format!("{c} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UPDATE {ISSUES_TABLE} SET {assignments} WHERE issue_key = ?")
}

/// The `issues` table. Writes go through an open transaction; the caller commits.
#[derive(Debug, Clone)]
pub struct IssueStore {
    pool: SqlitePool,
}

impl IssueStore {
    /// Open (creating if needed) the database file and ensure the schema exists.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        info!(path = %path.display(), "opened issue store");
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(&create_table_sql()).execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_issue_key ON issues (issue_key)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_md5_hash ON issues (md5_hash)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn fingerprint_exists(
        conn: &mut SqliteConnection,
        fingerprint: &Fingerprint,
    ) -> Result<bool, StoreError> {
        let hit: Option<i64> = sqlx::query_scalar("SELECT 1 FROM issues WHERE md5_hash = ? LIMIT 1")
            .bind(fingerprint.as_str())
            .fetch_optional(&mut *conn)
            .await?;
        Ok(hit.is_some())
    }

    pub async fn issue_key_exists(
        conn: &mut SqliteConnection,
        issue_key: &str,
    ) -> Result<bool, StoreError> {
        let hit: Option<i64> = sqlx::query_scalar("SELECT 1 FROM issues WHERE issue_key = ? LIMIT 1")
            .bind(issue_key)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(hit.is_some())
    }

    pub async fn insert_issue(
        conn: &mut SqliteConnection,
        record: &NormalizedIssue,
        fingerprint: &Fingerprint,
    ) -> Result<(), StoreError> {
        let sql = insert_sql();
        let mut query = sqlx::query(&sql);
        for value in record.column_values() {
            query = query.bind(value);
        }
        query.bind(fingerprint.as_str()).execute(&mut *conn).await?;
        Ok(())
    }

    /// Overwrite every column of the row addressed by `record.issue_key`.
    pub async fn update_issue(
        conn: &mut SqliteConnection,
        record: &NormalizedIssue,
        fingerprint: &Fingerprint,
    ) -> Result<(), StoreError> {
        let sql = update_sql();
        let mut query = sqlx::query(&sql);
        for value in record.column_values() {
            query = query.bind(value);
        }
        query
            .bind(fingerprint.as_str())
            .bind(record.issue_key.as_str())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn get_issue(&self, issue_key: &str) -> Result<Option<StoredIssue>, StoreError> {
        let row = sqlx::query("SELECT * FROM issues WHERE issue_key = ? LIMIT 1")
            .bind(issue_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(stored_issue_from_row).transpose()
    }

    pub async fn count_issues(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM issues")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_rows_for_key(&self, issue_key: &str) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM issues WHERE issue_key = ?")
            .bind(issue_key)
            .fetch_one(&self.pool)
            .await?)
    }
}

fn stored_issue_from_row(row: &SqliteRow) -> Result<StoredIssue, StoreError> {
    let text = |column: &str| row.try_get::<Option<String>, _>(column);
    let record = NormalizedIssue {
        assignee: text("assignee")?,
        assignee_id: text("assignee_id")?,
        created: text("created")?,
        creator: text("creator")?,
        description: text("description")?,
        due_date: text("due_date")?,
        environment: text("environment")?,
        issue_type: text("issue_type")?,
        issue_key: row.try_get("issue_key")?,
        issue_type_id: text("issue_id")?,
        labels: text("labels")?,
        last_viewed: text("last_viewed")?,
        priority: text("priority")?,
        project: text("project")?,
        reporter: text("reporter")?,
        resolution: text("resolution")?,
        resolution_date: text("resolution_date")?,
        status: text("status")?,
        summary: text("summary")?,
        updated: text("updated")?,
        original_estimate: text("original_estimate")?,
        remaining_estimate: text("remaining_estimate")?,
        worklog: text("worklog")?,
        time_tracking: text("time_tracking")?,
        classification: text("isp")?,
    };
    let fingerprint: Option<String> = row.try_get(FINGERPRINT_COLUMN)?;
    Ok(StoredIssue {
        record,
        fingerprint: Fingerprint::from_hex(fingerprint.unwrap_or_default()),
    })
}

pub const SEARCH_PATH: &str = "rest/api/2/search";

#[derive(Clone)]
pub struct JiraCredentials {
    pub email: String,
    pub token: String,
}

impl fmt::Debug for JiraCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JiraCredentials")
            .field("email", &self.email)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Unauthorized,
    RateLimited,
    Other,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        StatusClass::Unauthorized
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        StatusClass::RateLimited
    } else {
        StatusClass::Other
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("authentication rejected (http {status}) for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("rate limited by {url} (retry after {})", .retry_after.as_deref().unwrap_or("unspecified"))]
    RateLimited {
        url: String,
        retry_after: Option<String>,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding search response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("server granted {granted} results per page but {requested} were requested")]
    PageSizeClamped { requested: usize, granted: u64 },
}

/// Thin Jira REST client. One call is one request: no retries.
#[derive(Debug, Clone)]
pub struct JiraHttpClient {
    client: reqwest::Client,
    search_url: String,
    credentials: JiraCredentials,
}

impl JiraHttpClient {
    pub fn new(
        server_url: &str,
        credentials: JiraCredentials,
        config: HttpClientConfig,
    ) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            search_url: search_url_for(server_url),
            credentials,
        })
    }

    pub fn search_url(&self) -> &str {
        &self.search_url
    }

    pub async fn search_issues(
        &self,
        jql: &str,
        start_at: usize,
        max_results: usize,
    ) -> Result<SearchResponse, FetchError> {
        debug!(url = %self.search_url, start_at, max_results, "jira search request");
        let resp = self
            .client
            .get(&self.search_url)
            .basic_auth(&self.credentials.email, Some(&self.credentials.token))
            .header(ACCEPT, "application/json")
            .query(&[
                ("jql", jql.to_string()),
                ("startAt", start_at.to_string()),
                ("maxResults", max_results.to_string()),
                ("fields", "*all".to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let url = resp.url().to_string();
            return Err(match classify_status(status) {
                StatusClass::Unauthorized => FetchError::Unauthorized {
                    status: status.as_u16(),
                    url,
                },
                StatusClass::RateLimited => FetchError::RateLimited {
                    url,
                    retry_after: resp
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                },
                StatusClass::Other => FetchError::HttpStatus {
                    status: status.as_u16(),
                    url,
                },
            });
        }

        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn search_url_for(server_url: &str) -> String {
    format!("{}/{SEARCH_PATH}", server_url.trim_end_matches('/'))
}

pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Best-effort reachability ping sent after a committed pass.
#[derive(Debug, Clone)]
pub struct LivenessPing {
    client: reqwest::Client,
    url: String,
}

impl LivenessPing {
    pub fn new(url: impl Into<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(LIVENESS_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Never fails; the outcome is only logged.
    pub async fn ping(&self) {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(url = %self.url, "pinged health check");
            }
            Ok(resp) => {
                warn!(url = %self.url, status = resp.status().as_u16(), "health check answered with non-success status");
            }
            Err(err) => {
                error!(url = %self.url, error = %err, "health check ping failed");
            }
        }
    }
}
