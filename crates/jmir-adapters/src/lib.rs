//! Remote page fetching contract and the remote-issue normalizer.

use async_trait::async_trait;
use jmir_core::{IssueQuery, NormalizedIssue, RemoteIssue, RemoteUser};
use jmir_storage::{FetchError, JiraHttpClient};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "jmir-adapters";

pub const DEFAULT_CLASSIFICATION_FIELD: &str = "customfield_10065";

/// Separator for flattened list fields (labels, worklog entries).
pub const LIST_SEPARATOR: &str = ", ";

/// Retrieves one page of matching issues. A page shorter than `max_results` is the last one.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        query: &IssueQuery,
        start_at: usize,
        max_results: usize,
    ) -> Result<Vec<RemoteIssue>, FetchError>;
}

pub struct JiraSearchAdapter {
    http: JiraHttpClient,
}

impl JiraSearchAdapter {
    pub fn new(http: JiraHttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PageFetcher for JiraSearchAdapter {
    async fn fetch_page(
        &self,
        query: &IssueQuery,
        start_at: usize,
        max_results: usize,
    ) -> Result<Vec<RemoteIssue>, FetchError> {
        let page = self
            .http
            .search_issues(query.as_str(), start_at, max_results)
            .await?;

        // A clamped maxResults makes a full page look short and would end the pass early.
        if page.max_results > 0 && page.max_results < max_results as u64 {
            warn!(
                requested = max_results,
                granted = page.max_results,
                "server clamped page size; aborting the pass"
            );
            return Err(FetchError::PageSizeClamped {
                requested: max_results,
                granted: page.max_results,
            });
        }
        debug!(start_at, returned = page.issues.len(), total = ?page.total, "fetched page");
        Ok(page.issues)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("remote issue {} has no issue key", .issue_id.as_deref().unwrap_or("<unknown id>"))]
    MissingIssueKey { issue_id: Option<String> },
}

/// Maps variable-shaped remote issues onto [`NormalizedIssue`].
#[derive(Debug, Clone)]
pub struct IssueNormalizer {
    classification_field: String,
}

impl Default for IssueNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_CLASSIFICATION_FIELD)
    }
}

impl IssueNormalizer {
    pub fn new(classification_field: impl Into<String>) -> Self {
        Self {
            classification_field: classification_field.into(),
        }
    }

    pub fn classification_field(&self) -> &str {
        &self.classification_field
    }

    /// Missing optional data becomes `None`; only a missing key is an error.
    pub fn normalize(&self, issue: &RemoteIssue) -> Result<NormalizedIssue, NormalizeError> {
        let issue_key = issue
            .key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| NormalizeError::MissingIssueKey {
                issue_id: issue.id.clone(),
            })?
            .to_string();

        let fields = &issue.fields;
        Ok(NormalizedIssue {
            assignee: display_name(fields.assignee.as_ref()),
            assignee_id: fields.assignee.as_ref().and_then(|u| u.account_id.clone()),
            created: fields.created.clone(),
            creator: display_name(fields.creator.as_ref()),
            description: fields.description.as_ref().and_then(text_value),
            due_date: fields.duedate.clone(),
            environment: fields.environment.as_ref().and_then(text_value),
            issue_type: fields.issuetype.as_ref().and_then(|t| t.name.clone()),
            issue_key,
            issue_type_id: fields.issuetype.as_ref().and_then(|t| t.id.clone()),
            labels: fields.labels.as_ref().map(|labels| labels.join(LIST_SEPARATOR)),
            last_viewed: fields.last_viewed.clone(),
            priority: fields.priority.as_ref().and_then(|p| p.name.clone()),
            project: fields.project.as_ref().and_then(|p| p.key.clone()),
            reporter: display_name(fields.reporter.as_ref()),
            resolution: fields.resolution.as_ref().and_then(|r| r.name.clone()),
            resolution_date: fields.resolutiondate.clone(),
            status: fields.status.as_ref().and_then(|s| s.name.clone()),
            summary: fields.summary.clone(),
            updated: fields.updated.clone(),
            original_estimate: fields.timeoriginalestimate.map(|secs| secs.to_string()),
            remaining_estimate: fields.aggregatetimeestimate.map(|secs| secs.to_string()),
            worklog: fields.worklog.as_ref().map(|page| {
                page.worklogs
                    .iter()
                    .map(|entry| {
                        format!(
                            "{}|started:({})",
                            entry.time_spent.as_deref().unwrap_or_default(),
                            entry.started.as_deref().unwrap_or_default()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(LIST_SEPARATOR)
            }),
            time_tracking: fields
                .timetracking
                .as_ref()
                .and_then(|t| t.time_spent.clone()),
            classification: fields
                .extra
                .get(&self.classification_field)
                .and_then(classification_text),
        })
    }
}

fn display_name(user: Option<&RemoteUser>) -> Option<String> {
    user.and_then(|u| u.display_name.clone())
}

/// Plain strings pass through; structured values (e.g. rich-text bodies) become compact JSON.
fn text_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn classification_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Array(items) => Some(
            items
                .iter()
                .filter_map(classification_text)
                .collect::<Vec<_>>()
                .join(LIST_SEPARATOR),
        ),
        JsonValue::Object(map) => map
            .get("value")
            .or_else(|| map.get("name"))
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
    }
}
