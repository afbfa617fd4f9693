//! Core issue model shared by the fetch, normalize and store stages.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "jmir-core";

/// Persisted column names, in fingerprint order. The fingerprint column follows.
pub const ISSUE_COLUMNS: [&str; 25] = [
    "assignee",
    "assignee_id",
    "created",
    "creator",
    "description",
    "due_date",
    "environment",
    "issue_type",
    "issue_key",
    "issue_id",
    "labels",
    "last_viewed",
    "priority",
    "project",
    "reporter",
    "resolution",
    "resolution_date",
    "status",
    "summary",
    "updated",
    "original_estimate",
    "remaining_estimate",
    "worklog",
    "time_tracking",
    "isp",
];

pub const FINGERPRINT_COLUMN: &str = "md5_hash";

/// One page of `/rest/api/2/search`. `total` is informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    #[serde(default)]
    pub start_at: u64,
    #[serde(default)]
    pub max_results: u64,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub issues: Vec<RemoteIssue>,
}

/// An issue exactly as the remote returned it. Everything except the envelope is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RemoteIssue {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub fields: RemoteFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RemoteFields {
    #[serde(default)]
    pub assignee: Option<RemoteUser>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub creator: Option<RemoteUser>,
    #[serde(default)]
    pub description: Option<JsonValue>,
    #[serde(default)]
    pub duedate: Option<String>,
    #[serde(default)]
    pub environment: Option<JsonValue>,
    #[serde(default)]
    pub issuetype: Option<RemoteIssueType>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default, rename = "lastViewed")]
    pub last_viewed: Option<String>,
    #[serde(default)]
    pub priority: Option<RemoteNamed>,
    #[serde(default)]
    pub project: Option<RemoteProject>,
    #[serde(default)]
    pub reporter: Option<RemoteUser>,
    #[serde(default)]
    pub resolution: Option<RemoteNamed>,
    #[serde(default)]
    pub resolutiondate: Option<String>,
    #[serde(default)]
    pub status: Option<RemoteNamed>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub timeoriginalestimate: Option<i64>,
    #[serde(default)]
    pub aggregatetimeestimate: Option<i64>,
    #[serde(default)]
    pub worklog: Option<RemoteWorklogPage>,
    #[serde(default)]
    pub timetracking: Option<RemoteTimeTracking>,
    /// Custom fields and anything else the model does not name.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteIssueType {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteNamed {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteProject {
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteWorklogPage {
    #[serde(default)]
    pub worklogs: Vec<RemoteWorklog>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoteWorklog {
    #[serde(default)]
    pub time_spent: Option<String>,
    #[serde(default)]
    pub started: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTimeTracking {
    #[serde(default)]
    pub time_spent: Option<String>,
}

/// Fixed-shape issue row. Field order matches [`ISSUE_COLUMNS`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NormalizedIssue {
    pub assignee: Option<String>,
    pub assignee_id: Option<String>,
    pub created: Option<String>,
    pub creator: Option<String>,
    pub description: Option<String>,
    pub due_date: Option<String>,
    pub environment: Option<String>,
    pub issue_type: Option<String>,
    pub issue_key: String,
    /// Stored in the `issue_id` column.
    pub issue_type_id: Option<String>,
    pub labels: Option<String>,
    pub last_viewed: Option<String>,
    pub priority: Option<String>,
    pub project: Option<String>,
    pub reporter: Option<String>,
    pub resolution: Option<String>,
    pub resolution_date: Option<String>,
    pub status: Option<String>,
    pub summary: Option<String>,
    pub updated: Option<String>,
    pub original_estimate: Option<String>,
    pub remaining_estimate: Option<String>,
    pub worklog: Option<String>,
    pub time_tracking: Option<String>,
    /// Stored in the `isp` column.
    pub classification: Option<String>,
}

impl NormalizedIssue {
    pub fn new(issue_key: impl Into<String>) -> Self {
        Self {
            issue_key: issue_key.into(),
            ..Default::default()
        }
    }

    /// Values in column order; `None` is SQL NULL.
    pub fn column_values(&self) -> [Option<&str>; 25] {
        [
            self.assignee.as_deref(),
            self.assignee_id.as_deref(),
            self.created.as_deref(),
            self.creator.as_deref(),
            self.description.as_deref(),
            self.due_date.as_deref(),
            self.environment.as_deref(),
            self.issue_type.as_deref(),
            Some(self.issue_key.as_str()),
            self.issue_type_id.as_deref(),
            self.labels.as_deref(),
            self.last_viewed.as_deref(),
            self.priority.as_deref(),
            self.project.as_deref(),
            self.reporter.as_deref(),
            self.resolution.as_deref(),
            self.resolution_date.as_deref(),
            self.status.as_deref(),
            self.summary.as_deref(),
            self.updated.as_deref(),
            self.original_estimate.as_deref(),
            self.remaining_estimate.as_deref(),
            self.worklog.as_deref(),
            self.time_tracking.as_deref(),
            self.classification.as_deref(),
        ]
    }
}

/// Content fingerprint for change detection. Not a security hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted issue row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIssue {
    pub record: NormalizedIssue,
    pub fingerprint: Fingerprint,
}

/// JQL filter expression handed to the page fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueQuery(String);

impl IssueQuery {
    pub fn new(jql: impl Into<String>) -> Self {
        Self(jql.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssueQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
