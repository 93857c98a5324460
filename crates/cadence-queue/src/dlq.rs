//! Dead-letter queue service
//!
//! Read, requeue and purge operations over jobs whose retry budget ran out.
//! There is no stored reason column: the reason of an entry is always
//! derived from `last_error` by [`derive_reason`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::backend::{
    CreatedRange, DeadLetterFilter, DeadLetterSummary, QueueBackend, QueueError, RequeueOutcome,
};
use crate::job::{Job, JobId};
use crate::retry::StoreRetry;

/// Reason reported for entries with no usable error text
pub const UNKNOWN_REASON: &str = "unknown";

/// First whitespace-delimited token of `last_error`, lower-cased.
///
/// `"network timeout while fetching"` → `"network"`.
pub fn derive_reason(last_error: Option<&str>) -> String {
    last_error
        .and_then(|e| e.split_whitespace().next())
        .map(str::to_lowercase)
        .unwrap_or_else(|| UNKNOWN_REASON.to_string())
}

fn reason_matches(last_error: Option<&str>, needle: Option<&str>) -> bool {
    match needle {
        None => true,
        Some(needle) => derive_reason(last_error).contains(needle),
    }
}

fn normalize_reason(reason: Option<&str>) -> Option<String> {
    reason
        .map(|r| r.trim().to_lowercase())
        .filter(|r| !r.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlqConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub requeue_limit: usize,
    pub purge_limit: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            default_page_size: 25,
            max_page_size: 100,
            requeue_limit: 500,
            purge_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderDir {
    Asc,
    #[default]
    Desc,
}

impl OrderBy {
    /// Sort key of a row; `id` breaks timestamp ties.
    pub fn key(
        self,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        id: JobId,
    ) -> (DateTime<Utc>, JobId) {
        match self {
            OrderBy::CreatedAt => (created_at, id),
            OrderBy::UpdatedAt => (updated_at, id),
        }
    }
}

impl OrderDir {
    pub fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            OrderDir::Asc => ordering,
            OrderDir::Desc => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DeadLetterQuery {
    /// Substring matched against the derived reason
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, rename = "from")]
    pub created_from: Option<DateTime<Utc>>,
    #[serde(default, rename = "to")]
    pub created_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub order_by: OrderBy,
    #[serde(default)]
    pub order_dir: OrderDir,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct DeadLetterEntry {
    pub id: String,
    pub kind: String,
    pub reason: String,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub priority: i32,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for DeadLetterEntry {
    fn from(job: Job) -> Self {
        Self {
            id: job.id.to_string(),
            reason: derive_reason(job.last_error.as_deref()),
            kind: job.kind,
            last_error: job.last_error,
            attempts: job.attempts,
            priority: job.priority,
            payload: job.payload,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct DeadLetterPage {
    pub items: Vec<DeadLetterEntry>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct SkippedId {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct RequeueReport {
    pub requeued: Vec<String>,
    pub skipped: Vec<SkippedId>,
}

/// Purge selectors; exactly one of `ids` / `older_than` must be set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, ToSchema)]
pub struct PurgeRequest {
    #[serde(default)]
    pub ids: Option<Vec<String>>,
    #[serde(default)]
    pub older_than: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct PurgeReport {
    pub purged: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct DlqStats {
    pub total: u64,
    pub by_reason: BTreeMap<String, u64>,
    pub last_24h: u64,
}

pub struct DlqService {
    backend: Arc<dyn QueueBackend>,
    config: DlqConfig,
    store_retry: StoreRetry,
}

impl DlqService {
    pub fn new(backend: Arc<dyn QueueBackend>, config: DlqConfig) -> Self {
        Self {
            backend,
            config,
            store_retry: StoreRetry::default(),
        }
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    async fn summaries(&self, filter: DeadLetterFilter) -> Result<Vec<DeadLetterSummary>, QueueError> {
        self.store_retry
            .execute("dead_letter_summaries", || {
                self.backend.dead_letter_summaries(&filter)
            })
            .await
    }

    /// One page of dead letters. Ordering and paging run in the store; a
    /// reason filter is applied to payload-free summaries first, and only
    /// the rows of the requested page are then loaded in full.
    pub async fn list(&self, query: &DeadLetterQuery) -> Result<DeadLetterPage, QueueError> {
        let page = query.page.unwrap_or(1);
        if page == 0 {
            return Err(QueueError::Validation("page must be >= 1".into()));
        }
        let page_size = query.page_size.unwrap_or(self.config.default_page_size);
        if page_size == 0 || page_size > self.config.max_page_size {
            return Err(QueueError::Validation(format!(
                "page_size must be between 1 and {}",
                self.config.max_page_size
            )));
        }
        if let (Some(from), Some(to)) = (query.created_from, query.created_to) {
            if from > to {
                return Err(QueueError::Validation("'from' must not be after 'to'".into()));
            }
        }

        let range = CreatedRange {
            from: query.created_from,
            to: query.created_to,
        };
        let limit = page_size as usize;
        let offset = (page as usize - 1).saturating_mul(limit);

        let (jobs, total) = match normalize_reason(query.reason.as_deref()) {
            None => {
                self.store_retry
                    .execute("dead_letter_page", || {
                        self.backend.dead_letter_page(
                            range,
                            query.order_by,
                            query.order_dir,
                            limit,
                            offset,
                        )
                    })
                    .await?
            }
            Some(reason) => {
                let mut matching: Vec<DeadLetterSummary> = self
                    .summaries(DeadLetterFilter::Created(range))
                    .await?
                    .into_iter()
                    .filter(|s| reason_matches(s.last_error.as_deref(), Some(&reason)))
                    .collect();
                let key = |s: &DeadLetterSummary| query.order_by.key(s.created_at, s.updated_at, s.id);
                matching.sort_by(|a, b| query.order_dir.apply(key(a).cmp(&key(b))));

                let page_ids: Vec<JobId> = matching
                    .iter()
                    .skip(offset)
                    .take(limit)
                    .map(|s| s.id)
                    .collect();
                let mut jobs = if page_ids.is_empty() {
                    Vec::new()
                } else {
                    self.store_retry
                        .execute("dead_letters_by_ids", || {
                            self.backend.dead_letters_by_ids(&page_ids)
                        })
                        .await?
                };
                jobs.sort_by_key(|j| page_ids.iter().position(|id| *id == j.id));
                (jobs, matching.len() as u64)
            }
        };

        Ok(DeadLetterPage {
            items: jobs.into_iter().map(DeadLetterEntry::from).collect(),
            page,
            page_size,
            total,
        })
    }

    /// Move dead-lettered jobs back to `pending`, visible immediately.
    /// `attempts` is preserved, so a requeued job that fails again is
    /// dead-lettered on its next failure rather than getting a fresh budget.
    ///
    /// A store failure on one id is reported under `skipped` with reason
    /// `store_error`; the remaining ids are still attempted.
    pub async fn requeue(&self, ids: &[String]) -> Result<RequeueReport, QueueError> {
        if ids.is_empty() {
            return Err(QueueError::Validation("ids must not be empty".into()));
        }
        if ids.len() > self.config.requeue_limit {
            return Err(QueueError::Validation(format!(
                "at most {} ids may be requeued per call",
                self.config.requeue_limit
            )));
        }

        let now = Utc::now();
        let mut report = RequeueReport::default();
        for raw in ids {
            let outcome = match raw.trim().parse::<JobId>() {
                Ok(id) => self
                    .store_retry
                    .execute("requeue", || self.backend.requeue_dead_letter(id, now))
                    .await
                    .map_err(|e| {
                        warn!(job_id = id, error = %e, "Requeue failed");
                    }),
                Err(_) => Ok(RequeueOutcome::NotFound),
            };

            let skip_reason = match outcome {
                Ok(RequeueOutcome::Requeued) => {
                    report.requeued.push(raw.clone());
                    continue;
                }
                Ok(RequeueOutcome::AlreadyQueued) => "already_queued",
                Ok(RequeueOutcome::NotDeadLetter) => "not_dead_letter",
                Ok(RequeueOutcome::DuplicateActive) => "duplicate_active",
                Ok(RequeueOutcome::NotFound) => "not_found",
                Err(()) => "store_error",
            };
            report.skipped.push(SkippedId {
                id: raw.clone(),
                reason: skip_reason.to_string(),
            });
        }

        info!(
            requeued = report.requeued.len(),
            skipped = report.skipped.len(),
            "Requeued dead-letter jobs"
        );
        Ok(report)
    }

    pub async fn purge(&self, request: &PurgeRequest) -> Result<PurgeReport, QueueError> {
        let reason = normalize_reason(request.reason.as_deref());

        let filter = match (&request.ids, request.older_than) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(QueueError::Validation(
                    "exactly one of 'ids' or 'older_than' must be provided".into(),
                ));
            }
            (Some(ids), None) => {
                if ids.is_empty() {
                    return Err(QueueError::Validation("ids must not be empty".into()));
                }
                if ids.len() > self.config.purge_limit {
                    return Err(QueueError::Validation(format!(
                        "at most {} ids may be purged per call",
                        self.config.purge_limit
                    )));
                }
                let wanted: BTreeSet<JobId> =
                    ids.iter().filter_map(|s| s.trim().parse().ok()).collect();
                if wanted.is_empty() {
                    return Ok(PurgeReport { purged: 0 });
                }
                DeadLetterFilter::Ids(wanted.into_iter().collect())
            }
            (None, Some(older_than)) => DeadLetterFilter::Created(CreatedRange {
                from: None,
                to: Some(older_than),
            }),
        };

        // Summaries come back oldest first, so the limit keeps the oldest rows
        let candidates: Vec<JobId> = self
            .summaries(filter)
            .await?
            .into_iter()
            .filter(|s| reason_matches(s.last_error.as_deref(), reason.as_deref()))
            .take(self.config.purge_limit)
            .map(|s| s.id)
            .collect();

        if candidates.is_empty() {
            return Ok(PurgeReport { purged: 0 });
        }

        let purged = self
            .store_retry
            .execute("purge", || self.backend.delete_dead_letters(&candidates))
            .await?;
        info!(purged, reason = ?reason, "Purged dead-letter jobs");
        Ok(PurgeReport { purged })
    }

    pub async fn stats(&self) -> Result<DlqStats, QueueError> {
        let since = Utc::now() - Duration::hours(24);
        let rows = self
            .summaries(DeadLetterFilter::Created(CreatedRange::default()))
            .await?;

        let mut stats = DlqStats {
            total: rows.len() as u64,
            ..Default::default()
        };
        for row in &rows {
            *stats
                .by_reason
                .entry(derive_reason(row.last_error.as_deref()))
                .or_insert(0) += 1;
            if row.created_at >= since {
                stats.last_24h += 1;
            }
        }
        Ok(stats)
    }
}
