//! Report retrieval with a bulk query fallback.
//!
//! The Analytics endpoint silently caps detail rows. [`FetchController`]
//! treats a report that comes back at or above the row threshold as
//! truncated and re-reads the data through a Bulk API 2.0 query registered
//! for that report.

use crate::auth::SessionManager;
use crate::bulkapi::query::QueryClient;
use crate::bulkapi::{Client as BulkClient, CreateQueryJobRequest, JobState};
use crate::error::Error;
use crate::http::Api;
use crate::reports::ReportReader;
use crate::session::Session;
use crate::tabular::TabularResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lookup of the SOQL query that reproduces a report's data.
pub trait FallbackQueries: Send + Sync {
    /// Returns the fallback query for `report_id`, if one is registered.
    fn fallback_query(&self, report_id: &str) -> Option<String>;
}

impl<Q: FallbackQueries + ?Sized> FallbackQueries for Arc<Q> {
    fn fallback_query(&self, report_id: &str) -> Option<String> {
        (**self).fallback_query(report_id)
    }
}

impl FallbackQueries for HashMap<String, String> {
    fn fallback_query(&self, report_id: &str) -> Option<String> {
        self.get(report_id).cloned()
    }
}

/// Fixed report id to SOQL mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticFallbackQueries {
    queries: HashMap<String, String>,
}

impl StaticFallbackQueries {
    /// Creates an empty mapping. Every capped report is unmapped until a
    /// query is registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `soql` for `report_id`, replacing any earlier entry.
    pub fn with(mut self, report_id: impl Into<String>, soql: impl Into<String>) -> Self {
        self.insert(report_id, soql);
        self
    }

    /// In-place form of [`with`](Self::with).
    pub fn insert(&mut self, report_id: impl Into<String>, soql: impl Into<String>) {
        self.queries.insert(report_id.into(), soql.into());
    }

    /// Number of mapped reports.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StaticFallbackQueries {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            queries: iter
                .into_iter()
                .map(|(report_id, soql)| (report_id.into(), soql.into()))
                .collect(),
        }
    }
}

impl FallbackQueries for StaticFallbackQueries {
    fn fallback_query(&self, report_id: &str) -> Option<String> {
        self.queries.get(report_id).cloned()
    }
}

/// Tuning for [`FetchController`]. Missing fields take their defaults when
/// deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Row count at which a report is treated as capped.
    pub row_threshold: usize,
    /// Pause between job status checks. Values below 100 ms are raised to
    /// 100 ms, so `0` polls as fast as allowed.
    pub poll_interval_secs: u64,
    /// Upper bound on waiting for the fallback job.
    pub poll_timeout_secs: u64,
}

impl FetchOptions {
    /// [`poll_interval_secs`](Self::poll_interval_secs) as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// [`poll_timeout_secs`](Self::poll_timeout_secs) as a [`Duration`].
    /// Very large values such as `u64::MAX` mean no deadline.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            row_threshold: crate::DEFAULT_ROW_THRESHOLD,
            poll_interval_secs: crate::DEFAULT_POLL_INTERVAL_SECS,
            poll_timeout_secs: crate::DEFAULT_POLL_TIMEOUT_SECS,
        }
    }
}

/// Chooses between the report endpoint and a bulk query per request.
///
/// One working session is carried through the whole fetch, so a refresh
/// during the report read is reused by the bulk job.
#[derive(Clone, Debug)]
pub struct FetchController<Q = StaticFallbackQueries> {
    reports: ReportReader,
    bulk: QueryClient,
    fallbacks: Q,
    options: FetchOptions,
}

impl<Q: FallbackQueries> FetchController<Q> {
    /// Creates a controller with default [`FetchOptions`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::HttpClientBuild`] if the HTTP client cannot be built.
    pub fn new(manager: SessionManager, fallbacks: Q) -> Result<Self, Error> {
        let api = Api::new(manager)?;
        Ok(Self {
            reports: ReportReader::from_api(api.clone()),
            bulk: BulkClient::from_api(api).query(),
            fallbacks,
            options: FetchOptions::default(),
        })
    }

    /// Replaces the default [`FetchOptions`].
    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Fetches a report using the configured row threshold.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn fetch(&self, session: &Session, report_id: &str) -> Result<TabularResult, Error> {
        self.fetch_with_threshold(session, report_id, self.options.row_threshold)
            .await
    }

    /// Fetches a report, falling back to a bulk query when it returns at
    /// least `row_threshold` rows.
    ///
    /// # Errors
    ///
    /// - [`Error::UnmappedFallback`] if the report is capped and has no
    ///   fallback query. A truncated result is never returned.
    /// - [`Error::JobFailure`] if the bulk job ends `Failed` or `Aborted`.
    /// - [`Error::JobTimeout`] if the bulk job outlives the poll timeout.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn fetch_with_threshold(
        &self,
        session: &Session,
        report_id: &str,
        row_threshold: usize,
    ) -> Result<TabularResult, Error> {
        let mut session = session.clone();

        let report = self.reports.read(&mut session, report_id, true).await?;
        if report.len() < row_threshold {
            info!(report_id, rows = report.len(), "report served synchronously");
            return Ok(report);
        }

        let Some(soql) = self.fallbacks.fallback_query(report_id) else {
            warn!(report_id, rows = report.len(), row_threshold, "capped report has no fallback query");
            return Err(Error::UnmappedFallback {
                report_id: report_id.to_string(),
            });
        };
        info!(
            report_id,
            rows = report.len(),
            row_threshold,
            "report reached row cap, falling back to bulk query"
        );

        let job = self
            .bulk
            .submit(&mut session, &CreateQueryJobRequest::new(soql))
            .await?;
        let mut job = self
            .bulk
            .poll(
                &mut session,
                job,
                self.options.poll_interval(),
                self.options.poll_timeout(),
            )
            .await?;

        if job.state() != JobState::JobComplete {
            return Err(Error::JobFailure {
                job_id: job.id().to_string(),
                state: job.state(),
                message: job.error_message().map(str::to_string),
            });
        }

        let table = self.bulk.download(&mut session, &mut job).await?;
        info!(report_id, job_id = job.id(), rows = table.len(), "report served by bulk query");
        Ok(table)
    }
}
