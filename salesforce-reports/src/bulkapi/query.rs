//! Bulk API 2.0 query operations for asynchronously querying large data sets.

use super::Client as BulkClient;
use crate::error::Error;
use crate::http::read_json;
use crate::session::Session;
use crate::tabular::{BulkRows, TabularResult};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Response header carrying the continuation token for result pages.
const SFORCE_LOCATOR_HEADER: &str = "Sforce-Locator";

/// Value of `Sforce-Locator` on the last result page.
const LAST_PAGE_LOCATOR: &str = "null";

/// Shortest pause between two status checks of the same job.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle state of a query job.
///
/// Bulk API 2.0 reports a freshly submitted job as `UploadComplete`; it is
/// surfaced here as [`JobState::Queued`]. Unknown states are treated as
/// [`JobState::InProgress`] so polling continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum JobState {
    Queued,
    InProgress,
    JobComplete,
    Failed,
    Aborted,
}

impl JobState {
    /// Returns true for `JobComplete`, `Failed` and `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::JobComplete | Self::Failed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::InProgress => "InProgress",
            Self::JobComplete => "JobComplete",
            Self::Failed => "Failed",
            Self::Aborted => "Aborted",
        }
    }
}

impl From<String> for JobState {
    fn from(state: String) -> Self {
        match state.as_str() {
            "Queued" | "Open" | "UploadComplete" => Self::Queued,
            "JobComplete" => Self::JobComplete,
            "Failed" => Self::Failed,
            "Aborted" => Self::Aborted,
            _ => Self::InProgress,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryOperation {
    #[default]
    Query,
    /// Includes deleted and archived records.
    QueryAll,
}

/// Result format requested for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    Csv,
    #[default]
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LineEnding {
    #[default]
    Lf,
    Crlf,
}

/// Body of `POST /jobs/query`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQueryJobRequest {
    pub operation: QueryOperation,
    pub query: String,
    pub content_type: ContentType,
    pub line_ending: LineEnding,
}

impl CreateQueryJobRequest {
    /// A `query` operation with JSON results and LF line endings.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            operation: QueryOperation::default(),
            query: query.into(),
            content_type: ContentType::default(),
            line_ending: LineEnding::default(),
        }
    }
}

/// Job information as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub state: JobState,
    #[serde(default)]
    pub operation: Option<QueryOperation>,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub content_type: Option<ContentType>,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub number_records_processed: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// A submitted query job.
///
/// State changes only through [`QueryClient::poll_until_terminal`]; the
/// result locator only through [`QueryClient::download_results`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkJob {
    id: String,
    state: JobState,
    query_text: String,
    content_type: ContentType,
    result_locator: Option<String>,
    records_processed: Option<u64>,
    error_message: Option<String>,
}

impl BulkJob {
    fn from_info(info: JobInfo, request: &CreateQueryJobRequest) -> Self {
        Self {
            id: info.id,
            state: info.state,
            query_text: request.query.clone(),
            content_type: info.content_type.unwrap_or(request.content_type),
            result_locator: None,
            records_processed: info.number_records_processed,
            error_message: info.error_message,
        }
    }

    fn observe(&mut self, info: JobInfo) {
        self.state = info.state;
        if let Some(content_type) = info.content_type {
            self.content_type = content_type;
        }
        self.records_processed = info.number_records_processed.or(self.records_processed);
        self.error_message = info.error_message.or(self.error_message.take());
    }

    /// Server-assigned job id, e.g. `750R0000000zlh9IAA`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// State as of the last status check.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// The SOQL the job was submitted with.
    pub fn query_text(&self) -> &str {
        &self.query_text
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Locator of the next result page not yet downloaded.
    ///
    /// `None` before a download starts and after the last page was read.
    pub fn result_locator(&self) -> Option<&str> {
        self.result_locator.as_deref()
    }

    /// `numberRecordsProcessed` from the last status check that reported it.
    pub fn records_processed(&self) -> Option<u64> {
        self.records_processed
    }

    /// Server-reported reason for a `Failed` job.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Client for Bulk API 2.0 query operations.
///
/// Every operation has a public form that borrows the caller's [`Session`]
/// and a crate-internal form that updates a working copy in place, so a
/// multi-step flow keeps using a session refreshed along the way.
#[derive(Clone, Debug)]
pub struct QueryClient {
    bulk_client: BulkClient,
    max_records: Option<u64>,
}

impl QueryClient {
    pub(crate) fn new(bulk_client: BulkClient) -> Self {
        Self {
            bulk_client,
            max_records: None,
        }
    }

    /// Limits the number of records per result page.
    ///
    /// Sent as `maxRecords` on every results request. Without it the server
    /// picks the page size.
    pub fn max_records(mut self, max_records: u64) -> Self {
        self.max_records = Some(max_records);
        self
    }

    /// Submits `soql` as a new query job with JSON results.
    ///
    /// # Arguments
    ///
    /// * `session` - Session to authenticate with. A refreshed copy is used
    ///   internally if it has expired; the caller's value is not changed.
    /// * `soql` - The query, e.g. `SELECT Id, Name FROM Contact`
    ///
    /// # Returns
    ///
    /// The new job, usually `Queued`, with its query text and content type.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use salesforce_reports::auth;
    /// use salesforce_reports::bulkapi::Client as BulkClient;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let manager = auth::Builder::new().credentials_from_env().build()?;
    /// let session = manager.authenticate().await?;
    ///
    /// let query_client = BulkClient::new(manager)?.query();
    /// let job = query_client
    ///     .submit_query(&session, "SELECT Id, Name FROM Contact")
    ///     .await?;
    /// println!("submitted {} ({})", job.id(), job.state());
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if Salesforce rejects the job (for example
    /// a malformed query) and [`Error::Auth`] if no session can be obtained.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn submit_query(&self, session: &Session, soql: &str) -> Result<BulkJob, Error> {
        let mut session = session.clone();
        self.submit(&mut session, &CreateQueryJobRequest::new(soql))
            .await
    }

    /// Submits a query job with explicit options.
    ///
    /// Use this over [`submit_query`](Self::submit_query) to request CSV
    /// results or a `queryAll` operation.
    ///
    /// # Errors
    ///
    /// Same as [`submit_query`](Self::submit_query).
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn create_job(
        &self,
        session: &Session,
        request: &CreateQueryJobRequest,
    ) -> Result<BulkJob, Error> {
        let mut session = session.clone();
        self.submit(&mut session, request).await
    }

    pub(crate) async fn submit(
        &self,
        session: &mut Session,
        request: &CreateQueryJobRequest,
    ) -> Result<BulkJob, Error> {
        let response = self
            .bulk_client
            .api()
            .send(session, |client, s| {
                client.post(BulkClient::jobs_url(s)).json(request)
            })
            .await?;
        let info: JobInfo = read_json(response).await?;
        let job = BulkJob::from_info(info, request);
        info!(job_id = %job.id, state = %job.state, "submitted bulk query job");
        Ok(job)
    }

    /// Retrieves the current information of a job.
    ///
    /// # Arguments
    ///
    /// * `job_id` - The id returned when the job was submitted
    ///
    /// # Returns
    ///
    /// The raw job info, including `numberRecordsProcessed` and the
    /// `errorMessage` of a failed job.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn get_job(&self, session: &Session, job_id: &str) -> Result<JobInfo, Error> {
        let mut session = session.clone();
        self.job_info(&mut session, job_id).await
    }

    pub(crate) async fn job_info(
        &self,
        session: &mut Session,
        job_id: &str,
    ) -> Result<JobInfo, Error> {
        let response = self
            .bulk_client
            .api()
            .send(session, |client, s| {
                client.get(format!("{}/{job_id}", BulkClient::jobs_url(s)))
            })
            .await?;
        read_json(response).await
    }

    /// Polls `job` every `poll_interval` until it reaches a terminal state.
    ///
    /// `Failed` and `Aborted` jobs are returned, not reported as errors. The
    /// remote job is left running on timeout.
    ///
    /// # Arguments
    ///
    /// * `job` - A job returned by [`submit_query`](Self::submit_query)
    /// * `poll_interval` - Pause between status checks, at least 100 ms
    /// * `timeout` - Upper bound on the whole wait. A timeout too large to
    ///   add to the current instant means no deadline.
    ///
    /// # Returns
    ///
    /// The job in its terminal state.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use salesforce_reports::auth;
    /// # use salesforce_reports::bulkapi::{Client as BulkClient, JobState};
    /// # use std::time::Duration;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let manager = auth::Builder::new().credentials_from_env().build()?;
    /// # let session = manager.authenticate().await?;
    /// let query_client = BulkClient::new(manager)?.query();
    /// let job = query_client.submit_query(&session, "SELECT Id FROM Lead").await?;
    /// let job = query_client
    ///     .poll_until_terminal(&session, job, Duration::from_secs(5), Duration::from_secs(600))
    ///     .await?;
    /// if job.state() != JobState::JobComplete {
    ///     println!("job ended as {}: {:?}", job.state(), job.error_message());
    /// }
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobTimeout`] if the job is not terminal once
    /// `timeout` has elapsed.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn poll_until_terminal(
        &self,
        session: &Session,
        job: BulkJob,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<BulkJob, Error> {
        let mut session = session.clone();
        self.poll(&mut session, job, poll_interval, timeout).await
    }

    pub(crate) async fn poll(
        &self,
        session: &mut Session,
        mut job: BulkJob,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<BulkJob, Error> {
        let started = Instant::now();
        // `None` when the timeout is too large to represent: poll without a deadline.
        let deadline = started.checked_add(timeout);
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let mut checks = 0u32;

        loop {
            let info = self.job_info(session, &job.id).await?;
            job.observe(info);
            checks += 1;
            debug!(job_id = %job.id, state = %job.state, checks, "polled bulk query job");

            if job.is_terminal() {
                info!(
                    job_id = %job.id,
                    state = %job.state,
                    checks,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "bulk query job finished"
                );
                return Ok(job);
            }

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(Error::JobTimeout {
                        job_id: job.id,
                        last_state: job.state,
                        waited: now - started,
                    });
                }
                Some(deadline) => poll_interval.min(deadline - now),
                None => poll_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Downloads every result page of a completed job.
    ///
    /// Pages are requested until the `Sforce-Locator` header is absent or
    /// `"null"`. The format of each page follows its `Content-Type`, falling
    /// back to the job's requested content type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the job is `JobComplete`, and
    /// [`Error::UnexpectedResponse`] if the server hands back a locator that
    /// was already followed.
    ///
    /// # Arguments
    ///
    /// * `job` - A completed job. Its result locator tracks download progress
    ///   and is `None` once every page was read.
    ///
    /// # Returns
    ///
    /// All pages as one [`TabularResult`]. A partial result is never
    /// returned.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use salesforce_reports::auth;
    /// # use salesforce_reports::bulkapi::Client as BulkClient;
    /// # use std::time::Duration;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let manager = auth::Builder::new().credentials_from_env().build()?;
    /// # let session = manager.authenticate().await?;
    /// let query_client = BulkClient::new(manager)?.query().max_records(50_000);
    /// let job = query_client.submit_query(&session, "SELECT Id FROM Case").await?;
    /// let mut job = query_client
    ///     .poll_until_terminal(&session, job, Duration::from_secs(5), Duration::from_secs(600))
    ///     .await?;
    /// let table = query_client.download_results(&session, &mut job).await?;
    /// println!("{} rows", table.len());
    /// # Ok(())
    /// # }
    /// ```
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn download_results(
        &self,
        session: &Session,
        job: &mut BulkJob,
    ) -> Result<TabularResult, Error> {
        let mut session = session.clone();
        self.download(&mut session, job).await
    }

    pub(crate) async fn download(
        &self,
        session: &mut Session,
        job: &mut BulkJob,
    ) -> Result<TabularResult, Error> {
        if job.state != JobState::JobComplete {
            return Err(Error::InvalidState {
                job_id: job.id.clone(),
                expected: JobState::JobComplete,
                actual: job.state,
            });
        }

        let mut rows = BulkRows::default();
        let mut locator: Option<String> = None;
        let mut seen_locators = HashSet::new();
        let mut pages = 0u32;

        loop {
            let response = {
                let job_id = job.id.as_str();
                let locator = locator.as_deref();
                let accept = match job.content_type {
                    ContentType::Csv => "text/csv",
                    ContentType::Json => "application/json",
                };
                self.bulk_client
                    .api()
                    .send(session, |client, s| {
                        let mut request = client
                            .get(format!("{}/{job_id}/results", BulkClient::jobs_url(s)))
                            .header(ACCEPT, accept);
                        if let Some(locator) = locator {
                            request = request.query(&[("locator", locator)]);
                        }
                        if let Some(max_records) = self.max_records {
                            request = request.query(&[("maxRecords", max_records)]);
                        }
                        request
                    })
                    .await?
            };

            let next = next_locator(response.headers());
            let format = page_format(response.headers()).unwrap_or(job.content_type);
            let body = read_body(response).await?;
            match format {
                ContentType::Csv => rows.push_csv(&body)?,
                ContentType::Json => rows.push_json(&body)?,
            }
            pages += 1;
            debug!(job_id = %job.id, page = pages, bytes = body.len(), "downloaded bulk result page");

            if let Some(next) = &next {
                if !seen_locators.insert(next.clone()) {
                    return Err(Error::UnexpectedResponse(format!(
                        "bulk job {} repeated result locator {next}",
                        job.id
                    )));
                }
            }
            job.result_locator = next.clone();
            match next {
                Some(next) => locator = Some(next),
                None => break,
            }
        }

        let table = rows.finish();
        info!(job_id = %job.id, rows = table.len(), pages, "downloaded bulk query results");
        Ok(table)
    }

    /// Requests that the server abort a job. Never called automatically.
    ///
    /// # Returns
    ///
    /// The job info the server reports after the state change.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn abort_job(&self, session: &Session, job_id: &str) -> Result<JobInfo, Error> {
        let mut session = session.clone();
        let response = self
            .bulk_client
            .api()
            .send(&mut session, |client, s| {
                client
                    .patch(format!("{}/{job_id}", BulkClient::jobs_url(s)))
                    .json(&serde_json::json!({ "state": "Aborted" }))
            })
            .await?;
        let info: JobInfo = read_json(response).await?;
        info!(job_id, state = %info.state, "aborted bulk query job");
        Ok(info)
    }
}

fn next_locator(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SFORCE_LOCATOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && *value != LAST_PAGE_LOCATOR)
        .map(str::to_string)
}

fn page_format(headers: &HeaderMap) -> Option<ContentType> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    if content_type.contains("csv") {
        Some(ContentType::Csv)
    } else if content_type.contains("json") {
        Some(ContentType::Json)
    } else {
        None
    }
}

async fn read_body(response: reqwest::Response) -> Result<Vec<u8>, Error> {
    let mut stream = response.bytes_stream();
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk.map_err(|source| Error::Request { source })?);
    }
    Ok(body)
}
