use crate::auth;
use crate::bulkapi::JobState;
use std::time::Duration;

/// Error type for report and bulk retrieval.
///
/// Any error aborts the whole fetch. Rows read before the failure are
/// dropped, so callers never get a partial [`TabularResult`](crate::TabularResult).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Token exchange failed, or a request was still unauthorized after one
    /// re-authentication.
    #[error("Authentication error: {source}")]
    Auth {
        #[source]
        source: auth::Error,
    },

    /// Non-2xx response other than 401.
    #[error("HTTP {status}: {}", .message.as_deref().unwrap_or("no error message"))]
    Http {
        status: u16,
        /// First `message` of a Salesforce error body, when present.
        message: Option<String>,
    },

    /// The bulk job ended as `Failed` or `Aborted`.
    #[error("Bulk job {job_id} ended in state {state}{}", .message.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
    JobFailure {
        job_id: String,
        state: JobState,
        message: Option<String>,
    },

    /// The bulk job did not finish before the poll timeout. It may still
    /// complete on the server.
    #[error("Bulk job {job_id} still {last_state} after {waited:?}")]
    JobTimeout {
        job_id: String,
        last_state: JobState,
        waited: Duration,
    },

    /// The report hit the row cap and no fallback query is registered.
    #[error("Report {report_id} reached the row cap and has no fallback query")]
    UnmappedFallback { report_id: String },

    /// The job is not in the state the operation needs.
    #[error("Bulk job {job_id} is {actual}, expected {expected}")]
    InvalidState {
        job_id: String,
        expected: JobState,
        actual: JobState,
    },

    /// Transport failure.
    #[error("HTTP request failed: {source}")]
    Request {
        #[source]
        source: reqwest::Error,
    },

    /// Failed to build the HTTP client.
    #[error("Failed to build HTTP client: {source}")]
    HttpClientBuild {
        #[source]
        source: reqwest::Error,
    },

    /// Response body was not the expected JSON shape.
    #[error("Failed to decode response: {source}")]
    Json {
        #[source]
        source: serde_json::Error,
    },

    /// Bulk results were not valid CSV.
    #[error("Failed to parse CSV results: {source}")]
    Csv {
        #[source]
        source: csv::Error,
    },

    /// Response was well-formed but violated the API contract.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}
