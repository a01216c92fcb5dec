//! Salesforce Bulk API 2.0 query jobs.
//!
//! A query job runs server-side: it is submitted with a SOQL query, polled
//! until it reaches a terminal state, and its results are downloaded page by
//! page using the `Sforce-Locator` continuation header.
//!
//! # Example
//!
//! ```no_run
//! use salesforce_reports::auth;
//! use salesforce_reports::bulkapi::Client as BulkClient;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = auth::Builder::new().credentials_from_env().build()?;
//! let session = manager.authenticate().await?;
//!
//! let query_client = BulkClient::new(manager)?.query();
//! let job = query_client
//!     .submit_query(&session, "SELECT Id, Name FROM Account")
//!     .await?;
//! let mut job = query_client
//!     .poll_until_terminal(&session, job, Duration::from_secs(5), Duration::from_secs(600))
//!     .await?;
//! let table = query_client.download_results(&session, &mut job).await?;
//! println!("{} rows", table.len());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod query;

pub use client::Client;
pub use query::{
    BulkJob, ContentType, CreateQueryJobRequest, JobInfo, JobState, LineEnding, QueryOperation,
};
