//! Adaptive retrieval of Salesforce report data.
//!
//! Reports are read through the synchronous Analytics REST API first. When a
//! report comes back at the row cap, the data is fetched again through a Bulk
//! API 2.0 query job using a registered fallback SOQL query. Both paths produce
//! the same [`TabularResult`].
//!
//! # Examples
//!
//! ```no_run
//! use salesforce_reports::auth::{self, Credentials};
//! use salesforce_reports::fetch::{FetchController, StaticFallbackQueries};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = auth::Builder::new()
//!     .credentials(Credentials {
//!         client_id: "...".to_string(),
//!         username: "integration@example.com".to_string(),
//!         token_url: "https://login.salesforce.com/services/oauth2/token".to_string(),
//!         audience: None,
//!         private_key_path: Some("server.key".into()),
//!     })
//!     .build()?;
//! let session = manager.authenticate().await?;
//!
//! let fallbacks = StaticFallbackQueries::new()
//!     .with("00OHq000007fYBBMA2", "SELECT Id, Name, CreatedDate FROM Contact");
//! let controller = FetchController::new(manager, fallbacks)?;
//!
//! let table = controller.fetch(&session, "00OHq000007fYBBMA2").await?;
//! println!("{} rows", table.len());
//! # Ok(())
//! # }
//! ```

/// Default connection timeout for HTTP requests (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default request timeout for HTTP requests (120 seconds).
///
/// Bulk result downloads can be large, so this is longer than the auth timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default connection timeout for token exchange requests (15 seconds).
pub const DEFAULT_AUTH_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Default request timeout for token exchange requests (30 seconds).
pub const DEFAULT_AUTH_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Lifetime of a signed JWT-bearer assertion (5 minutes).
pub const ASSERTION_LIFETIME_SECS: u64 = 300;

/// Session lifetime assumed when the token endpoint does not report one.
///
/// Matches the Salesforce default session timeout of 2 hours.
pub const DEFAULT_SESSION_LIFETIME_SECS: u64 = 7200;

/// Row count at which the synchronous report endpoint is considered capped.
pub const DEFAULT_ROW_THRESHOLD: usize = 2000;

/// Default interval between bulk job status checks (5 seconds).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default upper bound on waiting for a bulk job (10 minutes).
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 600;

/// JWT-bearer authentication and session lifecycle.
pub mod auth;

/// Immutable session values and a shared current-session slot.
pub mod session;

/// Salesforce Bulk API 2.0 query jobs.
pub mod bulkapi;

/// Synchronous Analytics report reader.
pub mod reports;

/// Uniform row/column result shared by every retrieval path.
pub mod tabular;

/// Report fetch policy with bulk fallback.
pub mod fetch;

mod error;
mod http;

pub use error::Error;
pub use session::Session;
pub use tabular::TabularResult;

#[cfg(test)]
mod test_support;
