//! Bulk API 2.0 client that wraps the session manager.

use crate::auth::SessionManager;
use crate::error::Error;
use crate::http::Api;
use crate::session::Session;

/// Client for Salesforce Bulk API 2.0.
///
/// Wraps a [`SessionManager`] so that expired or revoked sessions are
/// replaced transparently while a job is being submitted, polled or
/// downloaded.
#[derive(Clone, Debug)]
pub struct Client {
    api: Api,
}

impl Client {
    /// Creates a new Bulk API client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HttpClientBuild`] if the HTTP client cannot be built.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn new(manager: SessionManager) -> Result<Self, Error> {
        Ok(Self::from_api(Api::new(manager)?))
    }

    pub(crate) fn from_api(api: Api) -> Self {
        Self { api }
    }

    /// Creates a query client for bulk query operations.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn query(&self) -> super::query::QueryClient {
        super::query::QueryClient::new(self.clone())
    }

    pub(crate) fn api(&self) -> &Api {
        &self.api
    }

    /// Collection URL for query jobs of `session`'s org and API version.
    pub(crate) fn jobs_url(session: &Session) -> String {
        format!("{}/jobs/query", session.api_base_url())
    }
}
