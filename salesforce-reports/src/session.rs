//! Bearer sessions issued by [`SessionManager`](crate::auth::SessionManager).
//!
//! A [`Session`] never changes after it is issued. Refreshing produces a new
//! value, so a session can be shared between tasks without locking. Callers
//! that want one "current" session for a whole process can hold a
//! [`SharedSession`], which swaps the entire value on refresh.

use crate::auth::{self, SessionManager};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

/// An authenticated Salesforce API session.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    bearer_token: String,
    instance_url: String,
    api_version: String,
    issued_at: SystemTime,
    expires_at: SystemTime,
}

impl Session {
    /// Creates a session from its parts.
    ///
    /// A trailing slash on `instance_url` is dropped so URLs can be joined
    /// with `/services/...` paths.
    ///
    /// # Errors
    ///
    /// Returns [`auth::Error::ParseUrl`] if `instance_url` is not an absolute URL
    /// and [`auth::Error::InvalidSessionLifetime`] unless `issued_at < expires_at`.
    pub fn new(
        bearer_token: impl Into<String>,
        instance_url: impl Into<String>,
        api_version: impl Into<String>,
        issued_at: SystemTime,
        expires_at: SystemTime,
    ) -> Result<Self, auth::Error> {
        let instance_url = instance_url.into().trim_end_matches('/').to_string();
        url::Url::parse(&instance_url).map_err(|source| auth::Error::ParseUrl { source })?;

        if issued_at >= expires_at {
            return Err(auth::Error::InvalidSessionLifetime);
        }

        Ok(Self {
            bearer_token: bearer_token.into(),
            instance_url,
            api_version: api_version.into(),
            issued_at,
            expires_at,
        })
    }

    /// Returns the bearer token sent in the `Authorization` header.
    pub fn bearer_token(&self) -> &str {
        &self.bearer_token
    }

    /// Returns the instance URL, without a trailing slash.
    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    /// Returns the REST API version, e.g. `"65.0"`.
    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// When the token exchange that produced this session completed.
    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    /// First instant at which the session is no longer valid.
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// Returns true while the current time is before `expires_at`.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }

    /// Returns true if the session is still usable at `now`.
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }

    /// Time left before expiry, or zero if already expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    /// Base URL for versioned REST resources:
    /// `{instance_url}/services/data/v{api_version}`.
    pub fn api_base_url(&self) -> String {
        format!("{}/services/data/v{}", self.instance_url, self.api_version)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("bearer_token", &"[redacted]")
            .field("instance_url", &self.instance_url)
            .field("api_version", &self.api_version)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A process-wide "current session" slot.
///
/// Readers get an `Arc<Session>` snapshot. A refresh replaces the whole
/// `Arc`, so a reader sees either the old token/instance pair or the new one.
#[derive(Debug, Clone)]
pub struct SharedSession {
    current: Arc<RwLock<Arc<Session>>>,
}

impl SharedSession {
    /// Creates a slot holding `session`.
    pub fn new(session: Session) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(session))),
        }
    }

    /// Returns a snapshot of the current session without checking expiry.
    ///
    /// # Errors
    ///
    /// Returns [`auth::Error::LockError`] if the lock is poisoned.
    pub fn current(&self) -> Result<Arc<Session>, auth::Error> {
        let guard = self.current.read().map_err(|_| auth::Error::LockError)?;
        Ok(Arc::clone(&guard))
    }

    /// Replaces the current session and returns the new snapshot.
    pub fn replace(&self, session: Session) -> Result<Arc<Session>, auth::Error> {
        let session = Arc::new(session);
        let mut guard = self.current.write().map_err(|_| auth::Error::LockError)?;
        *guard = Arc::clone(&session);
        Ok(session)
    }

    /// Returns a valid session, re-authenticating through `manager` if the
    /// current one has expired.
    ///
    /// The lock is never held across the token exchange. Two tasks that race
    /// on an expired session may both re-authenticate; the last one to finish
    /// wins, and both results are usable.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn ensure_valid(&self, manager: &SessionManager) -> Result<Arc<Session>, auth::Error> {
        let current = self.current()?;
        if current.is_valid() {
            return Ok(current);
        }

        let refreshed = manager.ensure_valid(&current).await?;
        self.replace(refreshed)
    }
}
