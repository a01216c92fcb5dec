use crate::session::Session;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// OAuth 2.0 grant type for the JWT-bearer flow.
const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Path listing the REST API versions available on an instance.
const VERSION_DISCOVERY_PATH: &str = "/services/data/";

/// Environment variable holding the connected app's consumer key.
pub const ENV_CLIENT_ID: &str = "SALESFORCE_CLIENT_ID";
/// Environment variable holding the integration user's username.
pub const ENV_USERNAME: &str = "SALESFORCE_USERNAME";
/// Environment variable holding the OAuth token endpoint URL.
pub const ENV_TOKEN_URL: &str = "SALESFORCE_TOKEN_URL";
/// Environment variable holding the path of the PEM encoded signing key.
pub const ENV_PRIVATE_KEY_PATH: &str = "SALESFORCE_PRIVATE_KEY_PATH";
/// Optional environment variable overriding the assertion audience.
pub const ENV_AUDIENCE: &str = "SALESFORCE_AUDIENCE";

/// Errors that can occur while loading credentials or authenticating.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read credentials file from disk.
    #[error("Failed to read credentials file at {path}: {source}")]
    ReadCredentials {
        /// Path to the credentials file that failed to read.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Failed to parse credentials JSON.
    #[error("Failed to parse credentials JSON: {source}")]
    ParseCredentials {
        #[source]
        source: serde_json::Error,
    },
    /// A required environment variable is not set.
    #[error("Missing environment variable: {0}")]
    MissingEnvironment(String),
    /// Credentials are incomplete.
    #[error("Invalid credentials: {message}")]
    InvalidCredentials {
        /// Description of what's missing or invalid.
        message: String,
    },
    /// Failed to read the private key file.
    #[error("Failed to read private key at {path}: {source}")]
    ReadPrivateKey {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Key material is not a PEM encoded RSA private key.
    #[error("Invalid RSA private key: {source}")]
    InvalidPrivateKey {
        #[source]
        source: jsonwebtoken::errors::Error,
    },
    /// Signing the JWT assertion failed.
    #[error("Failed to sign JWT assertion: {source}")]
    SignAssertion {
        #[source]
        source: jsonwebtoken::errors::Error,
    },
    /// Invalid URL format.
    #[error("Invalid URL format: {source}")]
    ParseUrl {
        #[source]
        source: url::ParseError,
    },
    /// Failed to build the HTTP client.
    #[error("Failed to build HTTP client: {source}")]
    HttpClientBuild {
        #[source]
        source: reqwest::Error,
    },
    /// Transport failure while talking to the token or discovery endpoint.
    #[error("Authentication request failed: {source}")]
    Request {
        #[source]
        source: reqwest::Error,
    },
    /// The token endpoint rejected the assertion.
    #[error("Token exchange failed with HTTP {status}: {message}")]
    TokenExchange { status: u16, message: String },
    /// The token endpoint answered 2xx without a required field.
    #[error("Token response is missing {field}")]
    IncompleteTokenResponse { field: &'static str },
    /// A token or discovery response was not valid JSON.
    #[error("Failed to parse authentication response: {source}")]
    ParseResponse {
        #[source]
        source: serde_json::Error,
    },
    /// Listing API versions failed.
    #[error("API version discovery failed with HTTP {status}: {message}")]
    VersionDiscovery { status: u16, message: String },
    /// The instance reported no API versions.
    #[error("API version discovery returned no versions")]
    NoApiVersions,
    /// A request was still unauthorized after re-authenticating.
    #[error("Unauthorized: {}", .message.as_deref().unwrap_or("session rejected after re-authentication"))]
    Unauthorized { message: Option<String> },
    /// Failed to get current system time.
    #[error("Failed to get current system time: {source}")]
    SystemTimeError {
        #[source]
        source: std::time::SystemTimeError,
    },
    /// Expiry calculation resulted in arithmetic overflow.
    #[error("Expiry time calculation overflow")]
    TimeOverflow,
    /// A session must expire after it is issued.
    #[error("Session expiry must be later than its issue time")]
    InvalidSessionLifetime,
    /// Failed to acquire lock on the shared session.
    #[error("Failed to acquire lock on shared session")]
    LockError,
    /// Required builder parameter was not provided.
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
}

/// Credentials for the OAuth 2.0 JWT-bearer flow.
///
/// Obtained from a Salesforce Connected App with "Use digital signatures"
/// enabled. The certificate uploaded to the app must match the private key.
///
/// # Examples
///
/// ```
/// use salesforce_reports::auth::Credentials;
///
/// let creds = Credentials {
///     client_id: "your_consumer_key".to_string(),
///     username: "integration@example.com".to_string(),
///     token_url: "https://login.salesforce.com/services/oauth2/token".to_string(),
///     audience: None,
///     private_key_path: Some("server.key".into()),
/// };
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Consumer key of the Connected App, used as the assertion issuer.
    pub client_id: String,
    /// User the session is issued for, used as the assertion subject.
    pub username: String,
    /// OAuth token endpoint, e.g. `https://login.salesforce.com/services/oauth2/token`.
    pub token_url: String,
    /// Assertion audience. Defaults to `token_url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// PEM encoded RSA private key. Not needed when key material is
    /// injected with [`Builder::private_key_pem`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
}

impl Credentials {
    /// Builds credentials from a variable lookup.
    ///
    /// [`CredentialsFrom::Env`] calls this with [`std::env::var`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| Error::MissingEnvironment(name.to_string()))
        };

        Ok(Self {
            client_id: required(ENV_CLIENT_ID)?,
            username: required(ENV_USERNAME)?,
            token_url: required(ENV_TOKEN_URL)?,
            audience: lookup(ENV_AUDIENCE).filter(|value| !value.is_empty()),
            private_key_path: Some(PathBuf::from(required(ENV_PRIVATE_KEY_PATH)?)),
        })
    }

    /// Audience claim for the assertion.
    pub fn audience(&self) -> &str {
        self.audience.as_deref().unwrap_or(&self.token_url)
    }

    fn validate(&self) -> Result<(), Error> {
        for (name, value) in [
            ("client_id", &self.client_id),
            ("username", &self.username),
            ("token_url", &self.token_url),
        ] {
            if value.is_empty() {
                return Err(Error::InvalidCredentials {
                    message: format!("{name} is required"),
                });
            }
        }
        url::Url::parse(&self.token_url).map_err(|source| Error::ParseUrl { source })?;
        Ok(())
    }
}

/// Source for loading credentials.
#[derive(Debug, Clone)]
pub enum CredentialsFrom {
    /// Load credentials from a JSON file. A relative `private_key_path`
    /// resolves against the file's directory.
    Path(PathBuf),
    /// Use credentials provided directly.
    Value(Credentials),
    /// Read credentials from `SALESFORCE_*` environment variables.
    Env,
}

impl CredentialsFrom {
    /// Loads and validates the credentials.
    pub fn load(&self) -> Result<Credentials, Error> {
        let credentials = match self {
            CredentialsFrom::Value(creds) => creds.clone(),
            CredentialsFrom::Env => Credentials::from_lookup(|name| std::env::var(name).ok())?,
            CredentialsFrom::Path(path) => {
                let credentials_string =
                    fs::read_to_string(path).map_err(|e| Error::ReadCredentials {
                        path: path.clone(),
                        source: e,
                    })?;
                let mut creds: Credentials = serde_json::from_str(&credentials_string)
                    .map_err(|e| Error::ParseCredentials { source: e })?;
                if let (Some(key_path), Some(dir)) = (&creds.private_key_path, path.parent()) {
                    if key_path.is_relative() {
                        creds.private_key_path = Some(dir.join(key_path));
                    }
                }
                creds
            }
        };

        credentials.validate()?;
        Ok(credentials)
    }
}

/// Opaque PEM key material. Never printed.
#[derive(Clone)]
struct KeyMaterial(Arc<[u8]>);

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial([redacted])")
    }
}

/// Claims of the JWT-bearer assertion.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AssertionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    instance_url: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// An entry of the `/services/data/` version listing.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ApiVersion {
    pub version: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Picks the highest version, comparing dotted components numerically.
pub fn latest_version(versions: &[ApiVersion]) -> Option<&ApiVersion> {
    versions.iter().max_by_key(|v| {
        v.version
            .split('.')
            .map(|part| part.parse::<u32>().unwrap_or(0))
            .collect::<Vec<_>>()
    })
}

fn unix_now() -> Result<(SystemTime, u64), Error> {
    let now = SystemTime::now();
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map_err(|source| Error::SystemTimeError { source })?
        .as_secs();
    Ok((now, secs))
}

/// Issues and refreshes [`Session`]s through the JWT-bearer flow.
///
/// The manager holds no session of its own. Every call to
/// [`authenticate`](Self::authenticate) returns a new value and callers
/// thread it through the report and bulk clients.
///
/// # Examples
///
/// ```no_run
/// use salesforce_reports::auth;
/// use std::path::PathBuf;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = auth::Builder::new()
///     .credentials_path(PathBuf::from("credentials.json"))
///     .build()?;
///
/// let session = manager.authenticate().await?;
/// // Later, before reusing it:
/// let session = manager.ensure_valid(&session).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SessionManager {
    credentials_from: CredentialsFrom,
    signing_key: Option<KeyMaterial>,
    http_client: reqwest::Client,
    session_lifetime: Duration,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl SessionManager {
    /// Exchanges a freshly signed assertion for a new session.
    ///
    /// After the token exchange the instance is asked for its API versions
    /// and the highest one is stored on the session.
    ///
    /// # Returns
    ///
    /// A [`Session`] holding the bearer token, instance URL and API version.
    /// It expires after the reported `expires_in`, or after the configured
    /// session lifetime when none is reported.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use salesforce_reports::auth;
    /// use std::path::PathBuf;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let manager = auth::Builder::new()
    ///     .credentials_path(PathBuf::from("credentials.json"))
    ///     .build()?;
    /// let session = manager.authenticate().await?;
    /// println!("{} on API v{}", session.instance_url(), session.api_version());
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Credentials cannot be loaded or are incomplete
    /// - The private key cannot be read or used ([`Error::InvalidPrivateKey`])
    /// - The token endpoint answers non-2xx ([`Error::TokenExchange`])
    /// - The token response lacks `access_token` or `instance_url`
    ///   ([`Error::IncompleteTokenResponse`])
    /// - Version discovery fails ([`Error::VersionDiscovery`], [`Error::NoApiVersions`])
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn authenticate(&self) -> Result<Session, Error> {
        let credentials = self.credentials_from.load()?;
        let assertion = self.signed_assertion(&credentials)?;

        debug!(token_url = %credentials.token_url, "exchanging JWT assertion");
        let response = self
            .http_client
            .post(&credentials.token_url)
            .form(&[("grant_type", JWT_BEARER_GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|source| Error::Request { source })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|source| Error::Request { source })?;

        if !status.is_success() {
            let error: TokenErrorResponse = serde_json::from_slice(&body).unwrap_or_default();
            let message = error
                .error_description
                .or(error.error)
                .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
            return Err(Error::TokenExchange {
                status: status.as_u16(),
                message,
            });
        }

        let token: TokenResponse =
            serde_json::from_slice(&body).map_err(|source| Error::ParseResponse { source })?;
        let access_token = token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(Error::IncompleteTokenResponse {
                field: "access_token",
            })?;
        let instance_url = token
            .instance_url
            .filter(|u| !u.is_empty())
            .ok_or(Error::IncompleteTokenResponse {
                field: "instance_url",
            })?;
        let instance_url = instance_url.trim_end_matches('/').to_string();

        let api_version = self.discover_version(&instance_url, &access_token).await?;

        let (issued_at, _) = unix_now()?;
        let lifetime = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(self.session_lifetime);
        let expires_at = issued_at
            .checked_add(lifetime)
            .ok_or(Error::TimeOverflow)?;

        let session = Session::new(access_token, instance_url, api_version, issued_at, expires_at)?;
        info!(
            instance_url = session.instance_url(),
            api_version = session.api_version(),
            lifetime_secs = lifetime.as_secs(),
            "authenticated"
        );
        Ok(session)
    }

    /// Returns `session` unchanged while it is valid, otherwise a new one.
    ///
    /// The caller's value is never modified; store the returned session to
    /// keep using the refreshed token.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use salesforce_reports::auth;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let manager = auth::Builder::new().credentials_from_env().build()?;
    /// let mut session = manager.authenticate().await?;
    /// // ... later, possibly after expiry
    /// session = manager.ensure_valid(&session).await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Same as [`authenticate`](Self::authenticate) when a refresh is needed.
    pub async fn ensure_valid(&self, session: &Session) -> Result<Session, Error> {
        self.ensure_valid_at(session, SystemTime::now()).await
    }

    pub(crate) async fn ensure_valid_at(
        &self,
        session: &Session,
        now: SystemTime,
    ) -> Result<Session, Error> {
        if session.is_valid_at(now) {
            return Ok(session.clone());
        }

        info!(instance_url = session.instance_url(), "session expired, re-authenticating");
        self.authenticate().await
    }

    /// Connection timeout for data API requests.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Request timeout for data API requests.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Signs an RS256 assertion valid for [`ASSERTION_LIFETIME_SECS`](crate::ASSERTION_LIFETIME_SECS).
    fn signed_assertion(&self, credentials: &Credentials) -> Result<String, Error> {
        let pem = match &self.signing_key {
            Some(key) => key.0.to_vec(),
            None => {
                let path = credentials.private_key_path.as_ref().ok_or_else(|| {
                    Error::InvalidCredentials {
                        message: "private_key_path is required when no key material is injected"
                            .to_string(),
                    }
                })?;
                fs::read(path).map_err(|source| Error::ReadPrivateKey {
                    path: path.clone(),
                    source,
                })?
            }
        };
        let key = EncodingKey::from_rsa_pem(&pem).map_err(|source| Error::InvalidPrivateKey { source })?;

        let (_, now) = unix_now()?;
        let claims = AssertionClaims {
            iss: credentials.client_id.clone(),
            sub: credentials.username.clone(),
            aud: credentials.audience().to_string(),
            exp: now
                .checked_add(crate::ASSERTION_LIFETIME_SECS)
                .ok_or(Error::TimeOverflow)?,
        };

        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|source| Error::SignAssertion { source })
    }

    async fn discover_version(&self, instance_url: &str, access_token: &str) -> Result<String, Error> {
        let response = self
            .http_client
            .get(format!("{instance_url}{VERSION_DISCOVERY_PATH}"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|source| Error::Request { source })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|source| Error::Request { source })?;
        if !status.is_success() {
            return Err(Error::VersionDiscovery {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let versions: Vec<ApiVersion> =
            serde_json::from_slice(&body).map_err(|source| Error::ParseResponse { source })?;
        let latest = latest_version(&versions).ok_or(Error::NoApiVersions)?;
        debug!(available = versions.len(), selected = %latest.version, "discovered API versions");
        Ok(latest.version.clone())
    }
}

/// Builder for constructing a [`SessionManager`].
///
/// # Examples
///
/// ## Loading from the environment
///
/// ```no_run
/// use salesforce_reports::auth;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = auth::Builder::new().credentials_from_env().build()?;
/// # Ok(())
/// # }
/// ```
///
/// ## Injecting key material
///
/// ```no_run
/// use salesforce_reports::auth::{self, Credentials};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pem = std::fs::read("server.key")?;
/// let manager = auth::Builder::new()
///     .credentials(Credentials {
///         client_id: "your_consumer_key".to_string(),
///         username: "integration@example.com".to_string(),
///         token_url: "https://login.salesforce.com/services/oauth2/token".to_string(),
///         audience: Some("https://login.salesforce.com".to_string()),
///         private_key_path: None,
///     })
///     .private_key_pem(pem)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Builder {
    credentials_from: Option<CredentialsFrom>,
    private_key_pem: Option<Vec<u8>>,
    session_lifetime: Option<Duration>,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets credentials to load from a JSON file.
    ///
    /// ```json
    /// {
    ///   "client_id": "your_consumer_key",
    ///   "username": "integration@example.com",
    ///   "token_url": "https://login.salesforce.com/services/oauth2/token",
    ///   "private_key_path": "server.key"
    /// }
    /// ```
    pub fn credentials_path(mut self, path: PathBuf) -> Self {
        self.credentials_from = Some(CredentialsFrom::Path(path));
        self
    }

    /// Sets credentials directly.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials_from = Some(CredentialsFrom::Value(credentials));
        self
    }

    /// Reads credentials from `SALESFORCE_*` environment variables on each
    /// authentication.
    pub fn credentials_from_env(mut self) -> Self {
        self.credentials_from = Some(CredentialsFrom::Env);
        self
    }

    /// Injects PEM encoded RSA key material, taking precedence over
    /// `private_key_path`.
    pub fn private_key_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.private_key_pem = Some(pem.into());
        self
    }

    /// Session lifetime used when the token endpoint reports none.
    ///
    /// Defaults to [`DEFAULT_SESSION_LIFETIME_SECS`](crate::DEFAULT_SESSION_LIFETIME_SECS).
    pub fn session_lifetime(mut self, lifetime: Duration) -> Self {
        self.session_lifetime = Some(lifetime);
        self
    }

    /// Connection timeout for data API requests.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Request timeout for data API requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Builds the session manager.
    ///
    /// # Errors
    ///
    /// Returns an error if no credential source was set, if injected key
    /// material is not a valid RSA key, or if the HTTP client cannot be built.
    pub fn build(self) -> Result<SessionManager, Error> {
        let credentials_from = self.credentials_from.ok_or_else(|| {
            Error::MissingRequiredAttribute(
                "credentials, credentials_path or credentials_from_env".to_string(),
            )
        })?;

        let signing_key = match self.private_key_pem {
            Some(pem) => {
                EncodingKey::from_rsa_pem(&pem).map_err(|source| Error::InvalidPrivateKey { source })?;
                Some(KeyMaterial(Arc::from(pem)))
            }
            None => None,
        };

        let session_lifetime = self
            .session_lifetime
            .unwrap_or(Duration::from_secs(crate::DEFAULT_SESSION_LIFETIME_SECS));
        if session_lifetime.is_zero() {
            return Err(Error::InvalidSessionLifetime);
        }

        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(crate::DEFAULT_AUTH_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(crate::DEFAULT_AUTH_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|source| Error::HttpClientBuild { source })?;

        Ok(SessionManager {
            credentials_from,
            signing_key,
            http_client,
            session_lifetime,
            connect_timeout: self
                .connect_timeout
                .unwrap_or(Duration::from_secs(crate::DEFAULT_CONNECT_TIMEOUT_SECS)),
            request_timeout: self
                .request_timeout
                .unwrap_or(Duration::from_secs(crate::DEFAULT_REQUEST_TIMEOUT_SECS)),
        })
    }
}
