//! Remote submission to the enterprise execution service.

use core::result::Result as CoreResult;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use barrage_core::{
    BuildError, EnterpriseConfig, RemoteSubmissionError, ResolvedClasspath, Result, RetryPolicy,
    SourceGroup,
};
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Error as ReqwestError, Response, StatusCode};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::fs::read as read_package;
use tokio::task;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Version sent with every request so the service can reject outdated clients.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Header carrying [`CLIENT_VERSION`].
pub const CLIENT_VERSION_HEADER: &str = "x-barrage-client-version";

/// Body marker of a rejection aimed at the client version.
const UNSUPPORTED_CLIENT_MARKER: &str = "unsupported client";

/// State of a run on the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteRunState {
    /// Accepted and not yet finished
    Running,
    /// Finished successfully
    Succeeded,
}

/// Parses a remote run status; terminal failures become [`RemoteSubmissionError::Remote`].
///
/// # Errors
/// Returns an error for any status that is neither in progress nor successful.
pub fn parse_run_status(status: &str) -> CoreResult<RemoteRunState, RemoteSubmissionError> {
    match status.to_ascii_lowercase().as_str() {
        "successful" | "succeeded" | "completed" => Ok(RemoteRunState::Succeeded),
        "queued" | "pending" | "building" | "deploying" | "deployed" | "injecting"
        | "running" | "started" => Ok(RemoteRunState::Running),
        other => Err(RemoteSubmissionError::Remote(format!(
            "remote run ended with status '{other}'"
        ))),
    }
}

/// Maps a response status onto the submission outcome.
///
/// # Errors
/// Returns the classified failure for any non-2xx status.
pub fn classify_status(
    status: StatusCode,
    body: &str,
) -> CoreResult<(), RemoteSubmissionError> {
    if status.is_success() {
        return Ok(());
    }
    let message = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    let outdated_client = body.to_ascii_lowercase().contains(UNSUPPORTED_CLIENT_MARKER);
    Err(match status.as_u16() {
        426 => RemoteSubmissionError::UnsupportedClient(message),
        400 | 403 if outdated_client => RemoteSubmissionError::UnsupportedClient(message),
        400 | 401 | 403 | 404 | 422 => RemoteSubmissionError::InvalidConfig(message),
        402 | 429 => RemoteSubmissionError::Quota(message),
        502..=504 => RemoteSubmissionError::Network(message),
        _ => RemoteSubmissionError::Remote(message),
    })
}

/// Operations of the remote execution service.
#[async_trait]
pub trait EnterpriseClient: Send + Sync {
    /// Replaces the content of `package_id` with the archive at `package`.
    async fn upload_package(&self, package_id: &str, package: &Path) -> Result<()>;

    /// Starts a remote simulation and returns its run identifier.
    async fn start_simulation(&self, simulation_id: &str) -> Result<String>;

    /// Current state of a started run.
    async fn run_status(&self, run_id: &str) -> Result<RemoteRunState>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    run_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

/// Headers identifying this client to the service.
pub fn client_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static(CLIENT_VERSION_HEADER),
        HeaderValue::from_static(CLIENT_VERSION),
    );
    headers
}

/// [`EnterpriseClient`] speaking the service's public HTTP API.
pub struct HttpEnterpriseClient {
    /// HTTP client for API requests.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// API token.
    token: String,
}

impl HttpEnterpriseClient {
    /// Creates a client from the enterprise settings.
    ///
    /// # Errors
    /// Returns a configuration error if the endpoint is empty or the
    /// credentials variable is unset, and an HTTP error if the client
    /// cannot be initialised.
    pub fn new(config: &EnterpriseConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(BuildError::Configuration(
                "enterprise.endpoint must be set to upload".to_owned(),
            ));
        }
        let client = Client::builder()
            .user_agent(format!("barrage/{CLIENT_VERSION}"))
            .default_headers(client_headers())
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_owned(),
            token: config.credentials()?,
        })
    }

    async fn check(response: CoreResult<Response, ReqwestError>) -> Result<Response> {
        let response = response.map_err(|error| {
            if error.is_connect() {
                RemoteSubmissionError::Unreachable(error.to_string())
            } else {
                RemoteSubmissionError::Network(error.to_string())
            }
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body)
            .err()
            .unwrap_or_else(|| RemoteSubmissionError::Remote(status.to_string()))
            .into())
    }

    async fn parse<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T> {
        response.json().await.map_err(|error| {
            RemoteSubmissionError::Remote(format!("unexpected response: {error}")).into()
        })
    }
}

#[async_trait]
impl EnterpriseClient for HttpEnterpriseClient {
    async fn upload_package(&self, package_id: &str, package: &Path) -> Result<()> {
        let body = read_package(package).await?;
        let url = format!("{}/api/public/packages/{package_id}/content", self.endpoint);
        debug!("Uploading {} bytes to {url}", body.len());
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await;
        Self::check(response).await?;
        Ok(())
    }

    async fn start_simulation(&self, simulation_id: &str) -> Result<String> {
        let url = format!("{}/api/public/simulations/{simulation_id}/start", self.endpoint);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .send()
            .await;
        let started: StartResponse = Self::parse(Self::check(response).await?).await?;
        Ok(started.run_id)
    }

    async fn run_status(&self, run_id: &str) -> Result<RemoteRunState> {
        let url = format!("{}/api/public/runs/{run_id}", self.endpoint);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await;
        let status: StatusResponse = Self::parse(Self::check(response).await?).await?;
        Ok(parse_run_status(&status.status)?)
    }
}

/// Result of a completed submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    /// Package the artifacts were uploaded to
    pub package_id: String,
    /// Remote run, when a simulation was started
    pub run_id: Option<String>,
    /// Last observed state of the remote run
    pub state: Option<RemoteRunState>,
}

/// Uploads packages and drives remote runs with bounded retries.
pub struct RemoteSubmitter {
    client: Arc<dyn EnterpriseClient>,
    config: EnterpriseConfig,
}

impl RemoteSubmitter {
    /// Creates a submitter over `client`.
    pub fn new(client: Arc<dyn EnterpriseClient>, config: EnterpriseConfig) -> Self {
        Self { client, config }
    }

    /// Uploads `package`, then optionally starts and awaits the remote run.
    ///
    /// # Errors
    /// Returns the classified remote failure once retries are exhausted,
    /// [`BuildError::Cancelled`] on cancellation and [`BuildError::TimedOut`]
    /// when the configured limit expires.
    pub async fn submit(&self, package: &Path, cancel: &CancellationToken) -> Result<SubmissionOutcome> {
        match self.config.timeout() {
            Some(limit) => timeout(limit, self.submit_inner(package, cancel))
                .await
                .unwrap_or(Err(BuildError::TimedOut(limit))),
            None => self.submit_inner(package, cancel).await,
        }
    }

    async fn submit_inner(&self, package: &Path, cancel: &CancellationToken) -> Result<SubmissionOutcome> {
        if self.config.package_id.trim().is_empty() {
            return Err(RemoteSubmissionError::InvalidConfig(
                "enterprise.package_id is empty".to_owned(),
            )
            .into());
        }
        let policy = self.config.retry_policy();
        let package_id = self.config.package_id.as_str();

        with_retry(policy, cancel, "package upload", BuildError::is_retryable, || {
            self.client.upload_package(package_id, package)
        })
        .await?;
        info!("Uploaded {} to package {package_id}", package.display());

        let mut outcome = SubmissionOutcome {
            package_id: package_id.to_owned(),
            run_id: None,
            state: None,
        };
        let Some(simulation_id) = self.config.simulation_id.as_deref() else {
            return Ok(outcome);
        };

        // A start that may have reached the service is never sent twice.
        let run_id = with_retry(policy, cancel, "simulation start", BuildError::is_unsent, || {
            self.client.start_simulation(simulation_id)
        })
        .await?;
        info!(run_id, "Started remote simulation {simulation_id}");
        outcome.run_id = Some(run_id.clone());
        outcome.state = Some(RemoteRunState::Running);

        if !self.config.wait_for_completion {
            return Ok(outcome);
        }

        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        loop {
            let state = with_retry(policy, cancel, "run status", BuildError::is_retryable, || {
                self.client.run_status(&run_id)
            })
            .await?;
            if state == RemoteRunState::Succeeded {
                info!(run_id, "Remote run finished");
                outcome.state = Some(state);
                return Ok(outcome);
            }
            debug!(run_id, "Remote run still in progress");
            tokio::select! {
                () = cancel.cancelled() => return Err(BuildError::Cancelled),
                () = sleep(interval) => {}
            }
        }
    }
}

/// Runs `operation`, retrying failures accepted by `retry_if` per `policy`.
async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    retry_if: fn(&BuildError) -> bool,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if retry_if(&error) && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!("{what} failed ({error}); retry {attempt} in {delay:?}");
                tokio::select! {
                    () = cancel.cancelled() => return Err(BuildError::Cancelled),
                    () = sleep(delay) => {}
                }
            }
            Err(error) => return Err(error),
        }
    }
}

/// Writes `<packages_dir>/<group>.tar.gz` from the group's runtime
/// classpath without the engine.
///
/// Directories (compiled output and resources of the group and its upstream
/// groups) are merged at the archive root; dependency archives go under
/// `lib/`.
///
/// # Errors
/// Returns an error if a classpath entry is missing or the archive cannot be
/// written.
pub async fn create_package(
    group: &SourceGroup,
    classpath: &ResolvedClasspath,
    packages_dir: &Path,
) -> Result<PathBuf> {
    let group = group.clone();
    let classpath = classpath.clone();
    let packages_dir = packages_dir.to_path_buf();
    task::spawn_blocking(move || write_package(&group, &classpath, &packages_dir))
        .await
        .map_err(|error| BuildError::Internal(format!("packaging task failed: {error}")))?
}

fn write_package(
    group: &SourceGroup,
    classpath: &ResolvedClasspath,
    packages_dir: &Path,
) -> Result<PathBuf> {
    if !group.output_dir.is_dir() {
        return Err(BuildError::Resolution(format!(
            "no compiled output for source group '{}' at {}",
            group.name,
            group.output_dir.display()
        )));
    }
    fs::create_dir_all(packages_dir)?;
    let destination = packages_dir.join(format!("{}.tar.gz", group.name));

    let temp = NamedTempFile::new_in(packages_dir)?;
    let encoder = GzEncoder::new(temp.reopen()?, Compression::default());
    let mut archive = tar::Builder::new(encoder);
    archive.follow_symlinks(false);
    for entry in classpath.entries() {
        if entry.is_dir() {
            archive.append_dir_all(".", entry)?;
        } else if let Some(name) = entry.file_name() {
            if !entry.is_file() {
                return Err(BuildError::Resolution(format!(
                    "classpath entry {} of source group '{}' does not exist",
                    entry.display(),
                    group.name
                )));
            }
            archive.append_path_with_name(entry, Path::new("lib").join(name))?;
        }
    }
    archive.into_inner()?.finish()?.sync_all()?;
    temp.persist(&destination).map_err(|error| error.error)?;

    debug!(
        entries = classpath.len(),
        "Packaged '{}' into {}",
        group.name,
        destination.display()
    );
    Ok(destination)
}
