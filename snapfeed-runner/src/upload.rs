//! Upload sinks for archive files.
//!
//! A sink takes a local file and returns a shareable link. The archival step
//! treats both outcomes as terminal: there is no retry.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload transport error: {0}")]
    Transport(String),

    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("invalid credentials: {0}")]
    Credentials(String),
}

/// Destination for finished archive files.
pub trait UploadSink: Send + Sync {
    fn name(&self) -> &str;

    /// Upload the file at `path`, returning a link to it.
    fn upload(&self, path: &Path) -> Result<String, UploadError>;
}

/// Username/password pair for an upload service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    /// Parse a `user_password` token. Only the first `_` separates the two
    /// halves, so passwords may contain underscores.
    pub fn parse(token: &str) -> Result<Self, UploadError> {
        let (user, password) = token
            .split_once('_')
            .ok_or_else(|| UploadError::Credentials("expected '<user>_<password>'".into()))?;
        if user.is_empty() || password.is_empty() {
            return Err(UploadError::Credentials(
                "user and password must both be non-empty".into(),
            ));
        }
        Ok(Self {
            user: user.to_string(),
            password: password.to_string(),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Copies archives into a directory and links to the copy.
///
/// A file already present under the same name is left alone and the upload
/// is rejected, so a link handed out earlier keeps pointing at its content.
pub struct LocalDirSink {
    dir: PathBuf,
}

impl LocalDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl UploadSink for LocalDirSink {
    fn name(&self) -> &str {
        "local"
    }

    fn upload(&self, path: &Path) -> Result<String, UploadError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| UploadError::Rejected(format!("{} has no file name", path.display())))?;
        let mut source = File::open(path)?;
        fs::create_dir_all(&self.dir)?;
        let dest = self.dir.join(file_name);
        let mut out = match OpenOptions::new().write(true).create_new(true).open(&dest) {
            Ok(out) => out,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(UploadError::Rejected(format!(
                    "{} already exists",
                    dest.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = io::copy(&mut source, &mut out) {
            drop(out);
            let _ = fs::remove_file(&dest);
            return Err(e.into());
        }
        let dest = dest.canonicalize().unwrap_or(dest);
        Ok(format!("file://{}", dest.display()))
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    link: Option<String>,
}

/// `PUT`s archives to `<url>/<file name>` with basic auth.
///
/// The link is taken from a JSON `link` field in the response, then the
/// `Location` header, then the request URL itself.
pub struct HttpUploadSink {
    client: reqwest::blocking::Client,
    url: String,
    credentials: Credentials,
}

impl HttpUploadSink {
    pub fn new(
        url: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, UploadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            credentials,
        })
    }
}

impl UploadSink for HttpUploadSink {
    fn name(&self) -> &str {
        "http"
    }

    fn upload(&self, path: &Path) -> Result<String, UploadError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::Rejected(format!("{} has no file name", path.display())))?;
        let target = format!("{}/{}", self.url.trim_end_matches('/'), file_name);
        let body = fs::read(path)?;

        let resp = self
            .client
            .put(&target)
            .basic_auth(&self.credentials.user, Some(&self.credentials.password))
            .header(reqwest::header::CONTENT_TYPE, "application/zstd")
            .body(body)
            .send()
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UploadError::Rejected(format!("HTTP {status} for {target}")));
        }

        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = resp.text().unwrap_or_default();
        let link = serde_json::from_str::<UploadResponse>(&text)
            .ok()
            .and_then(|r| r.link)
            .or(location)
            .unwrap_or(target);
        Ok(link)
    }
}
