//! Firmware update pipeline: resolve redirects, stream the image into a
//! staged write, report progress over MQTT, then restart.
//!
//! The pipeline is an explicit state machine (`UpdateAttempt::step`) driven
//! to completion by `run`, which yields to the transport between steps so
//! the broker connection is not starved during a multi-minute transfer.
//! Failure at any step aborts the staged write and leaves the previous
//! firmware image untouched.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::session::TOPIC_UPDATE_STATUS;
use crate::transport::{Publish, Transport};

/// Redirect hops followed before giving up.
pub const MAX_REDIRECTS: u32 = 3;

/// Publish progress whenever it advances by at least this many percent.
const PROGRESS_STEP_PCT: i64 = 5;

/// Absolute ceiling on the whole download, measured from attempt start.
const DOWNLOAD_TIMEOUT_SECS: i64 = 5 * 60;

/// Rolling ceiling on a single chunk read.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded wait for the broker to take the "done" status before reboot.
const DONE_FLUSH: Duration = Duration::from_millis(2500);
const REBOOT_FLUSH: Duration = Duration::from_millis(1500);

// ---------------------------------------------------------------------------
// Errors — one terminal failure per pipeline step
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("request failed: {0}")]
    Begin(String),
    #[error("redirect without a Location header")]
    RedirectNoLocation,
    #[error("redirect limit exceeded ({MAX_REDIRECTS} hops)")]
    RedirectLimit,
    #[error("http status {0}")]
    Download(u16),
    #[error("firmware file empty or size unknown")]
    InvalidFile,
    #[error("staging begin failed: {0}")]
    FlashBegin(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("read timed out")]
    ReadTimeout,
    #[error("download timed out")]
    DownloadTimeout,
    #[error("staging write failed: {0}")]
    FlashWrite(String),
    #[error("finalize failed: {0}")]
    FlashEnd(String),
    #[error("staged image incomplete")]
    NotFinished,
}

impl UpdateError {
    /// Step name reported in the `{"status":"error","step":…}` publish.
    pub fn step(&self) -> &'static str {
        match self {
            UpdateError::Begin(_) => "begin",
            UpdateError::RedirectNoLocation => "redirect_no_location",
            UpdateError::RedirectLimit => "redirect_limit",
            UpdateError::Download(_) => "download",
            UpdateError::InvalidFile => "invalid_file",
            UpdateError::FlashBegin(_) => "flash_begin",
            UpdateError::ReadFailed(_) => "read_failed",
            UpdateError::ReadTimeout => "read_timeout",
            UpdateError::DownloadTimeout => "download_timeout",
            UpdateError::FlashWrite(_) => "flash_write",
            UpdateError::FlashEnd(_) => "flash_end",
            UpdateError::NotFinished => "not_finished",
        }
    }
}

// ---------------------------------------------------------------------------
// Staged write target
// ---------------------------------------------------------------------------

/// A write target that only becomes the active image after a successful
/// finalize. Aborting at any point leaves the active image untouched.
pub trait FirmwareStage {
    fn begin(&mut self, total: u64) -> anyhow::Result<()>;
    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()>;
    /// Returns `Ok(false)` when the staged image is incomplete.
    fn finalize(&mut self) -> anyhow::Result<bool>;
    fn abort(&mut self);
}

/// File-backed staging: bytes stream into `<path>.staging`, which is
/// renamed over the active image path at finalize.
pub struct FileStage {
    active: PathBuf,
    staging: PathBuf,
    file: Option<fs::File>,
    expected: u64,
    written: u64,
}

impl FileStage {
    pub fn new(active_path: &Path) -> Self {
        let mut staging = active_path.as_os_str().to_owned();
        staging.push(".staging");
        Self {
            active: active_path.to_path_buf(),
            staging: PathBuf::from(staging),
            file: None,
            expected: 0,
            written: 0,
        }
    }
}

impl FirmwareStage for FileStage {
    fn begin(&mut self, total: u64) -> anyhow::Result<()> {
        if let Some(parent) = self.staging.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        self.file = Some(fs::File::create(&self.staging)?);
        self.expected = total;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("staging not started"))?;
        file.write_all(chunk)?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn finalize(&mut self) -> anyhow::Result<bool> {
        let file = self
            .file
            .take()
            .ok_or_else(|| anyhow::anyhow!("staging not started"))?;
        file.sync_all()?;
        drop(file);
        if self.written != self.expected {
            return Ok(false);
        }
        fs::rename(&self.staging, &self.active)?;
        Ok(true)
    }

    fn abort(&mut self) {
        self.file = None;
        let _ = fs::remove_file(&self.staging);
    }
}

// ---------------------------------------------------------------------------
// Byte source
// ---------------------------------------------------------------------------

pub(crate) struct FetchHead {
    pub status: u16,
    pub location: Option<String>,
    pub content_length: u64,
}

#[allow(async_fn_in_trait)]
pub(crate) trait FetchSource {
    /// Open `url` and return the response head. Must not follow redirects.
    async fn begin(&mut self, url: &str) -> Result<FetchHead, UpdateError>;

    /// Next body chunk; `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, UpdateError>;
}

pub(crate) struct HttpSource {
    client: reqwest::Client,
    response: Option<reqwest::Response>,
}

impl HttpSource {
    pub(crate) fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            response: None,
        })
    }
}

impl FetchSource for HttpSource {
    async fn begin(&mut self, url: &str) -> Result<FetchHead, UpdateError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::Begin(e.to_string()))?;
        let head = FetchHead {
            status: resp.status().as_u16(),
            location: resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            content_length: resp.content_length().unwrap_or(0),
        };
        self.response = Some(resp);
        Ok(head)
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, UpdateError> {
        let Some(resp) = self.response.as_mut() else {
            return Ok(None);
        };
        match tokio::time::timeout(READ_TIMEOUT, resp.chunk()).await {
            Ok(Ok(Some(bytes))) => Ok(Some(bytes.to_vec())),
            Ok(Ok(None)) => Ok(None),
            Ok(Err(e)) => Err(UpdateError::ReadFailed(e.to_string())),
            Err(_) => Err(UpdateError::ReadTimeout),
        }
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

// ---------------------------------------------------------------------------
// Attempt state machine
// ---------------------------------------------------------------------------

enum Step {
    Resolve,
    Validate { head: FetchHead },
    Stream,
    Finalize,
    Complete,
}

#[derive(Debug)]
pub(crate) enum StepOutcome {
    Continue,
    Complete,
}

pub(crate) struct UpdateAttempt<S: FetchSource> {
    src: S,
    url: String,
    hops: u32,
    started_at: i64,
    total: u64,
    written: u64,
    last_pct: i64,
    step: Step,
}

impl<S: FetchSource> UpdateAttempt<S> {
    pub(crate) fn new(url: &str, src: S, started_at: i64) -> Self {
        Self {
            src,
            url: url.to_string(),
            hops: 0,
            started_at,
            total: 0,
            written: 0,
            last_pct: -1,
            step: Step::Resolve,
        }
    }

    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    /// Advance the attempt by one bounded step. Errors are terminal for the
    /// whole attempt.
    pub(crate) async fn step(
        &mut self,
        now: i64,
        stage: &mut dyn FirmwareStage,
        link: &mut dyn Publish,
    ) -> Result<StepOutcome, UpdateError> {
        if now - self.started_at > DOWNLOAD_TIMEOUT_SECS {
            return Err(UpdateError::DownloadTimeout);
        }

        match std::mem::replace(&mut self.step, Step::Complete) {
            Step::Resolve => {
                let head = self.src.begin(&self.url).await?;
                if is_redirect(head.status) {
                    match head.location {
                        None => return Err(UpdateError::RedirectNoLocation),
                        Some(_) if self.hops >= MAX_REDIRECTS => {
                            return Err(UpdateError::RedirectLimit)
                        }
                        Some(location) => {
                            info!(hop = self.hops + 1, to = %location, "following redirect");
                            self.url = location;
                            self.hops += 1;
                            self.step = Step::Resolve;
                        }
                    }
                } else {
                    self.step = Step::Validate { head };
                }
                Ok(StepOutcome::Continue)
            }

            Step::Validate { head } => {
                if head.status != 200 {
                    return Err(UpdateError::Download(head.status));
                }
                if head.content_length == 0 {
                    return Err(UpdateError::InvalidFile);
                }
                stage
                    .begin(head.content_length)
                    .map_err(|e| UpdateError::FlashBegin(e.to_string()))?;
                self.total = head.content_length;
                info!(size = self.total, "downloading firmware");
                publish_status(link, &json!({"status": "downloading", "size": self.total}));
                self.step = Step::Stream;
                Ok(StepOutcome::Continue)
            }

            Step::Stream => {
                match self.src.next_chunk().await? {
                    Some(chunk) => {
                        stage
                            .write(&chunk)
                            .map_err(|e| UpdateError::FlashWrite(e.to_string()))?;
                        self.written += chunk.len() as u64;
                        if self.written > self.total {
                            return Err(UpdateError::ReadFailed(
                                "more data than declared".to_string(),
                            ));
                        }
                        if let Some(pct) = self.progress_due() {
                            self.last_pct = pct;
                            publish_status(
                                link,
                                &json!({
                                    "status": "writing",
                                    "progress": pct,
                                    "written": self.written,
                                    "total": self.total,
                                }),
                            );
                        }
                        self.step = if self.written == self.total {
                            Step::Finalize
                        } else {
                            Step::Stream
                        };
                        Ok(StepOutcome::Continue)
                    }
                    None if self.written == self.total => {
                        self.step = Step::Finalize;
                        Ok(StepOutcome::Continue)
                    }
                    None => Err(UpdateError::ReadFailed(format!(
                        "stream ended at {} of {} bytes",
                        self.written, self.total
                    ))),
                }
            }

            Step::Finalize => {
                let finished = stage
                    .finalize()
                    .map_err(|e| UpdateError::FlashEnd(e.to_string()))?;
                if !finished {
                    return Err(UpdateError::NotFinished);
                }
                self.step = Step::Complete;
                Ok(StepOutcome::Complete)
            }

            Step::Complete => Ok(StepOutcome::Complete),
        }
    }

    /// Progress percentage to report, when it advanced at least
    /// `PROGRESS_STEP_PCT` since the last report or the transfer completed.
    fn progress_due(&self) -> Option<i64> {
        let pct = (self.written * 100 / self.total) as i64;
        let due = pct - self.last_pct >= PROGRESS_STEP_PCT
            || (self.written == self.total && pct != self.last_pct);
        due.then_some(pct)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Run one update attempt to its terminal state. On success the staged
/// image has been activated and the caller must restart the device; on
/// failure the previous image is untouched and normal operation resumes.
pub(crate) async fn run<S: FetchSource, T: Transport>(
    url: &str,
    src: S,
    stage: &mut dyn FirmwareStage,
    transport: &mut T,
    clock: &dyn Clock,
) -> Result<u64, UpdateError> {
    info!(url, "firmware update starting");
    publish_status(transport, &json!({"status": "starting"}));

    let mut attempt = UpdateAttempt::new(url, src, clock.now());
    loop {
        match attempt.step(clock.now(), stage, transport).await {
            Ok(StepOutcome::Complete) => break,
            Ok(StepOutcome::Continue) => {
                // Keep the broker connection serviced during the transfer.
                let _ = transport.process().await;
            }
            Err(e) => {
                error!(step = e.step(), "firmware update failed: {e}");
                publish_status(transport, &json!({"status": "error", "step": e.step()}));
                stage.abort();
                return Err(e);
            }
        }
    }

    let written = attempt.written();
    info!(written, "firmware update complete — restarting");
    publish_status(transport, &json!({"status": "done", "written": written}));
    transport.flush(DONE_FLUSH).await;
    publish_status(transport, &json!({"status": "rebooting"}));
    transport.flush(REBOOT_FLUSH).await;
    Ok(written)
}

fn publish_status(link: &mut dyn Publish, value: &serde_json::Value) {
    if let Err(e) = link.publish(TOPIC_UPDATE_STATUS, &value.to_string(), false) {
        warn!("update status publish failed (dropped): {e}");
    }
}

// ---------------------------------------------------------------------------
// Scripted source (tests only)
// ---------------------------------------------------------------------------

/// Scripted byte source: a list of response heads (one per `begin`) and a
/// list of body chunks.
#[cfg(test)]
pub(crate) struct ScriptedSource {
    pub(crate) heads: Vec<FetchHead>,
    pub(crate) chunks: Vec<Result<Option<Vec<u8>>, UpdateError>>,
    pub(crate) begun_urls: Vec<String>,
}

#[cfg(test)]
impl ScriptedSource {
    pub(crate) fn ok_with_body(total: u64, chunks: Vec<Vec<u8>>) -> Self {
        let mut scripted: Vec<Result<Option<Vec<u8>>, UpdateError>> =
            chunks.into_iter().map(|c| Ok(Some(c))).collect();
        scripted.push(Ok(None));
        Self {
            heads: vec![FetchHead {
                status: 200,
                location: None,
                content_length: total,
            }],
            chunks: scripted,
            begun_urls: Vec::new(),
        }
    }

    pub(crate) fn redirects(n: usize, then_status: u16, total: u64) -> Self {
        let mut heads: Vec<FetchHead> = (0..n)
            .map(|i| FetchHead {
                status: 302,
                location: Some(format!("https://host/hop{i}")),
                content_length: 0,
            })
            .collect();
        heads.push(FetchHead {
            status: then_status,
            location: None,
            content_length: total,
        });
        Self {
            heads,
            chunks: vec![Ok(None)],
            begun_urls: Vec::new(),
        }
    }
}

#[cfg(test)]
impl FetchSource for ScriptedSource {
    async fn begin(&mut self, url: &str) -> Result<FetchHead, UpdateError> {
        self.begun_urls.push(url.to_string());
        if self.heads.is_empty() {
            return Err(UpdateError::Begin("no more scripted responses".into()));
        }
        Ok(self.heads.remove(0))
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, UpdateError> {
        if self.chunks.is_empty() {
            return Ok(None);
        }
        self.chunks.remove(0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
