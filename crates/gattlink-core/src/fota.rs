// ── Firmware update pipeline ──
//
// A strictly serial FIFO of firmware jobs. Downloads are cached per
// URI across jobs; packaging produces one zip per job with a generated
// manifest. The pipeline exposes the in-flight device id so the
// reconnection scheduler never races a delivery.

use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Write};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::future::try_join_all;
use serde_json::json;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::error::CoreError;
use gattlink_ble::{DfuDriver, DfuUpdate, UpdateArtifact, UpdateStatus};

const EVENT_CAPACITY: usize = 64;

/// One firmware delivery job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FotaJob {
    pub device_id: String,
    pub job_id: String,
    pub uris: Vec<String>,
}

impl FotaJob {
    /// Convert the cloud's announcement tuple `[deviceId, jobId,
    /// jobStatus, downloadSize, host, path]` into a job. `path` is a
    /// space-separated list of relative file names served over https
    /// from `host`.
    pub fn from_tuple(payload: &[u8]) -> Result<Self, CoreError> {
        let tuple: Vec<serde_json::Value> = serde_json::from_slice(payload)?;
        let field = |i: usize, name: &str| -> Result<&str, CoreError> {
            tuple
                .get(i)
                .and_then(|v| v.as_str())
                .ok_or_else(|| CoreError::Protocol {
                    message: format!("firmware tuple missing {name}"),
                })
        };
        let device_id = field(0, "deviceId")?.to_owned();
        let job_id = field(1, "jobId")?.to_owned();
        let host = field(4, "host")?;
        let path = field(5, "path")?;

        let uris = path
            .split(' ')
            .filter(|f| !f.is_empty())
            .map(|f| format!("https://{host}/{f}"))
            .collect();
        Ok(Self {
            device_id,
            job_id,
            uris,
        })
    }
}

/// Pipeline notifications, consumed by the protocol engine.
#[derive(Debug, Clone)]
pub enum FotaEvent {
    DownloadProgress { job: FotaJob, percent: u8 },
    /// Non-terminal status update from the update driver.
    DfuStatus { job: FotaJob, update: DfuUpdate },
    Failed { job: FotaJob, message: String },
    Succeeded { job: FotaJob },
}

enum JobOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Clone)]
pub struct FotaPipeline {
    inner: Arc<Inner>,
}

struct QueueState {
    queue: VecDeque<FotaJob>,
    busy: bool,
}

struct Inner {
    dfu: Arc<dyn DfuDriver>,
    http: reqwest::Client,
    state: Mutex<QueueState>,
    /// URI → blob, shared across jobs.
    cache: Mutex<HashMap<String, Bytes>>,
    current_tx: watch::Sender<Option<String>>,
    events_tx: broadcast::Sender<FotaEvent>,
    cancel: CancellationToken,
}

impl FotaPipeline {
    pub fn new(dfu: Arc<dyn DfuDriver>, http: reqwest::Client) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (current_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                dfu,
                http,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    busy: false,
                }),
                cache: Mutex::new(HashMap::new()),
                current_tx,
                events_tx,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FotaEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Device id currently receiving firmware, for the scheduler gate.
    pub fn current_device(&self) -> watch::Receiver<Option<String>> {
        self.inner.current_tx.subscribe()
    }

    /// Queue a job, deduplicated by `(deviceId, jobId)` against the
    /// queued items. Returns whether the job was accepted.
    pub async fn enqueue(&self, job: FotaJob) -> bool {
        let start_worker = {
            let mut state = self.inner.state.lock().await;
            let duplicate = state
                .queue
                .iter()
                .any(|q| q.device_id == job.device_id && q.job_id == job.job_id);
            if duplicate {
                debug!(device = %job.device_id, job = %job.job_id, "dropping duplicate firmware job");
                return false;
            }
            info!(device = %job.device_id, job = %job.job_id, files = job.uris.len(), "queueing firmware job");
            state.queue.push_back(job);
            !std::mem::replace(&mut state.busy, true)
        };
        if start_worker {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.drain().await });
        }
        true
    }

    pub async fn queued_jobs(&self) -> Vec<FotaJob> {
        self.inner.state.lock().await.queue.iter().cloned().collect()
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn emit(&self, event: FotaEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn drain(&self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(job) = ({
                let mut state = self.state.lock().await;
                let next = state.queue.pop_front();
                if next.is_none() {
                    state.busy = false;
                }
                next
            }) else {
                break;
            };

            let _ = self.current_tx.send(Some(job.device_id.clone()));
            match self.process(&job).await {
                Ok(JobOutcome::Succeeded) => {
                    info!(device = %job.device_id, job = %job.job_id, "firmware job succeeded");
                    self.emit(FotaEvent::Succeeded { job });
                }
                Ok(JobOutcome::Failed(message)) => {
                    warn!(device = %job.device_id, job = %job.job_id, %message, "firmware job failed");
                    self.emit(FotaEvent::Failed { job, message });
                }
                Err(e) => {
                    warn!(device = %job.device_id, job = %job.job_id, error = %e, "firmware job failed");
                    self.emit(FotaEvent::Failed {
                        job,
                        message: e.to_string(),
                    });
                }
            }
        }
        let _ = self.current_tx.send(None);
    }

    async fn process(&self, job: &FotaJob) -> Result<JobOutcome, CoreError> {
        try_join_all(job.uris.iter().map(|uri| self.download(job, uri))).await?;
        let artifact = self.package(job).await?;
        self.deliver(job, artifact).await
    }

    /// Fetch one URI into the cache, reporting percent progress.
    async fn download(&self, job: &FotaJob, uri: &str) -> Result<(), CoreError> {
        if self.cache.lock().await.contains_key(uri) {
            debug!(%uri, "download cache hit");
            return Ok(());
        }
        let download_err = |reason: String| CoreError::Download {
            uri: uri.to_owned(),
            reason,
        };

        let response = self
            .http
            .get(uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| download_err(e.to_string()))?;
        let total = response.content_length().filter(|t| *t > 0);

        let mut body = Vec::new();
        let mut last_percent = 0u8;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| download_err(e.to_string()))?;
            body.extend_from_slice(&chunk);
            if let Some(total) = total {
                let received = u64::try_from(body.len()).unwrap_or(u64::MAX);
                let percent =
                    u8::try_from(received.saturating_mul(100) / total).unwrap_or(100).min(100);
                if percent != last_percent {
                    last_percent = percent;
                    self.emit(FotaEvent::DownloadProgress {
                        job: job.clone(),
                        percent,
                    });
                }
            }
        }
        debug!(%uri, bytes = body.len(), "download complete");
        self.cache.lock().await.insert(uri.to_owned(), Bytes::from(body));
        Ok(())
    }

    /// Zip the job's files together with the generated manifest.
    async fn package(&self, job: &FotaJob) -> Result<UpdateArtifact, CoreError> {
        let cache = self.cache.lock().await;
        let packaging = |e: zip::result::ZipError| CoreError::Packaging(e.to_string());
        let io = |e: std::io::Error| CoreError::Packaging(e.to_string());

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut files = Vec::with_capacity(job.uris.len() + 1);
        for uri in &job.uris {
            let blob = cache.get(uri).ok_or_else(|| CoreError::MissingDownload {
                uri: uri.clone(),
            })?;
            let name = file_name(uri);
            writer.start_file(&name, options).map_err(packaging)?;
            writer.write_all(blob).map_err(io)?;
            files.push(name);
        }

        let manifest = build_manifest(&files);
        writer.start_file("manifest.json", options).map_err(packaging)?;
        writer.write_all(manifest.as_bytes()).map_err(io)?;
        files.push("manifest.json".into());

        let cursor = writer.finish().map_err(packaging)?;
        Ok(UpdateArtifact {
            zip: Bytes::from(cursor.into_inner()),
            files,
        })
    }

    /// Hand the artifact to the update driver and follow its status
    /// stream to a terminal state.
    async fn deliver(&self, job: &FotaJob, artifact: UpdateArtifact) -> Result<JobOutcome, CoreError> {
        let mut updates = self.dfu.start_update(artifact, &job.device_id).await?;
        while let Some(update) = updates.recv().await {
            if update.error.is_some() {
                return Ok(JobOutcome::Failed(
                    update
                        .message
                        .unwrap_or_else(|| "update driver reported an error".into()),
                ));
            }
            match update.status {
                Some(UpdateStatus::DfuCompleted) => return Ok(JobOutcome::Succeeded),
                Some(UpdateStatus::DfuAborted) => {
                    return Ok(JobOutcome::Failed("update aborted".into()));
                }
                _ => self.emit(FotaEvent::DfuStatus {
                    job: job.clone(),
                    update,
                }),
            }
        }
        Ok(JobOutcome::Failed(
            "update stream ended without a terminal status".into(),
        ))
    }
}

fn file_name(uri: &str) -> String {
    uri.rsplit('/').next().unwrap_or(uri).to_owned()
}

/// The two-role manifest: `.bin` files name the binary, everything else
/// names its companion data file. A missing role stays empty; with
/// duplicates the last file wins.
fn build_manifest(files: &[String]) -> String {
    let mut bin = "";
    let mut dat = "";
    for file in files {
        if file.contains(".bin") {
            bin = file;
        } else {
            dat = file;
        }
    }
    json!({
        "manifest": { "application": { "bin_file": bin, "dat_file": dat } },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattlink_ble::DriverError;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    struct NoopDfu;

    #[async_trait::async_trait]
    impl DfuDriver for NoopDfu {
        async fn start_update(
            &self,
            _artifact: UpdateArtifact,
            _device_id: &str,
        ) -> Result<mpsc::Receiver<DfuUpdate>, DriverError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    #[test]
    fn tuple_conversion_builds_https_uris() {
        let payload = br#"["AA:BB","job1","0","1024","host.example","a.bin b.dat"]"#;
        let job = FotaJob::from_tuple(payload).expect("parse");
        assert_eq!(job.device_id, "AA:BB");
        assert_eq!(job.job_id, "job1");
        assert_eq!(
            job.uris,
            vec!["https://host.example/a.bin", "https://host.example/b.dat"]
        );
    }

    #[test]
    fn tuple_missing_path_is_a_protocol_error() {
        let payload = br#"["AA:BB","job1","0","1024"]"#;
        assert!(matches!(
            FotaJob::from_tuple(payload),
            Err(CoreError::Protocol { .. })
        ));
    }

    fn manifest_roles(files: &[&str]) -> (String, String) {
        let files: Vec<String> = files.iter().map(|f| (*f).to_owned()).collect();
        let manifest: serde_json::Value =
            serde_json::from_str(&build_manifest(&files)).expect("json");
        let application = &manifest["manifest"]["application"];
        (
            application["bin_file"].as_str().expect("bin_file").to_owned(),
            application["dat_file"].as_str().expect("dat_file").to_owned(),
        )
    }

    #[test]
    fn manifest_roles_are_selected_by_file_name() {
        assert_eq!(manifest_roles(&["a.bin", "b.dat"]), ("a.bin".into(), "b.dat".into()));
    }

    #[test]
    fn manifest_missing_role_stays_empty() {
        // Single-file jobs still deliver; the absent role is blank.
        assert_eq!(manifest_roles(&["only.bin"]), ("only.bin".into(), String::new()));
        assert_eq!(manifest_roles(&["only.dat"]), (String::new(), "only.dat".into()));
    }

    #[test]
    fn manifest_duplicate_role_keeps_the_last_file() {
        assert_eq!(
            manifest_roles(&["first.bin", "second.bin", "init.dat"]),
            ("second.bin".into(), "init.dat".into())
        );
    }

    #[tokio::test]
    async fn packaging_fails_when_a_download_is_missing() {
        let pipeline = FotaPipeline::new(Arc::new(NoopDfu), reqwest::Client::new());
        let job = FotaJob {
            device_id: "AA:BB".into(),
            job_id: "job1".into(),
            uris: vec!["https://host.example/a.bin".into()],
        };
        // Nothing was downloaded into the cache.
        assert!(matches!(
            pipeline.inner.package(&job).await,
            Err(CoreError::MissingDownload { .. })
        ));
    }

    #[test]
    fn file_name_takes_the_last_segment() {
        assert_eq!(file_name("https://host/a/b/app.bin"), "app.bin");
        assert_eq!(file_name("app.bin"), "app.bin");
    }
}
