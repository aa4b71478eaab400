//! OCR over a watched directory.
//!
//! Each request drops `{request_id}.png` into the drop directory. An external
//! OCR process appends one JSON line per result (`{"id": ..., "text": ...}`)
//! to the results file, and a watcher task routes each line back to the
//! waiting request by id.

use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{CollaboratorFuture, TextExtractor};
use crate::error::{PipelineError, Result};
use crate::paths::write_atomic;

const SERVICE: &str = "ocr";

#[derive(Debug, Clone)]
pub struct FileDropConfig {
    pub drop_dir: PathBuf,
    pub results_file: PathBuf,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Clone)]
pub struct FileDropOcr {
    inner: Arc<Inner>,
}

struct Inner {
    config: FileDropConfig,
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
    counter: AtomicU64,
    offset: Mutex<u64>,
}

#[derive(Deserialize)]
struct ResultLine {
    id: String,
    #[serde(default)]
    text: String,
}

impl FileDropOcr {
    pub fn new(config: FileDropConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.drop_dir)
            .map_err(|err| PipelineError::io(&config.drop_dir, err))?;
        // Results already on disk belong to earlier runs.
        let offset = std::fs::metadata(&config.results_file)
            .map(|meta| meta.len())
            .unwrap_or(0);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pending: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(0),
                offset: Mutex::new(offset),
            }),
        })
    }

    /// Creates the transport and spawns its results watcher on the current
    /// runtime. The watcher stops once every handle is dropped.
    pub fn start(config: FileDropConfig) -> Result<Self> {
        let ocr = Self::new(config)?;
        ocr.spawn_watcher();
        Ok(ocr)
    }

    fn spawn_watcher(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let ocr = FileDropOcr { inner };
                if let Err(err) = ocr.poll_once() {
                    warn!("ocr: failed to read results file: {}", err);
                }
            }
        });
    }

    /// Reads result lines appended since the last poll and completes the
    /// matching requests. Returns how many requests were completed.
    pub fn poll_once(&self) -> Result<usize> {
        let path = &self.inner.config.results_file;
        let mut file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(PipelineError::io(path, err)),
        };
        let mut offset = self
            .inner
            .offset
            .lock()
            .map_err(|_| PipelineError::Store("results offset lock poisoned".to_string()))?;
        let len = file
            .metadata()
            .map_err(|err| PipelineError::io(path, err))?
            .len();
        if len < *offset {
            // Truncated or replaced.
            *offset = 0;
        }
        file.seek(SeekFrom::Start(*offset))
            .map_err(|err| PipelineError::io(path, err))?;
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk)
            .map_err(|err| PipelineError::io(path, err))?;

        // Only consume complete lines; a partial trailing line is re-read next poll.
        let consumed = chunk
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map(|idx| idx + 1)
            .unwrap_or(0);
        *offset += consumed as u64;
        drop(offset);

        let mut delivered = 0;
        for line in chunk[..consumed].split(|byte| *byte == b'\n') {
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            let result: ResultLine = match serde_json::from_slice(line) {
                Ok(result) => result,
                Err(err) => {
                    warn!("ocr: skipping malformed result line: {}", err);
                    continue;
                }
            };
            if self.complete(&result.id, result.text) {
                delivered += 1;
            } else {
                debug!("ocr: no pending request for result {}", result.id);
            }
        }
        Ok(delivered)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn complete(&self, id: &str, text: String) -> bool {
        let sender = match self.inner.pending.lock() {
            Ok(mut pending) => pending.remove(id),
            Err(_) => None,
        };
        match sender {
            Some(sender) => sender.send(text).is_ok(),
            None => false,
        }
    }

    fn next_request_id(&self) -> String {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        format!("req-{}-{}", std::process::id(), n)
    }

    fn forget(&self, id: &str) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(id);
        }
    }

    async fn submit(self, image: Vec<u8>) -> Result<String> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .map_err(|_| PipelineError::unavailable(SERVICE, "pending table lock poisoned"))?
            .insert(id.clone(), tx);

        let drop_path = self.inner.config.drop_dir.join(format!("{}.png", id));
        if let Err(err) = write_atomic(&drop_path, &image) {
            self.forget(&id);
            return Err(PipelineError::unavailable(SERVICE, err));
        }
        debug!("ocr: dropped {}", drop_path.display());

        match tokio::time::timeout(self.inner.config.timeout, rx).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(_)) => Err(PipelineError::unavailable(
                SERVICE,
                format!("request {} was abandoned", id),
            )),
            Err(_) => {
                self.forget(&id);
                let _ = std::fs::remove_file(&drop_path);
                Err(PipelineError::unavailable(
                    SERVICE,
                    format!(
                        "no result for {} within {:.1}s",
                        id,
                        self.inner.config.timeout.as_secs_f32()
                    ),
                ))
            }
        }
    }
}

impl TextExtractor for FileDropOcr {
    fn extract(&self, image: Vec<u8>) -> CollaboratorFuture<String> {
        let ocr = self.clone();
        Box::pin(ocr.submit(image))
    }
}
