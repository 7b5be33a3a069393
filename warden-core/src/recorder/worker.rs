//! The capture worker.
//!
//! One OS thread per recording: open the extractor, copy ~1 MiB chunks
//! into the destination file until cancellation, end-of-stream or an I/O
//! error, then post a completion code back to the pool's mailbox. A
//! cancelled worker exits quietly; the pool already removed its job.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_model::ChannelName;

use super::extract::{CaptureRequest, StreamExtractor};

pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Posted to the pool when a worker finishes on its own.
#[derive(Debug)]
pub struct Completion {
    pub channel: ChannelName,
    /// 0 clean end-of-stream, 1 error or read abort.
    pub code: i32,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn spawn_capture(
    extractor: Arc<dyn StreamExtractor>,
    request: CaptureRequest,
    destination: PathBuf,
    cancel: CancellationToken,
    completions: mpsc::Sender<Completion>,
    active: Arc<AtomicUsize>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    active.fetch_add(1, Ordering::SeqCst);
    let guard = ActiveGuard(active);
    let channel = request.channel.clone();

    std::thread::Builder::new()
        .name(format!("capture-{channel}"))
        .spawn(move || {
            let _guard = guard;
            match run_capture(&extractor, &request, &destination, &cancel) {
                Some(code) => {
                    if code == 0 {
                        info!(%channel, path = %destination.display(), "capture completed");
                    } else {
                        warn!(%channel, path = %destination.display(), "capture ended with error");
                    }
                    let _ = completions.blocking_send(Completion { channel, code });
                }
                None => {
                    debug!(%channel, "capture cancelled");
                }
            }
        })
}

/// Returns the completion code, or None when the worker was cancelled.
fn run_capture(
    extractor: &Arc<dyn StreamExtractor>,
    request: &CaptureRequest,
    destination: &PathBuf,
    cancel: &CancellationToken,
) -> Option<i32> {
    let mut source = match extractor.open(request) {
        Ok(source) => source,
        Err(err) => {
            error!(channel = %request.channel, %err, "extractor open failed");
            return Some(1);
        }
    };

    let mut file = match File::create(destination) {
        Ok(file) => file,
        Err(err) => {
            error!(path = %destination.display(), %err, "destination create failed");
            return Some(1);
        }
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut code = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match source.read_chunk(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(err) = file.write_all(&buf[..n]) {
                    warn!(channel = %request.channel, %err, "write failed, aborting capture");
                    code = 1;
                    break;
                }
            }
            Err(err) => {
                warn!(channel = %request.channel, %err, "stream read failed");
                code = 1;
                break;
            }
        }
    }

    let _ = file.flush();
    drop(source);

    if cancel.is_cancelled() {
        None
    } else {
        Some(code)
    }
}
