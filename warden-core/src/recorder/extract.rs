//! The opaque media-extraction seam.
//!
//! The capture worker only ever sees a byte source behind a trait. The
//! default implementation drives the `streamlink` CLI over a stdout pipe;
//! rendition selection and ad handling stay the extractor's business.

use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};

use tracing::debug;

use warden_model::{ChannelName, Quality};

/// Everything a worker hands the extractor to open one capture.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub channel: ChannelName,
    pub quality: Quality,
    /// Operator-supplied auth cookie; without it the extractor requests
    /// ad-free mode instead.
    pub auth_token: Option<String>,
}

/// A live byte stream, read in chunks on a blocking thread.
pub trait StreamSource: Send {
    /// Read the next chunk; Ok(0) is end-of-stream.
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// Opens a [`StreamSource`] for a capture request.
#[cfg_attr(any(test, feature = "test-support"), mockall::automock)]
pub trait StreamExtractor: Send + Sync {
    fn open(&self, request: &CaptureRequest) -> std::io::Result<Box<dyn StreamSource>>;
}

/// Streamlink session limits, mirrored from the upstream defaults the
/// recorder has always run with.
const STREAM_TIMEOUT_SECS: u32 = 60;
const RING_BUFFER: &str = "32M";

/// `streamlink`-backed extractor.
#[derive(Debug, Clone)]
pub struct StreamlinkExtractor {
    program: String,
}

impl StreamlinkExtractor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn build_command(&self, request: &CaptureRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--stdout")
            .arg("--stream-timeout")
            .arg(STREAM_TIMEOUT_SECS.to_string())
            .arg("--ringbuffer-size")
            .arg(RING_BUFFER);

        match &request.auth_token {
            Some(token) => {
                cmd.arg("--http-header")
                    .arg(format!("Authorization=OAuth {token}"))
                    .arg("--http-cookie")
                    .arg(format!("auth-token={token}"));
            }
            None => {
                cmd.arg("--twitch-disable-ads");
            }
        }

        cmd.arg(format!("https://twitch.tv/{}", request.channel));
        // Preferred rendition with best-quality fallback.
        if request.quality.is_best() {
            cmd.arg("best");
        } else {
            cmd.arg(format!("{},best", request.quality));
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }
}

impl StreamExtractor for StreamlinkExtractor {
    fn open(&self, request: &CaptureRequest) -> std::io::Result<Box<dyn StreamSource>> {
        let mut command = self.build_command(request);
        debug!(channel = %request.channel, "spawning media extractor");
        let mut child = command.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("extractor spawned without a stdout pipe")
        })?;
        Ok(Box::new(ProcessSource { child, stdout }))
    }
}

struct ProcessSource {
    child: Child,
    stdout: ChildStdout,
}

impl StreamSource for ProcessSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for ProcessSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn cookie_auth_sets_header_and_cookie() {
        let extractor = StreamlinkExtractor::new("streamlink");
        let cmd = extractor.build_command(&CaptureRequest {
            channel: ChannelName::new("alice"),
            quality: Quality::default(),
            auth_token: Some("tok123".into()),
        });
        let args = args_of(&cmd);
        assert!(args.contains(&"Authorization=OAuth tok123".to_string()));
        assert!(args.contains(&"auth-token=tok123".to_string()));
        assert!(!args.contains(&"--twitch-disable-ads".to_string()));
        assert!(args.contains(&"https://twitch.tv/alice".to_string()));
    }

    #[test]
    fn without_cookie_requests_ad_free_mode() {
        let extractor = StreamlinkExtractor::new("streamlink");
        let cmd = extractor.build_command(&CaptureRequest {
            channel: ChannelName::new("alice"),
            quality: Quality::default(),
            auth_token: None,
        });
        let args = args_of(&cmd);
        assert!(args.contains(&"--twitch-disable-ads".to_string()));
        assert_eq!(args.last().unwrap(), "best");
    }

    #[test]
    fn preferred_quality_keeps_best_fallback() {
        let extractor = StreamlinkExtractor::new("streamlink");
        let cmd = extractor.build_command(&CaptureRequest {
            channel: ChannelName::new("alice"),
            quality: Quality::new("720p60"),
            auth_token: None,
        });
        assert_eq!(args_of(&cmd).last().unwrap(), "720p60,best");
    }
}
