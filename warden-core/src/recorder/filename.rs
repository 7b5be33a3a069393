//! Recording file naming.
//!
//! `[YYYY-MM-DD] <sanitized-title>.mp4` inside the channel's directory,
//! with ` (N)` appended on collision.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

/// Characters that cannot appear in a filename on any supported platform.
static FORBIDDEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*]"#).expect("forbidden-character class"));

/// Sanitized titles are capped at this many bytes before the extension.
const MAX_TITLE_BYTES: usize = 100;

/// Replace forbidden characters and truncate over-long titles on a char
/// boundary, marking the cut with an ellipsis.
pub fn sanitize_title(title: &str) -> String {
    let safe = FORBIDDEN.replace_all(title, "_");
    if safe.len() <= MAX_TITLE_BYTES {
        return safe.into_owned();
    }
    // Leave room for the 3-byte ellipsis.
    let mut out = String::with_capacity(MAX_TITLE_BYTES);
    for ch in safe.chars() {
        if out.len() + ch.len_utf8() > MAX_TITLE_BYTES - '…'.len_utf8() {
            break;
        }
        out.push(ch);
    }
    out.push('…');
    out
}

/// The first free `[date] title[ (N)].mp4` path inside `dir`.
pub fn unique_recording_path(dir: &Path, date: &str, sanitized_title: &str) -> PathBuf {
    let base = format!("[{date}] {sanitized_title}");
    let mut candidate = dir.join(format!("{base}.mp4"));
    let mut counter = 0u32;
    while candidate.exists() {
        counter += 1;
        candidate = dir.join(format!("{base} ({counter}).mp4"));
    }
    candidate
}
