// Local media discovery and content sniffing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Image,
    Text,
    Other,
}

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "wav", "ogg"];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "json"];

fn extension_of(name: &str) -> Option<String> {
    let path_part = name.split(['?', '#']).next().unwrap_or(name);
    Path::new(path_part)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

/// Classify a file name or URL by its extension.
pub fn kind_from_name(name: &str) -> MediaKind {
    match extension_of(name) {
        Some(ext) if AUDIO_EXTENSIONS.contains(&ext.as_str()) => MediaKind::Audio,
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => MediaKind::Image,
        Some(ext) if TEXT_EXTENSIONS.contains(&ext.as_str()) => MediaKind::Text,
        _ => MediaKind::Other,
    }
}

/// Classify downloaded content by extension, then by magic bytes.
pub fn sniff_kind(name: &str, bytes: &[u8]) -> MediaKind {
    match kind_from_name(name) {
        MediaKind::Other => {}
        known => return known,
    }
    if bytes.starts_with(b"ID3") || bytes.starts_with(&[0xFF, 0xFB]) {
        MediaKind::Audio
    } else if bytes.starts_with(&[0xFF, 0xD8]) || bytes.starts_with(b"\x89PNG") {
        MediaKind::Image
    } else if std::str::from_utf8(bytes).is_ok() {
        MediaKind::Text
    } else {
        MediaKind::Other
    }
}

/// MIME type for an image or audio file name.
pub fn mime_for(name: &str) -> &'static str {
    match extension_of(name).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("txt") | Some("md") => "text/plain",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// MIME type guessed from magic bytes, for downloads without a useful name.
pub fn mime_for_bytes(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG") {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        "image/jpeg"
    } else if bytes.starts_with(b"ID3") || bytes.starts_with(&[0xFF, 0xFB]) {
        "audio/mpeg"
    } else {
        "application/octet-stream"
    }
}

/// Encode `bytes` as a `data:` URL suitable for vision prompts.
pub fn data_url(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", BASE64_STANDARD.encode(bytes))
}

/// Recursively list files under `dir` with one of `extensions`
/// (case-insensitive), sorted by path. Hidden entries are skipped, as are
/// directories whose name contains any of `skip_dirs`.
pub fn list_files(dir: &Path, extensions: &[&str], skip_dirs: &[&str]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk(dir, extensions, skip_dirs, &mut out)?;
    out.sort();
    Ok(out)
}

fn walk(dir: &Path, extensions: &[&str], skip_dirs: &[&str], out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            if skip_dirs.iter().any(|s| name.contains(s)) {
                continue;
            }
            walk(&path, extensions, skip_dirs, out)?;
        } else if extension_of(&name).is_some_and(|ext| extensions.contains(&ext.as_str())) {
            out.push(path);
        }
    }
    Ok(())
}

/// File name component as a `String` (empty when absent).
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
