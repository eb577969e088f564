use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

pub const FAVICON_DIR: &str = "favicon";
pub const WELL_KNOWN_DIR: &str = "well-known";
pub const SECURITY_TXT: &str = "security.txt";

/// Files served from the site root out of the favicon directory.
pub const FAVICON_FILES: [&str; 21] = [
    "android-chrome-36x36.png",
    "android-chrome-48x48.png",
    "android-chrome-72x72.png",
    "android-chrome-96x96.png",
    "apple-touch-icon-114x114.png",
    "apple-touch-icon-120x120.png",
    "apple-touch-icon-57x57.png",
    "apple-touch-icon-60x60.png",
    "apple-touch-icon-72x72.png",
    "apple-touch-icon-76x76.png",
    "apple-touch-icon-precomposed.png",
    "apple-touch-icon.png",
    "browserconfig.xml",
    "favicon-16x16.png",
    "favicon-32x32.png",
    "favicon-96x96.png",
    "favicon.ico",
    "manifest.json",
    "mstile-150x150.png",
    "mstile-310x150.png",
    "mstile-70x70.png",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFile {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

pub fn is_favicon(name: &str) -> bool {
    FAVICON_FILES.contains(&name)
}

pub fn favicon_path(static_dir: &Path, name: &str) -> Option<PathBuf> {
    is_favicon(name).then(|| static_dir.join(FAVICON_DIR).join(name))
}

pub fn security_txt_path(static_dir: &Path) -> PathBuf {
    static_dir.join(WELL_KNOWN_DIR).join(SECURITY_TXT)
}

/// Maps a URL path below `/static/` onto `static_dir`. Anything that could
/// leave the directory yields `None`.
pub fn resolve_static_path(static_dir: &Path, requested: &str) -> Option<PathBuf> {
    if requested.is_empty() || requested.contains(['\\', '\0']) {
        return None;
    }
    let relative = Path::new(requested);
    let mut resolved = static_dir.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (resolved != static_dir).then_some(resolved)
}

pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("css") => "text/css; charset=utf-8",
        Some("html") => "text/html; charset=utf-8",
        Some("ico") => "image/x-icon",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "application/xml",
        Some("xsl") => "text/xsl; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Reads a regular file; missing files and directories yield `None`.
pub fn read_static_file(path: &Path) -> Result<Option<StaticFile>> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => return Ok(None),
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to inspect {}", path.display()));
        }
    }
    let body = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Some(StaticFile {
        content_type: content_type_for(path),
        body,
    }))
}
