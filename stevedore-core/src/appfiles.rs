//! Application metadata files: Procfile and app configuration YAML.
//!
//! Locates and parses the platform's well-known metadata files, both inside
//! uploaded source archives and inside exported container-image filesystems.

use crate::error::{Result, StevedoreError};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::OnceLock;

/// Working directory used by platform-built application images.
pub const DEFAULT_PLATFORM_WORKING_DIR: &str = "/home/application/current";

/// App configuration file names, in lookup order.
pub const APP_YAML_FILES: [&str; 4] = ["stevedore.yml", "stevedore.yaml", "app.yml", "app.yaml"];

/// Directories searched for metadata files, after the working directory.
const FALLBACK_CONFIG_DIRS: [&str; 2] = ["/app/user", "/"];

/// Raw metadata files recovered from an archive or image filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppFiles {
    pub procfile: Option<String>,
    pub app_yaml: Option<String>,
}

/// Parsed app configuration YAML. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppYaml {
    #[serde(default)]
    pub hooks: Option<AppHooks>,
    #[serde(default)]
    pub healthcheck: Option<Healthcheck>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppHooks {
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub restart: RestartHooks,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestartHooks {
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Healthcheck {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl AppYaml {
    /// Parses app configuration YAML. Empty input parses to the default.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Build hook commands declared in the configuration, if any.
    pub fn build_hooks(&self) -> &[String] {
        self.hooks.as_ref().map(|h| h.build.as_slice()).unwrap_or_default()
    }
}

fn procfile_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([\w-]+):\s*(\S.+)$").expect("procfile line regex"))
}

/// Parses a Procfile into a process name → command map.
///
/// Lines that do not look like `name: command` are skipped, matching the
/// platform's lenient Procfile handling.
pub fn parse_procfile(procfile: &str) -> BTreeMap<String, String> {
    let normalized = procfile.replace("\r\n", "\n");
    let mut processes = BTreeMap::new();
    for line in normalized.lines() {
        if let Some(caps) = procfile_line().captures(line) {
            processes.insert(caps[1].to_string(), caps[2].trim().to_string());
        }
    }
    processes
}

/// Extracts app metadata files from an uploaded source context: a gzipped
/// tarball whose `application.tar.gz` entry holds the application source
/// (itself a gzipped tarball with metadata files at its root).
pub fn from_source_archive(reader: impl Read) -> Result<AppFiles> {
    let mut outer = tar::Archive::new(flate2::read::GzDecoder::new(reader));
    let entries = outer
        .entries()
        .map_err(|e| StevedoreError::Archive { reason: format!("unreadable upload: {e}") })?;

    for entry in entries {
        let entry =
            entry.map_err(|e| StevedoreError::Archive { reason: format!("corrupt upload: {e}") })?;
        let path = entry_path(&entry)?;
        if path == crate::context::APP_ARCHIVE {
            return scan_app_archive(entry);
        }
    }

    Err(StevedoreError::Archive {
        reason: format!("no {} entry found in the uploaded context", crate::context::APP_ARCHIVE),
    })
}

fn scan_app_archive(reader: impl Read) -> Result<AppFiles> {
    // Metadata files live at the archive root.
    let candidates = metadata_candidates(&[""]);
    scan_tar(tar::Archive::new(flate2::read::GzDecoder::new(reader)), &candidates)
}

/// Extracts app metadata files from a container image filesystem exported as
/// an uncompressed tar stream, looking relative to `working_dir` first and
/// the platform fallback directories after.
pub fn from_image_tarball(reader: impl Read, working_dir: &str) -> Result<AppFiles> {
    let mut dirs: Vec<&str> = Vec::new();
    if !working_dir.is_empty() {
        dirs.push(working_dir);
    }
    for dir in FALLBACK_CONFIG_DIRS {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }

    let candidates = metadata_candidates(&dirs);
    scan_tar(tar::Archive::new(reader), &candidates)
}

/// Candidate (path, slot) pairs in priority order. Slot 0 is the Procfile,
/// slot 1 the app YAML.
fn metadata_candidates(dirs: &[&str]) -> Vec<(String, usize)> {
    let mut out = Vec::new();
    for dir in dirs {
        out.push((join_root_relative(dir, "Procfile"), 0));
    }
    for dir in dirs {
        for name in APP_YAML_FILES {
            out.push((join_root_relative(dir, name), 1));
        }
    }
    out
}

fn join_root_relative(dir: &str, name: &str) -> String {
    let trimmed = dir.trim_matches('/');
    if trimmed.is_empty() {
        name.to_string()
    } else {
        format!("{trimmed}/{name}")
    }
}

fn scan_tar<R: Read>(mut archive: tar::Archive<R>, candidates: &[(String, usize)]) -> Result<AppFiles> {
    let entries = archive
        .entries()
        .map_err(|e| StevedoreError::Archive { reason: format!("unreadable tar stream: {e}") })?;

    // Tar entry order is arbitrary; remember the best-priority match per slot.
    let mut best: [Option<(usize, String)>; 2] = [None, None];

    for entry in entries {
        let mut entry = entry
            .map_err(|e| StevedoreError::Archive { reason: format!("corrupt tar stream: {e}") })?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry_path(&entry)?;

        let Some(rank) = candidates.iter().position(|(c, _)| *c == path) else { continue };
        let slot = candidates[rank].1;
        if best[slot].as_ref().is_some_and(|(seen, _)| *seen <= rank) {
            continue;
        }

        let mut contents = String::new();
        entry
            .read_to_string(&mut contents)
            .map_err(|e| StevedoreError::Archive { reason: format!("unreadable {path}: {e}") })?;
        best[slot] = Some((rank, contents));
    }

    let [procfile, app_yaml] = best;
    Ok(AppFiles {
        procfile: procfile.map(|(_, contents)| contents),
        app_yaml: app_yaml.map(|(_, contents)| contents),
    })
}

fn entry_path<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry
        .path()
        .map_err(|e| StevedoreError::Archive { reason: format!("bad entry path: {e}") })?;
    let normalized = path.to_string_lossy().into_owned();
    Ok(normalized.trim_start_matches("./").trim_start_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap()
    }

    fn source_upload(app_entries: &[(&str, &str)]) -> Vec<u8> {
        let inner = gzip(&tar_with(app_entries));
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(inner.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "application.tar.gz", inner.as_slice()).unwrap();
        gzip(&builder.into_inner().unwrap())
    }

    #[test]
    fn parses_procfile_lines() {
        let procfile = "web: ./run-server --port 8080\r\nworker:  ./run-worker\ninvalid line\n";
        let processes = parse_procfile(procfile);
        assert_eq!(processes.len(), 2);
        assert_eq!(processes["web"], "./run-server --port 8080");
        assert_eq!(processes["worker"], "./run-worker");
    }

    #[test]
    fn parses_app_yaml_hooks() {
        let yaml = "hooks:\n  build:\n    - make assets\n  restart:\n    before:\n      - ./warm-cache\n";
        let parsed = AppYaml::parse(yaml).unwrap();
        assert_eq!(parsed.build_hooks(), ["make assets"]);
        assert_eq!(parsed.hooks.unwrap().restart.before, ["./warm-cache"]);
    }

    #[test]
    fn empty_app_yaml_parses_to_default() {
        let parsed = AppYaml::parse("   \n").unwrap();
        assert!(parsed.hooks.is_none());
    }

    #[test]
    fn extracts_files_from_source_upload() {
        let upload = source_upload(&[
            ("Procfile", "web: ./server\n"),
            ("app.yaml", "hooks:\n  build: [\"make\"]\n"),
            ("main.go", "package main\n"),
        ]);

        let files = from_source_archive(upload.as_slice()).unwrap();
        assert_eq!(files.procfile.as_deref(), Some("web: ./server\n"));
        assert_eq!(files.app_yaml.as_deref(), Some("hooks:\n  build: [\"make\"]\n"));
    }

    #[test]
    fn upload_without_app_archive_is_an_error() {
        let bogus = gzip(&tar_with(&[("README", "hi\n")]));
        assert!(from_source_archive(bogus.as_slice()).is_err());
    }

    #[test]
    fn image_tarball_prefers_working_dir_over_fallbacks() {
        let tarball = tar_with(&[
            ("app/user/Procfile", "web: fallback\n"),
            ("home/application/current/Procfile", "web: primary\n"),
        ]);

        let files =
            from_image_tarball(tarball.as_slice(), DEFAULT_PLATFORM_WORKING_DIR).unwrap();
        assert_eq!(files.procfile.as_deref(), Some("web: primary\n"));
    }

    #[test]
    fn image_tarball_falls_back_to_root() {
        let tarball = tar_with(&[("Procfile", "web: at-root\n"), ("stevedore.yaml", "{}\n")]);
        let files = from_image_tarball(tarball.as_slice(), "/workdir").unwrap();
        assert_eq!(files.procfile.as_deref(), Some("web: at-root\n"));
        assert_eq!(files.app_yaml.as_deref(), Some("{}\n"));
    }

    #[test]
    fn yaml_name_priority_is_stable() {
        let tarball = tar_with(&[("app.yml", "a: 1\n"), ("stevedore.yml", "b: 2\n")]);
        let files = from_image_tarball(tarball.as_slice(), "/").unwrap();
        assert_eq!(files.app_yaml.as_deref(), Some("b: 2\n"));
    }
}
