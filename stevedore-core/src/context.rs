//! Local build context assembly.
//!
//! Materializes the on-disk directory tree consumed by the build engine for
//! one build attempt:
//!
//! ```text
//! ./                       # Root dir (temp, exclusively owned)
//!   Containerfile
//!   secrets/
//!     envs.sh              # App env vars, shell-escaped exports
//!   context/
//!     application.tar.gz   # App source archive
//!     ...
//!     [other files]
//! ```
//!
//! The tree is removed unconditionally when the attempt ends, success or
//! failure, via the owned [`tempfile::TempDir`] guard.

use crate::error::{Result, StevedoreError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::SyncIoBridge;
use tracing::debug;

/// Name of the recipe file at the context root.
pub const RECIPE_FILE: &str = "Containerfile";

/// Name of the generated environment file under `secrets/`.
pub const ENV_FILE: &str = "envs.sh";

/// Name of the application source archive under `context/`.
pub const APP_ARCHIVE: &str = "application.tar.gz";

/// A byte stream fed into the assembler (source archive, extra files).
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Inputs for one context assembly.
#[derive(Default)]
pub struct ContextSources<'a> {
    /// Recipe (Containerfile) text written to the context root.
    pub recipe: &'a str,
    /// Application source archive, stored as `context/application.tar.gz`.
    pub archive: Option<ByteStream>,
    /// App environment, rendered into `secrets/envs.sh`.
    pub envs: Option<&'a BTreeMap<String, String>>,
    /// Gzipped tarball of auxiliary files, extracted into `context/`.
    pub extra_files: Option<ByteStream>,
}

/// An exclusively-owned, self-cleaning build context directory.
pub struct BuildLocalDir {
    dir: tempfile::TempDir,
}

impl BuildLocalDir {
    /// Root directory, holding the recipe file.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// The `context/` subdirectory handed to the build engine.
    pub fn context_dir(&self) -> PathBuf {
        self.dir.path().join("context")
    }

    /// The generated environment file under `secrets/`.
    pub fn env_file(&self) -> PathBuf {
        self.dir.path().join("secrets").join(ENV_FILE)
    }
}

impl std::fmt::Debug for BuildLocalDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildLocalDir").field("root", &self.dir.path()).finish()
    }
}

/// Assembles a build context directory under `base_dir`.
///
/// The recipe file, the source archive, the environment file and the
/// auxiliary-file extraction are written concurrently and independently; the
/// first failure aborts the whole assembly and all partial state is removed.
pub async fn assemble(base_dir: &Path, sources: ContextSources<'_>) -> Result<BuildLocalDir> {
    let dir = tempfile::Builder::new()
        .prefix("stevedore-")
        .tempdir_in(base_dir)
        .map_err(|e| StevedoreError::ContextSetup { path: base_dir.to_path_buf(), source: e })?;

    let root = dir.path().to_path_buf();
    let context_dir = root.join("context");
    let secrets_dir = root.join("secrets");

    std::fs::create_dir(&context_dir)
        .map_err(|e| StevedoreError::ContextSetup { path: context_dir.clone(), source: e })?;
    std::fs::create_dir(&secrets_dir)
        .map_err(|e| StevedoreError::ContextSetup { path: secrets_dir.clone(), source: e })?;

    // The secrets directory must not be group/world readable.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&secrets_dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| StevedoreError::ContextSetup { path: secrets_dir.clone(), source: e })?;
    }

    let ContextSources { recipe, archive, envs, extra_files } = sources;

    tokio::try_join!(
        write_recipe(&root, recipe),
        write_archive(&context_dir, archive),
        write_env_file(&secrets_dir, envs),
        extract_extra_files(&context_dir, extra_files),
    )?;

    debug!(root = %root.display(), "assembled build context");

    Ok(BuildLocalDir { dir })
}

async fn write_recipe(root: &Path, recipe: &str) -> Result<()> {
    let path = root.join(RECIPE_FILE);
    tokio::fs::write(&path, recipe)
        .await
        .map_err(|e| StevedoreError::Io { path, source: e })
}

async fn write_archive(context_dir: &Path, archive: Option<ByteStream>) -> Result<()> {
    // No application archive, skipping it
    let Some(mut archive) = archive else { return Ok(()) };

    let path = context_dir.join(APP_ARCHIVE);
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| StevedoreError::Io { path: path.clone(), source: e })?;
    tokio::io::copy(&mut archive, &mut file)
        .await
        .map_err(|e| StevedoreError::Io { path: path.clone(), source: e })?;
    file.flush().await.map_err(|e| StevedoreError::Io { path, source: e })
}

async fn write_env_file(secrets_dir: &Path, envs: Option<&BTreeMap<String, String>>) -> Result<()> {
    let path = secrets_dir.join(ENV_FILE);
    let contents = render_env_file(envs);
    tokio::fs::write(&path, contents)
        .await
        .map_err(|e| StevedoreError::Io { path, source: e })
}

/// Renders the app environment as a sourceable shell file, one
/// `export KEY=value` line per entry with shell-escaped values.
pub fn render_env_file(envs: Option<&BTreeMap<String, String>>) -> String {
    let mut out = String::from("# Environment variables of the app. Generated by stevedore.\n");
    for (key, value) in envs.into_iter().flatten() {
        let escaped = shell_escape::escape(value.as_str().into());
        out.push_str(&format!("export {}={}\n", key, escaped));
    }
    out
}

async fn extract_extra_files(context_dir: &Path, files: Option<ByteStream>) -> Result<()> {
    let Some(files) = files else { return Ok(()) };

    let dest = context_dir.to_path_buf();
    let reader = SyncIoBridge::new(files);
    tokio::task::spawn_blocking(move || {
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(reader));
        archive
            .unpack(&dest)
            .map_err(|e| StevedoreError::Io { path: dest.clone(), source: e })
    })
    .await
    .map_err(|e| StevedoreError::Internal(format!("extraction task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(bytes: &'static [u8]) -> ByteStream {
        Box::pin(bytes)
    }

    fn gzip_tar(entries: &[(&str, &str)]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[tokio::test]
    async fn assembles_full_layout() {
        let base = tempfile::tempdir().unwrap();
        let mut envs = BTreeMap::new();
        envs.insert("PORT".to_string(), "8080".to_string());
        envs.insert("MESSAGE".to_string(), "hello world".to_string());

        let extra = gzip_tar(&[("Containerfile.extra", "FROM scratch\n")]);
        let extra: ByteStream = Box::pin(std::io::Cursor::new(extra));

        let ctx = assemble(
            base.path(),
            ContextSources {
                recipe: "FROM busybox\n",
                archive: Some(stream(b"not-a-real-archive")),
                envs: Some(&envs),
                extra_files: Some(extra),
            },
        )
        .await
        .unwrap();

        let recipe = std::fs::read_to_string(ctx.root().join(RECIPE_FILE)).unwrap();
        assert_eq!(recipe, "FROM busybox\n");

        let archive = std::fs::read(ctx.context_dir().join(APP_ARCHIVE)).unwrap();
        assert_eq!(archive, b"not-a-real-archive");

        let envs_sh = std::fs::read_to_string(ctx.env_file()).unwrap();
        assert!(envs_sh.starts_with('#'));
        assert!(envs_sh.contains("export PORT=8080\n"));
        assert!(envs_sh.contains("export MESSAGE='hello world'\n"));

        let extra = std::fs::read_to_string(ctx.context_dir().join("Containerfile.extra")).unwrap();
        assert_eq!(extra, "FROM scratch\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn secrets_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let base = tempfile::tempdir().unwrap();
        let ctx = assemble(base.path(), ContextSources { recipe: "FROM x\n", ..Default::default() })
            .await
            .unwrap();

        let mode = std::fs::metadata(ctx.root().join("secrets")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn failed_assembly_leaves_no_residue() {
        let base = tempfile::tempdir().unwrap();

        // Corrupt gzip stream aborts the whole assembly.
        let bad: ByteStream = Box::pin(std::io::Cursor::new(b"\x1f\x8b garbage".to_vec()));
        let result = assemble(
            base.path(),
            ContextSources { recipe: "FROM x\n", extra_files: Some(bad), ..Default::default() },
        )
        .await;
        assert!(result.is_err());

        let leftovers: Vec<_> = std::fs::read_dir(base.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "residual context dirs: {leftovers:?}");
    }

    #[tokio::test]
    async fn cleanup_removes_tree_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let root = {
            let ctx =
                assemble(base.path(), ContextSources { recipe: "FROM x\n", ..Default::default() })
                    .await
                    .unwrap();
            ctx.root().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn env_file_round_trips_through_shell_parsing() {
        let mut envs = BTreeMap::new();
        envs.insert("SIMPLE".to_string(), "value".to_string());
        envs.insert("SPACED".to_string(), "two words".to_string());
        envs.insert("QUOTED".to_string(), "it's got 'quotes'".to_string());
        envs.insert("DOLLAR".to_string(), "$HOME `ls` \\ !".to_string());

        let rendered = render_env_file(Some(&envs));
        let parsed = parse_exports(&rendered);
        assert_eq!(parsed, envs);
    }

    /// Minimal POSIX-shell re-parse of `export KEY=value` lines, enough to
    /// verify the escaping round-trip.
    fn parse_exports(script: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for line in script.lines() {
            let Some(rest) = line.strip_prefix("export ") else { continue };
            let (key, value) = rest.split_once('=').unwrap();
            out.insert(key.to_string(), unquote(value));
        }
        out
    }

    fn unquote(value: &str) -> String {
        let mut out = String::new();
        let mut chars = value.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    out.push(q);
                }
            } else if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else {
                out.push(c);
            }
        }
        out
    }
}
