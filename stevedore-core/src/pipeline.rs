//! The build pipeline: dispatches on build kind, assembles the local
//! context, drives the build engine and gathers post-build metadata.
//!
//! Single-shot: retry policy belongs to the caller.

use crate::appfiles::{self, AppFiles, AppYaml, DEFAULT_PLATFORM_WORKING_DIR};
use crate::context::{self, BuildLocalDir, ByteStream, ContextSources};
use crate::engine::{
    EngineClient, ExportSpec, SecretSource, SessionAttachable, SolveOptions, LOCAL_DIR_CONTEXT,
    LOCAL_DIR_RECIPE, RECIPE_FRONTEND,
};
use crate::error::{Result, StevedoreError};
use crate::recipe;
use crate::registry::{self, Keychain};
use crate::types::{BuildArtifacts, BuildKind, BuildRequest};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info};

/// Build argument injected into every app build so hook steps are never
/// satisfied from the build cache.
const CACHE_BUST_BUILD_ARG: &str = "build-arg:stevedore_deploy_cache";

/// Tuning for the pipeline.
#[derive(Debug, Clone)]
pub struct BuilderOptions {
    /// Where per-attempt build context directories are created.
    pub temp_dir: PathBuf,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self { temp_dir: std::env::temp_dir() }
    }
}

/// Drives one claimed build engine through build attempts.
pub struct Builder {
    engine: EngineClient,
    keychain: Keychain,
    opts: BuilderOptions,
}

impl Builder {
    pub fn new(engine: EngineClient, opts: BuilderOptions) -> Self {
        Self { engine, keychain: Keychain::platform_default(), opts }
    }

    /// Replaces the registry credential chain (tests, air-gapped setups).
    pub fn with_keychain(mut self, keychain: Keychain) -> Self {
        self.keychain = keychain;
        self
    }

    /// Runs one build attempt, streaming progress into `out`. App builds
    /// return artifacts; platform builds return `None`.
    pub async fn build<W>(&mut self, req: &BuildRequest, out: &mut W) -> Result<Option<BuildArtifacts>>
    where
        W: AsyncWrite + Unpin + Send,
    {
        info!(kind = %req.kind, app = req.app.as_ref().map(|a| a.name.as_str()), "starting build");

        match req.kind {
            BuildKind::SourceUpload => self.build_from_source(req, out).await.map(Some),
            BuildKind::ContainerImage => self.build_from_image(req, out).await.map(Some),
            BuildKind::Containerfile => self.build_from_containerfile(req, out).await.map(Some),
            BuildKind::PlatformContainerfile => {
                self.build_platform(req, out).await?;
                Ok(None)
            }
        }
    }

    async fn build_from_source<W>(&mut self, req: &BuildRequest, out: &mut W) -> Result<BuildArtifacts>
    where
        W: AsyncWrite + Unpin + Send,
    {
        req.first_destination()?;

        let app_files = appfiles::from_source_archive(req.data.as_slice())?;
        let app_yaml = AppYaml::parse(app_files.app_yaml.as_deref().unwrap_or_default())?;
        let recipe_text = recipe::synthesize(&req.source_image, &app_yaml);

        let ctx = context::assemble(
            &self.opts.temp_dir,
            ContextSources {
                recipe: &recipe_text,
                archive: Some(boxed_bytes(req.data.clone())),
                envs: req.env_vars(),
                extra_files: None,
            },
        )
        .await?;

        self.run_build(&ctx, req, out).await?;

        // Some platforms don't require a user-defined Procfile; fall back to
        // the one shipped in the platform image.
        let mut procfile = app_files.procfile.unwrap_or_default();
        if procfile.is_empty() {
            out.write_all(
                b"User-defined Procfile not found, extracting it from the platform image\n",
            )
            .await
            .map_err(|e| StevedoreError::Internal(format!("output sink: {e}")))?;

            let recovered = self
                .extract_app_files_from_image(
                    req.first_destination()?,
                    DEFAULT_PLATFORM_WORKING_DIR,
                )
                .await?;
            procfile = recovered.procfile.unwrap_or_default();
        }

        Ok(into_artifacts(AppFiles { procfile: Some(procfile), app_yaml: app_files.app_yaml }))
    }

    async fn build_from_image<W>(&mut self, req: &BuildRequest, out: &mut W) -> Result<BuildArtifacts>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let destination = req.first_destination()?.to_string();

        let recipe_text = recipe::from_image(&req.source_image);
        let ctx = context::assemble(
            &self.opts.temp_dir,
            ContextSources { recipe: &recipe_text, ..Default::default() },
        )
        .await?;

        self.run_build(&ctx, req, out).await?;

        let insecure = req.push_options().insecure_registry;
        let image_config = registry::inspect_image(&destination, insecure, &self.keychain).await?;

        // The context already describes the source image; reuse it for the
        // filesystem extraction.
        let files = self.extract_app_files(&ctx, &image_config.working_dir).await?;

        let mut artifacts = into_artifacts(files);
        artifacts.image_config = Some(image_config);
        Ok(artifacts)
    }

    async fn build_from_containerfile<W>(
        &mut self,
        req: &BuildRequest,
        out: &mut W,
    ) -> Result<BuildArtifacts>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let destination = req.first_destination()?.to_string();

        let extra_files = (!req.data.is_empty()).then(|| boxed_bytes(req.data.clone()));
        let ctx = context::assemble(
            &self.opts.temp_dir,
            ContextSources {
                recipe: &req.containerfile,
                archive: None,
                envs: req.env_vars(),
                extra_files,
            },
        )
        .await?;

        self.run_build(&ctx, req, out).await?;

        let insecure = req.push_options().insecure_registry;
        let image_config = registry::inspect_image(&destination, insecure, &self.keychain).await?;

        let files = self
            .extract_app_files_from_image(&destination, &image_config.working_dir)
            .await?;

        let mut artifacts = into_artifacts(files);
        artifacts.image_config = Some(image_config);
        Ok(artifacts)
    }

    async fn build_platform<W>(&mut self, req: &BuildRequest, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let ctx = context::assemble(
            &self.opts.temp_dir,
            ContextSources { recipe: &req.containerfile, ..Default::default() },
        )
        .await?;

        self.run_build(&ctx, req, out).await
    }

    /// Shared build invocation: image export with push options, registry
    /// auth, the app-environment secret when an app is present, and a
    /// monotonically changing build argument so caching never skips hooks.
    async fn run_build<W>(&mut self, ctx: &BuildLocalDir, req: &BuildRequest, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let push_opts = req.push_options();

        let mut session = vec![SessionAttachable::RegistryAuth];
        if req.app.is_some() {
            session.push(SessionAttachable::Secrets(vec![SecretSource {
                id: recipe::APP_ENV_SECRET_ID.to_string(),
                path: ctx.env_file(),
            }]));
        }

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let frontend_attrs =
            BTreeMap::from([(CACHE_BUST_BUILD_ARG.to_string(), now.as_secs().to_string())]);

        let opts = SolveOptions {
            frontend: RECIPE_FRONTEND.to_string(),
            frontend_attrs,
            local_dirs: BTreeMap::from([
                (LOCAL_DIR_CONTEXT.to_string(), ctx.context_dir()),
                (LOCAL_DIR_RECIPE.to_string(), ctx.root().to_path_buf()),
            ]),
            export: ExportSpec::Image {
                names: req.destination_images.clone(),
                push: !push_opts.disable,
                insecure_registry: push_opts.insecure_registry,
            },
            session,
        };

        self.engine.solve(opts, out).await
    }

    /// Extracts app metadata files from `image` by assembling a one-line
    /// context around it and running a tar-export solve.
    async fn extract_app_files_from_image(
        &mut self,
        image: &str,
        working_dir: &str,
    ) -> Result<AppFiles> {
        let recipe_text = recipe::from_image(image);
        let ctx = context::assemble(
            &self.opts.temp_dir,
            ContextSources { recipe: &recipe_text, ..Default::default() },
        )
        .await?;

        self.extract_app_files(&ctx, working_dir).await
    }

    /// Runs a solve whose only purpose is exporting the filesystem as a tar
    /// stream, scanned concurrently for metadata files. Producer and
    /// consumer are piped together and joined fail-fast.
    async fn extract_app_files(
        &mut self,
        ctx: &BuildLocalDir,
        working_dir: &str,
    ) -> Result<AppFiles> {
        debug!(working_dir, "extracting app metadata files from image filesystem");

        let opts = SolveOptions {
            frontend: RECIPE_FRONTEND.to_string(),
            frontend_attrs: BTreeMap::new(),
            local_dirs: BTreeMap::from([
                (LOCAL_DIR_CONTEXT.to_string(), ctx.context_dir()),
                (LOCAL_DIR_RECIPE.to_string(), ctx.root().to_path_buf()),
            ]),
            export: ExportSpec::Tar,
            session: vec![SessionAttachable::RegistryAuth],
        };

        let (writer, reader) = tokio::io::duplex(64 * 1024);

        let mut engine = self.engine.clone();
        let solve = engine.solve_to_tar(opts, writer);

        let working_dir = working_dir.to_string();
        let bridge = SyncIoBridge::new(reader);
        let scan = tokio::task::spawn_blocking(move || {
            appfiles::from_image_tarball(bridge, &working_dir)
        });

        let ((), files) = tokio::try_join!(solve, async {
            scan.await
                .map_err(|e| StevedoreError::Internal(format!("tar scan task failed: {e}")))?
        })?;

        Ok(files)
    }
}

fn boxed_bytes(data: Vec<u8>) -> ByteStream {
    Box::pin(std::io::Cursor::new(data))
}

fn into_artifacts(files: AppFiles) -> BuildArtifacts {
    let procfile = files.procfile.unwrap_or_default();
    BuildArtifacts {
        processes: appfiles::parse_procfile(&procfile),
        procfile,
        app_yaml: files.app_yaml.unwrap_or_default(),
        image_config: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_carry_parsed_processes() {
        let artifacts = into_artifacts(AppFiles {
            procfile: Some("web: ./server\nworker: ./worker\n".to_string()),
            app_yaml: Some("hooks: {}\n".to_string()),
        });

        assert_eq!(artifacts.processes.len(), 2);
        assert_eq!(artifacts.processes["web"], "./server");
        assert_eq!(artifacts.app_yaml, "hooks: {}\n");
        assert!(artifacts.image_config.is_none());
    }

    #[test]
    fn missing_files_yield_empty_artifacts() {
        let artifacts = into_artifacts(AppFiles::default());
        assert!(artifacts.procfile.is_empty());
        assert!(artifacts.processes.is_empty());
    }
}
