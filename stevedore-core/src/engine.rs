//! Build engine client.
//!
//! Wraps the tonic-generated solve protocol behind typed solve options. A
//! solve streams back progress records and, for tar exports, the exported
//! filesystem as chunked tar data; the client pumps the response stream and
//! the caller-facing sink as concurrently joined tasks with fail-fast
//! semantics.

use crate::error::{Result, StevedoreError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use stevedore_api::engine::v1 as proto;
use stevedore_api::engine::v1::build_engine_client::BuildEngineClient;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// Frontend identity understood by the build engine.
pub const RECIPE_FRONTEND: &str = "recipe-v0";

/// Local directory key for the build context.
pub const LOCAL_DIR_CONTEXT: &str = "context";

/// Local directory key for the recipe location.
pub const LOCAL_DIR_RECIPE: &str = "recipe";

/// How long a fail-fast connection attempt may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// What the solve should export.
#[derive(Debug, Clone)]
pub enum ExportSpec {
    /// Export (and optionally push) an image under the given references.
    Image { names: Vec<String>, push: bool, insecure_registry: bool },
    /// Export the final filesystem as a tar stream.
    Tar,
}

/// A session provider attached to the solve.
#[derive(Debug, Clone)]
pub enum SessionAttachable {
    RegistryAuth,
    Secrets(Vec<SecretSource>),
}

/// One file-backed secret exposed to the solve.
#[derive(Debug, Clone)]
pub struct SecretSource {
    pub id: String,
    pub path: PathBuf,
}

/// Options for one solve.
#[derive(Debug, Clone)]
pub struct SolveOptions {
    pub frontend: String,
    pub frontend_attrs: BTreeMap<String, String>,
    pub local_dirs: BTreeMap<String, PathBuf>,
    pub export: ExportSpec,
    pub session: Vec<SessionAttachable>,
}

impl SolveOptions {
    fn into_request(self) -> proto::SolveRequest {
        let export = match self.export {
            ExportSpec::Image { names, push, insecure_registry } => proto::Export {
                kind: proto::ExportKind::Image as i32,
                attrs: BTreeMap::from([
                    ("name".to_string(), names.join(",")),
                    ("push".to_string(), push.to_string()),
                    ("registry.insecure".to_string(), insecure_registry.to_string()),
                ])
                .into_iter()
                .collect(),
            },
            ExportSpec::Tar => proto::Export {
                kind: proto::ExportKind::Tar as i32,
                attrs: Default::default(),
            },
        };

        let session = self
            .session
            .into_iter()
            .map(|attachable| match attachable {
                SessionAttachable::RegistryAuth => proto::Attachable {
                    kind: proto::AttachableKind::RegistryAuth as i32,
                    secret_sources: Vec::new(),
                },
                SessionAttachable::Secrets(sources) => proto::Attachable {
                    kind: proto::AttachableKind::Secrets as i32,
                    secret_sources: sources
                        .into_iter()
                        .map(|source| proto::SecretSource {
                            id: source.id,
                            file_path: source.path.to_string_lossy().into_owned(),
                        })
                        .collect(),
                },
            })
            .collect();

        proto::SolveRequest {
            frontend: self.frontend,
            frontend_attrs: self.frontend_attrs.into_iter().collect(),
            local_dirs: self
                .local_dirs
                .into_iter()
                .map(|(name, path)| (name, path.to_string_lossy().into_owned()))
                .collect(),
            export: Some(export),
            session,
        }
    }
}

/// A connected build engine endpoint.
#[derive(Clone)]
pub struct EngineClient {
    inner: BuildEngineClient<Channel>,
    addr: String,
}

impl EngineClient {
    /// Connects to a build engine with fail-fast semantics: the connection is
    /// established eagerly and a dead endpoint is reported immediately.
    pub async fn connect(addr: &str) -> Result<Self> {
        let endpoint = Endpoint::from_shared(addr.to_string())
            .map_err(|e| StevedoreError::EngineConnect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(CONNECT_TIMEOUT);

        let channel = endpoint.connect().await.map_err(|e| StevedoreError::EngineConnect {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        debug!(addr, "connected to build engine");

        Ok(Self { inner: BuildEngineClient::new(channel), addr: addr.to_string() })
    }

    /// The endpoint this client is connected to.
    pub fn address(&self) -> &str {
        &self.addr
    }

    /// Runs a solve whose progress records are streamed into `progress`.
    ///
    /// The response pump and the progress drain run as two concurrently
    /// joined tasks; the first failure of either aborts the other.
    pub async fn solve<W>(&mut self, opts: SolveOptions, progress: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut stream = self.inner.solve(opts.into_request()).await?.into_inner();

        let (tx, mut rx) = mpsc::channel::<proto::ProgressRecord>(16);

        let pump = async move {
            while let Some(response) = stream.message().await? {
                match response.payload {
                    Some(proto::solve_response::Payload::Progress(record)) => {
                        // Receiver gone means the drain failed; surface its
                        // error from the join instead.
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Some(proto::solve_response::Payload::Result(_)) | None => {}
                    Some(proto::solve_response::Payload::TarChunk(_)) => {
                        return Err(StevedoreError::Internal(
                            "unexpected tar data in image solve".to_string(),
                        ));
                    }
                }
            }
            Ok(())
        };

        let drain = async {
            while let Some(record) = rx.recv().await {
                let line = format_progress(&record);
                progress
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| StevedoreError::Internal(format!("progress sink: {e}")))?;
            }
            progress
                .flush()
                .await
                .map_err(|e| StevedoreError::Internal(format!("progress sink: {e}")))?;
            Ok(())
        };

        tokio::try_join!(pump, drain)?;
        Ok(())
    }

    /// Runs a tar-export solve, writing the exported filesystem into `sink`.
    ///
    /// The sink is shut down when the stream ends so a piped consumer
    /// observes EOF, and dropped on failure so it unblocks either way.
    pub async fn solve_to_tar<W>(&mut self, opts: SolveOptions, mut sink: W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut stream = self.inner.solve(opts.into_request()).await?.into_inner();

        while let Some(response) = stream.message().await? {
            match response.payload {
                Some(proto::solve_response::Payload::TarChunk(chunk)) => {
                    sink.write_all(&chunk)
                        .await
                        .map_err(|e| StevedoreError::Internal(format!("tar sink: {e}")))?;
                }
                Some(proto::solve_response::Payload::Progress(record)) => {
                    debug!(vertex = %record.vertex, message = %record.message, "solve progress");
                }
                Some(proto::solve_response::Payload::Result(_)) | None => {}
            }
        }

        sink.shutdown().await.ok();
        Ok(())
    }
}

fn format_progress(record: &proto::ProgressRecord) -> String {
    if record.vertex.is_empty() {
        format!("{}\n", record.message)
    } else {
        format!("#{} {}\n", record.vertex, record.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_export_carries_push_attributes() {
        let opts = SolveOptions {
            frontend: RECIPE_FRONTEND.to_string(),
            frontend_attrs: BTreeMap::new(),
            local_dirs: BTreeMap::from([
                (LOCAL_DIR_CONTEXT.to_string(), PathBuf::from("/tmp/ctx/context")),
                (LOCAL_DIR_RECIPE.to_string(), PathBuf::from("/tmp/ctx")),
            ]),
            export: ExportSpec::Image {
                names: vec!["r.example.com/app:v1".to_string(), "r.example.com/app:latest".to_string()],
                push: true,
                insecure_registry: false,
            },
            session: vec![SessionAttachable::RegistryAuth],
        };

        let request = opts.into_request();
        assert_eq!(request.frontend, "recipe-v0");
        let export = request.export.unwrap();
        assert_eq!(export.kind, proto::ExportKind::Image as i32);
        assert_eq!(export.attrs["name"], "r.example.com/app:v1,r.example.com/app:latest");
        assert_eq!(export.attrs["push"], "true");
        assert_eq!(export.attrs["registry.insecure"], "false");
        assert_eq!(request.local_dirs.len(), 2);
        assert_eq!(request.session.len(), 1);
    }

    #[test]
    fn secret_attachable_keeps_file_path() {
        let opts = SolveOptions {
            frontend: RECIPE_FRONTEND.to_string(),
            frontend_attrs: BTreeMap::new(),
            local_dirs: BTreeMap::new(),
            export: ExportSpec::Tar,
            session: vec![SessionAttachable::Secrets(vec![SecretSource {
                id: "app-envvars".to_string(),
                path: PathBuf::from("/tmp/ctx/secrets/envs.sh"),
            }])],
        };

        let request = opts.into_request();
        assert_eq!(request.export.unwrap().kind, proto::ExportKind::Tar as i32);
        let attachable = &request.session[0];
        assert_eq!(attachable.kind, proto::AttachableKind::Secrets as i32);
        assert_eq!(attachable.secret_sources[0].file_path, "/tmp/ctx/secrets/envs.sh");
    }

    #[test]
    fn progress_lines_carry_the_vertex() {
        let record = proto::ProgressRecord {
            vertex: "5".to_string(),
            message: "RUN make".to_string(),
            done: false,
        };
        assert_eq!(format_progress(&record), "#5 RUN make\n");

        let bare = proto::ProgressRecord::default();
        assert_eq!(format_progress(&bare), "\n");
    }
}
