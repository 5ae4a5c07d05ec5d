//! gRPC server implementation.

use crate::proto_convert::{artifacts_to_proto, build_request_from_proto};
use std::path::PathBuf;
use std::pin::Pin;
use stevedore_api::stevedore::v1::build_service_server::BuildService;
use stevedore_api::stevedore::v1::{build_response, BuildResponse};
use stevedore_core::{
    Builder, BuilderOptions, BuildRequest, DiscoveryOptions, PodDiscoverer, StevedoreError,
};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

/// Daemon-wide configuration handed to every build attempt.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub temp_dir: PathBuf,
    pub discovery: DiscoveryOptions,
}

/// gRPC service implementation.
pub struct BuildServiceImpl {
    client: kube::Client,
    config: AgentConfig,
}

impl BuildServiceImpl {
    pub fn new(client: kube::Client, config: AgentConfig) -> Self {
        Self { client, config }
    }
}

#[tonic::async_trait]
impl BuildService for BuildServiceImpl {
    type BuildStream = Pin<Box<dyn Stream<Item = Result<BuildResponse, Status>> + Send>>;

    #[instrument(skip(self, request))]
    async fn build(
        &self,
        request: Request<stevedore_api::stevedore::v1::BuildRequest>,
    ) -> Result<Response<Self::BuildStream>, Status> {
        info!("gRPC: Build");

        let req = build_request_from_proto(request.into_inner()).map_err(to_status)?;

        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            match run_build(client, config, req, tx.clone()).await {
                Ok(Some(artifacts)) => {
                    let response = BuildResponse {
                        payload: Some(build_response::Payload::Artifacts(artifacts_to_proto(
                            artifacts,
                        ))),
                    };
                    let _ = tx.send(Ok(response)).await;
                }
                Ok(None) => {}
                Err(err) => {
                    let _ = tx.send(Err(to_status(err))).await;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// One build attempt: claim a builder, run the pipeline with its output
/// forwarded to the response stream, release the claim either way.
async fn run_build(
    client: kube::Client,
    config: AgentConfig,
    req: BuildRequest,
    tx: mpsc::Sender<Result<BuildResponse, Status>>,
) -> Result<Option<stevedore_core::BuildArtifacts>, StevedoreError> {
    let discoverer = PodDiscoverer::new(client);
    let app_name = req.app.as_ref().map(|app| app.name.clone());
    let mut claimed = discoverer.discover(&config.discovery, app_name.as_deref()).await?;

    let (mut writer, mut reader) = tokio::io::duplex(8 * 1024);

    let forward = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let response =
                        BuildResponse { payload: Some(build_response::Payload::Output(chunk)) };
                    if tx.send(Ok(response)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut builder = Builder::new(
        claimed.engine.clone(),
        BuilderOptions { temp_dir: config.temp_dir.clone() },
    );
    let result = builder.build(&req, &mut writer).await;

    // EOF for the forwarder, then wait for the tail of the output.
    drop(writer);
    if let Err(err) = forward.await {
        warn!(error = %err, "build output forwarder failed");
    }

    claimed.release().await;

    result
}

fn to_status(err: StevedoreError) -> Status {
    match err {
        StevedoreError::UnsupportedBuildKind { .. } => Status::unimplemented(err.to_string()),
        StevedoreError::InvalidRequest { .. } => Status::invalid_argument(err.to_string()),
        StevedoreError::Cancelled => Status::cancelled(err.to_string()),
        StevedoreError::Solve(status) => status,
        other => Status::internal(other.to_string()),
    }
}
