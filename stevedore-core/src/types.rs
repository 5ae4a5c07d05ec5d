//! Domain types shared across the build pipeline.

use std::collections::BTreeMap;

/// The build modes supported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    /// Application build from an uploaded source archive.
    SourceUpload,
    /// Application build from an existing container image.
    ContainerImage,
    /// Application build from a caller-supplied Containerfile.
    Containerfile,
    /// Platform (base) image build from a caller-supplied Containerfile.
    PlatformContainerfile,
}

impl std::fmt::Display for BuildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SourceUpload => "app-source-upload",
            Self::ContainerImage => "app-container-image",
            Self::Containerfile => "app-container-file",
            Self::PlatformContainerfile => "platform-container-file",
        };
        f.write_str(name)
    }
}

/// Application identity plus its environment, as handed over by the platform.
#[derive(Debug, Clone, Default)]
pub struct App {
    pub name: String,
    pub env_vars: BTreeMap<String, String>,
}

/// Push behavior for the built image.
#[derive(Debug, Clone, Copy, Default)]
pub struct PushOptions {
    /// Skip pushing the built image to the registry.
    pub disable: bool,
    /// Allow plain-HTTP registries for push and manifest inspection.
    pub insecure_registry: bool,
}

/// One build attempt, as received from the platform.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub kind: BuildKind,
    pub app: Option<App>,
    /// Base image for source uploads, source image for image builds.
    pub source_image: String,
    /// Literal recipe text for the container-file build kinds.
    pub containerfile: String,
    /// Source archive or auxiliary files, depending on kind.
    pub data: Vec<u8>,
    pub destination_images: Vec<String>,
    pub push_options: Option<PushOptions>,
}

impl BuildRequest {
    /// Environment variables of the app, if any.
    pub fn env_vars(&self) -> Option<&BTreeMap<String, String>> {
        self.app.as_ref().map(|app| &app.env_vars)
    }

    /// Effective push options (defaults apply when none were sent).
    pub fn push_options(&self) -> PushOptions {
        self.push_options.unwrap_or_default()
    }

    /// First destination image. Modes that extract image metadata require a
    /// non-empty destination list.
    pub fn first_destination(&self) -> crate::Result<&str> {
        self.destination_images
            .first()
            .map(String::as_str)
            .ok_or_else(|| crate::StevedoreError::InvalidRequest {
                reason: "destination image list must not be empty".to_string(),
            })
    }
}

/// Runtime configuration read back from a built image's registry config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRuntimeConfig {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: String,
    /// Port spec strings ("8080/tcp"), deduplicated, order not guaranteed.
    pub exposed_ports: Vec<String>,
}

/// Metadata produced by one successful build attempt. Immutable after return.
#[derive(Debug, Clone, Default)]
pub struct BuildArtifacts {
    /// Raw Procfile text, possibly recovered from the platform image.
    pub procfile: String,
    /// Process name to command map parsed from the Procfile.
    pub processes: BTreeMap<String, String>,
    /// Raw app configuration YAML, verbatim.
    pub app_yaml: String,
    pub image_config: Option<ImageRuntimeConfig>,
}
