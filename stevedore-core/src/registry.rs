//! Container registry manifest inspection.
//!
//! Resolves an image reference against its registry and reads back the
//! runtime configuration (entrypoint, command, working directory, exposed
//! ports) recorded in the image config blob. Credentials are resolved through
//! a chained keychain: the local Docker credential store first, then the
//! cloud-provider metadata service, then anonymous.

use crate::error::{Result, StevedoreError};
use crate::types::ImageRuntimeConfig;
use async_trait::async_trait;
use base64::Engine;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Image runtime configuration as stored in the registry config blob.
#[derive(Debug, Clone, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    config: ContainerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Entrypoint")]
    entrypoint: Option<Vec<String>>,

    #[serde(rename = "Cmd")]
    cmd: Option<Vec<String>>,

    #[serde(rename = "WorkingDir")]
    working_dir: Option<String>,

    #[serde(rename = "ExposedPorts")]
    exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

impl From<ContainerConfig> for ImageRuntimeConfig {
    fn from(config: ContainerConfig) -> Self {
        Self {
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            working_dir: config.working_dir.unwrap_or_default(),
            // Map keys are already deduplicated by port spec string; order is
            // not part of the contract.
            exposed_ports: config.exposed_ports.unwrap_or_default().into_keys().collect(),
        }
    }
}

/// One place credentials may come from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Credentials for `registry`, or `None` when this source has nothing.
    async fn resolve(&self, registry: &str) -> Option<RegistryAuth>;
}

/// Chained credential resolution: sources are tried in order, the first hit
/// wins, anonymous access is the fallback.
pub struct Keychain {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl Keychain {
    pub fn new(sources: Vec<Box<dyn CredentialSource>>) -> Self {
        Self { sources }
    }

    /// The default chain: Docker config store, then the GCP metadata service.
    pub fn platform_default() -> Self {
        Self::new(vec![
            Box::new(DockerConfigCredentials::from_env()),
            Box::new(GoogleMetadataCredentials::new()),
        ])
    }

    pub async fn resolve(&self, registry: &str) -> RegistryAuth {
        for source in &self.sources {
            if let Some(auth) = source.resolve(registry).await {
                debug!(registry, source = source.name(), "resolved registry credentials");
                return auth;
            }
        }
        RegistryAuth::Anonymous
    }
}

/// Reads the Docker CLI credential store (`$DOCKER_CONFIG/config.json`,
/// falling back to `$HOME/.docker/config.json`).
pub struct DockerConfigCredentials {
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl DockerConfigCredentials {
    pub fn from_env() -> Self {
        let path = std::env::var_os("DOCKER_CONFIG")
            .map(|dir| PathBuf::from(dir).join("config.json"))
            .or_else(|| {
                std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker/config.json"))
            });
        Self { path }
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn lookup(&self, registry: &str) -> Option<RegistryAuth> {
        let contents = std::fs::read_to_string(self.path.as_ref()?).ok()?;
        let config: DockerConfigFile = serde_json::from_str(&contents).ok()?;

        let entry = config
            .auths
            .get(registry)
            .or_else(|| {
                // Config keys may carry a scheme, or be the legacy Docker Hub
                // endpoint.
                config.auths.iter().find_map(|(key, entry)| {
                    let host =
                        key.trim_start_matches("https://").trim_start_matches("http://");
                    let host = host.split('/').next().unwrap_or(host);
                    (host == registry
                        || (registry == "docker.io" && host == "index.docker.io"))
                        .then_some(entry)
                })
            })?;

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Some(RegistryAuth::Basic(username.clone(), password.clone()));
        }

        let decoded = base64::engine::general_purpose::STANDARD.decode(entry.auth.as_ref()?).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(RegistryAuth::Basic(username.to_string(), password.to_string()))
    }
}

#[async_trait]
impl CredentialSource for DockerConfigCredentials {
    fn name(&self) -> &'static str {
        "docker-config"
    }

    async fn resolve(&self, registry: &str) -> Option<RegistryAuth> {
        self.lookup(registry)
    }
}

/// Fetches short-lived access tokens from the GCP instance metadata service
/// for Google-hosted registries.
pub struct GoogleMetadataCredentials {
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
}

impl GoogleMetadataCredentials {
    pub fn new() -> Self {
        Self {
            endpoint: "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token".to_string(),
        }
    }

    fn applies_to(registry: &str) -> bool {
        registry == "gcr.io"
            || registry.ends_with(".gcr.io")
            || registry.ends_with(".pkg.dev")
    }
}

impl Default for GoogleMetadataCredentials {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialSource for GoogleMetadataCredentials {
    fn name(&self) -> &'static str {
        "gcp-metadata"
    }

    async fn resolve(&self, registry: &str) -> Option<RegistryAuth> {
        if !Self::applies_to(registry) {
            return None;
        }

        let client = reqwest::Client::builder().timeout(Duration::from_secs(2)).build().ok()?;
        let response = client
            .get(&self.endpoint)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?;
        let token: MetadataToken = response.json().await.ok()?;
        Some(RegistryAuth::Basic("oauth2accesstoken".to_string(), token.access_token))
    }
}

/// Inspects the registry manifest/config of `image` and returns its runtime
/// configuration. `insecure` switches the registry protocol to plain HTTP.
pub async fn inspect_image(
    image: &str,
    insecure: bool,
    keychain: &Keychain,
) -> Result<ImageRuntimeConfig> {
    let reference = Reference::try_from(image).map_err(|e| StevedoreError::InvalidReference {
        image: image.to_string(),
        reason: e.to_string(),
    })?;

    let protocol = if insecure { ClientProtocol::Http } else { ClientProtocol::Https };
    let mut client = Client::new(ClientConfig { protocol, ..Default::default() });

    let auth = keychain.resolve(reference.registry()).await;

    let (_manifest, _digest, config_json) = client
        .pull_manifest_and_config(&reference, &auth)
        .await
        .map_err(|e| StevedoreError::ManifestFetch {
            image: image.to_string(),
            reason: e.to_string(),
        })?;

    let blob: ConfigBlob =
        serde_json::from_str(&config_json).map_err(|e| StevedoreError::ManifestFetch {
            image: image.to_string(),
            reason: format!("invalid image config: {e}"),
        })?;

    Ok(blob.config.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct StaticSource(&'static str, Option<(&'static str, &'static str)>);

    #[async_trait]
    impl CredentialSource for StaticSource {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn resolve(&self, _registry: &str) -> Option<RegistryAuth> {
            self.1.map(|(u, p)| RegistryAuth::Basic(u.to_string(), p.to_string()))
        }
    }

    #[tokio::test]
    async fn keychain_tries_sources_in_order() {
        let keychain = Keychain::new(vec![
            Box::new(StaticSource("empty", None)),
            Box::new(StaticSource("hit", Some(("user", "first")))),
            Box::new(StaticSource("later", Some(("user", "second")))),
        ]);

        match keychain.resolve("registry.example.com").await {
            RegistryAuth::Basic(user, password) => {
                assert_eq!(user, "user");
                assert_eq!(password, "first");
            }
            _ => panic!("expected basic auth"),
        }
    }

    #[tokio::test]
    async fn keychain_falls_back_to_anonymous() {
        let keychain = Keychain::new(vec![Box::new(StaticSource("empty", None))]);
        assert!(matches!(
            keychain.resolve("registry.example.com").await,
            RegistryAuth::Anonymous
        ));
    }

    #[tokio::test]
    async fn docker_config_decodes_auth_entry() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let auth = base64::engine::general_purpose::STANDARD.encode("user:s3cret");
        write!(
            file,
            r#"{{"auths": {{"registry.example.com": {{"auth": "{auth}"}}}}}}"#
        )
        .unwrap();

        let source = DockerConfigCredentials::at(file.path().to_path_buf());
        match source.resolve("registry.example.com").await {
            Some(RegistryAuth::Basic(user, password)) => {
                assert_eq!(user, "user");
                assert_eq!(password, "s3cret");
            }
            _ => panic!("expected basic auth"),
        }
    }

    #[tokio::test]
    async fn docker_config_matches_legacy_hub_endpoint() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let auth = base64::engine::general_purpose::STANDARD.encode("hubuser:hubpass");
        write!(
            file,
            r#"{{"auths": {{"https://index.docker.io/v1/": {{"auth": "{auth}"}}}}}}"#
        )
        .unwrap();

        let source = DockerConfigCredentials::at(file.path().to_path_buf());
        assert!(source.resolve("docker.io").await.is_some());
    }

    #[test]
    fn gcp_source_only_applies_to_google_registries() {
        assert!(GoogleMetadataCredentials::applies_to("gcr.io"));
        assert!(GoogleMetadataCredentials::applies_to("eu.gcr.io"));
        assert!(GoogleMetadataCredentials::applies_to("us-central1-docker.pkg.dev"));
        assert!(!GoogleMetadataCredentials::applies_to("docker.io"));
    }

    #[test]
    fn config_blob_maps_to_runtime_config() {
        let blob: ConfigBlob = serde_json::from_str(
            r#"{
                "config": {
                    "Entrypoint": ["/bin/server"],
                    "Cmd": ["--port", "8080"],
                    "WorkingDir": "/srv",
                    "ExposedPorts": {"8080/tcp": {}, "9090/udp": {}}
                }
            }"#,
        )
        .unwrap();

        let config: ImageRuntimeConfig = blob.config.into();
        assert_eq!(config.entrypoint, ["/bin/server"]);
        assert_eq!(config.cmd, ["--port", "8080"]);
        assert_eq!(config.working_dir, "/srv");

        let mut ports = config.exposed_ports.clone();
        ports.sort();
        assert_eq!(ports, ["8080/tcp", "9090/udp"]);
    }

    #[test]
    fn empty_config_blob_is_default() {
        let blob: ConfigBlob = serde_json::from_str("{}").unwrap();
        let config: ImageRuntimeConfig = blob.config.into();
        assert!(config.entrypoint.is_empty());
        assert!(config.exposed_ports.is_empty());
    }
}
