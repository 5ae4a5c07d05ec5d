//! Conversions between the wire protocol and core domain types.

use stevedore_api::stevedore::v1 as proto;
use stevedore_core::{
    App, BuildArtifacts, BuildKind, BuildRequest, ImageRuntimeConfig, PushOptions, StevedoreError,
};

/// Decodes a wire build request. Unknown build kinds are reported as
/// unsupported, never dispatched.
pub fn build_request_from_proto(req: proto::BuildRequest) -> Result<BuildRequest, StevedoreError> {
    let kind = match proto::BuildKind::try_from(req.kind) {
        Ok(proto::BuildKind::AppSourceUpload) => BuildKind::SourceUpload,
        Ok(proto::BuildKind::AppContainerImage) => BuildKind::ContainerImage,
        Ok(proto::BuildKind::AppContainerFile) => BuildKind::Containerfile,
        Ok(proto::BuildKind::PlatformContainerFile) => BuildKind::PlatformContainerfile,
        Ok(proto::BuildKind::Unspecified) | Err(_) => {
            return Err(StevedoreError::UnsupportedBuildKind { kind: req.kind.to_string() })
        }
    };

    Ok(BuildRequest {
        kind,
        app: req.app.map(|app| App {
            name: app.name,
            env_vars: app.env_vars.into_iter().collect(),
        }),
        source_image: req.source_image,
        containerfile: req.containerfile,
        data: req.data,
        destination_images: req.destination_images,
        push_options: req.push_options.map(|opts| PushOptions {
            disable: opts.disable,
            insecure_registry: opts.insecure_registry,
        }),
    })
}

pub fn artifacts_to_proto(artifacts: BuildArtifacts) -> proto::BuildArtifacts {
    proto::BuildArtifacts {
        procfile: artifacts.procfile,
        processes: artifacts.processes.into_iter().collect(),
        app_yaml: artifacts.app_yaml,
        image_config: artifacts.image_config.map(image_config_to_proto),
    }
}

fn image_config_to_proto(config: ImageRuntimeConfig) -> proto::ImageConfig {
    proto::ImageConfig {
        entrypoint: config.entrypoint,
        cmd: config.cmd,
        working_dir: config.working_dir,
        exposed_ports: config.exposed_ports,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_build_kind_is_unsupported() {
        let req = proto::BuildRequest { kind: 42, ..Default::default() };
        match build_request_from_proto(req) {
            Err(StevedoreError::UnsupportedBuildKind { kind }) => assert_eq!(kind, "42"),
            other => panic!("expected unsupported build kind, got {other:?}"),
        }
    }

    #[test]
    fn unspecified_build_kind_is_unsupported() {
        let req = proto::BuildRequest::default();
        assert!(build_request_from_proto(req).is_err());
    }

    #[test]
    fn round_trips_request_fields() {
        let req = proto::BuildRequest {
            kind: proto::BuildKind::AppContainerImage as i32,
            app: Some(proto::App {
                name: "myapp".to_string(),
                env_vars: [("PORT".to_string(), "8080".to_string())].into(),
            }),
            source_image: "registry.example.com/myapp:v1".to_string(),
            destination_images: vec!["registry.example.com/myapp:v2".to_string()],
            push_options: Some(proto::PushOptions { disable: false, insecure_registry: true }),
            ..Default::default()
        };

        let domain = build_request_from_proto(req).unwrap();
        assert_eq!(domain.kind, BuildKind::ContainerImage);
        assert_eq!(domain.app.unwrap().env_vars["PORT"], "8080");
        assert!(domain.push_options.unwrap().insecure_registry);
    }
}
