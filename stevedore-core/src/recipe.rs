//! Build recipe (Containerfile) synthesis for source-upload builds.
//!
//! Source uploads don't carry a recipe of their own; the agent generates one
//! that layers the uploaded archive onto the platform base image and runs any
//! build hooks declared in the app configuration, with the app environment
//! mounted as a build secret so hook commands never bake secrets into layers.

use crate::appfiles::{AppYaml, DEFAULT_PLATFORM_WORKING_DIR};

/// Secret source id under which the generated environment file is exposed.
pub const APP_ENV_SECRET_ID: &str = "app-envvars";

/// In-container mount point of the app environment secret.
const ENV_SECRET_TARGET: &str = "/var/run/secrets/envs.sh";

/// Where the uploaded archive is staged inside the image.
const ARCHIVE_STAGING_PATH: &str = "/var/lib/stevedore/archive.tar.gz";

/// Synthesizes the Containerfile for a source-upload build: unpack the
/// uploaded archive into the platform working directory on top of
/// `base_image`, then run the declared build hooks.
pub fn synthesize(base_image: &str, app_yaml: &AppYaml) -> String {
    let mut out = format!("FROM {base_image}\n\n");

    out.push_str(&format!(
        "COPY ./{} {}\n",
        crate::context::APP_ARCHIVE,
        ARCHIVE_STAGING_PATH
    ));
    out.push_str(&format!(
        "RUN {} mkdir -p {workdir} \\\n    && tar -C {workdir} -xzf {archive} \\\n    && rm -f {archive}\n",
        secret_mount_prefix(),
        workdir = DEFAULT_PLATFORM_WORKING_DIR,
        archive = ARCHIVE_STAGING_PATH,
    ));

    for hook in app_yaml.build_hooks() {
        let escaped = shell_escape::escape(hook.as_str().into());
        out.push_str(&format!(
            "RUN {} cd {} && /bin/sh -lc {escaped}\n",
            secret_mount_prefix(),
            DEFAULT_PLATFORM_WORKING_DIR,
        ));
    }

    out.push_str(&format!("WORKDIR {DEFAULT_PLATFORM_WORKING_DIR}\n"));
    out
}

/// Recipe for builds that only re-tag or introspect an existing image.
pub fn from_image(image: &str) -> String {
    format!("FROM {image}\n")
}

// Each RUN sources the app environment from the secret mount, so hook
// commands see the same variables the app will run with.
fn secret_mount_prefix() -> String {
    format!(
        "--mount=type=secret,id={APP_ENV_SECRET_ID},target={ENV_SECRET_TARGET} \\\n    {{ [ -f {ENV_SECRET_TARGET} ] && . {ENV_SECRET_TARGET}; }} ;"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesizes_recipe_without_hooks() {
        let recipe = synthesize("registry.example.com/platforms/python:latest", &AppYaml::default());
        assert!(recipe.starts_with("FROM registry.example.com/platforms/python:latest\n"));
        assert!(recipe.contains("COPY ./application.tar.gz"));
        assert!(recipe.contains("tar -C /home/application/current"));
        assert!(recipe.trim_end().ends_with("WORKDIR /home/application/current"));
        assert_eq!(recipe.matches("RUN ").count(), 1);
    }

    #[test]
    fn synthesizes_one_run_per_build_hook() {
        let yaml =
            AppYaml::parse("hooks:\n  build:\n    - make assets\n    - python manage.py collectstatic\n")
                .unwrap();
        let recipe = synthesize("base:latest", &yaml);
        assert_eq!(recipe.matches("RUN ").count(), 3);
        assert!(recipe.contains("/bin/sh -lc 'make assets'"));
        assert!(recipe.contains("--mount=type=secret,id=app-envvars"));
    }

    #[test]
    fn image_recipe_is_a_single_from_line() {
        assert_eq!(from_image("docker.io/library/nginx:1.25"), "FROM docker.io/library/nginx:1.25\n");
    }
}
