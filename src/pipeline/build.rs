//! In-cluster image build

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, KeyToPath, PodSpec, SecretVolumeSource, Volume, VolumeMount,
};
use kube::ResourceExt;
use tracing::instrument;

use super::job::{pipeline_job, JobClient, JobDriver};
use super::{pipeline_options, unsigned_image_name, ImagePipeline, Phase, RunOptions, RunStatus};
use crate::crd::{Build, Module};
use crate::kernel_mapper::ModuleLoaderData;
use crate::Error;

const WORKSPACE: &str = "/workspace";
const DOCKER_CONFIG_DIR: &str = "/kaniko/.docker";

/// Builds loader images with a Dockerfile from a ConfigMap
pub struct BuildPipeline {
    driver: JobDriver,
    builder_image: String,
}

impl BuildPipeline {
    /// Create a build pipeline running `builder_image`
    pub fn new(jobs: Arc<dyn JobClient>, builder_image: impl Into<String>) -> Self {
        Self {
            driver: JobDriver::new(jobs, Phase::Build),
            builder_image: builder_image.into(),
        }
    }

    /// Image the build pushes to: the unsigned tag when signing follows
    pub fn destination(elc: &ModuleLoaderData) -> String {
        if elc.has_sign() {
            unsigned_image_name(&elc.container_image, &elc.namespace, &elc.name)
        } else {
            elc.container_image.clone()
        }
    }

    /// Job that builds `elc`, named after everything that shapes its output
    fn desired_job(
        &self,
        elc: &ModuleLoaderData,
        opts: &RunOptions,
        owner: &Module,
    ) -> Result<Job, Error> {
        let build = elc
            .build
            .as_ref()
            .ok_or_else(|| Error::pipeline("build", "no build configured"))?;

        let fingerprint = format!(
            "{}|{}|{}|{}",
            elc.kernel_version,
            Self::destination(elc),
            opts.push_image,
            serde_json::to_string(build)?
        );
        let pod_spec = self.pod_spec(elc, build, opts.push_image);
        pipeline_job(Phase::Build, elc, &fingerprint, pod_spec, owner)
    }

    fn pod_spec(&self, elc: &ModuleLoaderData, build: &Build, push: bool) -> PodSpec {
        let mut args = vec![
            format!("--dockerfile={WORKSPACE}/Dockerfile"),
            format!("--context=dir://{WORKSPACE}"),
        ];
        if push {
            args.push(format!("--destination={}", Self::destination(elc)));
        } else {
            args.push("--no-push".to_string());
        }

        for (name, value) in [
            ("KERNEL_VERSION", elc.kernel_version.as_str()),
            ("KERNEL_FULL_VERSION", elc.kernel_version.as_str()),
            ("MOD_NAME", elc.name.as_str()),
            ("MOD_NAMESPACE", elc.namespace.as_str()),
        ] {
            args.push(format!("--build-arg={name}={value}"));
        }
        args.extend(
            build
                .build_args
                .iter()
                .map(|a| format!("--build-arg={}={}", a.name, a.value)),
        );

        let tls = &build.base_image_registry_tls;
        if tls.insecure {
            args.push("--insecure-pull".to_string());
        }
        if tls.insecure_skip_tls_verify {
            args.push("--skip-tls-verify-pull".to_string());
        }

        let mut volumes = vec![Volume {
            name: "dockerfile".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: build.dockerfile_config_map.name.clone(),
                items: Some(vec![KeyToPath {
                    key: "dockerfile".to_string(),
                    path: "Dockerfile".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let mut mounts = vec![VolumeMount {
            name: "dockerfile".to_string(),
            mount_path: WORKSPACE.to_string(),
            read_only: Some(true),
            ..Default::default()
        }];

        for secret in &build.secrets {
            let volume = format!("secret-{}", secret.name);
            volumes.push(secret_volume(&volume, &secret.name, None));
            mounts.push(VolumeMount {
                name: volume,
                mount_path: format!("/run/secrets/{}", secret.name),
                read_only: Some(true),
                ..Default::default()
            });
        }

        if let Some(pull) = &elc.image_repo_secret {
            volumes.push(secret_volume(
                "docker-config",
                &pull.name,
                Some((".dockerconfigjson", "config.json")),
            ));
            mounts.push(VolumeMount {
                name: "docker-config".to_string(),
                mount_path: DOCKER_CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        PodSpec {
            containers: vec![Container {
                name: "kaniko".to_string(),
                image: Some(self.builder_image.clone()),
                args: Some(args),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }
    }
}

pub(crate) fn secret_volume(name: &str, secret: &str, item: Option<(&str, &str)>) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            items: item.map(|(key, path)| {
                vec![KeyToPath {
                    key: key.to_string(),
                    path: path.to_string(),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ImagePipeline for BuildPipeline {
    async fn should_run(&self, elc: &ModuleLoaderData) -> Result<bool, Error> {
        Ok(elc.has_build())
    }

    #[instrument(skip(self, elc, opts, owner), fields(module = %elc.name, kernel = %elc.kernel_version))]
    async fn run(
        &self,
        elc: &ModuleLoaderData,
        opts: RunOptions,
        owner: &Module,
    ) -> Result<RunStatus, Error> {
        let job = self.desired_job(elc, &opts, owner)?;
        self.driver.run(job).await
    }

    async fn garbage_collect(
        &self,
        owner: &Module,
        mappings: &[ModuleLoaderData],
    ) -> Result<Vec<String>, Error> {
        let keep: Vec<String> = mappings
            .iter()
            .filter(|elc| elc.has_build())
            .filter_map(|elc| {
                self.desired_job(elc, &pipeline_options(Phase::Build, elc), owner)
                    .ok()
            })
            .map(|job| job.name_any())
            .collect();
        self.driver.garbage_collect(owner, &keep).await
    }
}
