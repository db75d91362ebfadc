//! In-cluster module signing

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, PodSpec, VolumeMount};
use kube::ResourceExt;
use tracing::instrument;

use super::build::secret_volume;
use super::job::{pipeline_job, JobClient, JobDriver};
use super::{pipeline_options, ImagePipeline, Phase, RunOptions, RunStatus};
use crate::crd::{Module, Sign};
use crate::kernel_mapper::ModuleLoaderData;
use crate::Error;

/// Signs the `.ko` files of an image and pushes the signed image
pub struct SignPipeline {
    driver: JobDriver,
    signer_image: String,
}

impl SignPipeline {
    /// Create a sign pipeline running `signer_image`
    pub fn new(jobs: Arc<dyn JobClient>, signer_image: impl Into<String>) -> Self {
        Self {
            driver: JobDriver::new(jobs, Phase::Sign),
            signer_image: signer_image.into(),
        }
    }

    /// Job that signs `elc`, named after its source, target and directive
    fn desired_job(
        &self,
        elc: &ModuleLoaderData,
        opts: &RunOptions,
        owner: &Module,
    ) -> Result<Job, Error> {
        let sign = elc
            .sign
            .as_ref()
            .ok_or_else(|| Error::pipeline("sign", "no sign configured"))?;

        let source = opts
            .source_image
            .clone()
            .or_else(|| sign.unsigned_image.clone())
            .ok_or_else(|| Error::pipeline("sign", "no unsigned image to sign from"))?;

        let fingerprint = format!(
            "{}|{}|{}|{}|{}",
            elc.kernel_version,
            source,
            elc.container_image,
            opts.push_image,
            serde_json::to_string(sign)?
        );
        let pod_spec = self.pod_spec(elc, sign, &source, opts.push_image);
        pipeline_job(Phase::Sign, elc, &fingerprint, pod_spec, owner)
    }

    fn pod_spec(&self, elc: &ModuleLoaderData, sign: &Sign, source: &str, push: bool) -> PodSpec {
        let mut args = vec![
            "-unsignedimage".to_string(),
            source.to_string(),
            "-signedimage".to_string(),
            elc.container_image.clone(),
            "-key".to_string(),
            "/signingkey/key.pem".to_string(),
            "-cert".to_string(),
            "/signingcert/public.der".to_string(),
        ];
        if !sign.files_to_sign.is_empty() {
            args.push("-filestosign".to_string());
            args.push(sign.files_to_sign.join(":"));
        }
        if sign.unsigned_image_registry_tls.insecure {
            args.push("-insecure".to_string());
        }
        if sign.unsigned_image_registry_tls.insecure_skip_tls_verify {
            args.push("-skip-tls-verify".to_string());
        }
        if !push {
            args.push("-no-push".to_string());
        }

        let mut volumes = vec![
            secret_volume("signing-key", &sign.key_secret.name, Some(("key", "key.pem"))),
            secret_volume(
                "signing-cert",
                &sign.cert_secret.name,
                Some(("cert", "public.der")),
            ),
        ];
        let mut mounts = vec![
            read_only_mount("signing-key", "/signingkey"),
            read_only_mount("signing-cert", "/signingcert"),
        ];

        if let Some(pull) = &elc.image_repo_secret {
            volumes.push(secret_volume(
                "docker-config",
                &pull.name,
                Some((".dockerconfigjson", "config.json")),
            ));
            mounts.push(read_only_mount("docker-config", "/docker_config"));
            args.push("-pullsecret".to_string());
            args.push("/docker_config/config.json".to_string());
        }

        PodSpec {
            containers: vec![Container {
                name: "signimage".to_string(),
                image: Some(self.signer_image.clone()),
                args: Some(args),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }
    }
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

#[async_trait]
impl ImagePipeline for SignPipeline {
    async fn should_run(&self, elc: &ModuleLoaderData) -> Result<bool, Error> {
        Ok(elc.has_sign())
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
            .filter(|elc| elc.has_sign())
            .filter_map(|elc| {
                self.desired_job(elc, &pipeline_options(Phase::Sign, elc), owner)
                    .ok()
            })
            .map(|job| job.name_any())
            .collect();
        self.driver.garbage_collect(owner, &keep).await
    }
}
