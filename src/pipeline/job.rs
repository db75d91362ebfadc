//! Batch Job driver shared by the build and sign pipelines

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::{Phase, RunStatus, JOB_TYPE_LABEL, TARGET_KERNEL_ANNOTATION};
use crate::crd::Module;
use crate::error::is_not_found;
use crate::kernel_mapper::ModuleLoaderData;
use crate::naming::{deterministic_hash, name_prefix};
use crate::{Error, MODULE_NAME_LABEL};

/// Trait abstracting batch Job access
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Get a Job, `None` if it does not exist
    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<Job>, Error>;

    /// Create a Job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error>;

    /// List Jobs matching a label selector
    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>, Error>;

    /// Delete a Job and its pods; a missing Job is not an error
    async fn delete_job(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// Real Kubernetes Job client
pub struct KubeJobClient {
    client: Client,
}

impl KubeJobClient {
    /// Create a new KubeJobClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobClient for KubeJobClient {
    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), job).await?;
        Ok(())
    }

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let jobs = api.list(&ListParams::default().labels(selector)).await?;
        Ok(jobs.items)
    }

    async fn delete_job(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Render the Job for one pipeline step of `elc`
///
/// The name hashes `fingerprint`, so a changed directive yields a new Job
/// while an unchanged one finds the Job created by an earlier reconcile.
pub(crate) fn pipeline_job(
    phase: Phase,
    elc: &ModuleLoaderData,
    fingerprint: &str,
    mut pod_spec: PodSpec,
    owner: &Module,
) -> Result<Job, Error> {
    let owner_ref = owner.controller_owner_reference()?;

    let name = format!(
        "{}-{phase}-{}",
        name_prefix(&elc.name),
        deterministic_hash(fingerprint)
    );

    let labels = BTreeMap::from([
        (MODULE_NAME_LABEL.to_string(), elc.name.clone()),
        (JOB_TYPE_LABEL.to_string(), phase.as_str().to_string()),
    ]);
    let annotations = BTreeMap::from([(
        TARGET_KERNEL_ANNOTATION.to_string(),
        elc.kernel_version.clone(),
    )]);

    pod_spec.restart_policy = Some("Never".to_string());

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(elc.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            completions: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Observed state of a Job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JobState {
    Active,
    Succeeded,
    Failed,
}

pub(crate) fn job_state(job: &Job) -> JobState {
    let status = job.status.as_ref();
    let condition = |type_: &str| {
        status
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|c| c.iter().any(|c| c.type_ == type_ && c.status == "True"))
    };

    if condition("Complete") || status.and_then(|s| s.succeeded).unwrap_or(0) > 0 {
        JobState::Succeeded
    } else if condition("Failed") {
        JobState::Failed
    } else {
        JobState::Active
    }
}

/// Drives one deterministically named Job per pipeline step
pub struct JobDriver {
    jobs: Arc<dyn JobClient>,
    phase: Phase,
}

impl JobDriver {
    /// Create a driver for `phase`
    pub fn new(jobs: Arc<dyn JobClient>, phase: Phase) -> Self {
        Self { jobs, phase }
    }

    /// Create `desired` if absent, otherwise report the existing Job's state
    pub async fn run(&self, desired: Job) -> Result<RunStatus, Error> {
        let name = desired.name_any();
        let namespace = desired.namespace().unwrap_or_default();

        let Some(existing) = self.jobs.get_job(&name, &namespace).await? else {
            info!(job = %name, phase = %self.phase, "creating pipeline job");
            self.jobs.create_job(&namespace, &desired).await?;
            return Ok(RunStatus::JustStarted);
        };

        match job_state(&existing) {
            JobState::Succeeded => Ok(RunStatus::Completed),
            JobState::Active => {
                debug!(job = %name, phase = %self.phase, "pipeline job still running");
                Ok(RunStatus::Unknown)
            }
            JobState::Failed => Err(Error::pipeline(
                self.phase.as_str(),
                format!("job {namespace}/{name} failed"),
            )),
        }
    }

    /// Delete `owner`'s Jobs of this phase that are no longer needed
    ///
    /// Failed Jobs go so the next cycle can retry. Succeeded Jobs go unless
    /// their name is in `keep`, which covers kernels that left the fleet and
    /// directives that changed. Running Jobs are left to finish.
    pub async fn garbage_collect(
        &self,
        owner: &Module,
        keep: &[String],
    ) -> Result<Vec<String>, Error> {
        let name = owner.name_any();
        let namespace = owner.namespace().unwrap_or_default();
        let selector = format!(
            "{MODULE_NAME_LABEL}={name},{JOB_TYPE_LABEL}={}",
            self.phase.as_str()
        );
        let owner_uid = owner.uid();

        let mut deleted = Vec::new();
        for job in self.jobs.list_jobs(&namespace, &selector).await? {
            let owned = job
                .owner_references()
                .iter()
                .any(|r| Some(&r.uid) == owner_uid.as_ref());
            if !owned {
                continue;
            }

            let job_name = job.name_any();
            let stale = match job_state(&job) {
                JobState::Failed => true,
                JobState::Succeeded => !keep.contains(&job_name),
                JobState::Active => false,
            };
            if !stale {
                continue;
            }

            self.jobs.delete_job(&job_name, &namespace).await?;
            let kernel = job
                .annotations()
                .get(TARGET_KERNEL_ANNOTATION)
                .cloned()
                .unwrap_or_default();
            info!(job = %job_name, phase = %self.phase, kernel = %kernel, "deleted pipeline job");
            deleted.push(job_name);
        }

        Ok(deleted)
    }
}
