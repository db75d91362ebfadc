//! Build and sign image pipelines
//!
//! Both phases share one contract: decide whether the phase applies to an
//! effective loader configuration, drive it forward one step per reconcile,
//! and clean up artifacts that would block a retry. Each step reports a
//! [`RunStatus`] so the module reconciler can stop a kernel's pipeline while
//! work is still in flight.

mod build;
mod job;
mod sign;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::crd::Module;
use crate::kernel_mapper::ModuleLoaderData;
use crate::Error;

pub use build::BuildPipeline;
pub use job::{JobClient, JobDriver, KubeJobClient};
pub use sign::SignPipeline;

#[cfg(test)]
pub use job::MockJobClient;

/// Label carrying the pipeline phase on Jobs
pub const JOB_TYPE_LABEL: &str = "kmm.node.kubernetes.io/job-type";

/// Annotation carrying the target kernel on Jobs
pub const TARGET_KERNEL_ANNOTATION: &str = "kmm.node.kubernetes.io/target-kernel";

/// Outcome of one pipeline step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// Work exists but has not finished
    Unknown,
    /// Work was started during this call
    JustStarted,
    /// Work finished successfully
    Completed,
}

/// Per-call pipeline options
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Push the produced image to its registry
    pub push_image: bool,
    /// Image to read from instead of the configured one (sign only)
    pub source_image: Option<String>,
}

impl RunOptions {
    /// Options that push the result
    pub fn push() -> Self {
        Self {
            push_image: true,
            source_image: None,
        }
    }

    /// Read from `image` instead of the configured source
    pub fn with_source(mut self, image: impl Into<String>) -> Self {
        self.source_image = Some(image.into());
        self
    }
}

/// Pipeline phase, used in Job names and labels
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// In-cluster image build
    Build,
    /// In-cluster module signing
    Sign,
}

impl Phase {
    /// Lowercase phase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Sign => "sign",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared contract of the build and sign collaborators
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImagePipeline: Send + Sync {
    /// Returns true if this phase applies to `elc`
    async fn should_run(&self, elc: &ModuleLoaderData) -> Result<bool, Error>;

    /// Advance this phase for `elc` by one step
    async fn run(
        &self,
        elc: &ModuleLoaderData,
        opts: RunOptions,
        owner: &Module,
    ) -> Result<RunStatus, Error>;

    /// Delete artifacts of `owner` that are no longer desired
    ///
    /// `mappings` are the loader configurations mapped this cycle. Failed
    /// Jobs are always removed so a retry can start; succeeded Jobs are kept
    /// only while they are the current Job of a mapped kernel. Returns the
    /// names of deleted objects.
    async fn garbage_collect(
        &self,
        owner: &Module,
        mappings: &[ModuleLoaderData],
    ) -> Result<Vec<String>, Error>;
}

/// Options a reconcile passes when running `phase` for `elc`
///
/// Build always pushes. Sign pushes too and reads the intermediate unsigned
/// tag when a build precedes it.
pub fn pipeline_options(phase: Phase, elc: &ModuleLoaderData) -> RunOptions {
    match phase {
        Phase::Build => RunOptions::push(),
        Phase::Sign if elc.has_build() => RunOptions::push().with_source(unsigned_image_name(
            &elc.container_image,
            &elc.namespace,
            &elc.name,
        )),
        Phase::Sign => RunOptions::push(),
    }
}

/// Intermediate tag the build pushes to when the image is signed afterwards
///
/// The image's own tag or digest is replaced so that the signed image keeps
/// the final reference.
pub fn unsigned_image_name(image: &str, namespace: &str, module: &str) -> String {
    format!(
        "{}:{namespace}_{module}_kmm_unsigned",
        image_repository(image)
    )
}

/// Strip the tag or digest from an image reference
fn image_repository(image: &str) -> &str {
    let without_digest = image.split_once('@').map_or(image, |(repo, _)| repo);
    let last_slash = without_digest.rfind('/').map_or(0, |i| i + 1);
    match without_digest[last_slash..].rfind(':') {
        Some(colon) => &without_digest[..last_slash + colon],
        None => without_digest,
    }
}
