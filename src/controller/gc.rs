//! Garbage collection across workloads, build Jobs and sign Jobs
//!
//! The three collectors run in a fixed order and every one of them runs even
//! when an earlier one fails. Failures are reported together afterwards.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::DaemonSet;
use tracing::{info, warn};

use crate::crd::Module;
use crate::kernel_mapper::ModuleLoaderData;
use crate::pipeline::ImagePipeline;
use crate::workload::WorkloadCreator;
use crate::Error;

/// Runs workload, build and sign garbage collection for one module
pub struct GarbageCollector {
    workloads: Arc<dyn WorkloadCreator>,
    build: Arc<dyn ImagePipeline>,
    sign: Arc<dyn ImagePipeline>,
}

impl GarbageCollector {
    /// Create a collector over the three resource classes
    pub fn new(
        workloads: Arc<dyn WorkloadCreator>,
        build: Arc<dyn ImagePipeline>,
        sign: Arc<dyn ImagePipeline>,
    ) -> Self {
        Self {
            workloads,
            build,
            sign,
        }
    }

    /// Collect everything of `module` that is no longer desired
    ///
    /// `mappings` are the loader configurations mapped this cycle and
    /// `existing` the module's current DaemonSets.
    pub async fn collect(
        &self,
        module: &Module,
        mappings: &[ModuleLoaderData],
        existing: &[DaemonSet],
    ) -> Result<(), Error> {
        let valid_kernels: Vec<String> = mappings
            .iter()
            .map(|elc| elc.kernel_version.clone())
            .collect();
        let mut failures = Vec::new();

        match self
            .workloads
            .garbage_collect(module, &valid_kernels, existing)
            .await
        {
            Ok(deleted) => log_deleted("workload", &deleted),
            Err(e) => {
                warn!(error = %e, "workload garbage collection failed");
                failures.push(format!("workloads: {e}"));
            }
        }

        for (class, pipeline) in [("build", &self.build), ("sign", &self.sign)] {
            match pipeline.garbage_collect(module, mappings).await {
                Ok(deleted) => log_deleted(class, &deleted),
                Err(e) => {
                    warn!(error = %e, class, "garbage collection failed");
                    failures.push(format!("{class}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::GarbageCollection(failures))
        }
    }
}

fn log_deleted(class: &str, deleted: &[String]) {
    if !deleted.is_empty() {
        info!(class, ?deleted, "garbage collected");
    }
}
