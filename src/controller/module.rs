//! Module reconciliation
//!
//! One pass resolves every selected node's kernel to a loader configuration,
//! advances build and sign per kernel, deploys loaders for kernels whose
//! images are ready, deploys the device plugin once nothing is in flight,
//! garbage-collects what is no longer desired and finally writes status.
//! Everything is re-derived from fresh reads on every pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::Context;
use crate::crd::{Module, ModuleImageSpec};
use crate::kernel_mapper::{KernelMapper, ModuleLoaderData};
use crate::metrics::{self, MetricsSnapshot};
use crate::pipeline::{pipeline_options, Phase, RunStatus};
use crate::workload::{find_device_plugin_workload, loader_kernel, workload_kind, WorkloadKind};
use crate::Error;

const CONTROLLER: &str = "module";

/// Taint effects that keep a node out of module scheduling
const EXCLUDING_TAINT_EFFECTS: [&str; 2] = ["NoSchedule", "NoExecute"];

/// Reconcile a Module
///
/// The watched object only identifies what to reconcile; the Module is
/// fetched again so every pass starts from current state.
#[instrument(
    skip(module, ctx),
    fields(module = %module.name_any(), namespace = %module.namespace().unwrap_or_default())
)]
pub async fn reconcile(module: Arc<Module>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = Instant::now();
    let result = reconcile_module(
        &module.name_any(),
        &module.namespace().unwrap_or_default(),
        &ctx,
    )
    .await;
    metrics::record_reconcile(CONTROLLER, start.elapsed().as_secs_f64(), result.is_ok());
    result
}

/// Requeue a Module after a failed reconcile
pub fn error_policy(module: Arc<Module>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        module = %module.name_any(),
        namespace = %module.namespace().unwrap_or_default(),
        "module reconciliation failed"
    );
    metrics::record_reconcile_error(CONTROLLER);
    Action::requeue(ctx.error_requeue)
}

async fn reconcile_module(name: &str, namespace: &str, ctx: &Context) -> Result<Action, Error> {
    let Some(module) = ctx.kube.get_module(name, namespace).await? else {
        debug!("module not found, nothing to do");
        return Ok(Action::await_change());
    };

    if module.metadata.deletion_timestamp.is_some() {
        delete_workloads(name, namespace, ctx).await?;
        return Ok(Action::await_change());
    }

    publish_metrics(ctx).await;

    let existing = ctx.workloads.module_workloads(name, namespace).await?;

    let nodes = ctx.kube.list_nodes(&module.spec.selector).await?;
    let selected = schedulable_nodes(nodes);

    let (mappings, mapped_nodes) = map_kernels(ctx.kernel_mapper.as_ref(), &module, &selected);
    debug!(
        selected = selected.len(),
        mapped = mapped_nodes.len(),
        kernels = mappings.len(),
        "resolved kernel mappings"
    );

    ctx.images
        .reconcile(
            name,
            namespace,
            desired_images(&mappings),
            module.spec.image_repo_secret.clone(),
            &module,
        )
        .await?;

    // Later steps still run after a failure; the first error is returned
    let mut errors = Vec::new();
    let mut in_progress = false;
    for (kernel, elc) in &mappings {
        match advance_kernel(ctx, elc, &module, &existing).await {
            Ok(true) => {}
            Ok(false) => in_progress = true,
            Err(e) => {
                warn!(kernel = %kernel, error = %e, "kernel pipeline failed");
                in_progress = true;
                errors.push(e);
            }
        }
    }

    if !in_progress {
        if let Err(e) = reconcile_device_plugin(ctx, &module, &existing).await {
            warn!(error = %e, "device plugin reconciliation failed");
            errors.push(e);
        }
    } else {
        debug!("kernels still in flight, device plugin deferred");
    }

    let mapped: Vec<ModuleLoaderData> = mappings.into_values().collect();
    if let Err(e) = ctx
        .garbage_collector()
        .collect(&module, &mapped, &existing)
        .await
    {
        errors.push(e);
    }

    if let Err(e) = ctx
        .status
        .update(&module, &mapped_nodes, &selected, &existing)
        .await
    {
        errors.push(e);
    }

    match errors.into_iter().next() {
        Some(first) => Err(first),
        None => Ok(Action::await_change()),
    }
}

async fn delete_workloads(name: &str, namespace: &str, ctx: &Context) -> Result<(), Error> {
    let workloads = ctx.workloads.module_workloads(name, namespace).await?;
    for ds in &workloads {
        let ds_name = ds.name_any();
        ctx.kube.delete_daemon_set(&ds_name, namespace).await?;
        info!(daemonset = %ds_name, "deleted workload of deleted module");
    }
    Ok(())
}

/// Recompute aggregate gauges; failures are only logged
async fn publish_metrics(ctx: &Context) {
    match ctx.kube.list_modules().await {
        Ok(modules) => ctx
            .metrics
            .publish(&MetricsSnapshot::from_modules(&modules)),
        Err(e) => warn!(error = %e, "failed to list modules for metrics"),
    }
}

/// Drop nodes carrying a NoSchedule or NoExecute taint
pub fn schedulable_nodes(nodes: Vec<Node>) -> Vec<Node> {
    nodes
        .into_iter()
        .filter(|node| {
            let taints = node.spec.as_ref().and_then(|s| s.taints.as_ref());
            !taints.is_some_and(|taints| {
                taints
                    .iter()
                    .any(|t| EXCLUDING_TAINT_EFFECTS.contains(&t.effect.as_str()))
            })
        })
        .collect()
}

/// Returns true if `node` carries every label of the module's selector
pub fn selects_node(module: &Module, node: &Node) -> bool {
    let labels = node.labels();
    module
        .spec
        .selector
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
}

/// Modules to requeue when a node's labels change
pub fn modules_for_node<'a>(
    modules: impl IntoIterator<Item = &'a Arc<Module>>,
    node: &Node,
) -> Vec<ObjectRef<Module>> {
    modules
        .into_iter()
        .filter(|m| selects_node(m, node))
        .map(|m| ObjectRef::from_obj(m.as_ref()))
        .collect()
}

/// Kernel version reported by a node's kubelet
pub fn node_kernel(node: &Node) -> Option<&str> {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|info| info.kernel_version.as_str())
        .filter(|kernel| !kernel.is_empty())
}

/// Resolve every node's kernel, dropping nodes whose kernel does not map
///
/// Returns the configuration per distinct kernel and the nodes that mapped.
pub fn map_kernels(
    mapper: &dyn KernelMapper,
    module: &Module,
    nodes: &[Node],
) -> (BTreeMap<String, ModuleLoaderData>, Vec<Node>) {
    let mut mappings = BTreeMap::new();
    let mut failed: Vec<String> = Vec::new();
    let mut mapped_nodes = Vec::new();

    for node in nodes {
        let Some(kernel) = node_kernel(node) else {
            warn!(node = %node.name_any(), "node reports no kernel version");
            continue;
        };

        if !mappings.contains_key(kernel) {
            if failed.iter().any(|k| k == kernel) {
                continue;
            }
            match mapper.resolve(module, kernel) {
                Ok(elc) => {
                    mappings.insert(kernel.to_string(), elc);
                }
                Err(e) => {
                    if e.is_not_matched() {
                        debug!(node = %node.name_any(), kernel, "no kernel mapping, skipping node");
                    } else {
                        warn!(node = %node.name_any(), kernel, error = %e, "kernel mapping failed");
                    }
                    failed.push(kernel.to_string());
                    continue;
                }
            }
        }
        mapped_nodes.push(node.clone());
    }

    (mappings, mapped_nodes)
}

fn desired_images(mappings: &BTreeMap<String, ModuleLoaderData>) -> Vec<ModuleImageSpec> {
    mappings
        .values()
        .map(|elc| ModuleImageSpec {
            image: elc.container_image.clone(),
            build: elc.build.clone(),
            sign: elc.sign.clone(),
            generation: 0,
        })
        .collect()
}

/// Advance build, sign and the loader for one kernel
///
/// Returns true once the loader workload has been applied.
#[instrument(skip_all, fields(kernel = %elc.kernel_version))]
async fn advance_kernel(
    ctx: &Context,
    elc: &ModuleLoaderData,
    module: &Module,
    existing: &[DaemonSet],
) -> Result<bool, Error> {
    if ctx.build.should_run(elc).await? {
        let opts = pipeline_options(Phase::Build, elc);
        let status = ctx.build.run(elc, opts, module).await?;
        if status != RunStatus::Completed {
            debug!(?status, "build not complete");
            return Ok(false);
        }
    }

    if ctx.sign.should_run(elc).await? {
        let opts = pipeline_options(Phase::Sign, elc);
        let status = ctx.sign.run(elc, opts, module).await?;
        if status != RunStatus::Completed {
            debug!(?status, "sign not complete");
            return Ok(false);
        }
    }

    let current = existing
        .iter()
        .find(|ds| {
            workload_kind(ds) == Some(WorkloadKind::Loader)
                && loader_kernel(ds) == Some(elc.kernel_version.as_str())
        })
        .cloned();
    ctx.workloads.create_or_update_loader(elc, current).await?;
    Ok(true)
}

async fn reconcile_device_plugin(
    ctx: &Context,
    module: &Module,
    existing: &[DaemonSet],
) -> Result<(), Error> {
    if module.spec.device_plugin.is_none() {
        return Ok(());
    }
    let current = find_device_plugin_workload(
        existing,
        &module.namespace().unwrap_or_default(),
        &module.name_any(),
        module.spec.version(),
    )
    .cloned();
    ctx.workloads
        .create_or_update_device_plugin(module, current)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus, NodeSystemInfo, Taint};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use rstest::rstest;

    use super::super::client::MockKubeClient;
    use super::super::images_config::MockImagesConfigManager;
    use super::super::status::MockStatusUpdater;
    use crate::crd::DevicePluginSpec;
    use crate::fixtures::{sample_build, sample_elc, sample_module, sample_sign, MODULE, NAMESPACE};
    use crate::kernel_mapper::{MappingError, MockKernelMapper};
    use crate::metrics::MockMetricsSink;
    use crate::pipeline::{unsigned_image_name, MockImagePipeline};
    use crate::workload::{MockWorkloadCreator, WORKLOAD_TYPE_LABEL};
    use crate::KERNEL_VERSION_LABEL;

    const KERNEL_A: &str = "5.14.0-284.el9.x86_64";
    const KERNEL_B: &str = "6.1.0-13-amd64";

    fn node(name: &str, kernel: &str, taint_effect: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints: taint_effect.map(|effect| {
                    vec![Taint {
                        key: "dedicated".to_string(),
                        effect: effect.to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    kernel_version: kernel.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    fn loader_workload(kernel: &str) -> DaemonSet {
        DaemonSet {
            metadata: ObjectMeta {
                name: Some(format!("{MODULE}-loader-{kernel}")),
                namespace: Some(NAMESPACE.to_string()),
                labels: Some(BTreeMap::from([
                    (WORKLOAD_TYPE_LABEL.to_string(), "module-loader".to_string()),
                    (KERNEL_VERSION_LABEL.to_string(), kernel.to_string()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Collaborator mocks for one reconcile; unset expectations panic if hit
    struct Harness {
        kube: MockKubeClient,
        mapper: MockKernelMapper,
        build: MockImagePipeline,
        sign: MockImagePipeline,
        workloads: MockWorkloadCreator,
        images: MockImagesConfigManager,
        status: MockStatusUpdater,
        metrics: MockMetricsSink,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                kube: MockKubeClient::new(),
                mapper: MockKernelMapper::new(),
                build: MockImagePipeline::new(),
                sign: MockImagePipeline::new(),
                workloads: MockWorkloadCreator::new(),
                images: MockImagesConfigManager::new(),
                status: MockStatusUpdater::new(),
                metrics: MockMetricsSink::new(),
            }
        }

        /// A live module on `nodes`, with every read succeeding
        fn live(module: Module, nodes: Vec<Node>, existing: Vec<DaemonSet>) -> Self {
            let mut h = Self::new();
            let listed = module.clone();
            h.kube
                .expect_get_module()
                .returning(move |_, _| Ok(Some(module.clone())));
            h.kube
                .expect_list_modules()
                .returning(move || Ok(vec![listed.clone()]));
            h.kube
                .expect_list_nodes()
                .returning(move |_| Ok(nodes.clone()));
            h.metrics.expect_publish().return_const(());
            h.workloads
                .expect_module_workloads()
                .returning(move |_, _| Ok(existing.clone()));
            h.images
                .expect_reconcile()
                .returning(|_, _, _, _, _| Ok(()));
            h
        }

        /// Every collector succeeds and status is written once
        fn expect_tail(&mut self) {
            self.workloads
                .expect_garbage_collect()
                .times(1)
                .returning(|_, _, _| Ok(vec![]));
            self.build
                .expect_garbage_collect()
                .times(1)
                .returning(|_, _| Ok(vec![]));
            self.sign
                .expect_garbage_collect()
                .times(1)
                .returning(|_, _| Ok(vec![]));
            self.status
                .expect_update()
                .times(1)
                .returning(|_, _, _, _| Ok(()));
        }

        fn context(self) -> Arc<Context> {
            let mut ctx = Context::for_testing(Arc::new(self.kube));
            ctx.kernel_mapper = Arc::new(self.mapper);
            ctx.build = Arc::new(self.build);
            ctx.sign = Arc::new(self.sign);
            ctx.workloads = Arc::new(self.workloads);
            ctx.images = Arc::new(self.images);
            ctx.status = Arc::new(self.status);
            ctx.metrics = Arc::new(self.metrics);
            Arc::new(ctx)
        }
    }

    fn elc_for(kernel: &str) -> ModuleLoaderData {
        sample_elc(kernel)
    }

    mod node_selection {
        use super::*;

        #[rstest]
        #[case::no_schedule_excluded(Some("NoSchedule"), false)]
        #[case::no_execute_excluded(Some("NoExecute"), false)]
        #[case::prefer_no_schedule_kept(Some("PreferNoSchedule"), true)]
        #[case::untainted_kept(None, true)]
        fn taint_effect_decides_selection(#[case] effect: Option<&str>, #[case] kept: bool) {
            let selected = schedulable_nodes(vec![node("n", KERNEL_A, effect)]);
            assert_eq!(selected.len() == 1, kept);
        }

        /// Story: mixed fleet keeps only the nodes a loader could land on
        #[test]
        fn story_mixed_taints_keep_order() {
            let selected = schedulable_nodes(vec![
                node("tainted", KERNEL_A, Some("NoSchedule")),
                node("plain", KERNEL_A, None),
                node("soft", KERNEL_A, Some("PreferNoSchedule")),
            ]);
            let names: Vec<_> = selected.iter().map(|n| n.name_any()).collect();
            assert_eq!(names, vec!["plain", "soft"]);
        }
    }

    mod kernel_mapping {
        use super::*;

        /// Story: one unmatched kernel does not hold back the rest
        ///
        /// Nodes run kernels A, B, A and only A has a rule. Both A nodes map,
        /// the B node is dropped and the mapping has a single entry.
        #[test]
        fn story_unmatched_kernel_drops_only_its_nodes() {
            let mut mapper = MockKernelMapper::new();
            mapper.expect_resolve().returning(|_, kernel| {
                if kernel == KERNEL_A {
                    Ok(elc_for(kernel))
                } else {
                    Err(MappingError::NotMatched {
                        kernel: kernel.to_string(),
                    })
                }
            });

            let nodes = vec![
                node("a1", KERNEL_A, None),
                node("b1", KERNEL_B, None),
                node("a2", KERNEL_A, None),
            ];
            let (mappings, mapped) = map_kernels(&mapper, &sample_module(), &nodes);

            assert_eq!(mappings.keys().collect::<Vec<_>>(), vec![KERNEL_A]);
            let names: Vec<_> = mapped.iter().map(|n| n.name_any()).collect();
            assert_eq!(names, vec!["a1", "a2"]);
        }

        #[test]
        fn each_distinct_kernel_is_resolved_once() {
            let mut mapper = MockKernelMapper::new();
            mapper
                .expect_resolve()
                .times(1)
                .returning(|_, kernel| Ok(elc_for(kernel)));

            let nodes = vec![node("a1", KERNEL_A, None), node("a2", KERNEL_A, None)];
            let (_, mapped) = map_kernels(&mapper, &sample_module(), &nodes);
            assert_eq!(mapped.len(), 2);
        }

        #[test]
        fn invalid_rule_is_skipped_like_no_match() {
            let mut mapper = MockKernelMapper::new();
            mapper.expect_resolve().returning(|_, _| {
                Err(MappingError::InvalidRule {
                    index: 0,
                    reason: "bad regexp".to_string(),
                })
            });

            let (mappings, mapped) =
                map_kernels(&mapper, &sample_module(), &[node("a", KERNEL_A, None)]);
            assert!(mappings.is_empty());
            assert!(mapped.is_empty());
        }
    }

    /// Story: a module that is gone is already converged
    #[tokio::test]
    async fn story_missing_module_is_success() {
        let mut h = Harness::new();
        h.kube.expect_get_module().returning(|_, _| Ok(None));

        let action = reconcile(Arc::new(sample_module()), h.context())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: deleting a module tears down its workloads and nothing else
    ///
    /// No metrics listing, node listing, pipeline, image record or status
    /// write happens; the harness mocks panic if any were called.
    #[tokio::test]
    async fn story_deleted_module_only_deletes_workloads() {
        let mut module = sample_module();
        module.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));

        let mut h = Harness::new();
        h.kube
            .expect_get_module()
            .returning(move |_, _| Ok(Some(module.clone())));
        h.workloads
            .expect_module_workloads()
            .returning(|_, _| Ok(vec![loader_workload(KERNEL_A), loader_workload(KERNEL_B)]));
        h.kube
            .expect_delete_daemon_set()
            .times(2)
            .withf(|_, ns| ns == NAMESPACE)
            .returning(|_, _| Ok(()));

        reconcile(Arc::new(sample_module()), h.context())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn workload_deletion_failure_aborts() {
        let mut module = sample_module();
        module.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));

        let mut h = Harness::new();
        h.kube
            .expect_get_module()
            .returning(move |_, _| Ok(Some(module.clone())));
        h.workloads
            .expect_module_workloads()
            .returning(|_, _| Ok(vec![loader_workload(KERNEL_A), loader_workload(KERNEL_B)]));
        h.kube
            .expect_delete_daemon_set()
            .times(1)
            .returning(|_, _| Err(Error::internal("forbidden")));

        assert!(reconcile(Arc::new(sample_module()), h.context())
            .await
            .is_err());
    }

    /// Story: a just-started build parks the kernel until the Job finishes
    ///
    /// Sign is not even asked whether it applies, no loader is deployed and
    /// the device plugin waits, but garbage collection and status still run.
    #[tokio::test]
    async fn story_just_started_build_skips_sign_and_device_plugin() {
        let mut module = sample_module();
        module.spec.device_plugin = Some(DevicePluginSpec::default());

        let mut h = Harness::live(module, vec![node("a", KERNEL_A, None)], vec![]);
        h.mapper.expect_resolve().returning(|_, kernel| {
            Ok(ModuleLoaderData {
                build: Some(sample_build()),
                sign: Some(sample_sign()),
                ..elc_for(kernel)
            })
        });
        h.build.expect_should_run().returning(|_| Ok(true));
        h.build
            .expect_run()
            .times(1)
            .returning(|_, _, _| Ok(RunStatus::JustStarted));
        h.sign.expect_should_run().never();
        h.sign.expect_run().never();
        h.workloads.expect_create_or_update_loader().never();
        h.workloads.expect_create_or_update_device_plugin().never();
        h.expect_tail();

        let action = reconcile(Arc::new(sample_module()), h.context())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: build then sign reads the intermediate unsigned tag
    ///
    /// With both phases configured the build pushes to the unsigned tag and
    /// sign takes it as source. Once both are complete the loader for that
    /// kernel is applied against the existing DaemonSet.
    #[tokio::test]
    async fn story_sign_reads_unsigned_tag_and_loader_follows() {
        let existing = vec![loader_workload(KERNEL_A)];
        let mut h = Harness::live(sample_module(), vec![node("a", KERNEL_A, None)], existing);
        h.mapper.expect_resolve().returning(|_, kernel| {
            Ok(ModuleLoaderData {
                build: Some(sample_build()),
                sign: Some(sample_sign()),
                ..elc_for(kernel)
            })
        });
        h.build.expect_should_run().returning(|_| Ok(true));
        h.build
            .expect_run()
            .withf(|_, opts, _| opts.push_image && opts.source_image.is_none())
            .returning(|_, _, _| Ok(RunStatus::Completed));
        h.sign.expect_should_run().returning(|_| Ok(true));
        let unsigned = unsigned_image_name(&elc_for(KERNEL_A).container_image, NAMESPACE, MODULE);
        h.sign
            .expect_run()
            .times(1)
            .withf(move |_, opts, _| opts.source_image.as_deref() == Some(unsigned.as_str()))
            .returning(|_, _, _| Ok(RunStatus::Completed));
        h.workloads
            .expect_create_or_update_loader()
            .times(1)
            .withf(|elc, current| {
                elc.kernel_version == KERNEL_A
                    && current.as_ref().and_then(|ds| loader_kernel(ds)) == Some(KERNEL_A)
            })
            .returning(|_, _| Ok(()));
        h.expect_tail();

        reconcile(Arc::new(sample_module()), h.context())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sign_only_uses_configured_source() {
        let mut h = Harness::live(sample_module(), vec![node("a", KERNEL_A, None)], vec![]);
        h.mapper.expect_resolve().returning(|_, kernel| {
            Ok(ModuleLoaderData {
                sign: Some(sample_sign()),
                ..elc_for(kernel)
            })
        });
        h.build.expect_should_run().returning(|_| Ok(false));
        h.build.expect_run().never();
        h.sign.expect_should_run().returning(|_| Ok(true));
        h.sign
            .expect_run()
            .withf(|_, opts, _| opts.source_image.is_none())
            .returning(|_, _, _| Ok(RunStatus::Unknown));
        h.workloads.expect_create_or_update_loader().never();
        h.expect_tail();

        reconcile(Arc::new(sample_module()), h.context())
            .await
            .unwrap();
    }

    /// Story: with every kernel ready the device plugin is applied
    #[tokio::test]
    async fn story_device_plugin_applied_when_nothing_in_flight() {
        let mut module = sample_module();
        module.spec.device_plugin = Some(DevicePluginSpec::default());

        let mut h = Harness::live(module.clone(), vec![node("a", KERNEL_A, None)], vec![]);
        h.mapper
            .expect_resolve()
            .returning(|_, kernel| Ok(elc_for(kernel)));
        h.build.expect_should_run().returning(|_| Ok(false));
        h.sign.expect_should_run().returning(|_| Ok(false));
        h.workloads
            .expect_create_or_update_loader()
            .times(1)
            .returning(|_, _| Ok(()));
        h.workloads
            .expect_create_or_update_device_plugin()
            .times(1)
            .withf(|_, current| current.is_none())
            .returning(|_, _| Ok(()));
        h.expect_tail();

        reconcile(Arc::new(module), h.context()).await.unwrap();
    }

    /// Story: metrics are a side channel
    ///
    /// Listing modules for the gauges fails, nothing is published and the
    /// reconcile still converges.
    #[tokio::test]
    async fn story_metrics_listing_failure_is_swallowed() {
        let module = sample_module();
        let mut h = Harness::new();
        h.kube
            .expect_get_module()
            .returning(move |_, _| Ok(Some(module.clone())));
        h.kube
            .expect_list_modules()
            .returning(|| Err(Error::internal("list failed")));
        h.metrics.expect_publish().never();
        h.kube.expect_list_nodes().returning(|_| Ok(vec![]));
        h.workloads
            .expect_module_workloads()
            .returning(|_, _| Ok(vec![]));
        h.images
            .expect_reconcile()
            .withf(|_, _, images, _, _| images.is_empty())
            .returning(|_, _, _, _, _| Ok(()));
        h.expect_tail();

        reconcile(Arc::new(sample_module()), h.context())
            .await
            .unwrap();
    }

    /// Story: a failed collector fails the reconcile after status is written
    #[tokio::test]
    async fn story_gc_failure_surfaces_after_status() {
        let mut h = Harness::live(sample_module(), vec![], vec![]);
        h.workloads
            .expect_garbage_collect()
            .returning(|_, _, _| Err(Error::internal("apiserver down")));
        h.build
            .expect_garbage_collect()
            .times(1)
            .returning(|_, _| Ok(vec![]));
        h.sign
            .expect_garbage_collect()
            .times(1)
            .returning(|_, _| Ok(vec![]));
        h.status
            .expect_update()
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let err = reconcile(Arc::new(sample_module()), h.context())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GarbageCollection(_)));
    }

    /// Story: a failed build Job on one kernel does not block the others
    ///
    /// Kernel A's build errors while kernel B deploys its loader; collectors
    /// run so the failed Job can be cleaned up and the error is returned.
    #[tokio::test]
    async fn story_pipeline_failure_is_isolated_per_kernel() {
        let nodes = vec![node("a", KERNEL_A, None), node("b", KERNEL_B, None)];
        let mut h = Harness::live(sample_module(), nodes, vec![]);
        h.mapper.expect_resolve().returning(|_, kernel| {
            let build = (kernel == KERNEL_A).then(sample_build);
            Ok(ModuleLoaderData {
                build,
                ..elc_for(kernel)
            })
        });
        h.build
            .expect_should_run()
            .returning(|elc| Ok(elc.build.is_some()));
        h.build
            .expect_run()
            .returning(|_, _, _| Err(Error::pipeline("build", "job failed")));
        h.sign.expect_should_run().returning(|_| Ok(false));
        h.workloads
            .expect_create_or_update_loader()
            .times(1)
            .withf(|elc, _| elc.kernel_version == KERNEL_B)
            .returning(|_, _| Ok(()));
        h.expect_tail();

        let err = reconcile(Arc::new(sample_module()), h.context())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pipeline { .. }));
    }

    #[tokio::test]
    async fn status_failure_is_the_reconcile_error() {
        let mut h = Harness::live(sample_module(), vec![], vec![]);
        h.workloads
            .expect_garbage_collect()
            .returning(|_, _, _| Ok(vec![]));
        h.build
            .expect_garbage_collect()
            .returning(|_, _| Ok(vec![]));
        h.sign
            .expect_garbage_collect()
            .returning(|_, _| Ok(vec![]));
        h.status
            .expect_update()
            .returning(|_, _, _, _| Err(Error::internal("conflict")));

        assert!(reconcile(Arc::new(sample_module()), h.context())
            .await
            .is_err());
    }

    /// Story: the first failure is the one reported
    ///
    /// Workload collection fails and then the status write conflicts. Status
    /// is still attempted, but the reconcile returns the earlier collector
    /// error unchanged.
    #[tokio::test]
    async fn story_gc_error_is_not_masked_by_status_error() {
        let mut h = Harness::live(sample_module(), vec![], vec![]);
        h.workloads
            .expect_garbage_collect()
            .times(1)
            .returning(|_, _, _| Err(Error::internal("apiserver down")));
        h.build
            .expect_garbage_collect()
            .times(1)
            .returning(|_, _| Ok(vec![]));
        h.sign
            .expect_garbage_collect()
            .times(1)
            .returning(|_, _| Ok(vec![]));
        h.status
            .expect_update()
            .times(1)
            .returning(|_, _, _, _| Err(Error::internal("status conflict")));

        let err = reconcile(Arc::new(sample_module()), h.context())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GarbageCollection(_)), "got {err}");
    }

    /// Story: a device plugin that cannot be applied does not stop cleanup
    ///
    /// Every collector and the status write still run once, and the device
    /// plugin error is what the reconcile reports.
    #[tokio::test]
    async fn story_device_plugin_failure_still_collects_and_writes_status() {
        let mut module = sample_module();
        module.spec.device_plugin = Some(DevicePluginSpec::default());

        let mut h = Harness::live(module.clone(), vec![node("a", KERNEL_A, None)], vec![]);
        h.mapper
            .expect_resolve()
            .returning(|_, kernel| Ok(elc_for(kernel)));
        h.build.expect_should_run().returning(|_| Ok(false));
        h.sign.expect_should_run().returning(|_| Ok(false));
        h.workloads
            .expect_create_or_update_loader()
            .returning(|_, _| Ok(()));
        h.workloads
            .expect_create_or_update_device_plugin()
            .times(1)
            .returning(|_, _| Err(Error::internal("device plugin rejected")));
        h.expect_tail();

        let err = reconcile(Arc::new(module), h.context()).await.unwrap_err();
        assert!(
            matches!(err, Error::Internal(ref msg) if msg == "device plugin rejected"),
            "got {err}"
        );
    }

    #[tokio::test]
    async fn pipeline_error_is_reported_ahead_of_gc_error() {
        let mut h = Harness::live(sample_module(), vec![node("a", KERNEL_A, None)], vec![]);
        h.mapper.expect_resolve().returning(|_, kernel| {
            Ok(ModuleLoaderData {
                build: Some(sample_build()),
                ..elc_for(kernel)
            })
        });
        h.build.expect_should_run().returning(|_| Ok(true));
        h.build
            .expect_run()
            .returning(|_, _, _| Err(Error::pipeline("build", "job failed")));
        h.workloads
            .expect_garbage_collect()
            .returning(|_, _, _| Err(Error::internal("apiserver down")));
        h.build
            .expect_garbage_collect()
            .times(1)
            .withf(|_, mappings| mappings.len() == 1)
            .returning(|_, _| Ok(vec![]));
        h.sign
            .expect_garbage_collect()
            .times(1)
            .returning(|_, _| Ok(vec![]));
        h.status
            .expect_update()
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let err = reconcile(Arc::new(sample_module()), h.context())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pipeline { .. }), "got {err}");
    }

    #[test]
    fn error_policy_requeues_after_configured_delay() {
        let ctx = Harness::new().context();
        let action = error_policy(
            Arc::new(sample_module()),
            &Error::internal("boom"),
            ctx.clone(),
        );
        assert_eq!(action, Action::requeue(ctx.error_requeue));
    }

    #[test]
    fn node_events_map_to_selecting_modules() {
        let module = sample_module();
        let mut gpu = node("gpu", KERNEL_A, None);
        gpu.metadata.labels = Some(BTreeMap::from([
            ("gpu".to_string(), "true".to_string()),
            ("zone".to_string(), "a".to_string()),
        ]));
        let cpu = node("cpu", KERNEL_A, None);

        assert!(selects_node(&module, &gpu));
        assert!(!selects_node(&module, &cpu));
    }

    /// Story: only node label changes wake modules up
    ///
    /// A kubelet heartbeat rewrites status without touching labels and is
    /// filtered out. Labeling a node into a module's selector passes the
    /// filter and requeues exactly that module.
    #[test]
    fn story_node_label_change_requeues_selecting_module() {
        use kube::runtime::predicates;

        let cpu = node("worker", KERNEL_A, None);
        let mut heartbeat = cpu.clone();
        if let Some(status) = heartbeat.status.as_mut() {
            status.conditions = Some(vec![Default::default()]);
        }
        assert_eq!(predicates::labels(&cpu), predicates::labels(&heartbeat));

        let mut labeled = cpu.clone();
        labeled.metadata.labels = Some(BTreeMap::from([
            ("gpu".to_string(), "true".to_string()),
            ("zone".to_string(), "a".to_string()),
        ]));
        assert_ne!(predicates::labels(&cpu), predicates::labels(&labeled));

        let mut other = sample_module();
        other.metadata.name = Some("other".to_string());
        other.spec.selector = BTreeMap::from([("fpga".to_string(), "true".to_string())]);
        let modules = vec![Arc::new(sample_module()), Arc::new(other)];

        let requeued = modules_for_node(&modules, &labeled);
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].name, MODULE);
        assert!(modules_for_node(&modules, &cpu).is_empty());
    }

    #[test]
    fn nodes_without_kernel_are_skipped() {
        let mut bare = node("bare", KERNEL_A, None);
        bare.status = None;
        assert_eq!(node_kernel(&bare), None);
        assert_eq!(node_kernel(&node("a", KERNEL_A, None)), Some(KERNEL_A));
    }
}
