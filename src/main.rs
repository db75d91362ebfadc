//! KMM operator - kernel module lifecycle across a node fleet

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{predicates, Controller, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt};
use tracing::{debug, info, warn};

use kmm::config::{Cli, Commands, ControllerArgs, OperatorConfig};
use kmm::controller::{module, node_kernel, node_label, Context};
use kmm::crd::{Module, ModuleImagesConfig};
use kmm::telemetry::{init_telemetry, TelemetryConfig};
use kmm::workload::loader_pod_selector;
use kmm::MODULE_NAME_LABEL;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let module = serde_yaml::to_string(&Module::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize Module CRD: {e}"))?;
        let images = serde_yaml::to_string(&ModuleImagesConfig::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize ModuleImagesConfig CRD: {e}"))?;
        println!("{module}---\n{images}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::parse_from(["controller"]),
    };
    let config = OperatorConfig::try_from(args)?;
    run_controller(config).await
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Run the module, node-label and node-kernel controllers until a shutdown signal
async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {e}"))?;
    let ctx = Arc::new(Context::builder(client.clone(), &config).build());
    let namespace = config.namespace.as_deref();

    info!(
        namespace = namespace.unwrap_or("<all>"),
        builder = %config.builder_image,
        signer = %config.signer_image,
        "starting kmm controllers"
    );

    let owned = || WatcherConfig::default().labels(MODULE_NAME_LABEL);
    let node_label_changes =
        watcher::watcher(Api::<Node>::all(client.clone()), WatcherConfig::default())
            .default_backoff()
            .applied_objects()
            .predicate_filter(predicates::labels);

    let module_controller = Controller::new(
        scoped::<Module>(&client, namespace),
        WatcherConfig::default(),
    );
    let modules = module_controller.store();
    let module_controller = module_controller
        .owns(scoped::<DaemonSet>(&client, namespace), owned())
        .owns(scoped::<Job>(&client, namespace), owned())
        .owns(
            scoped::<ModuleImagesConfig>(&client, namespace),
            WatcherConfig::default(),
        )
        .watches_stream(node_label_changes, move |node: Node| {
            module::modules_for_node(&modules.state(), &node)
        })
        .shutdown_on_signal()
        .run(module::reconcile, module::error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(module = %obj.name, "module reconciled"),
                Err(e) => warn!(error = %e, "module controller error"),
            }
        });

    let pod_controller = Controller::new(
        scoped::<Pod>(&client, namespace),
        WatcherConfig::default().labels(&loader_pod_selector()),
    )
    .shutdown_on_signal()
    .run(node_label::reconcile, node_label::error_policy, ctx.clone())
    .for_each(|result| async move {
        match result {
            Ok((obj, _)) => debug!(pod = %obj.name, "node label reconciled"),
            Err(e) => warn!(error = %e, "node label controller error"),
        }
    });

    let node_controller = Controller::new(
        Api::<Node>::all(client.clone()),
        WatcherConfig::default(),
    )
    .shutdown_on_signal()
    .run(node_kernel::reconcile, node_kernel::error_policy, ctx)
    .for_each(|result| async move {
        match result {
            Ok((obj, _)) => debug!(node = %obj.name, "node kernel label reconciled"),
            Err(e) => warn!(error = %e, "node kernel controller error"),
        }
    });

    tokio::select! {
        _ = module_controller => info!("module controller stopped"),
        _ = pod_controller => info!("node label controller stopped"),
        _ = node_controller => info!("node kernel controller stopped"),
    }

    Ok(())
}
