//! OpenTelemetry metrics for KMM
//!
//! Aggregate gauges are recomputed from a fresh listing of every Module on
//! each module reconcile. Publishing is best effort and never affects
//! reconciliation.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};

#[cfg(test)]
use mockall::automock;

use crate::crd::{ModprobeArgs, Module};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("kmm"));

/// Number of Modules
pub static MODULES: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("kmm_module_num")
        .with_description("Number of existing KMM modules")
        .build()
});

/// Modules building in-cluster in the container or any kernel mapping
pub static IN_CLUSTER_BUILDS: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("kmm_in_cluster_build_num")
        .with_description("Number of modules using in-cluster build")
        .build()
});

/// Modules signing in-cluster in the container or any kernel mapping
pub static IN_CLUSTER_SIGNS: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("kmm_in_cluster_sign_num")
        .with_description("Number of modules using in-cluster signing")
        .build()
});

/// Modules with a device plugin
pub static DEVICE_PLUGINS: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("kmm_device_plugin_num")
        .with_description("Number of modules with a device plugin")
        .build()
});

/// Modprobe arguments per module
///
/// Labels:
/// - `name`, `namespace`: module identity
/// - `args`: load arguments joined by `,`
pub static MODPROBE_ARGS: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("kmm_modprobe_args")
        .with_description("Modprobe arguments of a module")
        .build()
});

/// Raw modprobe arguments per module, labeled like [`MODPROBE_ARGS`]
pub static MODPROBE_RAW_ARGS: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("kmm_modprobe_raw_args")
        .with_description("Raw modprobe arguments of a module")
        .build()
});

/// Reconcile duration
///
/// Labels:
/// - `controller`: module, images_config, node_label
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("kmm_reconcile_duration_seconds")
        .with_description("Duration of reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Reconcile errors, labeled by `controller`
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kmm_reconcile_errors_total")
        .with_description("Total number of reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Record one reconcile's duration and outcome
pub fn record_reconcile(controller: &'static str, seconds: f64, success: bool) {
    let result = if success { "success" } else { "error" };
    RECONCILE_DURATION.record(
        seconds,
        &[
            KeyValue::new("controller", controller),
            KeyValue::new("result", result),
        ],
    );
}

/// Count one failed reconcile
pub fn record_reconcile_error(controller: &'static str) {
    RECONCILE_ERRORS.add(1, &[KeyValue::new("controller", controller)]);
}

/// Modprobe arguments of one module
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleArgs {
    /// Module name
    pub name: String,
    /// Module namespace
    pub namespace: String,
    /// Arguments joined by `,`
    pub args: String,
}

/// Aggregate values computed from all Modules
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Number of modules
    pub modules: u64,
    /// Modules with in-cluster build
    pub in_cluster_builds: u64,
    /// Modules with in-cluster sign
    pub in_cluster_signs: u64,
    /// Modules with a device plugin
    pub device_plugins: u64,
    /// Modules with modprobe args
    pub modprobe_args: Vec<ModuleArgs>,
    /// Modules with raw modprobe args
    pub modprobe_raw_args: Vec<ModuleArgs>,
}

impl MetricsSnapshot {
    /// Compute the snapshot for `modules`
    pub fn from_modules(modules: &[Module]) -> Self {
        let mut snapshot = Self {
            modules: modules.len() as u64,
            ..Default::default()
        };

        for module in modules {
            let spec = &module.spec;
            if spec.uses_in_cluster_build() {
                snapshot.in_cluster_builds += 1;
            }
            if spec.uses_in_cluster_sign() {
                snapshot.in_cluster_signs += 1;
            }
            if spec.device_plugin.is_some() {
                snapshot.device_plugins += 1;
            }

            let modprobe = &spec.module_loader.container.modprobe;
            let entry = |args: &ModprobeArgs| ModuleArgs {
                name: module.metadata.name.clone().unwrap_or_default(),
                namespace: module.metadata.namespace.clone().unwrap_or_default(),
                args: args.load.join(","),
            };
            if let Some(args) = modprobe.args.as_ref() {
                snapshot.modprobe_args.push(entry(args));
            }
            if let Some(raw) = modprobe.raw_args.as_ref() {
                snapshot.modprobe_raw_args.push(entry(raw));
            }
        }

        snapshot
    }
}

/// Destination of the aggregate module metrics
#[cfg_attr(test, automock)]
pub trait MetricsSink: Send + Sync {
    /// Publish `snapshot`
    fn publish(&self, snapshot: &MetricsSnapshot);
}

/// Publishes to the global OpenTelemetry meter
#[derive(Clone, Debug, Default)]
pub struct OtelMetrics;

impl MetricsSink for OtelMetrics {
    fn publish(&self, snapshot: &MetricsSnapshot) {
        MODULES.record(snapshot.modules, &[]);
        IN_CLUSTER_BUILDS.record(snapshot.in_cluster_builds, &[]);
        IN_CLUSTER_SIGNS.record(snapshot.in_cluster_signs, &[]);
        DEVICE_PLUGINS.record(snapshot.device_plugins, &[]);

        for (gauge, entries) in [
            (&*MODPROBE_ARGS, &snapshot.modprobe_args),
            (&*MODPROBE_RAW_ARGS, &snapshot.modprobe_raw_args),
        ] {
            for entry in entries {
                gauge.record(
                    1,
                    &[
                        KeyValue::new("name", entry.name.clone()),
                        KeyValue::new("namespace", entry.namespace.clone()),
                        KeyValue::new("args", entry.args.clone()),
                    ],
                );
            }
        }
    }
}
