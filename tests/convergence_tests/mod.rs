//! Convergence stories
//!
//! - `node_labels`: the exact merge-patch bodies sent to nodes and pods
//! - `kernel_mapping`: how node kernels resolve to loader configurations
//! - `workloads`: device-plugin lookup and stale workload detection
//! - `images`: intermediate image naming and image record generations

mod images;
mod kernel_mapping;
mod node_labels;
mod workloads;
