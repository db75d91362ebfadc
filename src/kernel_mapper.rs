//! Kernel version to loader configuration mapping
//!
//! A Module lists ordered kernel mapping rules. For a node's kernel version the
//! first matching rule wins and its overrides are merged onto the container
//! defaults, producing a [`ModuleLoaderData`] that drives build, sign and the
//! loader workload for that kernel.

use regex::Regex;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    Build, KernelMapping, LocalObjectReference, ModprobeSpec, Module, Selector, Sign, Tolerations,
};

/// Why a kernel version could not be mapped
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    /// No rule matched; callers skip the node rather than fail
    #[error("no kernel mapping matches kernel {kernel}")]
    NotMatched {
        /// Kernel version that was looked up
        kernel: String,
    },

    /// A rule has neither literal nor regexp, or the regexp does not compile
    #[error("invalid kernel mapping rule {index}: {reason}")]
    InvalidRule {
        /// Position of the rule in the module's list
        index: usize,
        /// What is wrong with it
        reason: String,
    },

    /// Neither the matching rule nor the container provides an image
    #[error("no container image for kernel {kernel}")]
    MissingImage {
        /// Kernel version that was looked up
        kernel: String,
    },
}

impl MappingError {
    /// Returns true for the distinguishable "no rule matched" outcome
    pub fn is_not_matched(&self) -> bool {
        matches!(self, Self::NotMatched { .. })
    }
}

/// Effective loader configuration for one (module, kernel version)
#[derive(Clone, Debug)]
pub struct ModuleLoaderData {
    /// Module name
    pub name: String,
    /// Module namespace
    pub namespace: String,
    /// Kernel version this configuration was resolved for
    pub kernel_version: String,
    /// Final loader image, templated for the kernel
    pub container_image: String,
    /// Effective build directive
    pub build: Option<Build>,
    /// Effective sign directive
    pub sign: Option<Sign>,
    /// modprobe configuration
    pub modprobe: ModprobeSpec,
    /// Module version, empty when unset
    pub version: String,
    /// Pull policy for the loader image
    pub image_pull_policy: Option<String>,
    /// Pull secret for all images of the module
    pub image_repo_secret: Option<LocalObjectReference>,
    /// Module node selector
    pub selector: Selector,
    /// Service account for loader pods
    pub service_account_name: Option<String>,
    /// Tolerations for loader pods
    pub tolerations: Tolerations,
    /// Owning Module
    pub owner: Module,
}

impl ModuleLoaderData {
    /// Returns true if an in-cluster build is configured
    pub fn has_build(&self) -> bool {
        self.build.is_some()
    }

    /// Returns true if in-cluster signing is configured
    pub fn has_sign(&self) -> bool {
        self.sign.is_some()
    }
}

/// Resolves a node kernel version against a module's mapping rules
#[cfg_attr(test, automock)]
pub trait KernelMapper: Send + Sync {
    /// Resolve the effective loader configuration for `kernel_version`
    fn resolve(
        &self,
        module: &Module,
        kernel_version: &str,
    ) -> Result<ModuleLoaderData, MappingError>;
}

/// Rule evaluation in declared order, first match wins
#[derive(Clone, Debug, Default)]
pub struct DefaultKernelMapper;

impl DefaultKernelMapper {
    /// Create a new mapper
    pub fn new() -> Self {
        Self
    }
}

impl KernelMapper for DefaultKernelMapper {
    fn resolve(
        &self,
        module: &Module,
        kernel_version: &str,
    ) -> Result<ModuleLoaderData, MappingError> {
        let container = &module.spec.module_loader.container;

        let mut rule = None;
        for (index, mapping) in container.kernel_mappings.iter().enumerate() {
            if rule_matches(index, mapping, kernel_version)? {
                rule = Some(mapping);
                break;
            }
        }
        let rule = rule.ok_or_else(|| MappingError::NotMatched {
            kernel: kernel_version.to_string(),
        })?;

        let image = rule
            .container_image
            .as_ref()
            .or(container.container_image.as_ref())
            .ok_or_else(|| MappingError::MissingImage {
                kernel: kernel_version.to_string(),
            })?;

        let mut sign = rule.sign.clone().or_else(|| container.sign.clone());
        if let Some(sign) = sign.as_mut() {
            sign.unsigned_image = sign
                .unsigned_image
                .as_deref()
                .map(|img| substitute_kernel_vars(img, kernel_version));
        }

        Ok(ModuleLoaderData {
            name: module.metadata.name.clone().unwrap_or_default(),
            namespace: module.metadata.namespace.clone().unwrap_or_default(),
            kernel_version: kernel_version.to_string(),
            container_image: substitute_kernel_vars(image, kernel_version),
            build: rule.build.clone().or_else(|| container.build.clone()),
            sign,
            modprobe: container.modprobe.clone(),
            version: module.spec.version().to_string(),
            image_pull_policy: container.image_pull_policy.clone(),
            image_repo_secret: module.spec.image_repo_secret.clone(),
            selector: module.spec.selector.clone(),
            service_account_name: module.spec.module_loader.service_account_name.clone(),
            tolerations: module.spec.tolerations.clone(),
            owner: module.clone(),
        })
    }
}

fn rule_matches(
    index: usize,
    mapping: &KernelMapping,
    kernel_version: &str,
) -> Result<bool, MappingError> {
    match (&mapping.literal, &mapping.regexp) {
        (Some(literal), _) => Ok(literal == kernel_version),
        (None, Some(pattern)) => {
            let anchored = format!("^(?:{pattern})$");
            let re = Regex::new(&anchored).map_err(|e| MappingError::InvalidRule {
                index,
                reason: e.to_string(),
            })?;
            Ok(re.is_match(kernel_version))
        }
        (None, None) => Err(MappingError::InvalidRule {
            index,
            reason: "neither literal nor regexp is set".to_string(),
        }),
    }
}

/// Replace `${KERNEL_*}` placeholders in an image reference
///
/// `${KERNEL_XYZ}`, `${KERNEL_X}`, `${KERNEL_Y}` and `${KERNEL_Z}` are only
/// substituted when the kernel starts with a dotted `x.y.z` triple.
pub fn substitute_kernel_vars(image: &str, kernel_version: &str) -> String {
    let mut out = image.replace("${KERNEL_FULL_VERSION}", kernel_version);

    if let Some((x, y, z)) = kernel_xyz(kernel_version) {
        out = out
            .replace("${KERNEL_XYZ}", &format!("{x}.{y}.{z}"))
            .replace("${KERNEL_X}", x)
            .replace("${KERNEL_Y}", y)
            .replace("${KERNEL_Z}", z);
    }

    out
}

/// Leading numeric `x.y.z` of a kernel version
fn kernel_xyz(kernel_version: &str) -> Option<(&str, &str, &str)> {
    let mut parts = kernel_version.splitn(3, '.');
    let x = parts.next()?;
    let y = parts.next()?;
    let rest = parts.next()?;
    let z_len = rest.bytes().take_while(u8::is_ascii_digit).count();
    let z = &rest[..z_len];

    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    (numeric(x) && numeric(y) && numeric(z)).then_some((x, y, z))
}
