//! Extension and layer availability checks.
//!
//! Pure queries over driver-reported name sets; nothing here talks to the
//! driver itself.

use std::ffi::{CStr, CString};
use std::fmt;
use std::os::raw::c_char;

use thiserror::Error;
use tracing::debug;

/// The name domain a capability check runs against.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CapabilityDomain {
    /// Instance-level extensions.
    InstanceExtension,
    /// Instance layers.
    Layer,
}

impl fmt::Display for CapabilityDomain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CapabilityDomain::InstanceExtension => f.write_str("instance extension"),
            CapabilityDomain::Layer => f.write_str("layer"),
        }
    }
}

/// Errors raised by capability validation.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// A required name is missing from the driver-reported set.
    #[error("required {domain} {name:?} is not supported")]
    Unsupported {
        /// Domain the missing name belongs to.
        domain: CapabilityDomain,
        /// The first required name (in request order) not reported as
        /// available.
        name: CString,
    },
}

/// The names instance creation will require.
///
/// Computed once from static configuration plus the window system's
/// reported requirements, then treated as immutable.
#[derive(Debug, Default, Clone)]
pub struct RequiredCapabilities {
    /// Required instance extension names.
    pub extensions: Vec<CString>,
    /// Required layer names.
    pub layers: Vec<CString>,
}

impl RequiredCapabilities {
    /// Adds an extension name, ignoring duplicates.
    pub fn require_extension(&mut self, name: CString) {
        if !self.extensions.contains(&name) {
            self.extensions.push(name);
        }
    }

    /// Adds a layer name, ignoring duplicates.
    pub fn require_layer(&mut self, name: CString) {
        if !self.layers.contains(&name) {
            self.layers.push(name);
        }
    }
}

/// Checks that every name in `required` appears in `available`.
///
/// Comparison is an exact, case-sensitive string match, and the check
/// fails on the first missing name in request order. Both sets are logged
/// at debug level; the listing is observability only and does not affect
/// the result.
pub fn ensure_all_present(
    domain: CapabilityDomain,
    required: &[CString],
    available: &[CString],
) -> Result<(), CapabilityError> {
    debug!("supported {domain}s: {available:?}");
    debug!("required {domain}s: {required:?}");

    match required.iter().find(|name| !available.contains(name)) {
        Some(missing) => Err(CapabilityError::Unsupported {
            domain,
            name: missing.clone(),
        }),
        None => Ok(()),
    }
}

/// Copies a driver-reported, NUL-terminated name array into an owned
/// string.
pub(crate) fn name_from_raw(raw: &[c_char]) -> CString {
    unsafe { CStr::from_ptr(raw.as_ptr()).to_owned() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<CString> {
        list.iter().map(|n| CString::new(*n).unwrap()).collect()
    }

    #[test]
    fn subset_passes() {
        let required = names(&["VK_KHR_surface", "VK_KHR_xlib_surface"]);
        let available = names(&["VK_KHR_xlib_surface", "VK_KHR_surface", "VK_EXT_debug_utils"]);
        assert!(ensure_all_present(CapabilityDomain::InstanceExtension, &required, &available).is_ok());
    }

    #[test]
    fn empty_required_always_passes() {
        assert!(ensure_all_present(CapabilityDomain::Layer, &[], &[]).is_ok());
    }

    #[test]
    fn first_missing_name_is_reported() {
        let required = names(&["VK_KHR_surface", "VK_KHR_wayland_surface", "VK_KHR_xcb_surface"]);
        let available = names(&["VK_KHR_surface"]);

        let err = ensure_all_present(CapabilityDomain::InstanceExtension, &required, &available)
            .unwrap_err();
        match err {
            CapabilityError::Unsupported { domain, name } => {
                assert_eq!(domain, CapabilityDomain::InstanceExtension);
                assert_eq!(name, CString::new("VK_KHR_wayland_surface").unwrap());
            }
        }
    }

    #[test]
    fn comparison_is_case_sensitive() {
        let required = names(&["VK_LAYER_KHRONOS_validation"]);
        let available = names(&["vk_layer_khronos_validation"]);
        assert!(ensure_all_present(CapabilityDomain::Layer, &required, &available).is_err());
    }

    #[test]
    fn require_deduplicates() {
        let mut capabilities = RequiredCapabilities::default();
        capabilities.require_extension(CString::new("VK_KHR_surface").unwrap());
        capabilities.require_extension(CString::new("VK_KHR_surface").unwrap());
        capabilities.require_layer(CString::new("VK_LAYER_KHRONOS_validation").unwrap());
        assert_eq!(capabilities.extensions.len(), 1);
        assert_eq!(capabilities.layers.len(), 1);
    }
}
