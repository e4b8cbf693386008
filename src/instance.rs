//! Instance creation and the driver diagnostics channel.

use std::borrow::Cow;
use std::ffi::{c_void, CStr, CString, NulError};
use std::fmt;
use std::os::raw::c_char;

use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry, LoadingError};
use cstr::cstr;
use raw_window_handle::HasRawDisplayHandle;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::capability::{self, CapabilityDomain, CapabilityError, RequiredCapabilities};
use crate::SetupSmallVec;

const VALIDATION_LAYER: &CStr = cstr!("VK_LAYER_KHRONOS_validation");

/// Whether to enable the Khronos validation layer.
#[derive(Debug, Copy, Clone)]
pub enum ValidationLayers {
    /// Always enable; context creation fails if the layer is missing.
    Require,
    /// Enable in debug builds only. This is the default.
    DebugOnly,
    /// Never enable.
    Disable,
}

impl ValidationLayers {
    pub(crate) fn enabled(self) -> bool {
        match self {
            ValidationLayers::Require => true,
            ValidationLayers::DebugOnly => cfg!(debug_assertions),
            ValidationLayers::Disable => false,
        }
    }
}

impl Default for ValidationLayers {
    fn default() -> Self {
        ValidationLayers::DebugOnly
    }
}

/// Where driver diagnostic messages are delivered.
#[derive(Copy, Clone)]
pub enum DiagnosticsSink {
    /// Route messages into [`tracing`] with severity-matched levels.
    Tracing,
    /// A user-provided messenger callback.
    Custom {
        /// The callback the driver will invoke.
        callback: vk::PFN_vkDebugUtilsMessengerCallbackEXT,
        /// User data pointer handed back to the callback.
        user_data: *mut c_void,
    },
    /// No diagnostics channel; the returned [`DiagnosticsChannel`] is
    /// empty.
    Disabled,
}

impl DiagnosticsSink {
    pub(crate) fn requested(&self) -> bool {
        !matches!(self, DiagnosticsSink::Disabled)
    }
}

impl Default for DiagnosticsSink {
    /// [`DiagnosticsSink::Tracing`] in debug builds, disabled in release
    /// builds.
    fn default() -> Self {
        if cfg!(debug_assertions) {
            DiagnosticsSink::Tracing
        } else {
            DiagnosticsSink::Disabled
        }
    }
}

/// The callback behind [`DiagnosticsSink::Tracing`].
///
/// The driver may invoke this from any thread, concurrently with the
/// thread that drove initialization; treat it as an independent actor
/// feeding a one-way notification channel. It performs no blocking work,
/// never unwinds, and always returns `vk::FALSE` ("do not abort the call
/// that triggered the message").
pub unsafe extern "system" fn tracing_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() {
        Cow::Borrowed("(no message)")
    } else {
        CStr::from_ptr((*callback_data).p_message).to_string_lossy()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[{message_type:?}] {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[{message_type:?}] {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!("[{message_type:?}] {message}");
    } else {
        trace!("[{message_type:?}] {message}");
    }

    vk::FALSE
}

/// Handle to an attached diagnostics messenger.
///
/// Empty when diagnostics are disabled. Must be dropped before the
/// [`Context`] it was attached to; [`crate::GraphicsContext`] takes care
/// of that ordering. Messages emitted before the channel was attached are
/// lost, which is acceptable: the channel is advisory and never affects
/// control flow.
pub struct DiagnosticsChannel {
    inner: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl DiagnosticsChannel {
    /// An empty channel with no messenger registered.
    pub fn disabled() -> Self {
        DiagnosticsChannel { inner: None }
    }

    /// Whether a messenger is attached.
    pub fn is_attached(&self) -> bool {
        self.inner.is_some()
    }
}

impl fmt::Debug for DiagnosticsChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DiagnosticsChannel")
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl Drop for DiagnosticsChannel {
    fn drop(&mut self) {
        if let Some((loader, messenger)) = self.inner.take() {
            unsafe { loader.destroy_debug_utils_messenger(messenger, None) };
        }
    }
}

/// The top-level connection between the application and the driver.
///
/// Owns the loaded entry points and the instance; the instance is
/// destroyed when the context drops. Create exactly one per process and
/// drop it after every object derived from it.
pub struct Context {
    entry: Entry,
    instance: ash::Instance,
    api_version: u32,
    enabled_layers: SetupSmallVec<CString>,
    enabled_extensions: SetupSmallVec<CString>,
}

impl Context {
    /// The loaded entry points.
    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// The instance function table.
    #[inline]
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// The API version the instance targets.
    #[inline]
    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// Major part of [`Context::api_version`].
    #[inline]
    pub fn api_version_major(&self) -> u32 {
        vk::api_version_major(self.api_version)
    }

    /// Minor part of [`Context::api_version`].
    #[inline]
    pub fn api_version_minor(&self) -> u32 {
        vk::api_version_minor(self.api_version)
    }

    /// Layers enabled on the instance.
    #[inline]
    pub fn enabled_layers(&self) -> &[CString] {
        &self.enabled_layers
    }

    /// Extensions enabled on the instance.
    #[inline]
    pub fn enabled_extensions(&self) -> &[CString] {
        &self.enabled_extensions
    }

    /// Returns true if `extension` was enabled on the instance.
    #[inline]
    pub fn is_extension_enabled(&self, extension: &CStr) -> bool {
        self.enabled_extensions.iter().any(|e| e.as_c_str() == extension)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field(
                "api_version",
                &format_args!("{}.{}", self.api_version_major(), self.api_version_minor()),
            )
            .field("enabled_layers", &self.enabled_layers)
            .field("enabled_extensions", &self.enabled_extensions)
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe { self.instance.destroy_instance(None) };
    }
}

/// Errors that can occur during context creation.
#[derive(Debug, Error)]
pub enum ContextCreationError {
    /// A required extension or layer is not supported.
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    /// The driver rejected the creation call despite prior validation.
    /// Fatal, never retried.
    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
    /// libvulkan could not be loaded.
    #[error("loader error: {0}")]
    Loading(#[from] LoadingError),
}

/// Builds a [`Context`] and its [`DiagnosticsChannel`].
pub struct ContextBuilder {
    app_name: CString,
    app_version: u32,
    engine_name: CString,
    engine_version: u32,
    api_version: u32,
    validation: ValidationLayers,
    diagnostics: DiagnosticsSink,
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    extra_extensions: SetupSmallVec<CString>,
    extra_layers: SetupSmallVec<CString>,
}

impl ContextBuilder {
    /// Creates a builder with opinionated defaults: API 1.3, validation
    /// and diagnostics in debug builds only, verbose-through-error
    /// severity and all message categories.
    pub fn new() -> Self {
        ContextBuilder {
            app_name: cstr!("swapstrap app").to_owned(),
            app_version: vk::make_api_version(0, 1, 0, 0),
            engine_name: cstr!("swapstrap").to_owned(),
            engine_version: vk::make_api_version(0, 1, 0, 0),
            api_version: vk::API_VERSION_1_3,
            validation: ValidationLayers::default(),
            diagnostics: DiagnosticsSink::default(),
            message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            message_types: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            extra_extensions: SetupSmallVec::new(),
            extra_layers: SetupSmallVec::new(),
        }
    }

    /// Application name to advertise.
    pub fn app_name(mut self, app_name: &str) -> Result<Self, NulError> {
        self.app_name = CString::new(app_name)?;
        Ok(self)
    }

    /// Application version to advertise.
    #[inline]
    pub fn app_version(mut self, major: u32, minor: u32) -> Self {
        self.app_version = vk::make_api_version(0, major, minor, 0);
        self
    }

    /// Engine name to advertise.
    pub fn engine_name(mut self, engine_name: &str) -> Result<Self, NulError> {
        self.engine_name = CString::new(engine_name)?;
        Ok(self)
    }

    /// Engine version to advertise.
    #[inline]
    pub fn engine_version(mut self, major: u32, minor: u32) -> Self {
        self.engine_version = vk::make_api_version(0, major, minor, 0);
        self
    }

    /// Target API version.
    #[inline]
    pub fn api_version(mut self, major: u32, minor: u32) -> Self {
        self.api_version = vk::make_api_version(0, major, minor, 0);
        self
    }

    /// Validation layer policy.
    #[inline]
    pub fn validation_layers(mut self, validation: ValidationLayers) -> Self {
        self.validation = validation;
        self
    }

    /// Diagnostics sink; [`DiagnosticsSink::Disabled`] skips the
    /// messenger entirely.
    #[inline]
    pub fn diagnostics(mut self, sink: DiagnosticsSink) -> Self {
        self.diagnostics = sink;
        self
    }

    /// Severity filter for diagnostic messages.
    #[inline]
    pub fn message_severity(mut self, severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        self.message_severity = severity;
        self
    }

    /// Category filter for diagnostic messages.
    #[inline]
    pub fn message_types(mut self, types: vk::DebugUtilsMessageTypeFlagsEXT) -> Self {
        self.message_types = types;
        self
    }

    /// Requires an additional instance extension.
    #[inline]
    pub fn require_extension(mut self, extension: &CStr) -> Self {
        self.extra_extensions.push(extension.to_owned());
        self
    }

    /// Requires an additional layer.
    #[inline]
    pub fn require_layer(mut self, layer: &CStr) -> Self {
        self.extra_layers.push(layer.to_owned());
        self
    }

    /// The full set of names instance creation will require for `window`'s
    /// windowing system: the platform-mandatory surface extensions, the
    /// debug-utils extension when diagnostics are on, the validation layer
    /// when enabled, and any extra names from the builder.
    pub fn required_capabilities(
        &self,
        window: &impl HasRawDisplayHandle,
    ) -> Result<RequiredCapabilities, ContextCreationError> {
        let platform_extensions =
            ash_window::enumerate_required_extensions(window.raw_display_handle())?;

        let mut required = RequiredCapabilities::default();
        for &name in platform_extensions {
            required.require_extension(unsafe { CStr::from_ptr(name) }.to_owned());
        }
        if self.diagnostics.requested() {
            required.require_extension(DebugUtils::name().to_owned());
        }
        for extension in &self.extra_extensions {
            required.require_extension(extension.clone());
        }

        if self.validation.enabled() {
            required.require_layer(VALIDATION_LAYER.to_owned());
        }
        for layer in &self.extra_layers {
            required.require_layer(layer.clone());
        }

        Ok(required)
    }

    fn messenger_info(&self) -> vk::DebugUtilsMessengerCreateInfoEXT {
        let info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(self.message_severity)
            .message_type(self.message_types);

        match self.diagnostics {
            DiagnosticsSink::Tracing => info.pfn_user_callback(Some(tracing_debug_callback)).build(),
            DiagnosticsSink::Custom {
                callback,
                user_data,
            } => info.pfn_user_callback(callback).user_data(user_data).build(),
            DiagnosticsSink::Disabled => info.build(),
        }
    }

    /// Validates the required capability sets and creates the instance,
    /// attaching the diagnostics messenger when one was requested.
    ///
    /// # Safety
    ///
    /// `window` must return a valid display handle for the duration of the
    /// call.
    pub unsafe fn build(
        self,
        window: &impl HasRawDisplayHandle,
    ) -> Result<(Context, DiagnosticsChannel), ContextCreationError> {
        let entry = Entry::load()?;
        self.build_with_entry(entry, window)
    }

    /// Like [`ContextBuilder::build`], with already-loaded entry points.
    ///
    /// # Safety
    ///
    /// See [`ContextBuilder::build`].
    pub unsafe fn build_with_entry(
        self,
        entry: Entry,
        window: &impl HasRawDisplayHandle,
    ) -> Result<(Context, DiagnosticsChannel), ContextCreationError> {
        let required = self.required_capabilities(window)?;

        let available_extensions: Vec<CString> = entry
            .enumerate_instance_extension_properties(None)?
            .iter()
            .map(|properties| capability::name_from_raw(&properties.extension_name))
            .collect();
        let available_layers: Vec<CString> = entry
            .enumerate_instance_layer_properties()?
            .iter()
            .map(|properties| capability::name_from_raw(&properties.layer_name))
            .collect();

        capability::ensure_all_present(
            CapabilityDomain::InstanceExtension,
            &required.extensions,
            &available_extensions,
        )?;
        capability::ensure_all_present(CapabilityDomain::Layer, &required.layers, &available_layers)?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&self.app_name)
            .application_version(self.app_version)
            .engine_name(&self.engine_name)
            .engine_version(self.engine_version)
            .api_version(self.api_version);

        let extension_ptrs: SetupSmallVec<*const c_char> =
            required.extensions.iter().map(|e| e.as_ptr()).collect();
        let layer_ptrs: SetupSmallVec<*const c_char> =
            required.layers.iter().map(|l| l.as_ptr()).collect();

        let mut instance_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        // Chaining the messenger info here also covers messages emitted
        // during instance creation and destruction, when no messenger
        // exists yet.
        let mut messenger_info = self.messenger_info();
        if self.diagnostics.requested() {
            instance_info = instance_info.push_next(&mut messenger_info);
        }

        let instance = entry.create_instance(&instance_info, None)?;

        let context = Context {
            entry,
            instance,
            api_version: self.api_version,
            enabled_layers: required.layers.into_iter().collect(),
            enabled_extensions: required.extensions.into_iter().collect(),
        };

        let diagnostics = if self.diagnostics.requested() {
            let loader = DebugUtils::new(context.entry(), context.instance());
            // On failure `context` drops and destroys the instance.
            let messenger = loader.create_debug_utils_messenger(&messenger_info, None)?;
            DiagnosticsChannel {
                inner: Some((loader, messenger)),
            }
        } else {
            DiagnosticsChannel::disabled()
        };

        info!(
            "context created (API {}.{}, {} layers, {} extensions)",
            context.api_version_major(),
            context.api_version_minor(),
            context.enabled_layers().len(),
            context.enabled_extensions().len(),
        );

        Ok((context, diagnostics))
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_policy_flags() {
        assert!(ValidationLayers::Require.enabled());
        assert!(!ValidationLayers::Disable.enabled());
        assert_eq!(ValidationLayers::DebugOnly.enabled(), cfg!(debug_assertions));
    }

    #[test]
    fn disabled_sink_attaches_nothing() {
        assert!(!DiagnosticsSink::Disabled.requested());
        assert!(!DiagnosticsChannel::disabled().is_attached());
    }

    #[test]
    fn tracing_sink_installs_callback() {
        let builder = ContextBuilder::new().diagnostics(DiagnosticsSink::Tracing);
        let info = builder.messenger_info();
        assert!(info.pfn_user_callback.is_some());
    }

    #[test]
    fn disabled_sink_installs_no_callback() {
        let builder = ContextBuilder::new().diagnostics(DiagnosticsSink::Disabled);
        let info = builder.messenger_info();
        assert!(info.pfn_user_callback.is_none());
    }
}
