//! The composite initialization entry point and its teardown.

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use thiserror::Error;
use tracing::info;

use crate::device::{
    self, DeviceCreationError, DeviceFeatureSet, DeviceRequirements, DeviceSelectionError,
    FirstSuitable, LogicalDevice, NoQueueFamily, QueueAssignment, SelectedDevice, SelectionPolicy,
};
use crate::instance::{Context, ContextBuilder, ContextCreationError, DiagnosticsChannel};
use crate::surface::{Surface, SurfaceCreationError};
use crate::swapchain::{Swapchain, SwapchainCreationError};

/// Any failure along the initialization sequence.
///
/// Every variant is terminal: nothing is retried, there is no degraded
/// mode, and whatever was already constructed is torn down in reverse
/// order while the error propagates.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Context bootstrap failed.
    #[error(transparent)]
    Context(#[from] ContextCreationError),
    /// Surface binding failed.
    #[error(transparent)]
    Surface(#[from] SurfaceCreationError),
    /// Device selection failed.
    #[error(transparent)]
    Selection(#[from] DeviceSelectionError),
    /// Queue resolution failed.
    #[error(transparent)]
    Queues(#[from] NoQueueFamily),
    /// Logical device creation failed.
    #[error(transparent)]
    Device(#[from] DeviceCreationError),
    /// Swapchain creation failed.
    #[error(transparent)]
    Swapchain(#[from] SwapchainCreationError),
}

/// Everything the negotiation pipeline produced.
///
/// Dropping the context tears everything down in exact reverse creation
/// order: swapchain, logical device, surface, diagnostics channel,
/// instance.
pub struct GraphicsContext {
    // Field order is teardown order; fields drop in declaration order.
    swapchain: Swapchain,
    device: LogicalDevice,
    surface: Surface,
    selected: SelectedDevice,
    diagnostics: DiagnosticsChannel,
    context: Context,
}

impl GraphicsContext {
    /// Starts configuring a new graphics context.
    pub fn builder() -> GraphicsContextBuilder {
        GraphicsContextBuilder::default()
    }

    /// The driver connection.
    #[inline]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The diagnostics channel handle (possibly empty).
    #[inline]
    pub fn diagnostics(&self) -> &DiagnosticsChannel {
        &self.diagnostics
    }

    /// The bound window surface.
    #[inline]
    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    /// The physical device the pipeline committed to.
    #[inline]
    pub fn selected_device(&self) -> &SelectedDevice {
        &self.selected
    }

    /// The logical device and its queues.
    #[inline]
    pub fn device(&self) -> &LogicalDevice {
        &self.device
    }

    /// The resolved queue family assignment.
    #[inline]
    pub fn queue_assignment(&self) -> QueueAssignment {
        self.device.queues()
    }

    /// The negotiated swapchain.
    #[inline]
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }
}

/// Configures and runs the full initialization sequence.
pub struct GraphicsContextBuilder {
    context: ContextBuilder,
    requirements: DeviceRequirements,
    features: DeviceFeatureSet,
    policy: Box<dyn SelectionPolicy>,
}

impl Default for GraphicsContextBuilder {
    fn default() -> Self {
        GraphicsContextBuilder {
            context: ContextBuilder::new(),
            requirements: DeviceRequirements::default(),
            features: DeviceFeatureSet::default(),
            policy: Box::new(FirstSuitable),
        }
    }
}

impl GraphicsContextBuilder {
    /// Options for the context bootstrap stage.
    pub fn context(mut self, context: ContextBuilder) -> Self {
        self.context = context;
        self
    }

    /// Requirements a physical device must meet to be selected.
    pub fn device_requirements(mut self, requirements: DeviceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Feature set requested on the logical device.
    pub fn device_features(mut self, features: DeviceFeatureSet) -> Self {
        self.features = features;
        self
    }

    /// Replaces the default first-suitable selection policy.
    pub fn selection_policy(mut self, policy: Box<dyn SelectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Runs the whole sequence against `window`: context, diagnostics,
    /// surface, device selection, queue resolution, logical device,
    /// swapchain.
    ///
    /// `window_extent` is the window's current framebuffer size in pixels,
    /// consulted only when the surface does not report a fixed extent.
    ///
    /// # Safety
    ///
    /// `window`'s display and window handles must remain valid until the
    /// returned context is dropped.
    pub unsafe fn initialize(
        self,
        window: &(impl HasRawWindowHandle + HasRawDisplayHandle),
        window_extent: vk::Extent2D,
    ) -> Result<GraphicsContext, SetupError> {
        let (context, diagnostics) = self.context.build(window)?;
        let surface = Surface::new(&context, window)?;
        let selected =
            device::select_device(&context, &surface, self.requirements, self.policy.as_ref())?;
        let queues = device::resolve_queues(selected.candidate().queue_families())?;
        let logical = LogicalDevice::new(&context, &selected, queues, &self.features)?;
        let swapchain =
            Swapchain::new(&context, &surface, &selected, &logical, queues, window_extent)?;

        info!("graphics context initialized");

        Ok(GraphicsContext {
            swapchain,
            device: logical,
            surface,
            selected,
            diagnostics,
            context,
        })
    }
}
