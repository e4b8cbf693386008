#![warn(missing_docs)]
/*!
Vulkan presentation bootstrap for [`ash`], in the spirit of [`vk-bootstrap`]:
the negotiation between "I have a window" and "I have a swapchain".

- ✅ Instance creation with extension/layer validation
- ✅ Debug messenger routed into [`tracing`]
- ✅ Surface binding via [`ash-window`]
- ✅ Physical device selection (pluggable policy, first-suitable default)
- ✅ Graphics/presentation queue resolution with fallback search
- ✅ Logical device creation and swapchain negotiation, images included

Rendering, frame synchronization and GPU resource management are left to
the caller; the pipeline stops once the swapchain and its images exist.

Every driver handle is owned by a wrapper that destroys it on drop, and
[`GraphicsContext`] composes the wrappers so that teardown happens in exact
reverse creation order.

## Example

```rust,ignore
let size = window.inner_size();
let graphics = unsafe {
    GraphicsContext::builder()
        .context(ContextBuilder::new().app_name("demo")?)
        .initialize(
            &window,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
        )?
};

for image in graphics.swapchain().images() {
    // record your way to a first frame
}
// dropping `graphics` destroys swapchain, device, surface and instance,
// in that order
```

The stages are also usable à la carte; see [`instance::ContextBuilder`],
[`surface::Surface`], [`device::select_device`], [`device::resolve_queues`],
[`device::LogicalDevice`] and [`swapchain::Swapchain`].

[`vk-bootstrap`]: https://github.com/charles-lunarg/vk-bootstrap
[`ash`]: https://crates.io/crates/ash
[`ash-window`]: https://crates.io/crates/ash-window
[`tracing`]: https://crates.io/crates/tracing
*/

pub mod capability;
pub mod context;
pub mod device;
pub mod instance;
pub mod surface;
pub mod swapchain;

pub use capability::{CapabilityDomain, CapabilityError, RequiredCapabilities};
pub use context::{GraphicsContext, GraphicsContextBuilder, SetupError};
pub use device::{
    resolve_queues, select_device, DeviceCandidate, DeviceCreationError, DeviceFeatureSet,
    DeviceRequirements, DeviceSelectionError, FirstSuitable, LogicalDevice, NoQueueFamily,
    QueueAssignment, QueueFamilyInfo, SelectedDevice, SelectionPolicy,
};
pub use instance::{
    Context, ContextBuilder, ContextCreationError, DiagnosticsChannel, DiagnosticsSink,
    ValidationLayers,
};
pub use surface::{Surface, SurfaceCreationError};
pub use swapchain::{Swapchain, SwapchainConfig, SwapchainCreationError};

type SetupSmallVec<T> = smallvec::SmallVec<[T; 8]>;
