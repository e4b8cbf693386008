//! Swapchain configuration and creation.

use ash::extensions::khr;
use ash::vk;
use thiserror::Error;
use tracing::info;

use crate::device::{LogicalDevice, QueueAssignment, SelectedDevice};
use crate::instance::Context;
use crate::surface::Surface;

/// Errors raised while configuring or creating the swapchain.
#[derive(Debug, Error)]
pub enum SwapchainCreationError {
    /// The driver reported no supported surface formats.
    #[error("driver reported no supported surface formats")]
    NoSurfaceFormats,
    /// The driver reported no supported present modes.
    #[error("driver reported no supported present modes")]
    NoPresentModes,
    /// The driver rejected swapchain creation. Fatal, never retried.
    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

/// The negotiated swapchain parameters. Immutable once computed.
#[derive(Debug, Copy, Clone)]
pub struct SwapchainConfig {
    /// Image format and color space.
    pub surface_format: vk::SurfaceFormatKHR,
    /// Presentation policy.
    pub present_mode: vk::PresentModeKHR,
    /// Image dimensions in pixels.
    pub extent: vk::Extent2D,
    /// Number of images requested from the driver.
    pub image_count: u32,
}

impl SwapchainConfig {
    /// Derives the concrete configuration from the driver-reported surface
    /// facts and the window's framebuffer size.
    ///
    /// Each parameter has a deterministic tie-break; see the chooser
    /// functions in this module. `formats` must not be empty.
    pub fn derive(
        capabilities: &vk::SurfaceCapabilitiesKHR,
        formats: &[vk::SurfaceFormatKHR],
        present_modes: &[vk::PresentModeKHR],
        window_extent: vk::Extent2D,
    ) -> Self {
        SwapchainConfig {
            surface_format: choose_surface_format(formats),
            present_mode: choose_present_mode(present_modes),
            extent: choose_extent(capabilities, window_extent),
            image_count: choose_image_count(capabilities),
        }
    }
}

// Prefer 8-bit BGRA with the nonlinear sRGB color space; otherwise the
// first reported format, arbitrary but deterministic.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or(formats[0])
}

// Prefer low-latency MAILBOX; FIFO is the only mode the specification
// guarantees to exist.
fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .copied()
        .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

// A reported current extent is authoritative. The u32::MAX sentinel means
// the size is up to the swapchain: take the window's framebuffer size,
// clamped componentwise into the driver's bounds.
fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

// Target triple buffering, never below the driver's minimum; a zero
// max_image_count means unbounded.
fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count.max(3);
    if capabilities.max_image_count > 0 {
        count = count.min(capabilities.max_image_count);
    }
    count
}

/// An ordered, fixed-size set of presentable images bound to a surface.
///
/// Destroys the swapchain on drop, taking its images with it; the images
/// are never destroyed individually. Drop before the [`LogicalDevice`] it
/// was created from.
pub struct Swapchain {
    loader: khr::Swapchain,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    config: SwapchainConfig,
}

impl Swapchain {
    /// Queries surface support, derives a [`SwapchainConfig`], creates the
    /// swapchain and retrieves its images.
    ///
    /// Image sharing is exclusive when `queues` is shared, concurrent
    /// across exactly the two distinct families otherwise.
    ///
    /// # Safety
    ///
    /// `surface`, `selected` and `device` must all descend from `context`,
    /// and `queues` must be the assignment `device` was created with.
    pub unsafe fn new(
        context: &Context,
        surface: &Surface,
        selected: &SelectedDevice,
        device: &LogicalDevice,
        queues: QueueAssignment,
        window_extent: vk::Extent2D,
    ) -> Result<Self, SwapchainCreationError> {
        let physical_device = selected.physical_device();

        let capabilities = surface.capabilities(physical_device)?;
        let formats = surface.formats(physical_device)?;
        if formats.is_empty() {
            return Err(SwapchainCreationError::NoSurfaceFormats);
        }
        let present_modes = surface.present_modes(physical_device)?;
        if present_modes.is_empty() {
            return Err(SwapchainCreationError::NoPresentModes);
        }

        let config = SwapchainConfig::derive(&capabilities, &formats, &present_modes, window_extent);

        let family_indices = [queues.graphics, queues.present];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle())
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true);
        create_info = if queues.shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        };

        let loader = khr::Swapchain::new(context.instance(), device.handle());
        let handle = loader.create_swapchain(&create_info, None)?;
        let images = match loader.get_swapchain_images(handle) {
            Ok(images) => images,
            Err(err) => {
                loader.destroy_swapchain(handle, None);
                return Err(err.into());
            }
        };

        info!(
            "swapchain ready ({}x{}, {} images, {:?}, {:?})",
            config.extent.width,
            config.extent.height,
            images.len(),
            config.surface_format.format,
            config.present_mode,
        );

        Ok(Swapchain {
            loader,
            handle,
            images,
            config,
        })
    }

    /// The raw swapchain handle.
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    /// The presentable images, in driver order.
    #[inline]
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// The negotiated configuration.
    #[inline]
    pub fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    /// Format of the images in [`Swapchain::images`].
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.config.surface_format.format
    }

    /// Dimensions of the images in [`Swapchain::images`].
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_swapchain(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min_image_count: u32, max_image_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count,
            max_image_count,
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn image_count_targets_triple_buffering() {
        assert_eq!(choose_image_count(&caps(1, 8)), 3);
    }

    #[test]
    fn image_count_clamps_to_maximum() {
        assert_eq!(choose_image_count(&caps(6, 6)), 6);
    }

    #[test]
    fn image_count_with_unbounded_maximum() {
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
    }

    #[test]
    fn image_count_respects_large_minimum() {
        assert_eq!(choose_image_count(&caps(5, 0)), 5);
    }

    #[test]
    fn preferred_format_wins() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn format_falls_back_to_first_reported() {
        let formats = [
            format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::R16G16B16A16_SFLOAT);
    }

    #[test]
    fn mailbox_preferred_over_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn fifo_is_the_fallback() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn fixed_current_extent_is_authoritative() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(800, 600),
            min_image_extent: extent(1, 1),
            max_image_extent: extent(4096, 4096),
            ..Default::default()
        };
        let chosen = choose_extent(&capabilities, extent(1024, 768));
        assert_eq!(chosen.width, 800);
        assert_eq!(chosen.height, 600);
    }

    #[test]
    fn undefined_extent_uses_framebuffer_size() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(u32::MAX, u32::MAX),
            min_image_extent: extent(1, 1),
            max_image_extent: extent(2048, 2048),
            ..Default::default()
        };
        let chosen = choose_extent(&capabilities, extent(1024, 768));
        assert_eq!(chosen.width, 1024);
        assert_eq!(chosen.height, 768);
    }

    #[test]
    fn undefined_extent_clamps_into_bounds() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(u32::MAX, u32::MAX),
            min_image_extent: extent(640, 480),
            max_image_extent: extent(1920, 1080),
            ..Default::default()
        };
        let chosen = choose_extent(&capabilities, extent(4096, 100));
        assert_eq!(chosen.width, 1920);
        assert_eq!(chosen.height, 480);
    }

    #[test]
    fn derive_combines_all_rules() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: extent(800, 600),
            min_image_extent: extent(1, 1),
            max_image_extent: extent(4096, 4096),
            ..Default::default()
        };
        let formats = [format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let modes = [vk::PresentModeKHR::FIFO];

        let config = SwapchainConfig::derive(&capabilities, &formats, &modes, extent(1280, 720));
        assert_eq!(config.image_count, 3);
        assert_eq!(config.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(config.extent.width, 800);
        assert_eq!(config.surface_format.format, vk::Format::B8G8R8A8_SRGB);
    }
}
