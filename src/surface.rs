//! Native window surface binding.

use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use thiserror::Error;

use crate::instance::Context;

/// Errors raised when binding a window to a surface.
#[derive(Debug, Error)]
pub enum SurfaceCreationError {
    /// The window system refused the binding, e.g. because the window was
    /// already destroyed or the handle is invalid.
    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

/// A native window bound as a presentable drawing target.
///
/// Bind exactly one surface per window handle. If the window is recreated,
/// bind a fresh surface instead of reusing this one. Must be dropped
/// before the [`Context`] it was created from.
pub struct Surface {
    loader: khr::Surface,
    handle: vk::SurfaceKHR,
}

impl Surface {
    /// Binds `window` to a new surface.
    ///
    /// # Safety
    ///
    /// The window and display handles must stay valid for the surface's
    /// lifetime, and `context` must outlive the returned surface.
    pub unsafe fn new(
        context: &Context,
        window: &(impl HasRawWindowHandle + HasRawDisplayHandle),
    ) -> Result<Self, SurfaceCreationError> {
        let handle = ash_window::create_surface(
            context.entry(),
            context.instance(),
            window.raw_display_handle(),
            window.raw_window_handle(),
            None,
        )?;
        let loader = khr::Surface::new(context.entry(), context.instance());

        Ok(Surface { loader, handle })
    }

    /// The raw surface handle.
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Whether queue family `family` on `physical_device` can present to
    /// this surface.
    ///
    /// # Safety
    ///
    /// `physical_device` must belong to the instance this surface was
    /// created from, and `family` must be a valid family index on it.
    pub unsafe fn supports_family(
        &self,
        physical_device: vk::PhysicalDevice,
        family: u32,
    ) -> Result<bool, vk::Result> {
        self.loader
            .get_physical_device_surface_support(physical_device, family, self.handle)
    }

    /// The surface's capabilities on `physical_device`.
    ///
    /// # Safety
    ///
    /// `physical_device` must belong to the instance this surface was
    /// created from.
    pub unsafe fn capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR, vk::Result> {
        self.loader
            .get_physical_device_surface_capabilities(physical_device, self.handle)
    }

    /// The surface formats supported on `physical_device`.
    ///
    /// # Safety
    ///
    /// `physical_device` must belong to the instance this surface was
    /// created from.
    pub unsafe fn formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, vk::Result> {
        self.loader
            .get_physical_device_surface_formats(physical_device, self.handle)
    }

    /// The present modes supported on `physical_device`.
    ///
    /// # Safety
    ///
    /// `physical_device` must belong to the instance this surface was
    /// created from.
    pub unsafe fn present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::PresentModeKHR>, vk::Result> {
        self.loader
            .get_physical_device_surface_present_modes(physical_device, self.handle)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}
