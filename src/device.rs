//! Physical device selection, queue resolution and logical device
//! creation.

use std::borrow::Cow;
use std::ffi::{CStr, CString};
use std::fmt;
use std::os::raw::c_char;

use ash::extensions::khr;
use ash::vk;
use thiserror::Error;
use tracing::{debug, info};

use crate::capability;
use crate::instance::Context;
use crate::surface::Surface;
use crate::SetupSmallVec;

/// Facts about one queue family, derived against a specific surface.
#[derive(Debug, Copy, Clone)]
pub struct QueueFamilyInfo {
    /// Index of the family on its device.
    pub index: u32,
    /// Operations the family's queues support.
    pub flags: vk::QueueFlags,
    /// Whether the family can present to the surface the candidate was
    /// derived against.
    pub supports_present: bool,
}

impl QueueFamilyInfo {
    #[inline]
    fn graphics(&self) -> bool {
        self.flags.contains(vk::QueueFlags::GRAPHICS)
    }
}

/// A physical device plus the derived facts the selection predicates run
/// against.
///
/// Facts are recomputed on every selection pass and are only valid for the
/// surface they were derived against; never reuse a candidate across
/// window or surface changes.
#[derive(Clone)]
pub struct DeviceCandidate {
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    queue_families: Vec<QueueFamilyInfo>,
    extensions: Vec<CString>,
}

impl DeviceCandidate {
    /// Assembles a candidate from already-derived facts.
    pub fn new(
        physical_device: vk::PhysicalDevice,
        properties: vk::PhysicalDeviceProperties,
        queue_families: Vec<QueueFamilyInfo>,
        extensions: Vec<CString>,
    ) -> Self {
        DeviceCandidate {
            physical_device,
            properties,
            queue_families,
            extensions,
        }
    }

    /// Queries the driver for `physical_device`'s facts against `surface`.
    ///
    /// # Safety
    ///
    /// `physical_device` must belong to `context`'s instance and `surface`
    /// must have been created from it.
    pub unsafe fn derive(
        context: &Context,
        surface: &Surface,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self, vk::Result> {
        let properties = context
            .instance()
            .get_physical_device_properties(physical_device);

        let family_properties = context
            .instance()
            .get_physical_device_queue_family_properties(physical_device);
        let mut queue_families = Vec::with_capacity(family_properties.len());
        for (index, family) in family_properties.iter().enumerate() {
            let index = index as u32;
            queue_families.push(QueueFamilyInfo {
                index,
                flags: family.queue_flags,
                supports_present: surface.supports_family(physical_device, index)?,
            });
        }

        let extensions = context
            .instance()
            .enumerate_device_extension_properties(physical_device)?
            .iter()
            .map(|properties| capability::name_from_raw(&properties.extension_name))
            .collect();

        Ok(DeviceCandidate {
            physical_device,
            properties,
            queue_families,
            extensions,
        })
    }

    /// The raw physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Device name as reported by the driver.
    #[inline]
    pub fn device_name(&self) -> Cow<str> {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()).to_string_lossy() }
    }

    /// Reported API version.
    #[inline]
    pub fn api_version(&self) -> u32 {
        self.properties.api_version
    }

    /// The queue family facts.
    #[inline]
    pub fn queue_families(&self) -> &[QueueFamilyInfo] {
        &self.queue_families
    }

    /// Supported device extension names.
    #[inline]
    pub fn extensions(&self) -> &[CString] {
        &self.extensions
    }

    /// Index of the first graphics-capable queue family.
    #[inline]
    pub fn graphics_family(&self) -> Option<u32> {
        self.queue_families
            .iter()
            .find(|family| family.graphics())
            .map(|family| family.index)
    }

    /// Index of the first family able to present to the derivation
    /// surface. Recorded opportunistically; [`resolve_queues`] is the
    /// authority on the final assignment.
    #[inline]
    pub fn present_family(&self) -> Option<u32> {
        self.queue_families
            .iter()
            .find(|family| family.supports_present)
            .map(|family| family.index)
    }

    /// Whether every requirement holds for this candidate.
    pub fn satisfies(&self, requirements: &DeviceRequirements) -> bool {
        self.api_version() >= requirements.api_version
            && self.graphics_family().is_some()
            && requirements
                .extensions
                .iter()
                .all(|required| self.extensions.contains(required))
    }
}

impl fmt::Debug for DeviceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceCandidate")
            .field("device_name", &self.device_name())
            .field(
                "api_version",
                &format_args!(
                    "{}.{}",
                    vk::api_version_major(self.api_version()),
                    vk::api_version_minor(self.api_version())
                ),
            )
            .field("queue_families", &self.queue_families)
            .field("extension_count", &self.extensions.len())
            .finish()
    }
}

/// Requirements a physical device must meet to be selected.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    /// Minimum device API version.
    pub api_version: u32,
    /// Device extensions that must be supported; they are also the set
    /// enabled on the logical device.
    pub extensions: Vec<CString>,
}

impl Default for DeviceRequirements {
    /// API 1.3, swapchain and extended-dynamic-state extensions.
    fn default() -> Self {
        DeviceRequirements {
            api_version: vk::API_VERSION_1_3,
            extensions: vec![
                khr::Swapchain::name().to_owned(),
                vk::ExtExtendedDynamicStateFn::name().to_owned(),
            ],
        }
    }
}

/// Strategy deciding which candidate the selector commits to.
///
/// The default is [`FirstSuitable`]. A policy comparing device classes or
/// performance characteristics can be slotted in without touching the
/// surrounding pipeline.
pub trait SelectionPolicy {
    /// Returns the index of the winning candidate, or `None` when no
    /// candidate qualifies.
    fn select(
        &self,
        candidates: &[DeviceCandidate],
        requirements: &DeviceRequirements,
    ) -> Option<usize>;
}

/// Commits to the first candidate, in enumeration order, that satisfies
/// every requirement.
///
/// Deliberately order-dependent: it never compares discrete against
/// integrated GPUs, so multi-GPU systems may want a scoring
/// [`SelectionPolicy`] instead.
#[derive(Debug, Default, Copy, Clone)]
pub struct FirstSuitable;

impl SelectionPolicy for FirstSuitable {
    fn select(
        &self,
        candidates: &[DeviceCandidate],
        requirements: &DeviceRequirements,
    ) -> Option<usize> {
        candidates
            .iter()
            .position(|candidate| candidate.satisfies(requirements))
    }
}

/// Errors raised while selecting a physical device.
#[derive(Debug, Error)]
pub enum DeviceSelectionError {
    /// Enumeration reported no devices at all.
    #[error("no Vulkan-capable device found")]
    NoDeviceFound,
    /// Devices exist, but none satisfied every requirement.
    #[error("no device satisfied the selection requirements")]
    NoSuitableDevice,
    /// A driver query failed mid-pass.
    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

/// The candidate the selector committed to.
///
/// Satisfied every requirement at the moment of selection; exclusively
/// owned by the pipeline from then on.
#[derive(Debug)]
pub struct SelectedDevice {
    candidate: DeviceCandidate,
    graphics_family: u32,
    requirements: DeviceRequirements,
}

impl SelectedDevice {
    /// The committed candidate's facts.
    #[inline]
    pub fn candidate(&self) -> &DeviceCandidate {
        &self.candidate
    }

    /// The raw physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.candidate.physical_device()
    }

    /// First graphics-capable family, recorded during the predicate pass.
    #[inline]
    pub fn graphics_family(&self) -> u32 {
        self.graphics_family
    }

    /// The requirements the candidate satisfied.
    #[inline]
    pub fn requirements(&self) -> &DeviceRequirements {
        &self.requirements
    }
}

/// Enumerates physical devices, derives a candidate per device, and
/// commits to the one `policy` picks.
///
/// # Safety
///
/// `surface` must have been created from `context`.
pub unsafe fn select_device(
    context: &Context,
    surface: &Surface,
    requirements: DeviceRequirements,
    policy: &dyn SelectionPolicy,
) -> Result<SelectedDevice, DeviceSelectionError> {
    let physical_devices = context.instance().enumerate_physical_devices()?;
    if physical_devices.is_empty() {
        return Err(DeviceSelectionError::NoDeviceFound);
    }

    let mut candidates = Vec::with_capacity(physical_devices.len());
    for physical_device in physical_devices {
        candidates.push(DeviceCandidate::derive(context, surface, physical_device)?);
    }
    debug!("evaluating {} device candidate(s)", candidates.len());

    let winner = policy
        .select(&candidates, &requirements)
        .ok_or(DeviceSelectionError::NoSuitableDevice)?;
    let candidate = candidates.swap_remove(winner);
    let graphics_family = candidate
        .graphics_family()
        .ok_or(DeviceSelectionError::NoSuitableDevice)?;

    info!(
        "selected device {:?} (API {}.{})",
        candidate.device_name(),
        vk::api_version_major(candidate.api_version()),
        vk::api_version_minor(candidate.api_version()),
    );

    Ok(SelectedDevice {
        candidate,
        graphics_family,
        requirements,
    })
}

/// No queue family could be resolved for one of the two roles.
#[derive(Debug, Error)]
#[error("no queue family supports the required graphics/presentation roles")]
pub struct NoQueueFamily;

/// Resolved queue family indices for the two pipeline roles.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QueueAssignment {
    /// Family the graphics queue is taken from.
    pub graphics: u32,
    /// Family the presentation queue is taken from.
    pub present: u32,
}

impl QueueAssignment {
    /// Whether one family serves both roles.
    #[inline]
    pub fn shared(&self) -> bool {
        self.graphics == self.present
    }

    pub(crate) fn distinct_families(&self) -> SetupSmallVec<u32> {
        let mut families = SetupSmallVec::new();
        families.push(self.graphics);
        if self.present != self.graphics {
            families.push(self.present);
        }
        families
    }
}

/// Resolves which queue families serve the graphics and presentation
/// roles.
///
/// Graphics-capable and presentation-capable families are not guaranteed
/// to coincide, so the search runs in three tiers, first match wins:
///
/// 1. the first graphics-capable family, if it also presents;
/// 2. any single family supporting both;
/// 3. the tier-1 graphics family paired with any presentation-capable
///    family.
///
/// A shared family must win over a split assignment whenever one exists.
pub fn resolve_queues(families: &[QueueFamilyInfo]) -> Result<QueueAssignment, NoQueueFamily> {
    let graphics = families
        .iter()
        .find(|family| family.graphics())
        .ok_or(NoQueueFamily)?;
    if graphics.supports_present {
        return Ok(QueueAssignment {
            graphics: graphics.index,
            present: graphics.index,
        });
    }

    if let Some(both) = families
        .iter()
        .find(|family| family.graphics() && family.supports_present)
    {
        return Ok(QueueAssignment {
            graphics: both.index,
            present: both.index,
        });
    }

    let present = families
        .iter()
        .find(|family| family.supports_present)
        .ok_or(NoQueueFamily)?;

    Ok(QueueAssignment {
        graphics: graphics.index,
        present: present.index,
    })
}

/// Feature set requested on the logical device.
#[derive(Debug, Copy, Clone)]
pub struct DeviceFeatureSet {
    /// Base Vulkan 1.0 feature block.
    pub base: vk::PhysicalDeviceFeatures,
    /// Enable `dynamicRendering` (Vulkan 1.3).
    pub dynamic_rendering: bool,
    /// Enable `extendedDynamicState` (VK_EXT_extended_dynamic_state).
    pub extended_dynamic_state: bool,
}

impl Default for DeviceFeatureSet {
    /// Empty base block, dynamic rendering and extended dynamic state on.
    fn default() -> Self {
        DeviceFeatureSet {
            base: vk::PhysicalDeviceFeatures::default(),
            dynamic_rendering: true,
            extended_dynamic_state: true,
        }
    }
}

/// Errors raised while creating the logical device.
#[derive(Debug, Error)]
pub enum DeviceCreationError {
    /// The selected device does not support `VK_KHR_swapchain`.
    #[error("selected device does not support VK_KHR_swapchain")]
    SwapchainUnsupported,
    /// The driver rejected device creation, e.g. a required extension
    /// turned out unsupported despite earlier enumeration. Fatal, never
    /// retried.
    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

/// The device handle plus one queue per pipeline role.
///
/// Destroys the device on drop. Drop it after everything created from it
/// and before the surface and context it descends from.
pub struct LogicalDevice {
    device: ash::Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    queues: QueueAssignment,
}

impl LogicalDevice {
    /// Creates the logical device for `selected`, with one queue request
    /// per **distinct** family in `queues` at a fixed priority.
    ///
    /// Swapchain support is verified up front, independent of the generic
    /// extension predicate in selection, and fails fast with
    /// [`DeviceCreationError::SwapchainUnsupported`].
    ///
    /// # Safety
    ///
    /// `selected` must have been derived from `context` and `queues` must
    /// hold valid family indices of `selected`.
    pub unsafe fn new(
        context: &Context,
        selected: &SelectedDevice,
        queues: QueueAssignment,
        features: &DeviceFeatureSet,
    ) -> Result<Self, DeviceCreationError> {
        let swapchain_name = khr::Swapchain::name().to_owned();
        if !selected.candidate().extensions().contains(&swapchain_name) {
            return Err(DeviceCreationError::SwapchainUnsupported);
        }

        let priorities = [1.0_f32];
        let queue_infos: SetupSmallVec<vk::DeviceQueueCreateInfo> = queues
            .distinct_families()
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extension_ptrs: SetupSmallVec<*const c_char> = selected
            .requirements()
            .extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let mut features2 = vk::PhysicalDeviceFeatures2::builder().features(features.base);
        let mut vulkan13 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(features.dynamic_rendering);
        let mut extended_dynamic_state = vk::PhysicalDeviceExtendedDynamicStateFeaturesEXT::builder()
            .extended_dynamic_state(features.extended_dynamic_state);

        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features2)
            .push_next(&mut vulkan13)
            .push_next(&mut extended_dynamic_state);

        let device =
            context
                .instance()
                .create_device(selected.physical_device(), &device_info, None)?;
        let graphics_queue = device.get_device_queue(queues.graphics, 0);
        let present_queue = device.get_device_queue(queues.present, 0);

        debug!(
            "logical device created (graphics family {}, presentation family {})",
            queues.graphics, queues.present,
        );

        Ok(LogicalDevice {
            device,
            graphics_queue,
            present_queue,
            queues,
        })
    }

    /// The device function table.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Queue serving the graphics role.
    #[inline]
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Queue serving the presentation role. Equal to
    /// [`LogicalDevice::graphics_queue`] when the assignment is shared.
    #[inline]
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// The family assignment the queues were taken from.
    #[inline]
    pub fn queues(&self) -> QueueAssignment {
        self.queues
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe { self.device.destroy_device(None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(index: u32, flags: vk::QueueFlags, supports_present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo {
            index,
            flags,
            supports_present,
        }
    }

    fn candidate(api_version: u32, families: &[QueueFamilyInfo], extensions: &[&str]) -> DeviceCandidate {
        let properties = vk::PhysicalDeviceProperties {
            api_version,
            ..Default::default()
        };
        DeviceCandidate::new(
            vk::PhysicalDevice::null(),
            properties,
            families.to_vec(),
            extensions
                .iter()
                .map(|name| CString::new(*name).unwrap())
                .collect(),
        )
    }

    fn graphics_candidate(api_version: u32, extensions: &[&str]) -> DeviceCandidate {
        candidate(
            api_version,
            &[family(0, vk::QueueFlags::GRAPHICS, true)],
            extensions,
        )
    }

    #[test]
    fn shared_family_resolves_to_itself() {
        let families = [family(0, vk::QueueFlags::GRAPHICS, true)];
        let assignment = resolve_queues(&families).unwrap();
        assert_eq!(assignment, QueueAssignment { graphics: 0, present: 0 });
        assert!(assignment.shared());
    }

    #[test]
    fn disjoint_families_resolve_split() {
        let families = [
            family(0, vk::QueueFlags::GRAPHICS, false),
            family(1, vk::QueueFlags::empty(), true),
        ];
        let assignment = resolve_queues(&families).unwrap();
        assert_eq!(assignment, QueueAssignment { graphics: 0, present: 1 });
        assert!(!assignment.shared());
    }

    #[test]
    fn later_combined_family_beats_split_assignment() {
        let families = [
            family(0, vk::QueueFlags::GRAPHICS, false),
            family(1, vk::QueueFlags::empty(), true),
            family(2, vk::QueueFlags::GRAPHICS, true),
        ];
        let assignment = resolve_queues(&families).unwrap();
        assert_eq!(assignment, QueueAssignment { graphics: 2, present: 2 });
    }

    #[test]
    fn no_presentation_family_fails() {
        let families = [family(0, vk::QueueFlags::GRAPHICS, false)];
        assert!(resolve_queues(&families).is_err());
    }

    #[test]
    fn no_graphics_family_fails() {
        let families = [family(0, vk::QueueFlags::TRANSFER, true)];
        assert!(resolve_queues(&families).is_err());
    }

    #[test]
    fn distinct_families_deduplicate() {
        let shared = QueueAssignment { graphics: 2, present: 2 };
        assert_eq!(shared.distinct_families().as_slice(), [2]);

        let split = QueueAssignment { graphics: 0, present: 3 };
        assert_eq!(split.distinct_families().as_slice(), [0, 3]);
    }

    #[test]
    fn first_suitable_commits_in_enumeration_order() {
        let requirements = DeviceRequirements {
            api_version: vk::API_VERSION_1_0,
            extensions: vec![],
        };
        let first = graphics_candidate(vk::API_VERSION_1_3, &[]);
        let second = graphics_candidate(vk::make_api_version(0, 1, 3, 200), &[]);

        // Both are suitable; enumeration order alone decides the winner.
        let candidates = [first, second];
        let winner = FirstSuitable.select(&candidates, &requirements).unwrap();
        assert_eq!(candidates[winner].api_version(), vk::API_VERSION_1_3);

        let mut reordered = candidates;
        reordered.reverse();
        let winner = FirstSuitable.select(&reordered, &requirements).unwrap();
        assert_eq!(
            reordered[winner].api_version(),
            vk::make_api_version(0, 1, 3, 200)
        );
    }

    #[test]
    fn unsuitable_candidates_are_skipped() {
        let requirements = DeviceRequirements {
            api_version: vk::API_VERSION_1_3,
            extensions: vec![],
        };
        let old = graphics_candidate(vk::API_VERSION_1_1, &[]);
        let suitable = graphics_candidate(vk::API_VERSION_1_3, &[]);

        assert_eq!(FirstSuitable.select(&[old, suitable], &requirements), Some(1));
    }

    #[test]
    fn api_version_gates_suitability() {
        let requirements = DeviceRequirements {
            api_version: vk::API_VERSION_1_3,
            extensions: vec![],
        };
        assert!(!graphics_candidate(vk::API_VERSION_1_2, &[]).satisfies(&requirements));
        assert!(graphics_candidate(vk::API_VERSION_1_3, &[]).satisfies(&requirements));
    }

    #[test]
    fn missing_extension_gates_suitability() {
        let requirements = DeviceRequirements {
            api_version: vk::API_VERSION_1_0,
            extensions: vec![CString::new("VK_KHR_swapchain").unwrap()],
        };
        assert!(!graphics_candidate(vk::API_VERSION_1_3, &[]).satisfies(&requirements));
        assert!(graphics_candidate(vk::API_VERSION_1_3, &["VK_KHR_swapchain"])
            .satisfies(&requirements));
    }

    #[test]
    fn graphics_family_gates_suitability() {
        let requirements = DeviceRequirements {
            api_version: vk::API_VERSION_1_0,
            extensions: vec![],
        };
        let presentation_only = candidate(
            vk::API_VERSION_1_3,
            &[family(0, vk::QueueFlags::COMPUTE, true)],
            &[],
        );
        assert!(!presentation_only.satisfies(&requirements));
    }

    #[test]
    fn no_candidate_qualifies() {
        let requirements = DeviceRequirements::default();
        assert_eq!(FirstSuitable.select(&[], &requirements), None);
    }
}
