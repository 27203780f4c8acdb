//! 无头 Vulkan 设备
//!
//! 创建实例、选择物理设备和队列族、创建启用时间线信号量特性的逻辑设备。
//! 不创建窗口表面，只服务于命令队列同步。
//!
//! # 初始化流程
//!
//! 1. 加载 Vulkan 入口
//! 2. 创建 Vulkan 1.2 实例
//! 3. 选择支持所需队列能力的物理设备（独立显卡优先）
//! 4. 创建逻辑设备（启用 `timelineSemaphore`）并取得队列

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info};

use crate::core::error::{GraphicsError, Result};
use crate::renderer::command::CommandListType;

/// 无头 Vulkan 设备
///
/// 由 `Arc` 共享给队列后端和每个录制上下文，最后一个持有者释放时销毁设备和实例。
pub struct VulkanDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    device_name: String,
}

impl VulkanDevice {
    /// 为指定工作类型创建设备
    pub fn new(kind: CommandListType) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GraphicsError::DeviceCreation(format!("failed to load Vulkan: {e}")))?;

        let app_name = CStr::from_bytes_with_nul(b"DistQueue\0")
            .map_err(|e| GraphicsError::DeviceCreation(e.to_string()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(app_name)
            .api_version(vk::API_VERSION_1_2);
        let instance_info = vk::InstanceCreateInfo::builder().application_info(&app_info);

        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(|e| GraphicsError::DeviceCreation(format!("vkCreateInstance: {e}")))?;

        match unsafe { Self::create_device(&instance, kind) } {
            Ok((device, queue, queue_family_index, device_name)) => {
                info!(device = %device_name, queue_family_index, %kind, "Vulkan device created");
                Ok(Self {
                    _entry: entry,
                    instance,
                    device,
                    queue,
                    queue_family_index,
                    device_name,
                })
            }
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    unsafe fn create_device(
        instance: &ash::Instance,
        kind: CommandListType,
    ) -> Result<(ash::Device, vk::Queue, u32, String)> {
        let required = required_queue_flags(kind);

        let physical_devices = instance
            .enumerate_physical_devices()
            .map_err(|e| GraphicsError::DeviceCreation(format!("vkEnumeratePhysicalDevices: {e}")))?;

        // 独立显卡 > 集成显卡 > 虚拟显卡 > CPU > 其他
        let (physical_device, queue_family_index) = physical_devices
            .into_iter()
            .filter_map(|pd| {
                instance
                    .get_physical_device_queue_family_properties(pd)
                    .iter()
                    .position(|family| family.queue_flags.contains(required))
                    .map(|index| (pd, index as u32))
            })
            .min_by_key(|(pd, _)| {
                match instance.get_physical_device_properties(*pd).device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                    vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                    vk::PhysicalDeviceType::CPU => 3,
                    _ => 4,
                }
            })
            .ok_or_else(|| {
                GraphicsError::DeviceCreation(format!("no physical device with a {kind} capable queue"))
            })?;

        let properties = instance.get_physical_device_properties(physical_device);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();
        debug!(device = %device_name, "Selected physical device");

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);
        let queue_infos = [queue_info.build()];

        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(true);
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .push_next(&mut features12);

        let device = instance
            .create_device(physical_device, &device_info, None)
            .map_err(|e| GraphicsError::DeviceCreation(format!("vkCreateDevice: {e}")))?;
        let queue = device.get_device_queue(queue_family_index, 0);

        Ok((device, queue, queue_family_index, device_name))
    }

    /// 逻辑设备
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// 队列句柄
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// 队列族索引
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// 物理设备名称
    pub fn name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn required_queue_flags(kind: CommandListType) -> vk::QueueFlags {
    match kind {
        CommandListType::Direct => vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        CommandListType::Compute => vk::QueueFlags::COMPUTE,
        CommandListType::Copy => vk::QueueFlags::TRANSFER,
    }
}
