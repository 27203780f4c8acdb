//! DirectX 12 设备创建
//!
//! # 初始化流程
//!
//! 1. 启用调试层（仅 Debug 模式）
//! 2. 创建 DXGI 工厂
//! 3. 选择适配器：WARP 软件适配器，或显存最大的硬件适配器
//! 4. 创建 D3D12 设备

use tracing::{debug, info, warn};
use windows::{
    Win32::Graphics::Direct3D::*, Win32::Graphics::Direct3D12::*, Win32::Graphics::Dxgi::*,
};

use crate::core::error::{GraphicsError, Result};

/// 创建 D3D12 设备
///
/// # 参数
///
/// * `use_warp` - 使用 WARP 软件适配器（无 GPU 的机器或 CI 环境）
pub fn create_device(use_warp: bool) -> Result<ID3D12Device> {
    unsafe {
        #[cfg(debug_assertions)]
        {
            let mut debug: Option<ID3D12Debug> = None;
            match D3D12GetDebugInterface(&mut debug) {
                Ok(()) => {
                    if let Some(debug) = debug {
                        debug.EnableDebugLayer();
                        debug!("DX12 Debug Layer enabled");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to enable DX12 Debug Layer"),
            }
        }

        let factory_flags = if cfg!(debug_assertions) {
            DXGI_CREATE_FACTORY_DEBUG
        } else {
            DXGI_CREATE_FACTORY_FLAGS(0)
        };
        let factory: IDXGIFactory4 = CreateDXGIFactory2(factory_flags)
            .map_err(|e| GraphicsError::DeviceCreation(format!("CreateDXGIFactory2: {e}")))?;

        let adapter: IDXGIAdapter1 = if use_warp {
            factory
                .EnumWarpAdapter()
                .map_err(|e| GraphicsError::DeviceCreation(format!("EnumWarpAdapter: {e}")))?
        } else {
            select_hardware_adapter(&factory)?
        };

        let desc = adapter
            .GetDesc1()
            .map_err(|e| GraphicsError::DeviceCreation(format!("GetDesc1: {e}")))?;
        let name = adapter_name(&desc.Description);

        let mut device: Option<ID3D12Device> = None;
        D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device)
            .map_err(|e| GraphicsError::DeviceCreation(format!("D3D12CreateDevice: {e}")))?;
        let device = device
            .ok_or_else(|| GraphicsError::DeviceCreation("D3D12CreateDevice returned no device".to_string()))?;

        info!(adapter = %name, warp = use_warp, "D3D12 device created");
        Ok(device)
    }
}

/// 选择显存最大的硬件适配器
unsafe fn select_hardware_adapter(factory: &IDXGIFactory4) -> Result<IDXGIAdapter1> {
    let mut best: Option<(usize, IDXGIAdapter1)> = None;
    let mut index = 0;

    while let Ok(adapter) = factory.EnumAdapters1(index) {
        index += 1;

        let Ok(desc) = adapter.GetDesc1() else {
            continue;
        };
        if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
            continue;
        }

        // 只检查是否支持，不真正创建设备
        let supported = D3D12CreateDevice(
            &adapter,
            D3D_FEATURE_LEVEL_11_0,
            std::ptr::null_mut::<Option<ID3D12Device>>(),
        )
        .is_ok();
        if !supported {
            continue;
        }

        debug!(
            adapter = %adapter_name(&desc.Description),
            video_memory = desc.DedicatedVideoMemory,
            "Found hardware adapter"
        );
        if best.as_ref().map_or(true, |(memory, _)| desc.DedicatedVideoMemory > *memory) {
            best = Some((desc.DedicatedVideoMemory, adapter));
        }
    }

    best.map(|(_, adapter)| adapter)
        .ok_or_else(|| GraphicsError::DeviceCreation("no hardware adapter supports D3D12".to_string()).into())
}

fn adapter_name(description: &[u16]) -> String {
    let len = description.iter().position(|&c| c == 0).unwrap_or(description.len());
    String::from_utf16_lossy(&description[..len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_name_stops_at_nul() {
        let mut raw = [0u16; 16];
        for (dst, src) in raw.iter_mut().zip("WARP".encode_utf16()) {
            *dst = src;
        }
        assert_eq!(adapter_name(&raw), "WARP");
    }
}
