use std::fmt;

/// Strategy used to obtain a graphics context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Hardware-accelerated adapter (discrete, integrated or virtual GPU).
    Hardware,
    /// Software rasterizer (llvmpipe, WARP, SwiftShader).
    Software,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Hardware => f.write_str("hardware"),
            Provider::Software => f.write_str("software"),
        }
    }
}

/// Coarse adapter classification, mirrored from `wgpu::DeviceType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    DiscreteGpu,
    IntegratedGpu,
    VirtualGpu,
    Cpu,
    Other,
}

impl From<wgpu::DeviceType> for AdapterKind {
    fn from(value: wgpu::DeviceType) -> Self {
        match value {
            wgpu::DeviceType::DiscreteGpu => AdapterKind::DiscreteGpu,
            wgpu::DeviceType::IntegratedGpu => AdapterKind::IntegratedGpu,
            wgpu::DeviceType::VirtualGpu => AdapterKind::VirtualGpu,
            wgpu::DeviceType::Cpu => AdapterKind::Cpu,
            wgpu::DeviceType::Other => AdapterKind::Other,
        }
    }
}

/// What we learned about the adapter backing a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterProfile {
    pub name: String,
    pub backend: String,
    pub device_type: AdapterKind,
    pub driver: String,
}

impl AdapterProfile {
    pub fn from_wgpu(info: &wgpu::AdapterInfo) -> Self {
        let driver = if info.driver_info.is_empty() {
            info.driver.clone()
        } else {
            format!("{} {}", info.driver, info.driver_info)
        };
        Self {
            name: info.name.clone(),
            backend: format!("{:?}", info.backend),
            device_type: info.device_type.into(),
            driver: driver.trim().to_string(),
        }
    }

    pub fn is_software(&self) -> bool {
        self.device_type == AdapterKind::Cpu
    }

    /// Human-readable description, e.g. `NVIDIA A100 (Vulkan, driver 550.54)`.
    pub fn describe(&self) -> String {
        if self.driver.is_empty() {
            format!("{} ({})", self.name, self.backend)
        } else {
            format!("{} ({}, driver {})", self.name, self.backend, self.driver)
        }
    }
}
