use anyhow::{bail, Context as AnyhowContext, Result};

use crate::types::{AdapterProfile, Provider};

/// Device and queue owned by a live context. Dropping them releases the GPU.
pub struct DeviceHandles {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

/// What a provider hands back on success.
pub struct ProvidedContext {
    pub adapter: AdapterProfile,
    pub handles: Option<DeviceHandles>,
}

/// One way of obtaining a graphics context.
pub trait ContextProvider: Send + Sync {
    fn kind(&self) -> Provider;
    fn create(&self) -> Result<ProvidedContext>;
}

/// A graphics context owned by whichever component requested it.
pub struct GraphicsContext {
    provider: Provider,
    fallback_occurred: bool,
    adapter: AdapterProfile,
    handles: Option<DeviceHandles>,
}

impl GraphicsContext {
    pub(crate) fn new(provider: Provider, fallback_occurred: bool, provided: ProvidedContext) -> Self {
        Self {
            provider,
            fallback_occurred,
            adapter: provided.adapter,
            handles: provided.handles,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn fallback_occurred(&self) -> bool {
        self.fallback_occurred
    }

    pub fn adapter(&self) -> &AdapterProfile {
        &self.adapter
    }

    pub fn handles(&self) -> Option<&DeviceHandles> {
        self.handles.as_ref()
    }

    pub fn describe(&self) -> String {
        self.adapter.describe()
    }
}

impl std::fmt::Debug for GraphicsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsContext")
            .field("provider", &self.provider)
            .field("fallback_occurred", &self.fallback_occurred)
            .field("adapter", &self.adapter)
            .field("has_device", &self.handles.is_some())
            .finish()
    }
}

/// Headless wgpu context provider.
#[derive(Debug, Clone, Copy)]
pub struct WgpuProvider {
    kind: Provider,
}

impl WgpuProvider {
    pub fn hardware() -> Self {
        Self {
            kind: Provider::Hardware,
        }
    }

    pub fn software() -> Self {
        Self {
            kind: Provider::Software,
        }
    }
}

impl ContextProvider for WgpuProvider {
    fn kind(&self) -> Provider {
        self.kind
    }

    fn create(&self) -> Result<ProvidedContext> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let (power_preference, force_fallback_adapter) = match self.kind {
            Provider::Hardware => (wgpu::PowerPreference::HighPerformance, false),
            Provider::Software => (wgpu::PowerPreference::LowPower, true),
        };
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference,
            compatible_surface: None,
            force_fallback_adapter,
        }))
        .with_context(|| format!("failed to find a {} adapter", self.kind))?;

        let adapter_profile = AdapterProfile::from_wgpu(&adapter.get_info());
        tracing::debug!(
            provider = %self.kind,
            name = %adapter_profile.name,
            backend = %adapter_profile.backend,
            device_type = ?adapter_profile.device_type,
            "selected adapter"
        );
        if self.kind == Provider::Hardware && adapter_profile.is_software() {
            bail!(
                "only a software rasterizer ({}) is available",
                adapter_profile.name
            );
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("rendervisor device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::default(),
        }))
        .context("failed to create GPU device")?;

        Ok(ProvidedContext {
            adapter: adapter_profile,
            handles: Some(DeviceHandles { device, queue }),
        })
    }
}
