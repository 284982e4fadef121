//! Process-wide wgpu device shared by every executing chain.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Result, ShaderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerPreference {
    #[default]
    High,
    Low,
}

impl From<PowerPreference> for wgpu::PowerPreference {
    fn from(value: PowerPreference) -> Self {
        match value {
            PowerPreference::High => wgpu::PowerPreference::HighPerformance,
            PowerPreference::Low => wgpu::PowerPreference::LowPower,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct GpuOptions {
    pub power_preference: PowerPreference,
    /// Use a software adapter.
    pub force_fallback_adapter: bool,
}

/// Device and queue of one device generation.
#[derive(Clone)]
pub struct DeviceHandles {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub generation: u64,
    lost: Arc<AtomicBool>,
}

impl DeviceHandles {
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

/// Headless wgpu instance, adapter and the current device.
pub struct GpuContext {
    _instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    handles: RwLock<DeviceHandles>,
    generation: AtomicU64,
}

static SHARED: OnceLock<Mutex<Weak<GpuContext>>> = OnceLock::new();

impl GpuContext {
    pub fn new(options: GpuOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: options.power_preference.into(),
            compatible_surface: None,
            force_fallback_adapter: options.force_fallback_adapter,
        }))
        .map_err(|e| ShaderError::Device(format!("failed to find GPU adapter: {e:?}")))?;

        let info = adapter.get_info();
        info!(adapter = %info.name, backend = ?info.backend, "GPU adapter selected");

        let handles = request_device(&adapter, 0)?;
        Ok(Self {
            _instance: instance,
            adapter,
            handles: RwLock::new(handles),
            generation: AtomicU64::new(0),
        })
    }

    /// Context shared by the whole process, created on first use. Options
    /// only apply when no context is alive.
    pub fn shared(options: GpuOptions) -> Result<Arc<Self>> {
        let slot = SHARED.get_or_init(|| Mutex::new(Weak::new()));
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(context) = slot.upgrade() {
            return Ok(context);
        }
        let context = Arc::new(Self::new(options)?);
        *slot = Arc::downgrade(&context);
        Ok(context)
    }

    pub fn handles(&self) -> DeviceHandles {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Replaces the device of generation `seen`. Callers racing on the same
    /// loss recreate it only once.
    pub fn recreate(&self, seen: u64) -> Result<()> {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        if handles.generation != seen {
            return Ok(());
        }
        let next = seen + 1;
        warn!(generation = next, "recreating GPU device");
        *handles = request_device(&self.adapter, next)?;
        self.generation.store(next, Ordering::Release);
        Ok(())
    }
}

fn request_device(adapter: &wgpu::Adapter, generation: u64) -> Result<DeviceHandles> {
    let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("shaderchain device"),
        required_features: wgpu::Features::empty(),
        required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
        memory_hints: wgpu::MemoryHints::Performance,
        ..Default::default()
    }))
    .map_err(|e| ShaderError::Device(format!("failed to create GPU device: {e}")))?;

    let lost = Arc::new(AtomicBool::new(false));
    let flag = lost.clone();
    device.set_device_lost_callback(move |reason, message| {
        warn!(?reason, generation, "GPU device lost: {message}");
        flag.store(true, Ordering::Release);
    });

    Ok(DeviceHandles {
        device,
        queue,
        generation,
        lost,
    })
}
