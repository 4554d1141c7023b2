//! In-process reference platform
//!
//! A CPU-backed implementation of every external collaborator a session
//! needs: adapter enumeration, devices, vendor runtimes and one reference
//! engine per backend contract. Every object it creates lives in a shared
//! [`TextureStore`], so leaks and teardown order are observable. Faults can
//! be injected per platform or per adapter through [`FaultPlan`].
//!
//! Used by the test suites and by the CLI self-test; no GPU is touched.

mod cuvid;
mod device;
mod encoder;
mod mfx;
mod store;
mod stream;

pub use cuvid::ReferenceCuvid;
pub use device::ReferenceDevice;
pub use encoder::ReferenceEncoder;
pub use mfx::ReferenceMfx;
pub use store::TextureStore;
pub use stream::{synthetic_stream, StreamPacket};

use crate::driver::{DriverHandle, DriverRegistry};
use crate::error::{Error, Result};
use crate::gpu::{GpuDevice, PixelFormat, TextureDesc, TextureUsage};
use crate::platform::Platform;
use crate::types::{ApiKind, Codec, Luid, PlatformHandle, Resolution, Vendor};
use std::collections::{HashMap, HashSet};

pub const NVIDIA_LUID: Luid = Luid(0x10de_0001);
pub const AMD_LUID: Luid = Luid(0x1002_0001);
pub const INTEL_LUID: Luid = Luid(0x8086_0001);

/// Failures the reference objects inject on request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Device cannot be opened on the adapter
    pub fail_open_device: bool,
    pub fail_textures: bool,
    pub fail_pixel_shader: bool,
    pub fail_shared_handle: bool,
    pub fail_video_process: bool,
    /// Interop registration refused
    pub fail_register: bool,
    /// Encoder component rejects `init`
    pub fail_engine_init: bool,
    /// Encoder accepts input but never returns a buffer
    pub encoder_never_ready: bool,
    /// Encoder fails hard when asked for output
    pub encoder_output_error: bool,
    /// First decoder is created, every later one fails
    pub fail_decoder_recreate: bool,
    pub mfx_always_incompatible: bool,
    pub mfx_device_busy: bool,
    /// Frames come back with a warning status and a sync point
    pub mfx_warn_with_output: bool,
    pub sync_never_completes: bool,
    /// Every pool surface stays locked by the decoder
    pub lock_all_surfaces: bool,
}

/// Reference [`Platform`] with one adapter per vendor by default
#[derive(Debug)]
pub struct ReferencePlatform {
    store: TextureStore,
    drivers: DriverRegistry,
    adapters: Vec<(Luid, Vendor)>,
    faults: FaultPlan,
    adapter_faults: HashMap<Luid, FaultPlan>,
    missing_drivers: HashSet<Vendor>,
}

impl ReferencePlatform {
    pub fn new() -> Self {
        Self {
            store: TextureStore::new(),
            drivers: Self::registry(HashSet::new()),
            adapters: vec![
                (NVIDIA_LUID, Vendor::Nvidia),
                (AMD_LUID, Vendor::Amd),
                (INTEL_LUID, Vendor::Intel),
            ],
            faults: FaultPlan::default(),
            adapter_faults: HashMap::new(),
            missing_drivers: HashSet::new(),
        }
    }

    /// Registry whose runtimes load nothing, or fail for `missing` vendors
    fn registry(missing: HashSet<Vendor>) -> DriverRegistry {
        DriverRegistry::with_loader(move |vendor| {
            if missing.contains(&vendor) {
                Err(Error::DriverUnavailable(format!("{} runtime not installed", vendor)))
            } else {
                Ok(Vec::new())
            }
        })
    }

    /// Faults applied on every adapter without its own plan
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_adapter(mut self, luid: Luid, vendor: Vendor) -> Self {
        self.adapters.push((luid, vendor));
        self
    }

    pub fn with_adapter_faults(mut self, luid: Luid, faults: FaultPlan) -> Self {
        self.adapter_faults.insert(luid, faults);
        self
    }

    /// Make the vendor runtime fail to load
    pub fn without_driver(mut self, vendor: Vendor) -> Self {
        self.missing_drivers.insert(vendor);
        self.drivers = Self::registry(self.missing_drivers.clone());
        self
    }

    pub fn store(&self) -> &TextureStore {
        &self.store
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    fn faults_for(&self, luid: Luid) -> FaultPlan {
        self.adapter_faults.get(&luid).copied().unwrap_or(self.faults)
    }

    /// A BGRA texture owned by "the caller", filled with one pixel value
    pub fn caller_texture(&self, resolution: Resolution, bgra: [u8; 4]) -> PlatformHandle {
        let desc = TextureDesc::new(
            resolution.width,
            resolution.height,
            PixelFormat::Bgra8,
            TextureUsage::ShaderResource,
        );
        let handle = self.store.create_texture(&desc);
        if let Err(e) = self.store.fill(handle, &bgra) {
            tracing::warn!("Could not fill caller texture: {}", e);
        }
        handle
    }
}

impl Default for ReferencePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for ReferencePlatform {
    type Encoder = ReferenceEncoder;
    type Cuvid = ReferenceCuvid;
    type Mfx = ReferenceMfx;

    fn name(&self) -> &str {
        "reference"
    }

    fn enumerate_adapters(&self, vendor: Vendor) -> Result<Vec<Luid>> {
        Ok(self
            .adapters
            .iter()
            .filter(|(_, v)| *v == vendor)
            .map(|(luid, _)| *luid)
            .collect())
    }

    fn open_device(
        &self,
        device: Option<PlatformHandle>,
        luid: Luid,
        api: ApiKind,
    ) -> Result<Box<dyn GpuDevice>> {
        if !self.adapters.iter().any(|(l, _)| *l == luid) {
            return Err(Error::BackendInit(format!("no adapter with LUID {}", luid)));
        }
        let faults = self.faults_for(luid);
        if faults.fail_open_device {
            return Err(Error::BackendInit(format!("device creation failed on {}", luid)));
        }
        if let Some(shared) = device {
            tracing::debug!("Caller device {} shared on {} ({:?})", shared, luid, api);
        }
        Ok(Box::new(ReferenceDevice::new(self.store.clone(), luid, faults)))
    }

    fn acquire_driver(&self, vendor: Vendor) -> Result<DriverHandle> {
        self.drivers.acquire(vendor)
    }

    fn new_encode_engine(
        &self,
        driver: &DriverHandle,
        device: &dyn GpuDevice,
        api: ApiKind,
        codec: Codec,
    ) -> Result<Self::Encoder> {
        tracing::trace!("Reference encoder on {} via {:?}", device.luid(), api);
        Ok(ReferenceEncoder::new(
            self.store.clone(),
            driver.clone(),
            self.faults_for(device.luid()),
            codec,
        ))
    }

    fn new_cuvid_engine(&self, driver: &DriverHandle, device: &dyn GpuDevice) -> Result<Self::Cuvid> {
        Ok(ReferenceCuvid::new(
            self.store.clone(),
            driver.clone(),
            self.faults_for(device.luid()),
        ))
    }

    fn new_mfx_engine(
        &self,
        driver: &DriverHandle,
        device: &dyn GpuDevice,
        codec: Codec,
    ) -> Result<Self::Mfx> {
        Ok(ReferenceMfx::new(
            self.store.clone(),
            driver.clone(),
            self.faults_for(device.luid()),
            codec,
        ))
    }
}
