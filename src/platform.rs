//! External collaborators
//!
//! Everything a session needs from outside the crate: adapter enumeration,
//! device/context acquisition, vendor runtime loading and construction of the
//! vendor codec engines. A platform is shared by every session created from
//! it and must be safe to use from several threads.

use crate::driver::DriverHandle;
use crate::error::Result;
use crate::gpu::GpuDevice;
use crate::session::{CuvidEngine, EncodeEngine, MfxEngine};
use crate::types::{ApiKind, Codec, Luid, PlatformHandle, Vendor};

pub trait Platform: Send + Sync {
    /// AMF-style encoder component
    type Encoder: EncodeEngine + 'static;
    /// CUDA/NVDEC-style decoder with interop entry points
    type Cuvid: CuvidEngine + 'static;
    /// oneVPL-style decode session
    type Mfx: MfxEngine + 'static;

    fn name(&self) -> &str;

    /// Physical adapters of one vendor
    fn enumerate_adapters(&self, vendor: Vendor) -> Result<Vec<Luid>>;

    /// Device + immediate context on an adapter
    ///
    /// `device` is an existing device the caller wants shared; the returned
    /// object still belongs to the session.
    fn open_device(
        &self,
        device: Option<PlatformHandle>,
        luid: Luid,
        api: ApiKind,
    ) -> Result<Box<dyn GpuDevice>>;

    /// Reference-counted vendor runtime
    fn acquire_driver(&self, vendor: Vendor) -> Result<DriverHandle>;

    /// Encoder component bound to `device`; initialised by the session
    fn new_encode_engine(
        &self,
        driver: &DriverHandle,
        device: &dyn GpuDevice,
        api: ApiKind,
        codec: Codec,
    ) -> Result<Self::Encoder>;

    /// Decode context on the adapter of `device`, no decoder created yet
    fn new_cuvid_engine(&self, driver: &DriverHandle, device: &dyn GpuDevice) -> Result<Self::Cuvid>;

    /// Media session bound to `device`, parameters queried for `codec`
    fn new_mfx_engine(
        &self,
        driver: &DriverHandle,
        device: &dyn GpuDevice,
        codec: Codec,
    ) -> Result<Self::Mfx>;
}
