//! GhostCodec: unified hardware video transcoding sessions
//!
//! One session contract over three vendor codec engines, with GPU interop,
//! NV12 to BGRA conversion and in-place recovery from stream format changes.
//!
//! # Features
//!
//! - **Encode**: AMF-style hardware encoder (AMD), H.264 and HEVC
//! - **Decode**: CUDA/NVDEC-style decoder with graphics interop (NVIDIA) and
//!   oneVPL-style decoder with explicit sync points (Intel)
//! - **Convert**: NV12 to BGRA through a shader pass or the video processor,
//!   BT.601/BT.709 in limited or full range
//! - **Probe**: per-adapter capability trials and driver runtime checks
//!
//! # Example
//!
//! ```rust,no_run
//! use ghostcodec::reference::{ReferencePlatform, AMD_LUID};
//! use ghostcodec::{ApiKind, DeviceRequest, EncoderConfig, Transcoder, Vendor};
//!
//! let amd = Transcoder::new(ReferencePlatform::new(), Vendor::Amd);
//! let config = EncoderConfig::default().with_resolution(1920, 1080);
//! let mut session = amd
//!     .create_encoder(DeviceRequest::new(AMD_LUID, ApiKind::Dx11), &config)
//!     .expect("encoder");
//!
//! let texture = amd.platform().caller_texture(config.resolution, [0, 0, 0, 255]);
//! let status = session.encode(texture, |data, keyframe| {
//!     println!("{} bytes, keyframe: {}", data.len(), keyframe);
//! });
//! assert_eq!(status, 0);
//! session.destroy();
//! ```

pub mod api;
pub mod config;
pub mod convert;
pub mod driver;
pub mod error;
pub mod gpu;
pub mod interop;
pub mod output;
pub mod platform;
pub mod probe;
pub mod reconfig;
pub mod reference;
pub mod session;
pub mod types;

// Re-exports for convenience
pub use api::{SessionHandle, Transcoder, STATUS_NO_OUTPUT, STATUS_OUTPUT};
pub use config::{DecoderConfig, EncoderConfig, Preset, QpRange, TranscodeConfig};
pub use convert::ColorSpace;
pub use error::{Error, Result};
pub use platform::Platform;
pub use session::{
    create_decoder, create_encoder, BackendSession, DeviceRequest, Reconfiguration, SessionInput,
    SessionKind, SessionOutput, SessionState,
};
pub use types::{
    AdapterDescriptor, ApiKind, Codec, Luid, OutputHandle, OutputMode, Packet, PlatformHandle,
    Resolution, Vendor,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if a vendor runtime can be loaded on this system
pub fn is_driver_available(vendor: Vendor) -> bool {
    driver::DriverRegistry::system().acquire(vendor).is_ok()
}
