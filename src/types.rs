//! Common types used throughout GhostCodec

use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::num::NonZeroUsize;

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    // Common resolutions
    pub const HD_720P: Self = Self::new(1280, 720);
    pub const FHD_1080P: Self = Self::new(1920, 1080);
    pub const QHD_1440P: Self = Self::new(2560, 1440);
    pub const UHD_4K: Self = Self::new(3840, 2160);

    /// Calculate total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Both dimensions positive and even (required by 4:2:0 surfaces)
    pub fn is_valid_420(&self) -> bool {
        self.width > 0 && self.height > 0 && self.width % 2 == 0 && self.height % 2 == 0
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::FHD_1080P
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Compressed bitstream format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// H.264/AVC
    #[default]
    H264,
    /// H.265/HEVC
    Hevc,
    /// AV1
    Av1,
}

impl Codec {
    /// Get human-readable name
    pub fn display_name(&self) -> &'static str {
        match self {
            Codec::H264 => "H.264 (AVC)",
            Codec::Hevc => "H.265 (HEVC)",
            Codec::Av1 => "AV1",
        }
    }

    /// Parse a CLI/config codec name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "h264" | "avc" => Some(Codec::H264),
            "h265" | "hevc" => Some(Codec::Hevc),
            "av1" => Some(Codec::Av1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Graphics/compute API the session binds its device through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKind {
    #[default]
    Dx11,
    Vulkan,
    OpenCl,
}

impl ApiKind {
    /// APIs a backend may be asked for on the current target
    pub fn native() -> &'static [ApiKind] {
        if cfg!(windows) {
            &[ApiKind::Dx11]
        } else {
            &[ApiKind::OpenCl, ApiKind::Vulkan]
        }
    }
}

/// GPU vendor, used to filter adapters and select a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
}

impl Vendor {
    pub const ALL: [Vendor; 3] = [Vendor::Nvidia, Vendor::Amd, Vendor::Intel];

    /// PCI vendor id reported by adapter enumeration
    pub fn pci_id(&self) -> u32 {
        match self {
            Vendor::Nvidia => 0x10DE,
            Vendor::Amd => 0x1002,
            Vendor::Intel => 0x8086,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Vendor::Nvidia => "NVIDIA",
            Vendor::Amd => "AMD",
            Vendor::Intel => "Intel",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "nvidia" | "nv" => Some(Vendor::Nvidia),
            "amd" => Some(Vendor::Amd),
            "intel" => Some(Vendor::Intel),
            _ => None,
        }
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Locally-unique identifier of a physical adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Luid(pub i64);

impl std::fmt::Display for Luid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An adapter that passed a capability trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub luid: Luid,
    pub vendor: Vendor,
}

/// Opaque, non-null platform handle (device, texture, view, shared handle...)
///
/// Never dereferenced by this crate. Ownership is documented at each call site:
/// handles passed *in* are borrowed for the duration of the call, handles
/// passed *out* stay owned by the session unless stated otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformHandle(NonZeroUsize);

impl PlatformHandle {
    pub const fn new(value: usize) -> Option<Self> {
        match NonZeroUsize::new(value) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Wrap a native pointer, `None` for null
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        Self::new(ptr as usize)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0.get() as *mut c_void
    }

    pub fn value(self) -> usize {
        self.0.get()
    }
}

impl From<NonZeroUsize> for PlatformHandle {
    fn from(value: NonZeroUsize) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for PlatformHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// How decoded frames are handed to the caller, fixed per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Session-owned texture, valid until the next decode call
    #[default]
    Texture,
    /// Duplicable shared handle the caller may open on another device/process
    SharedHandle,
}

/// A decoded frame as delivered to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputHandle {
    /// Borrowed texture; the session keeps ownership
    Texture(PlatformHandle),
    /// Shared handle; the caller opens its own reference and must not close this one
    Shared(PlatformHandle),
}

impl OutputHandle {
    pub fn handle(&self) -> PlatformHandle {
        match self {
            OutputHandle::Texture(h) | OutputHandle::Shared(h) => *h,
        }
    }
}

/// Visible rectangle inside the coded surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DisplayRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl DisplayRect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Full-surface rectangle for a resolution
    pub const fn full(resolution: Resolution) -> Self {
        Self::new(0, 0, resolution.width as i32, resolution.height as i32)
    }

    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }
}

impl std::fmt::Display for DisplayRect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.left, self.top, self.right, self.bottom
        )
    }
}

/// Stream parameters reported by a decoder, kept between calls to detect drift
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoFormatSnapshot {
    pub display_area: DisplayRect,
    pub coded_width: u32,
    pub coded_height: u32,
    /// Largest surface the current decoder instance was created for (0 = unknown)
    pub max_width: u32,
    pub max_height: u32,
}

impl VideoFormatSnapshot {
    /// Coded dimensions exceed what the decoder was created for
    pub fn exceeds_max(&self) -> bool {
        self.max_width > 0
            && (self.coded_width > self.max_width || self.coded_height > self.max_height)
    }
}

/// Encoded packet as produced by an encode session
///
/// Borrows the session's grow-only packet buffer; valid until the next call
/// on the session.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub data: &'a [u8],
    pub is_keyframe: bool,
    pub pts: i64,
    pub dts: i64,
}

impl Packet<'_> {
    /// Size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_parity() {
        assert!(Resolution::FHD_1080P.is_valid_420());
        assert!(!Resolution::new(1921, 1080).is_valid_420());
        assert!(!Resolution::new(1920, 1081).is_valid_420());
        assert!(!Resolution::new(0, 1080).is_valid_420());
    }

    #[test]
    fn test_platform_handle_rejects_null() {
        assert!(PlatformHandle::new(0).is_none());
        assert!(PlatformHandle::from_raw(std::ptr::null_mut()).is_none());
        let h = PlatformHandle::new(0x40).unwrap();
        assert_eq!(h.as_raw() as usize, 0x40);
    }

    #[test]
    fn test_snapshot_exceeds_max() {
        let mut s = VideoFormatSnapshot {
            coded_width: 1920,
            coded_height: 1088,
            ..Default::default()
        };
        assert!(!s.exceeds_max());
        s.max_width = 1280;
        s.max_height = 720;
        assert!(s.exceeds_max());
    }
}
