//! YUV -> RGB matrices and the reference CPU kernel

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Matrix and range of a YUV source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorSpace {
    /// BT.709 coefficients instead of BT.601
    pub bt709: bool,
    /// Full (0-255) instead of studio (16-235) range
    pub full_range: bool,
}

impl ColorSpace {
    pub const BT601_STUDIO: Self = Self::new(false, false);
    pub const BT601_FULL: Self = Self::new(false, true);
    pub const BT709_STUDIO: Self = Self::new(true, false);
    pub const BT709_FULL: Self = Self::new(true, true);

    pub const ALL: [ColorSpace; 4] = [
        Self::BT601_STUDIO,
        Self::BT601_FULL,
        Self::BT709_STUDIO,
        Self::BT709_FULL,
    ];

    pub const fn new(bt709: bool, full_range: bool) -> Self {
        Self { bt709, full_range }
    }

    /// Inverse of the video processor input mapping
    pub fn from_dxgi(space: DxgiColorSpace) -> Option<Self> {
        match space {
            DxgiColorSpace::YcbcrStudioG22LeftP601 => Some(Self::BT601_STUDIO),
            DxgiColorSpace::YcbcrFullG22LeftP601 => Some(Self::BT601_FULL),
            DxgiColorSpace::YcbcrStudioG22LeftP709 => Some(Self::BT709_STUDIO),
            DxgiColorSpace::YcbcrFullG22LeftP709 => Some(Self::BT709_FULL),
            DxgiColorSpace::RgbFullG22NoneP709 => None,
        }
    }
}

impl std::fmt::Display for ColorSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}",
            if self.bt709 { "BT.709" } else { "BT.601" },
            if self.full_range { "full" } else { "studio" }
        )
    }
}

/// Subset of `DXGI_COLOR_SPACE_TYPE` the video processor path uses
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DxgiColorSpace {
    RgbFullG22NoneP709 = 0,
    YcbcrStudioG22LeftP601 = 6,
    YcbcrFullG22LeftP601 = 7,
    YcbcrStudioG22LeftP709 = 8,
    YcbcrFullG22LeftP709 = 9,
}

impl From<ColorSpace> for DxgiColorSpace {
    fn from(cs: ColorSpace) -> Self {
        match (cs.bt709, cs.full_range) {
            (true, true) => DxgiColorSpace::YcbcrFullG22LeftP709,
            (true, false) => DxgiColorSpace::YcbcrStudioG22LeftP709,
            (false, true) => DxgiColorSpace::YcbcrFullG22LeftP601,
            (false, false) => DxgiColorSpace::YcbcrStudioG22LeftP601,
        }
    }
}

/// Normalised value of the 8-bit chroma midpoint (128)
pub const CHROMA_ZERO: f32 = 128.0 / 255.0;

/// Normalised YUV -> RGB coefficients
///
/// `r = y' + rv*v`, `g = y' - gu*u - gv*v`, `b = y' + bu*u` where
/// `y' = (y - y_offset) * y_scale` and `u`, `v` are centred on [`CHROMA_ZERO`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YuvMatrix {
    pub y_offset: f32,
    pub y_scale: f32,
    pub rv: f32,
    pub gu: f32,
    pub gv: f32,
    pub bu: f32,
}

impl YuvMatrix {
    pub fn for_color_space(cs: ColorSpace) -> Self {
        let (kr, kb): (f64, f64) = if cs.bt709 { (0.2126, 0.0722) } else { (0.299, 0.114) };
        let kg = 1.0 - kr - kb;
        // studio range: luma 16..235, chroma 16..240, offset rounded to 1/16
        let (y_offset, y_scale, c_scale) = if cs.full_range {
            (0.0, 1.0, 1.0)
        } else {
            (0.0625, 255.0 / 219.0, 255.0 / 224.0)
        };
        Self {
            y_offset: y_offset as f32,
            y_scale: y_scale as f32,
            rv: (2.0 * (1.0 - kr) * c_scale) as f32,
            gu: (2.0 * kb * (1.0 - kb) / kg * c_scale) as f32,
            gv: (2.0 * kr * (1.0 - kr) / kg * c_scale) as f32,
            bu: (2.0 * (1.0 - kb) * c_scale) as f32,
        }
    }

    /// Convert one normalised sample, each channel clamped to [0, 1]
    pub fn to_rgb(&self, y: f32, u: f32, v: f32) -> [f32; 3] {
        let y = (y - self.y_offset) * self.y_scale;
        let u = u - CHROMA_ZERO;
        let v = v - CHROMA_ZERO;
        [
            (y + self.rv * v).clamp(0.0, 1.0),
            (y - self.gv * v - self.gu * u).clamp(0.0, 1.0),
            (y + self.bu * u).clamp(0.0, 1.0),
        ]
    }

    /// Convert 8-bit samples straight to a BGRA pixel
    pub fn to_bgra8(&self, y: u8, u: u8, v: u8) -> [u8; 4] {
        let [r, g, b] = self.to_rgb(y as f32 / 255.0, u as f32 / 255.0, v as f32 / 255.0);
        let q = |c: f32| (c * 255.0 + 0.5) as u8;
        [q(b), q(g), q(r), 255]
    }
}

/// Convert NV12 planes into a tightly packed BGRA buffer
///
/// `luma` is `width*height` bytes, `chroma` is `(width/2)*(height/2)` UV pairs.
/// Chroma is point-sampled at half resolution.
pub fn nv12_to_bgra(
    luma: &[u8],
    chroma: &[u8],
    width: u32,
    height: u32,
    matrix: &YuvMatrix,
) -> Result<Vec<u8>> {
    let (w, h) = (width as usize, height as usize);
    if w % 2 != 0 || h % 2 != 0 {
        return Err(Error::ColorspaceConversion(format!(
            "NV12 surface {}x{} must have even dimensions",
            width, height
        )));
    }
    if luma.len() < w * h || chroma.len() < w * h / 2 {
        return Err(Error::ColorspaceConversion(format!(
            "NV12 planes too small for {}x{}: luma {} bytes, chroma {} bytes",
            width,
            height,
            luma.len(),
            chroma.len()
        )));
    }

    let mut output = vec![0u8; w * h * 4];
    for (row, out_row) in output.chunks_exact_mut(w * 4).enumerate() {
        let luma_row = &luma[row * w..(row + 1) * w];
        let chroma_row = &chroma[(row / 2) * w..(row / 2 + 1) * w];
        for (col, px) in out_row.chunks_exact_mut(4).enumerate() {
            let c = (col / 2) * 2;
            px.copy_from_slice(&matrix.to_bgra8(luma_row[col], chroma_row[c], chroma_row[c + 1]));
        }
    }
    Ok(output)
}
