//! Synthetic elementary stream understood by the reference decoders
//!
//! Each packet carries its own sequence header (codec, coded size, display
//! rectangle) and one flat NV12 colour, which is enough to drive format drift,
//! decoder buffering and colour conversion end to end.
//!
//! Layout, little endian:
//!
//! ```text
//! magic "GCS1" | codec u8 | flags u8 | coded w u16 | coded h u16
//! | display l,t,r,b u16 x4 | y u8 | u u8 | v u8 | index u32
//! | payload len u16 | payload
//! ```

use crate::error::{Error, Result};
use crate::types::{Codec, DisplayRect, Resolution};

const MAGIC: &[u8; 4] = b"GCS1";
const HEADER_LEN: usize = 4 + 1 + 1 + 2 + 2 + 8 + 3 + 4 + 2;
const FLAG_HOLD: u8 = 0x01;

/// Coded surfaces are allocated in 16-pixel macroblocks
fn align16(value: u32) -> u32 {
    (value + 15) & !15
}

fn codec_id(codec: Codec) -> u8 {
    match codec {
        Codec::H264 => 0,
        Codec::Hevc => 1,
        Codec::Av1 => 2,
    }
}

fn codec_from_id(id: u8) -> Option<Codec> {
    match id {
        0 => Some(Codec::H264),
        1 => Some(Codec::Hevc),
        2 => Some(Codec::Av1),
        _ => None,
    }
}

/// One access unit of the synthetic stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    pub codec: Codec,
    pub coded: Resolution,
    pub display: DisplayRect,
    pub yuv: [u8; 3],
    pub index: u32,
    /// Decoder keeps the frame back until a later packet arrives
    pub hold: bool,
    pub payload: Vec<u8>,
}

impl StreamPacket {
    /// Packet whose display area is `resolution` and coded size its macroblock-aligned cover
    pub fn new(codec: Codec, resolution: Resolution) -> Self {
        Self {
            codec,
            coded: Resolution::new(align16(resolution.width), align16(resolution.height)),
            display: DisplayRect::full(resolution),
            yuv: [126, 128, 128],
            index: 0,
            hold: false,
            payload: vec![0u8; 32],
        }
    }

    pub fn with_yuv(mut self, y: u8, u: u8, v: u8) -> Self {
        self.yuv = [y, u, v];
        self
    }

    pub fn with_hold(mut self) -> Self {
        self.hold = true;
        self
    }

    /// Override the visible rectangle; the coded size is kept
    pub fn with_display(mut self, display: DisplayRect) -> Self {
        self.display = display;
        self
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn display_size(&self) -> Resolution {
        Resolution::new(self.display.width(), self.display.height())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(MAGIC);
        out.push(codec_id(self.codec));
        out.push(if self.hold { FLAG_HOLD } else { 0 });
        out.extend_from_slice(&(self.coded.width as u16).to_le_bytes());
        out.extend_from_slice(&(self.coded.height as u16).to_le_bytes());
        for edge in [self.display.left, self.display.top, self.display.right, self.display.bottom] {
            out.extend_from_slice(&(edge as u16).to_le_bytes());
        }
        out.extend_from_slice(&self.yuv);
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse the packet at the start of `data`, returning it and the bytes it spans
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < HEADER_LEN || &data[..4] != MAGIC {
            return Err(Error::Submit(format!(
                "not a stream packet ({} bytes)",
                data.len()
            )));
        }
        let u16_at = |at: usize| u16::from_le_bytes([data[at], data[at + 1]]) as u32;

        let codec = codec_from_id(data[4])
            .ok_or_else(|| Error::Submit(format!("unknown codec id {}", data[4])))?;
        let hold = data[5] & FLAG_HOLD != 0;
        let coded = Resolution::new(u16_at(6), u16_at(8));
        let display = DisplayRect::new(
            u16_at(10) as i32,
            u16_at(12) as i32,
            u16_at(14) as i32,
            u16_at(16) as i32,
        );
        let yuv = [data[18], data[19], data[20]];
        let index = u32::from_le_bytes([data[21], data[22], data[23], data[24]]);
        let payload_len = u16_at(25) as usize;

        let total = HEADER_LEN + payload_len;
        if data.len() < total {
            return Err(Error::Submit(format!(
                "truncated packet: {} of {} bytes",
                data.len(),
                total
            )));
        }
        if display.width() == 0
            || display.height() == 0
            || display.right as u32 > coded.width
            || display.bottom as u32 > coded.height
        {
            return Err(Error::Submit(format!(
                "display area {} outside coded surface {}",
                display, coded
            )));
        }

        Ok((
            Self {
                codec,
                coded,
                display,
                yuv,
                index,
                hold,
                payload: data[HEADER_LEN..total].to_vec(),
            },
            total,
        ))
    }
}

/// `count` consecutive packets at one resolution with a slowly changing luma
pub fn synthetic_stream(codec: Codec, resolution: Resolution, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let y = 16 + ((i * 37) % 220) as u8;
            StreamPacket::new(codec, resolution)
                .with_index(i as u32)
                .with_yuv(y, 128, 128)
                .to_bytes()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coded_size_is_macroblock_aligned() {
        let p = StreamPacket::new(Codec::H264, Resolution::FHD_1080P);
        assert_eq!(p.coded, Resolution::new(1920, 1088));
        assert_eq!(p.display_size(), Resolution::FHD_1080P);
    }

    #[test]
    fn test_parse_reads_back_header() {
        let bytes = StreamPacket::new(Codec::Hevc, Resolution::new(128, 64))
            .with_display(DisplayRect::new(0, 0, 96, 64))
            .with_hold()
            .with_index(9)
            .to_bytes();
        let (p, len) = StreamPacket::parse(&bytes).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(p.codec, Codec::Hevc);
        assert!(p.hold);
        assert_eq!(p.index, 9);
        assert_eq!(p.display_size(), Resolution::new(96, 64));
    }

    #[test]
    fn test_garbage_and_truncation_rejected() {
        assert!(StreamPacket::parse(b"not a stream").is_err());
        let bytes = StreamPacket::new(Codec::H264, Resolution::HD_720P).to_bytes();
        assert!(StreamPacket::parse(&bytes[..bytes.len() - 1]).is_err());
    }
}
