// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies
//
// Taken from https://docs.rs/crate/four-cc/latest and adapted to handle endianess.
#![forbid(unsafe_code)]

use core::{fmt, result::Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C, packed)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    const fn to_u32(self) -> u32 {
        #[cfg(target_endian = "little")]
        {
            ((self.0[3] as u32) << 24 & 0xff000000)
                | ((self.0[2] as u32) << 16 & 0x00ff0000)
                | ((self.0[1] as u32) << 8 & 0x0000ff00)
                | ((self.0[0] as u32) & 0x000000ff)
        }
        #[cfg(target_endian = "big")]
        {
            ((self.0[0] as u32) << 24 & 0xff000000)
                | ((self.0[1] as u32) << 16 & 0x00ff0000)
                | ((self.0[2] as u32) << 8 & 0x0000ff00)
                | ((self.0[3] as u32) & 0x000000ff)
        }
    }

    /// Number of image planes this pixel format occupies when carried as a
    /// multi-planar buffer.
    ///
    /// Unknown formats are treated as single-plane packed data (JPEG and
    /// other compressed payloads land here).
    pub fn plane_count(&self) -> usize {
        match &self.0 {
            b"NV12" | b"NV21" | b"NM12" | b"NM21" => 2,
            b"YU12" | b"YV12" | b"YM12" | b"YM21" => 3,
            _ => 1,
        }
    }

    /// Per-plane byte lengths for a frame of the given dimensions.
    ///
    /// Strides are assumed tight; callers with alignment requirements scale
    /// the returned lengths by their own stride before pool setup.
    pub fn plane_lens(&self, width: u32, height: u32) -> Vec<usize> {
        let w = width as usize;
        let h = height as usize;
        match &self.0 {
            b"NV12" | b"NV21" | b"NM12" | b"NM21" => vec![w * h, w * h / 2],
            b"YU12" | b"YV12" | b"YM12" | b"YM21" => {
                vec![w * h, w * h / 4, w * h / 4]
            }
            b"YUYV" | b"UYVY" => vec![w * h * 2],
            b"RGBP" => vec![w * h * 2],
            b"BA10" | b"BA12" | b"BG10" => vec![w * h * 2], // 10/12-bit bayer, 16-bit container
            b"RGB3" | b"BGR3" => vec![w * h * 3],
            b"RGB4" | b"BGR4" | b"RGBA" => vec![w * h * 4],
            // Compressed formats: worst-case bound of the packed frame.
            b"JPEG" | b"MJPG" => vec![w * h * 2],
            _ => vec![w * h * 2],
        }
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(buf: &[u8; 4]) -> FourCC {
        FourCC([buf[0], buf[1], buf[2], buf[3]])
    }
}
impl From<&[u8]> for FourCC {
    fn from(buf: &[u8]) -> FourCC {
        FourCC([buf[0], buf[1], buf[2], buf[3]])
    }
}
impl From<u32> for FourCC {
    fn from(val: u32) -> FourCC {
        #[cfg(target_endian = "little")]
        {
            FourCC([
                (val & 0xff) as u8,
                (val >> 8 & 0xff) as u8,
                (val >> 16 & 0xff) as u8,
                (val >> 24 & 0xff) as u8,
            ])
        }
        #[cfg(target_endian = "big")]
        {
            FourCC([
                (val >> 24 & 0xff) as u8,
                (val >> 16 & 0xff) as u8,
                (val >> 8 & 0xff) as u8,
                (val & 0xff) as u8,
            ])
        }
    }
}

impl From<FourCC> for u32 {
    fn from(val: FourCC) -> Self {
        val.to_u32()
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match core::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => {
                // If we return fmt::Error, then for example format!() will panic, so we choose
                // an alternative representation instead
                let b = &self.0;
                f.write_fmt(format_args!(
                    "{}{}{}{}",
                    core::ascii::escape_default(b[0]),
                    core::ascii::escape_default(b[1]),
                    core::ascii::escape_default(b[2]),
                    core::ascii::escape_default(b[3])
                ))
            }
        }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let b = self.0;
        f.debug_tuple("FourCC")
            .field(&format_args!(
                "{}{}{}{}",
                core::ascii::escape_default(b[0]),
                core::ascii::escape_default(b[1]),
                core::ascii::escape_default(b[2]),
                core::ascii::escape_default(b[3])
            ))
            .finish()
    }
}
