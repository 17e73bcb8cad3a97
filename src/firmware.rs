//! Firmware blob parsing.
//!
//! A blob is a [`FirmwareHeader`] followed by `num_images` images, each one a
//! `{type: u32, len: u32}` sub-header and `len` bytes of data. Everything is
//! little endian. Parsing borrows from the blob, nothing is copied until the
//! chunks are written to the device.

use core::fmt::Write as _;

use crate::error::{FwError, HeaderField};
use crate::regs::*;
use crate::Processor;

pub const FW_SIGNATURE: u32 = 0xDEAD_1EAF;
pub const FW_NUM_IMAGES: u32 = 4;

pub const FW_VERSION_FAMILY: u8 = 1;
pub const FW_VERSION_MAJOR: u8 = 1;
pub const FW_VERSION_MINOR: u8 = 2;
pub const FW_VERSION_PATCH: u8 = 39;

/// Build variant bits in [`FirmwareHeader::feature_flags`].
pub mod feature_flags {
    pub const SYSTEM: u32 = 1 << 0;
    pub const RADIO_TEST: u32 = 1 << 1;
    pub const SCAN_ONLY: u32 = 1 << 2;
    pub const SYSTEM_WITH_RAW_MODES: u32 = 1 << 3;
}

/// The variant this crate was built for. The blob must advertise it.
#[cfg(feature = "radio-test")]
pub const BUILD_FEATURE: u32 = feature_flags::RADIO_TEST;
#[cfg(all(feature = "scan-only", not(feature = "radio-test")))]
pub const BUILD_FEATURE: u32 = feature_flags::SCAN_ONLY;
#[cfg(all(feature = "raw-modes", not(any(feature = "radio-test", feature = "scan-only"))))]
pub const BUILD_FEATURE: u32 = feature_flags::SYSTEM_WITH_RAW_MODES;
#[cfg(not(any(feature = "radio-test", feature = "scan-only", feature = "raw-modes")))]
pub const BUILD_FEATURE: u32 = feature_flags::SYSTEM;

/// Patch images are written to the device in pieces of this size.
pub const FW_CHUNK_SIZE: usize = 1024;

const IMAGE_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FirmwareHeader {
    pub signature: u32,
    pub num_images: u32,
    pub version: u32,
    pub feature_flags: u32,
}

impl FirmwareHeader {
    pub const SIZE: usize = 16;

    pub const fn version(family: u8, major: u8, minor: u8, patch: u8) -> u32 {
        (family as u32) << 24 | (major as u32) << 16 | (minor as u32) << 8 | patch as u32
    }

    pub fn family(&self) -> u8 {
        (self.version >> 24) as u8
    }

    pub fn major(&self) -> u8 {
        (self.version >> 16) as u8
    }

    pub fn minor(&self) -> u8 {
        (self.version >> 8) as u8
    }

    pub fn patch(&self) -> u8 {
        self.version as u8
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        out[0..4].copy_from_slice(&self.signature.to_le_bytes());
        out[4..8].copy_from_slice(&self.num_images.to_le_bytes());
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..16].copy_from_slice(&self.feature_flags.to_le_bytes());
        out
    }
}

/// Parses the blob header and checks it against what this build expects.
///
/// The first mismatching field is reported, in header order.
pub fn validate_header(blob: &[u8]) -> Result<FirmwareHeader, FwError> {
    let word = |i: usize| read_u32(blob, i * 4).ok_or(FwError::TooShort);
    let header = FirmwareHeader {
        signature: word(0)?,
        num_images: word(1)?,
        version: word(2)?,
        feature_flags: word(3)?,
    };

    let checks = [
        (header.signature == FW_SIGNATURE, HeaderField::Signature),
        (header.num_images == FW_NUM_IMAGES, HeaderField::ImageCount),
        (header.family() == FW_VERSION_FAMILY, HeaderField::Family),
        (header.major() == FW_VERSION_MAJOR, HeaderField::Major),
        (header.minor() == FW_VERSION_MINOR, HeaderField::Minor),
        (header.patch() == FW_VERSION_PATCH, HeaderField::Patch),
        (header.feature_flags & BUILD_FEATURE != 0, HeaderField::FeatureFlags),
    ];
    if let Some((_, field)) = checks.into_iter().find(|(ok, _)| !ok) {
        return Err(FwError::InvalidHeader(field));
    }

    Ok(header)
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageType {
    UmacPri = 0,
    UmacSec = 1,
    LmacPri = 2,
    LmacSec = 3,
}

impl ImageType {
    pub fn processor(self) -> Processor {
        match self {
            ImageType::UmacPri | ImageType::UmacSec => Processor::Umac,
            ImageType::LmacPri | ImageType::LmacSec => Processor::Lmac,
        }
    }

    /// Where the image lives in the processor's retained RAM.
    pub fn dest_addr(self) -> u32 {
        match self {
            ImageType::UmacPri => RPU_MEM_UMAC_PATCH_PRI,
            ImageType::UmacSec => RPU_MEM_UMAC_PATCH_SEC,
            ImageType::LmacPri => RPU_MEM_LMAC_PATCH_PRI,
            ImageType::LmacSec => RPU_MEM_LMAC_PATCH_SEC,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ImageType::UmacPri => "umac-pri",
            ImageType::UmacSec => "umac-sec",
            ImageType::LmacPri => "lmac-pri",
            ImageType::LmacSec => "lmac-sec",
        }
    }
}

impl TryFrom<u32> for ImageType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            0 => Ok(ImageType::UmacPri),
            1 => Ok(ImageType::UmacSec),
            2 => Ok(ImageType::LmacPri),
            3 => Ok(ImageType::LmacSec),
            other => Err(other),
        }
    }
}

/// Primary and secondary patch of one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchPair<'a> {
    pub pri: &'a [u8],
    pub sec: &'a [u8],
}

/// The images found in a blob, by type. Missing images are empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirmwareImageSet<'a> {
    images: [&'a [u8]; 4],
}

impl<'a> FirmwareImageSet<'a> {
    pub fn image(&self, image_type: ImageType) -> &'a [u8] {
        self.images[image_type as usize]
    }

    /// Both patches of `processor`, or `None` if either one is missing.
    pub fn pair(&self, processor: Processor) -> Option<PatchPair<'a>> {
        let [pri, sec] = patch_types(processor);
        let pri = self.image(pri);
        let sec = self.image(sec);
        (!pri.is_empty() && !sec.is_empty()).then_some(PatchPair { pri, sec })
    }
}

/// Primary and secondary image type of `processor`, in load order.
pub fn patch_types(processor: Processor) -> [ImageType; 2] {
    match processor {
        Processor::Lmac => [ImageType::LmacPri, ImageType::LmacSec],
        Processor::Umac => [ImageType::UmacPri, ImageType::UmacSec],
    }
}

/// Walks the image sub-headers following a validated header.
///
/// A later image with the same type replaces an earlier one.
pub fn extract_images<'a>(blob: &'a [u8], header: &FirmwareHeader) -> Result<FirmwareImageSet<'a>, FwError> {
    let mut set = FirmwareImageSet::default();
    let mut offset = FirmwareHeader::SIZE;

    for index in 0..header.num_images {
        let truncated = FwError::Truncated { index };
        let image_type = read_u32(blob, offset).ok_or(truncated)?;
        let len = read_u32(blob, offset + 4).ok_or(truncated)? as usize;

        let start = offset + IMAGE_HEADER_SIZE;
        let end = start.checked_add(len).ok_or(truncated)?;
        let data = blob.get(start..end).ok_or(truncated)?;

        let ty = ImageType::try_from(image_type).map_err(|image_type| FwError::UnknownImageType { index, image_type })?;
        trace!("image {}: {:?} len={}", index, ty, len);
        set.images[ty as usize] = data;

        offset = end;
    }

    Ok(set)
}

/// Room for the longest image name, a dot and any `usize` index.
const CHUNK_ID_LEN: usize = 32;

/// A piece of a patch image on its way to device memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareChunk<'a> {
    pub id: heapless::String<CHUNK_ID_LEN>,
    pub data: &'a [u8],
    pub dest_addr: u32,
}

impl<'a> FirmwareChunk<'a> {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Splits an image into [`FW_CHUNK_SIZE`] chunks addressed from the image's
/// destination.
pub fn image_chunks(image_type: ImageType, image: &[u8]) -> impl Iterator<Item = FirmwareChunk<'_>> {
    image.chunks(FW_CHUNK_SIZE).enumerate().map(move |(i, data)| {
        let mut id = heapless::String::new();
        unwrap!(write!(id, "{}.{}", image_type.name(), i).ok());
        FirmwareChunk {
            id,
            data,
            dest_addr: image_type.dest_addr() + (i * FW_CHUNK_SIZE) as u32,
        }
    })
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let b = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
