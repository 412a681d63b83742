//! The canonical bricked multi-resolution container (UVF)
//!
//! A UVF file is a header, a sequence of block payloads and a trailing
//! table of contents:
//!
//! ```text
//! [0..4)   magic "UVF\0"
//! [4..8)   version (major u16 LE, minor u16 LE)
//! [8..16)  TOC offset (u64 LE, patched on finalize)
//! [16..)   brick payloads and data block payloads
//! [toc..)  metadata JSON (u64 LE length prefix) + bincode TOC
//! ```
//!
//! Raster bricks are compressed through [`crate::codec::BrickCodec`] and
//! checksummed individually. The TOC carries the brick index plus entries
//! for the min/max, histogram and geometry blocks.

mod blocks;
mod metadata;
mod reader;
mod writer;

pub use blocks::{BlockSemantic, GeometryBlock, Histogram1D, Histogram2D, MaxMinBlock};
pub use metadata::{UvfMetadata, UvfVersion};
pub use reader::UvfDataset;
pub use writer::UvfBuilder;

/// Magic number identifying a UVF file
pub const UVF_MAGIC: &[u8; 4] = b"UVF\0";
