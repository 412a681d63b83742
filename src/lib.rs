//! uvfio - I/O manager and conversion pipeline for bricked volume data
//!
//! Normalizes heterogeneous 3D scalar-volume formats (DICOM series, image
//! stacks, NRRD, Analyze, BOV, QVIS and anything a registered plugin can
//! read) into a canonical bricked multi-resolution container (UVF), and
//! exports back to native formats.
//!
//! # Features
//!
//! - Open-ended converter registry with content sniffing over the first
//!   512 bytes plus a fallback "final" converter
//! - Staged conversion: source, raw intermediate, bricked multi-LOD UVF
//!   with per-brick min/max and 1D/2D histograms
//! - Directory scanning into DICOM and image slice stacks
//! - N-way merging of co-dimensional volumes (additive or max mode)
//! - Isosurface extraction through a marching-cubes kernel into mesh files
//! - Voxel-wise expression evaluation across co-registered volumes
//!
//! # Example
//!
//! ```rust,ignore
//! use uvfio::IoManager;
//!
//! let manager = IoManager::new();
//! manager.convert_file(
//!     "scan.nrrd".as_ref(),
//!     "scan.uvf".as_ref(),
//!     "/tmp".as_ref(),
//!     true,
//!     uvfio::DEFAULT_MAX_BRICK_SIZE,
//!     uvfio::DEFAULT_BRICK_OVERLAP,
//!     false,
//! )?;
//! ```
//!
//! The pipeline is single-threaded and synchronous: long operations block
//! and report progress through `tracing`.

pub mod builder;
pub mod codec;
pub mod converter;
pub mod error;
pub mod evaluator;
pub mod expr;
pub mod formats;
pub mod geometry;
pub mod iso;
pub mod layout;
pub mod manager;
pub mod merge;
pub mod stack;
pub mod stats;
pub mod types;
pub mod util;
pub mod uvf;

// Re-exports
pub use builder::{raw_to_uvf, BrickingParams};
pub use codec::BrickCodec;
pub use converter::{RangeInfo, RawSource, ValueClass, VolumeConverter};
pub use error::{Error, Result};
pub use geometry::{Mesh, MeshConverter};
pub use layout::BrickLayout;
pub use manager::{FileBackedDataset, IoManager, DEFAULT_BRICK_OVERLAP, DEFAULT_MAX_BRICK_SIZE};
pub use stack::{StackDescriptor, StackElement, StackFileType};
pub use types::{BrickKey, BrickStats, DataType, ValueRange, ValueSemantic, VolumeMeta};
pub use uvf::{UvfDataset, UvfMetadata, UVF_MAGIC};

/// Version of this crate
pub const UVFIO_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!UVFIO_VERSION.is_empty());
    }
}
