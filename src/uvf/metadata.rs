//! Container metadata, stored as JSON inside the file

use crate::codec::BrickCodec;
use crate::layout::BrickLayout;
use crate::types::{ValueRange, VolumeMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Container format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UvfVersion {
    pub major: u16,
    pub minor: u16,
}

impl UvfVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for UvfVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Complete metadata for a UVF volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UvfMetadata {
    /// Format version
    pub version: UvfVersion,

    /// Volume description (type, components, domain, aspect, provenance).
    /// Stored data is always in host byte order, so `swap_endian` is false.
    pub volume: VolumeMeta,

    /// Bricking scheme across all LODs
    pub layout: BrickLayout,

    /// Codec applied to every brick payload
    pub codec: BrickCodec,

    /// Scalar value range of the finest LOD
    pub value_range: ValueRange,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub modified_at: DateTime<Utc>,

    /// Custom key-value pairs
    pub custom: HashMap<String, String>,
}

impl UvfMetadata {
    pub fn new(volume: VolumeMeta, layout: BrickLayout) -> Self {
        let now = Utc::now();
        Self {
            version: UvfVersion::default(),
            volume,
            layout,
            codec: BrickCodec::default(),
            value_range: ValueRange::new(0.0, 0.0),
            created_at: now,
            modified_at: now,
            custom: HashMap::new(),
        }
    }

    pub fn with_codec(mut self, codec: BrickCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_value_range(mut self, range: ValueRange) -> Self {
        self.value_range = range;
        self
    }

    pub fn insert_custom(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom.insert(key.into(), value.into());
    }

    pub fn get_custom(&self, key: &str) -> Option<&str> {
        self.custom.get(key).map(|s| s.as_str())
    }

    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_version_compatibility() {
        let v1_0 = UvfVersion::new(1, 0);
        let v1_1 = UvfVersion::new(1, 1);
        let v2_0 = UvfVersion::new(2, 0);

        assert!(v1_0.is_compatible(&v1_1));
        assert!(!v1_0.is_compatible(&v2_0));
    }

    #[test]
    fn test_metadata_json_round_trip() {
        let volume = VolumeMeta::new(DataType::U16, 1, [64, 64, 32]);
        let layout = BrickLayout::new([64, 64, 32], 36, 2).unwrap();
        let mut md = UvfMetadata::new(volume, layout)
            .with_codec(BrickCodec::Deflate)
            .with_value_range(ValueRange::new(0.0, 4095.0));
        md.insert_custom("modality", "CT");

        let json = serde_json::to_vec(&md).unwrap();
        let back: UvfMetadata = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.volume, md.volume);
        assert_eq!(back.codec, BrickCodec::Deflate);
        assert_eq!(back.get_custom("modality"), Some("CT"));
    }
}
