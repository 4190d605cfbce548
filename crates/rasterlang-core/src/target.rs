//! Compilation target descriptor consumed by the lowering passes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::stmt::DeviceApi;

/// Feature flags the lowering core reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Feature {
    /// Omit every runtime assertion block.
    NoAsserts,
    /// Omit the bounds-query (inference mode) wrapper.
    NoBoundsQuery,
    /// Allow buffers larger than 2^31-1 bytes per dimension.
    LargeBuffers,
    /// Annotate extern-stage buffers for MemorySanitizer.
    Msan,
    /// Thread-sanitizer-friendly schedule warnings.
    Tsan,
    Cuda,
    OpenCl,
    Metal,
    Vulkan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Os {
    Linux,
    Windows,
    MacOs,
    Android,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arch {
    X86,
    Arm,
    RiscV,
    Wasm,
    Unknown,
}

/// A target triple plus feature set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Pointer width: 32 or 64.
    pub bits: u8,
    pub os: Os,
    pub arch: Arch,
    pub features: BTreeSet<Feature>,
}

impl Target {
    /// 64-bit host target with no features.
    pub fn host() -> Target {
        Target {
            bits: 64,
            os: Os::Linux,
            arch: Arch::X86,
            features: BTreeSet::new(),
        }
    }

    pub fn with_feature(mut self, f: Feature) -> Target {
        self.features.insert(f);
        self
    }

    pub fn has_feature(&self, f: Feature) -> bool {
        self.features.contains(&f)
    }

    /// The largest per-dimension buffer size the generated checks allow.
    pub fn maximum_buffer_size(&self) -> u64 {
        if self.bits == 64 && self.has_feature(Feature::LargeBuffers) {
            i64::MAX as u64
        } else {
            i32::MAX as u64
        }
    }

    /// Whether a schedule may place loops on the given device.
    pub fn supports_device_api(&self, api: DeviceApi) -> bool {
        match api {
            DeviceApi::None | DeviceApi::Host => true,
            DeviceApi::Cuda => self.has_feature(Feature::Cuda),
            DeviceApi::OpenCl => self.has_feature(Feature::OpenCl),
            DeviceApi::Metal => self.has_feature(Feature::Metal),
            DeviceApi::Vulkan => self.has_feature(Feature::Vulkan),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_size_limits() {
        let host = Target::host();
        assert_eq!(host.maximum_buffer_size(), i32::MAX as u64);
        let large = Target::host().with_feature(Feature::LargeBuffers);
        assert_eq!(large.maximum_buffer_size(), i64::MAX as u64);
        let mut t32 = Target::host();
        t32.bits = 32;
        let t32 = t32.with_feature(Feature::LargeBuffers);
        assert_eq!(t32.maximum_buffer_size(), i32::MAX as u64);
    }

    #[test]
    fn device_api_requires_feature() {
        let host = Target::host();
        assert!(host.supports_device_api(DeviceApi::Host));
        assert!(!host.supports_device_api(DeviceApi::Cuda));
        assert!(Target::host()
            .with_feature(Feature::Cuda)
            .supports_device_api(DeviceApi::Cuda));
    }

    #[test]
    fn serde_roundtrip() {
        let t = Target::host()
            .with_feature(Feature::NoAsserts)
            .with_feature(Feature::LargeBuffers);
        let json = serde_json::to_string(&t).unwrap();
        let back: Target = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }
}
