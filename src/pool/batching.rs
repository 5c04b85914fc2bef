//! Dynamic batch sizing from memory headroom
//!
//! Plenty of free memory → `max_batch_size`; scarce memory → `min_batch_size`;
//! linear in between.

use std::sync::Mutex;
use sysinfo::System;

/// Below this much available memory batches shrink to the minimum size
const LOW_WATERMARK_BYTES: u64 = 512 * 1024 * 1024;

/// At or above this much available memory batches use the maximum size
const HIGH_WATERMARK_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Source of memory readings
pub trait MemoryProbe: Send + Sync {
    /// Bytes of memory currently available to new allocations
    fn available_bytes(&self) -> Option<u64>;

    /// Bytes of memory currently in use
    fn used_bytes(&self) -> Option<u64>;
}

/// Memory probe backed by `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn read<F: FnOnce(&System) -> u64>(&self, f: F) -> Option<u64> {
        let mut sys = self.system.lock().ok()?;
        sys.refresh_memory();
        match f(&sys) {
            0 => None,
            bytes => Some(bytes),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn available_bytes(&self) -> Option<u64> {
        self.read(|sys| sys.available_memory())
    }

    fn used_bytes(&self) -> Option<u64> {
        self.read(|sys| sys.used_memory())
    }
}

/// Probe reporting a fixed reading
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub Option<u64>);

impl MemoryProbe for FixedProbe {
    fn available_bytes(&self) -> Option<u64> {
        self.0
    }

    fn used_bytes(&self) -> Option<u64> {
        None
    }
}

/// Picks the number of texts per batch
#[derive(Debug, Clone, Copy)]
pub struct BatchSizer {
    min: usize,
    max: usize,
}

impl BatchSizer {
    pub fn new(min: usize, max: usize) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Batch size for the given memory headroom
    ///
    /// An unknown reading falls back to the midpoint.
    pub fn size_for(&self, available_bytes: Option<u64>) -> usize {
        let Some(available) = available_bytes else {
            return self.min + (self.max - self.min) / 2;
        };

        if available <= LOW_WATERMARK_BYTES {
            return self.min;
        }
        if available >= HIGH_WATERMARK_BYTES {
            return self.max;
        }

        let span = (HIGH_WATERMARK_BYTES - LOW_WATERMARK_BYTES) as f64;
        let fraction = (available - LOW_WATERMARK_BYTES) as f64 / span;
        self.min + ((self.max - self.min) as f64 * fraction).round() as usize
    }

    /// Batch size for the probe's current reading
    pub fn size_from(&self, probe: &dyn MemoryProbe) -> usize {
        self.size_for(probe.available_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        let sizer = BatchSizer::new(8, 64);

        assert_eq!(sizer.size_for(Some(0)), 8);
        assert_eq!(sizer.size_for(Some(LOW_WATERMARK_BYTES)), 8);
        assert_eq!(sizer.size_for(Some(HIGH_WATERMARK_BYTES)), 64);
        assert_eq!(sizer.size_for(Some(u64::MAX)), 64);
        assert_eq!(sizer.size_for(None), 36);
    }

    #[test]
    fn test_monotonic_in_headroom() {
        let sizer = BatchSizer::new(8, 64);
        let mut last = 0;
        for gb in 0..6u64 {
            let size = sizer.size_for(Some(gb * 1024 * 1024 * 1024));
            assert!(size >= last);
            assert!((8..=64).contains(&size));
            last = size;
        }
    }

    #[test]
    fn test_fixed_size() {
        let sizer = BatchSizer::new(13, 13);
        assert_eq!(sizer.size_from(&FixedProbe(None)), 13);
        assert_eq!(sizer.size_from(&FixedProbe(Some(1))), 13);
    }

    #[test]
    fn test_degenerate_bounds() {
        let sizer = BatchSizer::new(0, 0);
        assert_eq!(sizer.size_for(Some(0)), 1);

        let sizer = BatchSizer::new(32, 4);
        assert_eq!(sizer.size_for(Some(u64::MAX)), 32);
    }

    #[test]
    fn test_sysinfo_probe_reads() {
        let probe = SysinfoProbe::new();
        if let Some(bytes) = probe.available_bytes() {
            assert!(bytes > 0);
        }
    }
}
