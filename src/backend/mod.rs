//! Platform memory-acquisition backends.
//!
//! A backend is the pair of capabilities the pipeline needs from the OS:
//! enumerate the candidate regions of a foreign process, and read bytes out
//! of it. Each supported kernel provides one implementation; the selector
//! hands the pipeline the right one for the running OS, or a clean
//! [`Unsupported`](ExtractError::Unsupported) failure.

use crate::error::{ExtractError, ExtractResult};
use crate::region::{MemoryRegion, RegionBuffer};

#[cfg(target_os = "macos")]
pub mod mach;
#[cfg(target_os = "linux")]
pub mod procfs;

/// Attempts for a region read before the region is given up on.
pub(crate) const READ_ATTEMPTS: usize = 3;

/// Byte source over a foreign process, opened once per extraction.
///
/// Implementations are shared read-only across every scan worker.
pub trait RegionReader: Send + Sync {
    /// Snapshot one region into an owned buffer.
    ///
    /// The snapshot is not atomic across the region; short reads are
    /// retried up to [`READ_ATTEMPTS`] times before the region is reported
    /// failed.
    fn read_region(&self, region: &MemoryRegion) -> ExtractResult<RegionBuffer>;

    /// Read `len` bytes at an arbitrary address in the target, regardless
    /// of any previously enumerated region.
    fn point_read(&self, addr: u64, len: usize) -> ExtractResult<Vec<u8>>;
}

/// One OS's enumerator/reader pair.
pub trait MemoryBackend: Send + Sync {
    /// Short name for log events.
    fn name(&self) -> &'static str;

    /// Cheap liveness check for the target pid.
    fn probe(&self, pid: u32) -> ExtractResult<()>;

    /// Candidate regions of the target, already filtered through
    /// [`filter_candidate_regions`](crate::region::filter_candidate_regions),
    /// in OS report order.
    fn enumerate(&self, pid: u32) -> ExtractResult<Vec<MemoryRegion>>;

    /// Open the byte source for one extraction run.
    fn open_reader(&self, pid: u32) -> ExtractResult<Box<dyn RegionReader>>;
}

/// Stub backend for platforms without an implementation.
pub struct UnsupportedBackend;

impl MemoryBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn probe(&self, _pid: u32) -> ExtractResult<()> {
        Err(ExtractError::Unsupported)
    }

    fn enumerate(&self, _pid: u32) -> ExtractResult<Vec<MemoryRegion>> {
        Err(ExtractError::Unsupported)
    }

    fn open_reader(&self, _pid: u32) -> ExtractResult<Box<dyn RegionReader>> {
        Err(ExtractError::Unsupported)
    }
}

/// Pick the backend for the running OS.
pub fn select_backend() -> ExtractResult<Box<dyn MemoryBackend>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(procfs::ProcfsBackend::new()))
    }
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(mach::MachBackend::new()))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(ExtractError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_stub_fails_every_operation() {
        let backend = UnsupportedBackend;
        assert!(matches!(backend.probe(1), Err(ExtractError::Unsupported)));
        assert!(matches!(backend.enumerate(1), Err(ExtractError::Unsupported)));
        assert!(backend.open_reader(1).is_err());
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_selector_finds_a_backend() {
        assert!(select_backend().is_ok());
    }
}
