//! Linux backend: `/proc/<pid>/maps` enumeration and `/proc/<pid>/mem` reads.
//!
//! The maps file is parsed line by line (`start-end perms offset dev inode
//! pathname`) and classified by pathname. Region bytes come from positioned
//! reads on the mem file, which is opened once per extraction and shared by
//! every worker behind a read-write lock; positioned reads do not move the
//! file cursor, so readers never contend on anything but the lock itself.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::RwLock;

use crate::backend::{MemoryBackend, RegionReader, READ_ATTEMPTS};
use crate::error::{ExtractError, ExtractResult};
use crate::region::{filter_candidate_regions, MemoryRegion, Protection, RegionBuffer, RegionClass};

pub struct ProcfsBackend;

impl ProcfsBackend {
    pub fn new() -> Self {
        ProcfsBackend
    }
}

impl Default for ProcfsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend for ProcfsBackend {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn probe(&self, pid: u32) -> ExtractResult<()> {
        if Path::new(&format!("/proc/{pid}")).is_dir() {
            Ok(())
        } else {
            Err(ExtractError::TargetOffline)
        }
    }

    fn enumerate(&self, pid: u32) -> ExtractResult<Vec<MemoryRegion>> {
        let text = std::fs::read_to_string(format!("/proc/{pid}/maps"))
            .map_err(|e| classify_io(&e, "read memory map"))?;
        Ok(filter_candidate_regions(parse_maps(&text)))
    }

    fn open_reader(&self, pid: u32) -> ExtractResult<Box<dyn RegionReader>> {
        let mem = File::open(format!("/proc/{pid}/mem"))
            .map_err(|e| classify_io(&e, "open memory file"))?;
        Ok(Box::new(ProcfsReader { mem: RwLock::new(mem) }))
    }
}

/// Positioned-read byte source over `/proc/<pid>/mem`.
pub struct ProcfsReader {
    mem: RwLock<File>,
}

impl ProcfsReader {
    /// Fill `buf` from `offset`, looping over short reads. Returns the byte
    /// count actually read; a hole in the mapping surfaces as an error or a
    /// short count from the kernel.
    fn read_full_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let file = self.mem.read();
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl RegionReader for ProcfsReader {
    fn read_region(&self, region: &MemoryRegion) -> ExtractResult<RegionBuffer> {
        let len = region.size() as usize;
        let mut data = vec![0u8; len];
        let mut last_short = 0;
        for _ in 0..READ_ATTEMPTS {
            match self.read_full_at(&mut data, region.start) {
                Ok(n) if n == len => {
                    return Ok(RegionBuffer { start: region.start, class: region.class, data })
                }
                Ok(n) => last_short = n,
                Err(e) => return Err(classify_io(&e, &format!(
                    "read region {:#x}-{:#x}",
                    region.start, region.end
                ))),
            }
        }
        Err(ExtractError::internal(format!(
            "short read of region {:#x}-{:#x}: {last_short} of {len} bytes",
            region.start, region.end
        )))
    }

    fn point_read(&self, addr: u64, len: usize) -> ExtractResult<Vec<u8>> {
        let mut data = vec![0u8; len];
        let n = self
            .read_full_at(&mut data, addr)
            .map_err(|e| classify_io(&e, &format!("read {len} bytes at {addr:#x}")))?;
        if n == len {
            Ok(data)
        } else {
            Err(ExtractError::internal(format!(
                "short read at {addr:#x}: {n} of {len} bytes"
            )))
        }
    }
}

fn classify_io(err: &io::Error, what: &str) -> ExtractError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ExtractError::PermissionDenied,
        io::ErrorKind::NotFound => ExtractError::ProcessGone,
        // ESRCH from a mem read means the process died under us.
        _ if err.raw_os_error() == Some(3) => ExtractError::ProcessGone,
        _ => ExtractError::internal(format!("{what}: {err}")),
    }
}

/// Parse the full text of a maps file. Malformed lines are skipped.
fn parse_maps(text: &str) -> Vec<MemoryRegion> {
    text.lines().filter_map(parse_maps_line).collect()
}

fn parse_maps_line(line: &str) -> Option<MemoryRegion> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }

    let (start, end) = fields[0].split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    if end < start {
        return None;
    }

    let perms = Protection {
        read: fields[1].contains('r'),
        write: fields[1].contains('w'),
        execute: fields[1].contains('x'),
    };

    let pathname = if fields.len() > 5 { fields[5..].join(" ") } else { String::new() };
    let class = classify_pathname(&pathname);
    let label = if pathname.is_empty() { None } else { Some(pathname) };

    Some(MemoryRegion { start, end, perms, class, label })
}

fn classify_pathname(pathname: &str) -> RegionClass {
    if pathname.is_empty() {
        RegionClass::Anonymous
    } else if pathname.starts_with("[heap]") {
        RegionClass::Heap
    } else if pathname.starts_with("[stack") {
        RegionClass::Stack
    } else if pathname.contains(".so") {
        RegionClass::Library
    } else if pathname.starts_with('[') {
        // [vdso], [vvar], [vsyscall] and friends.
        RegionClass::Other
    } else {
        RegionClass::MappedFile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MAPS: &str = "\
55f4c0a00000-55f4c0b00000 r--p 00000000 08:01 1048576 /usr/bin/client
55f4c2000000-55f4c2200000 rw-p 00000000 00:00 0 [heap]
7f2a40000000-7f2a40400000 rw-p 00000000 00:00 0
7f2a41000000-7f2a41200000 rw-p 00000000 08:01 22222 /usr/lib/libssl.so.3
7f2a42000000-7f2a42300000 rw-p 00000000 08:01 33333 /var/cache/client/blob store.bin
7ffd11000000-7ffd11200000 rw-p 00000000 00:00 0 [stack]
7ffd11fd9000-7ffd11fdd000 r--p 00000000 00:00 0 [vvar]
garbage line that should be skipped
";

    #[test]
    fn test_parse_maps_classification() {
        let regions = parse_maps(SAMPLE_MAPS);
        assert_eq!(regions.len(), 7);
        assert_eq!(regions[0].class, RegionClass::MappedFile);
        assert_eq!(regions[1].class, RegionClass::Heap);
        assert_eq!(regions[2].class, RegionClass::Anonymous);
        assert_eq!(regions[3].class, RegionClass::Library);
        assert_eq!(regions[4].class, RegionClass::MappedFile);
        assert_eq!(regions[5].class, RegionClass::Stack);
        assert_eq!(regions[6].class, RegionClass::Other);
    }

    #[test]
    fn test_parse_maps_line_fields() {
        let region = parse_maps_line(
            "55f4c2000000-55f4c2200000 rw-p 00000000 00:00 0 [heap]",
        )
        .unwrap();
        assert_eq!(region.start, 0x55f4c2000000);
        assert_eq!(region.end, 0x55f4c2200000);
        assert_eq!(region.size(), 0x200000);
        assert!(region.perms.is_read_write());
        assert!(!region.perms.execute);
        assert_eq!(region.label.as_deref(), Some("[heap]"));
    }

    #[test]
    fn test_pathname_with_spaces_is_kept() {
        let region = parse_maps_line(
            "7f2a42000000-7f2a42300000 rw-p 00000000 08:01 33333 /var/cache/client/blob store.bin",
        )
        .unwrap();
        assert_eq!(region.label.as_deref(), Some("/var/cache/client/blob store.bin"));
    }

    #[test]
    fn test_malformed_lines_skipped() {
        assert!(parse_maps_line("").is_none());
        assert!(parse_maps_line("not-a-range rw-p 0 0 0").is_none());
        assert!(parse_maps_line("55f4-55f0 rw-p 00000000 00:00 0").is_none());
    }

    #[test]
    fn test_enumerate_applies_selection_rules() {
        // Only the heap, the anonymous mapping, and the writable file
        // mapping survive: big enough, rw, candidate class.
        let regions = filter_candidate_regions(parse_maps(SAMPLE_MAPS));
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].class, RegionClass::Heap);
        assert_eq!(regions[1].class, RegionClass::Anonymous);
        assert_eq!(regions[2].class, RegionClass::MappedFile);
    }

    #[test]
    fn test_probe_self_and_missing() {
        let backend = ProcfsBackend::new();
        assert!(backend.probe(std::process::id()).is_ok());
        assert!(matches!(backend.probe(u32::MAX - 1), Err(ExtractError::TargetOffline)));
    }

    #[test]
    fn test_point_read_own_memory() {
        let backend = ProcfsBackend::new();
        let reader = backend.open_reader(std::process::id()).unwrap();

        let local = vec![0xA5u8; 64];
        let got = reader.point_read(local.as_ptr() as u64, 32).unwrap();
        assert_eq!(got, vec![0xA5u8; 32]);
    }

    #[test]
    fn test_enumerate_own_process() {
        let backend = ProcfsBackend::new();
        let regions = backend.enumerate(std::process::id()).unwrap();
        for region in &regions {
            assert!(region.perms.is_read_write());
            assert!(region.size() >= crate::region::MIN_REGION_SIZE);
        }
    }
}
