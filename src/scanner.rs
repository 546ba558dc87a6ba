//! Candidate discovery inside acquired region buffers.
//!
//! The client's key-holding structure leaves a recognisable footprint in
//! memory: three little-endian 64-bit words `{0, 32, 47}` immediately after
//! a pointer to the 32-byte key itself. [`PointerScan`] walks a buffer from
//! the end toward the beginning looking for that 24-byte anchor and yields
//! the pointer stored in the 8 bytes before each match. Key material is
//! empirically found in later allocations, hence the reverse sweep.
//!
//! [`OffsetProbe`] is the fallback for builds of the client that keep the
//! key inline near its SQL text: it anchors on the `" fts5(%"` string and
//! probes a fixed table of displacements around each match.

use memchr::memmem;

use crate::region::RegionBuffer;
use crate::validator::KEY_SIZE;

/// Footprint of the key-holding structure: LE64 words {0, 32, 47}.
pub const KEY_ANCHOR: [u8; 24] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x2F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Width of the pointer stored immediately before the anchor.
const PTR_SIZE: usize = 8;

/// User-space pointer window; anything outside is noise, not a key address.
const PTR_MIN: u64 = 0x10000;
const PTR_MAX: u64 = 0x7FFF_FFFF_FFFF;

/// Back-to-front sweep for anchor matches with a plausible key pointer.
///
/// Yields `(match_offset, pointer)` pairs lazily, latest match first.
/// Matches with fewer than 8 preceding bytes and pointers outside the
/// user-space window are dropped here; everything else is for the caller
/// to resolve and validate.
pub struct PointerScan<'a> {
    data: &'a [u8],
    finder: memmem::FinderRev<'static>,
    /// Length of the prefix still to be searched.
    end: usize,
}

impl<'a> PointerScan<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PointerScan {
            data,
            finder: memmem::FinderRev::new(&KEY_ANCHOR),
            end: data.len(),
        }
    }
}

impl Iterator for PointerScan<'_> {
    type Item = (usize, u64);

    fn next(&mut self) -> Option<Self::Item> {
        while self.end >= KEY_ANCHOR.len() {
            let pos = self.finder.rfind(&self.data[..self.end])?;

            // Next round: allow matches overlapping this one, starting at
            // most one byte earlier.
            self.end = pos + KEY_ANCHOR.len() - 1;

            if pos < PTR_SIZE {
                continue;
            }
            let mut ptr_bytes = [0u8; PTR_SIZE];
            ptr_bytes.copy_from_slice(&self.data[pos - PTR_SIZE..pos]);
            let ptr = u64::from_le_bytes(ptr_bytes);
            if ptr > PTR_MIN && ptr < PTR_MAX {
                return Some((pos, ptr));
            }
        }
        None
    }
}

/// Anchor of the fallback strategy: `" fts5(%"` with its terminator, part
/// of the SQL text the client keeps adjacent to the key in some builds.
pub const TEXT_ANCHOR: [u8; 8] = [0x20, 0x66, 0x74, 0x73, 0x35, 0x28, 0x25, 0x00];

/// Displacements (relative to a text-anchor match) at which the key has
/// been observed inline.
pub const PROBE_OFFSETS: [i64; 6] = [16, -80, 64, -16, 32, -32];

/// Forward sweep yielding in-buffer key windows near each text-anchor hit.
///
/// Unlike [`PointerScan`] this never leaves the buffer: each yielded item
/// is `(window_offset, key_bytes)` taken straight from the snapshot.
pub struct OffsetProbe<'a> {
    data: &'a [u8],
    matches: Vec<usize>,
    match_idx: usize,
    offset_idx: usize,
}

impl<'a> OffsetProbe<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let matches = memmem::find_iter(data, &TEXT_ANCHOR).collect();
        OffsetProbe { data, matches, match_idx: 0, offset_idx: 0 }
    }
}

impl Iterator for OffsetProbe<'_> {
    type Item = (usize, [u8; KEY_SIZE]);

    fn next(&mut self) -> Option<Self::Item> {
        while self.match_idx < self.matches.len() {
            while self.offset_idx < PROBE_OFFSETS.len() {
                let base = self.matches[self.match_idx] as i64;
                let displacement = PROBE_OFFSETS[self.offset_idx];
                self.offset_idx += 1;

                let at = base + displacement;
                if at < 0 {
                    continue;
                }
                let at = at as usize;
                if let Some(window) = self.data.get(at..at + KEY_SIZE) {
                    let mut key = [0u8; KEY_SIZE];
                    key.copy_from_slice(window);
                    return Some((at, key));
                }
            }
            self.match_idx += 1;
            self.offset_idx = 0;
        }
        None
    }
}

/// Resolve a candidate pointer against the buffer it was found in.
///
/// Returns the in-buffer key window when the pointer lands inside the
/// snapshotted range; the caller falls back to a point-read otherwise.
pub fn resolve_in_buffer(buf: &RegionBuffer, ptr: u64) -> Option<[u8; KEY_SIZE]> {
    buf.window_at(ptr, KEY_SIZE).map(|window| {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(window);
        key
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionClass;

    /// Plant the anchor (preceded by `ptr` as LE64) at `at`.
    fn plant(data: &mut [u8], at: usize, ptr: u64) {
        data[at - PTR_SIZE..at].copy_from_slice(&ptr.to_le_bytes());
        data[at..at + KEY_ANCHOR.len()].copy_from_slice(&KEY_ANCHOR);
    }

    #[test]
    fn test_pointer_scan_finds_match() {
        let mut data = vec![0xFFu8; 4096];
        plant(&mut data, 1000, 0x7F00_0000);
        let hits: Vec<_> = PointerScan::new(&data).collect();
        assert_eq!(hits, vec![(1000, 0x7F00_0000)]);
    }

    #[test]
    fn test_pointer_scan_back_to_front_order() {
        let mut data = vec![0xFFu8; 4096];
        plant(&mut data, 100, 0x11_0000);
        plant(&mut data, 2000, 0x22_0000);
        plant(&mut data, 3900, 0x33_0000);
        let hits: Vec<_> = PointerScan::new(&data).collect();
        assert_eq!(
            hits,
            vec![(3900, 0x33_0000), (2000, 0x22_0000), (100, 0x11_0000)]
        );
    }

    #[test]
    fn test_pointer_scan_skips_short_prefix() {
        // Anchor at offset 4: no room for a pointer before it.
        let mut data = vec![0xFFu8; 256];
        data[4..4 + KEY_ANCHOR.len()].copy_from_slice(&KEY_ANCHOR);
        assert!(PointerScan::new(&data).next().is_none());
    }

    #[test]
    fn test_pointer_scan_rejects_out_of_window_pointers() {
        let mut data = vec![0xFFu8; 4096];
        plant(&mut data, 200, 0x10000); // not strictly above the floor
        plant(&mut data, 400, 0x8000_0000_0000); // above the ceiling
        plant(&mut data, 600, 0); // null
        assert!(PointerScan::new(&data).next().is_none());
    }

    #[test]
    fn test_pointer_scan_continues_past_rejected_match() {
        // Two anchors back to back. The later one's pointer window falls
        // on the tail of the earlier anchor (the LE64 value 47), which is
        // below the pointer floor; the sweep must reject it and still
        // reach the earlier, valid match one byte-window away.
        let mut data = vec![0xFFu8; 512];
        plant(&mut data, 200, 0x20_0000);
        data[224..224 + KEY_ANCHOR.len()].copy_from_slice(&KEY_ANCHOR);
        let hits: Vec<_> = PointerScan::new(&data).collect();
        assert_eq!(hits, vec![(200, 0x20_0000)]);
    }

    #[test]
    fn test_pointer_scan_empty_and_tiny_buffers() {
        assert!(PointerScan::new(&[]).next().is_none());
        assert!(PointerScan::new(&[0u8; 16]).next().is_none());
    }

    #[test]
    fn test_offset_probe_each_displacement() {
        for displacement in PROBE_OFFSETS {
            let mut data = vec![0xEEu8; 1024];
            let anchor_at = 512;
            let key_at = (anchor_at as i64 + displacement) as usize;
            data[key_at..key_at + KEY_SIZE].fill(0xAB);
            // Planted after the key: for displacements whose window covers
            // the anchor, the candidate legitimately contains anchor bytes.
            data[anchor_at..anchor_at + TEXT_ANCHOR.len()].copy_from_slice(&TEXT_ANCHOR);
            let mut expected = [0u8; KEY_SIZE];
            expected.copy_from_slice(&data[key_at..key_at + KEY_SIZE]);

            let hit = OffsetProbe::new(&data)
                .find(|(at, _)| *at == key_at)
                .unwrap_or_else(|| panic!("displacement {displacement}"));
            assert_eq!(hit.1, expected);
        }
    }

    #[test]
    fn test_offset_probe_skips_out_of_bounds() {
        // Anchor at the very start: negative displacements fall outside.
        let mut data = vec![0u8; 128];
        data[..TEXT_ANCHOR.len()].copy_from_slice(&TEXT_ANCHOR);
        let offsets: Vec<usize> = OffsetProbe::new(&data).map(|(at, _)| at).collect();
        assert_eq!(offsets, vec![16, 64, 32]);
    }

    #[test]
    fn test_offset_probe_no_anchor() {
        assert!(OffsetProbe::new(&[0xFFu8; 256]).next().is_none());
    }

    #[test]
    fn test_resolve_in_buffer() {
        let mut data = vec![0u8; 128];
        data[64..96].fill(0xCD);
        let buf = RegionBuffer { start: 0x5000, class: RegionClass::Heap, data };
        assert_eq!(resolve_in_buffer(&buf, 0x5040), Some([0xCDu8; KEY_SIZE]));
        assert!(resolve_in_buffer(&buf, 0x5070).is_none()); // window truncated
        assert!(resolve_in_buffer(&buf, 0x4000).is_none()); // other region
    }
}
