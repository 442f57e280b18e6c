use std::ptr::{self, NonNull};

use memmap2::MmapMut;

use crate::{GuestMemory, GuestMemoryError, GuestMemoryResult, HostRange};

struct Region {
    base: u64,
    len: usize,
    host: NonNull<u8>,
    // Keeps the mapping alive; never accessed through a reference after construction.
    _map: MmapMut,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.len as u64
    }
}

/// Guest RAM backed by anonymous memory mappings.
///
/// Each region is page aligned on the host, so a guest-physical address has the same alignment
/// on the host as its offset within its region.
pub struct GuestRam {
    // Sorted by `base`, non-overlapping.
    regions: Vec<Region>,
}

// SAFETY: the raw region pointers are owned by the mappings held alongside them and are only
// dereferenced through `ptr::copy_nonoverlapping`, never turned into Rust references. Concurrent
// access to guest RAM is inherent to the device model (the guest shares it).
unsafe impl Send for GuestRam {}
// SAFETY: see above.
unsafe impl Sync for GuestRam {}

impl GuestRam {
    /// Single region mapped at guest-physical address 0.
    pub fn new(size: u64) -> GuestMemoryResult<Self> {
        Self::with_regions(&[(0, size)])
    }

    /// Maps one region per `(base, size)` pair.
    pub fn with_regions(layout: &[(u64, u64)]) -> GuestMemoryResult<Self> {
        let mut sorted = layout.to_vec();
        sorted.sort_by_key(|&(base, _)| base);

        let mut regions: Vec<Region> = Vec::with_capacity(sorted.len());
        for (base, size) in sorted {
            if size == 0 {
                return Err(GuestMemoryError::EmptyRegion { base });
            }
            let len = usize::try_from(size).map_err(|_| GuestMemoryError::SizeTooLarge { size })?;
            if base.checked_add(size).is_none() {
                return Err(GuestMemoryError::SizeTooLarge { size });
            }
            if let Some(prev) = regions.last() {
                if prev.end() > base {
                    return Err(GuestMemoryError::Overlap { base });
                }
            }

            let mut map = MmapMut::map_anon(len).map_err(GuestMemoryError::Map)?;
            let host = NonNull::new(map.as_mut_ptr()).ok_or_else(|| {
                GuestMemoryError::Map(std::io::Error::other("anonymous mapping returned null"))
            })?;
            regions.push(Region {
                base,
                len,
                host,
                _map: map,
            });
        }

        Ok(Self { regions })
    }

    fn region_for(&self, paddr: u64) -> Option<&Region> {
        let idx = self.regions.partition_point(|r| r.base <= paddr);
        let region = self.regions.get(idx.checked_sub(1)?)?;
        (paddr < region.end()).then_some(region)
    }
}

impl std::fmt::Debug for GuestRam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        for r in &self.regions {
            list.entry(&format_args!("0x{:x}..0x{:x}", r.base, r.end()));
        }
        list.finish()
    }
}

impl GuestMemory for GuestRam {
    fn size(&self) -> u64 {
        self.regions.last().map_or(0, Region::end)
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let len = dst.len();
        // Validate first so a failed read leaves `dst` untouched.
        self.check_range(paddr, len)?;

        let mut done = 0usize;
        while done < len {
            let cur = paddr + done as u64;
            let range = self
                .host_address(cur)
                .ok_or(GuestMemoryError::OutOfRange { paddr, len })?;
            let take = range.len.min(len - done);
            // SAFETY: `range` covers `take` mapped bytes and `dst[done..]` has room for them; the
            // host mapping never overlaps a Rust-owned buffer.
            unsafe {
                ptr::copy_nonoverlapping(range.ptr.as_ptr(), dst.as_mut_ptr().add(done), take);
            }
            done += take;
        }
        Ok(())
    }

    fn write_from(&self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let len = src.len();
        self.check_range(paddr, len)?;

        let mut done = 0usize;
        while done < len {
            let cur = paddr + done as u64;
            let range = self
                .host_address(cur)
                .ok_or(GuestMemoryError::OutOfRange { paddr, len })?;
            let take = range.len.min(len - done);
            // SAFETY: as in `read_into`, with the copy direction reversed.
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr().add(done), range.ptr.as_ptr(), take);
            }
            done += take;
        }
        Ok(())
    }

    fn host_address(&self, paddr: u64) -> Option<HostRange> {
        let region = self.region_for(paddr)?;
        let offset = (paddr - region.base) as usize;
        // SAFETY: `offset < region.len`, so the result stays inside the mapping.
        let ptr = unsafe { NonNull::new_unchecked(region.host.as_ptr().add(offset)) };
        Some(HostRange {
            ptr,
            len: region.len - offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_back_what_was_written() {
        let ram = GuestRam::new(0x4000).unwrap();
        ram.write_u32_le(0x100, 0xdead_beef).unwrap();
        ram.write_u16_le(0x104, 0x1234).unwrap();
        assert_eq!(ram.read_u32_le(0x100).unwrap(), 0xdead_beef);
        assert_eq!(ram.read_u16_le(0x104).unwrap(), 0x1234);
        assert_eq!(ram.read_u8(0x106).unwrap(), 0);
    }

    #[test]
    fn access_past_the_end_is_rejected() {
        let ram = GuestRam::new(0x1000).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            ram.read_into(0xffc, &mut buf),
            Err(GuestMemoryError::OutOfRange { paddr: 0xffc, len: 8 })
        ));
        assert!(ram.write_from(0x1000, &[1]).is_err());
        assert!(ram.host_address(0x1000).is_none());
    }

    #[test]
    fn accesses_straddling_adjacent_regions_are_split() {
        let ram = GuestRam::with_regions(&[(0x2000, 0x1000), (0x1000, 0x1000)]).unwrap();
        let payload: Vec<u8> = (0..32u8).collect();
        ram.write_from(0x1ff0, &payload).unwrap();

        let mut out = vec![0u8; 32];
        ram.read_into(0x1ff0, &mut out).unwrap();
        assert_eq!(out, payload);

        let mut ranges = Vec::new();
        ram.translate(0x1ff0, 32, &mut ranges).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].len, 16);
        assert_eq!(ranges[1].len, 16);
    }

    #[test]
    fn holes_between_regions_are_unmapped() {
        let ram = GuestRam::with_regions(&[(0, 0x1000), (0x3000, 0x1000)]).unwrap();
        assert_eq!(ram.size(), 0x4000);
        assert!(ram.check_range(0xff0, 0x20).is_err());
        assert!(ram.read_u8(0x2000).is_err());
        assert!(ram.check_range(0x3000, 0x1000).is_ok());
    }

    #[test]
    fn overlapping_or_empty_regions_are_rejected() {
        assert!(matches!(
            GuestRam::with_regions(&[(0, 0x2000), (0x1000, 0x1000)]),
            Err(GuestMemoryError::Overlap { base: 0x1000 })
        ));
        assert!(matches!(
            GuestRam::with_regions(&[(0, 0)]),
            Err(GuestMemoryError::EmptyRegion { base: 0 })
        ));
    }

    #[test]
    fn host_addresses_keep_region_offsets() {
        let ram = GuestRam::new(0x2000).unwrap();
        let base = ram.host_address(0).unwrap();
        let inner = ram.host_address(0x1ff).unwrap();
        assert_eq!(inner.ptr.as_ptr() as usize - base.ptr.as_ptr() as usize, 0x1ff);
        assert_eq!(inner.len, 0x2000 - 0x1ff);
        assert_eq!(base.ptr.as_ptr() as usize % 4096, 0);
    }
}
