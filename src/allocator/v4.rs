//! IPv4 range allocator: `{start, end}` as 32-bit integers plus a bitmap of
//! length `end - start + 1` indexed by `ip - start`.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::allocator::bitset::Bitset;
use crate::error::AllocationError;

/// O(1)-amortized, mutex-guarded IPv4 address allocator over `[start, end]`
/// inclusive. One mutex per allocator, held only for the bit scan/set/clear.
pub struct Ipv4RangeAllocator {
    start: u32,
    end: u32,
    bitmap: Mutex<Bitset>,
}

impl Ipv4RangeAllocator {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, AllocationError> {
        let start_u = u32::from(start);
        let end_u = u32::from(end);
        if end_u < start_u {
            return Err(AllocationError::OutOfRange(format!(
                "range end {end} precedes start {start}"
            )));
        }
        let len = end_u as u64 - start_u as u64 + 1;
        let bitmap = Bitset::new(len).ok_or(AllocationError::PoolTooLarge(len))?;
        Ok(Self {
            start: start_u,
            end: end_u,
            bitmap: Mutex::new(bitmap),
        })
    }

    pub fn start(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    pub fn end(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.end)
    }

    fn index_of(&self, addr: Ipv4Addr) -> Option<u64> {
        let v = u32::from(addr);
        if v < self.start || v > self.end {
            None
        } else {
            Some((v - self.start) as u64)
        }
    }

    fn addr_of(&self, index: u64) -> Ipv4Addr {
        Ipv4Addr::from(self.start + index as u32)
    }

    /// Allocate an address. If `hint` is `Some` and within the pool and
    /// free, it is returned; otherwise the first-clear index is returned.
    /// Fails with `NoAddressAvailable` when the bitmap is full.
    pub fn allocate(&self, hint: Option<Ipv4Addr>) -> Result<Ipv4Addr, AllocationError> {
        let mut bitmap = self.bitmap.lock().unwrap();
        if let Some(hint) = hint {
            if let Some(idx) = self.index_of(hint) {
                if !bitmap.get(idx) {
                    bitmap.set(idx);
                    return Ok(hint);
                }
            }
        }
        let idx = bitmap
            .next_clear(0)
            .ok_or(AllocationError::NoAddressAvailable)?;
        bitmap.set(idx);
        Ok(self.addr_of(idx))
    }

    /// Release a previously-allocated address. Fails with `OutOfRange` if
    /// the address lies outside the pool, `DoubleFree` if it is already
    /// clear.
    pub fn free(&self, addr: Ipv4Addr) -> Result<(), AllocationError> {
        let idx = self
            .index_of(addr)
            .ok_or_else(|| AllocationError::OutOfRange(addr.to_string()))?;
        let mut bitmap = self.bitmap.lock().unwrap();
        if !bitmap.get(idx) {
            return Err(AllocationError::DoubleFree(addr.to_string()));
        }
        bitmap.clear(idx);
        Ok(())
    }

    /// Number of addresses in the pool.
    pub fn capacity(&self) -> u64 {
        self.end as u64 - self.start as u64 + 1
    }
}
