//! IPv6 prefix allocator: `{containing prefix, page}` plus a bitmap of
//! length `2^(page - containing.length)` indexed by prefix offset. Only
//! prefixes of length `page` are handed out, regardless of hint length.

use std::sync::Mutex;

use ipnet::Ipv6Net;
use std::net::Ipv6Addr;

use crate::allocator::bitset::Bitset;
use crate::error::AllocationError;

/// Distance between `a` and `b` in units of /L prefixes, after masking both
/// to /L. Returns `None` (overflow) if the distance does not fit in 64
/// bits.
pub fn offset(a: Ipv6Addr, b: Ipv6Addr, l: u8) -> Result<u64, AllocationError> {
    if l > 128 {
        return Err(AllocationError::BadPrefixLength(l));
    }
    let a = mask_to(a, l);
    let b = mask_to(b, l);
    let shift = 128 - l as u32;
    let a_units = if shift == 128 { 0u128 } else { u128::from(a) >> shift };
    let b_units = if shift == 128 { 0u128 } else { u128::from(b) >> shift };
    if a_units < b_units {
        return Err(AllocationError::Overflow);
    }
    let diff = a_units - b_units;
    u64::try_from(diff).map_err(|_| AllocationError::Overflow)
}

/// `base + n * 2^(128-L)`, overflow on carry out of bit 128.
pub fn add_prefixes(base: Ipv6Addr, n: u64, l: u8) -> Result<Ipv6Addr, AllocationError> {
    if l > 128 {
        return Err(AllocationError::BadPrefixLength(l));
    }
    let shift = 128 - l as u32;
    let increment: u128 = if shift >= 128 {
        n as u128
    } else {
        (n as u128).checked_shl(shift).ok_or(AllocationError::Overflow)?
    };
    let base_u = u128::from(mask_to(base, l));
    let result = base_u.checked_add(increment).ok_or(AllocationError::Overflow)?;
    // must not carry past bit 128: checked_add on u128 already enforces this
    Ok(Ipv6Addr::from(result))
}

fn mask_to(addr: Ipv6Addr, l: u8) -> Ipv6Addr {
    if l >= 128 {
        return addr;
    }
    let bits = u128::from(addr);
    let mask = !0u128 << (128 - l as u32);
    Ipv6Addr::from(bits & mask)
}

/// Mutex-guarded bitmap allocator handing out /page prefixes carved from a
/// containing prefix.
pub struct Ipv6PrefixAllocator {
    containing: Ipv6Net,
    page: u8,
    bitmap: Mutex<Bitset>,
}

impl Ipv6PrefixAllocator {
    pub fn new(containing: Ipv6Net, page: u8) -> Result<Self, AllocationError> {
        if page > 128 || page < containing.prefix_len() {
            return Err(AllocationError::BadPrefixLength(page));
        }
        let len = 1u64
            .checked_shl((page - containing.prefix_len()) as u32)
            .ok_or(AllocationError::PoolTooLarge(u64::MAX))?;
        let bitmap = Bitset::new(len).ok_or(AllocationError::PoolTooLarge(len))?;
        Ok(Self {
            containing,
            page,
            bitmap: Mutex::new(bitmap),
        })
    }

    pub fn page(&self) -> u8 {
        self.page
    }

    pub fn containing(&self) -> Ipv6Net {
        self.containing
    }

    fn index_of(&self, prefix: Ipv6Addr) -> Option<u64> {
        if !self.containing.contains(&prefix) {
            return None;
        }
        offset(prefix, self.containing.network(), self.page).ok()
    }

    fn prefix_of(&self, index: u64) -> Result<Ipv6Addr, AllocationError> {
        add_prefixes(self.containing.network(), index, self.page)
    }

    /// Allocate a /page prefix. `hint` may be any length — only its network
    /// address (masked to /page) is consulted; the returned prefix always
    /// has length `page`.
    pub fn allocate(&self, hint: Option<Ipv6Addr>) -> Result<Ipv6Net, AllocationError> {
        let mut bitmap = self.bitmap.lock().unwrap();
        if let Some(hint) = hint {
            let masked = mask_to(hint, self.page);
            if let Some(idx) = self.index_of(masked) {
                if !bitmap.get(idx) {
                    bitmap.set(idx);
                    return Ipv6Net::new(masked, self.page)
                        .map_err(|_| AllocationError::BadPrefixLength(self.page));
                }
            }
        }
        let idx = bitmap
            .next_clear(0)
            .ok_or(AllocationError::NoAddressAvailable)?;
        bitmap.set(idx);
        let addr = self.prefix_of(idx)?;
        Ipv6Net::new(addr, self.page).map_err(|_| AllocationError::BadPrefixLength(self.page))
    }

    /// Release a previously-allocated /page prefix.
    pub fn free(&self, prefix: Ipv6Addr) -> Result<(), AllocationError> {
        let idx = self
            .index_of(prefix)
            .ok_or_else(|| AllocationError::OutOfRange(prefix.to_string()))?;
        let mut bitmap = self.bitmap.lock().unwrap();
        if !bitmap.get(idx) {
            return Err(AllocationError::DoubleFree(prefix.to_string()));
        }
        bitmap.clear(idx);
        Ok(())
    }

    pub fn capacity(&self) -> u64 {
        self.bitmap.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Ipv6PrefixAllocator {
        let net: Ipv6Net = "2001:db8::/56".parse().unwrap();
        Ipv6PrefixAllocator::new(net, 64).unwrap()
    }

    #[test]
    fn capacity_matches_page_minus_containing() {
        let a = pool();
        assert_eq!(a.capacity(), 1 << (64 - 56));
    }

    #[test]
    fn allocate_returns_page_length_regardless_of_hint() {
        let a = pool();
        let hint: Ipv6Addr = "2001:db8:0:5::".parse().unwrap();
        let got = a.allocate(Some(hint)).unwrap();
        assert_eq!(got.prefix_len(), 64);
        assert!(a.containing().contains(&got));
    }

    #[test]
    fn exhausts_then_reports_no_address_available() {
        let net: Ipv6Net = "2001:db8::/62".parse().unwrap();
        let a = Ipv6PrefixAllocator::new(net, 64).unwrap();
        for _ in 0..4 {
            a.allocate(None).unwrap();
        }
        assert_eq!(
            a.allocate(None).unwrap_err(),
            AllocationError::NoAddressAvailable
        );
    }

    #[test]
    fn free_then_allocate_reuses_slot_single_prefix_pool() {
        let net: Ipv6Net = "2001:db8::/64".parse().unwrap();
        let a = Ipv6PrefixAllocator::new(net, 64).unwrap();
        let first = a.allocate(None).unwrap();
        a.free(first.addr()).unwrap();
        let second = a.allocate(None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn offset_and_add_prefixes_round_trip() {
        let base: Ipv6Addr = "2001:db8::".parse().unwrap();
        let x: Ipv6Addr = "2001:db8:0:7::".parse().unwrap();
        let n = offset(x, base, 64).unwrap();
        assert_eq!(n, 7);
        let back = add_prefixes(base, n, 64).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn add_prefixes_overflow_detected() {
        let base: Ipv6Addr = "ffff:ffff:ffff:ffff::".parse().unwrap();
        assert_eq!(add_prefixes(base, 2, 64), Err(AllocationError::Overflow));
    }

    #[test]
    fn offset_requires_high_half_arithmetic_for_small_l() {
        // L <= 64 exercises the >64-bit shift branch
        let base: Ipv6Addr = "::".parse().unwrap();
        let x: Ipv6Addr = "8000::".parse().unwrap();
        let n = offset(x, base, 1).unwrap();
        assert_eq!(n, 1);
    }
}
