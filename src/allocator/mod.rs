//! Allocator primitives: bitmap-backed IPv4 range and IPv6 prefix carving.
//!
//! Both variants share the `Bitset` scanner; the v6 variant additionally
//! implements masked-prefix arithmetic (`offset`, `add_prefixes`) needed to
//! turn a bit index back into an address.

pub mod bitset;
pub mod v4;
pub mod v6;

pub use v4::Ipv4RangeAllocator;
pub use v6::{add_prefixes, offset, Ipv6PrefixAllocator};
