//! Raw L2 send path for a v4 client that has no usable IP destination yet
//! (no relay, no `ciaddr`, broadcast flag clear). Linux-only: opens an
//! `AF_PACKET`/`SOCK_DGRAM` socket, which sends from the IP layer up and
//! lets the kernel attach the Ethernet header, addressed at the client's
//! hardware address. On any other platform there is no portable
//! equivalent, so `RawSender::new` always fails and the caller falls back
//! to broadcast.

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CString;
    use std::net::Ipv4Addr;
    use std::os::unix::io::RawFd;

    use dhcproto::v4::{HType, CLIENT_PORT, SERVER_PORT};
    use ipnet::Ipv4Net;
    use tracing::debug;

    /// Source address preference: the interface address whose subnet
    /// contains `yiaddr`, else a link-local (169.254/16) address, else any
    /// address bound to the interface.
    fn select_source(addresses: &[Ipv4Net], yiaddr: Ipv4Addr) -> Option<Ipv4Addr> {
        addresses
            .iter()
            .find(|n| n.contains(&yiaddr))
            .map(|n| n.addr())
            .or_else(|| {
                addresses.iter().map(|n| n.addr()).find(|a| {
                    let o = a.octets();
                    o[0] == 169 && o[1] == 254
                })
            })
            .or_else(|| addresses.iter().map(|n| n.addr()).next())
    }

    fn ones_complement_sum(words: impl Iterator<Item = u16>) -> u16 {
        let mut sum: u32 = 0;
        for w in words {
            sum += w as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }

    fn be_words(bytes: &[u8]) -> impl Iterator<Item = u16> + '_ {
        let mut chunks = bytes.chunks_exact(2);
        let rem = chunks.remainder();
        chunks
            .by_ref()
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .chain(rem.first().map(|&b| u16::from_be_bytes([b, 0])))
    }

    fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, udp: &[u8]) -> u16 {
        let pseudo_header = be_words(&src.octets())
            .chain(be_words(&dst.octets()))
            .chain(std::iter::once(17u16)) // UDP protocol number
            .chain(std::iter::once(udp.len() as u16));
        let checksum = ones_complement_sum(pseudo_header.chain(be_words(udp)));
        if checksum == 0 {
            0xffff
        } else {
            checksum
        }
    }

    /// Hand-built IPv4 header + UDP header + `payload`, `src:67 -> yiaddr:68`,
    /// DF set, checksums computed.
    fn build_packet(src: Ipv4Addr, yiaddr: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let udp_len = 8 + payload.len();
        let total_len = 20 + udp_len;

        let mut udp = Vec::with_capacity(udp_len);
        udp.extend_from_slice(&SERVER_PORT.to_be_bytes());
        udp.extend_from_slice(&CLIENT_PORT.to_be_bytes());
        udp.extend_from_slice(&(udp_len as u16).to_be_bytes());
        udp.extend_from_slice(&[0, 0]);
        udp.extend_from_slice(payload);
        let checksum = udp_checksum(src, yiaddr, &udp);
        udp[6..8].copy_from_slice(&checksum.to_be_bytes());

        let mut header = Vec::with_capacity(20);
        header.push(0x45); // version 4, IHL 5
        header.push(0x00);
        header.extend_from_slice(&(total_len as u16).to_be_bytes());
        header.extend_from_slice(&[0, 0]); // identification
        header.extend_from_slice(&[0x40, 0x00]); // DF set, no fragment offset
        header.push(64); // TTL
        header.push(17); // protocol: UDP
        header.extend_from_slice(&[0, 0]);
        header.extend_from_slice(&src.octets());
        header.extend_from_slice(&yiaddr.octets());
        let checksum = ones_complement_sum(be_words(&header));
        header[10..12].copy_from_slice(&checksum.to_be_bytes());

        header.extend_from_slice(&udp);
        header
    }

    pub struct RawSender {
        fd: RawFd,
        if_index: i32,
        addresses: Vec<Ipv4Net>,
    }

    impl RawSender {
        /// Opens a datagram-mode `AF_PACKET` socket with protocol 0, so it
        /// receives nothing; it exists only to send.
        pub fn new(interface: &str, addresses: Vec<Ipv4Net>) -> std::io::Result<Self> {
            let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_DGRAM, 0) };
            if fd < 0 {
                return Err(std::io::Error::last_os_error());
            }
            let name = CString::new(interface).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "interface name contains NUL")
            })?;
            let if_index = unsafe { libc::if_nametoindex(name.as_ptr()) };
            if if_index == 0 {
                unsafe { libc::close(fd) };
                return Err(std::io::Error::last_os_error());
            }
            Ok(Self {
                fd,
                if_index: if_index as i32,
                addresses,
            })
        }

        pub fn send(&self, yiaddr: Ipv4Addr, htype: HType, chaddr: &[u8], payload: &[u8]) -> bool {
            if htype != HType::Eth || chaddr.len() != 6 {
                debug!(?htype, "raw L2 send only supports Ethernet hardware addresses");
                return false;
            }
            let Some(src) = select_source(&self.addresses, yiaddr) else {
                debug!(%yiaddr, "no usable source address for raw L2 send");
                return false;
            };
            let packet = build_packet(src, yiaddr, payload);

            let mut sll_addr = [0u8; 8];
            sll_addr[..6].copy_from_slice(chaddr);
            let dest = libc::sockaddr_ll {
                sll_family: libc::AF_PACKET as u16,
                sll_protocol: (libc::ETH_P_IP as u16).to_be(),
                sll_ifindex: self.if_index,
                sll_hatype: 0,
                sll_pkttype: 0,
                sll_halen: 6,
                sll_addr,
            };

            let result = unsafe {
                libc::sendto(
                    self.fd,
                    packet.as_ptr() as *const libc::c_void,
                    packet.len(),
                    0,
                    &dest as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            result >= 0
        }
    }

    impl Drop for RawSender {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }

}

#[cfg(target_os = "linux")]
pub use linux::RawSender;

#[cfg(not(target_os = "linux"))]
mod fallback {
    use std::net::Ipv4Addr;

    use dhcproto::v4::HType;
    use ipnet::Ipv4Net;

    /// No portable raw-L2 primitive exists outside Linux; every call fails
    /// so the caller broadcasts instead.
    pub struct RawSender;

    impl RawSender {
        pub fn new(_interface: &str, _addresses: Vec<Ipv4Net>) -> std::io::Result<Self> {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "raw L2 send is only implemented on Linux",
            ))
        }

        pub fn send(&self, _yiaddr: Ipv4Addr, _htype: HType, _chaddr: &[u8], _payload: &[u8]) -> bool {
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use fallback::RawSender;
