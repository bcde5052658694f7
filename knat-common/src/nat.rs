//! Wire layouts of the NAT maps. These records are shared with the kernel
//! side, so the field order, widths and padding are the contract.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// External traffic policy of the service is Local.
pub const FLG_EXTERNAL_LOCAL: u32 = 0x1;
/// Internal traffic policy of the service is Local.
pub const FLG_INTERNAL_LOCAL: u32 = 0x2;
/// The dataplane must leave matching traffic alone.
pub const FLG_EXCLUDE: u32 = 0x8;

/// A frontend `count` of this value makes the dataplane drop matching
/// packets instead of falling through to another entry.
pub const BLACK_HOLE_COUNT: u32 = u32::MAX;

/// A source CIDR; the all-zero value matches any source.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl Cidr {
    pub const ANY_V4: Cidr = Cidr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    pub const ANY_V6: Cidr = Cidr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0);

    pub const fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    pub fn is_any(&self) -> bool {
        self.prefix_len == 0 && self.addr.is_unspecified()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FrontendKeyV4 {
    pub addr: u32,
    pub port: u16,
    pub proto: u8,
    pub src_prefix_len: u8,
    pub src_addr: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for FrontendKeyV4 {}

impl FrontendKeyV4 {
    pub const fn new(addr: u32, port: u16, proto: u8) -> Self {
        Self {
            addr,
            port,
            proto,
            src_prefix_len: 0,
            src_addr: 0,
        }
    }

    pub const fn with_src(addr: u32, port: u16, proto: u8, src_addr: u32, src_prefix_len: u8) -> Self {
        Self {
            addr,
            port,
            proto,
            src_prefix_len,
            src_addr,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FrontendKeyV6 {
    pub addr: u128,
    pub src_addr: u128,
    pub port: u16,
    pub proto: u8,
    pub src_prefix_len: u8,
    pub _pad: [u8; 12],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for FrontendKeyV6 {}

impl FrontendKeyV6 {
    pub const fn new(addr: u128, port: u16, proto: u8) -> Self {
        Self {
            addr,
            src_addr: 0,
            port,
            proto,
            src_prefix_len: 0,
            _pad: [0; 12],
        }
    }

    pub const fn with_src(addr: u128, port: u16, proto: u8, src_addr: u128, src_prefix_len: u8) -> Self {
        Self {
            addr,
            src_addr,
            port,
            proto,
            src_prefix_len,
            _pad: [0; 12],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FrontendValue {
    pub id: u32,
    pub count: u32,
    pub local_count: u32,
    pub affinity_timeo: u32,
    pub flags: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for FrontendValue {}

impl FrontendValue {
    pub const fn new(id: u32, count: u32, local_count: u32) -> Self {
        Self::with_flags(id, count, local_count, 0, 0)
    }

    pub const fn with_flags(
        id: u32,
        count: u32,
        local_count: u32,
        affinity_timeo: u32,
        flags: u32,
    ) -> Self {
        Self {
            id,
            count,
            local_count,
            affinity_timeo,
            flags,
        }
    }

    /// Matching packets are dropped rather than NATed or passed through.
    pub const fn black_hole(id: u32) -> Self {
        Self::with_flags(id, BLACK_HOLE_COUNT, 0, 0, 0)
    }

    pub const fn is_black_hole(&self) -> bool {
        self.count == BLACK_HOLE_COUNT
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BackendKey {
    pub id: u32,
    pub idx: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for BackendKey {}

impl BackendKey {
    pub const fn new(id: u32, idx: u32) -> Self {
        Self { id, idx }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BackendValueV4 {
    pub addr: u32,
    pub port: u16,
    pub _pad: u16,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for BackendValueV4 {}

impl BackendValueV4 {
    pub const fn new(addr: u32, port: u16) -> Self {
        Self { addr, port, _pad: 0 }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BackendValueV6 {
    pub addr: u128,
    pub port: u16,
    pub _pad: [u8; 14],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for BackendValueV6 {}

impl BackendValueV6 {
    pub const fn new(addr: u128, port: u16) -> Self {
        Self {
            addr,
            port,
            _pad: [0; 14],
        }
    }
}

/// The frontend projection that keys affinity records; the source CIDR is
/// deliberately absent so all entries of one frontend share affinity.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FrontendAffinityKeyV4 {
    pub addr: u32,
    pub port: u16,
    pub proto: u8,
    pub _pad: u8,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for FrontendAffinityKeyV4 {}

impl FrontendAffinityKeyV4 {
    pub const fn new(addr: u32, port: u16, proto: u8) -> Self {
        Self {
            addr,
            port,
            proto,
            _pad: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FrontendAffinityKeyV6 {
    pub addr: u128,
    pub port: u16,
    pub proto: u8,
    pub _pad: [u8; 13],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for FrontendAffinityKeyV6 {}

impl FrontendAffinityKeyV6 {
    pub const fn new(addr: u128, port: u16, proto: u8) -> Self {
        Self {
            addr,
            port,
            proto,
            _pad: [0; 13],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AffinityKeyV4 {
    pub client_addr: u32,
    pub frontend: FrontendAffinityKeyV4,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AffinityKeyV4 {}

impl AffinityKeyV4 {
    pub const fn new(client_addr: u32, frontend: FrontendAffinityKeyV4) -> Self {
        Self {
            client_addr,
            frontend,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AffinityKeyV6 {
    pub client_addr: u128,
    pub frontend: FrontendAffinityKeyV6,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AffinityKeyV6 {}

impl AffinityKeyV6 {
    pub const fn new(client_addr: u128, frontend: FrontendAffinityKeyV6) -> Self {
        Self {
            client_addr,
            frontend,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AffinityValueV4 {
    pub ts_ns: u64,
    pub backend: BackendValueV4,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AffinityValueV4 {}

impl AffinityValueV4 {
    pub const fn new(ts_ns: u64, backend: BackendValueV4) -> Self {
        Self { ts_ns, backend }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AffinityValueV6 {
    pub backend: BackendValueV6,
    pub ts_ns: u64,
    pub _pad: [u8; 8],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AffinityValueV6 {}

impl AffinityValueV6 {
    pub const fn new(ts_ns: u64, backend: BackendValueV6) -> Self {
        Self {
            backend,
            ts_ns,
            _pad: [0; 8],
        }
    }
}
