//! Family-neutral views over the wire records and the two address-family
//! markers that tie the frontend, backend and affinity types together.

use core::fmt::Debug;
use core::hash::Hash;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::nat::{
    AffinityKeyV4, AffinityKeyV6, AffinityValueV4, AffinityValueV6, BackendValueV4, BackendValueV6,
    Cidr, FrontendAffinityKeyV4, FrontendAffinityKeyV6, FrontendKeyV4, FrontendKeyV6,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            IpFamily::V4 => addr.is_ipv4(),
            IpFamily::V6 => addr.is_ipv6(),
        }
    }
}

pub trait FrontendKey: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    type AffKey: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn addr(&self) -> IpAddr;
    fn port(&self) -> u16;
    fn protocol(&self) -> u8;
    fn src_cidr(&self) -> Cidr;
    /// Projection that keys the affinity table for this frontend.
    fn affinity_key(&self) -> Self::AffKey;
}

pub trait BackendValue: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    fn addr(&self) -> IpAddr;
    fn port(&self) -> u16;
}

pub trait AffinityKey: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    type Frontend: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn frontend(&self) -> Self::Frontend;
    fn client_addr(&self) -> IpAddr;
}

pub trait AffinityValue: Copy + Debug + Send + Sync + 'static {
    type Backend: BackendValue;

    fn timestamp_ns(&self) -> u64;
    fn backend(&self) -> Self::Backend;
}

/// One address family of the NAT map set. Constructors return `None` when
/// given an address of the other family.
pub trait NatFamily: Send + Sync + 'static {
    const FAMILY: IpFamily;
    /// All-ones node-port address; stands for "every pod-facing address" and
    /// is suppressed when the internal traffic policy is Local.
    const SENTINEL_NODEPORT_ADDR: IpAddr;

    type FrontendKey: FrontendKey<AffKey = Self::FrontendAffKey>;
    type FrontendAffKey: Copy + Eq + Hash + Debug + Send + Sync + 'static;
    type BackendValue: BackendValue;
    type AffinityKey: AffinityKey<Frontend = Self::FrontendAffKey>;
    type AffinityValue: AffinityValue<Backend = Self::BackendValue>;

    fn frontend_key(addr: IpAddr, port: u16, proto: u8) -> Option<Self::FrontendKey>;
    fn frontend_key_with_src(
        addr: IpAddr,
        port: u16,
        proto: u8,
        src: Cidr,
    ) -> Option<Self::FrontendKey>;
    fn backend_value(addr: IpAddr, port: u16) -> Option<Self::BackendValue>;
}

impl FrontendKey for FrontendKeyV4 {
    type AffKey = FrontendAffinityKeyV4;

    fn addr(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from_bits(self.addr))
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn protocol(&self) -> u8 {
        self.proto
    }

    fn src_cidr(&self) -> Cidr {
        Cidr::new(
            IpAddr::V4(Ipv4Addr::from_bits(self.src_addr)),
            self.src_prefix_len,
        )
    }

    fn affinity_key(&self) -> Self::AffKey {
        FrontendAffinityKeyV4::new(self.addr, self.port, self.proto)
    }
}

impl FrontendKey for FrontendKeyV6 {
    type AffKey = FrontendAffinityKeyV6;

    fn addr(&self) -> IpAddr {
        IpAddr::V6(Ipv6Addr::from_bits(self.addr))
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn protocol(&self) -> u8 {
        self.proto
    }

    fn src_cidr(&self) -> Cidr {
        Cidr::new(
            IpAddr::V6(Ipv6Addr::from_bits(self.src_addr)),
            self.src_prefix_len,
        )
    }

    fn affinity_key(&self) -> Self::AffKey {
        FrontendAffinityKeyV6::new(self.addr, self.port, self.proto)
    }
}

impl BackendValue for BackendValueV4 {
    fn addr(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from_bits(self.addr))
    }

    fn port(&self) -> u16 {
        self.port
    }
}

impl BackendValue for BackendValueV6 {
    fn addr(&self) -> IpAddr {
        IpAddr::V6(Ipv6Addr::from_bits(self.addr))
    }

    fn port(&self) -> u16 {
        self.port
    }
}

impl AffinityKey for AffinityKeyV4 {
    type Frontend = FrontendAffinityKeyV4;

    fn frontend(&self) -> Self::Frontend {
        self.frontend
    }

    fn client_addr(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from_bits(self.client_addr))
    }
}

impl AffinityKey for AffinityKeyV6 {
    type Frontend = FrontendAffinityKeyV6;

    fn frontend(&self) -> Self::Frontend {
        self.frontend
    }

    fn client_addr(&self) -> IpAddr {
        IpAddr::V6(Ipv6Addr::from_bits(self.client_addr))
    }
}

impl AffinityValue for AffinityValueV4 {
    type Backend = BackendValueV4;

    fn timestamp_ns(&self) -> u64 {
        self.ts_ns
    }

    fn backend(&self) -> Self::Backend {
        self.backend
    }
}

impl AffinityValue for AffinityValueV6 {
    type Backend = BackendValueV6;

    fn timestamp_ns(&self) -> u64 {
        self.ts_ns
    }

    fn backend(&self) -> Self::Backend {
        self.backend
    }
}

pub enum NatV4 {}

impl NatFamily for NatV4 {
    const FAMILY: IpFamily = IpFamily::V4;
    const SENTINEL_NODEPORT_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::BROADCAST);

    type FrontendKey = FrontendKeyV4;
    type FrontendAffKey = FrontendAffinityKeyV4;
    type BackendValue = BackendValueV4;
    type AffinityKey = AffinityKeyV4;
    type AffinityValue = AffinityValueV4;

    fn frontend_key(addr: IpAddr, port: u16, proto: u8) -> Option<Self::FrontendKey> {
        let IpAddr::V4(addr) = addr else {
            return None;
        };
        Some(FrontendKeyV4::new(addr.to_bits(), port, proto))
    }

    fn frontend_key_with_src(
        addr: IpAddr,
        port: u16,
        proto: u8,
        src: Cidr,
    ) -> Option<Self::FrontendKey> {
        let (IpAddr::V4(addr), IpAddr::V4(src_addr)) = (addr, src.addr) else {
            return None;
        };
        Some(FrontendKeyV4::with_src(
            addr.to_bits(),
            port,
            proto,
            src_addr.to_bits(),
            src.prefix_len,
        ))
    }

    fn backend_value(addr: IpAddr, port: u16) -> Option<Self::BackendValue> {
        let IpAddr::V4(addr) = addr else {
            return None;
        };
        Some(BackendValueV4::new(addr.to_bits(), port))
    }
}

pub enum NatV6 {}

impl NatFamily for NatV6 {
    const FAMILY: IpFamily = IpFamily::V6;
    const SENTINEL_NODEPORT_ADDR: IpAddr = IpAddr::V6(Ipv6Addr::new(
        0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff,
    ));

    type FrontendKey = FrontendKeyV6;
    type FrontendAffKey = FrontendAffinityKeyV6;
    type BackendValue = BackendValueV6;
    type AffinityKey = AffinityKeyV6;
    type AffinityValue = AffinityValueV6;

    fn frontend_key(addr: IpAddr, port: u16, proto: u8) -> Option<Self::FrontendKey> {
        let IpAddr::V6(addr) = addr else {
            return None;
        };
        Some(FrontendKeyV6::new(addr.to_bits(), port, proto))
    }

    fn frontend_key_with_src(
        addr: IpAddr,
        port: u16,
        proto: u8,
        src: Cidr,
    ) -> Option<Self::FrontendKey> {
        let (IpAddr::V6(addr), IpAddr::V6(src_addr)) = (addr, src.addr) else {
            return None;
        };
        Some(FrontendKeyV6::with_src(
            addr.to_bits(),
            port,
            proto,
            src_addr.to_bits(),
            src.prefix_len,
        ))
    }

    fn backend_value(addr: IpAddr, port: u16) -> Option<Self::BackendValue> {
        let IpAddr::V6(addr) = addr else {
            return None;
        };
        Some(BackendValueV6::new(addr.to_bits(), port))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_frontend_key_family_check() {
        let v4 = IpAddr::V4(Ipv4Addr::new(10, 96, 0, 1));
        let v6: IpAddr = "fd00::1".parse().unwrap();

        assert!(NatV4::frontend_key(v4, 80, 6).is_some());
        assert!(NatV4::frontend_key(v6, 80, 6).is_none());
        assert!(NatV6::frontend_key(v6, 80, 6).is_some());
        assert!(NatV6::frontend_key(v4, 80, 6).is_none());
    }

    #[test]
    fn test_affinity_projection_ignores_src_cidr() {
        let addr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let src = Cidr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 0)), 24);

        let plain = NatV4::frontend_key(addr, 80, 6).unwrap();
        let ranged = NatV4::frontend_key_with_src(addr, 80, 6, src).unwrap();

        assert_ne!(plain, ranged);
        assert_eq!(plain.affinity_key(), ranged.affinity_key());
    }

    #[test]
    fn test_src_cidr_roundtrip() {
        let addr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let src = Cidr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 0)), 24);

        let key = NatV4::frontend_key_with_src(addr, 80, 17, src).unwrap();
        assert_eq!(key.src_cidr(), src);
        assert_eq!(key.addr(), addr);
        assert_eq!(key.port(), 80);
        assert_eq!(key.protocol(), 17);

        let plain = NatV4::frontend_key(addr, 80, 17).unwrap();
        assert!(plain.src_cidr().is_any());
    }
}
