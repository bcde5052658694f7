//! The route table surface the syncer consumes. The table itself is owned
//! elsewhere; the syncer only resolves endpoint addresses to the node that
//! hosts them and waits for the table to move when a resolution fails.

use std::net::IpAddr;

use tokio_util::sync::CancellationToken;

pub const FLAG_WORKLOAD: u32 = 0x01;
pub const FLAG_LOCAL: u32 = 0x02;
pub const FLAG_HOST: u32 = 0x04;
pub const FLAG_IN_IPAM_POOL: u32 = 0x08;
pub const FLAG_SKIP_INGRESS_REDIR: u32 = 0x10;

pub const FLAGS_LOCAL_HOST: u32 = FLAG_LOCAL | FLAG_HOST;
pub const FLAGS_REMOTE_HOST: u32 = FLAG_HOST;
pub const FLAGS_LOCAL_WORKLOAD: u32 = FLAG_LOCAL | FLAG_WORKLOAD | FLAG_IN_IPAM_POOL;
pub const FLAGS_REMOTE_WORKLOAD: u32 = FLAG_WORKLOAD | FLAG_IN_IPAM_POOL;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteValue {
    flags: u32,
    next_hop: IpAddr,
}

impl RouteValue {
    pub fn new(flags: u32, next_hop: IpAddr) -> Self {
        Self { flags, next_hop }
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn next_hop(&self) -> IpAddr {
        self.next_hop
    }

    /// A workload that lives behind another node.
    pub fn is_remote_workload(&self) -> bool {
        self.flags & FLAG_WORKLOAD != 0 && self.flags & FLAG_LOCAL == 0
    }
}

pub trait Routes: Send + Sync + 'static {
    fn lookup(&self, addr: IpAddr) -> Option<RouteValue>;

    /// Resolves `true` once the route table has changed since the call was
    /// made, `false` when `cancel` fires first.
    fn wait_for_change(&self, cancel: CancellationToken) -> impl Future<Output = bool> + Send;
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_remote_workload() {
        let node = IpAddr::V4(Ipv4Addr::new(192, 168, 2, 1));

        assert!(RouteValue::new(FLAGS_REMOTE_WORKLOAD, node).is_remote_workload());
        assert!(!RouteValue::new(FLAGS_LOCAL_WORKLOAD, node).is_remote_workload());
        assert!(!RouteValue::new(FLAGS_REMOTE_HOST, node).is_remote_workload());
        assert!(!RouteValue::new(FLAGS_LOCAL_HOST, node).is_remote_workload());
    }
}
