//! Read-only view of the current sync for the connection-tracking cleaner:
//! which destinations are still services and which frontend/backend pairs
//! are still valid.

use std::net::IpAddr;

use ahash::HashMapExt;
use knat_common::SvcId;
use knat_common::family::NatFamily;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::service::{Endpoint, Protocol, ServicePort};
use crate::syncer::Inner;

/// Holds the maps lock for the duration of a conntrack scan, so the views
/// cannot go stale under the scanner; dropping it ends the scan.
pub struct ConntrackScan<F: NatFamily, SM, EM, AM> {
    active_svcs: ahash::HashMap<(IpAddr, u16, u8), SvcId>,
    active_eps: ahash::HashMap<SvcId, ahash::HashSet<(IpAddr, u16)>>,
    _guard: OwnedMutexGuard<Inner<F, SM, EM, AM>>,
}

impl<F, SM, EM, AM> ConntrackScan<F, SM, EM, AM>
where
    F: NatFamily,
{
    pub(crate) fn new(guard: OwnedMutexGuard<Inner<F, SM, EM, AM>>) -> Self {
        let mut active_svcs = ahash::HashMap::new();
        let mut active_eps = ahash::HashMap::new();

        for (skey, sinfo) in &guard.new_svc_map {
            if sinfo.count == 0 {
                continue;
            }
            let eps = if skey.disc.is_derived() {
                None
            } else {
                guard.new_eps_map.get(&skey.sname).map(Vec::as_slice)
            };
            add_active(&mut active_svcs, &mut active_eps, sinfo.id, &sinfo.svc, eps);
        }

        Self {
            active_svcs,
            active_eps,
            _guard: guard,
        }
    }

    /// True if the destination is a known service of the current sync.
    pub fn dest_is_service(&self, addr: IpAddr, port: u16, proto: u8) -> bool {
        self.svc_id(addr, port, proto).is_some()
    }

    /// True if the frontend still routes to the given backend.
    pub fn frontend_has_backend(
        &self,
        addr: IpAddr,
        port: u16,
        backend_addr: IpAddr,
        backend_port: u16,
        proto: u8,
    ) -> bool {
        let Some(id) = self.svc_id(addr, port, proto) else {
            return false;
        };
        self.active_eps
            .get(&id)
            .is_some_and(|eps| eps.contains(&(backend_addr, backend_port)))
    }

    fn svc_id(&self, addr: IpAddr, port: u16, proto: u8) -> Option<SvcId> {
        self.active_svcs.get(&(addr, port, proto)).copied().or_else(|| {
            // a nodeport forwarded from the node that hosts the backing pod
            // presents itself on the sentinel address
            self.active_svcs
                .get(&(F::SENTINEL_NODEPORT_ADDR, port, proto))
                .copied()
        })
    }
}

impl<F: NatFamily, SM, EM, AM> Drop for ConntrackScan<F, SM, EM, AM> {
    fn drop(&mut self) {
        debug!("conntrack scan end");
    }
}

fn add_active(
    active_svcs: &mut ahash::HashMap<(IpAddr, u16, u8), SvcId>,
    active_eps: &mut ahash::HashMap<SvcId, ahash::HashSet<(IpAddr, u16)>>,
    id: SvcId,
    svc: &ServicePort,
    eps: Option<&[Endpoint]>,
) {
    active_svcs.insert((svc.cluster_ip(), svc.port(), svc.protocol().iana()), id);

    let Some(eps) = eps else {
        return;
    };
    if eps.is_empty() {
        return;
    }

    let set = active_eps.entry(id).or_default();
    for ep in eps {
        if ep.terminating && svc.protocol() == Protocol::Udp && svc.reap_terminating_udp() {
            // treat it as gone already so its conntrack entries get expired
            continue;
        }
        set.insert((ep.addr, ep.port));
    }
}
