//! Reconciles desired service state into the kernel NAT maps: computes the
//! keyed entries, drives the caching maps through the safe update order,
//! rebuilds its view from the kernel after a restart and keeps nodeport
//! entries for remote endpoints in step with the route table.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::{HashMapExt, HashSetExt};
use knat_common::SvcId;
use knat_common::family::{AffinityKey, AffinityValue, BackendValue, FrontendKey, NatFamily};
use knat_common::nat::{
    BackendKey, Cidr, FLG_EXCLUDE, FLG_EXTERNAL_LOCAL, FLG_INTERNAL_LOCAL, FrontendValue,
};
use nix::time::{ClockId, clock_gettime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conntrack::ConntrackScan;
use crate::map::{BpfMap, CachingMap};
use crate::routes::{RouteValue, Routes};
use crate::service::{
    DPSyncerState, Endpoint, ServicePort, ServicePortName, SessionAffinity, cidr_from_network,
    topology_aware_eligible,
};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum SvcDiscriminator {
    Primary,
    ExternalIp(IpAddr),
    NodePort(IpAddr),
    NodePortRemote(IpAddr),
    LoadBalancer(IpAddr),
}

impl SvcDiscriminator {
    /// Entries that merely alias the primary. NodePortRemote is
    /// semi-primary: it has its own backend set for NAT.
    pub(crate) fn is_derived(&self) -> bool {
        matches!(
            self,
            SvcDiscriminator::ExternalIp(_)
                | SvcDiscriminator::NodePort(_)
                | SvcDiscriminator::LoadBalancer(_)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SvcKey {
    pub(crate) sname: ServicePortName,
    pub(crate) disc: SvcDiscriminator,
}

impl SvcKey {
    fn primary(sname: &ServicePortName) -> Self {
        Self {
            sname: sname.clone(),
            disc: SvcDiscriminator::Primary,
        }
    }

    fn derived(sname: &ServicePortName, disc: SvcDiscriminator) -> Self {
        Self {
            sname: sname.clone(),
            disc,
        }
    }
}

impl fmt::Display for SvcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.disc {
            SvcDiscriminator::Primary => write!(f, "{}", self.sname),
            SvcDiscriminator::ExternalIp(a) => write!(f, "ExternalIP:{}:{}", a, self.sname),
            SvcDiscriminator::NodePort(a) => write!(f, "NodePort:{}:{}", a, self.sname),
            SvcDiscriminator::NodePortRemote(a) => {
                write!(f, "NodePortRemote:{}:{}", a, self.sname)
            }
            SvcDiscriminator::LoadBalancer(a) => write!(f, "LoadBalancer:{}:{}", a, self.sname),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SvcInfo {
    pub(crate) id: SvcId,
    pub(crate) count: u32,
    pub(crate) local_count: u32,
    pub(crate) svc: ServicePort,
}

struct StickyFrontend {
    id: SvcId,
    timeout: Duration,
}

/// Sticky bookkeeping of one sync pass, consumed by the affinity sweep.
struct Scratch<F: NatFamily> {
    sticky_svcs: ahash::HashMap<F::FrontendAffKey, StickyFrontend>,
    sticky_eps: ahash::HashMap<SvcId, ahash::HashSet<F::BackendValue>>,
}

impl<F: NatFamily> Scratch<F> {
    fn new() -> Self {
        Self {
            sticky_svcs: ahash::HashMap::new(),
            sticky_eps: ahash::HashMap::new(),
        }
    }
}

/// A nodeport whose endpoints could not be resolved against the route table
/// yet; kept for the background fix-up to retry.
#[derive(Clone, Debug)]
struct ExpandMiss {
    sname: ServicePortName,
    eps: Vec<Endpoint>,
}

struct FixupTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives the kernel NAT maps towards the desired service state. Not
/// reentrant: `apply` takes `&mut self`, callers serialize. The background
/// fix-up task and conntrack scans share only the state behind the maps
/// lock.
pub struct Syncer<F: NatFamily, SM, EM, AM, R> {
    inner: Arc<Mutex<Inner<F, SM, EM, AM>>>,
    rt: Arc<R>,
    trigger: Option<Arc<dyn Fn() + Send + Sync>>,
    synced: bool,
    stop: CancellationToken,
    fixup: Option<FixupTask>,
}

impl<F, SM, EM, AM, R> Syncer<F, SM, EM, AM, R>
where
    F: NatFamily,
    SM: BpfMap<F::FrontendKey, FrontendValue> + Send + 'static,
    EM: BpfMap<BackendKey, F::BackendValue> + Send + 'static,
    AM: BpfMap<F::AffinityKey, F::AffinityValue> + Send + 'static,
    R: Routes,
{
    pub fn new(
        node_port_ips: Vec<IpAddr>,
        frontend_map: SM,
        backend_map: EM,
        affinity_map: AM,
        rt: Arc<R>,
    ) -> Self {
        let node_port_ips = unique_ips(
            node_port_ips
                .into_iter()
                .filter(|ip| {
                    if F::FAMILY.matches(ip) {
                        true
                    } else {
                        debug!(addr = %ip, "nodeport address is not in the syncer family, ignoring");
                        false
                    }
                })
                .collect(),
        );

        Self {
            inner: Arc::new(Mutex::new(Inner::new(
                frontend_map,
                backend_map,
                affinity_map,
                node_port_ips,
            ))),
            rt,
            trigger: None,
            synced: false,
            stop: CancellationToken::new(),
            fixup: None,
        }
    }

    /// Registers the callback the fix-up task uses to request a new sync.
    /// The callback must not block.
    pub fn set_trigger(&mut self, trigger: impl Fn() + Send + Sync + 'static) {
        self.trigger = Some(Arc::new(trigger));
    }

    /// True once the first `apply` has succeeded.
    pub fn has_synced(&self) -> bool {
        self.synced
    }

    /// Realizes `state` in the kernel maps. The first call reconstructs the
    /// previous run's view from the dataplane; later calls install the diff.
    /// Errors leave partial state behind which the next call converges.
    pub async fn apply(&mut self, state: &DPSyncerState) -> Result<()> {
        if self.synced {
            // the fixer must not observe the maps mid-rewrite
            self.stop_expand_np_fixup().await;
        }

        let mut inner = self.inner.lock().await;
        if self.synced {
            inner.promote();
        } else {
            info!("loading NAT map state from the dataplane");
            inner.startup_sync(state)?;
            info!("loaded NAT map state from the dataplane");
        }

        let rt = Arc::clone(&self.rt);
        let mut scratch = Scratch::new();
        let misses = inner.apply_state(state, &mut scratch, &|addr| rt.lookup(addr))?;

        self.synced = true;

        // All updates are written; nothing will be adding affinity records
        // for frontends that no longer exist, so sweep them now.
        inner.cleanup_sticky(&scratch)?;
        drop(inner);

        self.run_expand_np_fixup(misses);

        Ok(())
    }

    /// Excludes `apply` from running and returns the conntrack view of the
    /// current state; dropping the returned scan ends it.
    pub async fn conntrack_scan_start(&self) -> ConntrackScan<F, SM, EM, AM> {
        debug!("conntrack scan start");
        let guard = Arc::clone(&self.inner).lock_owned().await;
        ConntrackScan::new(guard)
    }

    /// Idempotent shutdown; joins the background fix-up task.
    pub async fn stop(&mut self) {
        info!("syncer stopping");
        self.stop.cancel();
        self.stop_expand_np_fixup().await;
        info!("syncer stopped");
    }

    async fn stop_expand_np_fixup(&mut self) {
        if let Some(task) = self.fixup.take() {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                error!(%e, "nodeport fixup task failed");
            }
        }
    }

    fn run_expand_np_fixup(&mut self, misses: Vec<ExpandMiss>) {
        if misses.is_empty() {
            return;
        }
        if let Some(task) = self.fixup.take() {
            error!("nodeport fixup task still running, stopping it");
            task.cancel.cancel();
        }

        let cancel = self.stop.child_token();
        let token = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let rt = Arc::clone(&self.rt);
        let trigger = self.trigger.clone();

        let handle = tokio::spawn(async move {
            debug!("nodeport fixup started");
            let mut misses = misses;
            loop {
                // One pass right away; the routes may have moved while the
                // sync was being written.
                let mut changed = false;
                {
                    let _guard = inner.lock().await;
                    let mut again = Vec::with_capacity(misses.len());
                    for m in misses {
                        let (_, miss_eps) = expand_node_ports(&m.eps, &|addr| rt.lookup(addr));
                        if miss_eps.is_empty() {
                            debug!(service = %m.sname, "nodeport endpoints resolved");
                            changed = true;
                            continue;
                        }
                        if miss_eps != m.eps {
                            changed = true;
                        }
                        again.push(ExpandMiss { eps: miss_eps, ..m });
                    }
                    misses = again;
                }

                if changed {
                    if let Some(trigger) = &trigger {
                        debug!("nodeport fixup triggering a new sync");
                        trigger();
                    }
                    debug!("nodeport fixup exited");
                    return;
                }
                if misses.is_empty() {
                    debug!("nodeport fixup exited, all resolved");
                    return;
                }

                debug!(misses = misses.len(), "nodeport endpoints still unresolved");
                if !rt.wait_for_change(token.clone()).await {
                    debug!("nodeport fixup cancelled");
                    return;
                }
            }
        });

        self.fixup = Some(FixupTask { cancel, handle });
    }
}

pub(crate) struct Inner<F: NatFamily, SM, EM, AM> {
    svcs: CachingMap<F::FrontendKey, FrontendValue, SM>,
    eps: CachingMap<BackendKey, F::BackendValue, EM>,
    aff: AM,
    next_svc_id: SvcId,
    node_port_ips: Vec<IpAddr>,
    // new maps are built during apply and become prev at the start of the
    // next one, to be diffed against
    pub(crate) new_svc_map: ahash::HashMap<SvcKey, SvcInfo>,
    pub(crate) new_eps_map: ahash::HashMap<ServicePortName, Vec<Endpoint>>,
    prev_svc_map: ahash::HashMap<SvcKey, SvcInfo>,
    prev_eps_map: ahash::HashMap<ServicePortName, Vec<Endpoint>>,
}

impl<F, SM, EM, AM> Inner<F, SM, EM, AM>
where
    F: NatFamily,
    SM: BpfMap<F::FrontendKey, FrontendValue>,
    EM: BpfMap<BackendKey, F::BackendValue>,
    AM: BpfMap<F::AffinityKey, F::AffinityValue>,
{
    fn new(frontend_map: SM, backend_map: EM, affinity_map: AM, node_port_ips: Vec<IpAddr>) -> Self {
        Self {
            svcs: CachingMap::new(frontend_map),
            eps: CachingMap::new(backend_map),
            aff: affinity_map,
            next_svc_id: 0,
            node_port_ips,
            new_svc_map: ahash::HashMap::new(),
            new_eps_map: ahash::HashMap::new(),
            prev_svc_map: ahash::HashMap::new(),
            prev_eps_map: ahash::HashMap::new(),
        }
    }

    fn promote(&mut self) {
        self.prev_svc_map = std::mem::take(&mut self.new_svc_map);
        self.prev_eps_map = std::mem::take(&mut self.new_eps_map);
    }

    fn issue_svc_id(&mut self) -> SvcId {
        let id = self.next_svc_id;
        self.next_svc_id += 1;
        id
    }

    /// Cold start: read the kernel maps and cross-reference them against the
    /// desired state so ids and endpoints survive a restart. A failure to
    /// rebuild is not fatal, the maps just get disruptively rewritten.
    fn startup_sync(&mut self, state: &DPSyncerState) -> Result<()> {
        self.eps.load_cache_from_dataplane()?;
        self.svcs.load_cache_from_dataplane()?;

        if let Err(e) = self.startup_build_prev(state) {
            error!(
                %e,
                "failed to rebuild previous state from the dataplane, maps will get disruptively rewritten"
            );
        }
        Ok(())
    }

    fn startup_build_prev(&mut self, state: &DPSyncerState) -> Result<()> {
        // index every frontend key the desired state could have generated
        let index = self.svc_index(state);

        let mut inconsistent = false;

        let entries: Vec<(F::FrontendKey, FrontendValue)> = self
            .svcs
            .dataplane()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();

        for (fkey, fval) in entries {
            let Some(sname) = index.get(&fkey) else {
                continue;
            };
            let Some(svc) = state.svc_map.get(sname) else {
                continue;
            };
            let Some(skey) = self.match_frontend(&fkey, sname, svc) else {
                continue;
            };

            debug!(frontend = ?fkey, service = %skey, "resolved dataplane entry");

            self.prev_svc_map.insert(
                skey.clone(),
                SvcInfo {
                    id: fval.id,
                    count: fval.count,
                    local_count: fval.local_count,
                    svc: svc.clone(),
                },
            );
            if fval.id >= self.next_svc_id {
                self.next_svc_id = fval.id + 1;
            }

            if skey.disc != SvcDiscriminator::Primary {
                continue;
            }

            let mut eps = Vec::with_capacity(fval.count as usize);
            for idx in 0..fval.count {
                let bkey = BackendKey::new(fval.id, idx);
                let Some(bval) = self.eps.dataplane().get(&bkey) else {
                    warn!(id = fval.id, idx, "inconsistent backend map, missing slot");
                    inconsistent = true;
                    break;
                };
                eps.push(Endpoint::new(bval.addr(), bval.port()));
            }
            if !eps.is_empty() {
                self.prev_eps_map.insert(sname.clone(), eps);
            }
        }

        if inconsistent {
            self.prev_svc_map.clear();
            self.prev_eps_map.clear();
            return Err(Error::InconsistentMaps);
        }

        debug!(
            services = self.prev_svc_map.len(),
            endpoints = self.prev_eps_map.len(),
            next_id = self.next_svc_id,
            "rebuilt previous state from the dataplane"
        );
        Ok(())
    }

    /// Every `(addr, port, proto, src)` a frontend of the desired state
    /// could be keyed by, back to the service that would generate it.
    fn svc_index(&self, state: &DPSyncerState) -> ahash::HashMap<F::FrontendKey, ServicePortName> {
        let mut index = ahash::HashMap::with_capacity(state.svc_map.len());

        for (sname, svc) in &state.svc_map {
            let proto = svc.protocol().iana();
            let port = svc.port();

            let Some(key) = F::frontend_key(svc.cluster_ip(), port, proto) else {
                continue;
            };
            index.insert(key, sname.clone());

            let nport = svc.node_port();
            if nport != 0 {
                if let Some(key) = F::frontend_key(svc.cluster_ip(), nport, proto) {
                    index.insert(key, sname.clone());
                }
                for npip in &self.node_port_ips {
                    if let Some(key) = F::frontend_key(*npip, nport, proto) {
                        index.insert(key, sname.clone());
                    }
                }
            }

            for addr in svc.external_ips().iter().chain(svc.load_balancer_vips()) {
                let Some(key) = F::frontend_key(*addr, port, proto) else {
                    continue;
                };
                index.insert(key, sname.clone());
                for src in src_range_cidrs::<F>(svc) {
                    if let Some(key) = F::frontend_key_with_src(*addr, port, proto, src) {
                        index.insert(key, sname.clone());
                    }
                }
            }
        }

        index
    }

    /// Classifies a dataplane frontend against the service that the index
    /// says could have generated it. Primary, external and load-balancer
    /// rules win over the nodeport match, which is only the fallback for
    /// the case where the nodeport collides with the service port.
    fn match_frontend(
        &self,
        key: &F::FrontendKey,
        sname: &ServicePortName,
        svc: &ServicePort,
    ) -> Option<SvcKey> {
        let match_np = || {
            if svc.node_port() != 0 && key.port() == svc.node_port() {
                for npip in &self.node_port_ips {
                    if key.addr() == *npip {
                        return Some(SvcKey::derived(sname, SvcDiscriminator::NodePort(*npip)));
                    }
                }
            }
            None
        };

        if key.port() != svc.port() {
            return match_np();
        }

        let match_lb_src = || {
            let src = key.src_cidr();
            // a zero source CIDR is the regular entry, never stale
            if src.is_any() {
                return true;
            }
            if svc.load_balancer_source_ranges().is_empty() {
                return false;
            }
            src_range_cidrs::<F>(svc).any(|c| c == src)
        };

        if key.addr() == svc.cluster_ip() && key.src_cidr().is_any() {
            return Some(SvcKey::primary(sname));
        }

        for eip in svc.external_ips() {
            if key.addr() == *eip && match_lb_src() {
                return Some(SvcKey::derived(sname, SvcDiscriminator::ExternalIp(*eip)));
            }
        }

        for lbip in svc.load_balancer_vips() {
            if key.addr() == *lbip && match_lb_src() {
                return Some(SvcKey::derived(sname, SvcDiscriminator::LoadBalancer(*lbip)));
            }
        }

        // in case the nodeport is the same as the port
        match_np()
    }

    fn apply_state(
        &mut self,
        state: &DPSyncerState,
        scratch: &mut Scratch<F>,
        lookup: &dyn Fn(IpAddr) -> Option<RouteValue>,
    ) -> Result<Vec<ExpandMiss>> {
        info!(services = state.svc_map.len(), "applying new state");

        self.new_svc_map = ahash::HashMap::with_capacity(state.svc_map.len());
        self.new_eps_map = ahash::HashMap::with_capacity(state.eps_map.len());

        // repopulate both desired views from scratch and let the caching
        // maps work out the deltas
        self.svcs.desired().delete_all();
        self.eps.desired().delete_all();

        let mut misses = Vec::new();

        for (sname, svc) in &state.svc_map {
            if !F::FAMILY.matches(&svc.cluster_ip()) {
                debug!(service = %sname, "cluster address is not in the syncer family, skipping");
                continue;
            }
            debug!(service = %sname, "applying service");

            let eps: Vec<Endpoint> = state
                .eps_map
                .get(sname)
                .map(|eps| {
                    eps.iter()
                        .filter(|ep| ep.is_eligible() && F::FAMILY.matches(&ep.addr))
                        .filter(|ep| {
                            let eligible = topology_aware_eligible(
                                &state.node_zone,
                                svc.hints_annotation(),
                                &ep.zone_hints,
                            );
                            if !eligible {
                                debug!(
                                    endpoint = %ep.addr,
                                    zone = state.node_zone,
                                    "endpoint hinted away from this node's zone"
                                );
                            }
                            eligible
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            self.apply_svc(SvcKey::primary(sname), svc, &eps, scratch)?;

            for lbip in svc.load_balancer_vips() {
                let derived = svc.clone_with_frontend(*lbip, svc.port());
                if let Err(e) = self.apply_derived(
                    sname,
                    SvcDiscriminator::LoadBalancer(*lbip),
                    derived,
                    scratch,
                ) {
                    error!(%e, service = %sname, addr = %lbip, "failed to apply load balancer address");
                }
            }

            for eip in svc.external_ips() {
                let derived = svc.clone_with_frontend(*eip, svc.port());
                if let Err(e) =
                    self.apply_derived(sname, SvcDiscriminator::ExternalIp(*eip), derived, scratch)
                {
                    error!(%e, service = %sname, addr = %eip, "failed to apply external address");
                }
            }

            let nport = svc.node_port();
            if nport != 0 {
                for npip in self.node_port_ips.clone() {
                    if svc.internal_policy_local() && npip == F::SENTINEL_NODEPORT_ADDR {
                        // do not program the meta entry, each node gets
                        // programmed separately below
                        continue;
                    }
                    let derived = svc.clone_with_frontend(npip, nport);
                    if let Err(e) = self.apply_derived(
                        sname,
                        SvcDiscriminator::NodePort(npip),
                        derived,
                        scratch,
                    ) {
                        error!(%e, service = %sname, addr = %npip, "failed to apply nodeport");
                    }
                }

                if svc.internal_policy_local() {
                    let (per_node, miss_eps) = expand_node_ports(&eps, lookup);
                    for (node, neps) in per_node {
                        if let Err(e) =
                            self.apply_expanded_np(sname, svc, &neps, node, nport, scratch)
                        {
                            error!(%e, service = %sname, node = %node, "failed to expand nodeport");
                        }
                    }
                    if !miss_eps.is_empty() {
                        misses.push(ExpandMiss {
                            sname: sname.clone(),
                            eps: miss_eps,
                        });
                    }
                }
            }
        }

        // Remove unreferenced frontends first so their backends become
        // unreachable, add backends before any new frontend may reference
        // them, install the frontends, then reap the orphaned backends.
        self.svcs.apply_deletions_only()?;
        self.eps.apply_updates_only()?;
        self.svcs.apply_updates_only()?;
        self.eps.apply_deletions_only()?;

        info!("new state written");

        Ok(misses)
    }

    fn apply_svc(
        &mut self,
        skey: SvcKey,
        svc: &ServicePort,
        eps: &[Endpoint],
        scratch: &mut Scratch<F>,
    ) -> Result<()> {
        let prev_id = self
            .prev_svc_map
            .get(&skey)
            .filter(|prev| prev.svc == *svc)
            .map(|prev| prev.id);
        let id = prev_id.unwrap_or_else(|| self.issue_svc_id());

        let (count, local_count) = self.update_service(&skey, svc, id, eps, scratch)?;

        debug!(service = %skey, id, count, local_count, "applied service update");
        self.new_svc_map.insert(
            skey,
            SvcInfo {
                id,
                count,
                local_count,
                svc: svc.clone(),
            },
        );
        Ok(())
    }

    fn update_service(
        &mut self,
        skey: &SvcKey,
        svc: &ServicePort,
        id: SvcId,
        eps: &[Endpoint],
        scratch: &mut Scratch<F>,
    ) -> Result<(u32, u32)> {
        let mut count = 0;
        let mut local_count = 0;

        if matches!(svc.session_affinity(), SessionAffinity::ClientIp { .. }) {
            // backends are written before the frontend, have the set ready
            scratch.sticky_eps.entry(id).or_default();
        }

        // locals fill the slots first so the dataplane can prefer them up
        // to local_count; eligible endpoints may still be terminating and
        // only the ready ones get a slot
        for ep in eps.iter().filter(|ep| ep.local) {
            if ep.ready {
                self.write_backend(id, count, ep, scratch)?;
                count += 1;
                local_count += 1;
            }
        }
        for ep in eps.iter().filter(|ep| !ep.local) {
            if ep.ready {
                self.write_backend(id, count, ep, scratch)?;
                count += 1;
            }
        }

        let mut flags = 0;
        if svc.internal_policy_local() {
            flags |= FLG_INTERNAL_LOCAL;
        }

        self.write_frontend(svc, id, count, local_count, flags, scratch)?;

        // NodePortRemote has its own backends for NAT but must not
        // overwrite the endpoints the primary tracks for connection
        // cleanup.
        if !matches!(skey.disc, SvcDiscriminator::NodePortRemote(_)) {
            self.new_eps_map.insert(skey.sname.clone(), eps.to_vec());
        }

        Ok((count, local_count))
    }

    fn apply_derived(
        &mut self,
        sname: &ServicePortName,
        disc: SvcDiscriminator,
        svc: ServicePort,
        scratch: &mut Scratch<F>,
    ) -> Result<()> {
        let primary = self
            .new_svc_map
            .get(&SvcKey::primary(sname))
            .ok_or_else(|| Error::MissingClusterIp(sname.to_string()))?;
        let (id, count, local_count) = (primary.id, primary.count, primary.local_count);

        let mut flags = 0;
        if matches!(
            disc,
            SvcDiscriminator::NodePort(_) | SvcDiscriminator::LoadBalancer(_)
        ) {
            if svc.external_policy_local() {
                flags |= FLG_EXTERNAL_LOCAL;
            }
            if svc.internal_policy_local() {
                flags |= FLG_INTERNAL_LOCAL;
            }
        }

        self.write_frontend(&svc, id, count, local_count, flags, scratch)?;

        if matches!(
            disc,
            SvcDiscriminator::LoadBalancer(_) | SvcDiscriminator::ExternalIp(_)
        ) && let Err(e) = self.write_lb_src_range_keys(&svc, id, count, local_count, flags)
        {
            debug!(%e, "failed to write load balancer source range keys");
        }

        let skey = SvcKey::derived(sname, disc);
        debug!(service = %skey, id, "applied derived service update");
        self.new_svc_map.insert(
            skey,
            SvcInfo {
                id,
                count,
                local_count,
                svc,
            },
        );
        Ok(())
    }

    fn apply_expanded_np(
        &mut self,
        sname: &ServicePortName,
        svc: &ServicePort,
        eps: &[Endpoint],
        node: IpAddr,
        nport: u16,
        scratch: &mut Scratch<F>,
    ) -> Result<()> {
        let skey = SvcKey::derived(sname, SvcDiscriminator::NodePortRemote(node));
        let remote = svc.clone_with_frontend(node, nport);
        self.apply_svc(skey, &remote, eps, scratch)
    }

    fn write_backend(
        &mut self,
        id: SvcId,
        idx: u32,
        ep: &Endpoint,
        scratch: &mut Scratch<F>,
    ) -> Result<()> {
        let val = F::backend_value(ep.addr, ep.port).ok_or(Error::IpFamily(ep.addr))?;
        self.eps.desired().set(BackendKey::new(id, idx), val);

        if let Some(sticky) = scratch.sticky_eps.get_mut(&id) {
            sticky.insert(val);
        }
        Ok(())
    }

    fn write_frontend(
        &mut self,
        svc: &ServicePort,
        id: SvcId,
        count: u32,
        local_count: u32,
        mut flags: u32,
        scratch: &mut Scratch<F>,
    ) -> Result<()> {
        let key = self.frontend_key(svc)?;

        if svc.exclude_service() {
            flags |= FLG_EXCLUDE;
        }

        let timeo = svc.session_affinity().timeout_secs();
        let val = FrontendValue::with_flags(id, count, local_count, timeo, flags);
        self.svcs.desired().set(key, val);

        // the backends for this id are in the desired map by now
        if scratch.sticky_eps.contains_key(&id) {
            scratch.sticky_svcs.insert(
                key.affinity_key(),
                StickyFrontend {
                    id,
                    timeout: Duration::from_secs(u64::from(timeo)),
                },
            );
        }
        Ok(())
    }

    fn write_lb_src_range_keys(
        &mut self,
        svc: &ServicePort,
        id: SvcId,
        count: u32,
        local_count: u32,
        flags: u32,
    ) -> Result<()> {
        if svc.load_balancer_source_ranges().is_empty() {
            return Ok(());
        }

        let proto = svc.protocol().iana();
        let timeo = svc.session_affinity().timeout_secs();
        let val = FrontendValue::with_flags(id, count, local_count, timeo, flags);

        let keys: Vec<F::FrontendKey> = src_range_cidrs::<F>(svc)
            .filter_map(|src| F::frontend_key_with_src(svc.cluster_ip(), svc.port(), proto, src))
            .collect();
        for key in keys {
            self.svcs.desired().set(key, val);
        }

        // traffic that does not match a source range must not fall through
        // to the cluster entry
        let key = self.frontend_key(svc)?;
        self.svcs.desired().set(key, FrontendValue::black_hole(id));
        Ok(())
    }

    fn frontend_key(&self, svc: &ServicePort) -> Result<F::FrontendKey> {
        F::frontend_key(svc.cluster_ip(), svc.port(), svc.protocol().iana())
            .ok_or(Error::IpFamily(svc.cluster_ip()))
    }

    /// Walks the affinity map and drops every record whose frontend is gone,
    /// whose backend is gone, or that outlived its service's timeout.
    fn cleanup_sticky(&mut self, scratch: &Scratch<F>) -> Result<()> {
        let now = monotonic_ns()?;

        let records = self
            .aff
            .get_state()
            .map_err(|e| Error::AffinitySweep(e.to_string()))?;

        let mut stale = Vec::new();
        for (key, val) in records {
            let Some(fend) = scratch.sticky_svcs.get(&key.frontend()) else {
                debug!("cleaning affinity entry, no such service");
                stale.push(key);
                continue;
            };
            let known_backend = scratch
                .sticky_eps
                .get(&fend.id)
                .is_some_and(|eps| eps.contains(&val.backend()));
            if !known_backend {
                debug!("cleaning affinity entry, no such backend");
                stale.push(key);
                continue;
            }
            if now.saturating_sub(val.timestamp_ns()) > fend.timeout.as_nanos() as u64 {
                debug!("cleaning affinity entry, expired");
                stale.push(key);
            }
        }

        for key in stale {
            self.aff
                .delete(&key)
                .map_err(|e| Error::AffinitySweep(e.to_string()))?;
        }
        Ok(())
    }
}

/// Groups endpoints by the node that hosts them, per the route table. Local
/// routes are skipped (the primary entry serves them); endpoints without a
/// route yet come back as misses.
fn expand_node_ports(
    eps: &[Endpoint],
    lookup: &dyn Fn(IpAddr) -> Option<RouteValue>,
) -> (BTreeMap<IpAddr, Vec<Endpoint>>, Vec<Endpoint>) {
    let mut per_node: BTreeMap<IpAddr, Vec<Endpoint>> = BTreeMap::new();
    let mut miss = Vec::new();

    for ep in eps {
        let Some(route) = lookup(ep.addr) else {
            warn!(addr = %ep.addr, "no route for nodeport endpoint");
            miss.push(ep.clone());
            continue;
        };
        if route.is_remote_workload() {
            debug!(node = %route.next_hop(), dest = %ep.addr, "resolved remote nodeport endpoint");
            per_node.entry(route.next_hop()).or_default().push(ep.clone());
        }
    }

    (per_node, miss)
}

fn src_range_cidrs<F: NatFamily>(svc: &ServicePort) -> impl Iterator<Item = Cidr> + '_ {
    svc.load_balancer_source_ranges().iter().filter_map(|network| {
        let cidr = cidr_from_network(network);
        if F::FAMILY.matches(&cidr.addr) {
            Some(cidr)
        } else {
            debug!(%network, "source range is not in the syncer family, skipping");
            None
        }
    })
}

fn unique_ips(ips: Vec<IpAddr>) -> Vec<IpAddr> {
    let mut seen = ahash::HashSet::with_capacity(ips.len());
    ips.into_iter().filter(|ip| seen.insert(*ip)).collect()
}

fn monotonic_ns() -> Result<u64> {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
    Ok((ts.tv_sec() as u64).saturating_mul(1_000_000_000) + ts.tv_nsec() as u64)
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use knat_common::family::NatV4;
    use knat_common::nat::{AffinityKeyV4, AffinityValueV4, BackendValueV4, FrontendKeyV4};

    use super::*;
    use crate::routes::{FLAGS_LOCAL_WORKLOAD, FLAGS_REMOTE_WORKLOAD};
    use crate::service::Protocol;
    use crate::testutil::{MockRoutes, SharedMap};

    type SvcMap = SharedMap<FrontendKeyV4, FrontendValue>;
    type EpsMap = SharedMap<BackendKey, BackendValueV4>;
    type AffMap = SharedMap<AffinityKeyV4, AffinityValueV4>;
    type TestSyncer = Syncer<NatV4, SvcMap, EpsMap, AffMap, MockRoutes>;
    type TestInner = Inner<NatV4, SvcMap, EpsMap, AffMap>;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn v4bits(s: &str) -> u32 {
        s.parse::<Ipv4Addr>().unwrap().to_bits()
    }

    fn fkey(a: &str, port: u16, proto: u8) -> FrontendKeyV4 {
        FrontendKeyV4::new(v4bits(a), port, proto)
    }

    fn fkey_src(a: &str, port: u16, proto: u8, src: &str, prefix_len: u8) -> FrontendKeyV4 {
        FrontendKeyV4::with_src(v4bits(a), port, proto, v4bits(src), prefix_len)
    }

    fn bval(a: &str, port: u16) -> BackendValueV4 {
        BackendValueV4::new(v4bits(a), port)
    }

    fn make_ep(a: &str, port: u16, local: bool) -> Endpoint {
        let mut ep = Endpoint::new(addr(a), port);
        ep.local = local;
        ep
    }

    fn make_state(svcs: Vec<(ServicePortName, ServicePort, Vec<Endpoint>)>) -> DPSyncerState {
        let mut state = DPSyncerState::default();
        for (sname, svc, eps) in svcs {
            state.svc_map.insert(sname.clone(), svc);
            state.eps_map.insert(sname, eps);
        }
        state
    }

    fn make_syncer(node_port_ips: &[&str]) -> (TestSyncer, (SvcMap, EpsMap, AffMap), Arc<MockRoutes>) {
        let maps = (SharedMap::new(), SharedMap::new(), SharedMap::new());
        let rt = MockRoutes::new();
        let syncer = make_syncer_with(&maps, Arc::clone(&rt), node_port_ips);
        (syncer, maps, rt)
    }

    fn make_syncer_with(
        maps: &(SvcMap, EpsMap, AffMap),
        rt: Arc<MockRoutes>,
        node_port_ips: &[&str],
    ) -> TestSyncer {
        Syncer::new(
            node_port_ips.iter().map(|s| addr(s)).collect(),
            maps.0.clone(),
            maps.1.clone(),
            maps.2.clone(),
            rt,
        )
    }

    fn make_inner(node_port_ips: &[&str]) -> TestInner {
        Inner::new(
            SharedMap::new(),
            SharedMap::new(),
            SharedMap::new(),
            node_port_ips.iter().map(|s| addr(s)).collect(),
        )
    }

    fn nginx() -> ServicePortName {
        ServicePortName::new("default/nginx", "http")
    }

    #[tokio::test]
    async fn test_single_cluster_ip_service() -> crate::Result<()> {
        let (mut syncer, (svcs, eps, _aff), _rt) = make_syncer(&[]);
        assert!(!syncer.has_synced());

        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp);
        let state = make_state(vec![(
            nginx(),
            svc,
            vec![
                make_ep("2.0.0.1", 8080, true),
                make_ep("2.0.0.2", 8080, false),
                make_ep("2.0.0.3", 8080, false),
            ],
        )]);

        syncer.apply(&state).await?;
        assert!(syncer.has_synced());

        assert_eq!(svcs.len(), 1);
        assert_eq!(
            svcs.get(&fkey("10.0.0.1", 80, 6)),
            Some(FrontendValue::new(0, 3, 1))
        );

        // the local endpoint owns the first slot
        assert_eq!(eps.len(), 3);
        assert_eq!(eps.get(&BackendKey::new(0, 0)), Some(bval("2.0.0.1", 8080)));
        assert_eq!(eps.get(&BackendKey::new(0, 1)), Some(bval("2.0.0.2", 8080)));
        assert_eq!(eps.get(&BackendKey::new(0, 2)), Some(bval("2.0.0.3", 8080)));

        Ok(())
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() -> crate::Result<()> {
        let (mut syncer, (svcs, eps, _aff), _rt) = make_syncer(&[]);

        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp);
        let state = make_state(vec![(
            nginx(),
            svc,
            vec![make_ep("2.0.0.1", 8080, true), make_ep("2.0.0.2", 8080, false)],
        )]);

        syncer.apply(&state).await?;
        svcs.reset_counts();
        eps.reset_counts();

        syncer.apply(&state).await?;
        assert_eq!(svcs.update_count() + svcs.delete_count(), 0);
        assert_eq!(eps.update_count() + eps.delete_count(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_endpoint_change_keeps_id_and_repacks() -> crate::Result<()> {
        let (mut syncer, (svcs, eps, _aff), _rt) = make_syncer(&[]);

        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp);
        let state = make_state(vec![(
            nginx(),
            svc.clone(),
            vec![
                make_ep("2.0.0.1", 8080, true),
                make_ep("2.0.0.2", 8080, false),
                make_ep("2.0.0.3", 8080, false),
            ],
        )]);
        syncer.apply(&state).await?;

        svcs.reset_counts();
        eps.reset_counts();

        // same endpoints permuted plus one new local one
        let state = make_state(vec![(
            nginx(),
            svc,
            vec![
                make_ep("2.0.0.3", 8080, false),
                make_ep("2.0.0.1", 8080, true),
                make_ep("2.0.0.4", 8080, true),
                make_ep("2.0.0.2", 8080, false),
            ],
        )]);
        syncer.apply(&state).await?;

        let front = svcs.get(&fkey("10.0.0.1", 80, 6)).unwrap();
        assert_eq!((front.id, front.count, front.local_count), (0, 4, 2));
        assert!(front.local_count <= front.count);

        // locals packed first, then the rest in their given order
        assert_eq!(eps.get(&BackendKey::new(0, 0)), Some(bval("2.0.0.1", 8080)));
        assert_eq!(eps.get(&BackendKey::new(0, 1)), Some(bval("2.0.0.4", 8080)));
        assert_eq!(eps.get(&BackendKey::new(0, 2)), Some(bval("2.0.0.3", 8080)));
        assert_eq!(eps.get(&BackendKey::new(0, 3)), Some(bval("2.0.0.2", 8080)));

        // the primary was updated in place, nothing was deleted
        assert_eq!(svcs.delete_count(), 0);
        assert_eq!(eps.delete_count(), 0);

        // shrinking reaps the orphaned slots
        let state = make_state(vec![(
            nginx(),
            ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp),
            vec![make_ep("2.0.0.1", 8080, true)],
        )]);
        syncer.apply(&state).await?;
        assert_eq!(eps.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_changed_service_gets_fresh_id() -> crate::Result<()> {
        let (mut syncer, (svcs, _eps, _aff), _rt) = make_syncer(&[]);

        let state = make_state(vec![(
            nginx(),
            ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp),
            vec![make_ep("2.0.0.1", 8080, false)],
        )]);
        syncer.apply(&state).await?;
        assert_eq!(svcs.get(&fkey("10.0.0.1", 80, 6)).unwrap().id, 0);

        // the service no longer compares equal, so it gets a fresh id
        let state = make_state(vec![(
            nginx(),
            ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp).with_sticky_client_ip(30),
            vec![make_ep("2.0.0.1", 8080, false)],
        )]);
        syncer.apply(&state).await?;
        let front = svcs.get(&fkey("10.0.0.1", 80, 6)).unwrap();
        assert_eq!(front.id, 1);
        assert_eq!(front.affinity_timeo, 30);

        // and keeps it while it stays equal
        syncer.apply(&state).await?;
        assert_eq!(svcs.get(&fkey("10.0.0.1", 80, 6)).unwrap().id, 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_nodeport_sentinel_suppression_and_remote_expansion() -> crate::Result<()> {
        let (mut syncer, (svcs, eps, _aff), rt) = make_syncer(&["192.168.1.10", "255.255.255.255"]);
        rt.set(
            addr("2.0.0.1"),
            RouteValue::new(FLAGS_LOCAL_WORKLOAD, addr("192.168.1.10")),
        );
        rt.set(
            addr("2.0.0.2"),
            RouteValue::new(FLAGS_REMOTE_WORKLOAD, addr("192.168.2.1")),
        );
        rt.set(
            addr("2.0.0.3"),
            RouteValue::new(FLAGS_REMOTE_WORKLOAD, addr("192.168.2.2")),
        );

        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp)
            .with_node_port(31000)
            .with_internal_policy_local();
        let state = make_state(vec![(
            nginx(),
            svc,
            vec![
                make_ep("2.0.0.1", 8080, true),
                make_ep("2.0.0.2", 8080, false),
                make_ep("2.0.0.3", 8080, false),
            ],
        )]);
        syncer.apply(&state).await?;

        // the meta entry on the sentinel address is suppressed
        assert!(svcs.get(&fkey("255.255.255.255", 31000, 6)).is_none());

        let primary = svcs.get(&fkey("10.0.0.1", 80, 6)).unwrap();
        assert_eq!((primary.count, primary.local_count), (3, 1));
        assert_eq!(primary.flags, FLG_INTERNAL_LOCAL);

        // the real nodeport address aliases the primary
        let np = svcs.get(&fkey("192.168.1.10", 31000, 6)).unwrap();
        assert_eq!((np.id, np.count, np.local_count), (primary.id, 3, 1));
        assert_eq!(np.flags, FLG_INTERNAL_LOCAL);

        // one NodePortRemote entry per next-hop node, each with its own
        // backend set; the local endpoint is served by the primary
        let remote1 = svcs.get(&fkey("192.168.2.1", 31000, 6)).unwrap();
        let remote2 = svcs.get(&fkey("192.168.2.2", 31000, 6)).unwrap();
        assert_ne!(remote1.id, primary.id);
        assert_ne!(remote2.id, remote1.id);
        assert_eq!((remote1.count, remote1.local_count), (1, 0));
        assert_eq!((remote2.count, remote2.local_count), (1, 0));
        assert_eq!(
            eps.get(&BackendKey::new(remote1.id, 0)),
            Some(bval("2.0.0.2", 8080))
        );
        assert_eq!(
            eps.get(&BackendKey::new(remote2.id, 0)),
            Some(bval("2.0.0.3", 8080))
        );

        assert_eq!(svcs.len(), 4);
        assert_eq!(eps.len(), 5);

        Ok(())
    }

    #[tokio::test]
    async fn test_lb_source_ranges_blackhole() -> crate::Result<()> {
        let (mut syncer, (svcs, _eps, _aff), _rt) = make_syncer(&[]);

        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp)
            .with_load_balancer_vips([addr("203.0.113.7")])
            .with_load_balancer_source_ranges(["198.51.100.0/24".parse().unwrap()]);
        let state = make_state(vec![(nginx(), svc, vec![make_ep("2.0.0.1", 8080, false)])]);
        syncer.apply(&state).await?;

        let primary = svcs.get(&fkey("10.0.0.1", 80, 6)).unwrap();

        // allowed sources get the real entry
        let ranged = svcs
            .get(&fkey_src("203.0.113.7", 80, 6, "198.51.100.0", 24))
            .unwrap();
        assert_eq!((ranged.id, ranged.count), (primary.id, 1));

        // everything else on the VIP is dropped instead of falling through
        let black_hole = svcs.get(&fkey("203.0.113.7", 80, 6)).unwrap();
        assert!(black_hole.is_black_hole());
        assert_eq!(black_hole.id, primary.id);

        Ok(())
    }

    #[tokio::test]
    async fn test_affinity_cleanup() -> crate::Result<()> {
        let (mut syncer, (_svcs, _eps, aff), _rt) = make_syncer(&[]);

        let fresh = monotonic_ns()?;
        let stale = fresh.saturating_sub(2_000_000_000);
        let front = fkey("10.0.0.1", 80, 6);
        let gone = fkey("10.9.9.9", 80, 6);

        let kept = AffinityKeyV4::new(v4bits("7.0.0.1"), front.affinity_key());
        aff.seed(kept, AffinityValueV4::new(fresh, bval("2.0.0.1", 8080)));
        // service that is no longer in the state
        aff.seed(
            AffinityKeyV4::new(v4bits("7.0.0.2"), gone.affinity_key()),
            AffinityValueV4::new(fresh, bval("2.0.0.9", 8080)),
        );
        // backend the service no longer has
        aff.seed(
            AffinityKeyV4::new(v4bits("7.0.0.3"), front.affinity_key()),
            AffinityValueV4::new(fresh, bval("2.0.0.250", 8080)),
        );
        // outlived the timeout
        aff.seed(
            AffinityKeyV4::new(v4bits("7.0.0.4"), front.affinity_key()),
            AffinityValueV4::new(stale, bval("2.0.0.1", 8080)),
        );

        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp).with_sticky_client_ip(1);
        let state = make_state(vec![(nginx(), svc, vec![make_ep("2.0.0.1", 8080, false)])]);
        syncer.apply(&state).await?;

        assert_eq!(aff.len(), 1);
        assert!(aff.get(&kept).is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_cold_start_reconstruction() -> crate::Result<()> {
        let (mut first, maps, rt) = make_syncer(&["192.168.1.10"]);

        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp)
            .with_node_port(31000)
            .with_external_ips([addr("192.0.2.10")])
            .with_load_balancer_vips([addr("203.0.113.7")])
            .with_load_balancer_source_ranges(["198.51.100.0/24".parse().unwrap()])
            .with_sticky_client_ip(60);
        let state = make_state(vec![(
            nginx(),
            svc,
            vec![
                make_ep("2.0.0.1", 8080, true),
                make_ep("2.0.0.2", 8080, false),
            ],
        )]);

        first.apply(&state).await?;
        first.stop().await;
        let frontends = maps.0.snapshot();
        let backends = maps.1.snapshot();

        // a new process finds the kernel maps as the old one left them
        let mut second = make_syncer_with(&maps, rt, &["192.168.1.10"]);
        maps.0.reset_counts();
        maps.1.reset_counts();

        second.apply(&state).await?;
        assert!(second.has_synced());

        assert_eq!(maps.0.update_count() + maps.0.delete_count(), 0);
        assert_eq!(maps.1.update_count() + maps.1.delete_count(), 0);
        assert_eq!(maps.2.delete_count(), 0);
        assert_eq!(maps.0.snapshot(), frontends);
        assert_eq!(maps.1.snapshot(), backends);

        Ok(())
    }

    #[tokio::test]
    async fn test_cold_start_inconsistent_maps() -> crate::Result<()> {
        let (mut syncer, (svcs, eps, _aff), _rt) = make_syncer(&[]);

        // a surviving frontend whose backend slots are incomplete
        svcs.seed(fkey("10.0.0.1", 80, 6), FrontendValue::new(5, 2, 0));
        eps.seed(BackendKey::new(5, 0), bval("2.0.0.1", 8080));

        let state = make_state(vec![(
            nginx(),
            ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp),
            vec![make_ep("2.0.0.1", 8080, false)],
        )]);
        syncer.apply(&state).await?;

        // the previous state was abandoned: a fresh id past the highest
        // observed one, and the stale slot reaped
        let front = svcs.get(&fkey("10.0.0.1", 80, 6)).unwrap();
        assert_eq!((front.id, front.count), (6, 1));
        assert_eq!(eps.get(&BackendKey::new(6, 0)), Some(bval("2.0.0.1", 8080)));
        assert!(eps.get(&BackendKey::new(5, 0)).is_none());
        assert_eq!(eps.len(), 1);

        Ok(())
    }

    #[test]
    fn test_match_frontend_precedence() {
        let inner = make_inner(&["192.168.1.10"]);
        let sname = nginx();

        // nodeport colliding with the service port
        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp)
            .with_node_port(80)
            .with_external_ips([addr("192.168.1.10")]);

        // the cluster entry resolves as the primary
        assert_eq!(
            inner.match_frontend(&fkey("10.0.0.1", 80, 6), &sname, &svc),
            Some(SvcKey::primary(&sname))
        );
        // an address that is both external and nodeport resolves as external
        assert_eq!(
            inner.match_frontend(&fkey("192.168.1.10", 80, 6), &sname, &svc),
            Some(SvcKey::derived(
                &sname,
                SvcDiscriminator::ExternalIp(addr("192.168.1.10"))
            ))
        );

        // with no better rule the nodeport match is the fallback
        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp).with_node_port(80);
        assert_eq!(
            inner.match_frontend(&fkey("192.168.1.10", 80, 6), &sname, &svc),
            Some(SvcKey::derived(
                &sname,
                SvcDiscriminator::NodePort(addr("192.168.1.10"))
            ))
        );

        // a port that is neither service port nor nodeport matches nothing
        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp).with_node_port(31000);
        assert_eq!(
            inner.match_frontend(&fkey("10.0.0.1", 31001, 6), &sname, &svc),
            None
        );
        assert_eq!(
            inner.match_frontend(&fkey("192.168.1.10", 31000, 6), &sname, &svc),
            Some(SvcKey::derived(
                &sname,
                SvcDiscriminator::NodePort(addr("192.168.1.10"))
            ))
        );
    }

    #[test]
    fn test_match_frontend_source_ranges() {
        let inner = make_inner(&[]);
        let sname = nginx();

        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp)
            .with_load_balancer_vips([addr("203.0.113.7")])
            .with_load_balancer_source_ranges(["198.51.100.0/24".parse().unwrap()]);

        // the zero-source entry and a matching range are both valid
        assert_eq!(
            inner.match_frontend(&fkey("203.0.113.7", 80, 6), &sname, &svc),
            Some(SvcKey::derived(
                &sname,
                SvcDiscriminator::LoadBalancer(addr("203.0.113.7"))
            ))
        );
        assert_eq!(
            inner.match_frontend(&fkey_src("203.0.113.7", 80, 6, "198.51.100.0", 24), &sname, &svc),
            Some(SvcKey::derived(
                &sname,
                SvcDiscriminator::LoadBalancer(addr("203.0.113.7"))
            ))
        );
        // a range the service does not carry is stale
        assert_eq!(
            inner.match_frontend(&fkey_src("203.0.113.7", 80, 6, "198.51.101.0", 24), &sname, &svc),
            None
        );

        // when the service has no ranges at all, ranged entries are stale
        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp)
            .with_load_balancer_vips([addr("203.0.113.7")]);
        assert_eq!(
            inner.match_frontend(&fkey_src("203.0.113.7", 80, 6, "198.51.100.0", 24), &sname, &svc),
            None
        );
    }

    #[tokio::test]
    async fn test_apply_error_converges() -> crate::Result<()> {
        let (mut syncer, (svcs, eps, _aff), _rt) = make_syncer(&[]);

        let state = make_state(vec![(
            nginx(),
            ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp),
            vec![make_ep("2.0.0.1", 8080, false)],
        )]);

        eps.fail_updates(true);
        assert!(syncer.apply(&state).await.is_err());
        assert!(!syncer.has_synced());

        eps.fail_updates(false);
        syncer.apply(&state).await?;
        assert!(syncer.has_synced());
        assert_eq!(svcs.len(), 1);
        assert_eq!(eps.get(&BackendKey::new(0, 0)), Some(bval("2.0.0.1", 8080)));

        Ok(())
    }

    #[tokio::test]
    async fn test_nodeport_fixup_triggers_resync() -> crate::Result<()> {
        let (mut syncer, (svcs, _eps, _aff), rt) = make_syncer(&["255.255.255.255"]);

        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp)
            .with_node_port(31000)
            .with_internal_policy_local();
        let state = make_state(vec![(nginx(), svc, vec![make_ep("2.0.0.2", 8080, false)])]);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        syncer.set_trigger(move || {
            let _ = tx.send(());
        });

        // no route for the endpoint yet: only the primary gets programmed
        // and the fixer starts waiting on the route table
        syncer.apply(&state).await?;
        assert_eq!(svcs.len(), 1);

        rt.set(
            addr("2.0.0.2"),
            RouteValue::new(FLAGS_REMOTE_WORKLOAD, addr("192.168.2.1")),
        );

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("fixup did not trigger")
            .expect("trigger channel closed");

        // the owner answers the trigger with another apply
        syncer.apply(&state).await?;
        let remote = svcs.get(&fkey("192.168.2.1", 31000, 6)).unwrap();
        assert_eq!((remote.count, remote.local_count), (1, 0));

        syncer.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() -> crate::Result<()> {
        let (mut syncer, _maps, rt) = make_syncer(&["255.255.255.255"]);

        let svc = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp)
            .with_node_port(31000)
            .with_internal_policy_local();
        let state = make_state(vec![(nginx(), svc, vec![make_ep("2.0.0.2", 8080, false)])]);

        // leaves a fixup task waiting on the route table
        syncer.apply(&state).await?;

        syncer.stop().await;
        syncer.stop().await;
        drop(rt);
        Ok(())
    }

    #[tokio::test]
    async fn test_conntrack_views() -> crate::Result<()> {
        let (mut syncer, _maps, _rt) = make_syncer(&["192.168.1.10", "255.255.255.255"]);

        let web = ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp).with_node_port(31000);
        let mut terminating = make_ep("2.0.0.2", 8080, false);
        terminating.ready = false;
        terminating.terminating = true;

        let dns = ServicePortName::new("kube-system/dns", "dns");
        let dns_svc =
            ServicePort::new(addr("10.0.0.2"), 53, Protocol::Udp).with_reap_terminating_udp();
        let mut dns_terminating = make_ep("2.0.1.2", 53, false);
        dns_terminating.ready = false;
        dns_terminating.terminating = true;

        let state = make_state(vec![
            (
                nginx(),
                web,
                vec![make_ep("2.0.0.1", 8080, true), terminating],
            ),
            (
                dns,
                dns_svc,
                vec![make_ep("2.0.1.1", 53, false), dns_terminating],
            ),
        ]);
        syncer.apply(&state).await?;

        let scan = syncer.conntrack_scan_start().await;

        assert!(scan.dest_is_service(addr("10.0.0.1"), 80, 6));
        assert!(scan.dest_is_service(addr("192.168.1.10"), 31000, 6));
        // a nodeport forwarded here from another node hits the sentinel
        assert!(scan.dest_is_service(addr("10.200.0.99"), 31000, 6));
        assert!(!scan.dest_is_service(addr("10.0.0.9"), 80, 6));
        assert!(!scan.dest_is_service(addr("10.0.0.1"), 81, 6));

        assert!(scan.frontend_has_backend(addr("10.0.0.1"), 80, addr("2.0.0.1"), 8080, 6));
        // terminating TCP endpoints keep their connections
        assert!(scan.frontend_has_backend(addr("10.0.0.1"), 80, addr("2.0.0.2"), 8080, 6));
        assert!(!scan.frontend_has_backend(addr("10.0.0.1"), 80, addr("2.0.0.3"), 8080, 6));

        // terminating UDP endpoints of a reaping service count as gone
        assert!(scan.frontend_has_backend(addr("10.0.0.2"), 53, addr("2.0.1.1"), 53, 17));
        assert!(!scan.frontend_has_backend(addr("10.0.0.2"), 53, addr("2.0.1.2"), 53, 17));

        drop(scan);

        // the scan released the maps lock, a new apply goes through
        syncer.apply(&state).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_removed_service_is_unrouted() -> crate::Result<()> {
        let (mut syncer, (svcs, eps, _aff), _rt) = make_syncer(&[]);

        let other = ServicePortName::new("default/other", "http");
        let state = make_state(vec![
            (
                nginx(),
                ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp),
                vec![make_ep("2.0.0.1", 8080, false)],
            ),
            (
                other.clone(),
                ServicePort::new(addr("10.0.0.2"), 80, Protocol::Tcp),
                vec![make_ep("2.0.1.1", 8080, false)],
            ),
        ]);
        syncer.apply(&state).await?;
        assert_eq!(svcs.len(), 2);
        assert_eq!(eps.len(), 2);

        let kept = svcs.get(&fkey("10.0.0.1", 80, 6)).unwrap();

        let state = make_state(vec![(
            nginx(),
            ServicePort::new(addr("10.0.0.1"), 80, Protocol::Tcp),
            vec![make_ep("2.0.0.1", 8080, false)],
        )]);
        syncer.apply(&state).await?;

        assert_eq!(svcs.len(), 1);
        assert_eq!(eps.len(), 1);
        assert!(svcs.get(&fkey("10.0.0.2", 80, 6)).is_none());
        // the surviving service was untouched
        assert_eq!(svcs.get(&fkey("10.0.0.1", 80, 6)), Some(kept));

        Ok(())
    }

    #[test]
    fn test_unique_ips() {
        let ips = vec![
            addr("192.168.1.10"),
            addr("255.255.255.255"),
            addr("192.168.1.10"),
        ];
        assert_eq!(
            unique_ips(ips),
            vec![addr("192.168.1.10"), addr("255.255.255.255")]
        );
    }
}
