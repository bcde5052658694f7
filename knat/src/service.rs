//! The canonical in-memory view of a service port and its endpoints, plus
//! the desired-state bundle the reconciler consumes.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use knat_common::nat::Cidr;

use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    /// IANA protocol number, as carried in the frontend keys.
    pub const fn iana(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Sctp => 132,
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "SCTP" => Ok(Protocol::Sctp),
            _ => Err(Error::UnknownProtocol(s.to_owned())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

/// Identity of one port of one service: `namespace/name` plus the port name
/// (empty for unnamed ports).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServicePortName {
    pub name: String,
    pub port: String,
}

impl ServicePortName {
    pub fn new(name: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}", self.name, self.port)
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionAffinity {
    #[default]
    None,
    ClientIp {
        max_age_secs: u32,
    },
}

impl SessionAffinity {
    pub fn timeout_secs(&self) -> u32 {
        match self {
            SessionAffinity::None => 0,
            SessionAffinity::ClientIp { max_age_secs } => *max_age_secs,
        }
    }
}

/// One service port as the reconciler sees it. Equality is over every
/// observable, with the address and range collections comparing as sets;
/// a service keeps its dataplane id across syncs exactly as long as it
/// compares equal to its previous self.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePort {
    cluster_ip: IpAddr,
    port: u16,
    protocol: Protocol,
    node_port: u16,
    external_ips: BTreeSet<IpAddr>,
    load_balancer_vips: BTreeSet<IpAddr>,
    load_balancer_source_ranges: BTreeSet<IpNetwork>,
    session_affinity: SessionAffinity,
    health_check_node_port: u16,
    external_policy_local: bool,
    internal_policy_local: bool,
    hints_annotation: String,
    exclude_service: bool,
    reap_terminating_udp: bool,
}

impl ServicePort {
    pub fn new(cluster_ip: IpAddr, port: u16, protocol: Protocol) -> Self {
        Self {
            cluster_ip,
            port,
            protocol,
            node_port: 0,
            external_ips: BTreeSet::new(),
            load_balancer_vips: BTreeSet::new(),
            load_balancer_source_ranges: BTreeSet::new(),
            session_affinity: SessionAffinity::None,
            health_check_node_port: 0,
            external_policy_local: false,
            internal_policy_local: false,
            hints_annotation: String::new(),
            exclude_service: false,
            reap_terminating_udp: false,
        }
    }

    pub fn with_node_port(mut self, node_port: u16) -> Self {
        self.node_port = node_port;
        self
    }

    pub fn with_external_ips(mut self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.external_ips = ips.into_iter().collect();
        self
    }

    pub fn with_load_balancer_vips(mut self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.load_balancer_vips = ips.into_iter().collect();
        self
    }

    pub fn with_load_balancer_source_ranges(
        mut self,
        ranges: impl IntoIterator<Item = IpNetwork>,
    ) -> Self {
        self.load_balancer_source_ranges = ranges.into_iter().collect();
        self
    }

    pub fn with_sticky_client_ip(mut self, max_age_secs: u32) -> Self {
        self.session_affinity = SessionAffinity::ClientIp { max_age_secs };
        self
    }

    pub fn with_health_check_node_port(mut self, port: u16) -> Self {
        self.health_check_node_port = port;
        self
    }

    pub fn with_external_policy_local(mut self) -> Self {
        self.external_policy_local = true;
        self
    }

    pub fn with_internal_policy_local(mut self) -> Self {
        self.internal_policy_local = true;
        self
    }

    pub fn with_hints_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.hints_annotation = annotation.into();
        self
    }

    pub fn with_exclude_service(mut self) -> Self {
        self.exclude_service = true;
        self
    }

    pub fn with_reap_terminating_udp(mut self) -> Self {
        self.reap_terminating_udp = true;
        self
    }

    /// Copy of the service presenting itself on a different frontend;
    /// derived entries (NodePort/ExternalIP/LoadBalancer/NodePortRemote)
    /// keep everything else of their primary.
    pub(crate) fn clone_with_frontend(&self, addr: IpAddr, port: u16) -> Self {
        Self {
            cluster_ip: addr,
            port,
            ..self.clone()
        }
    }

    pub fn cluster_ip(&self) -> IpAddr {
        self.cluster_ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn node_port(&self) -> u16 {
        self.node_port
    }

    pub fn external_ips(&self) -> &BTreeSet<IpAddr> {
        &self.external_ips
    }

    pub fn load_balancer_vips(&self) -> &BTreeSet<IpAddr> {
        &self.load_balancer_vips
    }

    pub fn load_balancer_source_ranges(&self) -> &BTreeSet<IpNetwork> {
        &self.load_balancer_source_ranges
    }

    pub fn session_affinity(&self) -> SessionAffinity {
        self.session_affinity
    }

    pub fn health_check_node_port(&self) -> u16 {
        self.health_check_node_port
    }

    pub fn external_policy_local(&self) -> bool {
        self.external_policy_local
    }

    pub fn internal_policy_local(&self) -> bool {
        self.internal_policy_local
    }

    pub fn hints_annotation(&self) -> &str {
        &self.hints_annotation
    }

    pub fn exclude_service(&self) -> bool {
        self.exclude_service
    }

    pub fn reap_terminating_udp(&self) -> bool {
        self.reap_terminating_udp
    }

    /// Reachable via something other than the cluster address.
    pub fn externally_accessible(&self) -> bool {
        self.node_port != 0 || !self.load_balancer_vips.is_empty() || !self.external_ips.is_empty()
    }

    /// Ever sends traffic to endpoints under "Cluster" traffic policy. Even
    /// with a Local external policy the cluster endpoints are needed for
    /// short circuiting.
    pub fn uses_cluster_endpoints(&self) -> bool {
        !self.internal_policy_local || self.externally_accessible()
    }

    /// Ever sends traffic to endpoints under "Local" traffic policy.
    pub fn uses_local_endpoints(&self) -> bool {
        self.internal_policy_local || (self.external_policy_local && self.externally_accessible())
    }
}

impl fmt::Display for ServicePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.cluster_ip, self.port, self.protocol)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
    pub local: bool,
    pub ready: bool,
    pub terminating: bool,
    pub zone_hints: BTreeSet<String>,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            local: false,
            ready: true,
            terminating: false,
            zone_hints: BTreeSet::new(),
        }
    }

    /// Terminating endpoints still count; fully gone ones do not.
    pub fn is_eligible(&self) -> bool {
        self.ready || self.terminating
    }
}

/// Whether an endpoint with `zone_hints` should be used from a node in
/// `node_zone`. Hints only apply when the service opts in through its
/// annotation and both sides actually carry a zone.
pub fn topology_aware_eligible(
    node_zone: &str,
    hints_annotation: &str,
    zone_hints: &BTreeSet<String>,
) -> bool {
    if !matches!(hints_annotation, "auto" | "Auto") {
        return true;
    }
    if zone_hints.is_empty() || node_zone.is_empty() {
        return true;
    }
    zone_hints.contains(node_zone)
}

pub(crate) fn cidr_from_network(network: &IpNetwork) -> Cidr {
    Cidr::new(network.network(), network.prefix())
}

/// The desired state one sync call realizes.
#[derive(Clone, Debug, Default)]
pub struct DPSyncerState {
    pub svc_map: ahash::HashMap<ServicePortName, ServicePort>,
    pub eps_map: ahash::HashMap<ServicePortName, Vec<Endpoint>>,
    pub node_zone: String,
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("SCTP".parse::<Protocol>().unwrap().iana(), 132);
        assert!(matches!(
            "tcp".parse::<Protocol>(),
            Err(Error::UnknownProtocol(_))
        ));
    }

    #[test]
    fn test_equality_is_set_based() {
        let a = ServicePort::new(addr("10.96.0.1"), 80, Protocol::Tcp)
            .with_external_ips([addr("192.0.2.1"), addr("192.0.2.2")]);
        let b = ServicePort::new(addr("10.96.0.1"), 80, Protocol::Tcp)
            .with_external_ips([addr("192.0.2.2"), addr("192.0.2.1")]);
        assert_eq!(a, b);

        let c = b.clone().with_sticky_client_ip(30);
        assert_ne!(a, c);
    }

    #[test]
    fn test_externally_accessible() {
        let svc = ServicePort::new(addr("10.96.0.1"), 80, Protocol::Tcp);
        assert!(!svc.externally_accessible());
        assert!(svc.uses_cluster_endpoints());
        assert!(!svc.uses_local_endpoints());

        let svc = svc.with_node_port(31000).with_external_policy_local();
        assert!(svc.externally_accessible());
        assert!(svc.uses_local_endpoints());

        let svc = ServicePort::new(addr("10.96.0.1"), 80, Protocol::Tcp)
            .with_internal_policy_local();
        assert!(!svc.uses_cluster_endpoints());
        assert!(svc.uses_local_endpoints());
    }

    #[test]
    fn test_display() {
        let svc = ServicePort::new(IpAddr::V4(Ipv4Addr::new(10, 96, 0, 1)), 80, Protocol::Udp);
        assert_eq!(svc.to_string(), "10.96.0.1:80/UDP");

        assert_eq!(
            ServicePortName::new("default/nginx", "http").to_string(),
            "default/nginx:http"
        );
        assert_eq!(
            ServicePortName::new("default/nginx", "").to_string(),
            "default/nginx"
        );
    }

    #[test]
    fn test_topology_aware_eligible() {
        let hints: BTreeSet<String> = ["zone-a".to_owned()].into();

        // no opt-in, hints are ignored
        assert!(topology_aware_eligible("zone-b", "", &hints));
        // opted in and the zone matches
        assert!(topology_aware_eligible("zone-a", "auto", &hints));
        assert!(topology_aware_eligible("zone-a", "Auto", &hints));
        // opted in and the zone does not match
        assert!(!topology_aware_eligible("zone-b", "auto", &hints));
        // unhinted endpoints and unzoned nodes always qualify
        assert!(topology_aware_eligible("zone-b", "auto", &BTreeSet::new()));
        assert!(topology_aware_eligible("", "auto", &hints));
    }

    #[test]
    fn test_endpoint_eligibility() {
        let mut ep = Endpoint::new(addr("10.1.0.5"), 8080);
        assert!(ep.is_eligible());

        ep.ready = false;
        assert!(!ep.is_eligible());

        ep.terminating = true;
        assert!(ep.is_eligible());
    }
}
