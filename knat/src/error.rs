use std::net::IpAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),

    #[error("address {0} is not in the syncer's family")]
    IpFamily(IpAddr),

    #[error("no primary entry for derived service {0}")]
    MissingClusterIp(String),

    #[error("found inconsistencies in existing NAT maps")]
    InconsistentMaps,

    #[error("bpf map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("affinity map sweep failed: {0}")]
    AffinitySweep(String),

    #[error("clock error: {0}")]
    Clock(#[from] nix::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
