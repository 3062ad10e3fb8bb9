use ccm_cloudstack::error::Error as CloudStackError;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported session affinity {0:?}, only None and ClientIP are supported")]
    UnsupportedAffinity(String),

    #[error("unsupported protocol {protocol:?} on port {port}")]
    UnsupportedProtocol { protocol: String, port: i32 },

    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),

    #[error("no public IP found for address {0}")]
    IpNotFound(String),

    #[error("{count} public IPs found for address {address}, expected exactly one")]
    IpAmbiguous { address: String, count: usize },

    #[error("{0}: {1}")]
    // Boxing the upstream error because its size dominates the enum
    AssociateFailed(String, #[source] Box<CloudStackError>),

    #[error("nodes span multiple networks: {0:?}")]
    MultipleNetworks(Vec<String>),

    #[error("no CloudStack virtual machine matched the node set")]
    NoMatchingHost,

    #[error("{0}: {1}")]
    CloudStack(String, #[source] Box<CloudStackError>),

    #[error("{0}: {1}")]
    PerimeterCreateFailed(String, #[source] Box<CloudStackError>),

    #[error("no instance found for provider ID {0:?}")]
    InstanceNotFound(String),

    #[error("{0}")]
    MissingData(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
