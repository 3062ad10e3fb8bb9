//! Mapping between Kubernetes service ports and CloudStack load balancer
//! protocols.

use crate::annotations;

use std::fmt;

use k8s_openapi::api::core::v1::{Service, ServicePort};

/// Load balancer protocol variant. Every variant has two views: the name
/// CloudStack expects on load balancer rule operations, and the IP protocol
/// name used on firewall and ACL operations (PROXY collapses to plain tcp).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancerProtocol {
    Tcp,
    Udp,
    TcpProxy,
    Invalid,
}

impl LoadBalancerProtocol {
    /// Resolve the protocol for one service port. SCTP and anything else
    /// outside TCP/UDP is unsupported and maps to `Invalid`.
    pub fn from_service_port(port: &ServicePort, service: &Service) -> Self {
        let proxy = annotations::get_bool(service, annotations::PROXY_PROTOCOL, false);
        match port.protocol.as_deref().unwrap_or("TCP") {
            "TCP" if proxy => Self::TcpProxy,
            "TCP" => Self::Tcp,
            "UDP" => Self::Udp,
            _ => Self::Invalid,
        }
    }

    /// Reverse map from a CloudStack rule's protocol field. Only the exact
    /// lowercase forms are accepted.
    pub fn from_lb_name(name: &str) -> Self {
        match name {
            "tcp" => Self::Tcp,
            "udp" => Self::Udp,
            "tcp-proxy" => Self::TcpProxy,
            _ => Self::Invalid,
        }
    }

    /// Name used on load balancer rule operations.
    pub fn lb_name(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::TcpProxy => "tcp-proxy",
            Self::Invalid => "",
        }
    }

    /// Name used on firewall and network ACL operations.
    pub fn ip_name(self) -> &'static str {
        match self {
            Self::Tcp | Self::TcpProxy => "tcp",
            Self::Udp => "udp",
            Self::Invalid => "",
        }
    }

    pub fn is_valid(self) -> bool {
        self != Self::Invalid
    }
}

impl fmt::Display for LoadBalancerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.lb_name())
    }
}
