//! Deterministic naming of load balancer rules.
//!
//! The base name identifies the service cluster-wide; each port appends its
//! resolved protocol and public port. The base is also the keyword rules
//! are looked up by, so it must be stable across reconciliations.

use crate::protocol::LoadBalancerProtocol;

use k8s_openapi::api::core::v1::Service;

// CloudStack accepts longer rule names, but staying inside the DNS label
// limit keeps them listable and portable.
const MAX_BASE_LEN: usize = 63;

/// Base name for all rules of a service: sanitized `<namespace>-<name>`.
pub fn load_balancer_name(service: &Service) -> String {
    let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
    let name = service.metadata.name.as_deref().unwrap_or_default();
    sanitize(&format!("{namespace}-{name}"))
}

/// Canonical name of the rule for one port: `<base>-<protocol>-<port>`.
pub fn rule_name(base: &str, protocol: LoadBalancerProtocol, public_port: i32) -> String {
    format!("{base}-{}-{public_port}", protocol.lb_name())
}

fn sanitize(raw: &str) -> String {
    let mut out: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    out.truncate(MAX_BASE_LEN);
    while out.ends_with('-') {
        out.pop();
    }
    out
}
