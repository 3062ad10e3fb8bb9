//! Service annotations recognized by the controller.

use k8s_openapi::api::core::v1::Service;

/// `"true"` switches TCP rules to the PROXY protocol, `"false"` forces
/// plain TCP even when a future default would differ.
pub const PROXY_PROTOCOL: &str =
    "service.beta.kubernetes.io/cloudstack-load-balancer-proxy-protocol";

/// Comma-separated CIDR allow-list; overrides
/// `Service.spec.loadBalancerSourceRanges`.
pub const SOURCE_CIDRS: &str = "service.beta.kubernetes.io/cloudstack-load-balancer-source-cidrs";

/// When non-empty, reported as the ingress hostname instead of the IP.
pub const HOSTNAME: &str = "service.beta.kubernetes.io/cloudstack-load-balancer-hostname";

pub fn get<'a>(service: &'a Service, key: &str) -> Option<&'a str> {
    service
        .metadata
        .annotations
        .as_ref()?
        .get(key)
        .map(String::as_str)
}

/// Only the exact strings `"true"` and `"false"` are recognized; any other
/// value, including the empty string, falls back to the caller's default.
pub fn get_bool(service: &Service, key: &str, default: bool) -> bool {
    match get(service, key) {
        Some("true") => true,
        Some("false") => false,
        _ => default,
    }
}

pub fn hostname(service: &Service) -> Option<&str> {
    get(service, HOSTNAME).filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn service_with(key: &str, value: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
                ..ObjectMeta::default()
            },
            ..Service::default()
        }
    }

    #[test]
    fn test_get_bool_exact_strings_only() {
        assert!(get_bool(&service_with(PROXY_PROTOCOL, "true"), PROXY_PROTOCOL, false));
        assert!(!get_bool(&service_with(PROXY_PROTOCOL, "false"), PROXY_PROTOCOL, true));
        // anything else falls back to the default
        assert!(get_bool(&service_with(PROXY_PROTOCOL, "True"), PROXY_PROTOCOL, true));
        assert!(!get_bool(&service_with(PROXY_PROTOCOL, "yes"), PROXY_PROTOCOL, false));
        assert!(!get_bool(&service_with(PROXY_PROTOCOL, ""), PROXY_PROTOCOL, false));
        assert!(!get_bool(&Service::default(), PROXY_PROTOCOL, false));
    }

    #[test]
    fn test_hostname_empty_is_absent() {
        assert_eq!(hostname(&service_with(HOSTNAME, "")), None);
        assert_eq!(
            hostname(&service_with(HOSTNAME, "lb.example.com")),
            Some("lb.example.com")
        );
    }
}
