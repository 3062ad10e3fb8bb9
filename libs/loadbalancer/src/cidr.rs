//! Parsing and comparison of source-CIDR allow-lists.

use crate::annotations;
use crate::error::{Error, Result};

use ipnet::IpNet;
use k8s_openapi::api::core::v1::Service;

/// Allow-list applied when a service restricts nothing.
pub const DEFAULT_ALLOW: &str = "0.0.0.0/0";

/// Parse a comma-separated CIDR list. Entries are whitespace-trimmed and
/// each must be a valid CIDR. An empty input yields an empty list, not the
/// default.
pub fn parse_cidr_list(raw: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',').map(validate_entry).collect()
}

fn validate_entry(entry: &str) -> Result<String> {
    let entry = entry.trim();
    entry
        .parse::<IpNet>()
        .map(|_| entry.to_string())
        .map_err(|_| Error::InvalidCidr(entry.to_string()))
}

/// Source ranges for a service: the annotation wins, then the explicit
/// `loadBalancerSourceRanges` field, then the open default.
pub fn service_source_ranges(service: &Service) -> Result<Vec<String>> {
    if let Some(raw) = annotations::get(service, annotations::SOURCE_CIDRS) {
        return parse_cidr_list(raw);
    }
    let ranges = service
        .spec
        .as_ref()
        .and_then(|s| s.load_balancer_source_ranges.as_ref());
    match ranges {
        Some(ranges) if !ranges.is_empty() => {
            ranges.iter().map(|r| validate_entry(r)).collect()
        }
        _ => Ok(vec![DEFAULT_ALLOW.to_string()]),
    }
}

fn normalized(list: &[String]) -> Vec<String> {
    let mut out: Vec<String> = list.iter().map(|c| c.trim().to_string()).collect();
    out.sort();
    out
}

/// Split a comma-joined CIDR list the way CloudStack reports it.
pub fn split_cidr_string(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Multiset equality: insensitive to order and whitespace, sensitive to
/// multiplicity.
pub fn equal_cidr_lists(a: &[String], b: &[String]) -> bool {
    normalized(a) == normalized(b)
}

/// Compare a comma-joined list from CloudStack against a desired list.
pub fn equal_cidr_string(joined: &str, list: &[String]) -> bool {
    equal_cidr_lists(&split_cidr_string(joined), list)
}
