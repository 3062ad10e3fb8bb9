//! Record types for the slice of the CloudStack API the controller consumes.
//!
//! Field names follow the flat lowercase keys of the CloudStack JSON
//! responses. CloudStack is inconsistent about numeric encoding: load
//! balancer rule and network ACL ports arrive as strings, firewall rule
//! ports as integers. The types preserve that so comparisons happen the
//! same way the API reports them.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancerRule {
    pub id: String,
    pub name: String,
    pub algorithm: String,
    pub protocol: String,
    #[serde(rename = "publicip")]
    pub public_ip: String,
    #[serde(rename = "publicipid")]
    pub public_ip_id: String,
    #[serde(rename = "publicport")]
    pub public_port: String,
    #[serde(rename = "privateport")]
    pub private_port: String,
    #[serde(rename = "cidrlist", default)]
    pub cidr_list: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicIpAddress {
    pub id: String,
    #[serde(rename = "ipaddress")]
    pub ip_address: String,
    #[serde(default)]
    pub state: String,
    #[serde(rename = "associatednetworkid", default)]
    pub associated_network_id: Option<String>,
    #[serde(rename = "vpcid", default)]
    pub vpc_id: Option<String>,
}

impl PublicIpAddress {
    /// An IP in any other state is merely reserved and still needs an
    /// associate call before rules can be bound to it.
    pub fn is_allocated(&self) -> bool {
        self.state.eq_ignore_ascii_case("allocated")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkServiceEntry {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Network {
    pub id: String,
    #[serde(rename = "vpcid", default)]
    pub vpc_id: Option<String>,
    #[serde(rename = "aclid", default)]
    pub acl_id: Option<String>,
    #[serde(rename = "service", default)]
    pub services: Vec<NetworkServiceEntry>,
}

impl Network {
    pub fn supports_service(&self, name: &str) -> bool {
        self.services.iter().any(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirewallRule {
    pub id: String,
    pub protocol: String,
    #[serde(rename = "startport", default)]
    pub start_port: Option<i64>,
    #[serde(rename = "endport", default)]
    pub end_port: Option<i64>,
    #[serde(rename = "cidrlist", default)]
    pub cidr_list: String,
    #[serde(rename = "ipaddressid", default)]
    pub ip_address_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkAclList {
    pub id: String,
    pub name: String,
}

// Network ACL entries report their ports as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkAcl {
    pub id: String,
    pub protocol: String,
    #[serde(rename = "startport", default)]
    pub start_port: Option<String>,
    #[serde(rename = "endport", default)]
    pub end_port: Option<String>,
    #[serde(rename = "cidrlist", default)]
    pub cidr_list: String,
    #[serde(rename = "aclid", default)]
    pub acl_list_id: String,
    #[serde(default)]
    pub action: String,
    #[serde(rename = "traffictype", default)]
    pub traffic_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Nic {
    pub id: String,
    #[serde(rename = "networkid")]
    pub network_id: String,
    #[serde(rename = "isdefault", default)]
    pub is_default: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    #[serde(rename = "nic", default)]
    pub nics: Vec<Nic>,
}

impl VirtualMachine {
    /// The NIC flagged as default, or the first one on machines where
    /// CloudStack omits the flag.
    pub fn default_nic(&self) -> Option<&Nic> {
        self.nics
            .iter()
            .find(|n| n.is_default.unwrap_or(false))
            .or_else(|| self.nics.first())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagementServer {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Parameters for `createLoadBalancerRule`.
#[derive(Debug, Clone)]
pub struct CreateLoadBalancerRule<'a> {
    pub name: &'a str,
    pub algorithm: &'a str,
    pub protocol: &'a str,
    pub public_ip_id: &'a str,
    pub public_port: i32,
    pub private_port: i32,
    pub cidr_list: &'a [String],
    pub network_id: &'a str,
    /// Always false for the controller: perimeter rules are reconciled
    /// separately so CloudStack must not open the firewall implicitly.
    pub open_firewall: bool,
}

/// Parameters for `updateLoadBalancerRule`. Only set fields are submitted.
#[derive(Debug, Clone, Default)]
pub struct UpdateLoadBalancerRule<'a> {
    pub algorithm: Option<&'a str>,
    pub protocol: Option<&'a str>,
    pub cidr_list: Option<&'a [String]>,
}

/// Parameters for `createFirewallRule`.
#[derive(Debug, Clone)]
pub struct CreateFirewallRule<'a> {
    pub ip_address_id: &'a str,
    pub protocol: &'a str,
    pub start_port: i32,
    pub end_port: i32,
    pub cidr_list: &'a [String],
}

/// Parameters for `createNetworkACL`.
#[derive(Debug, Clone)]
pub struct CreateNetworkAcl<'a> {
    pub acl_list_id: &'a str,
    pub protocol: &'a str,
    pub start_port: i32,
    pub end_port: i32,
    pub cidr_list: &'a [String],
    pub action: &'a str,
    pub traffic_type: &'a str,
}
