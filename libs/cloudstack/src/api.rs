//! Capability trait over the CloudStack management API.
//!
//! The reconciliation engine is generic over this trait so tests can drive
//! it against an in-memory implementation. When a project is configured on
//! the client, every list/get/create/associate call is scoped to it; callers
//! never pass the project explicitly.

use crate::error::Result;
use crate::types::{
    CreateFirewallRule, CreateLoadBalancerRule, CreateNetworkAcl, FirewallRule, LoadBalancerRule,
    Network, NetworkAcl, NetworkAclList, PublicIpAddress, UpdateLoadBalancerRule, VirtualMachine,
};

#[allow(async_fn_in_trait)]
pub trait CloudStackApi {
    // Load balancer rules
    async fn list_load_balancer_rules(&self, keyword: &str) -> Result<Vec<LoadBalancerRule>>;
    async fn create_load_balancer_rule(
        &self,
        params: CreateLoadBalancerRule<'_>,
    ) -> Result<LoadBalancerRule>;
    async fn update_load_balancer_rule(
        &self,
        id: &str,
        update: UpdateLoadBalancerRule<'_>,
    ) -> Result<()>;
    async fn delete_load_balancer_rule(&self, id: &str) -> Result<()>;
    async fn assign_to_load_balancer_rule(&self, id: &str, vm_ids: &[String]) -> Result<()>;
    async fn remove_from_load_balancer_rule(&self, id: &str, vm_ids: &[String]) -> Result<()>;
    /// IDs of the virtual machines currently assigned to the rule.
    async fn list_load_balancer_rule_instances(&self, id: &str) -> Result<Vec<String>>;

    // Public IP addresses
    async fn list_public_ip_addresses(&self, address: &str) -> Result<Vec<PublicIpAddress>>;
    async fn associate_ip_address(&self, network_id: &str) -> Result<PublicIpAddress>;
    async fn associate_ip_address_for_vpc(&self, vpc_id: &str) -> Result<PublicIpAddress>;
    async fn disassociate_ip_address(&self, id: &str) -> Result<()>;

    // Firewall rules (non-VPC networks)
    async fn list_firewall_rules(&self, ip_address_id: &str) -> Result<Vec<FirewallRule>>;
    async fn create_firewall_rule(&self, params: CreateFirewallRule<'_>) -> Result<FirewallRule>;
    async fn delete_firewall_rule(&self, id: &str) -> Result<()>;

    // Network ACLs (VPC networks)
    async fn get_network_acl_list(&self, id: &str) -> Result<NetworkAclList>;
    async fn list_network_acls(&self, acl_list_id: &str) -> Result<Vec<NetworkAcl>>;
    async fn create_network_acl(&self, params: CreateNetworkAcl<'_>) -> Result<NetworkAcl>;
    async fn delete_network_acl(&self, id: &str) -> Result<()>;

    // Networks and virtual machines
    async fn get_network(&self, id: &str) -> Result<Network>;
    async fn list_virtual_machines(&self) -> Result<Vec<VirtualMachine>>;

    /// Version string reported by the first management server, e.g.
    /// "4.22.0.0". Queried once at reconciler construction.
    async fn management_server_version(&self) -> Result<String>;
}
