//! Perimeter security for public load balancer ports.
//!
//! A network carries either per-IP firewall rules (isolated networks) or a
//! network ACL list (VPC networks), never both. The flavor is chosen once
//! per reconciliation from the network's capability set and dispatched
//! through this enum.

use crate::cidr;
use crate::error::{Error, Result};
use crate::protocol::LoadBalancerProtocol;

use ccm_cloudstack::api::CloudStackApi;
use ccm_cloudstack::types::{CreateFirewallRule, CreateNetworkAcl, FirewallRule, Network};
use tracing::{debug, warn};

pub const SERVICE_FIREWALL: &str = "Firewall";
pub const SERVICE_NETWORK_ACL: &str = "NetworkACL";

// CloudStack pre-seeds every VPC with these; their entries are not ours to
// manage.
const DEFAULT_ACL_LISTS: [&str; 2] = ["default_allow", "default_deny"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Perimeter {
    Firewall,
    Acl { acl_list_id: String },
    Unsupported,
}

impl Perimeter {
    /// Select the perimeter flavor for a network.
    pub fn for_network(network: &Network) -> Self {
        if network.vpc_id.is_some() && network.supports_service(SERVICE_NETWORK_ACL) {
            match &network.acl_id {
                Some(acl_list_id) => Self::Acl {
                    acl_list_id: acl_list_id.clone(),
                },
                None => {
                    warn!(
                        msg = "VPC network has no ACL list attached, skipping perimeter rules",
                        network = network.id
                    );
                    Self::Unsupported
                }
            }
        } else if network.vpc_id.is_none() && network.supports_service(SERVICE_FIREWALL) {
            Self::Firewall
        } else {
            warn!(
                msg = "network supports neither firewall nor ACL rules, skipping perimeter rules",
                network = network.id
            );
            Self::Unsupported
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Firewall => "firewall",
            Self::Acl { .. } => "network ACL",
            Self::Unsupported => "unsupported",
        }
    }

    /// Converge the perimeter for one public port.
    pub async fn reconcile<C: CloudStackApi>(
        &self,
        cloud: &C,
        ip_id: &str,
        public_port: i32,
        protocol: LoadBalancerProtocol,
        cidrs: &[String],
    ) -> Result<()> {
        match self {
            Self::Firewall => {
                reconcile_firewall(cloud, ip_id, public_port, protocol, cidrs).await
            }
            Self::Acl { acl_list_id } => {
                reconcile_acl(cloud, acl_list_id, public_port, protocol).await
            }
            Self::Unsupported => Ok(()),
        }
    }

    /// Remove the perimeter rule(s) backing an obsolete load balancer
    /// rule. Individual delete failures are logged and skipped; the next
    /// reconciliation retries them.
    pub async fn delete<C: CloudStackApi>(
        &self,
        cloud: &C,
        ip_id: &str,
        public_port: i32,
        protocol: LoadBalancerProtocol,
    ) -> Result<()> {
        match self {
            Self::Firewall => {
                let rules = list_port_firewall_rules(cloud, ip_id, public_port, protocol).await?;
                for rule in rules {
                    if let Err(e) = cloud.delete_firewall_rule(&rule.id).await {
                        warn!(msg = "failed to delete firewall rule", rule = rule.id, %e);
                    }
                }
                Ok(())
            }
            Self::Acl { acl_list_id } => {
                let list = cloud.get_network_acl_list(acl_list_id).await.map_err(|e| {
                    Error::CloudStack(
                        format!("failed to resolve ACL list {acl_list_id}"),
                        Box::new(e),
                    )
                })?;
                if DEFAULT_ACL_LISTS.contains(&list.name.as_str()) {
                    return Ok(());
                }
                let acls = cloud.list_network_acls(acl_list_id).await.map_err(|e| {
                    Error::CloudStack(
                        format!("failed to list ACL entries of {acl_list_id}"),
                        Box::new(e),
                    )
                })?;
                let port = public_port.to_string();
                let matched = acls.iter().find(|a| {
                    a.protocol == protocol.ip_name()
                        && a.start_port.as_deref() == Some(port.as_str())
                        && a.end_port.as_deref() == Some(port.as_str())
                });
                if let Some(acl) = matched {
                    if let Err(e) = cloud.delete_network_acl(&acl.id).await {
                        warn!(msg = "failed to delete ACL entry", acl = acl.id, %e);
                    }
                }
                Ok(())
            }
            Self::Unsupported => Ok(()),
        }
    }
}

async fn list_port_firewall_rules<C: CloudStackApi>(
    cloud: &C,
    ip_id: &str,
    public_port: i32,
    protocol: LoadBalancerProtocol,
) -> Result<Vec<FirewallRule>> {
    let rules = cloud.list_firewall_rules(ip_id).await.map_err(|e| {
        Error::CloudStack(
            format!("failed to list firewall rules on IP {ip_id}"),
            Box::new(e),
        )
    })?;
    let port = i64::from(public_port);
    Ok(rules
        .into_iter()
        .filter(|r| {
            r.protocol == protocol.ip_name()
                && r.start_port == Some(port)
                && r.end_port == Some(port)
        })
        .collect())
}

/// Firewall mode. Conflicting rules on the same port are deleted before a
/// missing rule is created; CloudStack rejects overlapping port ranges on
/// one IP, so the order is load-bearing.
async fn reconcile_firewall<C: CloudStackApi>(
    cloud: &C,
    ip_id: &str,
    public_port: i32,
    protocol: LoadBalancerProtocol,
    cidrs: &[String],
) -> Result<()> {
    let desired: Vec<String> = if cidrs.is_empty() {
        vec![cidr::DEFAULT_ALLOW.to_string()]
    } else {
        cidrs.to_vec()
    };

    let candidates = list_port_firewall_rules(cloud, ip_id, public_port, protocol).await?;
    let matched = candidates
        .iter()
        .find(|r| cidr::equal_cidr_string(&r.cidr_list, &desired))
        .map(|r| r.id.clone());

    for rule in &candidates {
        if Some(&rule.id) == matched.as_ref() {
            continue;
        }
        debug!(msg = "deleting conflicting firewall rule", rule = rule.id, port = public_port);
        if let Err(e) = cloud.delete_firewall_rule(&rule.id).await {
            warn!(msg = "failed to delete conflicting firewall rule", rule = rule.id, %e);
        }
    }

    if matched.is_none() {
        debug!(msg = "creating firewall rule", port = public_port);
        cloud
            .create_firewall_rule(CreateFirewallRule {
                ip_address_id: ip_id,
                protocol: protocol.ip_name(),
                start_port: public_port,
                end_port: public_port,
                cidr_list: &desired,
            })
            .await
            .map_err(|e| {
                Error::PerimeterCreateFailed(
                    format!("failed to create firewall rule for port {public_port}"),
                    Box::new(e),
                )
            })?;
    }
    Ok(())
}

/// ACL mode. Entries are matched on protocol and port only; CIDR
/// reconciliation on ACLs is not implemented and entries always allow
/// 0.0.0.0/0.
async fn reconcile_acl<C: CloudStackApi>(
    cloud: &C,
    acl_list_id: &str,
    public_port: i32,
    protocol: LoadBalancerProtocol,
) -> Result<()> {
    let list = cloud.get_network_acl_list(acl_list_id).await.map_err(|e| {
        Error::CloudStack(
            format!("failed to resolve ACL list {acl_list_id}"),
            Box::new(e),
        )
    })?;
    if DEFAULT_ACL_LISTS.contains(&list.name.as_str()) {
        warn!(msg = "refusing to manage entries of a default ACL list", list = list.name);
        return Ok(());
    }

    let acls = cloud.list_network_acls(acl_list_id).await.map_err(|e| {
        Error::CloudStack(
            format!("failed to list ACL entries of {acl_list_id}"),
            Box::new(e),
        )
    })?;
    let port = public_port.to_string();
    let exists = acls.iter().any(|a| {
        a.protocol == protocol.ip_name()
            && a.start_port.as_deref() == Some(port.as_str())
            && a.end_port.as_deref() == Some(port.as_str())
    });
    if exists {
        return Ok(());
    }

    debug!(msg = "creating ACL entry", port = public_port, list = acl_list_id);
    let open = vec![cidr::DEFAULT_ALLOW.to_string()];
    cloud
        .create_network_acl(CreateNetworkAcl {
            acl_list_id,
            protocol: protocol.ip_name(),
            start_port: public_port,
            end_port: public_port,
            cidr_list: &open,
            action: "Allow",
            traffic_type: "Ingress",
        })
        .await
        .map_err(|e| {
            Error::PerimeterCreateFailed(
                format!("failed to create ACL entry for port {public_port}"),
                Box::new(e),
            )
        })?;
    Ok(())
}
