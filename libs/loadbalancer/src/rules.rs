//! Per-port load balancer rule planning and application.

use crate::cidr;
use crate::error::{Error, Result};
use crate::protocol::LoadBalancerProtocol;

use ccm_cloudstack::api::CloudStackApi;
use ccm_cloudstack::types::{CreateLoadBalancerRule, LoadBalancerRule, UpdateLoadBalancerRule};
use tracing::debug;

/// Desired shape of one rule, derived from a service port.
#[derive(Debug, Clone)]
pub struct DesiredRule {
    pub name: String,
    pub algorithm: &'static str,
    pub protocol: LoadBalancerProtocol,
    pub public_ip: String,
    pub public_ip_id: String,
    pub public_port: i32,
    pub private_port: i32,
    /// Effective allow-list for rule creation; never empty (the default is
    /// substituted before planning).
    pub cidrs: Vec<String>,
}

/// Fields an in-place update must submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Drift {
    pub algorithm: bool,
    pub protocol: bool,
    pub cidr: bool,
}

/// Decision for one desired port against the observed rule of the same
/// name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Create,
    /// A structurally immutable field (public IP or either port) changed;
    /// the rule must be deleted and recreated.
    Recreate,
    UpdateInPlace(Drift),
    NoOp,
}

/// The decision function. `cidr_update_supported` reflects whether the
/// management server can mutate the CIDR list on an existing rule; older
/// servers force recreation for a CIDR-only change.
pub fn plan(
    observed: Option<&LoadBalancerRule>,
    desired: &DesiredRule,
    cidr_update_supported: bool,
) -> RuleAction {
    let Some(rule) = observed else {
        return RuleAction::Create;
    };

    if rule.public_ip != desired.public_ip
        || rule.public_port != desired.public_port.to_string()
        || rule.private_port != desired.private_port.to_string()
    {
        return RuleAction::Recreate;
    }

    let algorithm = rule.algorithm != desired.algorithm;
    let protocol = rule.protocol != desired.protocol.lb_name();
    let cidr = !cidr::equal_cidr_string(&rule.cidr_list, &desired.cidrs);

    if algorithm || protocol {
        return RuleAction::UpdateInPlace(Drift {
            algorithm,
            protocol,
            cidr: cidr && cidr_update_supported,
        });
    }
    if cidr {
        return if cidr_update_supported {
            RuleAction::UpdateInPlace(Drift {
                cidr: true,
                ..Drift::default()
            })
        } else {
            RuleAction::Recreate
        };
    }
    RuleAction::NoOp
}

pub async fn create<C: CloudStackApi>(
    cloud: &C,
    desired: &DesiredRule,
    network_id: &str,
) -> Result<LoadBalancerRule> {
    debug!(msg = "creating load balancer rule", rule = desired.name);
    cloud
        .create_load_balancer_rule(CreateLoadBalancerRule {
            name: &desired.name,
            algorithm: desired.algorithm,
            protocol: desired.protocol.lb_name(),
            public_ip_id: &desired.public_ip_id,
            public_port: desired.public_port,
            private_port: desired.private_port,
            cidr_list: &desired.cidrs,
            network_id,
            open_firewall: false,
        })
        .await
        .map_err(|e| {
            Error::CloudStack(
                format!("failed to create load balancer rule {}", desired.name),
                Box::new(e),
            )
        })
}

/// Submit only the drifted fields of an existing rule.
pub async fn update<C: CloudStackApi>(
    cloud: &C,
    rule: &LoadBalancerRule,
    desired: &DesiredRule,
    drift: Drift,
) -> Result<()> {
    debug!(msg = "updating load balancer rule in place", rule = desired.name, ?drift);
    cloud
        .update_load_balancer_rule(
            &rule.id,
            UpdateLoadBalancerRule {
                algorithm: drift.algorithm.then_some(desired.algorithm),
                protocol: drift.protocol.then_some(desired.protocol.lb_name()),
                cidr_list: drift.cidr.then_some(desired.cidrs.as_slice()),
            },
        )
        .await
        .map_err(|e| {
            Error::CloudStack(
                format!("failed to update load balancer rule {}", desired.name),
                Box::new(e),
            )
        })
}

pub async fn delete<C: CloudStackApi>(cloud: &C, rule: &LoadBalancerRule) -> Result<()> {
    debug!(msg = "deleting load balancer rule", rule = rule.name);
    cloud.delete_load_balancer_rule(&rule.id).await.map_err(|e| {
        Error::CloudStack(
            format!("failed to delete load balancer rule {}", rule.name),
            Box::new(e),
        )
    })
}
