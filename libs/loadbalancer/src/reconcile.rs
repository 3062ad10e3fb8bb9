//! Top-level reconciliation of one service onto CloudStack load balancer
//! primitives.
//!
//! Every operation rebuilds its view of the world from CloudStack; nothing
//! is cached between calls. The controller framework serializes operations
//! per service, so no local locking happens here.

use crate::annotations;
use crate::cidr;
use crate::error::{Error, Result};
use crate::ip::{self, AcquiredIp};
use crate::members;
use crate::name;
use crate::nodes::{self, ResolvedNodes};
use crate::perimeter::Perimeter;
use crate::protocol::LoadBalancerProtocol;
use crate::rules::{self, DesiredRule, RuleAction};

use std::collections::HashMap;

use ccm_cloudstack::api::CloudStackApi;
use ccm_cloudstack::types::{LoadBalancerRule, Network};
use ccm_cloudstack::version::CloudStackVersion;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Node, Service, ServicePort,
};
use tracing::{debug, info, instrument, warn};

pub struct LoadBalancerReconciler<C> {
    cloud: C,
    version: CloudStackVersion,
}

/// Observed state of one service's load balancer, keyed by rule name.
struct ServiceState {
    name: String,
    ip_addr: String,
    ip_id: String,
    rules: HashMap<String, LoadBalancerRule>,
}

impl<C: CloudStackApi> LoadBalancerReconciler<C> {
    /// Query the management server version once and build the reconciler.
    pub async fn new(cloud: C) -> Result<Self> {
        let raw = cloud.management_server_version().await.map_err(|e| {
            Error::CloudStack(
                "failed to query management server version".to_string(),
                Box::new(e),
            )
        })?;
        let version: CloudStackVersion = raw.parse().map_err(|e| {
            Error::CloudStack(
                format!("failed to parse management server version {raw:?}"),
                Box::new(e),
            )
        })?;
        info!(msg = "detected CloudStack version", %version);
        Ok(Self { cloud, version })
    }

    /// Report the current ingress of a service, or `None` when no rules
    /// exist for it.
    #[instrument(skip_all)]
    pub async fn get_load_balancer(&self, service: &Service) -> Result<Option<LoadBalancerStatus>> {
        let state = self.load(service).await?;
        if state.rules.is_empty() {
            return Ok(None);
        }
        Ok(Some(ingress_status(service, &state.ip_addr)))
    }

    /// Converge rules, perimeter, and membership to the service spec and
    /// return the resulting ingress.
    #[instrument(skip_all)]
    pub async fn ensure_load_balancer(
        &self,
        service: &Service,
        nodes: &[Node],
    ) -> Result<LoadBalancerStatus> {
        let ports = service_ports(service)?;
        let algorithm = algorithm_for(service)?;
        let source_ranges = cidr::service_source_ranges(service)?;

        let mut state = self.load(service).await?;
        info!(msg = "ensuring load balancer", lb = state.name);

        let resolved = nodes::resolve(&self.cloud, nodes).await?;
        let network = self
            .cloud
            .get_network(&resolved.network_id)
            .await
            .map_err(|e| {
                Error::CloudStack(
                    format!("failed to get network {}", resolved.network_id),
                    Box::new(e),
                )
            })?;
        let perimeter = Perimeter::for_network(&network);
        debug!(msg = "selected perimeter mode", mode = perimeter.describe());

        let requested_ip = requested_ip(service);
        let mut release_on_failure = false;
        if state.ip_addr.is_empty() {
            let AcquiredIp { id, address, owned } =
                ip::acquire(&self.cloud, requested_ip, &network).await?;
            release_on_failure = owned;
            state.ip_id = id;
            state.ip_addr = address;
        }

        let converged = self
            .converge(
                service,
                &mut state,
                &ports,
                algorithm,
                &source_ranges,
                &resolved,
                &network,
                &perimeter,
            )
            .await;
        match converged {
            Ok(()) => Ok(ingress_status(service, &state.ip_addr)),
            Err(e) => {
                if release_on_failure {
                    warn!(
                        msg = "ensure failed after allocating a public IP, releasing it",
                        ip = state.ip_addr
                    );
                    if let Err(release_err) = ip::release(&self.cloud, &state.ip_id).await {
                        warn!(msg = "failed to release orphaned public IP", ip = state.ip_addr, %release_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// Re-point every rule of the service at the current node set. Only
    /// membership changes; rules and perimeter are left alone.
    #[instrument(skip_all)]
    pub async fn update_load_balancer(&self, service: &Service, nodes: &[Node]) -> Result<()> {
        let state = self.load(service).await?;
        if state.rules.is_empty() {
            debug!(msg = "no load balancer rules to update", lb = state.name);
            return Ok(());
        }
        info!(msg = "updating load balancer membership", lb = state.name);
        let resolved = nodes::resolve(&self.cloud, nodes).await?;

        for rule in state.rules.values() {
            let observed = self
                .cloud
                .list_load_balancer_rule_instances(&rule.id)
                .await
                .map_err(|e| {
                    Error::CloudStack(
                        format!("failed to list instances of rule {}", rule.name),
                        Box::new(e),
                    )
                })?;
            let (assign, remove) = members::diff(&resolved.host_ids, &observed);
            debug!(
                msg = "computed membership diff",
                rule = rule.name,
                assign = assign.len(),
                remove = remove.len()
            );
            // Empty lists still go out; the provider treats them as no-ops.
            self.cloud
                .assign_to_load_balancer_rule(&rule.id, &assign)
                .await
                .map_err(|e| {
                    Error::CloudStack(
                        format!("failed to assign hosts to rule {}", rule.name),
                        Box::new(e),
                    )
                })?;
            self.cloud
                .remove_from_load_balancer_rule(&rule.id, &remove)
                .await
                .map_err(|e| {
                    Error::CloudStack(
                        format!("failed to remove hosts from rule {}", rule.name),
                        Box::new(e),
                    )
                })?;
        }
        Ok(())
    }

    /// Tear down every rule and its perimeter; release the IP unless the
    /// service still names it.
    #[instrument(skip_all)]
    pub async fn delete_load_balancer(&self, service: &Service) -> Result<()> {
        let state = self.load(service).await?;
        if state.rules.is_empty() {
            debug!(msg = "load balancer already absent", lb = state.name);
            return Ok(());
        }
        info!(msg = "deleting load balancer", lb = state.name);

        let perimeter = self.perimeter_for_ip(&state.ip_addr).await?;
        for rule in state.rules.values() {
            self.delete_rule(rule, &state.ip_id, &perimeter).await?;
        }

        if requested_ip(service) != Some(state.ip_addr.as_str()) {
            ip::release(&self.cloud, &state.ip_id).await?;
        }
        Ok(())
    }

    async fn load(&self, service: &Service) -> Result<ServiceState> {
        let name = name::load_balancer_name(service);
        let listed = self
            .cloud
            .list_load_balancer_rules(&name)
            .await
            .map_err(|e| {
                Error::CloudStack(
                    format!("failed to list load balancer rules for {name}"),
                    Box::new(e),
                )
            })?;

        let prefix = format!("{name}-");
        let mut state = ServiceState {
            name,
            ip_addr: String::new(),
            ip_id: String::new(),
            rules: HashMap::new(),
        };
        for rule in listed {
            // the keyword search is a substring match; keep only rules in
            // this service's name namespace
            if !rule.name.starts_with(&prefix) {
                continue;
            }
            if state.ip_addr.is_empty() {
                state.ip_addr = rule.public_ip.clone();
                state.ip_id = rule.public_ip_id.clone();
            } else if state.ip_addr != rule.public_ip {
                warn!(
                    msg = "load balancer rules disagree on the public IP, adopting the last seen",
                    lb = state.name,
                    previous = state.ip_addr,
                    adopted = rule.public_ip
                );
                state.ip_addr = rule.public_ip.clone();
                state.ip_id = rule.public_ip_id.clone();
            }
            state.rules.insert(rule.name.clone(), rule);
        }
        Ok(state)
    }

    #[allow(clippy::too_many_arguments)]
    async fn converge(
        &self,
        service: &Service,
        state: &mut ServiceState,
        ports: &[ServicePort],
        algorithm: &'static str,
        source_ranges: &[String],
        resolved: &ResolvedNodes,
        network: &Network,
        perimeter: &Perimeter,
    ) -> Result<()> {
        for port in ports {
            let protocol = LoadBalancerProtocol::from_service_port(port, service);
            if !protocol.is_valid() {
                return Err(Error::UnsupportedProtocol {
                    protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                    port: port.port,
                });
            }
            let node_port = port.node_port.ok_or_else(|| {
                Error::MissingData(format!(
                    "port {} of {} has no node port yet",
                    port.port, state.name
                ))
            })?;

            let rule_name = name::rule_name(&state.name, protocol, port.port);
            // rule creation never passes an empty allow-list
            let cidrs = if source_ranges.is_empty() {
                vec![cidr::DEFAULT_ALLOW.to_string()]
            } else {
                source_ranges.to_vec()
            };
            let desired = DesiredRule {
                name: rule_name.clone(),
                algorithm,
                protocol,
                public_ip: state.ip_addr.clone(),
                public_ip_id: state.ip_id.clone(),
                public_port: port.port,
                private_port: node_port,
                cidrs,
            };

            let observed = state.rules.remove(&rule_name);
            let action = rules::plan(
                observed.as_ref(),
                &desired,
                self.version.supports_lb_cidr_update(),
            );
            debug!(msg = "planned rule action", rule = rule_name, ?action);
            match action {
                RuleAction::NoOp => {}
                RuleAction::UpdateInPlace(drift) => {
                    // safe unwrap: plan never updates an absent rule
                    rules::update(&self.cloud, observed.as_ref().unwrap(), &desired, drift).await?;
                }
                RuleAction::Recreate => {
                    // safe unwrap: plan never recreates an absent rule
                    rules::delete(&self.cloud, observed.as_ref().unwrap()).await?;
                    self.create_rule(&desired, &network.id, &resolved.host_ids)
                        .await?;
                }
                RuleAction::Create => {
                    self.create_rule(&desired, &network.id, &resolved.host_ids)
                        .await?;
                }
            }

            perimeter
                .reconcile(&self.cloud, &state.ip_id, port.port, protocol, source_ranges)
                .await?;
        }

        // whatever is left in the map is no longer wanted by any port
        let obsolete: Vec<LoadBalancerRule> = state.rules.drain().map(|(_, r)| r).collect();
        for rule in obsolete {
            self.delete_rule(&rule, &state.ip_id, perimeter).await?;
        }
        Ok(())
    }

    async fn create_rule(
        &self,
        desired: &DesiredRule,
        network_id: &str,
        host_ids: &[String],
    ) -> Result<()> {
        let rule = rules::create(&self.cloud, desired, network_id).await?;
        self.cloud
            .assign_to_load_balancer_rule(&rule.id, host_ids)
            .await
            .map_err(|e| {
                Error::CloudStack(
                    format!("failed to assign hosts to rule {}", desired.name),
                    Box::new(e),
                )
            })
    }

    async fn delete_rule(
        &self,
        rule: &LoadBalancerRule,
        ip_id: &str,
        perimeter: &Perimeter,
    ) -> Result<()> {
        info!(msg = "deleting load balancer rule", rule = rule.name);
        let protocol = LoadBalancerProtocol::from_lb_name(&rule.protocol);
        match rule.public_port.parse::<i32>() {
            Ok(port) => perimeter.delete(&self.cloud, ip_id, port, protocol).await?,
            Err(_) => warn!(
                msg = "rule reports an unparseable public port, skipping perimeter cleanup",
                rule = rule.name,
                port = rule.public_port
            ),
        }
        rules::delete(&self.cloud, rule).await
    }

    /// Recover the perimeter mode at delete time from the network the IP
    /// is associated with.
    async fn perimeter_for_ip(&self, address: &str) -> Result<Perimeter> {
        let ips = self
            .cloud
            .list_public_ip_addresses(address)
            .await
            .map_err(|e| {
                Error::CloudStack(format!("failed to look up public IP {address}"), Box::new(e))
            })?;
        match ips.into_iter().find_map(|ip| ip.associated_network_id) {
            Some(network_id) => {
                let network = self.cloud.get_network(&network_id).await.map_err(|e| {
                    Error::CloudStack(
                        format!("failed to get network {network_id}"),
                        Box::new(e),
                    )
                })?;
                Ok(Perimeter::for_network(&network))
            }
            None => {
                warn!(
                    msg = "public IP has no associated network, skipping perimeter cleanup",
                    address
                );
                Ok(Perimeter::Unsupported)
            }
        }
    }
}

fn requested_ip(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.load_balancer_ip.as_deref())
        .filter(|a| !a.is_empty())
}

fn service_ports(service: &Service) -> Result<Vec<ServicePort>> {
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();
    if ports.is_empty() {
        return Err(Error::MissingData(
            "load balancer service has no ports".to_string(),
        ));
    }
    Ok(ports)
}

fn algorithm_for(service: &Service) -> Result<&'static str> {
    match service
        .spec
        .as_ref()
        .and_then(|s| s.session_affinity.as_deref())
    {
        None | Some("None") => Ok("roundrobin"),
        Some("ClientIP") => Ok("source"),
        Some(other) => Err(Error::UnsupportedAffinity(other.to_string())),
    }
}

fn ingress_status(service: &Service, ip: &str) -> LoadBalancerStatus {
    let ingress = match annotations::hostname(service) {
        Some(hostname) => LoadBalancerIngress {
            hostname: Some(hostname.to_string()),
            ..LoadBalancerIngress::default()
        },
        None => LoadBalancerIngress {
            ip: Some(ip.to_string()),
            ..LoadBalancerIngress::default()
        },
    };
    LoadBalancerStatus {
        ingress: Some(vec![ingress]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fake::{
        FakeCloud, Mutation, annotate, network_fixture, node_fixture, service_fixture,
    };

    fn owned(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn flat_cloud(version: &str) -> FakeCloud {
        FakeCloud::new(version)
            .with_network(network_fixture("net-1", &["Firewall"]))
            .with_vm("vm-n1", "n1", "net-1")
            .with_vm("vm-n2", "n2", "net-1")
    }

    fn vpc_cloud(version: &str) -> FakeCloud {
        let mut network = network_fixture("net-1", &["NetworkACL"]);
        network.vpc_id = Some("vpc-1".to_string());
        network.acl_id = Some("acl-1".to_string());
        FakeCloud::new(version)
            .with_network(network)
            .with_acl_list("acl-1", "k8s-acl")
            .with_vm("vm-n1", "n1", "net-1")
            .with_vm("vm-n2", "n2", "net-1")
    }

    fn two_nodes() -> Vec<Node> {
        vec![node_fixture("n1"), node_fixture("n2")]
    }

    async fn reconciler(cloud: &FakeCloud) -> LoadBalancerReconciler<FakeCloud> {
        LoadBalancerReconciler::new(cloud.clone()).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_on_flat_network() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);

        let status = engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();

        let ingress = status.ingress.unwrap();
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0].ip.as_deref(), Some("192.0.2.1"));
        assert_eq!(ingress[0].hostname, None);
        assert_eq!(cloud.lb_rule_names(), vec!["default-svc-a-tcp-80"]);
        assert_eq!(
            cloud.members_of("default-svc-a-tcp-80"),
            owned(&["vm-n1", "vm-n2"])
        );
        assert_eq!(
            cloud.mutations(),
            vec![
                Mutation::AssociateIp("net-1".to_string()),
                Mutation::CreateLbRule {
                    name: "default-svc-a-tcp-80".to_string(),
                    algorithm: "roundrobin".to_string(),
                    protocol: "tcp".to_string(),
                    public_ip_id: "ip-1".to_string(),
                    public_port: 80,
                    private_port: 30080,
                    cidrs: owned(&["0.0.0.0/0"]),
                },
                Mutation::AssignVms {
                    rule: "default-svc-a-tcp-80".to_string(),
                    vms: owned(&["vm-n1", "vm-n2"]),
                },
                Mutation::CreateFirewall {
                    ip_id: "ip-1".to_string(),
                    protocol: "tcp".to_string(),
                    port: 80,
                    cidrs: owned(&["0.0.0.0/0"]),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_proxy_protocol_on_vpc_network() {
        let cloud = vpc_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let service = annotate(
            service_fixture("default", "svc-a", &[("TCP", 80, 30080)]),
            crate::annotations::PROXY_PROTOCOL,
            "true",
        );

        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();

        assert_eq!(cloud.lb_rule_names(), vec!["default-svc-a-tcp-proxy-80"]);
        assert_eq!(
            cloud.mutations(),
            vec![
                Mutation::AssociateIp("vpc-1".to_string()),
                Mutation::CreateLbRule {
                    name: "default-svc-a-tcp-proxy-80".to_string(),
                    algorithm: "roundrobin".to_string(),
                    protocol: "tcp-proxy".to_string(),
                    public_ip_id: "ip-1".to_string(),
                    public_port: 80,
                    private_port: 30080,
                    cidrs: owned(&["0.0.0.0/0"]),
                },
                Mutation::AssignVms {
                    rule: "default-svc-a-tcp-proxy-80".to_string(),
                    vms: owned(&["vm-n1", "vm-n2"]),
                },
                Mutation::CreateAcl {
                    acl_list_id: "acl-1".to_string(),
                    protocol: "tcp".to_string(),
                    port: 80,
                    cidrs: owned(&["0.0.0.0/0"]),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_second_ensure_is_read_only() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);

        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();
        cloud.clear_mutations();

        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();
        assert!(cloud.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_cidr_change_updates_in_place_on_new_cloudstack() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);

        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();
        cloud.clear_mutations();

        let service = annotate(
            service,
            crate::annotations::SOURCE_CIDRS,
            "10.0.0.0/8,192.168.0.0/16",
        );
        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();

        assert_eq!(
            cloud.mutations(),
            vec![
                Mutation::UpdateLbRule {
                    name: "default-svc-a-tcp-80".to_string(),
                    algorithm: None,
                    protocol: None,
                    cidrs: Some(owned(&["10.0.0.0/8", "192.168.0.0/16"])),
                },
                Mutation::DeleteFirewall("fw-3".to_string()),
                Mutation::CreateFirewall {
                    ip_id: "ip-1".to_string(),
                    protocol: "tcp".to_string(),
                    port: 80,
                    cidrs: owned(&["10.0.0.0/8", "192.168.0.0/16"]),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_cidr_change_recreates_on_old_cloudstack() {
        let cloud = flat_cloud("4.12.0");
        let engine = reconciler(&cloud).await;
        let service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);

        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();
        cloud.clear_mutations();

        let service = annotate(
            service,
            crate::annotations::SOURCE_CIDRS,
            "10.0.0.0/8,192.168.0.0/16",
        );
        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();

        assert_eq!(
            cloud.mutations(),
            vec![
                Mutation::DeleteLbRule("default-svc-a-tcp-80".to_string()),
                Mutation::CreateLbRule {
                    name: "default-svc-a-tcp-80".to_string(),
                    algorithm: "roundrobin".to_string(),
                    protocol: "tcp".to_string(),
                    public_ip_id: "ip-1".to_string(),
                    public_port: 80,
                    private_port: 30080,
                    cidrs: owned(&["10.0.0.0/8", "192.168.0.0/16"]),
                },
                Mutation::AssignVms {
                    rule: "default-svc-a-tcp-80".to_string(),
                    vms: owned(&["vm-n1", "vm-n2"]),
                },
                Mutation::DeleteFirewall("fw-3".to_string()),
                Mutation::CreateFirewall {
                    ip_id: "ip-1".to_string(),
                    protocol: "tcp".to_string(),
                    port: 80,
                    cidrs: owned(&["10.0.0.0/8", "192.168.0.0/16"]),
                },
            ]
        );
        // the IP survives the recreate cycle
        assert_eq!(cloud.public_ips(), vec!["192.0.2.1"]);
    }

    #[tokio::test]
    async fn test_node_port_change_recreates_rule() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);

        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();
        cloud.clear_mutations();

        let service = service_fixture("default", "svc-a", &[("TCP", 80, 30081)]);
        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();

        let mutations = cloud.mutations();
        assert_eq!(
            mutations[0],
            Mutation::DeleteLbRule("default-svc-a-tcp-80".to_string())
        );
        assert!(matches!(
            &mutations[1],
            Mutation::CreateLbRule { private_port: 30081, .. }
        ));
    }

    #[tokio::test]
    async fn test_scale_down_deletes_only_the_dropped_port() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let wide = service_fixture(
            "default",
            "svc-a",
            &[("TCP", 80, 30080), ("TCP", 443, 30443)],
        );

        engine
            .ensure_load_balancer(&wide, &two_nodes())
            .await
            .unwrap();
        cloud.clear_mutations();

        let narrow = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);
        engine
            .ensure_load_balancer(&narrow, &two_nodes())
            .await
            .unwrap();

        assert_eq!(
            cloud.mutations(),
            vec![
                Mutation::DeleteFirewall("fw-5".to_string()),
                Mutation::DeleteLbRule("default-svc-a-tcp-443".to_string()),
            ]
        );
        assert_eq!(cloud.lb_rule_names(), vec!["default-svc-a-tcp-80"]);
        assert_eq!(cloud.public_ips(), vec!["192.0.2.1"]);
    }

    #[tokio::test]
    async fn test_update_converges_membership() {
        let cloud = flat_cloud("4.22.0").with_vm("vm-n3", "n3", "net-1");
        let engine = reconciler(&cloud).await;
        let service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);

        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();
        cloud.clear_mutations();

        let nodes = vec![node_fixture("n2"), node_fixture("n3")];
        engine.update_load_balancer(&service, &nodes).await.unwrap();

        assert_eq!(
            cloud.mutations(),
            vec![
                Mutation::AssignVms {
                    rule: "default-svc-a-tcp-80".to_string(),
                    vms: owned(&["vm-n3"]),
                },
                Mutation::RemoveVms {
                    rule: "default-svc-a-tcp-80".to_string(),
                    vms: owned(&["vm-n1"]),
                },
            ]
        );
        assert_eq!(
            cloud.members_of("default-svc-a-tcp-80"),
            owned(&["vm-n2", "vm-n3"])
        );
    }

    #[tokio::test]
    async fn test_delete_releases_controller_allocated_ip() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);

        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();
        cloud.clear_mutations();

        engine.delete_load_balancer(&service).await.unwrap();

        assert_eq!(
            cloud.mutations(),
            vec![
                Mutation::DeleteFirewall("fw-3".to_string()),
                Mutation::DeleteLbRule("default-svc-a-tcp-80".to_string()),
                Mutation::DisassociateIp("ip-1".to_string()),
            ]
        );
        assert!(cloud.lb_rule_names().is_empty());
        assert!(cloud.public_ips().is_empty());
    }

    #[tokio::test]
    async fn test_delete_preserves_requested_ip() {
        let cloud = flat_cloud("4.22.0").with_allocated_ip("ip-pre", "203.0.113.10");
        let engine = reconciler(&cloud).await;
        let mut service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);
        // safe unwrap: the fixture always has a spec
        service.spec.as_mut().unwrap().load_balancer_ip = Some("203.0.113.10".to_string());

        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();
        engine.delete_load_balancer(&service).await.unwrap();

        assert!(
            !cloud
                .mutations()
                .iter()
                .any(|m| matches!(m, Mutation::DisassociateIp(_)))
        );
        assert_eq!(cloud.public_ips(), vec!["203.0.113.10"]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_on_absent_balancer() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);

        engine.delete_load_balancer(&service).await.unwrap();
        assert!(cloud.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_ensure_releases_orphaned_ip() {
        let cloud = flat_cloud("4.22.0").with_firewall_create_failure();
        let engine = reconciler(&cloud).await;
        let service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);

        let err = engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PerimeterCreateFailed(_, _)));
        assert!(
            cloud
                .mutations()
                .contains(&Mutation::DisassociateIp("ip-1".to_string()))
        );
        assert!(cloud.public_ips().is_empty());
    }

    #[tokio::test]
    async fn test_get_load_balancer() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);

        assert!(engine.get_load_balancer(&service).await.unwrap().is_none());

        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();
        let status = engine.get_load_balancer(&service).await.unwrap().unwrap();
        assert_eq!(
            status.ingress.unwrap()[0].ip.as_deref(),
            Some("192.0.2.1")
        );
    }

    #[tokio::test]
    async fn test_hostname_annotation_wins_over_ip() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let service = annotate(
            service_fixture("default", "svc-a", &[("TCP", 80, 30080)]),
            crate::annotations::HOSTNAME,
            "lb.example.com",
        );

        let status = engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();
        let ingress = status.ingress.unwrap();
        assert_eq!(ingress[0].hostname.as_deref(), Some("lb.example.com"));
        assert_eq!(ingress[0].ip, None);
    }

    #[tokio::test]
    async fn test_client_ip_affinity_selects_source_algorithm() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let mut service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);
        // safe unwrap: the fixture always has a spec
        service.spec.as_mut().unwrap().session_affinity = Some("ClientIP".to_string());

        engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap();
        assert!(cloud.mutations().iter().any(|m| matches!(
            m,
            Mutation::CreateLbRule { algorithm, .. } if algorithm == "source"
        )));
    }

    #[tokio::test]
    async fn test_unsupported_affinity_is_rejected() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let mut service = service_fixture("default", "svc-a", &[("TCP", 80, 30080)]);
        // safe unwrap: the fixture always has a spec
        service.spec.as_mut().unwrap().session_affinity = Some("ClientIPPort".to_string());

        let err = engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAffinity(a) if a == "ClientIPPort"));
        assert!(cloud.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_sctp_port_is_rejected() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let service = service_fixture("default", "svc-a", &[("SCTP", 80, 30080)]);

        let err = engine
            .ensure_load_balancer(&service, &two_nodes())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedProtocol { protocol, port: 80 } if protocol == "SCTP"
        ));
    }

    #[tokio::test]
    async fn test_service_without_ports_is_rejected() {
        let cloud = flat_cloud("4.22.0");
        let engine = reconciler(&cloud).await;
        let service = service_fixture("default", "svc-a", &[]);

        assert!(matches!(
            engine.ensure_load_balancer(&service, &two_nodes()).await,
            Err(Error::MissingData(_))
        ));
    }
}
