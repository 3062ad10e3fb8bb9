//! In-memory CloudStack used by the engine tests. State is shared across
//! clones so a test can hand one handle to the reconciler and inspect the
//! other. Every mutating call is recorded in order.

use ccm_cloudstack::api::CloudStackApi;
use ccm_cloudstack::error::{Error as CsError, Result as CsResult};
use ccm_cloudstack::types::{
    CreateFirewallRule, CreateLoadBalancerRule, CreateNetworkAcl, FirewallRule, LoadBalancerRule,
    Network, NetworkAcl, NetworkAclList, NetworkServiceEntry, Nic, PublicIpAddress,
    UpdateLoadBalancerRule, VirtualMachine,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::{Node, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreateLbRule {
        name: String,
        algorithm: String,
        protocol: String,
        public_ip_id: String,
        public_port: i32,
        private_port: i32,
        cidrs: Vec<String>,
    },
    UpdateLbRule {
        name: String,
        algorithm: Option<String>,
        protocol: Option<String>,
        cidrs: Option<Vec<String>>,
    },
    DeleteLbRule(String),
    AssignVms { rule: String, vms: Vec<String> },
    RemoveVms { rule: String, vms: Vec<String> },
    AssociateIp(String),
    DisassociateIp(String),
    CreateFirewall {
        ip_id: String,
        protocol: String,
        port: i32,
        cidrs: Vec<String>,
    },
    DeleteFirewall(String),
    CreateAcl {
        acl_list_id: String,
        protocol: String,
        port: i32,
        cidrs: Vec<String>,
    },
    DeleteAcl(String),
}

#[derive(Default)]
struct State {
    version: String,
    lb_rules: Vec<LoadBalancerRule>,
    members: HashMap<String, Vec<String>>,
    ips: Vec<PublicIpAddress>,
    firewall: Vec<FirewallRule>,
    acl_lists: Vec<NetworkAclList>,
    acls: Vec<NetworkAcl>,
    networks: Vec<Network>,
    vms: Vec<VirtualMachine>,
    next_id: u32,
    fail_firewall_create: bool,
    mutations: Vec<Mutation>,
}

impl State {
    fn mint(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

#[derive(Clone)]
pub struct FakeCloud {
    state: Arc<Mutex<State>>,
}

impl FakeCloud {
    pub fn new(version: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                version: version.to_string(),
                ..State::default()
            })),
        }
    }

    pub fn with_network(self, network: Network) -> Self {
        self.state.lock().unwrap().networks.push(network);
        self
    }

    pub fn with_vm(self, id: &str, name: &str, network_id: &str) -> Self {
        self.state.lock().unwrap().vms.push(VirtualMachine {
            id: id.to_string(),
            name: name.to_string(),
            nics: vec![Nic {
                id: format!("nic-{id}"),
                network_id: network_id.to_string(),
                is_default: Some(true),
            }],
        });
        self
    }

    pub fn with_allocated_ip(self, id: &str, address: &str) -> Self {
        self.state.lock().unwrap().ips.push(PublicIpAddress {
            id: id.to_string(),
            ip_address: address.to_string(),
            state: "Allocated".to_string(),
            associated_network_id: None,
            vpc_id: None,
        });
        self
    }

    pub fn with_free_ip(self, id: &str, address: &str) -> Self {
        self.state.lock().unwrap().ips.push(PublicIpAddress {
            id: id.to_string(),
            ip_address: address.to_string(),
            state: "Free".to_string(),
            associated_network_id: None,
            vpc_id: None,
        });
        self
    }

    pub fn with_acl_list(self, id: &str, name: &str) -> Self {
        self.state.lock().unwrap().acl_lists.push(NetworkAclList {
            id: id.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn with_firewall_rule(
        self,
        id: &str,
        ip_id: &str,
        protocol: &str,
        port: i64,
        cidrs: &str,
    ) -> Self {
        self.state.lock().unwrap().firewall.push(FirewallRule {
            id: id.to_string(),
            protocol: protocol.to_string(),
            start_port: Some(port),
            end_port: Some(port),
            cidr_list: cidrs.to_string(),
            ip_address_id: ip_id.to_string(),
        });
        self
    }

    pub fn with_firewall_create_failure(self) -> Self {
        self.state.lock().unwrap().fail_firewall_create = true;
        self
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.state.lock().unwrap().mutations.clear();
    }

    pub fn lb_rule_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .lb_rules
            .iter()
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn members_of(&self, rule_name: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let id = state
            .lb_rules
            .iter()
            .find(|r| r.name == rule_name)
            .map(|r| r.id.clone())
            .unwrap_or_default();
        let mut members = state.members.get(&id).cloned().unwrap_or_default();
        members.sort();
        members
    }

    pub fn public_ips(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .ips
            .iter()
            .map(|ip| ip.ip_address.clone())
            .collect()
    }

    fn record(&self, mutation: Mutation) {
        self.state.lock().unwrap().mutations.push(mutation);
    }

    fn rule_label(state: &State, id: &str) -> String {
        state
            .lb_rules
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

fn not_found(what: &str) -> CsError {
    CsError::MissingData(what.to_string())
}

impl CloudStackApi for FakeCloud {
    async fn list_load_balancer_rules(&self, keyword: &str) -> CsResult<Vec<LoadBalancerRule>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .lb_rules
            .iter()
            .filter(|r| r.name.contains(keyword))
            .cloned()
            .collect())
    }

    async fn create_load_balancer_rule(
        &self,
        p: CreateLoadBalancerRule<'_>,
    ) -> CsResult<LoadBalancerRule> {
        let mut state = self.state.lock().unwrap();
        let public_ip = state
            .ips
            .iter()
            .find(|ip| ip.id == p.public_ip_id)
            .map(|ip| ip.ip_address.clone())
            .ok_or_else(|| not_found("public IP for rule"))?;
        let id = state.mint("lbrule");
        let rule = LoadBalancerRule {
            id: id.clone(),
            name: p.name.to_string(),
            algorithm: p.algorithm.to_string(),
            protocol: p.protocol.to_string(),
            public_ip,
            public_ip_id: p.public_ip_id.to_string(),
            public_port: p.public_port.to_string(),
            private_port: p.private_port.to_string(),
            cidr_list: p.cidr_list.join(","),
        };
        state.lb_rules.push(rule.clone());
        state.members.insert(id, Vec::new());
        state.mutations.push(Mutation::CreateLbRule {
            name: p.name.to_string(),
            algorithm: p.algorithm.to_string(),
            protocol: p.protocol.to_string(),
            public_ip_id: p.public_ip_id.to_string(),
            public_port: p.public_port,
            private_port: p.private_port,
            cidrs: p.cidr_list.to_vec(),
        });
        Ok(rule)
    }

    async fn update_load_balancer_rule(
        &self,
        id: &str,
        update: UpdateLoadBalancerRule<'_>,
    ) -> CsResult<()> {
        let mut state = self.state.lock().unwrap();
        let name = Self::rule_label(&state, id);
        let rule = state
            .lb_rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| not_found("load balancer rule"))?;
        if let Some(algorithm) = update.algorithm {
            rule.algorithm = algorithm.to_string();
        }
        if let Some(protocol) = update.protocol {
            rule.protocol = protocol.to_string();
        }
        if let Some(cidrs) = update.cidr_list {
            rule.cidr_list = cidrs.join(",");
        }
        state.mutations.push(Mutation::UpdateLbRule {
            name,
            algorithm: update.algorithm.map(str::to_string),
            protocol: update.protocol.map(str::to_string),
            cidrs: update.cidr_list.map(<[String]>::to_vec),
        });
        Ok(())
    }

    async fn delete_load_balancer_rule(&self, id: &str) -> CsResult<()> {
        let mut state = self.state.lock().unwrap();
        let name = Self::rule_label(&state, id);
        state.lb_rules.retain(|r| r.id != id);
        state.members.remove(id);
        state.mutations.push(Mutation::DeleteLbRule(name));
        Ok(())
    }

    async fn assign_to_load_balancer_rule(&self, id: &str, vm_ids: &[String]) -> CsResult<()> {
        let mut state = self.state.lock().unwrap();
        let name = Self::rule_label(&state, id);
        let members = state.members.entry(id.to_string()).or_default();
        for vm in vm_ids {
            if !members.contains(vm) {
                members.push(vm.clone());
            }
        }
        state.mutations.push(Mutation::AssignVms {
            rule: name,
            vms: vm_ids.to_vec(),
        });
        Ok(())
    }

    async fn remove_from_load_balancer_rule(&self, id: &str, vm_ids: &[String]) -> CsResult<()> {
        let mut state = self.state.lock().unwrap();
        let name = Self::rule_label(&state, id);
        if let Some(members) = state.members.get_mut(id) {
            members.retain(|m| !vm_ids.contains(m));
        }
        state.mutations.push(Mutation::RemoveVms {
            rule: name,
            vms: vm_ids.to_vec(),
        });
        Ok(())
    }

    async fn list_load_balancer_rule_instances(&self, id: &str) -> CsResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.members.get(id).cloned().unwrap_or_default())
    }

    async fn list_public_ip_addresses(&self, address: &str) -> CsResult<Vec<PublicIpAddress>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .ips
            .iter()
            .filter(|ip| ip.ip_address == address)
            .cloned()
            .collect())
    }

    async fn associate_ip_address(&self, network_id: &str) -> CsResult<PublicIpAddress> {
        let mut state = self.state.lock().unwrap();
        let id = state.mint("ip");
        let n = state.next_id;
        let ip = PublicIpAddress {
            id,
            ip_address: format!("192.0.2.{n}"),
            state: "Allocated".to_string(),
            associated_network_id: Some(network_id.to_string()),
            vpc_id: None,
        };
        state.ips.push(ip.clone());
        state
            .mutations
            .push(Mutation::AssociateIp(network_id.to_string()));
        Ok(ip)
    }

    async fn associate_ip_address_for_vpc(&self, vpc_id: &str) -> CsResult<PublicIpAddress> {
        let mut state = self.state.lock().unwrap();
        let id = state.mint("ip");
        let n = state.next_id;
        let network_id = state
            .networks
            .iter()
            .find(|net| net.vpc_id.as_deref() == Some(vpc_id))
            .map(|net| net.id.clone());
        let ip = PublicIpAddress {
            id,
            ip_address: format!("192.0.2.{n}"),
            state: "Allocated".to_string(),
            associated_network_id: network_id,
            vpc_id: Some(vpc_id.to_string()),
        };
        state.ips.push(ip.clone());
        state.mutations.push(Mutation::AssociateIp(vpc_id.to_string()));
        Ok(ip)
    }

    async fn disassociate_ip_address(&self, id: &str) -> CsResult<()> {
        let mut state = self.state.lock().unwrap();
        state.ips.retain(|ip| ip.id != id);
        state.mutations.push(Mutation::DisassociateIp(id.to_string()));
        Ok(())
    }

    async fn list_firewall_rules(&self, ip_address_id: &str) -> CsResult<Vec<FirewallRule>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .firewall
            .iter()
            .filter(|r| r.ip_address_id == ip_address_id)
            .cloned()
            .collect())
    }

    async fn create_firewall_rule(&self, p: CreateFirewallRule<'_>) -> CsResult<FirewallRule> {
        let mut state = self.state.lock().unwrap();
        if state.fail_firewall_create {
            return Err(CsError::Api {
                command: "createFirewallRule".to_string(),
                code: 431,
                text: "injected failure".to_string(),
            });
        }
        let id = state.mint("fw");
        let rule = FirewallRule {
            id,
            protocol: p.protocol.to_string(),
            start_port: Some(i64::from(p.start_port)),
            end_port: Some(i64::from(p.end_port)),
            cidr_list: p.cidr_list.join(","),
            ip_address_id: p.ip_address_id.to_string(),
        };
        state.firewall.push(rule.clone());
        state.mutations.push(Mutation::CreateFirewall {
            ip_id: p.ip_address_id.to_string(),
            protocol: p.protocol.to_string(),
            port: p.start_port,
            cidrs: p.cidr_list.to_vec(),
        });
        Ok(rule)
    }

    async fn delete_firewall_rule(&self, id: &str) -> CsResult<()> {
        let mut state = self.state.lock().unwrap();
        state.firewall.retain(|r| r.id != id);
        state.mutations.push(Mutation::DeleteFirewall(id.to_string()));
        Ok(())
    }

    async fn get_network_acl_list(&self, id: &str) -> CsResult<NetworkAclList> {
        let state = self.state.lock().unwrap();
        state
            .acl_lists
            .iter()
            .find(|l| l.id == id)
            .cloned()
            .ok_or_else(|| not_found("ACL list"))
    }

    async fn list_network_acls(&self, acl_list_id: &str) -> CsResult<Vec<NetworkAcl>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .acls
            .iter()
            .filter(|a| a.acl_list_id == acl_list_id)
            .cloned()
            .collect())
    }

    async fn create_network_acl(&self, p: CreateNetworkAcl<'_>) -> CsResult<NetworkAcl> {
        let mut state = self.state.lock().unwrap();
        let id = state.mint("aclrule");
        let acl = NetworkAcl {
            id,
            protocol: p.protocol.to_string(),
            start_port: Some(p.start_port.to_string()),
            end_port: Some(p.end_port.to_string()),
            cidr_list: p.cidr_list.join(","),
            acl_list_id: p.acl_list_id.to_string(),
            action: p.action.to_string(),
            traffic_type: p.traffic_type.to_string(),
        };
        state.acls.push(acl.clone());
        state.mutations.push(Mutation::CreateAcl {
            acl_list_id: p.acl_list_id.to_string(),
            protocol: p.protocol.to_string(),
            port: p.start_port,
            cidrs: p.cidr_list.to_vec(),
        });
        Ok(acl)
    }

    async fn delete_network_acl(&self, id: &str) -> CsResult<()> {
        let mut state = self.state.lock().unwrap();
        state.acls.retain(|a| a.id != id);
        state.mutations.push(Mutation::DeleteAcl(id.to_string()));
        Ok(())
    }

    async fn get_network(&self, id: &str) -> CsResult<Network> {
        let state = self.state.lock().unwrap();
        state
            .networks
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| not_found("network"))
    }

    async fn list_virtual_machines(&self) -> CsResult<Vec<VirtualMachine>> {
        Ok(self.state.lock().unwrap().vms.clone())
    }

    async fn management_server_version(&self) -> CsResult<String> {
        Ok(self.state.lock().unwrap().version.clone())
    }
}

pub fn network_fixture(id: &str, services: &[&str]) -> Network {
    Network {
        id: id.to_string(),
        vpc_id: None,
        acl_id: None,
        services: services
            .iter()
            .map(|name| NetworkServiceEntry {
                name: name.to_string(),
            })
            .collect(),
    }
}

pub fn node_fixture(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        ..Node::default()
    }
}

/// A LoadBalancer service; ports are `(protocol, publicPort, nodePort)`.
pub fn service_fixture(namespace: &str, name: &str, ports: &[(&str, i32, i32)]) -> Service {
    Service {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            session_affinity: Some("None".to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(protocol, port, node_port)| ServicePort {
                        protocol: Some(protocol.to_string()),
                        port: *port,
                        node_port: Some(*node_port),
                        ..ServicePort::default()
                    })
                    .collect(),
            ),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

pub fn annotate(mut service: Service, key: &str, value: &str) -> Service {
    service
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
    service
}
