//! Production client for the CloudStack management API.
//!
//! Every command goes out as a signed GET request: the query is sorted by
//! key, percent-encoded, lowercased, and signed with HMAC-SHA1 over the
//! account's secret key. Mutating commands return an async job ID which is
//! polled to completion before the call resolves.

use crate::api::CloudStackApi;
use crate::error::{Error, Result};
use crate::types::{
    CreateFirewallRule, CreateLoadBalancerRule, CreateNetworkAcl, FirewallRule, LoadBalancerRule,
    Network, NetworkAcl, NetworkAclList, PublicIpAddress, UpdateLoadBalancerRule, VirtualMachine,
};

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha1::Sha1;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);
const JOB_TIMEOUT: Duration = Duration::from_secs(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CloudStackConfig {
    pub api_url: String,
    pub api_key: String,
    pub secret_key: String,
    pub ssl_no_verify: bool,
    pub project_id: Option<String>,
    pub zone: Option<String>,
}

pub struct CloudStackClient {
    http: reqwest::Client,
    endpoint: url::Url,
    api_key: String,
    secret_key: String,
    project_id: Option<String>,
    zone: Option<String>,
}

type Params = Vec<(&'static str, String)>;

impl CloudStackClient {
    pub fn new(config: CloudStackConfig) -> Result<Self> {
        let endpoint = url::Url::parse(&config.api_url)
            .map_err(|e| Error::UrlParse(format!("invalid api-url {:?}", config.api_url), e))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.ssl_no_verify)
            .build()
            .map_err(|e| Error::Http("failed to build HTTP client".to_string(), e))?;
        Ok(Self {
            http,
            endpoint,
            api_key: config.api_key,
            secret_key: config.secret_key,
            project_id: config.project_id,
            zone: config.zone,
        })
    }

    fn encode(value: &str) -> String {
        // CloudStack signs %20, not '+', for spaces.
        url::form_urlencoded::byte_serialize(value.as_bytes())
            .collect::<String>()
            .replace('+', "%20")
    }

    /// Signature over the sorted, encoded, lowercased query string.
    fn sign(&self, query: &str) -> String {
        // safe unwrap: HMAC accepts keys of any length
        let mut mac = Hmac::<Sha1>::new_from_slice(self.secret_key.as_bytes()).unwrap();
        mac.update(query.to_lowercase().as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// Issue a command and return the inner payload of its
    /// `<command>response` envelope.
    async fn call(&self, command: &str, params: Params) -> Result<Value> {
        let mut pairs: Vec<(String, String)> = params
            .into_iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        pairs.push(("command".to_string(), command.to_string()));
        pairs.push(("apikey".to_string(), self.api_key.clone()));
        pairs.push(("response".to_string(), "json".to_string()));
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let query = pairs
            .iter()
            .map(|(k, v)| format!("{k}={}", Self::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        let uri = format!(
            "{}?{query}&signature={}",
            self.endpoint,
            Self::encode(&signature)
        );

        trace!(msg = "issuing CloudStack command", command);
        let response = self
            .http
            .get(&uri)
            .send()
            .await
            .map_err(|e| Error::Http(format!("{command} request failed"), e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("failed to read {command} response"), e))?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| Error::Decode(format!("invalid JSON from {command}"), e))?;

        let inner = value
            .get("errorresponse")
            .or_else(|| value.as_object().and_then(|o| o.values().next()))
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(code) = inner.get("errorcode").and_then(Value::as_i64) {
            return Err(Error::Api {
                command: command.to_string(),
                code,
                text: inner
                    .get("errortext")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        if !status.is_success() {
            return Err(Error::Api {
                command: command.to_string(),
                code: i64::from(status.as_u16()),
                text: body,
            });
        }
        Ok(inner)
    }

    /// Issue an async command and block until its job completes, returning
    /// the job result payload.
    async fn call_job(&self, command: &str, params: Params) -> Result<Value> {
        let response = self.call(command, params).await?;
        let Some(job_id) = response.get("jobid").and_then(Value::as_str) else {
            return Ok(response);
        };
        let job_id = job_id.to_string();
        debug!(msg = "waiting for async job", command, job_id);

        let deadline = Instant::now() + JOB_TIMEOUT;
        loop {
            let job = self
                .call("queryAsyncJobResult", vec![("jobid", job_id.clone())])
                .await?;
            match job.get("jobstatus").and_then(Value::as_i64) {
                Some(0) => {}
                Some(1) => return Ok(job.get("jobresult").cloned().unwrap_or(Value::Null)),
                _ => {
                    let result = job.get("jobresult").cloned().unwrap_or(Value::Null);
                    return Err(Error::JobFailed {
                        job_id,
                        code: result.get("errorcode").and_then(Value::as_i64).unwrap_or(0),
                        text: result
                            .get("errortext")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown job error")
                            .to_string(),
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::JobTimeout(job_id));
            }
            sleep(JOB_POLL_INTERVAL).await;
        }
    }

    fn project_param(&self, params: &mut Params) {
        if let Some(project) = &self.project_id {
            params.push(("projectid", project.clone()));
        }
    }

    fn list_of<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<Vec<T>> {
        match payload.get(key) {
            Some(entries) => serde_json::from_value(entries.clone())
                .map_err(|e| Error::Decode(format!("invalid {key} list"), e)),
            None => Ok(Vec::new()),
        }
    }

    fn entity_of<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<T> {
        let entity = payload
            .get(key)
            .ok_or_else(|| Error::MissingData(format!("response has no {key} entity")))?;
        serde_json::from_value(entity.clone())
            .map_err(|e| Error::Decode(format!("invalid {key} entity"), e))
    }
}

#[derive(Deserialize)]
struct InstanceRef {
    id: String,
}

impl CloudStackApi for CloudStackClient {
    async fn list_load_balancer_rules(&self, keyword: &str) -> Result<Vec<LoadBalancerRule>> {
        let mut params: Params = vec![("keyword", keyword.to_string()), ("listall", "true".into())];
        self.project_param(&mut params);
        let payload = self.call("listLoadBalancerRules", params).await?;
        Self::list_of(&payload, "loadbalancerrule")
    }

    async fn create_load_balancer_rule(
        &self,
        p: CreateLoadBalancerRule<'_>,
    ) -> Result<LoadBalancerRule> {
        let mut params: Params = vec![
            ("name", p.name.to_string()),
            ("algorithm", p.algorithm.to_string()),
            ("protocol", p.protocol.to_string()),
            ("publicipid", p.public_ip_id.to_string()),
            ("publicport", p.public_port.to_string()),
            ("privateport", p.private_port.to_string()),
            ("cidrlist", p.cidr_list.join(",")),
            ("networkid", p.network_id.to_string()),
            ("openfirewall", p.open_firewall.to_string()),
        ];
        self.project_param(&mut params);
        let result = self.call_job("createLoadBalancerRule", params).await?;
        Self::entity_of(&result, "loadbalancer")
    }

    async fn update_load_balancer_rule(
        &self,
        id: &str,
        update: UpdateLoadBalancerRule<'_>,
    ) -> Result<()> {
        let mut params: Params = vec![("id", id.to_string())];
        if let Some(algorithm) = update.algorithm {
            params.push(("algorithm", algorithm.to_string()));
        }
        if let Some(protocol) = update.protocol {
            params.push(("protocol", protocol.to_string()));
        }
        if let Some(cidrs) = update.cidr_list {
            params.push(("cidrlist", cidrs.join(",")));
        }
        self.call_job("updateLoadBalancerRule", params).await?;
        Ok(())
    }

    async fn delete_load_balancer_rule(&self, id: &str) -> Result<()> {
        self.call_job("deleteLoadBalancerRule", vec![("id", id.to_string())])
            .await?;
        Ok(())
    }

    async fn assign_to_load_balancer_rule(&self, id: &str, vm_ids: &[String]) -> Result<()> {
        self.call_job(
            "assignToLoadBalancerRule",
            vec![
                ("id", id.to_string()),
                ("virtualmachineids", vm_ids.join(",")),
            ],
        )
        .await?;
        Ok(())
    }

    async fn remove_from_load_balancer_rule(&self, id: &str, vm_ids: &[String]) -> Result<()> {
        self.call_job(
            "removeFromLoadBalancerRule",
            vec![
                ("id", id.to_string()),
                ("virtualmachineids", vm_ids.join(",")),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_load_balancer_rule_instances(&self, id: &str) -> Result<Vec<String>> {
        let params: Params = vec![("id", id.to_string()), ("listall", "true".into())];
        let payload = self.call("listLoadBalancerRuleInstances", params).await?;
        let instances: Vec<InstanceRef> = Self::list_of(&payload, "loadbalancerruleinstance")?;
        Ok(instances.into_iter().map(|i| i.id).collect())
    }

    async fn list_public_ip_addresses(&self, address: &str) -> Result<Vec<PublicIpAddress>> {
        let mut params: Params = vec![
            ("ipaddress", address.to_string()),
            ("listall", "true".into()),
        ];
        self.project_param(&mut params);
        let payload = self.call("listPublicIpAddresses", params).await?;
        Self::list_of(&payload, "publicipaddress")
    }

    async fn associate_ip_address(&self, network_id: &str) -> Result<PublicIpAddress> {
        let mut params: Params = vec![("networkid", network_id.to_string())];
        if let Some(zone) = &self.zone {
            params.push(("zoneid", zone.clone()));
        }
        self.project_param(&mut params);
        let result = self.call_job("associateIpAddress", params).await?;
        Self::entity_of(&result, "ipaddress")
    }

    async fn associate_ip_address_for_vpc(&self, vpc_id: &str) -> Result<PublicIpAddress> {
        let mut params: Params = vec![("vpcid", vpc_id.to_string())];
        if let Some(zone) = &self.zone {
            params.push(("zoneid", zone.clone()));
        }
        self.project_param(&mut params);
        let result = self.call_job("associateIpAddress", params).await?;
        Self::entity_of(&result, "ipaddress")
    }

    async fn disassociate_ip_address(&self, id: &str) -> Result<()> {
        self.call_job("disassociateIpAddress", vec![("id", id.to_string())])
            .await?;
        Ok(())
    }

    async fn list_firewall_rules(&self, ip_address_id: &str) -> Result<Vec<FirewallRule>> {
        let mut params: Params = vec![
            ("ipaddressid", ip_address_id.to_string()),
            ("listall", "true".into()),
        ];
        self.project_param(&mut params);
        let payload = self.call("listFirewallRules", params).await?;
        Self::list_of(&payload, "firewallrule")
    }

    async fn create_firewall_rule(&self, p: CreateFirewallRule<'_>) -> Result<FirewallRule> {
        let mut params: Params = vec![
            ("ipaddressid", p.ip_address_id.to_string()),
            ("protocol", p.protocol.to_string()),
            ("startport", p.start_port.to_string()),
            ("endport", p.end_port.to_string()),
            ("cidrlist", p.cidr_list.join(",")),
        ];
        self.project_param(&mut params);
        let result = self.call_job("createFirewallRule", params).await?;
        Self::entity_of(&result, "firewallrule")
    }

    async fn delete_firewall_rule(&self, id: &str) -> Result<()> {
        self.call_job("deleteFirewallRule", vec![("id", id.to_string())])
            .await?;
        Ok(())
    }

    async fn get_network_acl_list(&self, id: &str) -> Result<NetworkAclList> {
        let mut params: Params = vec![("id", id.to_string())];
        self.project_param(&mut params);
        let payload = self.call("listNetworkACLLists", params).await?;
        let lists: Vec<NetworkAclList> = Self::list_of(&payload, "networkacllist")?;
        lists
            .into_iter()
            .next()
            .ok_or_else(|| Error::MissingData(format!("no ACL list with id {id}")))
    }

    async fn list_network_acls(&self, acl_list_id: &str) -> Result<Vec<NetworkAcl>> {
        let mut params: Params = vec![
            ("aclid", acl_list_id.to_string()),
            ("listall", "true".into()),
        ];
        self.project_param(&mut params);
        let payload = self.call("listNetworkACLs", params).await?;
        Self::list_of(&payload, "networkacl")
    }

    async fn create_network_acl(&self, p: CreateNetworkAcl<'_>) -> Result<NetworkAcl> {
        let mut params: Params = vec![
            ("aclid", p.acl_list_id.to_string()),
            ("protocol", p.protocol.to_string()),
            ("startport", p.start_port.to_string()),
            ("endport", p.end_port.to_string()),
            ("cidrlist", p.cidr_list.join(",")),
            ("action", p.action.to_string()),
            ("traffictype", p.traffic_type.to_string()),
        ];
        self.project_param(&mut params);
        let result = self.call_job("createNetworkACL", params).await?;
        Self::entity_of(&result, "networkacl")
    }

    async fn delete_network_acl(&self, id: &str) -> Result<()> {
        self.call_job("deleteNetworkACL", vec![("id", id.to_string())])
            .await?;
        Ok(())
    }

    async fn get_network(&self, id: &str) -> Result<Network> {
        let mut params: Params = vec![("id", id.to_string())];
        self.project_param(&mut params);
        let payload = self.call("listNetworks", params).await?;
        let networks: Vec<Network> = Self::list_of(&payload, "network")?;
        networks
            .into_iter()
            .next()
            .ok_or_else(|| Error::MissingData(format!("no network with id {id}")))
    }

    async fn list_virtual_machines(&self) -> Result<Vec<VirtualMachine>> {
        let mut params: Params = vec![
            ("listall", "true".into()),
            ("details", "min,nics".into()),
        ];
        self.project_param(&mut params);
        let payload = self.call("listVirtualMachines", params).await?;
        Self::list_of(&payload, "virtualmachine")
    }

    async fn management_server_version(&self) -> Result<String> {
        let payload = self.call("listManagementServers", vec![]).await?;
        let servers: Vec<crate::types::ManagementServer> =
            Self::list_of(&payload, "managementserver")?;
        servers
            .into_iter()
            .find_map(|s| s.version)
            .ok_or_else(|| Error::MissingData("no management server reported a version".into()))
    }
}
