//! Resolution of Kubernetes nodes to CloudStack virtual machines.

use crate::error::{Error, Result};

use std::collections::{BTreeSet, HashSet};

use ccm_cloudstack::api::CloudStackApi;
use k8s_openapi::api::core::v1::Node;
use tracing::debug;

/// Matched VM IDs plus the single network they share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNodes {
    pub host_ids: Vec<String>,
    pub network_id: String,
}

/// Match the node set against the CloudStack VM inventory by name. FQDN
/// node names are reduced to their host part and matching is
/// case-insensitive. All matched VMs must sit on one network; load
/// balancer rules bind to exactly one.
pub async fn resolve<C: CloudStackApi>(cloud: &C, nodes: &[Node]) -> Result<ResolvedNodes> {
    let wanted: HashSet<String> = nodes
        .iter()
        .filter_map(|n| n.metadata.name.as_deref())
        .map(host_name)
        .collect();

    let vms = cloud
        .list_virtual_machines()
        .await
        .map_err(|e| Error::CloudStack("failed to list virtual machines".to_string(), Box::new(e)))?;

    let mut host_ids = Vec::new();
    let mut networks = BTreeSet::new();
    for vm in vms {
        if !wanted.contains(&vm.name.to_lowercase()) {
            continue;
        }
        let nic = vm.default_nic().ok_or_else(|| {
            Error::MissingData(format!("virtual machine {} has no NICs", vm.name))
        })?;
        networks.insert(nic.network_id.clone());
        host_ids.push(vm.id);
    }

    if host_ids.is_empty() {
        return Err(Error::NoMatchingHost);
    }
    if networks.len() > 1 {
        return Err(Error::MultipleNetworks(networks.into_iter().collect()));
    }
    // safe unwrap: networks holds exactly one entry here
    let network_id = networks.into_iter().next().unwrap();
    debug!(msg = "resolved nodes", hosts = host_ids.len(), network_id);
    Ok(ResolvedNodes {
        host_ids,
        network_id,
    })
}

/// `<host>.<domain>` reduces to `<host>`; comparison is case-insensitive.
fn host_name(node_name: &str) -> String {
    node_name
        .split('.')
        .next()
        .unwrap_or(node_name)
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fake::{FakeCloud, node_fixture};

    #[test]
    fn test_host_name_reduction() {
        assert_eq!(host_name("worker-1.cluster.local"), "worker-1");
        assert_eq!(host_name("Worker-2"), "worker-2");
        assert_eq!(host_name(""), "");
    }

    #[tokio::test]
    async fn test_resolve_matches_fqdn_case_insensitively() {
        let cloud = FakeCloud::new("4.22.0")
            .with_vm("vm-1", "Worker-1", "net-1")
            .with_vm("vm-2", "worker-2", "net-1")
            .with_vm("vm-3", "bystander", "net-1");
        let nodes = vec![
            node_fixture("worker-1.cluster.local"),
            node_fixture("WORKER-2"),
        ];

        let resolved = resolve(&cloud, &nodes).await.unwrap();
        assert_eq!(resolved.host_ids, vec!["vm-1", "vm-2"]);
        assert_eq!(resolved.network_id, "net-1");
    }

    #[tokio::test]
    async fn test_resolve_rejects_split_networks() {
        let cloud = FakeCloud::new("4.22.0")
            .with_vm("vm-1", "worker-1", "net-1")
            .with_vm("vm-2", "worker-2", "net-2");
        let nodes = vec![node_fixture("worker-1"), node_fixture("worker-2")];

        let err = resolve(&cloud, &nodes).await.unwrap_err();
        assert!(matches!(err, Error::MultipleNetworks(ids) if ids == vec!["net-1", "net-2"]));
    }

    #[tokio::test]
    async fn test_resolve_requires_a_match() {
        let cloud = FakeCloud::new("4.22.0").with_vm("vm-1", "worker-1", "net-1");
        let nodes = vec![node_fixture("stranger")];

        assert!(matches!(
            resolve(&cloud, &nodes).await,
            Err(Error::NoMatchingHost)
        ));
    }
}
