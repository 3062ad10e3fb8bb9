//! Public IP acquisition and release.

use crate::error::{Error, Result};

use ccm_cloudstack::api::CloudStackApi;
use ccm_cloudstack::types::Network;
use tracing::{debug, info};

/// Outcome of an acquisition. `owned` marks addresses this controller
/// associated itself; only those may ever be released by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredIp {
    pub id: String,
    pub address: String,
    pub owned: bool,
}

/// Acquire the public IP for a service.
///
/// A requested address must resolve to exactly one known IP; an already
/// allocated one is adopted without ownership. A requested-but-unallocated
/// address, or no request at all, goes through allocation on the service's
/// network (or its VPC when it has one).
pub async fn acquire<C: CloudStackApi>(
    cloud: &C,
    requested: Option<&str>,
    network: &Network,
) -> Result<AcquiredIp> {
    if let Some(address) = requested {
        let mut matches = cloud
            .list_public_ip_addresses(address)
            .await
            .map_err(|e| {
                Error::CloudStack(format!("failed to look up public IP {address}"), Box::new(e))
            })?;
        match matches.len() {
            0 => return Err(Error::IpNotFound(address.to_string())),
            1 => {
                // safe unwrap: length checked above
                let ip = matches.pop().unwrap();
                if ip.is_allocated() {
                    debug!(msg = "adopting pre-existing public IP", address);
                    return Ok(AcquiredIp {
                        id: ip.id,
                        address: ip.ip_address,
                        owned: false,
                    });
                }
                // discovered but never allocated: fall through to allocation
            }
            count => {
                return Err(Error::IpAmbiguous {
                    address: address.to_string(),
                    count,
                });
            }
        }
    }

    let ip = match &network.vpc_id {
        Some(vpc_id) => cloud.associate_ip_address_for_vpc(vpc_id).await,
        None => cloud.associate_ip_address(&network.id).await,
    }
    .map_err(|e| {
        Error::AssociateFailed(
            format!("failed to allocate a public IP on network {}", network.id),
            Box::new(e),
        )
    })?;

    let owned = requested != Some(ip.ip_address.as_str());
    info!(msg = "allocated public IP", address = ip.ip_address, owned);
    Ok(AcquiredIp {
        id: ip.id,
        address: ip.ip_address,
        owned,
    })
}

/// Disassociate an IP this controller owns (or no longer wants).
pub async fn release<C: CloudStackApi>(cloud: &C, ip_id: &str) -> Result<()> {
    info!(msg = "releasing public IP", ip_id);
    cloud.disassociate_ip_address(ip_id).await.map_err(|e| {
        Error::CloudStack(format!("failed to release public IP {ip_id}"), Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fake::{FakeCloud, Mutation, network_fixture};

    #[tokio::test]
    async fn test_requested_allocated_ip_is_adopted_without_ownership() {
        let cloud =
            FakeCloud::new("4.22.0").with_allocated_ip("ip-1", "203.0.113.10");
        let network = network_fixture("net-1", &["Firewall"]);

        let acquired = acquire(&cloud, Some("203.0.113.10"), &network)
            .await
            .unwrap();
        assert_eq!(acquired.id, "ip-1");
        assert!(!acquired.owned);
        assert!(cloud.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_requested_unallocated_ip_goes_through_allocation() {
        let cloud = FakeCloud::new("4.22.0").with_free_ip("ip-pre", "203.0.113.10");
        let network = network_fixture("net-1", &["Firewall"]);

        let acquired = acquire(&cloud, Some("203.0.113.10"), &network)
            .await
            .unwrap();
        assert!(acquired.owned);
        assert_eq!(
            cloud.mutations(),
            vec![Mutation::AssociateIp("net-1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unknown_requested_ip_fails() {
        let cloud = FakeCloud::new("4.22.0");
        let network = network_fixture("net-1", &["Firewall"]);

        assert!(matches!(
            acquire(&cloud, Some("203.0.113.99"), &network).await,
            Err(Error::IpNotFound(addr)) if addr == "203.0.113.99"
        ));
    }

    #[tokio::test]
    async fn test_ambiguous_requested_ip_fails() {
        let cloud = FakeCloud::new("4.22.0")
            .with_allocated_ip("ip-1", "203.0.113.10")
            .with_allocated_ip("ip-2", "203.0.113.10");
        let network = network_fixture("net-1", &["Firewall"]);

        assert!(matches!(
            acquire(&cloud, Some("203.0.113.10"), &network).await,
            Err(Error::IpAmbiguous { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_allocation_targets_the_vpc_when_present() {
        let cloud = FakeCloud::new("4.22.0");
        let mut network = network_fixture("net-1", &["NetworkACL"]);
        network.vpc_id = Some("vpc-1".to_string());

        let acquired = acquire(&cloud, None, &network).await.unwrap();
        assert!(acquired.owned);
        assert_eq!(
            cloud.mutations(),
            vec![Mutation::AssociateIp("vpc-1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_allocation_targets_the_network_otherwise() {
        let cloud = FakeCloud::new("4.22.0");
        let network = network_fixture("net-1", &["Firewall"]);

        let acquired = acquire(&cloud, None, &network).await.unwrap();
        assert!(acquired.owned);
        assert_eq!(
            cloud.mutations(),
            vec![Mutation::AssociateIp("net-1".to_string())]
        );
    }
}
