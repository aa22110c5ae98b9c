//! Provisioning: allocate an address, certify the node, render its profile.

use crate::ca::{CertificateAuthority, NodeKeyPair};
use crate::error::AppResult;
use crate::ipam::AddressAllocator;
use crate::profile::{ConnectionProfile, NodeSpec};
use std::sync::Arc;
use tracing::{info, warn};

/// One provisioning call
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub spec: NodeSpec,
    /// Node public key PEM. When absent a key pair is generated and its
    /// private half is placed in the profile.
    pub public_key_pem: Option<String>,
    /// Route the node through the server lighthouse
    pub use_lighthouse: bool,
}

/// Result of a successful provisioning call
#[derive(Debug, Clone)]
pub struct ProvisionedNode {
    /// Assigned address with the network prefix
    pub address: String,
    pub certificate_pem: String,
    pub profile: ConnectionProfile,
}

/// Composes the allocator and the CA. Callers must already be authorized.
#[derive(Debug, Clone)]
pub struct Provisioner {
    allocator: AddressAllocator,
    ca: Arc<CertificateAuthority>,
    public_addr: String,
}

impl Provisioner {
    pub fn new(allocator: AddressAllocator, ca: Arc<CertificateAuthority>, public_addr: &str) -> Self {
        Self {
            allocator,
            ca,
            public_addr: public_addr.to_string(),
        }
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Allocate, sign and package.
    ///
    /// Allocation and signing are separate transactions: if signing fails the
    /// address is not returned to the pool.
    pub async fn provision(&self, request: ProvisionRequest) -> AppResult<ProvisionedNode> {
        let (public_key_pem, private_key_pem) = match request.public_key_pem {
            Some(pem) => (pem, None),
            None => {
                let pair = NodeKeyPair::generate(self.ca.curve())?;
                (pair.public_key_pem(), Some(pair.private_key_pem()))
            }
        };

        let ip = self.allocator.next_ip().await?;
        let address = self.allocator.join_address_and_prefix(ip);

        let certificate = match self.ca.sign(
            &request.spec.name,
            &address,
            &request.spec.groups,
            &public_key_pem,
        ) {
            Ok(certificate) => certificate,
            Err(e) => {
                warn!("Address {} stranded, signing failed: {}", address, e);
                return Err(e);
            }
        };
        let certificate_pem = certificate.to_pem()?;

        let key_pem = private_key_pem.as_deref().map(String::as_str).unwrap_or("");
        let mut profile = ConnectionProfile::new(
            &request.spec,
            &self.ca.cert_pem()?,
            &certificate_pem,
            key_pem,
        );
        if request.use_lighthouse {
            let server_addr = self.allocator.server_addr().to_string();
            profile.apply_lighthouse(&server_addr, vec![self.public_addr.clone()]);
        }

        info!(
            name = %certificate.name(),
            address = %address,
            "Provisioned node"
        );

        Ok(ProvisionedNode {
            address,
            certificate_pem,
            profile,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{generate_ca, generate_key_pair, Certificate, Curve};
    use crate::db::setup_test_db;
    use crate::error::AppError;
    use chrono::Utc;

    async fn provisioner(cidr: &str, curve: Curve) -> Provisioner {
        let pool = setup_test_db().await;
        let allocator = AddressAllocator::new(pool, cidr).unwrap();
        allocator.initialize_network(false).await.unwrap();

        let pair = generate_ca("Test CA", curve).unwrap();
        let ca = CertificateAuthority::from_pem(&pair.cert_pem, &pair.key_pem).unwrap();
        Provisioner::new(allocator, Arc::new(ca), "203.0.113.5:4242")
    }

    fn client_request(public_key_pem: Option<String>) -> ProvisionRequest {
        ProvisionRequest {
            spec: NodeSpec::client("laptop"),
            public_key_pem,
            use_lighthouse: true,
        }
    }

    #[tokio::test]
    async fn test_provision_client_generates_key() {
        let provisioner = provisioner("10.0.0.0/8", Curve::Curve25519).await;
        let node = provisioner.provision(client_request(None)).await.unwrap();

        assert_eq!(node.address, "10.0.0.1/8");
        assert!(node.profile.pki.key.contains("NEBULA X25519 PRIVATE KEY"));
        assert_eq!(node.profile.lighthouse.hosts, vec!["10.0.0.1"]);
        assert_eq!(
            node.profile.static_host_map.get("10.0.0.1"),
            Some(&vec!["203.0.113.5:4242".to_string()])
        );

        let cert = Certificate::from_pem(&node.certificate_pem).unwrap();
        assert_eq!(cert.details().groups, vec!["client"]);
        assert!(cert.verify(provisioner.ca().certificate(), Utc::now()).is_ok());
    }

    #[tokio::test]
    async fn test_provision_with_supplied_key() {
        let provisioner = provisioner("10.0.0.0/8", Curve::Curve25519).await;
        let keys = generate_key_pair(Curve::Curve25519).unwrap();

        let node = provisioner
            .provision(client_request(Some(keys.public_key_pem.clone())))
            .await
            .unwrap();

        assert!(node.profile.pki.key.is_empty());
        let cert = Certificate::from_pem(&node.certificate_pem).unwrap();
        let (_, public_key) = crate::ca::parse_public_key_pem(&keys.public_key_pem).unwrap();
        assert_eq!(cert.details().public_key, public_key);
    }

    #[tokio::test]
    async fn test_signing_failure_strands_address() {
        let provisioner = provisioner("10.0.0.0/8", Curve::Curve25519).await;
        let wrong_curve = generate_key_pair(Curve::P256).unwrap();

        let result = provisioner
            .provision(client_request(Some(wrong_curve.public_key_pem)))
            .await;
        assert!(matches!(result, Err(AppError::IncompatibleKey { .. })));

        let node = provisioner.provision(client_request(None)).await.unwrap();
        assert_eq!(node.address, "10.0.0.2/8");
    }

    #[tokio::test]
    async fn test_exhaustion_propagates() {
        let provisioner = provisioner("10.0.0.0/30", Curve::P256).await;
        provisioner.provision(client_request(None)).await.unwrap();
        provisioner.provision(client_request(None)).await.unwrap();

        assert!(matches!(
            provisioner.provision(client_request(None)).await,
            Err(AppError::Exhausted { .. })
        ));
    }
}
