//! Certificate authority for the overlay network.
//!
//! The CA is a pure computation over its key material and the system clock,
//! so a single [`CertificateAuthority`] is shared freely across handlers.

mod cert;
mod keys;

pub use cert::{Certificate, CertificateDetails, CERTIFICATE_BANNER};
pub use keys::{
    parse_public_key_pem, public_key_to_pem, verify_signature, Curve, NodeKeyPair,
    SigningKeyMaterial,
};

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use ipnet::IpNet;
use tracing::debug;
use zeroize::Zeroizing;

/// Lifetime of a freshly generated root, in days.
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Default upper bound for leaf lifetimes, in days.
pub const DEFAULT_LEAF_VALIDITY_DAYS: i64 = 365;

/// Gap kept between a leaf's expiry and its issuer's, in seconds.
const SAFETY_MARGIN_SECS: i64 = 1;

/// PEM encoded certificate and the private key that goes with it.
pub struct CertificatePair {
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
}

/// PEM encoded node key pair.
pub struct KeyPairPem {
    pub public_key_pem: String,
    pub private_key_pem: Zeroizing<String>,
}

/// Generate a self-signed root valid for ten years.
pub fn generate_ca(name: &str, curve: Curve) -> AppResult<CertificatePair> {
    let now = Utc::now().trunc_subsecs(0);
    generate_ca_with_window(name, curve, now, now + Duration::days(CA_VALIDITY_DAYS))
}

pub(crate) fn generate_ca_with_window(
    name: &str,
    curve: Curve,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> AppResult<CertificatePair> {
    let key = SigningKeyMaterial::generate(curve)?;
    let details = CertificateDetails {
        name: name.to_string(),
        networks: Vec::new(),
        groups: Vec::new(),
        not_before,
        not_after,
        public_key: key.public_key(),
        is_ca: true,
        issuer: None,
        curve,
    };
    let certificate = details.sign(&key)?;

    Ok(CertificatePair {
        cert_pem: certificate.to_pem()?,
        key_pem: key.to_pem(),
    })
}

/// Generate a node key-agreement pair on `curve`.
pub fn generate_key_pair(curve: Curve) -> AppResult<KeyPairPem> {
    let pair = NodeKeyPair::generate(curve)?;
    Ok(KeyPairPem {
        public_key_pem: pair.public_key_pem(),
        private_key_pem: pair.private_key_pem(),
    })
}

/// Parse a comma separated list of CIDRs. Host bits are kept since they
/// carry the node address.
pub fn parse_networks(input: &str) -> AppResult<Vec<IpNet>> {
    let networks = input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNet>()
                .map_err(|e| AppError::validation(format!("invalid ip definition {s}: {e}")))
        })
        .collect::<AppResult<Vec<_>>>()?;

    if networks.is_empty() {
        return Err(AppError::validation("at least one network is required"));
    }
    Ok(networks)
}

/// Parse a comma separated group list, trimming entries and dropping
/// duplicates while keeping the first occurrence order.
pub fn parse_groups(input: &str) -> AppResult<Vec<String>> {
    let mut groups: Vec<String> = Vec::new();
    if input.trim().is_empty() {
        return Ok(groups);
    }
    for group in input.split(',').map(str::trim) {
        if group.is_empty() {
            return Err(AppError::validation(format!("empty group in {input:?}")));
        }
        if !groups.iter().any(|g| g == group) {
            groups.push(group.to_string());
        }
    }
    Ok(groups)
}

/// Loaded root certificate plus the key that matches it.
pub struct CertificateAuthority {
    certificate: Certificate,
    key: SigningKeyMaterial,
    leaf_validity: Duration,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("name", &self.certificate.name())
            .field("curve", &self.certificate.curve())
            .field("not_after", &self.certificate.not_after())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load a CA from PEM. The key must be the one embedded in the cert.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> AppResult<Self> {
        let certificate = Certificate::from_pem(cert_pem)?;
        let key = SigningKeyMaterial::from_pem(key_pem)?;

        if !certificate.is_ca() {
            return Err(AppError::integrity("certificate is not a CA"));
        }
        if certificate.curve() != key.curve() {
            return Err(AppError::integrity(format!(
                "curve in CA certificate and private key mismatch: {} vs {}",
                certificate.curve(),
                key.curve()
            )));
        }
        if certificate.details().public_key != key.public_key() {
            return Err(AppError::integrity(
                "root certificate does not match private key",
            ));
        }
        certificate.check_signature(&certificate.details().public_key)?;

        Ok(Self {
            certificate,
            key,
            leaf_validity: Duration::days(DEFAULT_LEAF_VALIDITY_DAYS),
        })
    }

    pub fn with_leaf_validity(mut self, leaf_validity: Duration) -> Self {
        self.leaf_validity = leaf_validity;
        self
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn curve(&self) -> Curve {
        self.certificate.curve()
    }

    pub fn cert_pem(&self) -> AppResult<String> {
        self.certificate.to_pem()
    }

    /// Sign a leaf for `node_public_key_pem`.
    ///
    /// `networks` is a comma separated CIDR list, `groups` a comma separated
    /// group list. The leaf expires one second before the CA at the latest.
    pub fn sign(
        &self,
        name: &str,
        networks: &str,
        groups: &str,
        node_public_key_pem: &str,
    ) -> AppResult<Certificate> {
        let now = Utc::now().trunc_subsecs(0);

        if self.certificate.expired(now) {
            return Err(AppError::CaExpired);
        }
        let remaining = self.certificate.not_after() - now - Duration::seconds(SAFETY_MARGIN_SECS);
        if remaining <= Duration::zero() {
            return Err(AppError::CaExpired);
        }

        let (curve, public_key) = parse_public_key_pem(node_public_key_pem)?;
        if curve != self.curve() {
            return Err(AppError::IncompatibleKey {
                expected: self.curve(),
                actual: curve,
            });
        }

        let networks = parse_networks(networks)?;
        let groups = parse_groups(groups)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::validation("certificate name must not be empty"));
        }

        let details = CertificateDetails {
            name: name.to_string(),
            networks,
            groups,
            not_before: now,
            not_after: now + self.leaf_validity.min(remaining),
            public_key,
            is_ca: false,
            issuer: Some(self.certificate.fingerprint()?),
            curve,
        };
        let leaf = details.sign(&self.key)?;
        debug!(name = %leaf.name(), not_after = %leaf.not_after(), "Signed leaf certificate");

        Ok(leaf)
    }
}

/// Sign a leaf straight from PEM material and return the leaf PEM.
pub fn sign_cert(
    ca_cert_pem: &str,
    ca_key_pem: &str,
    name: &str,
    networks: &str,
    groups: &str,
    node_public_key_pem: &str,
) -> AppResult<String> {
    CertificateAuthority::from_pem(ca_cert_pem, ca_key_pem)?
        .sign(name, networks, groups, node_public_key_pem)?
        .to_pem()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca(curve: Curve) -> (CertificatePair, CertificateAuthority) {
        let pair = generate_ca("Test CA", curve).unwrap();
        let ca = CertificateAuthority::from_pem(&pair.cert_pem, &pair.key_pem).unwrap();
        (pair, ca)
    }

    #[test]
    fn test_generate_ca_self_verifies() {
        let (pair, ca) = test_ca(Curve::Curve25519);
        let cert = Certificate::from_pem(&pair.cert_pem).unwrap();

        assert!(cert.is_ca());
        assert!(cert.details().networks.is_empty());
        assert!(cert.details().groups.is_empty());
        assert!(cert.details().issuer.is_none());
        assert!(cert.check_signature(&cert.details().public_key).is_ok());
        assert_eq!(
            cert.not_after() - cert.not_before(),
            Duration::days(CA_VALIDITY_DAYS)
        );
        assert_eq!(ca.certificate(), &cert);
    }

    #[test]
    fn test_ca_pem_round_trip() {
        let (pair, _) = test_ca(Curve::Curve25519);
        let cert = Certificate::from_pem(&pair.cert_pem).unwrap();
        let key = SigningKeyMaterial::from_pem(&pair.key_pem).unwrap();

        assert_eq!(cert.to_pem().unwrap(), pair.cert_pem);
        assert_eq!(key.to_pem().as_str(), pair.key_pem.as_str());
        assert_eq!(key.public_key(), cert.details().public_key);
    }

    #[test]
    fn test_sign_leaf_binds_request() {
        let (_, ca) = test_ca(Curve::Curve25519);
        let node = generate_key_pair(Curve::Curve25519).unwrap();

        let leaf = ca
            .sign("laptop", "10.0.0.7/8", " client , ops,client", &node.public_key_pem)
            .unwrap();

        assert_eq!(leaf.name(), "laptop");
        assert!(!leaf.is_ca());
        assert_eq!(leaf.details().networks[0].to_string(), "10.0.0.7/8");
        assert_eq!(leaf.details().groups, vec!["client", "ops"]);
        assert!(leaf.not_after() < ca.certificate().not_after());
        assert_eq!(
            leaf.not_after() - leaf.not_before(),
            Duration::days(DEFAULT_LEAF_VALIDITY_DAYS)
        );
        assert!(leaf.verify(ca.certificate(), Utc::now()).is_ok());
    }

    #[test]
    fn test_leaf_capped_by_ca_expiry() {
        let now = Utc::now().trunc_subsecs(0);
        let pair = generate_ca_with_window(
            "Short CA",
            Curve::Curve25519,
            now - Duration::days(1),
            now + Duration::hours(2),
        )
        .unwrap();
        let ca = CertificateAuthority::from_pem(&pair.cert_pem, &pair.key_pem).unwrap();
        let node = generate_key_pair(Curve::Curve25519).unwrap();

        let leaf = ca.sign("node", "10.0.0.2/8", "", &node.public_key_pem).unwrap();
        assert!(leaf.not_after() < ca.certificate().not_after());
        assert!(leaf.not_after() - leaf.not_before() <= Duration::hours(2));
    }

    #[test]
    fn test_expired_ca_rejected() {
        let now = Utc::now().trunc_subsecs(0);
        let pair = generate_ca_with_window(
            "Old CA",
            Curve::Curve25519,
            now - Duration::days(20),
            now - Duration::days(10),
        )
        .unwrap();
        let ca = CertificateAuthority::from_pem(&pair.cert_pem, &pair.key_pem).unwrap();
        let node = generate_key_pair(Curve::Curve25519).unwrap();

        let result = ca.sign("node", "10.0.0.2/8", "client", &node.public_key_pem);
        assert!(matches!(result, Err(AppError::CaExpired)));
    }

    #[test]
    fn test_curve_mismatch_rejected() {
        let (_, ca) = test_ca(Curve::Curve25519);
        let node = generate_key_pair(Curve::P256).unwrap();

        let result = ca.sign("node", "10.0.0.2/8", "client", &node.public_key_pem);
        assert!(matches!(
            result,
            Err(AppError::IncompatibleKey {
                expected: Curve::Curve25519,
                actual: Curve::P256
            })
        ));
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let (pair, _) = test_ca(Curve::Curve25519);
        let (other, _) = test_ca(Curve::Curve25519);

        let result = CertificateAuthority::from_pem(&pair.cert_pem, &other.key_pem);
        assert!(matches!(result, Err(AppError::Integrity(_))));

        let (p256, _) = test_ca(Curve::P256);
        let result = CertificateAuthority::from_pem(&pair.cert_pem, &p256.key_pem);
        assert!(matches!(result, Err(AppError::Integrity(_))));
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let (_, ca) = test_ca(Curve::Curve25519);
        let node = generate_key_pair(Curve::Curve25519).unwrap();

        for networks in ["10.0.0.300/8", "not-a-cidr", "", "10.0.0.1"] {
            let result = ca.sign("node", networks, "client", &node.public_key_pem);
            assert!(
                matches!(result, Err(AppError::Validation(_))),
                "{networks} should be rejected"
            );
        }
    }

    #[test]
    fn test_p256_signing() {
        let (pair, ca) = test_ca(Curve::P256);
        let node = generate_key_pair(Curve::P256).unwrap();

        let leaf_pem = sign_cert(
            &pair.cert_pem,
            &pair.key_pem,
            "p256-node",
            "192.168.1.4/24,fd00::4/64",
            "client",
            &node.public_key_pem,
        )
        .unwrap();
        let leaf = Certificate::from_pem(&leaf_pem).unwrap();

        assert_eq!(leaf.curve(), Curve::P256);
        assert_eq!(leaf.details().networks.len(), 2);
        assert!(leaf.verify(ca.certificate(), Utc::now()).is_ok());
    }

    #[test]
    fn test_parse_groups() {
        assert!(parse_groups("").unwrap().is_empty());
        assert_eq!(parse_groups("a, b ,a").unwrap(), vec!["a", "b"]);
        assert!(matches!(parse_groups("a,,b"), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_leaf_from_other_ca_fails_verification() {
        let (_, ca) = test_ca(Curve::Curve25519);
        let (_, other) = test_ca(Curve::Curve25519);
        let node = generate_key_pair(Curve::Curve25519).unwrap();

        let leaf = ca.sign("node", "10.0.0.2/8", "", &node.public_key_pem).unwrap();
        assert!(matches!(
            leaf.verify(other.certificate(), Utc::now()),
            Err(AppError::Integrity(_))
        ));
    }
}
