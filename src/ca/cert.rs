use crate::ca::keys::{parse_pem, verify_signature, Curve, SigningKeyMaterial};
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, Ipv6Addr};
use tunnelgate_types::cert::{RawCertificate, RawCertificateDetails};
use tunnelgate_types::Message;

pub const CERTIFICATE_BANNER: &str = "NEBULA CERTIFICATE";

/// The signed fields of a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDetails {
    pub name: String,
    pub networks: Vec<IpNet>,
    pub groups: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub public_key: Vec<u8>,
    pub is_ca: bool,
    /// Hex fingerprint of the issuer, `None` for self-signed roots
    pub issuer: Option<String>,
    pub curve: Curve,
}

impl CertificateDetails {
    /// Sign these details with `key`, which must be on the same curve.
    pub fn sign(self, key: &SigningKeyMaterial) -> AppResult<Certificate> {
        if key.curve() != self.curve {
            return Err(AppError::integrity(format!(
                "curve in certificate and private key mismatch: {} vs {}",
                self.curve,
                key.curve()
            )));
        }
        let message = self.to_raw()?.encode_to_vec();
        let signature = key.sign(&message)?;
        Ok(Certificate {
            details: self,
            signature,
        })
    }

    fn to_raw(&self) -> AppResult<RawCertificateDetails> {
        let mut ips = Vec::new();
        let mut networks_v6 = Vec::new();
        for network in &self.networks {
            match network {
                IpNet::V4(net) => {
                    ips.push(u32::from(net.addr()));
                    ips.push(u32::from(net.netmask()));
                }
                IpNet::V6(net) => {
                    let mut entry = net.addr().octets().to_vec();
                    entry.push(net.prefix_len());
                    networks_v6.push(entry);
                }
            }
        }

        let issuer = match &self.issuer {
            Some(fingerprint) => hex::decode(fingerprint)
                .map_err(|e| AppError::validation(format!("invalid issuer fingerprint: {e}")))?,
            None => Vec::new(),
        };

        Ok(RawCertificateDetails {
            name: self.name.clone(),
            ips,
            subnets: Vec::new(),
            groups: self.groups.clone(),
            not_before: self.not_before.timestamp(),
            not_after: self.not_after.timestamp(),
            public_key: self.public_key.clone(),
            is_ca: self.is_ca,
            issuer,
            networks_v6,
            curve: tunnelgate_types::cert::Curve::from(self.curve) as i32,
        })
    }

    fn from_raw(raw: RawCertificateDetails) -> AppResult<Self> {
        if raw.ips.len() % 2 != 0 {
            return Err(AppError::validation(
                "encoded ips should be in pairs, an odd number was found",
            ));
        }

        let mut networks = Vec::with_capacity(raw.ips.len() / 2 + raw.networks_v6.len());
        for pair in raw.ips.chunks_exact(2) {
            let mask = pair[1];
            let prefix_len = mask.leading_ones();
            if mask.count_ones() != prefix_len {
                return Err(AppError::validation(format!(
                    "non-contiguous netmask {}",
                    Ipv4Addr::from(mask)
                )));
            }
            let net = Ipv4Net::new(Ipv4Addr::from(pair[0]), prefix_len as u8)
                .map_err(|e| AppError::validation(format!("invalid network: {e}")))?;
            networks.push(IpNet::V4(net));
        }
        for entry in &raw.networks_v6 {
            let (addr, prefix_len) = match entry.split_last() {
                Some((prefix_len, addr)) if addr.len() == 16 => (addr, *prefix_len),
                _ => return Err(AppError::validation("encoded ipv6 network must be 17 bytes")),
            };
            let octets: [u8; 16] = addr
                .try_into()
                .map_err(|_| AppError::validation("encoded ipv6 network must be 17 bytes"))?;
            let net = Ipv6Net::new(Ipv6Addr::from(octets), prefix_len)
                .map_err(|e| AppError::validation(format!("invalid network: {e}")))?;
            networks.push(IpNet::V6(net));
        }

        let issuer = if raw.issuer.is_empty() {
            None
        } else {
            Some(hex::encode(&raw.issuer))
        };

        Ok(Self {
            name: raw.name,
            networks,
            groups: raw.groups,
            not_before: timestamp(raw.not_before)?,
            not_after: timestamp(raw.not_after)?,
            public_key: raw.public_key,
            is_ca: raw.is_ca,
            issuer,
            curve: Curve::try_from(raw.curve)?,
        })
    }
}

fn timestamp(secs: i64) -> AppResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AppError::validation(format!("timestamp {secs} out of range")))
}

/// A signed overlay certificate, either a CA root or a node leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    details: CertificateDetails,
    signature: Vec<u8>,
}

impl Certificate {
    pub fn details(&self) -> &CertificateDetails {
        &self.details
    }

    pub fn name(&self) -> &str {
        &self.details.name
    }

    pub fn curve(&self) -> Curve {
        self.details.curve
    }

    pub fn is_ca(&self) -> bool {
        self.details.is_ca
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.details.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.details.not_after
    }

    pub fn to_bytes(&self) -> AppResult<Vec<u8>> {
        let raw = RawCertificate {
            details: Some(self.details.to_raw()?),
            signature: self.signature.clone(),
        };
        Ok(raw.encode_to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> AppResult<Self> {
        let raw = RawCertificate::decode(bytes)
            .map_err(|e| AppError::validation(format!("invalid certificate encoding: {e}")))?;
        let details = raw
            .details
            .ok_or_else(|| AppError::validation("encoded details was nil"))?;
        Ok(Self {
            details: CertificateDetails::from_raw(details)?,
            signature: raw.signature,
        })
    }

    pub fn to_pem(&self) -> AppResult<String> {
        let block = pem::Pem::new(CERTIFICATE_BANNER, self.to_bytes()?);
        Ok(pem::encode_config(
            &block,
            pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        ))
    }

    pub fn from_pem(input: &str) -> AppResult<Self> {
        let block = parse_pem(input)?;
        if block.tag() != CERTIFICATE_BANNER {
            return Err(AppError::validation(format!(
                "bytes did not contain a proper certificate banner: {}",
                block.tag()
            )));
        }
        Self::from_bytes(block.contents())
    }

    /// Hex SHA-256 of the encoded certificate.
    pub fn fingerprint(&self) -> AppResult<String> {
        Ok(hex::encode(Sha256::digest(self.to_bytes()?)))
    }

    /// True when `at` falls outside `[not_before, not_after]`.
    pub fn expired(&self, at: DateTime<Utc>) -> bool {
        at < self.details.not_before || at > self.details.not_after
    }

    /// Check the signature against `public_key` (the issuer's key).
    pub fn check_signature(&self, public_key: &[u8]) -> AppResult<()> {
        let message = self.details.to_raw()?.encode_to_vec();
        verify_signature(self.details.curve, public_key, &message, &self.signature)
    }

    /// Verify this leaf was issued by `ca` and is usable at `at`.
    pub fn verify(&self, ca: &Certificate, at: DateTime<Utc>) -> AppResult<()> {
        if !ca.is_ca() {
            return Err(AppError::integrity("issuer is not a CA certificate"));
        }
        if ca.expired(at) {
            return Err(AppError::CaExpired);
        }
        if self.expired(at) {
            return Err(AppError::integrity("certificate is outside its validity window"));
        }
        if self.details.issuer.as_deref() != Some(ca.fingerprint()?.as_str()) {
            return Err(AppError::integrity("certificate was not issued by this CA"));
        }
        if self.details.curve != ca.details.curve {
            return Err(AppError::IncompatibleKey {
                expected: ca.details.curve,
                actual: self.details.curve,
            });
        }
        if self.details.not_before < ca.details.not_before
            || self.details.not_after >= ca.details.not_after
        {
            return Err(AppError::integrity("certificate validity exceeds its issuer"));
        }
        self.check_signature(&ca.details.public_key)
    }
}
