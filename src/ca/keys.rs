//! Key material for the certificate authority and for nodes.
//!
//! Uses:
//! - Ed25519 for CA signatures on Curve25519 networks
//! - X25519 for node key agreement on Curve25519 networks
//! - ECDSA P-256 (SHA-256, ASN.1 signatures) and P-256 ECDH on P256 networks
//!
//! Private keys are stored as raw scalars under the engine's banners.

use crate::error::{AppError, AppResult};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tunnelgate_types::cert as wire;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const ED25519_PRIVATE_KEY_BANNER: &str = "NEBULA ED25519 PRIVATE KEY";
pub const ECDSA_P256_PRIVATE_KEY_BANNER: &str = "NEBULA ECDSA P256 PRIVATE KEY";
pub const X25519_PRIVATE_KEY_BANNER: &str = "NEBULA X25519 PRIVATE KEY";
pub const X25519_PUBLIC_KEY_BANNER: &str = "NEBULA X25519 PUBLIC KEY";
pub const P256_PRIVATE_KEY_BANNER: &str = "NEBULA P256 PRIVATE KEY";
pub const P256_PUBLIC_KEY_BANNER: &str = "NEBULA P256 PUBLIC KEY";

const ED25519_KEYPAIR_LEN: usize = 64;
const X25519_KEY_LEN: usize = 32;
const P256_PRIVATE_KEY_LEN: usize = 32;
const P256_PUBLIC_KEY_LEN: usize = 65;

/// Curve shared by a CA and every key it certifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Curve {
    #[default]
    Curve25519,
    P256,
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Curve25519 => write!(f, "CURVE25519"),
            Self::P256 => write!(f, "P256"),
        }
    }
}

impl FromStr for Curve {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "curve25519" | "25519" | "ed25519" | "x25519" => Ok(Self::Curve25519),
            "p256" | "p-256" => Ok(Self::P256),
            other => Err(AppError::validation(format!("invalid curve: {other}"))),
        }
    }
}

impl From<Curve> for wire::Curve {
    fn from(curve: Curve) -> Self {
        match curve {
            Curve::Curve25519 => wire::Curve::Curve25519,
            Curve::P256 => wire::Curve::P256,
        }
    }
}

impl TryFrom<i32> for Curve {
    type Error = AppError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match wire::Curve::try_from(value) {
            Ok(wire::Curve::Curve25519) => Ok(Self::Curve25519),
            Ok(wire::Curve::P256) => Ok(Self::P256),
            Err(_) => Err(AppError::validation(format!("unknown curve tag {value}"))),
        }
    }
}

/// Private half of a CA signing key.
pub enum SigningKeyMaterial {
    Ed25519(SigningKey),
    P256(p256::SecretKey),
}

impl SigningKeyMaterial {
    /// Generate a fresh signing key on `curve`.
    pub fn generate(curve: Curve) -> AppResult<Self> {
        match curve {
            Curve::Curve25519 => Ok(Self::Ed25519(SigningKey::generate(&mut OsRng))),
            Curve::P256 => Ok(Self::P256(p256::SecretKey::random(&mut OsRng))),
        }
    }

    pub fn curve(&self) -> Curve {
        match self {
            Self::Ed25519(_) => Curve::Curve25519,
            Self::P256(_) => Curve::P256,
        }
    }

    /// Public key bytes as embedded in certificates.
    pub fn public_key(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(key) => key.verifying_key().to_bytes().to_vec(),
            Self::P256(secret) => p256_public_key(secret),
        }
    }

    pub fn sign(&self, message: &[u8]) -> AppResult<Vec<u8>> {
        match self {
            Self::Ed25519(key) => Ok(key.sign(message).to_bytes().to_vec()),
            Self::P256(secret) => {
                let signature: p256::ecdsa::Signature =
                    p256::ecdsa::SigningKey::from(secret).try_sign(message).map_err(|e| {
                        AppError::internal(format!("ecdsa signing failed: {e}"))
                    })?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
        }
    }

    pub fn to_pem(&self) -> Zeroizing<String> {
        match self {
            Self::Ed25519(key) => {
                let bytes = Zeroizing::new(key.to_keypair_bytes());
                encode_pem(ED25519_PRIVATE_KEY_BANNER, bytes.to_vec())
            }
            Self::P256(secret) => {
                encode_pem(ECDSA_P256_PRIVATE_KEY_BANNER, secret.to_bytes().to_vec())
            }
        }
    }

    pub fn from_pem(input: &str) -> AppResult<Self> {
        let block = parse_pem(input)?;
        match block.tag() {
            ED25519_PRIVATE_KEY_BANNER => {
                let bytes: Zeroizing<[u8; ED25519_KEYPAIR_LEN]> = Zeroizing::new(
                    block.contents().try_into().map_err(|_| {
                        AppError::validation("ed25519 private key must be 64 bytes")
                    })?,
                );
                // Rejects keypair bytes whose public half does not match the seed.
                let key = SigningKey::from_keypair_bytes(&bytes)
                    .map_err(|e| AppError::integrity(format!("invalid ed25519 keypair: {e}")))?;
                Ok(Self::Ed25519(key))
            }
            ECDSA_P256_PRIVATE_KEY_BANNER => {
                Ok(Self::P256(p256_secret_from_bytes(block.contents())?))
            }
            other => Err(AppError::validation(format!(
                "bytes did not contain a proper signing key banner: {other}"
            ))),
        }
    }
}

/// Verify `signature` over `message` made by `public_key` on `curve`.
pub fn verify_signature(
    curve: Curve,
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> AppResult<()> {
    match curve {
        Curve::Curve25519 => {
            let key_bytes: [u8; 32] = public_key
                .try_into()
                .map_err(|_| AppError::integrity("ed25519 public key must be 32 bytes"))?;
            let key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|_| AppError::integrity("invalid ed25519 public key"))?;
            let signature = Signature::from_slice(signature)
                .map_err(|_| AppError::integrity("invalid ed25519 signature"))?;
            key.verify(message, &signature)
                .map_err(|_| AppError::integrity("certificate signature did not match"))
        }
        Curve::P256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                .map_err(|_| AppError::integrity("invalid P256 public key"))?;
            let signature = p256::ecdsa::Signature::from_der(signature)
                .map_err(|_| AppError::integrity("invalid ecdsa signature"))?;
            key.verify(message, &signature)
                .map_err(|_| AppError::integrity("certificate signature did not match"))
        }
    }
}

/// Node key-agreement pair. The public half is what gets certified.
pub struct NodeKeyPair {
    curve: Curve,
    public_key: Vec<u8>,
    private_key: Zeroizing<Vec<u8>>,
}

impl NodeKeyPair {
    pub fn generate(curve: Curve) -> AppResult<Self> {
        match curve {
            Curve::Curve25519 => {
                let secret = StaticSecret::random_from_rng(OsRng);
                let public = X25519PublicKey::from(&secret);
                Ok(Self {
                    curve,
                    public_key: public.as_bytes().to_vec(),
                    private_key: Zeroizing::new(secret.to_bytes().to_vec()),
                })
            }
            Curve::P256 => Ok(Self::from_p256_secret(p256::SecretKey::random(&mut OsRng))),
        }
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    pub fn public_key_pem(&self) -> String {
        public_key_to_pem(self.curve, &self.public_key)
    }

    pub fn private_key_pem(&self) -> Zeroizing<String> {
        let banner = match self.curve {
            Curve::Curve25519 => X25519_PRIVATE_KEY_BANNER,
            Curve::P256 => P256_PRIVATE_KEY_BANNER,
        };
        encode_pem(banner, self.private_key.to_vec())
    }

    pub fn from_private_pem(input: &str) -> AppResult<Self> {
        let block = parse_pem(input)?;
        match block.tag() {
            X25519_PRIVATE_KEY_BANNER => {
                let bytes: [u8; X25519_KEY_LEN] = block
                    .contents()
                    .try_into()
                    .map_err(|_| AppError::validation("x25519 private key must be 32 bytes"))?;
                let secret = StaticSecret::from(bytes);
                let public = X25519PublicKey::from(&secret);
                Ok(Self {
                    curve: Curve::Curve25519,
                    public_key: public.as_bytes().to_vec(),
                    private_key: Zeroizing::new(secret.to_bytes().to_vec()),
                })
            }
            P256_PRIVATE_KEY_BANNER => {
                let secret = p256_secret_from_bytes(block.contents())?;
                Ok(Self::from_p256_secret(secret))
            }
            other => Err(AppError::validation(format!(
                "bytes did not contain a proper private key banner: {other}"
            ))),
        }
    }
}

impl NodeKeyPair {
    fn from_p256_secret(secret: p256::SecretKey) -> Self {
        Self {
            curve: Curve::P256,
            public_key: p256_public_key(&secret),
            private_key: Zeroizing::new(secret.to_bytes().to_vec()),
        }
    }
}

fn p256_secret_from_bytes(bytes: &[u8]) -> AppResult<p256::SecretKey> {
    if bytes.len() != P256_PRIVATE_KEY_LEN {
        return Err(AppError::validation(format!(
            "P256 private key must be {P256_PRIVATE_KEY_LEN} bytes"
        )));
    }
    p256::SecretKey::from_slice(bytes)
        .map_err(|_| AppError::validation("invalid P256 private key"))
}

/// Uncompressed SEC1 point.
fn p256_public_key(secret: &p256::SecretKey) -> Vec<u8> {
    secret.public_key().to_encoded_point(false).as_bytes().to_vec()
}

/// Encode a node public key under the banner of its curve.
pub fn public_key_to_pem(curve: Curve, public_key: &[u8]) -> String {
    let banner = match curve {
        Curve::Curve25519 => X25519_PUBLIC_KEY_BANNER,
        Curve::P256 => P256_PUBLIC_KEY_BANNER,
    };
    encode_pem(banner, public_key.to_vec()).to_string()
}

/// Parse a node public key PEM, returning its curve and raw bytes.
pub fn parse_public_key_pem(input: &str) -> AppResult<(Curve, Vec<u8>)> {
    let block = parse_pem(input)?;
    let (curve, expected_len) = match block.tag() {
        X25519_PUBLIC_KEY_BANNER => (Curve::Curve25519, X25519_KEY_LEN),
        P256_PUBLIC_KEY_BANNER => (Curve::P256, P256_PUBLIC_KEY_LEN),
        other => {
            return Err(AppError::validation(format!(
                "bytes did not contain a proper public key banner: {other}"
            )))
        }
    };
    if block.contents().len() != expected_len {
        return Err(AppError::validation(format!(
            "{curve} public key must be {expected_len} bytes"
        )));
    }
    Ok((curve, block.contents().to_vec()))
}

pub(crate) fn parse_pem(input: &str) -> AppResult<pem::Pem> {
    pem::parse(input.trim()).map_err(|e| AppError::validation(format!("invalid PEM: {e}")))
}

pub(crate) fn encode_pem(banner: &str, contents: Vec<u8>) -> Zeroizing<String> {
    let block = pem::Pem::new(banner, contents);
    Zeroizing::new(pem::encode_config(
        &block,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    ))
}
