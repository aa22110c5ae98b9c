//! Protobuf wire types for overlay node certificates.
//!
//! The layout follows the v1 overlay certificate format: a details message
//! that is signed as encoded, wrapped together with its signature. IPv4
//! networks travel as `(address, mask)` pairs in `ips`; IPv6 networks use the
//! `networks_v6` extension field as 17-byte `address || prefix_len` entries.

#![allow(clippy::derive_partial_eq_without_eq)]

pub use prost::Message;

pub mod cert {
    /// Signature curve of a certificate and its keys.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Curve {
        Curve25519 = 0,
        P256 = 1,
    }

    /// Signed certificate envelope.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RawCertificate {
        #[prost(message, optional, tag = "1")]
        pub details: ::core::option::Option<RawCertificateDetails>,
        #[prost(bytes = "vec", tag = "2")]
        pub signature: ::prost::alloc::vec::Vec<u8>,
    }

    /// The signed portion of a certificate.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RawCertificateDetails {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        /// Pairs of big-endian IPv4 address and mask.
        #[prost(uint32, repeated, tag = "2")]
        pub ips: ::prost::alloc::vec::Vec<u32>,
        #[prost(uint32, repeated, tag = "3")]
        pub subnets: ::prost::alloc::vec::Vec<u32>,
        #[prost(string, repeated, tag = "4")]
        pub groups: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
        /// Unix seconds.
        #[prost(int64, tag = "5")]
        pub not_before: i64,
        /// Unix seconds.
        #[prost(int64, tag = "6")]
        pub not_after: i64,
        #[prost(bytes = "vec", tag = "7")]
        pub public_key: ::prost::alloc::vec::Vec<u8>,
        #[prost(bool, tag = "8")]
        pub is_ca: bool,
        /// SHA-256 fingerprint of the issuing certificate, empty for roots.
        #[prost(bytes = "vec", tag = "9")]
        pub issuer: ::prost::alloc::vec::Vec<u8>,
        #[prost(bytes = "vec", repeated, tag = "10")]
        pub networks_v6: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
        #[prost(enumeration = "Curve", tag = "100")]
        pub curve: i32,
    }
}
