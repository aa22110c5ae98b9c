//! Sequential address allocation over the durable `ip_state` row.

use crate::db::{DbPool, IpStateRepo};
use crate::error::{AppError, AppResult};
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, info, warn};

/// Hands out node addresses from one network range.
///
/// The counter lives only in the store; every call round-trips it inside a
/// transaction, so any number of handlers or processes can share a pool.
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    pool: DbPool,
    network: IpNet,
}

impl AddressAllocator {
    pub fn new(pool: DbPool, cidr: &str) -> AppResult<Self> {
        let network = cidr
            .trim()
            .parse::<IpNet>()
            .map_err(|e| AppError::validation(format!("invalid CIDR format {cidr}: {e}")))?;
        Ok(Self { pool, network })
    }

    /// Configured range with host bits cleared
    pub fn network(&self) -> IpNet {
        self.network.trunc()
    }

    /// Reset the pool to `{cidr, network + 1}`.
    ///
    /// An existing pool is only replaced when `force` is set; otherwise this
    /// fails with [`AppError::AlreadyInitialized`] and leaves it untouched.
    pub async fn initialize_network(&self, force: bool) -> AppResult<()> {
        let network = self.network();
        let first_usable = increment(network.network());

        let mut tx = self.pool.begin().await?;
        if IpStateRepo::lock(&mut tx).await? {
            let existing = IpStateRepo::get(&mut tx)
                .await?
                .map(|state| state.network_cidr)
                .unwrap_or_default();
            if !force {
                return Err(AppError::AlreadyInitialized { cidr: existing });
            }
            warn!(
                "Re-initializing address pool {} as {}, allocation history is discarded",
                existing, network
            );
        }

        IpStateRepo::replace(&mut tx, &network.to_string(), &first_usable.to_string()).await?;
        tx.commit().await?;

        info!("Address pool initialized: {} (first usable {})", network, first_usable);
        Ok(())
    }

    /// Return the next free address and advance the counter.
    pub async fn next_ip(&self) -> AppResult<IpAddr> {
        let mut tx = self.pool.begin().await?;

        if !IpStateRepo::lock(&mut tx).await? {
            return Err(AppError::NotInitialized);
        }
        let state = IpStateRepo::get(&mut tx)
            .await?
            .ok_or(AppError::NotInitialized)?;

        let network = self.ensure_matches(&state.network_cidr)?;
        let current = state.next_available_ip.parse::<IpAddr>().map_err(|e| {
            AppError::integrity(format!(
                "invalid stored next address ({}): {e}",
                state.next_available_ip
            ))
        })?;

        // Dropping the transaction here rolls it back, so the counter stays put.
        if !network.contains(&current) || is_broadcast(&network, current) {
            return Err(AppError::Exhausted {
                next: state.next_available_ip,
                cidr: state.network_cidr,
            });
        }

        IpStateRepo::set_next(&mut tx, &increment(current).to_string()).await?;
        tx.commit().await?;

        debug!("Allocated address {}", current);
        Ok(current)
    }

    /// Check that an existing pool was initialized for the configured range.
    /// An uninitialized store passes.
    pub async fn verify_network(&self) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        if let Some(state) = IpStateRepo::get(&mut conn).await? {
            self.ensure_matches(&state.network_cidr)?;
        }
        Ok(())
    }

    fn ensure_matches(&self, stored_cidr: &str) -> AppResult<IpNet> {
        let stored = stored_cidr.parse::<IpNet>().map_err(|e| {
            AppError::integrity(format!("invalid stored CIDR ({stored_cidr}): {e}"))
        })?;
        if stored != self.network() {
            return Err(AppError::NetworkMismatch {
                stored: stored.to_string(),
                configured: self.network().to_string(),
            });
        }
        Ok(stored)
    }

    /// Address reserved for the server node: network + 1. Pure, works before
    /// the pool is initialized.
    pub fn server_addr(&self) -> IpAddr {
        increment(self.network().network())
    }

    /// Format `address` with the pool's prefix length
    pub fn join_address_and_prefix(&self, address: IpAddr) -> String {
        format!("{}/{}", address, self.network.prefix_len())
    }
}

/// Add one to `address`, carrying from the least significant byte.
pub fn increment(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            increment_octets(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            increment_octets(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

fn increment_octets(octets: &mut [u8]) {
    for octet in octets.iter_mut().rev() {
        *octet = octet.wrapping_add(1);
        if *octet != 0 {
            break;
        }
    }
}

/// IPv4 only; IPv6 has no broadcast address.
pub fn is_broadcast(network: &IpNet, address: IpAddr) -> bool {
    match (network, address) {
        (IpNet::V4(net), IpAddr::V4(addr)) => addr == net.broadcast(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_test_db;
    use std::collections::HashSet;

    async fn allocator(cidr: &str) -> AddressAllocator {
        let pool = setup_test_db().await;
        let allocator = AddressAllocator::new(pool, cidr).unwrap();
        allocator.initialize_network(false).await.unwrap();
        allocator
    }

    #[test]
    fn test_increment_carries() {
        let cases = [
            ("10.0.0.1", "10.0.0.2"),
            ("10.0.0.255", "10.0.1.0"),
            ("10.255.255.255", "11.0.0.0"),
            ("fd00::ffff", "fd00::1:0"),
            ("255.255.255.255", "0.0.0.0"),
        ];
        for (input, expected) in cases {
            let next = increment(input.parse().unwrap());
            assert_eq!(next, expected.parse::<IpAddr>().unwrap(), "{input}");
        }
    }

    #[test]
    fn test_broadcast_only_for_v4() {
        let v4: IpNet = "10.0.0.0/30".parse().unwrap();
        assert!(is_broadcast(&v4, "10.0.0.3".parse().unwrap()));
        assert!(!is_broadcast(&v4, "10.0.0.2".parse().unwrap()));

        let v6: IpNet = "fd00::/126".parse().unwrap();
        assert!(!is_broadcast(&v6, "fd00::3".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_sequential_allocation() {
        let allocator = allocator("10.0.0.0/8").await;
        for expected in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            let ip = allocator.next_ip().await.unwrap();
            assert_eq!(ip, expected.parse::<IpAddr>().unwrap());
        }
    }

    #[tokio::test]
    async fn test_small_network_exhausts() {
        let allocator = allocator("10.0.0.0/30").await;

        assert_eq!(allocator.next_ip().await.unwrap().to_string(), "10.0.0.1");
        assert_eq!(allocator.next_ip().await.unwrap().to_string(), "10.0.0.2");

        for _ in 0..2 {
            match allocator.next_ip().await {
                Err(AppError::Exhausted { next, cidr }) => {
                    assert_eq!(next, "10.0.0.3");
                    assert_eq!(cidr, "10.0.0.0/30");
                }
                other => panic!("expected exhaustion, got {other:?}"),
            }
        }

        let mut conn = allocator.pool.acquire().await.unwrap();
        let state = IpStateRepo::get(&mut conn).await.unwrap().unwrap();
        assert_eq!(state.next_available_ip, "10.0.0.3");
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let pool = setup_test_db().await;
        let allocator = AddressAllocator::new(pool, "10.0.0.0/8").unwrap();
        assert!(matches!(
            allocator.next_ip().await,
            Err(AppError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_reinit_requires_force() {
        let allocator = allocator("10.0.0.0/24").await;
        allocator.next_ip().await.unwrap();
        allocator.next_ip().await.unwrap();

        match allocator.initialize_network(false).await {
            Err(AppError::AlreadyInitialized { cidr }) => assert_eq!(cidr, "10.0.0.0/24"),
            other => panic!("expected AlreadyInitialized, got {other:?}"),
        }
        assert_eq!(allocator.next_ip().await.unwrap().to_string(), "10.0.0.3");

        allocator.initialize_network(true).await.unwrap();
        assert_eq!(allocator.next_ip().await.unwrap().to_string(), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct() {
        let allocator = allocator("10.0.0.0/8").await;

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let allocator = allocator.clone();
                tokio::spawn(async move { allocator.next_ip().await })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let ip = handle.await.unwrap().unwrap();
            assert!(seen.insert(ip), "address {ip} handed out twice");
        }

        let expected: HashSet<IpAddr> = (1..=50u8)
            .map(|n| IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)))
            .collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_server_addr_is_pure() {
        let pool = setup_test_db().await;
        let allocator = AddressAllocator::new(pool, "10.0.0.0/8").unwrap();

        assert_eq!(allocator.server_addr().to_string(), "10.0.0.1");
        assert_eq!(allocator.server_addr(), allocator.server_addr());
        assert!(matches!(
            allocator.next_ip().await,
            Err(AppError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_join_address_and_prefix() {
        let pool = setup_test_db().await;
        let allocator = AddressAllocator::new(pool, "192.168.100.0/24").unwrap();
        let joined = allocator.join_address_and_prefix("192.168.100.7".parse().unwrap());
        assert_eq!(joined, "192.168.100.7/24");
    }

    #[tokio::test]
    async fn test_changed_network_is_rejected() {
        let first = allocator("10.0.0.0/24").await;
        let moved = AddressAllocator::new(first.pool.clone(), "192.168.0.0/16").unwrap();

        match moved.next_ip().await {
            Err(AppError::NetworkMismatch { stored, configured }) => {
                assert_eq!(stored, "10.0.0.0/24");
                assert_eq!(configured, "192.168.0.0/16");
            }
            other => panic!("expected NetworkMismatch, got {other:?}"),
        }
        assert!(matches!(
            moved.verify_network().await,
            Err(AppError::NetworkMismatch { .. })
        ));

        // The original range is untouched.
        first.verify_network().await.unwrap();
        assert_eq!(first.next_ip().await.unwrap().to_string(), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_corrupt_next_address_is_integrity_error() {
        let allocator = allocator("10.0.0.0/24").await;
        let mut conn = allocator.pool.acquire().await.unwrap();
        IpStateRepo::set_next(&mut conn, "not-an-ip").await.unwrap();
        drop(conn);

        assert!(matches!(
            allocator.next_ip().await,
            Err(AppError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_ipv6_allocation() {
        let allocator = allocator("fd00::/120").await;
        assert_eq!(allocator.next_ip().await.unwrap().to_string(), "fd00::1");
        assert_eq!(allocator.next_ip().await.unwrap().to_string(), "fd00::2");
    }

    #[tokio::test]
    async fn test_invalid_cidr() {
        let pool = setup_test_db().await;
        assert!(matches!(
            AddressAllocator::new(pool, "10.0.0.0/33"),
            Err(AppError::Validation(_))
        ));
    }
}
