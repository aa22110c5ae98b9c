//! First-boot setup: CA material, the address pool and the server profile.

use crate::api::ApiState;
use crate::ca::{generate_ca, CertificateAuthority};
use crate::config::{AppConfig, PkiConfig};
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::ipam::AddressAllocator;
use crate::profile::{ConnectionProfile, NodeSpec};
use crate::provision::{ProvisionRequest, Provisioner};
use crate::tokens::TokenLedger;
use chrono::Duration;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Load the CA from disk, generating it when neither file exists.
pub async fn load_or_create_ca(pki: &PkiConfig) -> AppResult<CertificateAuthority> {
    let key_path = Path::new(&pki.ca_key_path);
    let cert_path = Path::new(&pki.ca_cert_path);
    let key_exists = tokio::fs::try_exists(key_path).await?;
    let cert_exists = tokio::fs::try_exists(cert_path).await?;

    match (key_exists, cert_exists) {
        (true, true) => {}
        (false, false) => {
            info!(
                "Generating new {} CA at {} and {}",
                pki.curve, pki.ca_key_path, pki.ca_cert_path
            );
            let pair = generate_ca(&pki.ca_name, pki.curve)?;
            write_file(key_path, pair.key_pem.as_bytes(), 0o600).await?;
            write_file(cert_path, pair.cert_pem.as_bytes(), 0o644).await?;
        }
        _ => {
            return Err(AppError::validation(format!(
                "only one of {} and {} exists; refusing to overwrite CA material",
                pki.ca_key_path, pki.ca_cert_path
            )));
        }
    }

    let key_pem = zeroize::Zeroizing::new(tokio::fs::read_to_string(key_path).await?);
    let cert_pem = tokio::fs::read_to_string(cert_path).await?;
    let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem)?
        .with_leaf_validity(pki.leaf_validity());

    if ca.curve() != pki.curve {
        warn!(
            "Configured curve {} differs from CA curve {}; using the CA curve",
            pki.curve,
            ca.curve()
        );
    }
    info!(
        "CA loaded: {} ({}), valid until {}",
        ca.certificate().name(),
        ca.curve(),
        ca.certificate().not_after()
    );
    Ok(ca)
}

async fn write_file(path: &Path, contents: &[u8], mode: u32) -> AppResult<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.flush().await?;

    // The open mode only applies on create; an existing file keeps its own.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    Ok(())
}

/// Load the server profile, or initialize the pool and provision the
/// server node when the profile file is missing.
pub async fn ensure_server_profile(
    config: &AppConfig,
    provisioner: &Provisioner,
) -> AppResult<ConnectionProfile> {
    let path = Path::new(&config.server.profile_path);
    if tokio::fs::try_exists(path).await? {
        provisioner.allocator().verify_network().await?;
        let yaml = tokio::fs::read_to_string(path).await?;
        info!("Loaded server profile from {}", config.server.profile_path);
        return ConnectionProfile::from_yaml(&yaml);
    }

    info!(
        "Generating server profile with network {} at {}",
        config.network.cidr, config.server.profile_path
    );
    provisioner
        .allocator()
        .initialize_network(config.network.force_reinit)
        .await?;

    let node = provisioner
        .provision(ProvisionRequest {
            spec: NodeSpec::server(&config.network.tun_dev_name),
            public_key_pem: None,
            use_lighthouse: false,
        })
        .await?;

    let mut profile = node.profile;
    profile.apply_listen(&config.network.listen_addr)?;
    write_file(path, profile.to_yaml()?.as_bytes(), 0o600).await?;

    info!("Server node provisioned at {}", node.address);
    Ok(profile)
}

/// Build the API state from configuration. Runs CA and profile setup.
pub async fn bootstrap(config: &AppConfig, pool: DbPool) -> AppResult<ApiState> {
    let ca = load_or_create_ca(&config.pki).await?;
    let allocator = AddressAllocator::new(pool.clone(), &config.network.cidr)?;
    let provisioner = Provisioner::new(allocator, Arc::new(ca), &config.network.public_addr);

    ensure_server_profile(config, &provisioner).await?;

    let ttl_hours = i64::try_from(config.auth.token_ttl_hours)
        .map_err(|_| AppError::validation("auth.token_ttl_hours is too large"))?;
    let tokens = TokenLedger::new(pool).with_ttl(Duration::hours(ttl_hours));
    let purged = tokens.purge_expired().await?;
    if purged > 0 {
        info!("Purged {} expired one-time tokens", purged);
    }

    Ok(ApiState::new(provisioner, tokens, config.auth.clone()))
}
