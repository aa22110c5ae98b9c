mod client;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client::ApiClient;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tunnelgate::ca::{self, Certificate, Curve, NodeKeyPair};
use tunnelgate::profile::{ConnectionProfile, PortMapping};

#[derive(Parser)]
#[command(name = "tunnelgate-admin")]
#[command(about = "Admin and node CLI for Tunnelgate")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a self-signed CA key and certificate
    Ca {
        #[arg(long, default_value = "Tunnelgate Network CA")]
        name: String,
        #[arg(long, default_value = "curve25519")]
        curve: Curve,
        #[arg(long, default_value = "ca.key")]
        out_key: PathBuf,
        #[arg(long, default_value = "ca.crt")]
        out_crt: PathBuf,
    },
    /// Generate a node key pair
    Keygen {
        #[arg(long, default_value = "curve25519")]
        curve: Curve,
        #[arg(long, default_value = "node.key")]
        out_key: PathBuf,
        #[arg(long, default_value = "node.pub")]
        out_pub: PathBuf,
    },
    /// Sign a node certificate offline with local CA files
    Sign {
        #[arg(long, default_value = "ca.key")]
        ca_key: PathBuf,
        #[arg(long, default_value = "ca.crt")]
        ca_crt: PathBuf,
        #[arg(long)]
        name: String,
        /// Comma separated CIDRs, e.g. 10.0.0.5/8
        #[arg(long)]
        networks: String,
        #[arg(long, default_value = "")]
        groups: String,
        #[arg(long, default_value = "node.pub")]
        in_pub: PathBuf,
        #[arg(long, default_value = "node.crt")]
        out_crt: PathBuf,
    },
    /// Print details of a certificate
    Inspect {
        #[arg(default_value = "node.crt")]
        path: PathBuf,
    },
    /// Request a one-time token from the server
    Token {
        #[arg(long, env = "TUNNELGATE_API_ADDR", default_value = "http://127.0.0.1:8080")]
        server: String,
        #[arg(long, env = "TUNNELGATE_MASTER_TOKEN")]
        master_token: String,
    },
    /// Fetch a connection profile for this node and write it to disk
    Connect {
        #[arg(long, env = "TUNNELGATE_API_ADDR", default_value = "http://127.0.0.1:8080")]
        server: String,
        /// One-time or master token
        #[arg(long, env = "TUNNELGATE_TOKEN", default_value = "")]
        token: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        groups: Option<String>,
        /// Must match the server CA curve
        #[arg(long, default_value = "curve25519")]
        curve: Curve,
        /// Reuse an existing node private key instead of generating one
        #[arg(long, env = "TUNNELGATE_NODE_KEY")]
        key: Option<PathBuf>,
        #[arg(long, env = "TUNNELGATE_LISTEN_ADDR", default_value = "0.0.0.0:4243")]
        listen: String,
        /// PORT:DIAL_ADDRESS:tcp|udp|both
        #[arg(long = "port-mapping", value_delimiter = ',')]
        port_mappings: Vec<PortMapping>,
        #[arg(long, env = "TUNNELGATE_CONN_CFG_PATH", default_value = "conn.yaml")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnelgate_admin=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ca {
            name,
            curve,
            out_key,
            out_crt,
        } => {
            refuse_overwrite(&out_key)?;
            refuse_overwrite(&out_crt)?;
            let pair = ca::generate_ca(&name, curve)?;
            write_file(&out_key, pair.key_pem.as_bytes(), true)?;
            write_file(&out_crt, pair.cert_pem.as_bytes(), false)?;
            info!("Wrote {} CA to {} and {}", curve, out_key.display(), out_crt.display());
        }
        Commands::Keygen {
            curve,
            out_key,
            out_pub,
        } => {
            refuse_overwrite(&out_key)?;
            let pair = ca::generate_key_pair(curve)?;
            write_file(&out_key, pair.private_key_pem.as_bytes(), true)?;
            write_file(&out_pub, pair.public_key_pem.as_bytes(), false)?;
            info!("Wrote {} key pair to {} and {}", curve, out_key.display(), out_pub.display());
        }
        Commands::Sign {
            ca_key,
            ca_crt,
            name,
            networks,
            groups,
            in_pub,
            out_crt,
        } => {
            let ca_key_pem = zeroize::Zeroizing::new(read(&ca_key)?);
            let cert_pem = ca::sign_cert(
                &read(&ca_crt)?,
                &ca_key_pem,
                &name,
                &networks,
                &groups,
                &read(&in_pub)?,
            )?;
            write_file(&out_crt, cert_pem.as_bytes(), false)?;
            info!("Signed certificate for {} written to {}", name, out_crt.display());
        }
        Commands::Inspect { path } => {
            let cert = Certificate::from_pem(&read(&path)?)?;
            let details = cert.details();
            println!("name:        {}", details.name);
            println!("curve:       {}", details.curve);
            println!("is_ca:       {}", details.is_ca);
            let networks: Vec<String> = details.networks.iter().map(ToString::to_string).collect();
            println!("networks:    {}", networks.join(", "));
            println!("groups:      {}", details.groups.join(", "));
            println!("not_before:  {}", details.not_before);
            println!("not_after:   {}", details.not_after);
            println!("issuer:      {}", details.issuer.as_deref().unwrap_or("(self)"));
            println!("fingerprint: {}", cert.fingerprint()?);
        }
        Commands::Token {
            server,
            master_token,
        } => {
            let token = ApiClient::new(&server).one_time_token(&master_token).await?;
            println!("{token}");
        }
        Commands::Connect {
            server,
            token,
            name,
            groups,
            curve,
            key,
            listen,
            port_mappings,
            out,
        } => {
            let mut profile = if out.exists() {
                info!("Using existing profile {}", out.display());
                ConnectionProfile::from_yaml(&read(&out)?)?
            } else {
                if token.is_empty() {
                    bail!("a token is required to fetch a new profile");
                }
                let keys = match &key {
                    Some(path) => {
                        let pem = zeroize::Zeroizing::new(read(path)?);
                        let keys = NodeKeyPair::from_private_pem(&pem)?;
                        info!("Using {} node key from {}", keys.curve(), path.display());
                        keys
                    }
                    None => NodeKeyPair::generate(curve)?,
                };
                let output = ApiClient::new(&server)
                    .connect(&token, name.as_deref(), groups.as_deref(), &keys.public_key_pem())
                    .await?;
                info!("Provisioned with address {}", output.address);

                let mut profile = ConnectionProfile::from_yaml(&output.connection_config)?;
                profile.set_private_key(&keys.private_key_pem());
                profile
            };

            profile.apply_listen(&listen)?;
            if !port_mappings.is_empty() {
                for mapping in &port_mappings {
                    let protocols: Vec<String> =
                        mapping.protocols.iter().map(ToString::to_string).collect();
                    info!(
                        "Forwarding overlay port {} to {} ({})",
                        mapping.listen_port,
                        mapping.dial_address,
                        protocols.join("+")
                    );
                }
                profile.apply_port_mappings(port_mappings);
            }

            write_file(&out, profile.to_yaml()?.as_bytes(), true)?;
            println!("Connection profile written to {}", out.display());
        }
    }

    Ok(())
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn refuse_overwrite(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists, refusing to overwrite", path.display());
    }
    Ok(())
}

fn write_file(path: &Path, contents: &[u8], secret: bool) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(if secret { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = secret;

    let mut file = options
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("writing {}", path.display()))?;

    // The open mode only applies on create; an existing file keeps its own.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if secret { 0o600 } else { 0o644 };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting permissions on {}", path.display()))?;
    }
    Ok(())
}
