//! Dynamic certificate authority for the interception path
//!
//! On first use a self-signed RSA-2048 CA is created and persisted as PEM at
//! `<data-dir>/certs/ca.key.pem` / `ca.cert.pem`; the key file is written
//! with mode 0600 and an existing CA is never overwritten (that would
//! invalidate previously-trusted chains). Host certificates are minted on
//! demand, cached by host, and concurrent requests for the same host join
//! the in-progress mint through a shared-future map instead of duplicating
//! the RSA key generation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use time::OffsetDateTime;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

const CA_CERT_FILE: &str = "ca.cert.pem";
const CA_KEY_FILE: &str = "ca.key.pem";
const CA_VALIDITY_DAYS: i64 = 10 * 365;
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Cache entries expire one day before the certificate itself.
const CACHE_VALIDITY_DAYS: u64 = 364;

/// A minted host certificate: leaf key plus leaf+CA chain, both PEM.
#[derive(Debug)]
pub struct HostCert {
    pub key_pem: String,
    pub cert_chain_pem: String,
    pub expires_at: SystemTime,
}

impl HostCert {
    fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }
}

type MintResult = Result<Arc<HostCert>, String>;
type MintFuture = Shared<BoxFuture<'static, MintResult>>;

/// CA material shared with mint tasks. Strings only so mints can run on the
/// blocking pool without borrowing the authority.
struct CaMaterial {
    cert_pem: String,
    key_pem: String,
}

/// The certificate authority service.
pub struct CertificateAuthority {
    material: Arc<CaMaterial>,
    ca_cert_path: PathBuf,
    cache: Mutex<HashMap<String, Arc<HostCert>>>,
    pending: Mutex<HashMap<String, MintFuture>>,
}

impl CertificateAuthority {
    /// Load the persisted CA or create and persist a fresh one.
    pub fn load_or_create(certs_dir: &Path) -> Result<Self> {
        let cert_path = certs_dir.join(CA_CERT_FILE);
        let key_path = certs_dir.join(CA_KEY_FILE);

        let (cert_pem, key_pem) = if cert_path.exists() || key_path.exists() {
            if !cert_path.exists() || !key_path.exists() {
                return Err(anyhow!(
                    "both CA files must exist (cert={}, key={})",
                    cert_path.display(),
                    key_path.display()
                ));
            }
            let cert_pem = std::fs::read_to_string(&cert_path)
                .with_context(|| format!("failed to read {}", cert_path.display()))?;
            let key_pem = std::fs::read_to_string(&key_path)
                .with_context(|| format!("failed to read {}", key_path.display()))?;
            // Validate eagerly so a corrupt CA fails at startup, not per-host
            KeyPair::from_pem(&key_pem).context("failed to parse CA key")?;
            (cert_pem, key_pem)
        } else {
            std::fs::create_dir_all(certs_dir)
                .with_context(|| format!("failed to create {}", certs_dir.display()))?;
            let (cert_pem, key_pem) = generate_ca()?;
            write_new(&key_path, key_pem.as_bytes(), 0o600)
                .with_context(|| format!("failed to persist CA key {}", key_path.display()))?;
            if let Err(e) = write_new(&cert_path, cert_pem.as_bytes(), 0o644)
                .with_context(|| format!("failed to persist CA cert {}", cert_path.display()))
            {
                // Don't leave a half-created CA behind
                let _ = std::fs::remove_file(&key_path);
                return Err(e);
            }
            tracing::info!("Generated proxy CA at {}", cert_path.display());
            (cert_pem, key_pem)
        };

        Ok(Self {
            material: Arc::new(CaMaterial { cert_pem, key_pem }),
            ca_cert_path: cert_path,
            cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the CA certificate clients install for trust.
    pub fn ca_cert_path(&self) -> &Path {
        &self.ca_cert_path
    }

    /// Return the cached certificate for `host`, or mint one. A second
    /// concurrent caller for the same host awaits the same mint future.
    pub async fn certificate_for_host(&self, host: &str) -> Result<Arc<HostCert>> {
        if let Some(cert) = self.cached(host) {
            return Ok(cert);
        }

        let future = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get(host) {
                Some(existing) => existing.clone(),
                None => {
                    let material = self.material.clone();
                    let host_owned = host.to_string();
                    let future: MintFuture = async move {
                        tokio::task::spawn_blocking(move || {
                            mint_host_cert(&material, &host_owned).map(Arc::new)
                        })
                        .await
                        .map_err(|e| format!("mint task failed: {e}"))?
                        .map_err(|e| format!("{e:#}"))
                    }
                    .boxed()
                    .shared();
                    pending.insert(host.to_string(), future.clone());
                    future
                }
            }
        };

        let result = future.await;
        self.pending.lock().unwrap().remove(host);

        match result {
            Ok(cert) => {
                self.cache
                    .lock()
                    .unwrap()
                    .insert(host.to_string(), cert.clone());
                Ok(cert)
            }
            Err(message) => Err(anyhow!("certificate mint for {host} failed: {message}")),
        }
    }

    /// Rustls server config for an intercepted connection to `host`.
    pub async fn server_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let cert = self.certificate_for_host(host).await?;
        let chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert.cert_chain_pem.as_bytes())
                .collect::<std::result::Result<_, _>>()
                .context("failed to parse minted certificate chain")?;
        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut cert.key_pem.as_bytes())
                .context("failed to parse minted key")?
                .ok_or_else(|| anyhow!("no private key in minted PEM"))?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .context("failed to build server TLS config")?;
        Ok(Arc::new(config))
    }

    fn cached(&self, host: &str) -> Option<Arc<HostCert>> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(host) {
            Some(cert) if !cert.is_expired() => Some(cert.clone()),
            Some(_) => {
                cache.remove(host);
                None
            }
            None => None,
        }
    }
}

/// Generate the self-signed RSA-2048 CA.
fn generate_ca() -> Result<(String, String)> {
    let key_pair = generate_rsa_keypair().context("failed to generate CA key")?;

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "dproxy CA");
    dn.push(DnType::OrganizationName, "dproxy");
    params.distinguished_name = dn;
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign CA certificate")?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Mint a leaf for one host, signed by the CA with SHA-256.
fn mint_host_cert(material: &CaMaterial, host: &str) -> Result<HostCert> {
    let ca_key = KeyPair::from_pem(&material.key_pem).context("failed to parse CA key")?;
    let ca_params = CertificateParams::from_ca_cert_pem(&material.cert_pem)
        .context("failed to parse CA certificate")?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .context("failed to rebuild CA issuer")?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    params.subject_alt_names = subject_alt_names(host)?;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

    let key_pair = generate_rsa_keypair().context("failed to generate host key")?;
    let cert = params
        .signed_by(&key_pair, &ca_cert, &ca_key)
        .context("failed to sign host certificate")?;

    Ok(HostCert {
        key_pem: key_pair.serialize_pem(),
        cert_chain_pem: format!("{}{}", cert.pem(), material.cert_pem),
        expires_at: SystemTime::now() + Duration::from_secs(CACHE_VALIDITY_DAYS * 24 * 3600),
    })
}

/// SANs: the host as DNS name, as IP when it parses as one, and a wildcard
/// over the registrable (last-two-labels) domain.
fn subject_alt_names(host: &str) -> Result<Vec<SanType>> {
    let mut sans = Vec::new();
    if let Ok(ip) = host.parse::<IpAddr>() {
        sans.push(SanType::IpAddress(ip));
        sans.push(SanType::DnsName(
            Ia5String::try_from(host.to_string()).map_err(|e| anyhow!("bad host name: {e}"))?,
        ));
        return Ok(sans);
    }
    sans.push(SanType::DnsName(
        Ia5String::try_from(host.to_string()).map_err(|e| anyhow!("bad host name: {e}"))?,
    ));
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 2 {
        let registrable = labels[labels.len() - 2..].join(".");
        let wildcard = format!("*.{registrable}");
        if wildcard != host {
            sans.push(SanType::DnsName(
                Ia5String::try_from(wildcard).map_err(|e| anyhow!("bad wildcard name: {e}"))?,
            ));
        }
    }
    Ok(sans)
}

/// RSA-2048 keypair usable by rcgen. rcgen cannot generate RSA keys itself,
/// so the key comes from the `rsa` crate and round-trips through PKCS#8.
fn generate_rsa_keypair() -> Result<KeyPair> {
    use rsa::pkcs8::EncodePrivateKey;
    let mut rng = rand::thread_rng();
    let key = rsa::RsaPrivateKey::new(&mut rng, 2048).context("RSA key generation failed")?;
    let pem = key
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .context("PKCS#8 encoding failed")?;
    KeyPair::from_pem(&pem).context("rcgen rejected generated RSA key")
}

/// Create-new write; never overwrites an existing file.
fn write_new(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}
