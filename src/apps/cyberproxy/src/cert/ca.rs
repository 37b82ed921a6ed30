use super::{CertError, CertResult, CertificateCache, LeafCertificate};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType, SerialNumber,
};
use ring::rand::{SecureRandom, SystemRandom};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub const ROOT_COMMON_NAME: &str = "CyberProxy Root CA";
pub const ROOT_ORGANIZATION: &str = "CyberProxy";

const ROOT_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 365;

pub fn get_root_cert_path(cert_dir: &Path) -> PathBuf {
    cert_dir.join("ca.crt")
}

pub fn get_root_key_path(cert_dir: &Path) -> PathBuf {
    cert_dir.join("ca.key")
}

/// Root key material. Never mutated after load or generation.
struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

/// Serial numbers are `salt || counter`: the salt is drawn once per authority
/// instance and the counter never repeats within it.
struct SerialSource {
    salt: [u8; 8],
    counter: AtomicU64,
}

impl SerialSource {
    fn new() -> CertResult<Self> {
        Ok(Self {
            salt: random_salt()?,
            counter: AtomicU64::new(1),
        })
    }

    fn next(&self) -> SerialNumber {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        serial_from_parts(self.salt, count)
    }
}

fn random_salt() -> CertResult<[u8; 8]> {
    let mut salt = [0u8; 8];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| CertError::InvalidRoot("system randomness unavailable".to_string()))?;
    Ok(salt)
}

fn serial_from_parts(salt: [u8; 8], count: u64) -> SerialNumber {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&salt);
    bytes[8..].copy_from_slice(&count.to_be_bytes());
    // Keep the DER INTEGER positive and a full 16 bytes long.
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    SerialNumber::from_slice(&bytes)
}

#[derive(Clone)]
pub struct CertificateAuthority {
    root: Arc<RootAuthority>,
    serials: Arc<SerialSource>,
    cert_cache: Arc<CertificateCache>,
    cert_dir: PathBuf,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_dir", &self.cert_dir)
            .field("cert_cache", &"<CertificateCache>")
            .finish()
    }
}

impl CertificateAuthority {
    /// Loads the root authority from `cert_dir`, or generates and persists a
    /// fresh one when neither file exists. A lone or unreadable file is an
    /// error: regenerating would silently invalidate every client that already
    /// trusts the old root.
    pub async fn new<P: AsRef<Path>>(cert_dir: P) -> CertResult<Self> {
        let cert_dir = cert_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cert_dir).await?;

        let root_cert_path = get_root_cert_path(&cert_dir);
        let root_key_path = get_root_key_path(&cert_dir);
        let serials = SerialSource::new()?;

        let root = match (root_cert_path.exists(), root_key_path.exists()) {
            (true, true) => {
                info!("Loading existing root certificate from {:?}", root_cert_path);
                Self::load_root_certificate(&root_cert_path, &root_key_path).await?
            }
            (false, false) => {
                info!("Generating new root certificate");
                let (root, key_pem) = Self::generate_root_certificate(serials.next())?;
                Self::save_root_certificate(&root, &key_pem, &root_cert_path, &root_key_path)
                    .await?;
                root
            }
            _ => {
                return Err(CertError::IncompleteAuthority(
                    cert_dir.display().to_string(),
                ));
            }
        };

        Ok(Self {
            root: Arc::new(root),
            serials: Arc::new(serials),
            cert_cache: Arc::new(CertificateCache::new()),
            cert_dir,
        })
    }

    fn root_params() -> CertificateParams {
        let mut params = CertificateParams::default();

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, ROOT_COMMON_NAME);
        distinguished_name.push(DnType::CountryName, "US");
        distinguished_name.push(DnType::StateOrProvinceName, "State");
        distinguished_name.push(DnType::LocalityName, "City");
        distinguished_name.push(DnType::OrganizationName, ROOT_ORGANIZATION);
        distinguished_name.push(DnType::OrganizationalUnitName, "Proxy");

        params.distinguished_name = distinguished_name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_before = not_before;
        params.not_after = not_before + time::Duration::days(ROOT_VALIDITY_DAYS);
        params
    }

    fn generate_root_certificate(serial: SerialNumber) -> CertResult<(RootAuthority, String)> {
        let mut params = Self::root_params();
        params.serial_number = Some(serial);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        let key_pem = key_pair.serialize_pem();

        let root = RootAuthority {
            cert_pem: cert.pem(),
            cert_der: cert.der().clone(),
            issuer: Issuer::new(params, key_pair),
        };
        Ok((root, key_pem))
    }

    async fn load_root_certificate(
        cert_path: &Path,
        key_path: &Path,
    ) -> CertResult<RootAuthority> {
        let cert_pem = fs::read_to_string(cert_path).await?;
        let key_pem = fs::read_to_string(key_path).await?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CertError::InvalidRoot(format!("no certificate in {:?}", cert_path)))??;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| CertError::InvalidRoot(format!("unreadable key {:?}: {}", key_path, e)))?;

        validate_root(&cert_der, &key_pair)?;

        let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)?;
        Ok(RootAuthority {
            issuer,
            cert_pem,
            cert_der,
        })
    }

    async fn save_root_certificate(
        root: &RootAuthority,
        key_pem: &str,
        cert_path: &Path,
        key_path: &Path,
    ) -> CertResult<()> {
        fs::write(cert_path, &root.cert_pem).await?;
        write_private_key(key_path, key_pem).await?;

        info!("Root certificate saved to {:?}", cert_path);
        Ok(())
    }

    /// Returns the cached leaf for `hostname`, minting it on first use.
    pub async fn leaf_certificate_for(&self, hostname: &str) -> CertResult<Arc<LeafCertificate>> {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
        if hostname.is_empty() {
            return Err(CertError::InvalidHostname(hostname));
        }
        let hostname = hostname.as_str();

        if let Some(leaf) = self.cert_cache.get(hostname).await {
            debug!("Certificate cache hit for {}", hostname);
            return Ok(leaf);
        }

        self.cert_cache
            .get_or_try_insert_with(hostname, || {
                let root = self.root.clone();
                let serial = self.serials.next();
                let hostname = hostname.to_string();
                async move {
                    debug!("Generating new certificate for {}", hostname);
                    tokio::task::spawn_blocking(move || {
                        generate_leaf_certificate(&root, &hostname, serial)
                    })
                    .await?
                }
            })
            .await
    }

    pub fn root_certificate_pem(&self) -> &str {
        &self.root.cert_pem
    }

    pub fn root_certificate_der(&self) -> CertificateDer<'static> {
        self.root.cert_der.clone()
    }

    pub fn root_certificate_path(&self) -> PathBuf {
        get_root_cert_path(&self.cert_dir)
    }

    pub async fn cache_size(&self) -> usize {
        self.cert_cache.size().await
    }
}

/// Writes the root key readable by the owner only.
async fn write_private_key(path: &Path, pem: &str) -> CertResult<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(pem.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

fn validate_root(cert_der: &CertificateDer<'_>, key_pair: &KeyPair) -> CertResult<()> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der.as_ref())
        .map_err(|e| CertError::InvalidRoot(format!("malformed certificate: {}", e)))?;

    if !cert.is_ca() {
        return Err(CertError::InvalidRoot(
            "certificate is not a certificate authority".to_string(),
        ));
    }
    if cert.tbs_certificate.subject_pki.raw != key_pair.subject_public_key_info().as_slice() {
        return Err(CertError::InvalidRoot(
            "private key does not match certificate".to_string(),
        ));
    }
    if !cert.validity().is_valid() {
        return Err(CertError::InvalidRoot(
            "certificate is outside its validity window".to_string(),
        ));
    }
    Ok(())
}

fn generate_leaf_certificate(
    root: &RootAuthority,
    hostname: &str,
    serial: SerialNumber,
) -> CertResult<LeafCertificate> {
    let mut params = CertificateParams::default();

    if let Ok(ip) = hostname.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params.subject_alt_names.push(SanType::DnsName(
            hostname
                .try_into()
                .map_err(|_| CertError::InvalidHostname(hostname.to_string()))?,
        ));
    }

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, hostname);
    distinguished_name.push(DnType::OrganizationName, "CyberProxy Interception");
    params.distinguished_name = distinguished_name;

    params.serial_number = Some(serial);
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::days(LEAF_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()?;
    let cert = params.signed_by(&key_pair, &root.issuer)?;

    Ok(LeafCertificate {
        hostname: hostname.to_string(),
        cert_der: cert.der().clone(),
        key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

