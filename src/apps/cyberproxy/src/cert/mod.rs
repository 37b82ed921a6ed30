pub mod ca;

pub use ca::CertificateAuthority;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};


/// A per-hostname certificate forged by the root authority.
#[derive(Debug)]
pub struct LeafCertificate {
    pub hostname: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub pem_cert: String,
    pub pem_key: String,
}

impl Clone for LeafCertificate {
    fn clone(&self) -> Self {
        Self {
            hostname: self.hostname.clone(),
            cert_der: self.cert_der.clone(),
            key_der: self.key_der.clone_key(),
            pem_cert: self.pem_cert.clone(),
            pem_key: self.pem_key.clone(),
        }
    }
}

type Slot = Arc<OnceCell<Arc<LeafCertificate>>>;

/// Leaf certificates keyed by hostname.
///
/// Each hostname owns a slot that is initialised at most once at a time: the
/// first caller for an unseen hostname runs the generation while any concurrent
/// callers for that same hostname wait on the slot and receive its result. The
/// map lock is only held to look up or create a slot, never while signing, so
/// hits for other hostnames are not serialized behind a generation in flight.
/// A failed generation leaves the slot empty and the next caller retries.
#[derive(Debug, Default)]
pub struct CertificateCache {
    slots: RwLock<HashMap<String, Slot>>,
}

impl CertificateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, hostname: &str) -> Option<Arc<LeafCertificate>> {
        let slots = self.slots.read().await;
        slots.get(hostname).and_then(|slot| slot.get().cloned())
    }

    pub async fn get_or_try_insert_with<F, Fut>(
        &self,
        hostname: &str,
        generate: F,
    ) -> CertResult<Arc<LeafCertificate>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CertResult<LeafCertificate>>,
    {
        let slot = self.slot(hostname).await;
        let leaf = slot
            .get_or_try_init(|| async { generate().await.map(Arc::new) })
            .await?;
        Ok(leaf.clone())
    }

    async fn slot(&self, hostname: &str) -> Slot {
        if let Some(slot) = self.slots.read().await.get(hostname) {
            return slot.clone();
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Number of hostnames with a minted certificate.
    pub async fn size(&self) -> usize {
        let slots = self.slots.read().await;
        slots.values().filter(|slot| slot.initialized()).count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("Certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid hostname for certificate: {0}")]
    InvalidHostname(String),

    #[error("Root authority at {0} is incomplete: certificate and key must both exist or both be absent")]
    IncompleteAuthority(String),

    #[error("Root authority is unusable: {0}")]
    InvalidRoot(String),

    #[error("Certificate signing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type CertResult<T> = Result<T, CertError>;
