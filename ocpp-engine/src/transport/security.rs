//! Certificate collaborator used to build TLS channels

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::TransportError;

const CLIENT_CERT_FILE: &str = "cs_cert.pem";
const CLIENT_KEY_FILE: &str = "cs_key.pem";
const CSMS_ROOT_FILE: &str = "csms_root.pem";

/// Client certificate chain and PKCS#8 private key, both PEM encoded
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

/// What an installed certificate is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    /// Trust anchor for the CSMS server certificate
    CsmsRoot,
    /// Charging station client certificate (profile 3)
    ChargingStation,
}

/// Data the CSMS needs to check certificate revocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcspRequestData {
    pub issuer_name_hash: String,
    pub issuer_key_hash: String,
    pub serial_number: String,
    pub responder_url: String,
}

/// Certificate and key storage the transport reads when it opens a TLS
/// channel.
pub trait SecurityProvider: Send + Sync {
    /// Current client key pair, if one is installed
    fn get_key_pair(&self) -> Option<KeyPair>;

    /// Trusted CSMS root certificates (PEM bundle)
    fn csms_root_certificates(&self) -> Option<Vec<u8>>;

    fn install_certificate(&self, kind: CertificateKind, pem: &[u8]) -> io::Result<()>;

    fn delete_certificate(&self, kind: CertificateKind) -> io::Result<()>;

    fn get_ocsp_request_data(&self) -> Vec<OcspRequestData>;
}

/// Certificates kept as PEM files in one directory
#[derive(Debug, Clone)]
pub struct FileSecurityProvider {
    dir: PathBuf,
    private_key_pem: Option<Vec<u8>>,
}

impl FileSecurityProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            private_key_pem: None,
        }
    }

    /// Use a key that is not stored next to the certificates
    pub fn with_private_key(mut self, pem: Vec<u8>) -> Self {
        self.private_key_pem = Some(pem);
        self
    }

    fn path(&self, kind: CertificateKind) -> PathBuf {
        match kind {
            CertificateKind::CsmsRoot => self.dir.join(CSMS_ROOT_FILE),
            CertificateKind::ChargingStation => self.dir.join(CLIENT_CERT_FILE),
        }
    }
}

impl SecurityProvider for FileSecurityProvider {
    fn get_key_pair(&self) -> Option<KeyPair> {
        let certificate_pem = fs::read(self.path(CertificateKind::ChargingStation)).ok()?;
        let private_key_pem = match &self.private_key_pem {
            Some(pem) => pem.clone(),
            None => fs::read(self.dir.join(CLIENT_KEY_FILE)).ok()?,
        };
        Some(KeyPair {
            certificate_pem,
            private_key_pem,
        })
    }

    fn csms_root_certificates(&self) -> Option<Vec<u8>> {
        fs::read(self.path(CertificateKind::CsmsRoot)).ok()
    }

    fn install_certificate(&self, kind: CertificateKind, pem: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(kind);
        let tmp = path.with_extension("pem.tmp");
        fs::write(&tmp, pem)?;
        fs::rename(&tmp, &path)?;
        info!("Security: Installed {:?} certificate at {:?}", kind, path);
        Ok(())
    }

    fn delete_certificate(&self, kind: CertificateKind) -> io::Result<()> {
        match fs::remove_file(self.path(kind)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Security: No {:?} certificate to delete", kind);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn get_ocsp_request_data(&self) -> Vec<OcspRequestData> {
        // Revocation data is not tracked for file-based certificates
        Vec::new()
    }
}

/// Split a PEM bundle into individual certificates
pub fn pem_certificates(bundle: &[u8]) -> Vec<Vec<u8>> {
    const END: &str = "-----END CERTIFICATE-----";

    let text = String::from_utf8_lossy(bundle);
    text.split_inclusive(END)
        .filter(|chunk| chunk.contains("-----BEGIN CERTIFICATE-----") && chunk.ends_with(END))
        .map(|chunk| chunk.trim_start().as_bytes().to_vec())
        .collect()
}

/// TLS connector for the CSMS channel
pub(crate) fn tls_connector(
    roots: Option<&[u8]>,
    identity: Option<&KeyPair>,
) -> Result<native_tls::TlsConnector, TransportError> {
    let mut builder = native_tls::TlsConnector::builder();

    if let Some(bundle) = roots {
        for pem in pem_certificates(bundle) {
            let cert = native_tls::Certificate::from_pem(&pem)
                .map_err(|e| TransportError::TlsConfig(e.to_string()))?;
            builder.add_root_certificate(cert);
        }
    }

    if let Some(pair) = identity {
        let identity = native_tls::Identity::from_pkcs8(&pair.certificate_pem, &pair.private_key_pem)
            .map_err(|e| TransportError::TlsConfig(e.to_string()))?;
        builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| TransportError::TlsConfig(e.to_string()))
}
