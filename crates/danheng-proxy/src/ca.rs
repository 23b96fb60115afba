//! Root certificate provisioning for TLS interception.
//!
//! The root CA is generated once and stored as PEM. The proxy signs a leaf
//! certificate per decrypted host with it; clients must trust the root for
//! redirected HTTPS traffic to work.

use std::fs;
use std::path::{Path, PathBuf};

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

pub use crate::error::CaManagerError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "danheng-ca.crt";
const CA_KEY_FILENAME: &str = "danheng-ca.key";

/// Common name of the generated root.
const CA_COMMON_NAME: &str = "DanHeng Proxy Root CA";

/// Manages the root CA certificate for the MITM proxy.
#[derive(Debug, Clone)]
pub struct CaManager {
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager using the platform data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("", "danheng", "DanHengProxy")
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;

        Ok(Self::new(project_dirs.data_dir().join("ca")))
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if the CA certificate and key exist.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Ensures the CA exists, generating it if necessary, and loads it.
    pub fn ensure_ca(&self) -> Result<RcgenAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a new root CA certificate and key, replacing any old one.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let cert = ca_params()
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaManagerError::Write(e.to_string()))?;
        write_private(&self.key_path(), &key_pair.serialize_pem())?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());
        Ok(())
    }

    /// Loads the stored CA into a signing authority.
    pub fn load_authority(&self) -> Result<RcgenAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        // Keeps up to 1000 signed leaf certificates cached
        Ok(RcgenAuthority::new(issuer, 1_000, default_provider()))
    }
}

/// Certificate parameters for the root.
fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "DanHeng");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params
}

/// Writes the private key readable by the owner only.
fn write_private(path: &Path, contents: &str) -> Result<(), CaManagerError> {
    fs::write(path, contents).map_err(|e| CaManagerError::Write(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ca_manager_paths() {
        let manager = CaManager::new("/tmp/test-ca");
        assert_eq!(manager.cert_path(), PathBuf::from("/tmp/test-ca/danheng-ca.crt"));
        assert_eq!(manager.key_path(), PathBuf::from("/tmp/test-ca/danheng-ca.key"));
    }

    #[test]
    fn ca_manager_not_exists_initially() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        assert!(!manager.ca_exists());
    }

    #[test]
    fn ensure_ca_generates_then_reloads() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        assert!(manager.ensure_ca().is_ok());
        assert!(manager.ca_exists());

        let first = fs::read_to_string(manager.cert_path()).unwrap();
        assert!(first.contains("BEGIN CERTIFICATE"));

        // Second call loads the stored root instead of replacing it
        assert!(manager.ensure_ca().is_ok());
        assert_eq!(fs::read_to_string(manager.cert_path()).unwrap(), first);
    }

    #[test]
    fn load_authority_fails_on_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path());
        fs::write(manager.cert_path(), "not a cert").unwrap();
        fs::write(manager.key_path(), "not a key").unwrap();

        assert!(matches!(
            manager.load_authority(),
            Err(CaManagerError::Parse(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path());
        manager.generate_ca().unwrap();

        let mode = fs::metadata(manager.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
