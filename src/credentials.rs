//! Instance-identity credential issuance.
//!
//! When enabled, every created container gets a private key and an X.509
//! leaf certificate naming its guid and internal IP, signed by the
//! agent's configured CA and bind-mounted read-only into the container.
//! When disabled, every operation is a no-op returning an empty mount
//! list.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, SanType, SerialNumber,
};
use tracing::{debug, info};

use crate::container::Container;
use crate::error::CredentialError;
use crate::runtime::BindMount;

const KEY_FILE: &str = "instance.key";
const CERT_FILE: &str = "instance.crt";

/// Contract the container store consumes.
pub trait CredentialManager: Send + Sync {
    /// Creates the per-container credential directory and returns the
    /// bind mounts to attach at sandbox create.
    fn create_cred_dir(&self, container: &Container) -> Result<Vec<BindMount>, CredentialError>;

    /// Issues the key and certificate into the container's directory.
    /// Requires the container's internal IP, so it runs after create.
    fn generate_creds(&self, container: &Container) -> Result<(), CredentialError>;

    /// Removes the container's credential directory.
    fn remove_creds(&self, guid: &str) -> Result<(), CredentialError>;
}

/// Disabled issuance: all operations succeed and do nothing.
pub struct NoopCredentialManager;

impl CredentialManager for NoopCredentialManager {
    fn create_cred_dir(&self, _container: &Container) -> Result<Vec<BindMount>, CredentialError> {
        Ok(Vec::new())
    }

    fn generate_creds(&self, _container: &Container) -> Result<(), CredentialError> {
        Ok(())
    }

    fn remove_creds(&self, _guid: &str) -> Result<(), CredentialError> {
        Ok(())
    }
}

/// Issues per-container certificates signed by a configured CA.
pub struct InstanceIdentityManager {
    cred_dir: PathBuf,
    default_mount_path: String,
    validity: Duration,
    ca: Certificate,
}

impl InstanceIdentityManager {
    /// Loads the CA certificate and key from PEM files.
    pub fn new(
        cred_dir: impl Into<PathBuf>,
        default_mount_path: impl Into<String>,
        validity: Duration,
        ca_cert_path: &str,
        ca_key_path: &str,
    ) -> Result<Self, CredentialError> {
        let cred_dir = cred_dir.into();
        std::fs::create_dir_all(&cred_dir)?;

        let ca_key_pem =
            std::fs::read_to_string(ca_key_path).map_err(|err| CredentialError::CaMaterial {
                path: ca_key_path.to_string(),
                reason: err.to_string(),
            })?;
        let ca_cert_pem =
            std::fs::read_to_string(ca_cert_path).map_err(|err| CredentialError::CaMaterial {
                path: ca_cert_path.to_string(),
                reason: err.to_string(),
            })?;

        let key_pair = KeyPair::from_pem(&ca_key_pem).map_err(|err| CredentialError::CaMaterial {
            path: ca_key_path.to_string(),
            reason: err.to_string(),
        })?;
        let params = CertificateParams::from_ca_cert_pem(&ca_cert_pem, key_pair).map_err(|err| {
            CredentialError::CaMaterial {
                path: ca_cert_path.to_string(),
                reason: err.to_string(),
            }
        })?;
        let ca = Certificate::from_params(params)
            .map_err(|err| CredentialError::Generation(err.to_string()))?;

        info!(cred_dir = %cred_dir.display(), "instance identity issuance enabled");
        Ok(Self {
            cred_dir,
            default_mount_path: default_mount_path.into(),
            validity,
            ca,
        })
    }

    fn container_dir(&self, guid: &str) -> PathBuf {
        self.cred_dir.join(guid)
    }
}

impl CredentialManager for InstanceIdentityManager {
    fn create_cred_dir(&self, container: &Container) -> Result<Vec<BindMount>, CredentialError> {
        let dir = self.container_dir(&container.guid);
        std::fs::create_dir_all(&dir).map_err(|err| CredentialError::CredDir {
            path: dir.display().to_string(),
            reason: err.to_string(),
        })?;

        let dst_path = if container.credentials_mount_path.is_empty() {
            self.default_mount_path.clone()
        } else {
            container.credentials_mount_path.clone()
        };

        Ok(vec![BindMount {
            src_path: dir.display().to_string(),
            dst_path,
            read_only: true,
        }])
    }

    fn generate_creds(&self, container: &Container) -> Result<(), CredentialError> {
        debug!(guid = %container.guid, "generating instance identity credentials");

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, container.guid.clone());

        if let Ok(ip) = container.internal_ip.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        }

        params.serial_number = Some(SerialNumber::from_slice(container.guid.as_bytes()));
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + self.validity;

        let leaf = Certificate::from_params(params)
            .map_err(|err| CredentialError::Generation(err.to_string()))?;

        let cert_pem = leaf
            .serialize_pem_with_signer(&self.ca)
            .map_err(|err| CredentialError::Generation(err.to_string()))?;
        let key_pem = leaf.serialize_private_key_pem();

        let dir = self.container_dir(&container.guid);
        std::fs::write(dir.join(KEY_FILE), key_pem)?;
        std::fs::write(dir.join(CERT_FILE), cert_pem)?;
        Ok(())
    }

    fn remove_creds(&self, guid: &str) -> Result<(), CredentialError> {
        let dir = self.container_dir(guid);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
