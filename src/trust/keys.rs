//! Key material: Ed25519 keypair bootstrap and trusted public key loading.

use std::path::Path;

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::TrustError;

fn material_err(path: &Path, reason: impl ToString) -> TrustError {
    TrustError::KeyMaterial {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Load the signing key at `private_path`, generating and persisting a new
/// keypair when it does not exist. The public half is (re)written next to it.
pub fn ensure_keypair(private_path: &Path, public_path: &Path) -> Result<SigningKey, TrustError> {
    let key = if private_path.exists() {
        let pem = std::fs::read_to_string(private_path).map_err(|e| material_err(private_path, e))?;
        SigningKey::from_pkcs8_pem(&pem).map_err(|e| material_err(private_path, e))?
    } else {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| material_err(private_path, e))?;
        write_private(private_path, pem.as_bytes())?;
        info!(path = %private_path.display(), "Generated head signing key");
        key
    };

    if !public_path.exists() {
        let pem = public_key_pem(&key.verifying_key())?;
        if let Some(parent) = public_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| material_err(public_path, e))?;
        }
        std::fs::write(public_path, pem).map_err(|e| material_err(public_path, e))?;
    }
    Ok(key)
}

fn write_private(path: &Path, body: &[u8]) -> Result<(), TrustError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| material_err(path, e))?;
    }
    std::fs::write(path, body).map_err(|e| material_err(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| material_err(path, e))?;
    }
    Ok(())
}

/// SPKI PEM for a verifying key.
pub fn public_key_pem(key: &VerifyingKey) -> Result<String, TrustError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| TrustError::InvalidKey(e.to_string()))
}

pub fn parse_public_key(pem: &str) -> Result<VerifyingKey, TrustError> {
    VerifyingKey::from_public_key_pem(pem.trim()).map_err(|e| TrustError::InvalidKey(e.to_string()))
}

/// Short hex fingerprint, used to name installed key files.
pub fn fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}

/// Resolve configured trusted keys. Each value is inline PEM or a path to a
/// PEM file; a path that does not exist yet is skipped.
pub fn load_public_keys(values: &[String]) -> Vec<VerifyingKey> {
    let mut keys = Vec::new();
    for value in values {
        let pem = if value.contains("-----BEGIN") {
            value.clone()
        } else {
            let path = Path::new(value);
            if !path.exists() {
                continue;
            }
            match std::fs::read_to_string(path) {
                Ok(pem) => pem,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read trusted key");
                    continue;
                }
            }
        };
        match parse_public_key(&pem) {
            Ok(key) => keys.push(key),
            Err(e) => warn!(error = %e, "Ignoring malformed trusted key"),
        }
    }
    keys
}

/// Every `*.pem` file in `dir`, as key paths.
pub fn key_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<String> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "pem"))
        .map(|p| p.display().to_string())
        .collect();
    paths.sort();
    paths
}
