//! NodeTrust: the node's view of which heads it trusts.
//!
//! The verifier is swapped wholesale on reload, so readers never block on
//! enrollment and always see a consistent key set. Key files are read on
//! the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ed25519_dalek::VerifyingKey;

use super::assertion::{AssertionClaims, AssertionVerifier};
use super::keys;
use crate::config::NodeConfig;
use crate::error::TrustError;

/// Minimum gap between key reloads triggered by requests that found no keys.
const MISS_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

pub struct NodeTrust {
    node_id: String,
    audience: String,
    configured_keys: Vec<String>,
    keys_dir: PathBuf,
    verifier: RwLock<Arc<AssertionVerifier>>,
    key_count: AtomicUsize,
    last_miss_reload: StdMutex<Option<Instant>>,
    /// One-time enrollment secret. Cleared by a successful enrollment.
    enroll_token: Mutex<Option<SecretString>>,
    auth_required: bool,
}

impl NodeTrust {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(
            config.node_id.clone(),
            config.trust.audience.clone(),
            config.trust.trusted_keys.clone(),
            config.trusted_keys_dir(),
            config.trust.enroll_token.clone(),
            config.trust.auth_required,
        )
    }

    pub fn new(
        node_id: String,
        audience: String,
        configured_keys: Vec<String>,
        keys_dir: PathBuf,
        enroll_token: Option<SecretString>,
        auth_required: bool,
    ) -> Self {
        let found = load_keys(&configured_keys, &keys_dir);
        info!(node_id = %node_id, keys = found.len(), "Trusted keys loaded");
        Self {
            key_count: AtomicUsize::new(found.len()),
            verifier: RwLock::new(Arc::new(AssertionVerifier::new(found, audience.clone()))),
            last_miss_reload: StdMutex::new(None),
            node_id,
            audience,
            configured_keys,
            keys_dir,
            enroll_token: Mutex::new(enroll_token),
            auth_required,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn auth_required(&self) -> bool {
        self.auth_required
    }

    /// Rebuild the verifier from configured keys plus installed key files.
    ///
    /// Returns the number of trusted keys. A failed load keeps the current
    /// verifier.
    pub async fn reload(&self) -> usize {
        let configured = self.configured_keys.clone();
        let dir = self.keys_dir.clone();
        let found = match tokio::task::spawn_blocking(move || load_keys(&configured, &dir)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "Trusted key reload failed");
                return self.key_count.load(Ordering::SeqCst);
            }
        };

        let count = found.len();
        let next = Arc::new(AssertionVerifier::new(found, self.audience.clone()));
        match self.verifier.write() {
            Ok(mut slot) => *slot = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        let previous = self.key_count.swap(count, Ordering::SeqCst);
        if previous == count {
            debug!(node_id = %self.node_id, keys = count, "Trusted keys unchanged");
        } else {
            info!(node_id = %self.node_id, keys = count, "Trusted keys loaded");
        }
        count
    }

    fn current(&self) -> Arc<AssertionVerifier> {
        match self.verifier.read() {
            Ok(slot) => (*slot).clone(),
            Err(poisoned) => (*poisoned.into_inner()).clone(),
        }
    }

    pub fn has_keys(&self) -> bool {
        self.current().has_keys()
    }

    /// Verify a bearer assertion addressed to this node. Keys that appeared
    /// on disk since the last load are picked up on a miss, at most once per
    /// [`MISS_RELOAD_INTERVAL`].
    pub async fn verify(&self, token: &str) -> Result<AssertionClaims, TrustError> {
        let result = self.current().verify_for_node(token, &self.node_id);
        if matches!(result, Err(TrustError::NoTrustedKeys))
            && self.miss_reload_due()
            && self.reload().await > 0
        {
            return self.current().verify_for_node(token, &self.node_id);
        }
        result
    }

    fn miss_reload_due(&self) -> bool {
        let mut last = match self.last_miss_reload.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        if last.is_some_and(|at| now.duration_since(at) < MISS_RELOAD_INTERVAL) {
            return false;
        }
        *last = Some(now);
        true
    }

    pub async fn enrollment_open(&self) -> bool {
        self.enroll_token.lock().await.is_some()
    }

    /// Install a head public key, authorised by the enrollment secret.
    ///
    /// Returns the installed key's fingerprint.
    pub async fn install_key(&self, secret: &str, public_key_pem: &str) -> Result<String, TrustError> {
        let mut enroll = self.enroll_token.lock().await;
        let Some(expected) = enroll.as_ref() else {
            return Err(TrustError::EnrollmentDisabled);
        };
        if !constant_time_eq(expected.expose_secret().as_bytes(), secret.as_bytes()) {
            warn!(node_id = %self.node_id, "Enrollment attempt with wrong secret");
            return Err(TrustError::EnrollmentDenied);
        }

        let key = keys::parse_public_key(public_key_pem)?;
        let pem = keys::public_key_pem(&key)?;
        let fp = keys::fingerprint(&key);
        let path = self.keys_dir.join(format!("{fp}.pem"));
        let dir = self.keys_dir.clone();
        let write_path = path.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            std::fs::write(&write_path, pem)
        })
        .await
        .map_err(|e| TrustError::KeyMaterial {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .map_err(|e| TrustError::KeyMaterial {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        *enroll = None;
        drop(enroll);
        self.reload().await;
        info!(node_id = %self.node_id, fingerprint = %fp, "Head key enrolled");
        Ok(fp)
    }
}

fn load_keys(configured: &[String], dir: &Path) -> Vec<VerifyingKey> {
    let mut sources = configured.to_vec();
    sources.extend(keys::key_files(dir));
    let mut found = keys::load_public_keys(&sources);
    found.sort_by_key(|k| k.to_bytes());
    found.dedup();
    found
}

/// Compare two secrets without an early exit on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::trust::AssertionSigner;

    fn head() -> AssertionSigner {
        AssertionSigner::new(
            SigningKey::generate(&mut rand::rngs::OsRng),
            "node",
            Duration::from_secs(60),
        )
    }

    fn node(dir: &tempfile::TempDir, keys: Vec<String>, secret: Option<&str>) -> NodeTrust {
        NodeTrust::new(
            "A".to_string(),
            "node".to_string(),
            keys,
            dir.path().join("trust"),
            secret.map(SecretString::from),
            true,
        )
    }

    #[tokio::test]
    async fn enrollment_bootstraps_trust_once() {
        let dir = tempfile::tempdir().unwrap();
        let trust = node(&dir, vec![], Some("s3cret"));
        let head = head();
        let token = head.sign_for_node("A").unwrap();
        assert!(!trust.has_keys());
        assert!(trust.verify(&token).await.is_err());

        let pem = keys::public_key_pem(&head.verifying_key()).unwrap();
        assert!(matches!(
            trust.install_key("wrong", &pem).await,
            Err(TrustError::EnrollmentDenied)
        ));
        let fp = trust.install_key("s3cret", &pem).await.unwrap();
        assert!(dir.path().join("trust").join(format!("{fp}.pem")).exists());
        assert!(trust.verify(&token).await.is_ok());

        assert!(!trust.enrollment_open().await);
        assert!(matches!(
            trust.install_key("s3cret", &pem).await,
            Err(TrustError::EnrollmentDisabled)
        ));
    }

    #[tokio::test]
    async fn enrollment_disabled_without_secret() {
        let dir = tempfile::tempdir().unwrap();
        let trust = node(&dir, vec![], None);
        let pem = keys::public_key_pem(&head().verifying_key()).unwrap();
        assert!(matches!(
            trust.install_key("", &pem).await,
            Err(TrustError::EnrollmentDisabled)
        ));
    }

    #[tokio::test]
    async fn key_path_written_after_start_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("head_public.pem");
        let trust = node(&dir, vec![key_path.display().to_string()], None);
        assert!(!trust.has_keys());

        let head = head();
        std::fs::write(&key_path, keys::public_key_pem(&head.verifying_key()).unwrap()).unwrap();
        let claims = trust.verify(&head.sign_for_node("A").unwrap()).await.unwrap();
        assert_eq!(claims.node_id, "A");
        assert!(trust.verify(&head.sign_for_node("B").unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn misses_reload_keys_at_most_once_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let trust = node(&dir, vec![], None);
        let head = head();
        let token = head.sign_for_node("A").unwrap();

        assert!(matches!(trust.verify(&token).await, Err(TrustError::NoTrustedKeys)));

        let keys_dir = dir.path().join("trust");
        std::fs::create_dir_all(&keys_dir).unwrap();
        std::fs::write(
            keys_dir.join("late.pem"),
            keys::public_key_pem(&head.verifying_key()).unwrap(),
        )
        .unwrap();

        // Within the interval the miss is answered from memory.
        assert!(matches!(trust.verify(&token).await, Err(TrustError::NoTrustedKeys)));
        assert!(!trust.has_keys());

        assert_eq!(trust.reload().await, 1);
        assert!(trust.verify(&token).await.is_ok());
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokem"));
        assert!(!constant_time_eq(b"token", b"token2"));
        assert!(constant_time_eq(b"", b""));
    }
}
