//! Configuration types.
//!
//! Both roles read their settings from the environment. Node settings use the
//! `WEBAI_` prefix, head settings the `HEAD_` prefix. Every struct has a
//! `Default` so tests can build configs without touching the environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Models offered when `WEBAI_SUPPORTED_MODELS` is unset.
pub const BASE_MODELS: &[&str] = &["gpt-5", "gpt-5-mini", "gpt-5-nano"];

/// Settings for a node (an orchestrator instance).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    /// Base URL clients use to reach this node.
    pub public_url: Option<String>,
    /// Identity this node answers to in trust assertions.
    pub node_id: String,
    pub base_data_dir: PathBuf,
    pub relay: RelayConfig,
    pub defaults: TaskDefaults,
    pub supported_models: Vec<String>,
    /// How often the scheduler scans for due tasks.
    pub schedule_check_interval: Duration,
    /// How long a run waits for a human before resuming on its own.
    pub assistance_timeout: Duration,
    /// How long a cancelled run gets to stop before it is aborted.
    pub cancel_grace: Duration,
    pub trust: NodeTrustConfig,
    pub runner: RunnerConfig,
}

/// Defaults applied to new tasks.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDefaults {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_steps: u32,
    pub max_actions_per_step: u32,
    pub max_input_tokens: u32,
    pub use_vision: bool,
}

/// Remote-desktop relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Token file polled by the relay service. `None` means `<data>/vnc/tokens.txt`.
    pub token_file: Option<PathBuf>,
    /// Where the relay forwards a token to.
    pub target_host: String,
    pub target_port: u16,
    /// Public location of the relay's web viewer.
    pub public_host: String,
    pub http_port: u16,
    pub scheme: String,
}

/// Node-side trust settings.
#[derive(Clone)]
pub struct NodeTrustConfig {
    pub audience: String,
    /// Inline PEM keys or paths to PEM files.
    pub trusted_keys: Vec<String>,
    /// Directory for keys installed at runtime. `None` means `<data>/trust`.
    pub trusted_keys_dir: Option<PathBuf>,
    pub enroll_token: Option<SecretString>,
    /// Whether `/api/*` routes demand a head assertion.
    pub auth_required: bool,
}

impl std::fmt::Debug for NodeTrustConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTrustConfig")
            .field("audience", &self.audience)
            .field("trusted_keys", &self.trusted_keys.len())
            .field("trusted_keys_dir", &self.trusted_keys_dir)
            .field("enroll_token", &self.enroll_token.as_ref().map(|_| "[REDACTED]"))
            .field("auth_required", &self.auth_required)
            .finish()
    }
}

/// Settings handed to the agent runner at construction.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Executable that drives the browser. Runs are refused while unset.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Keep the runner's third-party telemetry switched off.
    pub disable_telemetry: bool,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7790,
            public_url: None,
            node_id: "default".to_string(),
            base_data_dir: PathBuf::from("./data"),
            relay: RelayConfig::default(),
            defaults: TaskDefaults::default(),
            supported_models: BASE_MODELS.iter().map(|m| m.to_string()).collect(),
            schedule_check_interval: Duration::from_secs(5),
            assistance_timeout: Duration::from_secs(3600), // 1 hour
            cancel_grace: Duration::from_secs(10),
            trust: NodeTrustConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            model: "gpt-5-mini".to_string(),
            temperature: None,
            max_steps: 80,
            max_actions_per_step: 12,
            max_input_tokens: 128_000,
            use_vision: true,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            token_file: None,
            target_host: "localhost".to_string(),
            target_port: 5902,
            public_host: "localhost".to_string(),
            http_port: 6180,
            scheme: "http".to_string(),
        }
    }
}

impl Default for NodeTrustConfig {
    fn default() -> Self {
        Self {
            audience: "node".to_string(),
            trusted_keys: Vec::new(),
            trusted_keys_dir: None,
            enroll_token: None,
            auth_required: true,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            disable_telemetry: true,
            headless: false,
            window_width: 1400,
            window_height: 1100,
        }
    }
}

impl NodeConfig {
    /// Load node settings from `WEBAI_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = Self::default();
        let defaults = TaskDefaults {
            model: env_string("WEBAI_OPENAI_MODEL").unwrap_or(base.defaults.model),
            temperature: env_opt("WEBAI_OPENAI_TEMPERATURE")?,
            max_steps: env_parse("WEBAI_MAX_STEPS", base.defaults.max_steps)?,
            max_actions_per_step: env_parse(
                "WEBAI_MAX_ACTIONS_PER_STEP",
                base.defaults.max_actions_per_step,
            )?,
            max_input_tokens: env_parse("WEBAI_MAX_INPUT_TOKENS", base.defaults.max_input_tokens)?,
            use_vision: env_parse("WEBAI_USE_VISION", base.defaults.use_vision)?,
        };

        let mut supported_models = match env_string("WEBAI_SUPPORTED_MODELS") {
            Some(raw) => split_list(&raw),
            None => base.supported_models,
        };
        if !supported_models.contains(&defaults.model) {
            supported_models.push(defaults.model.clone());
        }
        supported_models.sort();
        supported_models.dedup();

        let relay = RelayConfig {
            token_file: env_string("WEBAI_VNC_TOKEN_FILE").map(PathBuf::from),
            target_host: env_string("WEBAI_VNC_TARGET_HOST").unwrap_or(base.relay.target_host),
            target_port: env_parse("WEBAI_VNC_TCP_PORT", base.relay.target_port)?,
            public_host: env_string("WEBAI_VNC_PUBLIC_HOST").unwrap_or(base.relay.public_host),
            http_port: env_parse("WEBAI_VNC_HTTP_PORT", base.relay.http_port)?,
            scheme: env_string("WEBAI_VNC_SCHEME").unwrap_or(base.relay.scheme),
        };
        if relay.scheme != "http" && relay.scheme != "https" {
            return Err(ConfigError::InvalidValue {
                key: "WEBAI_VNC_SCHEME".to_string(),
                message: format!("expected http or https, got {}", relay.scheme),
            });
        }

        let trust = NodeTrustConfig {
            audience: env_string("WEBAI_TOKEN_AUDIENCE").unwrap_or(base.trust.audience),
            trusted_keys: env_string("WEBAI_TRUSTED_KEYS")
                .map(|raw| split_keys(&raw))
                .unwrap_or_default(),
            trusted_keys_dir: env_string("WEBAI_TRUSTED_KEYS_DIR").map(PathBuf::from),
            enroll_token: env_string("WEBAI_ENROLL_TOKEN").map(SecretString::from),
            auth_required: env_parse("WEBAI_REQUIRE_AUTH", base.trust.auth_required)?,
        };

        let runner = RunnerConfig {
            command: env_string("WEBAI_RUNNER_COMMAND"),
            args: env_string("WEBAI_RUNNER_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            disable_telemetry: !env_parse("WEBAI_RUNNER_TELEMETRY", false)?,
            headless: env_parse("WEBAI_HEADLESS", base.runner.headless)?,
            window_width: env_parse("WEBAI_BROWSER_WIDTH", base.runner.window_width)?,
            window_height: env_parse("WEBAI_BROWSER_HEIGHT", base.runner.window_height)?,
        };

        Ok(Self {
            host: env_string("WEBAI_HOST").unwrap_or(base.host),
            port: env_parse("WEBAI_PORT", base.port)?,
            public_url: env_string("WEBAI_APP_URL"),
            node_id: env_string("WEBAI_NODE_ID").unwrap_or(base.node_id),
            base_data_dir: env_string("WEBAI_BASE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(base.base_data_dir),
            relay,
            defaults,
            supported_models,
            schedule_check_interval: env_secs(
                "WEBAI_SCHEDULE_CHECK_INTERVAL_SECONDS",
                base.schedule_check_interval,
            )?,
            assistance_timeout: env_secs(
                "WEBAI_ASSISTANCE_TIMEOUT_SECONDS",
                base.assistance_timeout,
            )?,
            cancel_grace: env_secs("WEBAI_CANCEL_GRACE_SECONDS", base.cancel_grace)?,
            trust,
            runner,
        })
    }

    /// A config rooted at `base_data_dir`, everything else default.
    pub fn with_data_dir(base_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_data_dir: base_data_dir.into(),
            ..Self::default()
        }
    }

    /// Base URL clients should use to reach this node.
    pub fn public_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
            .trim_end_matches('/')
            .to_string()
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.base_data_dir.join("tasks")
    }

    pub fn relay_token_file(&self) -> PathBuf {
        self.relay
            .token_file
            .clone()
            .unwrap_or_else(|| self.base_data_dir.join("vnc").join("tokens.txt"))
    }

    pub fn trusted_keys_dir(&self) -> PathBuf {
        self.trust
            .trusted_keys_dir
            .clone()
            .unwrap_or_else(|| self.base_data_dir.join("trust"))
    }

    /// Create known directories up-front so later writes never fail on a
    /// missing parent.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(self.tasks_dir())?;
        std::fs::create_dir_all(self.trusted_keys_dir())?;
        if let Some(parent) = self.relay_token_file().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

// ── Head ────────────────────────────────────────────────────────────────

/// A node the head dispatches to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadNode {
    pub id: String,
    pub name: String,
    #[serde(with = "url_string")]
    pub url: Url,
}

/// `Url` as a plain string on the wire.
mod url_string {
    use reqwest::Url;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(url: &Url, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(url.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Url, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Url::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl HeadNode {
    /// Join `path` onto the node's base URL.
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.url.as_str().trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

/// Settings for the head (coordinating) process.
#[derive(Clone)]
pub struct HeadConfig {
    pub host: String,
    pub port: u16,
    pub nodes: Vec<HeadNode>,
    pub key_dir: PathBuf,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    pub token_ttl: Duration,
    pub token_audience: String,
    pub enroll_token: Option<SecretString>,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for HeadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("nodes", &self.nodes)
            .field("key_dir", &self.key_dir)
            .field("token_ttl", &self.token_ttl)
            .field("token_audience", &self.token_audience)
            .field("enroll_token", &self.enroll_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for HeadConfig {
    fn default() -> Self {
        let key_dir = PathBuf::from("./data/head");
        Self {
            host: "0.0.0.0".to_string(),
            port: 7790,
            nodes: Vec::new(),
            private_key_path: key_dir.join("head_private.pem"),
            public_key_path: key_dir.join("head_public.pem"),
            key_dir,
            token_ttl: Duration::from_secs(120),
            token_audience: "node".to_string(),
            enroll_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HeadConfig {
    /// Load head settings from `HEAD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = Self::default();
        let key_dir = env_string("HEAD_KEY_DIR")
            .map(PathBuf::from)
            .unwrap_or(base.key_dir);
        let private_key_path = env_string("HEAD_PRIVATE_KEY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("head_private.pem"));
        let public_key_path = env_string("HEAD_PUBLIC_KEY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("head_public.pem"));

        let nodes = match env_string("HEAD_NODES") {
            Some(raw) => parse_nodes(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            host: env_string("HEAD_HOST").unwrap_or(base.host),
            port: env_parse("HEAD_PORT", base.port)?,
            nodes,
            private_key_path: place_under(&key_dir, &private_key_path),
            public_key_path: place_under(&key_dir, &public_key_path),
            key_dir,
            token_ttl: env_secs("HEAD_TOKEN_TTL", base.token_ttl)?,
            token_audience: env_string("HEAD_TOKEN_AUDIENCE").unwrap_or(base.token_audience),
            enroll_token: env_string("HEAD_ENROLL_TOKEN").map(SecretString::from),
            request_timeout: env_secs("HEAD_REQUEST_TIMEOUT", base.request_timeout)?,
        })
    }

    /// Look up a configured node by id.
    pub fn node(&self, node_id: &str) -> Option<&HeadNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

/// Relative key paths live inside the key directory unless they already
/// point there.
fn place_under(key_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() || path.starts_with(key_dir) {
        return path.to_path_buf();
    }
    match path.file_name() {
        Some(name) => key_dir.join(name),
        None => key_dir.join("key.pem"),
    }
}

/// Parse the node list.
///
/// Accepts either a JSON array of `{id?, name?, url}` objects or a
/// comma-separated list of `url|name` entries. Ids default to the name, and
/// names default to `node-<n>`.
pub fn parse_nodes(raw: &str) -> Result<Vec<HeadNode>, ConfigError> {
    #[derive(Deserialize)]
    struct RawNode {
        id: Option<String>,
        name: Option<String>,
        url: String,
    }

    let raw = raw.trim();
    let entries: Vec<(Option<String>, Option<String>, String)> = if raw.starts_with('[') {
        let parsed: Vec<RawNode> =
            serde_json::from_str(raw).map_err(|e| ConfigError::InvalidValue {
                key: "HEAD_NODES".to_string(),
                message: e.to_string(),
            })?;
        parsed.into_iter().map(|n| (n.id, n.name, n.url)).collect()
    } else {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|entry| {
                let mut parts = entry.split('|').map(str::trim).filter(|p| !p.is_empty());
                let url = parts.next()?.to_string();
                let name = parts.next().map(str::to_string);
                Some((None, name, url))
            })
            .collect()
    };

    let mut nodes = Vec::with_capacity(entries.len());
    for (idx, (id, name, url)) in entries.into_iter().enumerate() {
        let fallback = format!("node-{}", idx + 1);
        let name = name.unwrap_or_else(|| id.clone().unwrap_or_else(|| fallback.clone()));
        let id = id.unwrap_or_else(|| name.clone());
        let url = Url::parse(&url).map_err(|e| ConfigError::InvalidValue {
            key: "HEAD_NODES".to_string(),
            message: format!("{url}: {e}"),
        })?;
        if nodes.iter().any(|n: &HeadNode| n.id == id) {
            return Err(ConfigError::InvalidValue {
                key: "HEAD_NODES".to_string(),
                message: format!("duplicate node id {id}"),
            });
        }
        nodes.push(HeadNode { id, name, url });
    }
    Ok(nodes)
}

// ── Env helpers ─────────────────────────────────────────────────────────

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn env_opt<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let secs: f64 = env_parse(key, default.as_secs_f64())?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Trusted keys are separated by `;` because inline PEM contains newlines
/// but never semicolons.
fn split_keys(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nodes_pipe_syntax() {
        let nodes = parse_nodes("http://a:7790|alpha, http://b:7790").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "alpha");
        assert_eq!(nodes[0].name, "alpha");
        assert_eq!(nodes[1].id, "node-2");
        assert_eq!(nodes[1].url.as_str(), "http://b:7790/");
    }

    #[test]
    fn parse_nodes_json_syntax() {
        let nodes =
            parse_nodes(r#"[{"id": "n1", "name": "First", "url": "http://10.0.0.1:7790"}]"#)
                .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "n1");
        assert_eq!(nodes[0].name, "First");
    }

    #[test]
    fn parse_nodes_rejects_bad_url_and_duplicates() {
        assert!(parse_nodes("not a url|x").is_err());
        assert!(parse_nodes("http://a|same,http://b|same").is_err());
    }

    #[test]
    fn head_node_url_is_a_string_on_the_wire() {
        let node = &parse_nodes("http://a:7790|alpha").unwrap()[0];
        let json = serde_json::to_value(node).unwrap();
        assert_eq!(json["url"], "http://a:7790/");
        let back: HeadNode = serde_json::from_value(json).unwrap();
        assert_eq!(&back, node);
        let bad = serde_json::json!({"id": "x", "name": "x", "url": "not a url"});
        assert!(serde_json::from_value::<HeadNode>(bad).is_err());
    }

    #[test]
    fn endpoint_joins_paths() {
        let node = &parse_nodes("http://a:7790/base/|n").unwrap()[0];
        assert_eq!(node.endpoint("/api/tasks"), "http://a:7790/base/api/tasks");
        assert_eq!(node.endpoint("api/tasks"), "http://a:7790/base/api/tasks");
    }

    #[test]
    fn key_paths_land_in_key_dir() {
        let dir = Path::new("/srv/head");
        assert_eq!(
            place_under(dir, Path::new("head_private.pem")),
            PathBuf::from("/srv/head/head_private.pem")
        );
        assert_eq!(
            place_under(dir, Path::new("/etc/keys/k.pem")),
            PathBuf::from("/etc/keys/k.pem")
        );
    }

    #[test]
    fn node_defaults() {
        let config = NodeConfig::with_data_dir("/tmp/webai");
        assert_eq!(config.tasks_dir(), PathBuf::from("/tmp/webai/tasks"));
        assert_eq!(
            config.relay_token_file(),
            PathBuf::from("/tmp/webai/vnc/tokens.txt")
        );
        assert_eq!(config.assistance_timeout, Duration::from_secs(3600));
        assert!(config.trust.auth_required);
        assert!(config.runner.disable_telemetry);
        assert_eq!(config.public_url(), "http://localhost:7790");
    }
}
