use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

/// validated coordination config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationConfig {
    /// `host:port` of every coordination service member
    pub hosts: Vec<String>,
    /// how long the initial session may take to establish
    pub session_timeout: Duration,
    pub region: String,
    pub cluster: String,
    pub service_type: String,
    /// identifies this instance in the lock and in parties
    pub service_id: String,
    /// `None` waits for the lock forever
    pub lock_timeout: Option<Duration>,
    pub retry: RetryConfig,
    pub cache_poll_interval: Duration,
    pub shared_caches: Vec<SharedCacheConfig>,
    pub party: PartyConfig,
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// `None` retries forever
    pub max_retries: Option<u32>,
    /// `None` waits for a connection forever
    pub connect_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedCacheConfig {
    pub path: String,
    pub expire_after: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyConfig {
    /// absolute base path, defaults to the namespace prefix
    pub prefix: Option<String>,
    /// join on setup and again after every session loss; when false the
    /// party is only observed and this instance never becomes a member
    pub autojoin: bool,
}

impl CoordinationConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )?;
        config.path = Some(path.to_path_buf());
        debug!(?config);
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let config = Self::new(s)?;
        debug!(?config);
        Ok(config)
    }

    fn new<S: AsRef<str>>(input: S) -> Result<Self> {
        Self::try_from(parse_wire(input)?)
    }

    /// file the config was loaded from, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// `/<region>-<cluster>/<service-type>`
    pub fn prefix(&self) -> String {
        format!("/{}-{}/{}", self.region, self.cluster, self.service_type)
    }
}

/// decode the wire format, JSON first then YAML
pub fn parse_wire<S: AsRef<str>>(input: S) -> Result<wire::Config> {
    let input = input.as_ref();
    match serde_json::from_str::<wire::Config>(input) {
        Ok(cfg) => Ok(cfg),
        Err(_err) => serde_yaml::from_str::<wire::Config>(input).context("config is neither valid JSON nor YAML"),
    }
}

impl From<wire::Retry> for RetryConfig {
    fn from(retry: wire::Retry) -> Self {
        Self {
            max_retries: retry.max_retries,
            connect_timeout: retry.connect_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl TryFrom<wire::Config> for CoordinationConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: wire::Config) -> Result<Self> {
        for (field, value) in [
            ("region", &cfg.region),
            ("cluster", &cfg.cluster),
            ("service_type", &cfg.service_type),
            ("service_id", &cfg.service_id),
        ] {
            if value.trim().is_empty() {
                bail!("{field} must not be empty");
            }
            if value.contains('/') {
                bail!("{field} must not contain '/': {value:?}");
            }
        }

        let hosts = cfg
            .hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if hosts.is_empty() {
            bail!("hosts must list at least one coordination service member");
        }

        if cfg.session_timeout_ms == 0 {
            bail!("session_timeout_ms must be positive");
        }
        if cfg.cache_poll_interval_ms == 0 {
            bail!("cache_poll_interval_ms must be positive");
        }
        if cfg.lock_timeout_ms == Some(0) {
            bail!("lock_timeout_ms must be positive or null");
        }
        if cfg.retry.connect_timeout_ms == Some(0) {
            bail!("retry.connect_timeout_ms must be positive or null");
        }

        let mut seen = HashSet::new();
        let mut shared_caches = Vec::with_capacity(cfg.shared_caches.len());
        for cache in cfg.shared_caches {
            let path = cache.path.trim_end_matches('/').to_owned();
            if path.is_empty() || path.starts_with('/') {
                bail!("shared cache path must be relative and non-empty: {:?}", cache.path);
            }
            if path.split('/').any(str::is_empty) {
                bail!("shared cache path contains an empty component: {:?}", cache.path);
            }
            if !seen.insert(path.clone()) {
                bail!("duplicate shared cache path {path:?}");
            }
            shared_caches.push(SharedCacheConfig {
                path,
                expire_after: cache
                    .expire_after
                    .map(|secs| Duration::from_secs(u64::from(secs.get()))),
            });
        }

        if let Some(prefix) = &cfg.party.prefix {
            if !prefix.starts_with('/') {
                bail!("party prefix must be an absolute path: {prefix:?}");
            }
        }

        Ok(Self {
            hosts,
            session_timeout: Duration::from_millis(cfg.session_timeout_ms),
            region: cfg.region,
            cluster: cfg.cluster,
            service_type: cfg.service_type,
            service_id: cfg.service_id,
            lock_timeout: cfg.lock_timeout_ms.map(Duration::from_millis),
            retry: cfg.retry.into(),
            cache_poll_interval: Duration::from_millis(cfg.cache_poll_interval_ms),
            shared_caches,
            party: PartyConfig {
                prefix: cfg.party.prefix,
                autojoin: cfg.party.autojoin,
            },
            path: None,
        })
    }
}
