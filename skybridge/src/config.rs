use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bridge_store::BridgeKind;
use url::Url;

const ENV_PREFIX: &str = "SKYBRIDGE_";

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Service configuration, resolved once at boot from the environment.
#[derive(Debug, Clone)]
pub struct Conf {
    pub hostname: String,
    pub port: u16,
    /// Base URL under which this service is reachable from the Fediverse.
    pub public_url: Url,
    pub pds_url: Url,
    pub pds_hostname: String,
    pub pds_admin_token: Option<String>,
    pub db_location: String,
    pub firehose: FirehoseConf,
    pub mastodon_bridge: Option<BridgeConf>,
    pub bluesky_bridge: Option<BridgeConf>,
    pub constellation: Option<ConstellationConf>,
    pub app_view_url: Option<Url>,
    /// Test-only escape hatch allowing deliveries and blob fetches to
    /// private addresses.
    pub allow_private_address: bool,
    pub log_directive: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FirehoseConf {
    pub enabled: bool,
    /// Resume point (sequence number) for the first connection.
    pub cursor: Option<i64>,
}

/// One bridge-account provisioning section (`MASTODON_BRIDGE_…` or
/// `BLUESKY_BRIDGE_…`); present only when the section is enabled.
#[derive(Debug, Clone)]
pub struct BridgeConf {
    pub kind: BridgeKind,
    pub handle: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct ConstellationConf {
    pub url: Url,
    pub poll_interval: Duration,
}

impl Conf {
    pub fn from_env() -> anyhow::Result<Self> {
        let hostname = env_str("HOSTNAME")?.unwrap_or_else(|| "localhost".to_owned());
        let port = env_parse::<u16>("PORT")?.unwrap_or(DEFAULT_PORT);

        let public_url = match env_str("PUBLIC_URL")? {
            Some(raw) => Url::parse(&raw).context("invalid PUBLIC_URL")?,
            None => Url::parse(&format!("http://{hostname}:{port}")).context("failed to build public URL")?,
        };

        let pds_url = Url::parse(
            &env_str("PDS_URL")?.unwrap_or_else(|| "http://localhost:2583".to_owned()),
        )
        .context("invalid PDS_URL")?;

        let pds_hostname = match env_str("PDS_HOSTNAME")? {
            Some(hostname) => hostname,
            None => pds_url
                .host_str()
                .context("PDS_URL has no host and PDS_HOSTNAME is not set")?
                .to_owned(),
        };

        let constellation = match env_str("CONSTELLATION_URL")? {
            Some(raw) => Some(ConstellationConf {
                url: Url::parse(&raw).context("invalid CONSTELLATION_URL")?,
                poll_interval: Duration::from_secs(
                    env_parse::<u64>("CONSTELLATION_POLL_INTERVAL")?.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
                ),
            }),
            None => None,
        };

        let app_view_url = env_str("APP_VIEW_URL")?
            .map(|raw| Url::parse(&raw).context("invalid APP_VIEW_URL"))
            .transpose()?;

        Ok(Conf {
            hostname,
            port,
            public_url,
            pds_url,
            pds_hostname,
            pds_admin_token: env_str("PDS_ADMIN_TOKEN")?,
            db_location: env_str("DB_LOCATION")?.unwrap_or_else(|| "skybridge.db".to_owned()),
            firehose: FirehoseConf {
                enabled: env_bool("FIREHOSE_ENABLED")?.unwrap_or(true),
                cursor: env_parse::<i64>("FIREHOSE_CURSOR")?,
            },
            mastodon_bridge: bridge_section(BridgeKind::Mastodon, "MASTODON_BRIDGE")?,
            bluesky_bridge: bridge_section(BridgeKind::Bluesky, "BLUESKY_BRIDGE")?,
            constellation,
            app_view_url,
            allow_private_address: env_bool("ALLOW_PRIVATE_ADDRESS")?.unwrap_or(false),
            log_directive: env_str("LOG_DIRECTIVE")?,
        })
    }
}

fn bridge_section(kind: BridgeKind, prefix: &str) -> anyhow::Result<Option<BridgeConf>> {
    if !env_bool(&format!("{prefix}_ENABLED"))?.unwrap_or(false) {
        return Ok(None);
    }

    let handle = env_str(&format!("{prefix}_HANDLE"))?
        .with_context(|| format!("{ENV_PREFIX}{prefix}_HANDLE is required when the section is enabled"))?;

    let avatar_url = env_str(&format!("{prefix}_AVATAR_URL"))?
        .map(|raw| Url::parse(&raw).with_context(|| format!("invalid {ENV_PREFIX}{prefix}_AVATAR_URL")))
        .transpose()?;

    Ok(Some(BridgeConf {
        kind,
        handle,
        display_name: env_str(&format!("{prefix}_DISPLAY_NAME"))?,
        description: env_str(&format!("{prefix}_DESCRIPTION"))?,
        avatar_url,
    }))
}

fn env_str(key: &str) -> anyhow::Result<Option<String>> {
    match env::var(format!("{ENV_PREFIX}{key}")) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(error) => Err(error).with_context(|| format!("failed to read {ENV_PREFIX}{key}")),
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: core::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_str(key)?
        .map(|value| value.parse::<T>().with_context(|| format!("invalid {ENV_PREFIX}{key}")))
        .transpose()
}

fn env_bool(key: &str) -> anyhow::Result<Option<bool>> {
    let Some(value) = env_str(key)? else {
        return Ok(None);
    };

    match value.as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => anyhow::bail!("invalid boolean for {ENV_PREFIX}{key}: {value}"),
    }
}

/// Cheaply cloneable handle over the resolved configuration.
#[derive(Clone, Debug)]
pub struct ConfHandle(Arc<Conf>);

impl ConfHandle {
    /// Resolves the configuration from the environment.
    ///
    /// A parse failure here aborts boot; there is no partially-configured
    /// mode.
    pub fn init() -> anyhow::Result<Self> {
        Conf::from_env().map(Arc::new).map(Self)
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        Arc::clone(&self.0)
    }
}

impl From<Conf> for ConfHandle {
    fn from(conf: Conf) -> Self {
        Self(Arc::new(conf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_section_disabled_by_default() {
        // No SKYBRIDGE_MASTODON_BRIDGE_ENABLED in the environment.
        let section = bridge_section(BridgeKind::Mastodon, "MASTODON_BRIDGE_TEST_UNSET").unwrap();
        assert!(section.is_none());
    }
}
