use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

pub const PRIMARY_SERVER_ID: &str = "primary";
const SERVERS_JSON_VAR: &str = "LIVEKIT_SERVERS";
const DEFAULT_ADMIN_USERNAME: &str = "admin";
const DEFAULT_ADMIN_PASSWORD: &str = "changeme";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("server {0} is required")]
    MissingField(&'static str),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "no LiveKit server configurations found; set LIVEKIT_URL, LIVEKIT_API_KEY and \
         LIVEKIT_API_SECRET, or provide LIVEKIT_SERVERS JSON"
    )]
    NoServers,
    #[error("invalid LIVEKIT_SERVERS JSON: {0}")]
    InvalidServersJson(#[from] serde_json::Error),
    #[error("invalid server profile at position {index}: {source}")]
    InvalidProfile {
        index: usize,
        #[source]
        source: ProfileError,
    },
    #[error("duplicate server id '{0}' in LIVEKIT_SERVERS")]
    DuplicateServerId(String),
}

/// Raw shape of one `LIVEKIT_SERVERS` entry before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerProfileFields {
    pub id: String,
    pub name: String,
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub sip_enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Connection coordinates, credentials and capability flags for one
/// LiveKit deployment. Only constructible through [`ServerProfile::new`], so
/// every instance has non-empty required fields.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerProfile {
    id: String,
    name: String,
    url: String,
    api_key: String,
    api_secret: String,
    sip_enabled: bool,
    description: Option<String>,
}

impl ServerProfile {
    pub fn new(fields: ServerProfileFields) -> Result<Self, ProfileError> {
        let required = [
            ("id", &fields.id),
            ("name", &fields.name),
            ("url", &fields.url),
            ("api_key", &fields.api_key),
            ("api_secret", &fields.api_secret),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ProfileError::MissingField(field));
            }
        }

        Ok(Self {
            id: fields.id,
            name: fields.name,
            url: fields.url,
            api_key: fields.api_key,
            api_secret: fields.api_secret,
            sip_enabled: fields.sip_enabled,
            description: fields.description.filter(|value| !value.trim().is_empty()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }

    pub fn sip_enabled(&self) -> bool {
        self.sip_enabled
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl fmt::Debug for ServerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerProfile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("sip_enabled", &self.sip_enabled)
            .field("description", &self.description)
            .finish()
    }
}

/// Which loading strategy populated the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrySource {
    ServersJson,
    Primary,
    Numbered,
}

impl RegistrySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServersJson => "LIVEKIT_SERVERS",
            Self::Primary => "LIVEKIT_URL",
            Self::Numbered => "LIVEKIT_URL_<n>",
        }
    }
}

/// Ordered set of configured servers. Built once at startup; only the default
/// id can change afterwards.
#[derive(Debug)]
pub struct ServerRegistry {
    servers: Vec<ServerProfile>,
    default_id: RwLock<Option<String>>,
    source: RegistrySource,
}

impl ServerRegistry {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Tries the three loading strategies in priority order and keeps the
    /// first one that yields at least one server. Strategies are never merged.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(raw) = lookup(SERVERS_JSON_VAR) {
            match parse_servers_json(&raw) {
                Ok(servers) if !servers.is_empty() => {
                    return Ok(Self::with_servers(servers, RegistrySource::ServersJson));
                }
                Ok(_) => {
                    warn!("LIVEKIT_SERVERS is an empty list; falling back to LIVEKIT_URL variables")
                }
                Err(err) => {
                    warn!(error = %err, "ignoring LIVEKIT_SERVERS; falling back to LIVEKIT_URL variables")
                }
            }
        }

        if let Some(primary) = load_primary(&lookup) {
            return Ok(Self::with_servers(vec![primary], RegistrySource::Primary));
        }

        let numbered = load_numbered(&lookup);
        if !numbered.is_empty() {
            return Ok(Self::with_servers(numbered, RegistrySource::Numbered));
        }

        Err(ConfigError::NoServers)
    }

    pub(crate) fn with_servers(servers: Vec<ServerProfile>, source: RegistrySource) -> Self {
        let default_id = servers.first().map(|server| server.id.clone());
        info!(
            count = servers.len(),
            source = source.as_str(),
            default = default_id.as_deref().unwrap_or(""),
            "loaded LiveKit server registry"
        );
        Self {
            servers,
            default_id: RwLock::new(default_id),
            source,
        }
    }

    pub fn get(&self, id: &str) -> Option<&ServerProfile> {
        self.servers.iter().find(|server| server.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn list(&self) -> &[ServerProfile] {
        &self.servers
    }

    pub fn ids(&self) -> Vec<&str> {
        self.servers.iter().map(|server| server.id.as_str()).collect()
    }

    pub fn has_multiple(&self) -> bool {
        self.servers.len() > 1
    }

    pub fn source(&self) -> RegistrySource {
        self.source
    }

    pub fn default_profile(&self) -> Option<&ServerProfile> {
        let guard = self.default_id.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_deref().and_then(|id| self.get(id))
    }

    pub fn set_default(&self, id: &str) -> bool {
        if !self.contains(id) {
            return false;
        }
        let mut guard = self.default_id.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(id.to_string());
        true
    }
}

fn parse_servers_json(raw: &str) -> Result<Vec<ServerProfile>, ConfigError> {
    let entries: Vec<ServerProfileFields> = serde_json::from_str(raw)?;
    let mut servers: Vec<ServerProfile> = Vec::with_capacity(entries.len());
    for (index, fields) in entries.into_iter().enumerate() {
        let profile = ServerProfile::new(fields)
            .map_err(|source| ConfigError::InvalidProfile { index, source })?;
        if servers.iter().any(|existing| existing.id == profile.id) {
            return Err(ConfigError::DuplicateServerId(profile.id));
        }
        servers.push(profile);
    }
    Ok(servers)
}

fn load_primary<F>(lookup: &F) -> Option<ServerProfile>
where
    F: Fn(&str) -> Option<String>,
{
    let url = lookup("LIVEKIT_URL")?;
    let api_key = lookup("LIVEKIT_API_KEY")?;
    let api_secret = lookup("LIVEKIT_API_SECRET")?;
    ServerProfile::new(ServerProfileFields {
        id: PRIMARY_SERVER_ID.to_string(),
        name: "Primary Server".to_string(),
        url,
        api_key,
        api_secret,
        sip_enabled: lookup("ENABLE_SIP").is_some_and(|raw| parse_flag(&raw)),
        description: Some("Primary LiveKit server".to_string()),
    })
    .ok()
}

fn load_numbered<F>(lookup: &F) -> Vec<ServerProfile>
where
    F: Fn(&str) -> Option<String>,
{
    let mut servers = Vec::new();
    for index in 1.. {
        let (Some(url), Some(api_key), Some(api_secret)) = (
            lookup(&format!("LIVEKIT_URL_{index}")),
            lookup(&format!("LIVEKIT_API_KEY_{index}")),
            lookup(&format!("LIVEKIT_API_SECRET_{index}")),
        ) else {
            break;
        };
        let name = lookup(&format!("LIVEKIT_NAME_{index}")).unwrap_or_else(|| format!("Server {index}"));
        let sip_enabled = lookup(&format!("ENABLE_SIP_{index}")).is_some_and(|raw| parse_flag(&raw));
        let profile = ServerProfile::new(ServerProfileFields {
            id: format!("server_{index}"),
            name,
            url,
            api_key,
            api_secret,
            sip_enabled,
            description: Some(format!("LiveKit server {index}")),
        });
        match profile {
            Ok(profile) => servers.push(profile),
            Err(_) => break,
        }
    }
    servers
}

pub fn parse_flag(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}

/// Expected credentials for the login form and the Basic channel.
#[derive(Clone)]
pub struct AdminCredentials {
    username: String,
    password: String,
}

impl AdminCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Blank values count as unset; an empty password is never accepted
        // as configured.
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self::new(
            lookup("ADMIN_USERNAME").unwrap_or_else(|| DEFAULT_ADMIN_USERNAME.to_string()),
            lookup("ADMIN_PASSWORD").unwrap_or_else(|| DEFAULT_ADMIN_PASSWORD.to_string()),
        )
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn uses_defaults(&self) -> bool {
        self.username == DEFAULT_ADMIN_USERNAME || self.password == DEFAULT_ADMIN_PASSWORD
    }
}

impl Default for AdminCredentials {
    fn default() -> Self {
        Self::new(DEFAULT_ADMIN_USERNAME, DEFAULT_ADMIN_PASSWORD)
    }
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything the dashboard reads from its environment at startup.
#[derive(Debug)]
pub struct DashboardConfig {
    pub registry: ServerRegistry,
    pub credentials: AdminCredentials,
    pub debug: bool,
    pub secure_cookies: bool,
}

impl DashboardConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let registry = ServerRegistry::from_lookup(&lookup)?;
        let credentials = AdminCredentials::from_lookup(&lookup);
        Ok(Self {
            registry,
            credentials,
            debug: lookup("DEBUG").is_some_and(|raw| parse_flag(&raw)),
            secure_cookies: lookup("SESSION_COOKIE_SECURE").is_some_and(|raw| parse_flag(&raw)),
        })
    }
}

#[cfg(test)]
pub(crate) fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
    let map: std::collections::BTreeMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[cfg(test)]
pub(crate) fn test_profile(id: &str, sip_enabled: bool) -> ServerProfile {
    ServerProfile::new(ServerProfileFields {
        id: id.to_string(),
        name: format!("{id} name"),
        url: format!("wss://{id}.example.com"),
        api_key: "key".to_string(),
        api_secret: "secret-secret-secret-secret-secret".to_string(),
        sip_enabled,
        description: None,
    })
    .expect("test profile should be valid")
}

#[cfg(test)]
pub(crate) fn test_registry(ids: &[&str]) -> ServerRegistry {
    let servers = ids.iter().map(|id| test_profile(id, false)).collect();
    ServerRegistry::with_servers(servers, RegistrySource::ServersJson)
}

#[cfg(test)]
mod tests {
    use super::{
        AdminCredentials, ConfigError, DashboardConfig, PRIMARY_SERVER_ID, ProfileError,
        RegistrySource, ServerProfile, ServerProfileFields, ServerRegistry, lookup_from,
    };

    const THREE_SERVERS: &str = r#"[
        {"id": "eu", "name": "Europe", "url": "wss://eu.example.com", "api_key": "k1", "api_secret": "s1", "sip_enabled": true},
        {"id": "us", "name": "US", "url": "wss://us.example.com", "api_key": "k2", "api_secret": "s2", "description": "west"},
        {"id": "ap", "name": "Asia", "url": "wss://ap.example.com", "api_key": "k3", "api_secret": "s3"}
    ]"#;

    #[test]
    fn servers_json_loads_all_entries_with_first_as_default() {
        let registry = ServerRegistry::from_lookup(lookup_from(&[
            ("LIVEKIT_SERVERS", THREE_SERVERS),
            ("LIVEKIT_URL", "wss://ignored.example.com"),
            ("LIVEKIT_API_KEY", "ignored"),
            ("LIVEKIT_API_SECRET", "ignored"),
        ]))
        .expect("registry should load");

        assert_eq!(registry.source(), RegistrySource::ServersJson);
        assert_eq!(registry.ids(), vec!["eu", "us", "ap"]);
        assert_eq!(registry.default_profile().map(ServerProfile::id), Some("eu"));
        assert!(registry.get(PRIMARY_SERVER_ID).is_none());

        let eu = registry.get("eu").expect("eu server");
        assert!(eu.sip_enabled());
        let us = registry.get("us").expect("us server");
        assert!(!us.sip_enabled());
        assert_eq!(us.description(), Some("west"));
    }

    #[test]
    fn invalid_servers_json_falls_back_to_primary() {
        for raw in [
            "not json",
            "[]",
            r#"[{"id": "", "name": "x", "url": "u", "api_key": "k", "api_secret": "s"}]"#,
            r#"[{"id": "a", "name": "x", "url": "u", "api_key": "k", "api_secret": "s", "extra": 1}]"#,
        ] {
            let registry = ServerRegistry::from_lookup(lookup_from(&[
                ("LIVEKIT_SERVERS", raw),
                ("LIVEKIT_URL", "wss://primary.example.com"),
                ("LIVEKIT_API_KEY", "key"),
                ("LIVEKIT_API_SECRET", "secret"),
                ("ENABLE_SIP", "TRUE"),
            ]))
            .expect("primary fallback should load");

            assert_eq!(registry.source(), RegistrySource::Primary, "input: {raw}");
            assert_eq!(registry.list().len(), 1);
            let primary = registry.default_profile().expect("default server");
            assert_eq!(primary.id(), PRIMARY_SERVER_ID);
            assert_eq!(primary.name(), "Primary Server");
            assert!(primary.sip_enabled());
        }
    }

    #[test]
    fn primary_short_circuits_numbered_servers() {
        let registry = ServerRegistry::from_lookup(lookup_from(&[
            ("LIVEKIT_URL", "wss://primary.example.com"),
            ("LIVEKIT_API_KEY", "key"),
            ("LIVEKIT_API_SECRET", "secret"),
            ("LIVEKIT_URL_1", "wss://one.example.com"),
            ("LIVEKIT_API_KEY_1", "k1"),
            ("LIVEKIT_API_SECRET_1", "s1"),
        ]))
        .expect("registry should load");

        assert_eq!(registry.ids(), vec![PRIMARY_SERVER_ID]);
    }

    #[test]
    fn numbered_servers_stop_at_first_gap() {
        let registry = ServerRegistry::from_lookup(lookup_from(&[
            ("LIVEKIT_URL_1", "wss://one.example.com"),
            ("LIVEKIT_API_KEY_1", "k1"),
            ("LIVEKIT_API_SECRET_1", "s1"),
            ("LIVEKIT_NAME_1", "Staging"),
            ("LIVEKIT_URL_2", "wss://two.example.com"),
            ("LIVEKIT_API_KEY_2", "k2"),
            ("LIVEKIT_API_SECRET_2", "s2"),
            ("ENABLE_SIP_2", "true"),
            ("LIVEKIT_URL_3", "wss://three.example.com"),
            ("LIVEKIT_API_KEY_3", "k3"),
            ("LIVEKIT_API_SECRET_3", "s3"),
            ("LIVEKIT_URL_5", "wss://five.example.com"),
            ("LIVEKIT_API_KEY_5", "k5"),
            ("LIVEKIT_API_SECRET_5", "s5"),
        ]))
        .expect("registry should load");

        assert_eq!(registry.source(), RegistrySource::Numbered);
        assert_eq!(registry.ids(), vec!["server_1", "server_2", "server_3"]);
        assert_eq!(registry.default_profile().map(ServerProfile::id), Some("server_1"));
        assert_eq!(registry.get("server_1").map(ServerProfile::name), Some("Staging"));
        assert_eq!(registry.get("server_3").map(ServerProfile::name), Some("Server 3"));
        assert!(registry.get("server_2").is_some_and(ServerProfile::sip_enabled));
    }

    #[test]
    fn partial_numbered_group_counts_as_gap() {
        let registry = ServerRegistry::from_lookup(lookup_from(&[
            ("LIVEKIT_URL_1", "wss://one.example.com"),
            ("LIVEKIT_API_KEY_1", "k1"),
            ("LIVEKIT_API_SECRET_1", "s1"),
            ("LIVEKIT_URL_2", "wss://two.example.com"),
            ("LIVEKIT_API_KEY_2", "k2"),
        ]))
        .expect("registry should load");

        assert_eq!(registry.ids(), vec!["server_1"]);
    }

    #[test]
    fn missing_configuration_is_fatal() {
        let err = ServerRegistry::from_lookup(lookup_from(&[]))
            .expect_err("empty configuration must fail");
        assert!(matches!(err, ConfigError::NoServers));

        let err = ServerRegistry::from_lookup(lookup_from(&[
            ("LIVEKIT_URL", "wss://primary.example.com"),
            ("LIVEKIT_API_KEY", ""),
            ("LIVEKIT_API_SECRET", "secret"),
        ]))
        .expect_err("blank api key must not yield a server");
        assert!(err.to_string().contains("no LiveKit server configurations"));
    }

    #[test]
    fn profile_rejects_empty_required_fields() {
        let valid = ServerProfileFields {
            id: "a".to_string(),
            name: "A".to_string(),
            url: "wss://a.example.com".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            sip_enabled: false,
            description: Some("  ".to_string()),
        };
        let profile = ServerProfile::new(valid.clone()).expect("valid profile");
        assert_eq!(profile.description(), None);

        let err = ServerProfile::new(ServerProfileFields {
            api_secret: " ".to_string(),
            ..valid.clone()
        })
        .expect_err("blank secret must fail");
        assert_eq!(err, ProfileError::MissingField("api_secret"));

        let err = ServerProfile::new(ServerProfileFields {
            name: String::new(),
            ..valid
        })
        .expect_err("empty name must fail");
        assert_eq!(err, ProfileError::MissingField("name"));
    }

    #[test]
    fn duplicate_ids_reject_the_json_strategy() {
        let err = super::parse_servers_json(
            r#"[
                {"id": "a", "name": "A", "url": "u", "api_key": "k", "api_secret": "s"},
                {"id": "a", "name": "B", "url": "u", "api_key": "k", "api_secret": "s"}
            ]"#,
        )
        .expect_err("duplicate ids must fail");
        assert!(matches!(err, ConfigError::DuplicateServerId(id) if id == "a"));
    }

    #[test]
    fn set_default_only_accepts_known_ids() {
        let registry = ServerRegistry::from_lookup(lookup_from(&[(
            "LIVEKIT_SERVERS",
            THREE_SERVERS,
        )]))
        .expect("registry should load");

        assert!(!registry.set_default("missing"));
        assert_eq!(registry.default_profile().map(ServerProfile::id), Some("eu"));
        assert!(registry.set_default("ap"));
        assert_eq!(registry.default_profile().map(ServerProfile::id), Some("ap"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let registry = ServerRegistry::from_lookup(lookup_from(&[(
            "LIVEKIT_SERVERS",
            THREE_SERVERS,
        )]))
        .expect("registry should load");
        let rendered = format!("{registry:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("\"s1\""));

        let creds = AdminCredentials::new("root", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn admin_credentials_default_and_override() {
        let defaults = AdminCredentials::from_lookup(lookup_from(&[]));
        assert_eq!(defaults.username(), "admin");
        assert_eq!(defaults.password(), "changeme");
        assert!(defaults.uses_defaults());

        let custom = AdminCredentials::from_lookup(lookup_from(&[
            ("ADMIN_USERNAME", "ops"),
            ("ADMIN_PASSWORD", "long-random-password"),
        ]));
        assert_eq!(custom.username(), "ops");
        assert!(!custom.uses_defaults());
    }

    #[test]
    fn blank_admin_credentials_fall_back_to_defaults() {
        let blank = AdminCredentials::from_lookup(lookup_from(&[
            ("ADMIN_USERNAME", ""),
            ("ADMIN_PASSWORD", "   "),
        ]));
        assert_eq!(blank.username(), "admin");
        assert_eq!(blank.password(), "changeme");
        assert!(blank.uses_defaults());

        let gateway = crate::auth::AuthGateway::new(blank);
        assert!(!gateway.verify_credentials("admin", ""));
    }

    #[test]
    fn dashboard_config_reads_flags() {
        let cfg = DashboardConfig::from_lookup(lookup_from(&[
            ("LIVEKIT_URL", "wss://primary.example.com"),
            ("LIVEKIT_API_KEY", "key"),
            ("LIVEKIT_API_SECRET", "secret"),
            ("DEBUG", "True"),
            ("SESSION_COOKIE_SECURE", "yes"),
        ]))
        .expect("config should load");
        assert!(cfg.debug);
        assert!(!cfg.secure_cookies);
        assert_eq!(cfg.registry.list().len(), 1);
    }
}
