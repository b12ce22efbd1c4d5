use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Export fields every client mapping must cover.
pub const REQUIRED_EXPORT_FIELDS: [&str; 9] = [
    "full_name",
    "address_line_1",
    "address_line_2",
    "town_city",
    "county",
    "postcode",
    "country",
    "service",
    "weight_kg",
];

/// Export fields a mapping may cover in addition to the required set.
pub const OPTIONAL_EXPORT_FIELDS: [&str; 3] = ["reference", "phone", "email"];

// ── Risk level ────────────────────────────────────────────────────────────────

/// Ceiling for automatically applied record corrections.
///
/// Routed opaquely from the CLI through the daemon into the pipeline and
/// recorded in each batch manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => bail!("invalid risk level: {other} (expected low, medium, or high)"),
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Event-source backend ──────────────────────────────────────────────────────

/// Which filesystem notification backend the daemon runs.
///
/// | Backend  | Behaviour                                              |
/// |----------|--------------------------------------------------------|
/// | `notify` | Native OS notifications (inotify / FSEvents / ReadDirectoryChangesW). |
/// | `poll`   | Periodic directory sweep; works on network shares where native events are unreliable. |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchBackend {
    #[default]
    Notify,
    Poll,
}

impl std::str::FromStr for WatchBackend {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "notify" => Ok(WatchBackend::Notify),
            "poll" => Ok(WatchBackend::Poll),
            other => bail!("invalid watch backend: {other} (expected notify or poll)"),
        }
    }
}

// ── Daemon section ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub use_telegram: bool,
    pub use_ai: bool,
    pub auto_apply_max_risk: RiskLevel,
    pub max_ai_calls: u32,
    pub recursive: bool,
    pub backend: WatchBackend,
    /// Directory for rolling logs, batch manifests, and the intake ledger.
    /// Overridden at load time by the `DROPLINE_LOG_DIR` environment variable.
    pub log_dir: String,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            use_telegram: true,
            use_ai: false,
            auto_apply_max_risk: RiskLevel::Low,
            max_ai_calls: 50,
            recursive: false,
            backend: WatchBackend::Notify,
            log_dir: "logs".to_string(),
        }
    }
}

// ── Watch tuning section ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    /// Consecutive equal-size polls required before a file counts as stable.
    pub stable_checks: u32,
    pub stable_delay_ms: u64,
    pub stable_timeout_ms: u64,
    /// Duplicate-notification suppression window.
    pub recent_ttl_secs: u64,
    pub recent_max: usize,
    /// Sweep interval for the `poll` backend.
    pub poll_interval_ms: u64,
    /// Capacity of the raw-notification channel between the event source and
    /// the watch service.
    pub queue_cap: usize,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            stable_checks: 3,
            stable_delay_ms: 400,
            stable_timeout_ms: 10_000,
            recent_ttl_secs: 300,
            recent_max: 500,
            poll_interval_ms: 2_000,
            queue_cap: 512,
        }
    }
}

// ── Telegram section ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSection {
    pub allowlist_path: String,
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            allowlist_path: "config/telegram_allowlist.json".to_string(),
        }
    }
}

// ── Client tables ─────────────────────────────────────────────────────────────

/// What causes a service rule to match a batch chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trigger {
    /// Matches when the tag appears in the chunk (word-bounded or bracketed),
    /// or when a `SERVICE=<tag>` override names it.
    Tag { tag: String },
    /// Used when no tag rule matches.
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRule {
    pub name: String,
    /// Carrier service code, carried through to exports when present.
    #[serde(default)]
    pub code: Option<String>,
    pub trigger: Trigger,
}

impl ServiceRule {
    pub fn trigger_tag(&self) -> Option<&str> {
        match &self.trigger {
            Trigger::Tag { tag } => Some(tag.as_str()),
            Trigger::Default => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDefaults {
    pub service: String,
    pub weight_kg: f64,
    #[serde(default)]
    pub country: Option<String>,
    /// When set, records without an explicit reference are numbered
    /// `<prefix><n>` in batch order.
    #[serde(default)]
    pub reference_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSettings {
    /// Field name to 1-based output column index.
    pub column_mapping: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderOverrides {
    pub inbox: Option<String>,
    pub ready: Option<String>,
    pub archive: Option<String>,
    pub tracking: Option<String>,
    pub quarantine: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
    pub display_name: String,
    pub defaults: ClientDefaults,
    pub services: Vec<ServiceRule>,
    pub export: ExportSettings,
    #[serde(default)]
    pub folders: FolderOverrides,
}

// ── Resolved client view ──────────────────────────────────────────────────────

/// Per-client directory set after override/default resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFolders {
    pub inbox: PathBuf,
    pub ready: PathBuf,
    pub archive: PathBuf,
    pub tracking: PathBuf,
    pub quarantine: PathBuf,
}

/// A client's configuration with folders resolved to concrete paths.
/// Built once at startup and treated as immutable afterwards.
#[derive(Debug, Clone)]
pub struct ResolvedClient {
    pub client_id: String,
    pub display_name: String,
    pub defaults: ClientDefaults,
    pub services: Vec<ServiceRule>,
    pub export: ExportSettings,
    pub folders: ClientFolders,
}

fn resolve_folder(base: &Path, value: Option<&str>, default_name: &str) -> PathBuf {
    match value {
        None => base.join(default_name),
        Some(raw) => {
            let candidate = Path::new(raw);
            if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                base.join(candidate)
            }
        }
    }
}

/// Client ids are `client_` followed by exactly two digits.
pub fn is_valid_client_id(id: &str) -> bool {
    match id.strip_prefix("client_") {
        Some(rest) => rest.len() == 2 && rest.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

// ── App config ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base directory under which per-client folder defaults are created.
    pub clients_root: String,
    pub daemon: DaemonSection,
    pub watch: WatchSection,
    pub telegram: TelegramSection,
    pub clients: BTreeMap<String, ClientEntry>,
}

impl AppConfig {
    /// Load and parse the config file. A missing file is an error: the daemon
    /// cannot do anything useful without client tables, so configuration
    /// problems surface at startup rather than at first ingestion.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        if let Ok(dir) = env::var("DROPLINE_LOG_DIR") {
            if !dir.is_empty() {
                config.daemon.log_dir = dir;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Sorted client ids.
    pub fn client_ids(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    /// Structural validation beyond what deserialization enforces.
    pub fn validate(&self) -> Result<()> {
        for (client_id, entry) in &self.clients {
            if !is_valid_client_id(client_id) {
                bail!("invalid client id format: {client_id} (expected client_NN)");
            }
            if entry.display_name.trim().is_empty() {
                bail!("client {client_id} display_name must not be empty");
            }
            if entry.defaults.service.trim().is_empty() {
                bail!("client {client_id} defaults.service must not be empty");
            }
            if entry.defaults.weight_kg <= 0.0 {
                bail!("client {client_id} defaults.weight_kg must be positive");
            }
            if entry.services.is_empty() {
                bail!("client {client_id} services must be a non-empty list");
            }
            for (idx, service) in entry.services.iter().enumerate() {
                if service.name.trim().is_empty() {
                    bail!("client {client_id} service entry {} missing name", idx + 1);
                }
                if let Trigger::Tag { tag } = &service.trigger {
                    if tag.trim().is_empty() {
                        bail!(
                            "client {client_id} service entry {} tag trigger missing tag",
                            idx + 1
                        );
                    }
                }
            }

            let mapping = &entry.export.column_mapping;
            let missing: Vec<&str> = REQUIRED_EXPORT_FIELDS
                .iter()
                .copied()
                .filter(|field| !mapping.contains_key(*field))
                .collect();
            if !missing.is_empty() {
                bail!(
                    "client {client_id} export.column_mapping missing fields: {}",
                    missing.join(", ")
                );
            }
            for (field, column) in mapping {
                let known = REQUIRED_EXPORT_FIELDS.contains(&field.as_str())
                    || OPTIONAL_EXPORT_FIELDS.contains(&field.as_str());
                if !known {
                    continue;
                }
                if *column < 1 {
                    bail!("client {client_id} export.column_mapping for '{field}' must be >= 1");
                }
            }
        }

        Ok(())
    }

    /// Resolve one client's settings, folder overrides applied.
    pub fn resolve_client(&self, client_id: &str) -> Result<ResolvedClient> {
        let entry = self
            .clients
            .get(client_id)
            .with_context(|| format!("client id not found: {client_id}"))?;

        let base = Path::new(&self.clients_root).join(client_id);
        let overrides = &entry.folders;
        let folders = ClientFolders {
            inbox: resolve_folder(&base, overrides.inbox.as_deref(), "INBOX"),
            ready: resolve_folder(&base, overrides.ready.as_deref(), "READY"),
            archive: resolve_folder(&base, overrides.archive.as_deref(), "ARCHIVE"),
            tracking: resolve_folder(&base, overrides.tracking.as_deref(), "TRACKING"),
            quarantine: resolve_folder(&base, overrides.quarantine.as_deref(), "QUARANTINE"),
        };

        Ok(ResolvedClient {
            client_id: client_id.to_string(),
            display_name: entry.display_name.clone(),
            defaults: entry.defaults.clone(),
            services: entry.services.clone(),
            export: entry.export.clone(),
            folders,
        })
    }

    /// A one-client starter config, written by `dropline init`.
    pub fn starter() -> Self {
        let mut clients = BTreeMap::new();
        clients.insert(
            "client_01".to_string(),
            ClientEntry {
                display_name: "First Client".to_string(),
                defaults: ClientDefaults {
                    service: "tracked48".to_string(),
                    weight_kg: 0.5,
                    country: Some("UNITED KINGDOM".to_string()),
                    reference_prefix: None,
                },
                services: vec![
                    ServiceRule {
                        name: "tracked24".to_string(),
                        code: Some("T24".to_string()),
                        trigger: Trigger::Tag {
                            tag: "T24".to_string(),
                        },
                    },
                    ServiceRule {
                        name: "tracked48".to_string(),
                        code: Some("T48".to_string()),
                        trigger: Trigger::Default,
                    },
                ],
                export: ExportSettings {
                    column_mapping: REQUIRED_EXPORT_FIELDS
                        .iter()
                        .chain(["reference"].iter())
                        .enumerate()
                        .map(|(idx, field)| (field.to_string(), idx as u32 + 1))
                        .collect(),
                },
                folders: FolderOverrides::default(),
            },
        );

        Self {
            clients_root: "clients".to_string(),
            clients,
            ..Self::default()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("dropline.toml");
        fs::write(&path, body).unwrap();
        path
    }

    const MINIMAL: &str = r#"
clients_root = "/srv/clients"

[clients.client_01]
display_name = "Acme"

[clients.client_01.defaults]
service = "tracked48"
weight_kg = 0.75

[[clients.client_01.services]]
name = "tracked24"
code = "T24"
trigger = { type = "tag", tag = "T24" }

[[clients.client_01.services]]
name = "tracked48"
trigger = { type = "default" }

[clients.client_01.export]
column_mapping = { full_name = 1, address_line_1 = 2, address_line_2 = 3, town_city = 4, county = 5, postcode = 6, country = 7, service = 8, weight_kg = 9 }
"#;

    // ── defaults ───────────────────────────────────────────────────────────

    #[test]
    fn daemon_defaults() {
        let cfg = AppConfig::default();
        assert!(cfg.daemon.use_telegram);
        assert!(!cfg.daemon.use_ai);
        assert_eq!(cfg.daemon.auto_apply_max_risk, RiskLevel::Low);
        assert_eq!(cfg.daemon.max_ai_calls, 50);
        assert!(!cfg.daemon.recursive);
        assert_eq!(cfg.daemon.backend, WatchBackend::Notify);
        assert_eq!(cfg.daemon.log_dir, "logs");
    }

    #[test]
    fn watch_defaults_match_stability_contract() {
        let watch = WatchSection::default();
        assert_eq!(watch.stable_checks, 3);
        assert_eq!(watch.stable_delay_ms, 400);
        assert_eq!(watch.stable_timeout_ms, 10_000);
        assert_eq!(watch.recent_ttl_secs, 300);
        assert_eq!(watch.recent_max, 500);
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = AppConfig::load_from(dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }

    #[test]
    fn load_minimal_and_validate() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL);
        let cfg = AppConfig::load_from(&path).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.client_ids(), vec!["client_01".to_string()]);
        let entry = &cfg.clients["client_01"];
        assert_eq!(entry.services[0].trigger_tag(), Some("T24"));
        assert_eq!(entry.services[1].trigger, Trigger::Default);
    }

    #[test]
    fn load_invalid_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "not valid {{{{");
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn env_log_dir_overrides_file_value() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL);
        // SAFETY: no other test writes this variable.
        unsafe { env::set_var("DROPLINE_LOG_DIR", "/var/log/dropline") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.daemon.log_dir, "/var/log/dropline");
        unsafe { env::remove_var("DROPLINE_LOG_DIR") };
    }

    // ── validation ─────────────────────────────────────────────────────────

    #[test]
    fn validate_rejects_bad_client_id() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &MINIMAL.replace("client_01", "acme"));
        let cfg = AppConfig::load_from(&path).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid client id"));
    }

    #[test]
    fn validate_rejects_empty_services() {
        let mut cfg = AppConfig::starter();
        cfg.clients.get_mut("client_01").unwrap().services.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("non-empty"));
    }

    #[test]
    fn validate_rejects_blank_trigger_tag() {
        let mut cfg = AppConfig::starter();
        cfg.clients.get_mut("client_01").unwrap().services[0].trigger =
            Trigger::Tag { tag: "  ".to_string() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("missing tag"));
    }

    #[test]
    fn validate_rejects_incomplete_column_mapping() {
        let mut cfg = AppConfig::starter();
        cfg.clients
            .get_mut("client_01")
            .unwrap()
            .export
            .column_mapping
            .remove("postcode");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("postcode"));
    }

    #[test]
    fn validate_rejects_zero_column_index() {
        let mut cfg = AppConfig::starter();
        cfg.clients
            .get_mut("client_01")
            .unwrap()
            .export
            .column_mapping
            .insert("service".to_string(), 0);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must be >= 1"));
    }

    #[test]
    fn tag_trigger_without_tag_fails_to_parse() {
        let broken = MINIMAL.replace(r#"{ type = "tag", tag = "T24" }"#, r#"{ type = "tag" }"#);
        assert!(toml::from_str::<AppConfig>(&broken).is_err());
    }

    // ── client id pattern ──────────────────────────────────────────────────

    #[test]
    fn client_id_pattern() {
        assert!(is_valid_client_id("client_01"));
        assert!(is_valid_client_id("client_99"));
        assert!(!is_valid_client_id("client_1"));
        assert!(!is_valid_client_id("client_001"));
        assert!(!is_valid_client_id("client_ab"));
        assert!(!is_valid_client_id("customer_01"));
        assert!(!is_valid_client_id(""));
    }

    // ── folder resolution ──────────────────────────────────────────────────

    #[test]
    fn folders_default_under_clients_root() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL);
        let cfg = AppConfig::load_from(&path).unwrap();
        let resolved = cfg.resolve_client("client_01").unwrap();
        let base = Path::new("/srv/clients/client_01");
        assert_eq!(resolved.folders.inbox, base.join("INBOX"));
        assert_eq!(resolved.folders.ready, base.join("READY"));
        assert_eq!(resolved.folders.archive, base.join("ARCHIVE"));
        assert_eq!(resolved.folders.tracking, base.join("TRACKING"));
        assert_eq!(resolved.folders.quarantine, base.join("QUARANTINE"));
    }

    #[test]
    fn folder_overrides_relative_and_absolute() {
        let body = format!(
            "{MINIMAL}\n[clients.client_01.folders]\ninbox = \"drops\"\narchive = \"/mnt/archive\"\n"
        );
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &body);
        let cfg = AppConfig::load_from(&path).unwrap();
        let resolved = cfg.resolve_client("client_01").unwrap();
        assert_eq!(
            resolved.folders.inbox,
            Path::new("/srv/clients/client_01/drops")
        );
        assert_eq!(resolved.folders.archive, Path::new("/mnt/archive"));
        // Untouched folders still get defaults.
        assert_eq!(
            resolved.folders.quarantine,
            Path::new("/srv/clients/client_01/QUARANTINE")
        );
    }

    #[test]
    fn resolve_unknown_client_is_an_error() {
        let cfg = AppConfig::starter();
        assert!(cfg.resolve_client("client_77").is_err());
    }

    // ── starter + roundtrip ────────────────────────────────────────────────

    #[test]
    fn starter_config_validates_and_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/dropline.toml");

        let cfg = AppConfig::starter();
        cfg.validate().unwrap();
        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        loaded.validate().unwrap();
        assert_eq!(loaded.client_ids(), vec!["client_01".to_string()]);
        assert_eq!(loaded.clients["client_01"].defaults.service, "tracked48");
    }

    // ── RiskLevel ──────────────────────────────────────────────────────────

    #[test]
    fn risk_level_parse_and_order() {
        assert_eq!("low".parse::<RiskLevel>().unwrap(), RiskLevel::Low);
        assert_eq!("MEDIUM".parse::<RiskLevel>().unwrap(), RiskLevel::Medium);
        assert_eq!(" high ".parse::<RiskLevel>().unwrap(), RiskLevel::High);
        assert!("extreme".parse::<RiskLevel>().is_err());
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
    }

    #[test]
    fn risk_level_serde_roundtrip() {
        for (level, label) in [
            (RiskLevel::Low, "\"low\""),
            (RiskLevel::Medium, "\"medium\""),
            (RiskLevel::High, "\"high\""),
        ] {
            let json = serde_json::to_string(&level).unwrap();
            assert_eq!(json, label);
            let back: RiskLevel = serde_json::from_str(&json).unwrap();
            assert_eq!(back, level);
        }
    }
}
