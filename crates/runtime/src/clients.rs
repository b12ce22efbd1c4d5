//! Per-client watch entries, built once at daemon start.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use dropline_config::{AppConfig, ResolvedClient};
use tracing::{info, warn};

/// One client's resolved settings plus the folders the daemon touches
/// directly. Folder paths are absolutized here so event paths from the
/// watcher can be routed by plain prefix matching.
#[derive(Debug, Clone)]
pub struct ClientWatch {
    pub client: ResolvedClient,
    inbox: PathBuf,
    archive: PathBuf,
    quarantine: PathBuf,
}

fn absolutize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

impl ClientWatch {
    pub fn new(client: ResolvedClient) -> Self {
        let inbox = absolutize(&client.folders.inbox);
        let archive = absolutize(&client.folders.archive);
        let quarantine = absolutize(&client.folders.quarantine);
        Self {
            client,
            inbox,
            archive,
            quarantine,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client.client_id
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    pub fn quarantine(&self) -> &Path {
        &self.quarantine
    }

    /// True when `path` sits inside this client's inbound folder.
    pub fn owns(&self, path: &Path) -> bool {
        path.starts_with(&self.inbox)
    }

    fn ensure_folders(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.inbox)?;
        fs::create_dir_all(&self.archive)?;
        fs::create_dir_all(&self.quarantine)?;
        Ok(())
    }
}

/// Resolve the clients the daemon should watch and create their folders.
///
/// `only` limits the set to the named ids (the `--clients` flag); `None`
/// watches every configured client. Naming an unknown client is an error,
/// while a client whose folders cannot be created is skipped with a warning
/// so one bad mount does not take down the rest.
pub fn build_client_watches(
    config: &AppConfig,
    only: Option<&[String]>,
) -> Result<Vec<ClientWatch>> {
    let ids: Vec<String> = match only {
        None => config.client_ids(),
        Some(list) => list.to_vec(),
    };

    let mut watches = Vec::new();
    for client_id in &ids {
        let client = config
            .resolve_client(client_id)
            .with_context(|| format!("resolving client {client_id}"))?;
        let watch = ClientWatch::new(client);
        if let Err(err) = watch.ensure_folders() {
            warn!(
                client = %client_id,
                error = %err,
                "skipping client, folders cannot be created"
            );
            continue;
        }
        info!(
            client = %client_id,
            inbox = %watch.inbox().display(),
            "watching client folder"
        );
        watches.push(watch);
    }

    if watches.is_empty() {
        bail!("no watchable clients configured");
    }
    Ok(watches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use dropline_config::{
        ClientDefaults, ClientEntry, DaemonSection, ExportSettings, FolderOverrides,
        REQUIRED_EXPORT_FIELDS, ServiceRule, TelegramSection, Trigger, WatchSection,
    };
    use tempfile::TempDir;

    fn client_entry(name: &str) -> ClientEntry {
        let column_mapping: BTreeMap<String, u32> = REQUIRED_EXPORT_FIELDS
            .iter()
            .enumerate()
            .map(|(idx, field)| (field.to_string(), idx as u32 + 1))
            .collect();
        ClientEntry {
            display_name: name.to_string(),
            defaults: ClientDefaults {
                service: "tracked48".to_string(),
                weight_kg: 1.0,
                country: None,
                reference_prefix: None,
            },
            services: vec![ServiceRule {
                name: "tracked48".to_string(),
                code: None,
                trigger: Trigger::Default,
            }],
            export: ExportSettings { column_mapping },
            folders: FolderOverrides::default(),
        }
    }

    fn sample_config(root: &Path) -> AppConfig {
        let mut clients = BTreeMap::new();
        clients.insert("client_01".to_string(), client_entry("First Client"));
        clients.insert("client_02".to_string(), client_entry("Second Client"));
        AppConfig {
            clients_root: root.join("clients").display().to_string(),
            daemon: DaemonSection {
                use_telegram: false,
                log_dir: root.join("logs").display().to_string(),
                ..Default::default()
            },
            watch: WatchSection::default(),
            telegram: TelegramSection::default(),
            clients,
        }
    }

    #[test]
    fn builds_watches_and_creates_folders() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path());

        let watches = build_client_watches(&config, None).unwrap();
        assert_eq!(watches.len(), 2);
        for watch in &watches {
            assert!(watch.inbox().is_dir());
            assert!(watch.archive().is_dir());
            assert!(watch.quarantine().is_dir());
            assert!(watch.inbox().is_absolute());
        }
    }

    #[test]
    fn selection_limits_the_watch_set() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path());

        let only = vec!["client_02".to_string()];
        let watches = build_client_watches(&config, Some(&only)).unwrap();
        assert_eq!(watches.len(), 1);
        assert_eq!(watches[0].client_id(), "client_02");
    }

    #[test]
    fn unknown_client_selection_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path());

        let only = vec!["client_99".to_string()];
        let err = build_client_watches(&config, Some(&only)).unwrap_err();
        assert!(err.to_string().contains("client_99"));
    }

    #[test]
    fn unusable_folders_skip_the_client() {
        let dir = TempDir::new().unwrap();
        let mut config = sample_config(dir.path());
        config.clients.remove("client_02");

        // A plain file where the inbox should be makes folder creation fail.
        let base = dir.path().join("clients").join("client_01");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("INBOX"), b"not a folder").unwrap();

        let err = build_client_watches(&config, None).unwrap_err();
        assert!(err.to_string().contains("no watchable clients"));
    }

    #[test]
    fn ownership_is_prefix_based() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path());
        let watches = build_client_watches(&config, None).unwrap();

        let inside = watches[0].inbox().join("orders.txt");
        let elsewhere = dir.path().join("unrelated").join("orders.txt");
        assert!(watches[0].owns(&inside));
        assert!(!watches[0].owns(&elsewhere));
        assert!(!watches[1].owns(&inside));
    }
}
