//! Telegram ingestion front-end.
//!
//! A long-polling bot that turns plain-text messages from allowlisted chats
//! into files in a client's inbound folder, where the folder watcher picks
//! them up like any other drop. Routing: an optional first line naming a
//! client id, else the chat's stored default, else the first configured
//! client.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use dropline_config::AppConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Backoff after a 409 from `getUpdates`, which means another instance of
/// the bot is polling with the same token.
const CONFLICT_BACKOFF: Duration = Duration::from_secs(15);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
const BATCH_PAUSE: Duration = Duration::from_millis(300);

// ── Allowlist ─────────────────────────────────────────────────────────────────

/// Who may talk to the bot, and each chat's default client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowlistConfig {
    pub allowed_chat_ids: Vec<i64>,
    /// Chat id (as a string, JSON object keys) to client id.
    pub default_client_by_chat: BTreeMap<String, String>,
}

/// JSON-backed allowlist, reloaded from disk on every check so edits made
/// while the daemon runs take effect without a restart.
pub struct AllowlistStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl AllowlistStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn load(&self) -> AllowlistConfig {
        let _guard = self.lock.lock().await;
        self.load_locked()
    }

    pub async fn save(&self, config: &AllowlistConfig) -> Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(config)?)?;
        Ok(())
    }

    fn load_locked(&self) -> AllowlistConfig {
        if !self.path.exists() {
            if let Err(err) = self.create_empty() {
                error!(
                    path = %self.path.display(),
                    error = %err,
                    "cannot create allowlist file"
                );
            }
            return AllowlistConfig::default();
        }
        let parsed = fs::read_to_string(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str(&text).map_err(anyhow::Error::from));
        match parsed {
            Ok(config) => config,
            Err(err) => {
                error!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to read allowlist, recreating it empty"
                );
                if let Err(err) = self.create_empty() {
                    error!(error = %err, "allowlist recreate failed");
                }
                AllowlistConfig::default()
            }
        }
    }

    fn create_empty(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::json!({
            "allowed_chat_ids": [],
            "default_client_by_chat": {},
            "instructions": "Add numeric chat IDs to allowed_chat_ids to permit ingestion.",
        });
        fs::write(&self.path, serde_json::to_string_pretty(&payload)?)?;
        Ok(())
    }
}

// ── Message routing ───────────────────────────────────────────────────────────

/// Split a message into the client it is for and the content to save.
///
/// If the first non-blank line names a configured client id it is consumed
/// as a routing override. A message that was only a routing line keeps its
/// raw text as content so nothing silently disappears.
fn route_message(
    raw_text: &str,
    chat_id: i64,
    allowlist: &AllowlistConfig,
    client_ids: &[String],
) -> (Option<String>, String) {
    let mut routed: Option<String> = None;
    let mut content_lines: Vec<&str> = Vec::new();
    let mut checked_first = false;
    for line in raw_text.lines() {
        let trimmed = line.trim();
        if !checked_first && !trimmed.is_empty() {
            checked_first = true;
            if let Some(id) = client_ids.iter().find(|id| id.eq_ignore_ascii_case(trimmed)) {
                routed = Some(id.clone());
                continue;
            }
        }
        content_lines.push(line);
    }

    let client_id = routed
        .or_else(|| {
            allowlist
                .default_client_by_chat
                .get(&chat_id.to_string())
                .cloned()
        })
        .or_else(|| client_ids.first().cloned());

    let content = content_lines.join("\n").trim().to_string();
    let content = if content.is_empty() {
        raw_text.trim().to_string()
    } else {
        content
    };
    (client_id, content)
}

/// Write `content` into `inbox` under a timestamped name, staging the bytes
/// in `<inbox>/.tmp` first so the rename publishes a complete file and the
/// watcher never sees a partial write.
async fn write_message(inbox: &Path, chat_id: i64, content: &str) -> Result<String> {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let filename = format!("telegram_{stamp}_{chat_id}.txt");
    let staging = inbox.join(".tmp");
    tokio::fs::create_dir_all(&staging).await?;

    let tmp_path = staging.join(format!("{filename}.{}.tmp", std::process::id()));
    let final_path = inbox.join(&filename);
    tokio::fs::write(&tmp_path, content).await?;
    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .with_context(|| format!("publishing {}", final_path.display()))?;
    Ok(filename)
}

// ── Bot ───────────────────────────────────────────────────────────────────────

pub struct TelegramBot {
    http: Client,
    base_url: String,
    config: AppConfig,
    store: AllowlistStore,
}

impl TelegramBot {
    pub fn new(token: &str, config: AppConfig) -> Result<Self> {
        if token.trim().is_empty() {
            bail!("telegram bot token is empty");
        }
        let store = AllowlistStore::new(&config.telegram.allowlist_path);
        Ok(Self {
            http: Client::new(),
            base_url: format!("https://api.telegram.org/bot{token}"),
            config,
            store,
        })
    }

    /// Poll for updates until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("telegram ingest bot started");
        let mut offset: i64 = 0;
        // The backoff arm below can consume a change notification, so the
        // loop re-reads the flag itself rather than relying on `changed`.
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                batch = fetch_updates(&self.http, &self.base_url, offset) => match batch {
                    Ok(updates) => {
                        for update in updates {
                            offset = update.update_id + 1;
                            self.dispatch(update).await;
                        }
                        tokio::time::sleep(BATCH_PAUSE).await;
                    }
                    Err(err) => {
                        let backoff = if is_conflict(&err) {
                            warn!("another bot instance is polling this token, backing off");
                            CONFLICT_BACKOFF
                        } else {
                            warn!(error = %err, "getUpdates failed, retrying");
                            ERROR_BACKOFF
                        };
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
            }
        }
        info!("telegram ingest bot stopped");
        Ok(())
    }

    async fn dispatch(&self, update: TelegramUpdate) {
        let Some(message) = update.message else {
            return;
        };
        let chat_id = message.chat.id;
        if !self.is_allowlisted(chat_id).await {
            info!(chat_id, "ignoring message from non-allowlisted chat");
            return;
        }

        let reply = match message.text.as_deref() {
            Some(text) => self.handle_text(chat_id, text.trim()).await,
            None if message.document.is_some() || message.photo.is_some() => {
                Some("Text only, paste addresses as text.".to_string())
            }
            None => None,
        };

        if let Some(reply) = reply {
            if let Err(err) = send_message(&self.http, &self.base_url, chat_id, &reply).await {
                warn!(chat_id, error = %err, "telegram reply failed");
            }
        }
    }

    async fn is_allowlisted(&self, chat_id: i64) -> bool {
        self.store.load().await.allowed_chat_ids.contains(&chat_id)
    }

    async fn handle_text(&self, chat_id: i64, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        if text.starts_with('/') {
            return Some(self.handle_command(chat_id, text).await);
        }
        match self.ingest_message(chat_id, text).await {
            Ok((client_id, filename)) => Some(format!("Saved for {client_id}: {filename}")),
            Err(err) => {
                error!(chat_id, error = %err, "failed to save telegram message");
                Some("Could not save that message, try again later.".to_string())
            }
        }
    }

    async fn handle_command(&self, chat_id: i64, raw: &str) -> String {
        let line = normalize_command(raw);
        let (command, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        match command {
            "/start" | "/help" => "Dropline ingest bot. Send text-only orders. \
                                   Optional first line: a client id such as client_01."
                .to_string(),
            "/status" => self.status_reply().await,
            "/chatid" => chat_id.to_string(),
            "/clients" => {
                let ids = self.config.client_ids();
                if ids.is_empty() {
                    "No clients configured.".to_string()
                } else {
                    ids.join("\n")
                }
            }
            "/setclient" => self.set_default_client(chat_id, rest.trim()).await,
            _ => "Unknown command. Use /help.".to_string(),
        }
    }

    async fn status_reply(&self) -> String {
        let allowlist = self.store.load().await;
        let ids = self.config.client_ids();
        let clients = if ids.is_empty() {
            "None found".to_string()
        } else {
            ids.join(", ")
        };
        format!(
            "Bot running. Allowlisted chats: {}. Clients: {}.",
            allowlist.allowed_chat_ids.len(),
            clients
        )
    }

    async fn set_default_client(&self, chat_id: i64, arg: &str) -> String {
        if arg.is_empty() {
            return "Usage: /setclient client_01".to_string();
        }
        let Some(canonical) = self
            .config
            .client_ids()
            .into_iter()
            .find(|id| id.eq_ignore_ascii_case(arg))
        else {
            return "Unknown client ID. Use /clients to list them.".to_string();
        };
        let mut allowlist = self.store.load().await;
        allowlist
            .default_client_by_chat
            .insert(chat_id.to_string(), canonical.clone());
        match self.store.save(&allowlist).await {
            Ok(()) => format!("Default client set to {canonical}."),
            Err(err) => {
                error!(chat_id, error = %err, "allowlist save failed");
                "Could not update the allowlist, try again later.".to_string()
            }
        }
    }

    async fn ingest_message(&self, chat_id: i64, raw_text: &str) -> Result<(String, String)> {
        let allowlist = self.store.load().await;
        let client_ids = self.config.client_ids();
        let (client_id, content) = route_message(raw_text, chat_id, &allowlist, &client_ids);
        let client_id = client_id.context("no clients configured")?;
        let client = self.config.resolve_client(&client_id)?;

        let filename = write_message(&client.folders.inbox, chat_id, &content).await?;
        info!(
            chat_id,
            client = %client_id,
            filename = %filename,
            length = content.chars().count(),
            "saved telegram message"
        );
        Ok((client_id, filename))
    }
}

// ── Telegram HTTP plumbing ────────────────────────────────────────────────────

fn is_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<reqwest::Error>()
        .and_then(|err| err.status())
        .is_some_and(|status| status == reqwest::StatusCode::CONFLICT)
}

async fn fetch_updates(
    client: &Client,
    base_url: &str,
    offset: i64,
) -> Result<Vec<TelegramUpdate>> {
    let url = format!("{base_url}/getUpdates");
    let response = client
        .get(url)
        .query(&[("timeout", "25"), ("offset", &offset.to_string())])
        .send()
        .await?
        .error_for_status()?;

    let payload: TelegramResponse<Vec<TelegramUpdate>> = response.json().await?;
    if !payload.ok {
        let description = payload
            .description
            .unwrap_or_else(|| "telegram getUpdates failed".to_string());
        bail!(description);
    }
    Ok(payload.result.unwrap_or_default())
}

async fn send_message(client: &Client, base_url: &str, chat_id: i64, text: &str) -> Result<()> {
    let url = format!("{base_url}/sendMessage");
    let body = SendMessageRequest {
        chat_id,
        text,
        disable_web_page_preview: true,
    };
    let response = client
        .post(url)
        .json(&body)
        .send()
        .await?
        .error_for_status()?;

    let payload: TelegramResponse<serde_json::Value> = response.json().await?;
    if !payload.ok {
        let description = payload
            .description
            .unwrap_or_else(|| "telegram sendMessage failed".to_string());
        bail!(description);
    }
    Ok(())
}

/// Strip the `@botname` suffix Telegram appends to commands in group chats.
fn normalize_command(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return trimmed.to_string();
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or("").trim();

    let command = command
        .split_once('@')
        .map(|(base, _)| base)
        .unwrap_or(command);

    if rest.is_empty() {
        command.to_string()
    } else {
        format!("{command} {rest}")
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    text: Option<String>,
    document: Option<serde_json::Value>,
    photo: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}
