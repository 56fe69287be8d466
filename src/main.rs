use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;

const OLLAMA_CHAT_ENDPOINT: &str = "https://ollama.com/api/chat";
const OLLAMA_PROBE_MODEL: &str = "kimi-k2.5:cloud";
const OLLAMA_PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_PROBE_MODEL: &str = "gemini-2.0-flash";
const GEMINI_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const GEMINI_KEY_VAR: &str = "GEMINI_API_KEY";
const ROTATOR_HOME_VAR: &str = "CLAW_ROTATOR_HOME";
const ROTATOR_ENV_FILE_VAR: &str = "CLAW_ROTATOR_ENV_FILE";

const DEFAULT_ACCOUNT_ID: u32 = 1;
const DEFAULT_GATEWAY_PORT: u64 = 18789;
const OLLAMA_CLOUD_PROVIDER: &str = "ollama-cloud";
const GOOGLE_PROVIDER: &str = "google";
const KIMI_SOURCE_PROVIDER: &str = "kimi-coding";
const KIMI_PROVIDERS: [&str; 3] = ["kimi-coding", "moonshot", "kimi"];
const GLASS_PROVIDER_PREFIX: &str = "ollama-glass-";
const GLASS_KEY_VAR: &str = "OLLAMA_GLASS_API_KEY";
const MODELS_FILE: &str = "models.json";
const AUTH_PROFILES_FILE: &str = "auth-profiles.json";
const SEPARATOR: &str = "──────────────────────────────────────────────────";
const RESTART_HINT: &str = "💡 Restart gateway: openclaw gateway stop && openclaw gateway";

static TRACE_COUNTER: AtomicU64 = AtomicU64::new(0);

type ProbeClient = Arc<dyn Fn(&str) -> ProbeResult + Send + Sync>;

#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    message: String,
    exit_code: i32,
}

impl CliError {
    fn new(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }
}

type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
enum CliCommand {
    Help,
    Status,
    List,
    Switch(String),
    Sync(SyncOptions),
    ValidateKeys { json: bool },
    ValidateGemini,
}

impl CliCommand {
    fn parse(args: &[String]) -> CliResult<Self> {
        let Some(first) = args.first() else {
            return Ok(Self::Status);
        };

        match first.as_str() {
            "-h" | "--help" | "help" => Ok(Self::Help),
            "status" => {
                if args.len() != 1 {
                    return Err(CliError::new("usage: claw-rotator status", 2));
                }
                Ok(Self::Status)
            }
            "list" | "ls" => {
                if args.len() != 1 {
                    return Err(CliError::new("usage: claw-rotator list", 2));
                }
                Ok(Self::List)
            }
            "switch" => match args.len() {
                1 => Ok(Self::Status),
                2 => Ok(Self::Switch(args[1].clone())),
                _ => Err(CliError::new(
                    "usage: claw-rotator switch <id|alias|status>",
                    2,
                )),
            },
            "sync-all-configs" | "sync" => {
                let mut options = SyncOptions::default();
                for arg in &args[1..] {
                    match arg.as_str() {
                        "--clear-cooldowns" => options.clear_cooldowns = true,
                        "--dry-run" => options.dry_run = true,
                        _ => {
                            return Err(CliError::new(
                                "usage: claw-rotator sync-all-configs [--clear-cooldowns] [--dry-run]",
                                2,
                            ));
                        }
                    }
                }
                Ok(Self::Sync(options))
            }
            "validate-keys" => {
                let mut json = false;
                for arg in &args[1..] {
                    match arg.as_str() {
                        "--json" => json = true,
                        _ => {
                            return Err(CliError::new(
                                "usage: claw-rotator validate-keys [--json]",
                                2,
                            ));
                        }
                    }
                }
                Ok(Self::ValidateKeys { json })
            }
            "validate-gemini" => {
                if args.len() != 1 {
                    return Err(CliError::new("usage: claw-rotator validate-gemini", 2));
                }
                Ok(Self::ValidateGemini)
            }
            _ => Err(CliError::new(format!("unknown command: {}", first), 2)),
        }
    }
}

/// Variables visible to one invocation: the first `.env` file found, overlaid
/// by the process environment.
#[derive(Debug, Clone, Default)]
struct Environment {
    vars: HashMap<String, String>,
    source: Option<PathBuf>,
}

impl Environment {
    fn load(process_vars: HashMap<String, String>, candidates: &[PathBuf]) -> Self {
        // Only the first existing candidate is consulted, even when it cannot be read.
        let first_existing = first_match(candidates, |path| Some(path.to_path_buf()));

        let mut vars = HashMap::new();
        let mut source = None;
        if let Some(path) = first_existing {
            if let Ok(bytes) = fs::read(&path) {
                vars.extend(parse_dotenv_contents(&String::from_utf8_lossy(&bytes)));
                source = Some(path);
            }
        }
        vars.extend(
            process_vars
                .into_iter()
                .filter(|(_, value)| !value.is_empty()),
        );

        Self { vars, source }
    }

    #[cfg(test)]
    fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            vars: pairs
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            source: None,
        }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

#[derive(Debug, Clone)]
struct RotatorConfig {
    global_config_path: PathBuf,
    workspace_config_path: PathBuf,
    agents_dir: PathBuf,
    rotator_home: PathBuf,
    ssh_dir: PathBuf,
    ollama_chat_endpoint: String,
    gemini_api_base: String,
}

impl RotatorConfig {
    fn from_environment(home_dir: PathBuf, environment: &Environment) -> Self {
        let openclaw_root = home_dir.join(".openclaw");
        let global_config_path = environment
            .get("OPENCLAW_CONFIG")
            .map(|value| PathBuf::from(value.trim()))
            .unwrap_or_else(|| openclaw_root.join("openclaw.json"));
        let rotator_home = environment
            .get(ROTATOR_HOME_VAR)
            .map(|value| PathBuf::from(value.trim()))
            .unwrap_or_else(|| default_rotator_home(&home_dir));

        Self {
            global_config_path,
            workspace_config_path: openclaw_root.join("workspace/openclaw.json"),
            agents_dir: openclaw_root.join("agents"),
            rotator_home,
            ssh_dir: home_dir.join(".ssh"),
            ollama_chat_endpoint: endpoint_override(
                environment,
                "OLLAMA_CHAT_URL",
                OLLAMA_CHAT_ENDPOINT,
            ),
            gemini_api_base: endpoint_override(environment, "GEMINI_API_URL", GEMINI_API_BASE),
        }
    }

    fn global_config_candidates(&self) -> Vec<PathBuf> {
        vec![
            self.global_config_path.clone(),
            self.workspace_config_path.clone(),
        ]
    }

    fn state_file(&self) -> PathBuf {
        self.rotator_home.join(".current-ollama-account")
    }

    fn accounts_file(&self) -> PathBuf {
        self.rotator_home.join("accounts.json")
    }

    fn rotation_state_file(&self) -> PathBuf {
        self.rotator_home.join(".rotation-state.json")
    }

    fn log_dir(&self) -> PathBuf {
        self.rotator_home.join("logs")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Credential {
    #[serde(rename = "ssh")]
    SshKey {
        #[serde(rename = "identityFile")]
        identity_file: String,
    },
    #[serde(rename = "api_key")]
    ApiKey {
        #[serde(rename = "envKey")]
        env_var: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Account {
    id: u32,
    name: String,
    username: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(flatten)]
    credential: Credential,
}

impl Account {
    fn ssh(id: u32, name: &str, username: &str, identity_file: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            username: username.to_string(),
            alias: None,
            credential: Credential::SshKey {
                identity_file: identity_file.to_string(),
            },
        }
    }

    fn api_key(id: u32, name: &str, username: &str, alias: &str, env_var: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            username: username.to_string(),
            alias: Some(alias.to_string()),
            credential: Credential::ApiKey {
                env_var: env_var.to_string(),
            },
        }
    }

    /// Secret for API-key accounts. SSH accounts authenticate with an identity
    /// file on disk and never yield a string here.
    fn credential_value<'a>(&self, environment: &'a Environment) -> Option<&'a str> {
        match &self.credential {
            Credential::ApiKey { env_var } => environment.get(env_var),
            Credential::SshKey { .. } => None,
        }
    }

    fn type_label(&self) -> &'static str {
        match self.credential {
            Credential::SshKey { .. } => "SSH Key",
            Credential::ApiKey { .. } => "API Key",
        }
    }

    fn selector(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.id.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct AccountsFile {
    accounts: Vec<Account>,
}

#[derive(Debug, Clone)]
struct AccountRegistry {
    accounts: Vec<Account>,
}

impl AccountRegistry {
    fn builtin() -> Self {
        Self {
            accounts: vec![
                Account::ssh(1, "Primary (ssh-1)", "ollama-primary", "id_ed25519_ollama1"),
                Account::ssh(2, "Backup (ssh-2)", "ollama-backup", "id_ed25519_ollama2"),
                Account::api_key(3, "Agent Glass (glass)", "agent glass", "glass", GLASS_KEY_VAR),
                Account::api_key(
                    4,
                    "Agent Glass 2 (glass-2)",
                    "agent glass 2",
                    "glass-2",
                    "OLLAMA_GLASS_API_KEY_2",
                ),
                Account::api_key(
                    5,
                    "Agent Glass 3 (glass-3)",
                    "agent glass 3",
                    "glass-3",
                    "OLLAMA_GLASS_API_KEY_3",
                ),
                Account::api_key(
                    6,
                    "Agent Glass 4 (glass-4)",
                    "agent glass 4",
                    "glass-4",
                    "OLLAMA_GLASS_API_KEY_4",
                ),
                Account::api_key(
                    7,
                    "Agent Glass 5 (glass-5)",
                    "agent glass 5",
                    "glass-5",
                    "OLLAMA_GLASS_API_KEY_5",
                ),
                Account::api_key(8, "Brudda (brudda)", "brudda", "brudda", "OLLAMA_GLASS_API_KEY_6"),
            ],
        }
    }

    /// Loads `accounts.json` when present, otherwise the built-in table.
    fn load(path: &Path) -> CliResult<Self> {
        if !path.exists() {
            return Ok(Self::builtin());
        }

        let data = fs::read(path).map_err(|err| {
            CliError::new(format!("failed to read {}: {}", path.display(), err), 1)
        })?;
        let file = serde_json::from_slice::<AccountsFile>(&data).map_err(|err| {
            CliError::new(format!("failed to parse {}: {}", path.display(), err), 1)
        })?;
        Self::from_accounts(file.accounts)
    }

    fn from_accounts(accounts: Vec<Account>) -> CliResult<Self> {
        if accounts.is_empty() {
            return Err(CliError::new("account registry is empty", 1));
        }

        let mut seen_ids = HashSet::new();
        let mut seen_aliases = HashSet::new();
        for account in &accounts {
            if !seen_ids.insert(account.id) {
                return Err(CliError::new(
                    format!("duplicate account id: {}", account.id),
                    1,
                ));
            }
            if let Some(alias) = account.alias.as_deref() {
                if !seen_aliases.insert(alias.to_lowercase()) {
                    return Err(CliError::new(format!("duplicate account alias: {}", alias), 1));
                }
            }
        }

        Ok(Self { accounts })
    }

    fn get(&self, id: u32) -> Option<&Account> {
        self.accounts.iter().find(|account| account.id == id)
    }

    fn default_account(&self) -> &Account {
        self.get(DEFAULT_ACCOUNT_ID).unwrap_or(&self.accounts[0])
    }

    fn resolve(&self, identifier: &str) -> Option<&Account> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return None;
        }
        if identifier.chars().all(|ch| ch.is_ascii_digit()) {
            return identifier.parse::<u32>().ok().and_then(|id| self.get(id));
        }

        let wanted = identifier.to_lowercase();
        self.accounts.iter().find(|account| {
            account
                .alias
                .as_deref()
                .is_some_and(|alias| alias.to_lowercase() == wanted)
        })
    }

    fn api_key_accounts(&self) -> impl Iterator<Item = (&Account, &str)> {
        self.accounts
            .iter()
            .filter_map(|account| match &account.credential {
                Credential::ApiKey { env_var } => Some((account, env_var.as_str())),
                Credential::SshKey { .. } => None,
            })
    }

    fn usage_text(&self, target: &str) -> String {
        let mut lines = vec![
            format!("unknown account: {}", target),
            String::new(),
            "Usage: claw-rotator switch <id|alias|status>".to_string(),
        ];
        for account in &self.accounts {
            lines.push(format!("   {} = {}", account.id, account.name));
        }
        let aliases = self
            .accounts
            .iter()
            .filter_map(|account| account.alias.as_deref())
            .collect::<Vec<_>>();
        if !aliases.is_empty() {
            lines.push(format!("   Aliases: {}", aliases.join(", ")));
        }
        lines.join("\n")
    }
}

struct StateStore {
    path: PathBuf,
}

impl StateStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> u32 {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_ACCOUNT_ID)
    }

    /// Returns whether the sidecar file was rewritten.
    fn save(&self, account_id: u32) -> CliResult<bool> {
        let value = account_id.to_string();
        let unchanged = fs::read_to_string(&self.path)
            .map(|raw| raw.trim() == value)
            .unwrap_or(false);
        if unchanged {
            return Ok(false);
        }
        write_file_atomic(&self.path, value.as_bytes())?;
        Ok(true)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RotationState {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    last_rotation: f64,
    #[serde(default)]
    interval: f64,
    #[serde(default)]
    current_index: i64,
}

impl RotationState {
    fn next_rotation(&self) -> Option<DateTime<Utc>> {
        let millis = self.last_rotation + self.interval;
        if !millis.is_finite() {
            return None;
        }
        DateTime::from_timestamp_millis(millis as i64)
    }
}

/// One line of `rotator.log`. Keys only ever appear as fingerprints.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RotatorEvent {
    AccountSwitched {
        from: u32,
        to: u32,
    },
    GlobalConfigPatched {
        path: String,
        key_fingerprint: String,
    },
    GlobalConfigCandidateFailed {
        path: String,
        error: String,
    },
    AgentModelsPatched {
        agent: String,
        key_fingerprint: String,
    },
    AgentModelsPatchFailed {
        agent: String,
        error: String,
    },
    SyncDocumentUpdated {
        trace_id: String,
        agent: String,
        document: String,
    },
    SyncDocumentFailed {
        trace_id: String,
        agent: String,
        document: String,
        error: String,
    },
    KeyProbeResult {
        label: String,
        key_fingerprint: String,
        outcome: ProbeOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

#[derive(Serialize)]
struct LogRecord<'a> {
    timestamp: String,
    pid: u32,
    #[serde(flatten)]
    event: &'a RotatorEvent,
}

/// Appends events to `<rotator home>/logs/rotator.log`. Failures are swallowed
/// so a full disk never blocks a switch.
struct RotatorLogWriter {
    log_file: PathBuf,
    max_log_bytes: u64,
}

impl RotatorLogWriter {
    fn new(log_dir: PathBuf) -> Self {
        Self {
            log_file: log_dir.join("rotator.log"),
            max_log_bytes: 5 * 1024 * 1024,
        }
    }

    fn append(&self, event: &RotatorEvent) {
        let record = LogRecord {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            pid: std::process::id(),
            event,
        };
        let Ok(mut line) = serde_json::to_string(&record) else {
            return;
        };
        line.push('\n');
        let _ = self.append_line(&line);
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(dir) = self.log_file.parent() {
            fs::create_dir_all(dir)?;
        }
        let current_size = fs::metadata(&self.log_file).map(|m| m.len()).unwrap_or(0);
        if current_size > 0 && current_size + line.len() as u64 > self.max_log_bytes {
            // Single generation: the previous `.1` is overwritten.
            fs::rename(&self.log_file, self.log_file.with_extension("log.1"))?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?
            .write_all(line.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GlobalPatch {
    path: PathBuf,
    changed: bool,
}

#[derive(Debug, Clone, Default)]
struct AgentPatchReport {
    updated: Vec<String>,
    failures: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SyncOptions {
    clear_cooldowns: bool,
    dry_run: bool,
}

/// Provider keys and gateway descriptor read from the global config.
#[derive(Debug, Clone, Default)]
struct SyncSource {
    ollama_cloud_key: Option<String>,
    google_key: Option<String>,
    kimi_key: Option<String>,
    gateway_token: Option<String>,
    gateway_url: String,
}

impl SyncSource {
    fn from_config(root: &Value) -> Self {
        let gateway_port = json_at(root, &["gateway", "port"])
            .and_then(value_as_port)
            .unwrap_or(DEFAULT_GATEWAY_PORT);

        Self {
            ollama_cloud_key: provider_api_key(root, OLLAMA_CLOUD_PROVIDER),
            google_key: provider_api_key(root, GOOGLE_PROVIDER),
            kimi_key: provider_api_key(root, KIMI_SOURCE_PROVIDER),
            gateway_token: non_empty_str(json_at(root, &["gateway", "auth", "token"]))
                .map(str::to_string),
            gateway_url: format!("http://127.0.0.1:{}", gateway_port),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DocumentSync {
    changed: bool,
    notes: Vec<String>,
}

impl DocumentSync {
    fn record(&mut self, note: impl Into<String>) {
        self.changed = true;
        self.notes.push(note.into());
    }

    fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}

#[derive(Debug, Clone, Default)]
struct SyncReport {
    lines: Vec<String>,
    files_changed: usize,
    failures: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum ProbeOutcome {
    Success,
    RateLimited,
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbeResult {
    outcome: ProbeOutcome,
    status_code: Option<u16>,
    message: Option<String>,
}

impl ProbeResult {
    fn success(status_code: u16) -> Self {
        Self {
            outcome: ProbeOutcome::Success,
            status_code: Some(status_code),
            message: None,
        }
    }

    fn rate_limited(message: String) -> Self {
        Self {
            outcome: ProbeOutcome::RateLimited,
            status_code: Some(429),
            message: Some(message),
        }
    }

    fn error(status_code: Option<u16>, message: String) -> Self {
        Self {
            outcome: ProbeOutcome::Error,
            status_code,
            message: Some(message),
        }
    }

    fn timeout(message: String) -> Self {
        Self {
            outcome: ProbeOutcome::Timeout,
            status_code: None,
            message: Some(message),
        }
    }

    fn ok(&self) -> bool {
        self.outcome == ProbeOutcome::Success
    }

    fn detail(&self) -> String {
        if self.ok() {
            return "OK".to_string();
        }
        let status = match (self.status_code, self.outcome) {
            (Some(code), _) => code.to_string(),
            (None, ProbeOutcome::Timeout) => "TIMEOUT".to_string(),
            (None, _) => "ERROR".to_string(),
        };
        match self.message.as_deref() {
            Some(message) if !message.is_empty() => format!("{} {}", status, message),
            _ => status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyValidation {
    account_id: u32,
    label: String,
    env_var: String,
    missing: bool,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<ProbeResult>,
}

impl KeyValidation {
    fn line(&self) -> String {
        match self.result.as_ref() {
            None => format!("   {}: ⚠️  no key in .env ({})", self.label, self.env_var),
            Some(result) => {
                let icon = if result.ok() { "✅" } else { "❌" };
                format!("   {}: {}  {}", self.label, icon, result.detail())
            }
        }
    }
}

struct RotatorApp {
    config: RotatorConfig,
    environment: Environment,
    registry: AccountRegistry,
    state_store: StateStore,
    log_writer: RotatorLogWriter,
    ollama_probe: ProbeClient,
    gemini_probe: ProbeClient,
}

impl RotatorApp {
    fn new(home_dir: PathBuf) -> CliResult<Self> {
        let process_vars = process_environment();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let candidates = dotenv_candidates(&home_dir, &cwd, &process_vars);
        let environment = Environment::load(process_vars, &candidates);
        let config = RotatorConfig::from_environment(home_dir, &environment);

        let ollama_endpoint = config.ollama_chat_endpoint.clone();
        let ollama_probe: ProbeClient = Arc::new(move |api_key| {
            probe_ollama_key(&ollama_endpoint, api_key, OLLAMA_PROBE_TIMEOUT)
        });
        let gemini_base = config.gemini_api_base.clone();
        let gemini_probe: ProbeClient = Arc::new(move |api_key| {
            probe_gemini_key(&gemini_base, api_key, GEMINI_PROBE_TIMEOUT)
        });

        Self::with_clients_internal(config, environment, ollama_probe, gemini_probe)
    }

    #[cfg(test)]
    fn with_clients(
        home_dir: PathBuf,
        environment: Environment,
        ollama_probe: ProbeClient,
        gemini_probe: ProbeClient,
    ) -> CliResult<Self> {
        let config = RotatorConfig::from_environment(home_dir, &environment);
        Self::with_clients_internal(config, environment, ollama_probe, gemini_probe)
    }

    fn with_clients_internal(
        config: RotatorConfig,
        environment: Environment,
        ollama_probe: ProbeClient,
        gemini_probe: ProbeClient,
    ) -> CliResult<Self> {
        let registry = AccountRegistry::load(&config.accounts_file())?;
        let state_store = StateStore::new(config.state_file());
        let log_writer = RotatorLogWriter::new(config.log_dir());

        Ok(Self {
            config,
            environment,
            registry,
            state_store,
            log_writer,
            ollama_probe,
            gemini_probe,
        })
    }

    fn log_event(&self, event: RotatorEvent) {
        self.log_writer.append(&event);
    }

    fn current_account(&self) -> &Account {
        let current_id = self.state_store.load();
        self.registry
            .get(current_id)
            .unwrap_or_else(|| self.registry.default_account())
    }

    fn status(&self) -> CliResult<()> {
        for line in self.status_lines() {
            println!("{}", line);
        }
        Ok(())
    }

    fn status_lines(&self) -> Vec<String> {
        let account = self.current_account();
        let mut lines = vec![
            String::new(),
            "📊 Ollama Cloud Account Status".to_string(),
            format!("   Current: {}", account.name),
            format!("   Username: {}", account.username),
        ];
        if let Some(alias) = account.alias.as_deref() {
            lines.push(format!("   Alias: {}", alias));
        }
        lines.push(format!("   Account: #{}", account.id));
        lines.push(format!("   Type: {}", account.type_label()));
        lines.extend(self.rotation_state_lines());

        match &account.credential {
            Credential::SshKey { identity_file } => {
                let identity_path = self.config.ssh_dir.join(identity_file);
                lines.push(format!("   Identity file: ~/.ssh/{}", identity_file));
                if identity_path.exists() {
                    lines.push("   ✅ Identity file found".to_string());
                } else {
                    lines.push(format!(
                        "   ❌ Identity file NOT found at {}",
                        identity_path.display()
                    ));
                }
            }
            Credential::ApiKey { env_var } => match account.credential_value(&self.environment) {
                Some(api_key) => {
                    lines.push(format!("   API Key: {}", mask_secret(api_key, 20, 4)));
                    lines.push(format!("   ✅ API key loaded from {}", self.env_source_label()));
                }
                None => {
                    lines.push(format!("   ❌ API key NOT found in .env ({})", env_var));
                    lines.push(format!("   💡 Add {}=your_api_key to .env file", env_var));
                }
            },
        }

        lines.push(String::new());
        lines.push("   Models affected:".to_string());
        lines.push("   • kimi-cloud (kimi-k2.5:cloud)".to_string());
        lines.push("   • mm-cloud (minimax-m2:cloud)".to_string());
        lines
    }

    fn rotation_state_lines(&self) -> Vec<String> {
        let Ok(data) = fs::read(self.config.rotation_state_file()) else {
            return Vec::new();
        };
        let Ok(state) = serde_json::from_slice::<RotationState>(&data) else {
            return Vec::new();
        };
        if !state.active {
            return Vec::new();
        }

        let next_rotation = state
            .next_rotation()
            .map(|at| {
                at.with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_else(|| "-".to_string());
        vec![
            String::new(),
            "   🔄 Auto-rotation: ACTIVE".to_string(),
            format!("   Current index: {}", state.current_index),
            format!("   Next rotation: {}", next_rotation),
        ]
    }

    fn env_source_label(&self) -> String {
        self.environment
            .source()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "environment".to_string())
    }

    fn list_accounts(&self) -> CliResult<()> {
        for line in self.account_list_lines() {
            println!("{}", line);
        }
        Ok(())
    }

    fn account_list_lines(&self) -> Vec<String> {
        let current_id = self.current_account().id;
        let mut lines = vec!["Accounts:".to_string()];
        for account in &self.registry.accounts {
            let credential = match &account.credential {
                Credential::SshKey { identity_file } => {
                    let marker = if self.config.ssh_dir.join(identity_file).exists() {
                        "✅"
                    } else {
                        "❌"
                    };
                    format!("ssh {} ~/.ssh/{}", marker, identity_file)
                }
                Credential::ApiKey { env_var } => {
                    let marker = if self.environment.get(env_var).is_some() {
                        "✅"
                    } else {
                        "❌"
                    };
                    format!("api-key {} {}", marker, env_var)
                }
            };
            let current_marker = if account.id == current_id {
                " [current]"
            } else {
                ""
            };
            lines.push(format!(
                "  #{} {} ({}): {}{}",
                account.id,
                account.selector(),
                account.name,
                credential,
                current_marker
            ));
        }
        lines
    }

    fn switch_account(&self, target: &str) -> CliResult<()> {
        for line in self.switch_lines(target)? {
            println!("{}", line);
        }
        Ok(())
    }

    fn switch_lines(&self, target: &str) -> CliResult<Vec<String>> {
        if target.trim().eq_ignore_ascii_case("status") {
            return Ok(self.status_lines());
        }

        let account = self
            .registry
            .resolve(target)
            .ok_or_else(|| CliError::new(self.registry.usage_text(target), 1))?;
        let current_id = self.state_store.load();

        let mut lines = vec![String::new()];
        if current_id == account.id {
            lines.push(format!("⚠️  Already using {}", account.name));
        } else {
            self.state_store.save(account.id)?;
            self.log_event(RotatorEvent::AccountSwitched {
                from: current_id,
                to: account.id,
            });
            lines.push(format!("✅ Switched to {}", account.name));
        }
        lines.push(format!("   Username: {}", account.username));
        if let Some(alias) = account.alias.as_deref() {
            lines.push(format!("   Alias: {}", alias));
        }

        match &account.credential {
            Credential::SshKey { identity_file } => {
                self.append_ssh_activation_lines(&mut lines, identity_file)
            }
            Credential::ApiKey { env_var } => {
                self.append_api_key_activation_lines(&mut lines, account, env_var)
            }
        }
        Ok(lines)
    }

    fn append_ssh_activation_lines(&self, lines: &mut Vec<String>, identity_file: &str) {
        lines.push(format!("   Identity: ~/.ssh/{}", identity_file));
        lines.push(String::new());
        lines.push("⚠️  ACTION REQUIRED:".to_string());
        lines.push(format!("   Ensure ~/.ssh/{} exists", identity_file));
        lines.push("   Restart any active Ollama cloud tunnels".to_string());
        lines.push(String::new());

        let identity_path = self.config.ssh_dir.join(identity_file);
        if identity_path.exists() {
            lines.push("✅ Identity file found".to_string());
        } else {
            lines.push(format!(
                "❌ Identity file NOT found at {}",
                identity_path.display()
            ));
            lines.push("   You may need to:".to_string());
            lines.push(format!(
                "   1. Copy your private key to ~/.ssh/{}",
                identity_file
            ));
            lines.push(format!("   2. Run: chmod 600 ~/.ssh/{}", identity_file));
        }
    }

    fn append_api_key_activation_lines(
        &self,
        lines: &mut Vec<String>,
        account: &Account,
        env_var: &str,
    ) {
        lines.push(String::new());
        let Some(api_key) = account.credential_value(&self.environment) else {
            lines.push("❌ API key NOT found in .env".to_string());
            lines.push(format!("   Environment variable: {}", env_var));
            lines.push(format!("   Add to .env file: {}=your_api_key", env_var));
            return;
        };

        lines.push(format!("✅ API key loaded from {}", self.env_source_label()));
        lines.push(format!("   Key: {}", mask_secret(api_key, 20, 4)));
        lines.push(String::new());

        match self.patch_global_config(api_key) {
            Some(GlobalPatch {
                path,
                changed: true,
            }) => lines.push(format!("✅ Updated openclaw.json → {}", path.display())),
            Some(GlobalPatch {
                path,
                changed: false,
            }) => lines.push(format!(
                "✅ openclaw.json already in sync → {}",
                path.display()
            )),
            None => lines.push("⚠️  Could not update openclaw.json".to_string()),
        }

        let report = self.patch_agent_models(api_key);
        if report.updated.is_empty() {
            lines.push("   Agent models.json files already in sync (or none found)".to_string());
        } else {
            lines.push(format!(
                "✅ Updated agent models.json → [{}]",
                report.updated.join(", ")
            ));
        }
        for (agent, message) in &report.failures {
            lines.push(format!(
                "   ⚠️  Could not update {}/models.json: {}",
                agent, message
            ));
        }

        lines.push(String::new());
        lines.push(RESTART_HINT.to_string());
    }

    /// Points `models.providers.ollama-cloud.apiKey` of the first usable global
    /// config candidate at `api_key`.
    fn patch_global_config(&self, api_key: &str) -> Option<GlobalPatch> {
        first_match(&self.config.global_config_candidates(), |path| {
            match self.try_patch_global_config(path, api_key) {
                Ok(Some(changed)) => Some(GlobalPatch {
                    path: path.to_path_buf(),
                    changed,
                }),
                Ok(None) => None,
                Err(err) => {
                    self.log_event(RotatorEvent::GlobalConfigCandidateFailed {
                        path: path.display().to_string(),
                        error: err.message,
                    });
                    None
                }
            }
        })
    }

    fn try_patch_global_config(&self, path: &Path, api_key: &str) -> CliResult<Option<bool>> {
        let mut root = read_json_document(path)?;
        let Some(provider) =
            json_at_mut(&mut root, &["models", "providers", OLLAMA_CLOUD_PROVIDER])
                .and_then(Value::as_object_mut)
        else {
            return Ok(None);
        };
        if !set_string_field(provider, "apiKey", api_key) {
            return Ok(Some(false));
        }

        write_json_document(path, &root)?;
        self.log_event(RotatorEvent::GlobalConfigPatched {
            path: path.display().to_string(),
            key_fingerprint: key_fingerprint(api_key),
        });
        Ok(Some(true))
    }

    fn agent_names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.config.agents_dir) else {
            return Vec::new();
        };
        let mut names = entries
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_type()
                    .map(|file_type| file_type.is_dir())
                    .unwrap_or(false)
            })
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    fn agent_document_path(&self, agent: &str, file_name: &str) -> PathBuf {
        self.config.agents_dir.join(agent).join("agent").join(file_name)
    }

    /// Updates the `ollama-cloud` key of every agent's `models.json`. A broken
    /// agent config is recorded and skipped.
    fn patch_agent_models(&self, api_key: &str) -> AgentPatchReport {
        let mut report = AgentPatchReport::default();
        for agent in self.agent_names() {
            let models_path = self.agent_document_path(&agent, MODELS_FILE);
            if !models_path.exists() {
                continue;
            }

            match try_patch_agent_models(&models_path, api_key) {
                Ok(true) => {
                    self.log_event(RotatorEvent::AgentModelsPatched {
                        agent: agent.clone(),
                        key_fingerprint: key_fingerprint(api_key),
                    });
                    report.updated.push(agent);
                }
                Ok(false) => {}
                Err(err) => {
                    self.log_event(RotatorEvent::AgentModelsPatchFailed {
                        agent: agent.clone(),
                        error: err.message.clone(),
                    });
                    report.failures.push((agent, err.message));
                }
            }
        }
        report
    }

    fn sync_all_configs(&self, options: SyncOptions) -> CliResult<()> {
        let report = self.sync_report(options)?;
        for line in &report.lines {
            println!("{}", line);
        }
        Ok(())
    }

    fn sync_report(&self, options: SyncOptions) -> CliResult<SyncReport> {
        let global_path = &self.config.global_config_path;
        if !global_path.exists() {
            return Err(CliError::new(
                format!("missing global config: {}", global_path.display()),
                1,
            ));
        }
        let root = read_json_document(global_path)?;
        let source = SyncSource::from_config(&root);
        let trace_id = next_trace_id();

        let mut report = SyncReport::default();
        report.lines.push(String::new());
        report.lines.push("🔄 OpenClaw Config Sync".to_string());
        report.lines.push(SEPARATOR.to_string());
        if options.dry_run {
            report
                .lines
                .push("   [DRY RUN - no files will be modified]".to_string());
            report.lines.push(String::new());
        }

        report.lines.push(format!(
            "📋 Source of truth: {}",
            global_path.display()
        ));
        report.lines.push(format!(
            "   ollama-cloud key: {}",
            describe_source_key(source.ollama_cloud_key.as_deref())
        ));
        report.lines.push(format!(
            "   google key: {}",
            describe_source_key(source.google_key.as_deref())
        ));
        report.lines.push(format!(
            "   kimi-coding key: {}",
            describe_source_key(source.kimi_key.as_deref())
        ));
        report.lines.push(format!(
            "   gateway: {} (token: {})",
            source.gateway_url,
            if source.gateway_token.is_some() {
                "✅"
            } else {
                "❌"
            }
        ));
        report.lines.push(String::new());

        if !self.config.agents_dir.is_dir() {
            report.lines.push(format!(
                "No agents directory at {}",
                self.config.agents_dir.display()
            ));
            return Ok(report);
        }

        let agents = self.agent_names();
        report.lines.push(format!(
            "📂 Found {} agent(s): {}",
            agents.len(),
            agents.join(", ")
        ));
        report.lines.push(String::new());

        for agent in &agents {
            let agent_dir = self.config.agents_dir.join(agent).join("agent");
            if !agent_dir.is_dir() {
                continue;
            }

            report.lines.push(format!("🤖 Agent: {}", agent));
            self.sync_document(
                &mut report,
                &trace_id,
                agent,
                &agent_dir.join(MODELS_FILE),
                options,
                |root| Ok(sync_models_document(root, &source, &self.environment)),
            );
            self.sync_document(
                &mut report,
                &trace_id,
                agent,
                &agent_dir.join(AUTH_PROFILES_FILE),
                options,
                |root| sync_auth_profiles_document(root, &source, options.clear_cooldowns),
            );
            report.lines.push(String::new());
        }

        report.lines.push(SEPARATOR.to_string());
        if options.dry_run {
            report.lines.push(format!(
                "🔍 Dry run complete. {} file(s) would be updated.",
                report.files_changed
            ));
        } else {
            report.lines.push(format!(
                "✅ Sync complete. {} file(s) updated.",
                report.files_changed
            ));
        }
        if !report.failures.is_empty() {
            report.lines.push(format!(
                "⚠️  {} document(s) could not be synced",
                report.failures.len()
            ));
        }
        report.lines.push(RESTART_HINT.to_string());
        report.lines.push(String::new());
        Ok(report)
    }

    fn sync_document<F>(
        &self,
        report: &mut SyncReport,
        trace_id: &str,
        agent: &str,
        path: &Path,
        options: SyncOptions,
        reconcile: F,
    ) where
        F: FnOnce(&mut Value) -> CliResult<DocumentSync>,
    {
        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        if !path.exists() {
            report
                .lines
                .push(format!("   {}: not found (skipping)", label));
            return;
        }

        let result = read_json_document(path).and_then(|mut root| {
            let sync = reconcile(&mut root)?;
            if sync.changed && !options.dry_run {
                write_json_document(path, &root)?;
            }
            Ok(sync)
        });

        match result {
            Ok(sync) => {
                for note in &sync.notes {
                    report.lines.push(format!("   {}: {}", label, note));
                }
                if sync.changed {
                    report.files_changed += 1;
                    if !options.dry_run {
                        self.log_event(RotatorEvent::SyncDocumentUpdated {
                            trace_id: trace_id.to_string(),
                            agent: agent.to_string(),
                            document: label.clone(),
                        });
                    }
                }
            }
            Err(err) => {
                self.log_event(RotatorEvent::SyncDocumentFailed {
                    trace_id: trace_id.to_string(),
                    agent: agent.to_string(),
                    document: label.clone(),
                    error: err.message.clone(),
                });
                report
                    .lines
                    .push(format!("   ❌ {} error: {}", label, err.message));
                report.failures.push(format!("{}/{}", agent, label));
            }
        }
    }

    fn validate_keys(&self, json: bool) -> CliResult<()> {
        if json {
            let results = self.validate_keys_with(|_| {});
            let json_string = serde_json::to_string_pretty(&results).map_err(|err| {
                CliError::new(format!("failed to serialize validation output: {}", err), 1)
            })?;
            println!("{}", json_string);
            return Ok(());
        }

        println!();
        println!("🔍 Validating Ollama Cloud API keys...");
        println!();
        let results = self.validate_keys_with(|validation| println!("{}", validation.line()));
        for line in validation_summary_lines(&results) {
            println!("{}", line);
        }
        Ok(())
    }

    /// Probes every API-key account one at a time, in registry order.
    fn validate_keys_with<F>(&self, mut on_result: F) -> Vec<KeyValidation>
    where
        F: FnMut(&KeyValidation),
    {
        let mut results = Vec::new();
        for (account, env_var) in self.registry.api_key_accounts() {
            let result = self.environment.get(env_var).map(|api_key| {
                let result = (self.ollama_probe)(api_key);
                self.log_probe_result(&account.selector(), api_key, &result);
                result
            });

            let validation = KeyValidation {
                account_id: account.id,
                label: account.selector(),
                env_var: env_var.to_string(),
                missing: result.is_none(),
                ok: result.as_ref().is_some_and(ProbeResult::ok),
                result,
            };
            on_result(&validation);
            results.push(validation);
        }
        results
    }

    fn validate_gemini(&self) -> CliResult<()> {
        let result = self.gemini_validation()?;
        for line in gemini_report_lines(&result) {
            println!("{}", line);
        }
        Ok(())
    }

    fn gemini_validation(&self) -> CliResult<ProbeResult> {
        let api_key = self
            .environment
            .get(GEMINI_KEY_VAR)
            .ok_or_else(|| CliError::new(format!("{} not found in .env", GEMINI_KEY_VAR), 1))?;
        let result = (self.gemini_probe)(api_key);
        self.log_probe_result("gemini", api_key, &result);
        Ok(result)
    }

    fn log_probe_result(&self, label: &str, api_key: &str, result: &ProbeResult) {
        self.log_event(RotatorEvent::KeyProbeResult {
            label: label.to_string(),
            key_fingerprint: key_fingerprint(api_key),
            outcome: result.outcome,
            status: result.status_code,
            message: result.message.clone(),
        });
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("claw-rotator: {}", err.message);
        std::process::exit(err.exit_code);
    }
}

fn run() -> CliResult<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = CliCommand::parse(&args)?;
    execute(command, default_home_dir())
}

fn execute(command: CliCommand, home_dir: PathBuf) -> CliResult<()> {
    if matches!(command, CliCommand::Help) {
        println!("{}", usage_text());
        return Ok(());
    }
    let app = RotatorApp::new(home_dir)?;

    match command {
        CliCommand::Help => Ok(()),
        CliCommand::Status => app.status(),
        CliCommand::List => app.list_accounts(),
        CliCommand::Switch(target) => app.switch_account(&target),
        CliCommand::Sync(options) => app.sync_all_configs(options),
        CliCommand::ValidateKeys { json } => app.validate_keys(json),
        CliCommand::ValidateGemini => app.validate_gemini(),
    }
}

fn usage_text() -> &'static str {
    "claw-rotator - Ollama cloud account rotator for OpenClaw\n\n\
     Usage:\n\
       claw-rotator status                         Show the active account\n\
       claw-rotator list                           List known accounts and credential presence\n\
       claw-rotator switch <id|alias|status>       Switch the active account and patch configs\n\
       claw-rotator sync-all-configs [--clear-cooldowns] [--dry-run]\n\
                                                   Sync agent configs from openclaw.json\n\
       claw-rotator validate-keys [--json]         Probe every Ollama API key\n\
       claw-rotator validate-gemini                Probe GEMINI_API_KEY\n\
       claw-rotator help                           Show this help"
}

fn default_home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_rotator_home(home_dir: &Path) -> PathBuf {
    home_dir.join(".openclaw/rotator")
}

fn process_environment() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

fn dotenv_candidates(
    home_dir: &Path,
    cwd: &Path,
    process_vars: &HashMap<String, String>,
) -> Vec<PathBuf> {
    let explicit = |name: &str| {
        process_vars
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    };

    let mut candidates = Vec::new();
    if let Some(path) = explicit(ROTATOR_ENV_FILE_VAR) {
        candidates.push(path);
    }
    candidates.push(cwd.join(".env"));
    candidates.push(
        explicit(ROTATOR_HOME_VAR)
            .unwrap_or_else(|| default_rotator_home(home_dir))
            .join(".env"),
    );
    candidates.push(home_dir.join(".openclaw/workspace/.env"));
    candidates
}

/// Walks `candidates` in order and returns the first result `probe` produces
/// for an existing path.
fn first_match<T, F>(candidates: &[PathBuf], mut probe: F) -> Option<T>
where
    F: FnMut(&Path) -> Option<T>,
{
    candidates
        .iter()
        .filter(|path| path.exists())
        .find_map(|path| probe(path))
}

fn parse_dotenv_contents(contents: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key.contains('#') {
            continue;
        }
        pairs.push((key.to_string(), strip_matching_quotes(value.trim()).to_string()));
    }
    pairs
}

fn strip_matching_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn endpoint_override(environment: &Environment, name: &str, default: &str) -> String {
    environment
        .get(name)
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| default.to_string())
}

fn try_patch_agent_models(path: &Path, api_key: &str) -> CliResult<bool> {
    let mut root = read_json_document(path)?;
    let Some(provider) = json_at_mut(&mut root, &["providers", OLLAMA_CLOUD_PROVIDER])
        .and_then(Value::as_object_mut)
    else {
        return Ok(false);
    };
    if non_empty_str(provider.get("apiKey")).is_none() {
        return Ok(false);
    }
    if !set_string_field(provider, "apiKey", api_key) {
        return Ok(false);
    }

    write_json_document(path, &root)?;
    Ok(true)
}

fn sync_models_document(
    root: &mut Value,
    source: &SyncSource,
    environment: &Environment,
) -> DocumentSync {
    let mut sync = DocumentSync::default();
    let Some(providers) = root.get_mut("providers").and_then(Value::as_object_mut) else {
        return sync;
    };

    if let Some(key) = source.ollama_cloud_key.as_deref() {
        if let Some(provider) = providers
            .get_mut(OLLAMA_CLOUD_PROVIDER)
            .and_then(Value::as_object_mut)
        {
            let previous = provider
                .get("apiKey")
                .and_then(Value::as_str)
                .map(|value| secret_prefix(value, 8))
                .unwrap_or_else(|| "none".to_string());
            if set_string_field(provider, "apiKey", key) {
                sync.record(format!(
                    "ollama-cloud key {}... → {}...",
                    previous,
                    secret_prefix(key, 8)
                ));
            } else {
                sync.note("ollama-cloud key ✅ already in sync");
            }
        }
    }

    let glass_providers = providers
        .keys()
        .filter(|name| name.starts_with(GLASS_PROVIDER_PREFIX))
        .cloned()
        .collect::<Vec<_>>();
    for name in glass_providers {
        let Some(provider) = providers.get_mut(&name).and_then(Value::as_object_mut) else {
            continue;
        };
        if non_empty_str(provider.get("apiKey")).is_none() {
            continue;
        }
        let env_var = glass_provider_env_var(&name[GLASS_PROVIDER_PREFIX.len()..]);
        let Some(fresh_key) = environment.get(&env_var) else {
            continue;
        };
        if set_string_field(provider, "apiKey", fresh_key) {
            sync.record(format!("{} key → updated from .env", name));
        }
    }

    if let Some(key) = source.google_key.as_deref() {
        if let Some(provider) = providers
            .get_mut(GOOGLE_PROVIDER)
            .and_then(Value::as_object_mut)
        {
            if set_string_field(provider, "apiKey", key) {
                sync.record("google key → updated");
            }
        }
    }

    if let Some(key) = source.kimi_key.as_deref() {
        for name in KIMI_PROVIDERS {
            let Some(provider) = providers.get_mut(name).and_then(Value::as_object_mut) else {
                continue;
            };
            if non_empty_str(provider.get("apiKey")).is_none() {
                continue;
            }
            if set_string_field(provider, "apiKey", key) {
                sync.record(format!("{} key → updated", name));
            }
        }
    }

    sync
}

fn sync_auth_profiles_document(
    root: &mut Value,
    source: &SyncSource,
    clear_cooldowns: bool,
) -> CliResult<DocumentSync> {
    let mut sync = DocumentSync::default();
    let document = root
        .as_object_mut()
        .ok_or_else(|| CliError::new("auth profiles document is not a JSON object", 1))?;

    if let Some(token) = source.gateway_token.as_deref() {
        let gateway = serde_json::json!({
            "url": source.gateway_url,
            "token": token,
        });
        if document.get("gateway") == Some(&gateway) {
            sync.note("gateway ✅ in sync");
        } else {
            document.insert("gateway".to_string(), gateway);
            sync.record(format!("gateway → {}", source.gateway_url));
        }
    }

    if clear_cooldowns {
        if let Some(usage_stats) = document
            .get_mut("usageStats")
            .and_then(Value::as_object_mut)
        {
            let mut cleared = 0;
            for (profile_id, stats) in usage_stats.iter_mut() {
                let Some(stats) = stats.as_object_mut() else {
                    continue;
                };
                if is_positive(stats.get("cooldownUntil")) {
                    stats.insert("cooldownUntil".to_string(), Value::from(0));
                    stats.insert("errorCount".to_string(), Value::from(0));
                    stats.insert("failureCounts".to_string(), Value::Object(Map::new()));
                    sync.record(format!("clearing cooldown on {}", profile_id));
                    cleared += 1;
                }
                if is_positive(stats.get("disabledUntil")) {
                    stats.insert("disabledUntil".to_string(), Value::from(0));
                    stats.shift_remove("disabledReason");
                    sync.record(format!("clearing disabled on {}", profile_id));
                    cleared += 1;
                }
            }
            if cleared == 0 {
                sync.note("no stale cooldowns");
            }
        }
    }

    Ok(sync)
}

fn glass_provider_env_var(suffix: &str) -> String {
    if suffix == "1" {
        GLASS_KEY_VAR.to_string()
    } else {
        format!("{}_{}", GLASS_KEY_VAR, suffix)
    }
}

fn provider_api_key(root: &Value, provider: &str) -> Option<String> {
    non_empty_str(json_at(root, &["models", "providers", provider, "apiKey"])).map(str::to_string)
}

fn describe_source_key(key: Option<&str>) -> String {
    match key {
        Some(key) => format!("{}...", secret_prefix(key, 12)),
        None => "❌ MISSING".to_string(),
    }
}

fn is_positive(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_f64)
        .is_some_and(|number| number > 0.0)
}

/// Sets `object[field]` to `value`; returns whether the stored value changed.
fn set_string_field(object: &mut Map<String, Value>, field: &str, value: &str) -> bool {
    if object.get(field).and_then(Value::as_str) == Some(value) {
        return false;
    }
    object.insert(field.to_string(), Value::String(value.to_string()));
    true
}

fn read_json_document(path: &Path) -> CliResult<Value> {
    let data = fs::read(path)
        .map_err(|err| CliError::new(format!("failed to read {}: {}", path.display(), err), 1))?;
    serde_json::from_slice::<Value>(&data)
        .map_err(|err| CliError::new(format!("failed to parse {}: {}", path.display(), err), 1))
}

fn write_json_document(path: &Path, root: &Value) -> CliResult<()> {
    let mut text = serde_json::to_string_pretty(root).map_err(|err| {
        CliError::new(format!("failed to encode {}: {}", path.display(), err), 1)
    })?;
    text.push('\n');
    write_file_atomic(path, text.as_bytes())
}

fn probe_ollama_key(endpoint: &str, api_key: &str, timeout: Duration) -> ProbeResult {
    let client = match reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            return ProbeResult::error(None, format!("failed to build HTTP client: {}", err))
        }
    };

    let body = serde_json::json!({
        "model": OLLAMA_PROBE_MODEL,
        "messages": [{ "role": "user", "content": "hi" }],
        "stream": false,
    });
    match client
        .post(endpoint)
        .header("User-Agent", "claw-rotator/0.1")
        .bearer_auth(api_key)
        .json(&body)
        .send()
    {
        Ok(response) => read_probe_response(response),
        Err(err) => classify_transport_error(&err),
    }
}

fn probe_gemini_key(api_base: &str, api_key: &str, timeout: Duration) -> ProbeResult {
    let client = match reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            return ProbeResult::error(None, format!("failed to build HTTP client: {}", err))
        }
    };

    let endpoint = format!(
        "{}/models/{}:generateContent",
        api_base.trim_end_matches('/'),
        GEMINI_PROBE_MODEL
    );
    let body = serde_json::json!({
        "contents": [{ "parts": [{ "text": "Hi" }] }],
    });
    match client
        .post(&endpoint)
        .query(&[("key", api_key)])
        .header("User-Agent", "claw-rotator/0.1")
        .json(&body)
        .send()
    {
        Ok(response) => read_probe_response(response),
        Err(err) => classify_transport_error(&err),
    }
}

fn read_probe_response(response: reqwest::blocking::Response) -> ProbeResult {
    let status_code = response.status().as_u16();
    match response.text() {
        Ok(body) => classify_probe_response(status_code, &body),
        Err(err) => classify_transport_error(&err),
    }
}

fn classify_probe_response(status_code: u16, body: &str) -> ProbeResult {
    match status_code {
        200 => ProbeResult::success(status_code),
        429 => ProbeResult::rate_limited(
            extract_error_message(body).unwrap_or_else(|| "rate limited".to_string()),
        ),
        _ => ProbeResult::error(
            Some(status_code),
            extract_error_message(body)
                .unwrap_or_else(|| collapse_whitespace(&truncate_chars(body, 100))),
        ),
    }
}

/// Connection failures are reported alongside timeouts: both mean the
/// endpoint never answered.
fn classify_transport_error(err: &reqwest::Error) -> ProbeResult {
    if err.is_timeout() || err.is_connect() {
        ProbeResult::timeout(err.to_string())
    } else {
        ProbeResult::error(None, err.to_string())
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let root = serde_json::from_str::<Value>(body).ok()?;
    root.get("error")
        .and_then(Value::as_str)
        .or_else(|| json_at(&root, &["error", "message"]).and_then(Value::as_str))
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(str::to_string)
}

fn validation_summary_lines(results: &[KeyValidation]) -> Vec<String> {
    let working = results
        .iter()
        .filter(|validation| validation.ok)
        .map(|validation| validation.label.as_str())
        .collect::<Vec<_>>();

    let mut lines = vec![String::new(), SEPARATOR.to_string()];
    if let Some(first) = working.first() {
        lines.push(format!(
            "✅ {} key(s) working: {}",
            working.len(),
            working.join(", ")
        ));
        lines.push(String::new());
        lines.push(format!("   Switch to one:  claw-rotator switch {}", first));
    } else {
        lines.push("❌ No keys currently usable (all rate limited or missing).".to_string());
        lines.push("   Wait for session/weekly reset, or add a new account key.".to_string());
    }
    lines.push(String::new());
    lines
}

fn gemini_report_lines(result: &ProbeResult) -> Vec<String> {
    let icon = if result.ok() { "✅" } else { "❌" };
    let mut lines = vec![
        String::new(),
        "🔍 Validating Gemini API key...".to_string(),
        String::new(),
        format!("   Gemini ({}): {}  {}", GEMINI_PROBE_MODEL, icon, result.detail()),
        String::new(),
        SEPARATOR.to_string(),
    ];
    if result.ok() {
        lines.push("✅ Gemini API key is working".to_string());
    } else {
        lines.push("❌ Gemini API key is not working".to_string());
    }
    lines.push(String::new());
    lines
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Stable, non-reversible label for an API key in the event log.
fn key_fingerprint(api_key: &str) -> String {
    format!("sha256:{}", &sha256_hex(api_key.as_bytes())[..16])
}

/// Correlates the per-document events of one sync run.
fn next_trace_id() -> String {
    let sequence = TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = format!(
        "{}:{}:{}",
        Utc::now().timestamp_micros(),
        std::process::id(),
        sequence
    );
    format!("sync-{}", &sha256_hex(seed.as_bytes())[..12])
}

fn secret_prefix(secret: &str, max_chars: usize) -> String {
    truncate_chars(secret, max_chars)
}

/// `head...tail` rendering of a secret; short secrets never reveal more than
/// half of their characters.
fn mask_secret(secret: &str, head: usize, tail: usize) -> String {
    let chars = secret.chars().collect::<Vec<_>>();
    if chars.len() <= head + tail {
        let visible = chars.len() / 2;
        return format!("{}...", chars[..visible].iter().collect::<String>());
    }
    format!(
        "{}...{}",
        chars[..head].iter().collect::<String>(),
        chars[chars.len() - tail..].iter().collect::<String>()
    )
}

fn json_at<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, key| node.get(*key))
}

fn json_at_mut<'a>(root: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
    path.iter().try_fold(root, |node, key| node.get_mut(*key))
}

/// Credential strings are taken verbatim; only an empty string counts as unset.
fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|raw| !raw.is_empty())
}

fn value_as_port(value: &Value) -> Option<u64> {
    let port = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    (port > 0).then_some(port)
}

fn write_file_atomic(path: &Path, data: &[u8]) -> CliResult<()> {
    // Write through symlinks so a linked config keeps pointing at the updated file.
    let target = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let path = target.as_path();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        Some(_) => Path::new("."),
        None => {
            return Err(CliError::new(
                format!("invalid target path: {}", path.display()),
                1,
            ))
        }
    };
    fs::create_dir_all(parent).map_err(|err| {
        CliError::new(
            format!("failed to create dir {}: {}", parent.display(), err),
            1,
        )
    })?;

    let existing_permissions = fs::metadata(path).ok().map(|metadata| metadata.permissions());
    let mut temp_file = NamedTempFile::new_in(parent)
        .map_err(|err| CliError::new(format!("failed to create temp file: {}", err), 1))?;
    temp_file
        .write_all(data)
        .map_err(|err| CliError::new(format!("failed to write temp file: {}", err), 1))?;
    if let Some(permissions) = existing_permissions {
        let _ = temp_file.as_file().set_permissions(permissions);
    }

    temp_file.persist(path).map_err(|err| {
        CliError::new(format!("failed to persist {}: {}", path.display(), err), 1)
    })?;
    Ok(())
}

fn truncate_chars(raw: &str, max_chars: usize) -> String {
    raw.chars().take(max_chars).collect::<String>()
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
