//! Agent runtime.
//!
//! Owns per-conversation sessions for the stdio agent protocol
//! ([`crate::protocol`]). Each session exclusively owns one MCP bridge and a
//! set of session-scoped overrides (repo scope, model, grounded flag,
//! content type) that slash commands mutate. Questions are forwarded to the
//! tool server as `ask_code` calls and the answer is streamed back in
//! paragraph fragments.
//!
//! # Prompt state machine
//!
//! `Idle → Handling → (Command | AskCode) → Streaming → Idle`. A per-session
//! mutex serializes prompts; a fresh cancel token is installed at the start
//! of each prompt and observed before the bridge call, while awaiting it,
//! and between streamed fragments.
//!
//! # Bridge hot-swap
//!
//! `/model` and `/model profile:<name>` change the effective LLM runtime.
//! The agent starts a new bridge with the updated child environment, then
//! closes the previous one. If the new bridge fails to start, the override
//! snapshot is restored and the old bridge is kept.
//!
//! User-facing reply strings are intentionally in Portuguese, matching the
//! product surface this agent serves.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bridge::{resolve_mcp_command, AskBridge, BridgeError, McpBridge, McpBridgeConfig};
use crate::config::{is_truthy, parse_csv, parse_tristate, resolve_repo_root};
use crate::paragraph::{chunk_by_paragraph, DEFAULT_PARAGRAPH_MAX_SIZE};
use crate::profiles::{load_profiles, profiles_path, select_profile};
use crate::protocol::{
    blocks_to_text, AgentInfo, AvailableCommand, InitializeParams, InitializeResult,
    NewSessionResult, PromptParams, PromptResult, SessionNotification, SessionUpdate, StopReason,
};

pub const AGENT_NAME: &str = "codescout-acp";
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix of the optional meta passthrough update.
pub const META_PASSTHROUGH_PREFIX: &str = "__ACP_META__";

/// Environment lookup used by the agent (injectable in tests).
pub type EnvFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Builds a bridge for the given child-environment overrides.
pub type BridgeFactory =
    Arc<dyn Fn(HashMap<String, String>) -> Result<Arc<dyn AskBridge>, BridgeError> + Send + Sync>;

/// Outbound channel to the remote client.
#[async_trait]
pub trait AcpClient: Send + Sync {
    async fn session_update(&self, notification: SessionNotification);
}

/// Session-scoped overrides mutated by slash commands.
#[derive(Debug, Clone, Default)]
pub struct SessionOverrides {
    pub repo: Option<String>,
    pub model: Option<String>,
    pub model_profile: Option<String>,
    pub provider: Option<String>,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub grounded: Option<bool>,
    pub content_type: Option<String>,
}

/// Per-conversation mutable state. Created on `new_session`, destroyed on
/// process exit.
pub struct SessionState {
    cancel: Mutex<CancellationToken>,
    prompt_lock: Mutex<()>,
    bridge: Mutex<Arc<dyn AskBridge>>,
    overrides: Mutex<SessionOverrides>,
}

/// The agent: session table plus the collaborators needed to run prompts.
pub struct Agent {
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
    client: Arc<dyn AcpClient>,
    bridge_factory: BridgeFactory,
    env: EnvFn,
}

/// Production bridge factory: spawn the tool server from `MCP_COMMAND` with
/// the session's override variables layered on the inherited environment.
pub fn mcp_bridge_factory(env: EnvFn) -> BridgeFactory {
    Arc::new(move |overrides_env: HashMap<String, String>| {
        let command = resolve_mcp_command(|key| env(key))?;
        Ok(Arc::new(McpBridge::new(McpBridgeConfig {
            command,
            env: overrides_env,
        })) as Arc<dyn AskBridge>)
    })
}

fn random_session_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("session-{}", &hex[..12])
}

fn available_commands() -> Vec<AvailableCommand> {
    vec![
        AvailableCommand {
            name: "config".to_string(),
            hint: None,
        },
        AvailableCommand {
            name: "repo".to_string(),
            hint: Some("<repo[,repo2,...]>".to_string()),
        },
        AvailableCommand {
            name: "model".to_string(),
            hint: Some("<model|perfil|reset>".to_string()),
        },
        AvailableCommand {
            name: "grounded".to_string(),
            hint: Some("<on|off|reset>".to_string()),
        },
        AvailableCommand {
            name: "content-type".to_string(),
            hint: Some("<code|docs|all|reset>".to_string()),
        },
    ]
}

/// Slash-command name with hyphens collapsed, or `None` for plain text.
fn parse_slash_command(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim();
    let token = trimmed.split_whitespace().next()?;
    let name = token.strip_prefix('/')?;
    let collapsed = name.replace('-', "").to_lowercase();
    match collapsed.as_str() {
        "config" | "repo" | "model" | "grounded" | "contenttype" => {
            let args = trimmed[token.len()..].trim().to_string();
            Some((collapsed, args))
        }
        _ => None,
    }
}

impl Agent {
    pub fn new(client: Arc<dyn AcpClient>, bridge_factory: BridgeFactory, env: EnvFn) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            client,
            bridge_factory,
            env,
        }
    }

    fn env_str(&self, key: &str) -> Option<String> {
        (self.env)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn env_first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.env_str(key))
    }

    pub async fn initialize(&self, params: InitializeParams) -> InitializeResult {
        InitializeResult {
            protocol_version: params.protocol_version,
            agent_info: AgentInfo {
                name: AGENT_NAME.to_string(),
                version: AGENT_VERSION.to_string(),
            },
        }
    }

    /// Allocate a session, eagerly start its bridge, and announce the
    /// available slash commands.
    pub async fn new_session(&self) -> Result<NewSessionResult, BridgeError> {
        let bridge = (self.bridge_factory)(HashMap::new())?;
        bridge.start().await?;

        let session_id = random_session_id();
        let state = Arc::new(SessionState {
            cancel: Mutex::new(CancellationToken::new()),
            prompt_lock: Mutex::new(()),
            bridge: Mutex::new(bridge),
            overrides: Mutex::new(SessionOverrides::default()),
        });
        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), state);

        info!(session_id = %session_id, "session created");
        self.client
            .session_update(SessionNotification {
                session_id: session_id.clone(),
                update: SessionUpdate::AvailableCommandsUpdate {
                    available_commands: available_commands(),
                },
            })
            .await;

        Ok(NewSessionResult { session_id })
    }

    async fn send_text(&self, session_id: &str, text: String) {
        self.client
            .session_update(SessionNotification {
                session_id: session_id.to_string(),
                update: SessionUpdate::AgentMessageText { text },
            })
            .await;
    }

    /// Handle one prompt. Failures never escape: they become a reply text
    /// plus `end_turn`, or `refusal` for structural problems.
    pub async fn prompt(&self, params: PromptParams) -> PromptResult {
        let Some(session) = self.sessions.lock().await.get(&params.session_id).cloned() else {
            return PromptResult {
                stop_reason: StopReason::Refusal,
            };
        };

        let question = blocks_to_text(&params.prompt);
        if question.is_empty() {
            return PromptResult {
                stop_reason: StopReason::Refusal,
            };
        }

        let cancel = CancellationToken::new();
        *session.cancel.lock().await = cancel.clone();

        let _prompt_guard = session.prompt_lock.lock().await;

        if let Some((command, args)) = parse_slash_command(&question) {
            let reply = self
                .handle_command(&params.session_id, &session, &command, &args)
                .await;
            self.send_text(&params.session_id, reply).await;
            return PromptResult {
                stop_reason: StopReason::EndTurn,
            };
        }

        if cancel.is_cancelled() {
            return PromptResult {
                stop_reason: StopReason::Cancelled,
            };
        }

        let payload = {
            let overrides = session.overrides.lock().await.clone();
            Value::Object(self.build_ask_payload(&overrides, Some(&question)))
        };

        let bridge = session.bridge.lock().await.clone();
        let result = match bridge.ask_code(payload, cancel.clone()).await {
            Ok(result) => result,
            Err(BridgeError::Cancelled) => {
                return PromptResult {
                    stop_reason: StopReason::Cancelled,
                };
            }
            Err(err) => {
                warn!(error = %err, "ask_code failed");
                bridge.close().await;
                self.send_text(
                    &params.session_id,
                    format!("Falha ao consultar o MCP.\n{err}"),
                )
                .await;
                return PromptResult {
                    stop_reason: StopReason::EndTurn,
                };
            }
        };

        let show_meta = self.env_str("ACP_SHOW_META").as_deref().map(is_truthy) == Some(true);
        let show_context = self.env_str("ACP_SHOW_CONTEXT").as_deref().map(is_truthy) == Some(true);
        if show_meta || show_context {
            let mut extra = Map::new();
            if show_meta {
                extra.insert(
                    "meta".to_string(),
                    result.get("meta").cloned().unwrap_or(Value::Null),
                );
            }
            if show_context {
                extra.insert(
                    "evidences".to_string(),
                    result.get("evidences").cloned().unwrap_or(Value::Null),
                );
            }
            self.send_text(
                &params.session_id,
                format!("{META_PASSTHROUGH_PREFIX}{}", Value::Object(extra)),
            )
            .await;
        }

        let answer = result
            .get("answer")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let slow_stream = self
            .env_str("ACP_TEST_SLOW_STREAM")
            .and_then(|v| v.parse::<f64>().ok());

        for fragment in chunk_by_paragraph(&answer, DEFAULT_PARAGRAPH_MAX_SIZE) {
            if cancel.is_cancelled() {
                return PromptResult {
                    stop_reason: StopReason::Cancelled,
                };
            }
            self.send_text(&params.session_id, fragment).await;
            if let Some(delay) = slow_stream {
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
            }
        }

        PromptResult {
            stop_reason: StopReason::EndTurn,
        }
    }

    /// Idempotent, non-blocking cancel: raise the signal and abort the
    /// bridge; never waits for prompt cleanup.
    pub async fn cancel(&self, session_id: &str) {
        let Some(session) = self.sessions.lock().await.get(session_id).cloned() else {
            return;
        };
        session.cancel.lock().await.cancel();
        let bridge = session.bridge.lock().await.clone();
        bridge.abort().await;
    }

    /// Close every session bridge. Called on SIGTERM and process exit.
    pub async fn cleanup_all_sessions(&self) {
        let sessions: Vec<Arc<SessionState>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            let bridge = session.bridge.lock().await.clone();
            bridge.close().await;
        }
    }

    // ── effective configuration ─────────────────────────────────────────

    fn effective_repos(&self, overrides: &SessionOverrides) -> Vec<String> {
        let csv = overrides
            .repo
            .clone()
            .or_else(|| self.env_str("ACP_REPO"))
            .unwrap_or_default();
        let mut repos = Vec::new();
        for repo in parse_csv(&csv) {
            if !repos.contains(&repo) {
                repos.push(repo);
            }
        }
        repos
    }

    fn scope_value(repos: &[String]) -> Value {
        match repos {
            [] => json!({"type": "all"}),
            [repo] => json!({"type": "repo", "repo": repo}),
            many => json!({"type": "repos", "repos": many}),
        }
    }

    fn effective_model(&self, overrides: &SessionOverrides) -> Option<String> {
        overrides.model.clone().or_else(|| self.env_str("LLM_MODEL"))
    }

    fn env_provider(&self) -> Option<String> {
        self.env_first(&["LLM_MODEL_PROVIDER", "LLM_PROVIDER"])
    }

    fn env_api_url(&self) -> Option<String> {
        self.env_first(&["LLM_MODEL_API_URL", "LLM_API_BASE_URL"])
    }

    fn env_api_key(&self) -> Option<String> {
        self.env_first(&["LLM_MODEL_API_KEY", "LLM_API_KEY", "OPENAI_API_KEY"])
    }

    fn env_grounded(&self) -> Option<bool> {
        self.env_str("ACP_GROUNDED").and_then(|v| parse_tristate(&v))
    }

    fn env_content_type(&self) -> Option<String> {
        self.env_str("ACP_CONTENT_TYPE")
            .map(|v| v.to_lowercase())
            .filter(|v| matches!(v.as_str(), "code" | "docs" | "all"))
    }

    fn effective_grounded(&self, overrides: &SessionOverrides) -> bool {
        overrides
            .grounded
            .or_else(|| self.env_grounded())
            .unwrap_or(false)
    }

    fn effective_content_type(&self, overrides: &SessionOverrides) -> Option<String> {
        overrides
            .content_type
            .clone()
            .or_else(|| self.env_content_type())
    }

    /// The exact `ask_code` arguments for the current effective config.
    /// Only meaningful keys are included.
    fn build_ask_payload(
        &self,
        overrides: &SessionOverrides,
        query: Option<&str>,
    ) -> Map<String, Value> {
        let mut payload = Map::new();
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            payload.insert("query".to_string(), json!(query));
        }

        let repos = self.effective_repos(overrides);
        payload.insert("scope".to_string(), Self::scope_value(&repos));

        if let Some(top_k) = self
            .env_str("ACP_TOPK")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
        {
            payload.insert("topK".to_string(), json!(top_k));
        }

        if let Some(min_score) = self
            .env_str("ACP_MIN_SCORE")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| (0.0..=1.0).contains(v))
        {
            payload.insert("minScore".to_string(), json!(min_score));
        }

        if let Some(model) = self.effective_model(overrides) {
            payload.insert("llmModel".to_string(), json!(model));
        }

        if let Some(prefix) = self.env_str("ACP_PATH_PREFIX") {
            payload.insert("pathPrefix".to_string(), json!(prefix));
        }

        if let Some(language) = self.env_str("ACP_LANGUAGE") {
            payload.insert("language".to_string(), json!(language));
        }

        if self.effective_grounded(overrides) {
            payload.insert("grounded".to_string(), json!(true));
        }

        if let Some(content_type) = self.effective_content_type(overrides) {
            payload.insert("contentType".to_string(), json!(content_type));
        }

        if self.env_str("ACP_STRICT").as_deref().map(is_truthy) == Some(true) {
            payload.insert("strict".to_string(), json!(true));
        }

        payload
    }

    /// Snapshot of the effective runtime config reported by `/config`.
    fn config_snapshot(&self, overrides: &SessionOverrides) -> Value {
        let repos = self.effective_repos(overrides);
        let env_model = self.env_str("LLM_MODEL");
        let active_model = self.effective_model(overrides);
        let active_provider = overrides.provider.clone().or_else(|| self.env_provider());
        let active_api_url = overrides.api_url.clone().or_else(|| self.env_api_url());
        let active_api_key = overrides.api_key.clone().or_else(|| self.env_api_key());

        let grounded_env = self.env_grounded();
        let content_type_env = self.env_content_type();

        let mut filters = Map::new();
        filters.insert("pathPrefix".to_string(), json!(self.env_str("ACP_PATH_PREFIX")));
        filters.insert("language".to_string(), json!(self.env_str("ACP_LANGUAGE")));
        filters.insert(
            "topK".to_string(),
            json!(self.env_str("ACP_TOPK").and_then(|v| v.parse::<u64>().ok())),
        );
        filters.insert(
            "minScore".to_string(),
            json!(self.env_str("ACP_MIN_SCORE").and_then(|v| v.parse::<f64>().ok())),
        );
        filters.insert(
            "contentType".to_string(),
            json!(self.effective_content_type(overrides)),
        );
        filters.insert("grounded".to_string(), json!(self.effective_grounded(overrides)));
        filters.insert(
            "strict".to_string(),
            json!(self.env_str("ACP_STRICT").as_deref().map(is_truthy) == Some(true)),
        );

        json!({
            "repo": {
                "active": if repos.is_empty() { Value::Null } else { json!(repos.join(",")) },
                "override": overrides.repo,
            },
            "scope": Self::scope_value(&repos),
            "model": {
                "active": active_model,
                "override": overrides.model,
                "profile": overrides.model_profile,
                "env": env_model,
                "provider": {
                    "active": active_provider,
                    "override": overrides.provider,
                    "env": self.env_provider(),
                },
                "apiUrl": {
                    "active": active_api_url,
                    "override": overrides.api_url,
                    "env": self.env_api_url(),
                },
                "apiKey": {
                    "activeConfigured": active_api_key.is_some(),
                    "overrideConfigured": overrides.api_key.is_some(),
                    "envConfigured": self.env_api_key().is_some(),
                },
            },
            "grounded": {
                "active": self.effective_grounded(overrides),
                "override": overrides.grounded,
                "env": grounded_env,
            },
            "contentType": {
                "active": self.effective_content_type(overrides),
                "override": overrides.content_type,
                "env": content_type_env,
            },
            "filters": filters,
            "passthrough": {
                "showMeta": self.env_str("ACP_SHOW_META").as_deref().map(is_truthy) == Some(true),
                "showContext": self.env_str("ACP_SHOW_CONTEXT").as_deref().map(is_truthy)
                    == Some(true),
            },
            "codebaseRoot": self.env_str("CODEBASE_ROOT"),
            "askCodePayloadPreview": Value::Object(self.build_ask_payload(overrides, None)),
        })
    }

    // ── slash commands ──────────────────────────────────────────────────

    async fn handle_command(
        &self,
        _session_id: &str,
        session: &Arc<SessionState>,
        command: &str,
        args: &str,
    ) -> String {
        match command {
            "config" => {
                let overrides = session.overrides.lock().await.clone();
                let snapshot = self.config_snapshot(&overrides);
                let pretty =
                    serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_string());
                format!("Config atual:\n{pretty}")
            }
            "repo" => self.command_repo(session, args).await,
            "model" => self.command_model(session, args).await,
            "grounded" => self.command_grounded(session, args).await,
            "contenttype" => self.command_content_type(session, args).await,
            _ => "Comando desconhecido.".to_string(),
        }
    }

    async fn command_repo(&self, session: &Arc<SessionState>, args: &str) -> String {
        if args.is_empty() {
            let overrides = session.overrides.lock().await;
            let repos = self.effective_repos(&overrides);
            let source = if overrides.repo.is_some() { "sessão" } else { "env" };
            return if repos.is_empty() {
                "Nenhum repo configurado.".to_string()
            } else {
                format!("Repo atual: {} (fonte: {source}).", repos.join(","))
            };
        }

        let mut repos = Vec::new();
        for repo in parse_csv(args) {
            if !repos.contains(&repo) {
                repos.push(repo);
            }
        }
        if repos.is_empty() {
            return "Valor inválido. Use /repo <repo[,repo2,...]>.".to_string();
        }

        if let Some(codebase_root) = self.env_str("CODEBASE_ROOT") {
            let missing: Vec<&String> = repos
                .iter()
                .filter(|repo| !Path::new(&codebase_root).join(repo).is_dir())
                .collect();
            if !missing.is_empty() {
                return missing
                    .iter()
                    .map(|repo| format!("Repo '{repo}' não existe."))
                    .collect::<Vec<_>>()
                    .join("\n");
            }
        }

        let joined = repos.join(",");
        session.overrides.lock().await.repo = Some(joined.clone());
        if repos.len() == 1 {
            format!("Repo atualizado para: {joined}")
        } else {
            format!("Repos atualizados para: {joined}")
        }
    }

    async fn command_model(&self, session: &Arc<SessionState>, args: &str) -> String {
        if args.is_empty() {
            let overrides = session.overrides.lock().await;
            return match self.effective_model(&overrides) {
                Some(model) => match &overrides.model_profile {
                    Some(profile) => format!("Modelo atual: {model} (perfil: {profile})."),
                    None => format!("Modelo atual: {model}."),
                },
                None => "Nenhum modelo configurado.".to_string(),
            };
        }

        let arg = args.trim();
        if arg.eq_ignore_ascii_case("reset") || arg.eq_ignore_ascii_case("default") {
            let snapshot = {
                let mut overrides = session.overrides.lock().await;
                let snapshot = overrides.clone();
                overrides.model = None;
                overrides.model_profile = None;
                overrides.provider = None;
                overrides.api_url = None;
                overrides.api_key = None;
                snapshot
            };
            return match self.refresh_bridge(session, snapshot).await {
                Ok(()) => "Overrides de modelo removidos.".to_string(),
                Err(err) => format!("Falha ao reiniciar o MCP com o novo modelo.\n{err}"),
            };
        }

        if let Some(profile_name) = arg.strip_prefix("profile:") {
            let repo_root = resolve_repo_root(self.env_str("REPO_ROOT").as_deref());
            let path = profiles_path(&repo_root, |key| self.env_str(key));
            let profiles = match load_profiles(&path, |key| self.env_str(key)) {
                Ok(profiles) => profiles,
                Err(err) => return format!("Falha ao carregar perfis de modelo.\n{err}"),
            };
            let profile = match select_profile(&profiles, profile_name) {
                Ok(profile) => profile.clone(),
                Err(err) => return format!("Falha ao carregar perfis de modelo.\n{err}"),
            };

            let snapshot = {
                let mut overrides = session.overrides.lock().await;
                let snapshot = overrides.clone();
                overrides.model = Some(profile.model.clone());
                overrides.model_profile = Some(profile.name.clone());
                overrides.provider = profile.provider.clone();
                overrides.api_url = profile.api_url.clone();
                overrides.api_key = profile.api_key.clone();
                snapshot
            };

            return match self.refresh_bridge(session, snapshot).await {
                Ok(()) => format!("Perfil '{}' ativado: {}", profile.name, profile.model),
                Err(err) => format!("Falha ao reiniciar o MCP com o novo modelo.\n{err}"),
            };
        }

        let snapshot = {
            let mut overrides = session.overrides.lock().await;
            let snapshot = overrides.clone();
            overrides.model = Some(arg.to_string());
            overrides.model_profile = None;
            overrides.provider = None;
            overrides.api_url = None;
            overrides.api_key = None;
            snapshot
        };
        match self.refresh_bridge(session, snapshot).await {
            Ok(()) => format!("Modelo atualizado para: {arg}"),
            Err(err) => format!("Falha ao reiniciar o MCP com o novo modelo.\n{err}"),
        }
    }

    async fn command_grounded(&self, session: &Arc<SessionState>, args: &str) -> String {
        match args.trim().to_lowercase().as_str() {
            "" => {
                let overrides = session.overrides.lock().await;
                let active = self.effective_grounded(&overrides);
                let source = if overrides.grounded.is_some() { "sessão" } else { "env" };
                let shown = if active { "on" } else { "off" };
                format!("Grounded atual: {shown} (fonte: {source}).")
            }
            "on" => {
                session.overrides.lock().await.grounded = Some(true);
                "Grounded ativado para esta sessão.".to_string()
            }
            "off" => {
                session.overrides.lock().await.grounded = Some(false);
                "Grounded desativado para esta sessão.".to_string()
            }
            "reset" | "default" => {
                session.overrides.lock().await.grounded = None;
                "Grounded resetado para o valor do ambiente.".to_string()
            }
            _ => "Valor inválido. Use /grounded on|off|reset.".to_string(),
        }
    }

    async fn command_content_type(&self, session: &Arc<SessionState>, args: &str) -> String {
        match args.trim().to_lowercase().as_str() {
            "" => {
                let overrides = session.overrides.lock().await;
                match self.effective_content_type(&overrides) {
                    Some(value) => {
                        let source =
                            if overrides.content_type.is_some() { "sessão" } else { "env" };
                        format!("contentType atual: {value} (fonte: {source}).")
                    }
                    None => "contentType não configurado.".to_string(),
                }
            }
            value @ ("code" | "docs" | "all") => {
                session.overrides.lock().await.content_type = Some(value.to_string());
                format!("contentType atualizado para: {value}")
            }
            "reset" | "default" => {
                session.overrides.lock().await.content_type = None;
                "contentType resetado para o valor do ambiente.".to_string()
            }
            _ => "Valor inválido. Use /content-type code|docs|all|reset.".to_string(),
        }
    }

    // ── bridge refresh ──────────────────────────────────────────────────

    fn overrides_child_env(&self, overrides: &SessionOverrides) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(model) = &overrides.model {
            env.insert("LLM_MODEL".to_string(), model.clone());
        }
        if let Some(provider) = &overrides.provider {
            env.insert("LLM_MODEL_PROVIDER".to_string(), provider.clone());
        }
        if let Some(api_url) = &overrides.api_url {
            env.insert("LLM_MODEL_API_URL".to_string(), api_url.clone());
        }
        if let Some(api_key) = &overrides.api_key {
            env.insert("LLM_MODEL_API_KEY".to_string(), api_key.clone());
        }
        env
    }

    /// Replace the session bridge with one built from the current
    /// overrides. New bridge first: if it fails to start, the override
    /// snapshot is restored and the previous bridge is retained.
    async fn refresh_bridge(
        &self,
        session: &Arc<SessionState>,
        snapshot: SessionOverrides,
    ) -> Result<(), String> {
        let child_env = {
            let overrides = session.overrides.lock().await;
            self.overrides_child_env(&overrides)
        };

        let new_bridge = match (self.bridge_factory)(child_env) {
            Ok(bridge) => bridge,
            Err(err) => {
                *session.overrides.lock().await = snapshot;
                return Err(err.to_string());
            }
        };

        if let Err(err) = new_bridge.start().await {
            *session.overrides.lock().await = snapshot;
            return Err(err.to_string());
        }

        let old_bridge = {
            let mut bridge = session.bridge.lock().await;
            std::mem::replace(&mut *bridge, new_bridge)
        };
        old_bridge.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct RecordingClient {
        notifications: Mutex<Vec<SessionNotification>>,
    }

    impl RecordingClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                notifications: Mutex::new(Vec::new()),
            })
        }

        async fn texts(&self) -> Vec<String> {
            self.notifications
                .lock()
                .await
                .iter()
                .filter_map(|n| match &n.update {
                    SessionUpdate::AgentMessageText { text } => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }

        async fn command_names(&self) -> Vec<Vec<String>> {
            self.notifications
                .lock()
                .await
                .iter()
                .filter_map(|n| match &n.update {
                    SessionUpdate::AvailableCommandsUpdate { available_commands } => Some(
                        available_commands
                            .iter()
                            .map(|c| c.name.clone())
                            .collect::<Vec<_>>(),
                    ),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl AcpClient for RecordingClient {
        async fn session_update(&self, notification: SessionNotification) {
            self.notifications.lock().await.push(notification);
        }
    }

    struct DummyBridge {
        delay: Duration,
        fail_with: Option<String>,
        fail_start: bool,
        aborted: AtomicUsize,
        asked: Mutex<Vec<Value>>,
    }

    impl DummyBridge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::ZERO,
                fail_with: None,
                fail_start: false,
                aborted: AtomicUsize::new(0),
                asked: Mutex::new(Vec::new()),
            })
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                fail_with: None,
                fail_start: false,
                aborted: AtomicUsize::new(0),
                asked: Mutex::new(Vec::new()),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::ZERO,
                fail_with: Some(message.to_string()),
                fail_start: false,
                aborted: AtomicUsize::new(0),
                asked: Mutex::new(Vec::new()),
            })
        }

        fn failing_start() -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::ZERO,
                fail_with: None,
                fail_start: true,
                aborted: AtomicUsize::new(0),
                asked: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AskBridge for DummyBridge {
        async fn start(&self) -> Result<(), BridgeError> {
            if self.fail_start {
                return Err(BridgeError::Spawn("scripted start failure".to_string()));
            }
            Ok(())
        }

        async fn ask_code(
            &self,
            arguments: Value,
            cancel: CancellationToken,
        ) -> Result<Value, BridgeError> {
            if let Some(message) = &self.fail_with {
                return Err(BridgeError::Protocol(message.clone()));
            }
            self.asked.lock().await.push(arguments.clone());
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                }
            }
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            let query = arguments
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(json!({"answer": format!("Resposta para {query}"), "meta": {"k": 1}}))
        }

        async fn abort(&self) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }

        async fn close(&self) {}
    }

    fn static_factory(bridge: Arc<DummyBridge>) -> BridgeFactory {
        Arc::new(move |_env| Ok(bridge.clone() as Arc<dyn AskBridge>))
    }

    /// Factory that records the child env of every bridge it builds.
    fn recording_factory(
        bridge: Arc<DummyBridge>,
    ) -> (BridgeFactory, Arc<std::sync::Mutex<Vec<HashMap<String, String>>>>) {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let factory: BridgeFactory = Arc::new(move |env| {
            recorded.lock().unwrap().push(env);
            Ok(bridge.clone() as Arc<dyn AskBridge>)
        });
        (factory, calls)
    }

    fn env_from(pairs: &[(&str, &str)]) -> EnvFn {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(move |key: &str| map.get(key).cloned())
    }

    fn agent_with(
        bridge: Arc<DummyBridge>,
        env: EnvFn,
    ) -> (Agent, Arc<RecordingClient>) {
        let client = RecordingClient::new();
        let agent = Agent::new(client.clone(), static_factory(bridge), env);
        (agent, client)
    }

    fn text_prompt(session_id: &str, text: &str) -> PromptParams {
        PromptParams {
            session_id: session_id.to_string(),
            prompt: vec![crate::protocol::ContentBlock::Text {
                text: text.to_string(),
            }],
        }
    }

    async fn last_config_snapshot(client: &RecordingClient) -> Value {
        let texts = client.texts().await;
        let text = texts.last().unwrap().clone();
        let payload = text.strip_prefix("Config atual:\n").unwrap();
        serde_json::from_str(payload).unwrap()
    }

    #[tokio::test]
    async fn prompt_streams_answer_and_ends_turn() {
        let bridge = DummyBridge::new();
        let (agent, client) = agent_with(bridge, env_from(&[]));

        let session = agent.new_session().await.unwrap();
        let response = agent
            .prompt(text_prompt(&session.session_id, "Pergunta"))
            .await;

        assert_eq!(response.stop_reason, StopReason::EndTurn);
        let texts = client.texts().await;
        assert!(!texts.is_empty());
        assert!(texts[0].contains("Resposta para Pergunta"));
    }

    #[tokio::test]
    async fn new_session_announces_slash_commands() {
        let bridge = DummyBridge::new();
        let (agent, client) = agent_with(bridge, env_from(&[]));

        agent.new_session().await.unwrap();

        let announced = client.command_names().await;
        assert_eq!(announced.len(), 1);
        let names: Vec<&str> = announced[0].iter().map(String::as_str).collect();
        assert_eq!(
            names,
            vec!["config", "repo", "model", "grounded", "content-type"]
        );
    }

    #[tokio::test]
    async fn unknown_session_and_empty_prompt_refuse() {
        let bridge = DummyBridge::new();
        let (agent, _client) = agent_with(bridge, env_from(&[]));

        let response = agent.prompt(text_prompt("session-missing", "oi")).await;
        assert_eq!(response.stop_reason, StopReason::Refusal);

        let session = agent.new_session().await.unwrap();
        let response = agent.prompt(text_prompt(&session.session_id, "   ")).await;
        assert_eq!(response.stop_reason, StopReason::Refusal);
    }

    #[tokio::test]
    async fn cancel_during_bridge_wait_yields_cancelled() {
        let bridge = DummyBridge::with_delay(Duration::from_millis(200));
        let (agent, _client) = agent_with(bridge.clone(), env_from(&[]));
        let agent = Arc::new(agent);

        let session = agent.new_session().await.unwrap();
        let session_id = session.session_id.clone();

        let prompting = agent.clone();
        let prompt_task = tokio::spawn(async move {
            prompting.prompt(text_prompt(&session_id, "Pergunta")).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.cancel(&session.session_id).await;
        let response = prompt_task.await.unwrap();

        assert_eq!(response.stop_reason, StopReason::Cancelled);
        assert_eq!(bridge.aborted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bridge_failure_is_reported_as_text_not_error() {
        let bridge = DummyBridge::failing("falha de teste");
        let (agent, client) = agent_with(bridge, env_from(&[]));

        let session = agent.new_session().await.unwrap();
        let response = agent
            .prompt(text_prompt(&session.session_id, "Pergunta"))
            .await;

        assert_eq!(response.stop_reason, StopReason::EndTurn);
        let texts = client.texts().await;
        assert!(texts.iter().any(|t| t.contains("Falha ao consultar o MCP.")));
        assert!(texts.iter().any(|t| t.contains("falha de teste")));
    }

    #[tokio::test]
    async fn repo_command_accepts_csv_of_existing_dirs() {
        let codebase = TempDir::new().unwrap();
        for repo in ["golyzer", "cfi", "ui", "base"] {
            std::fs::create_dir(codebase.path().join(repo)).unwrap();
        }
        let env = env_from(&[("CODEBASE_ROOT", codebase.path().to_str().unwrap())]);
        let bridge = DummyBridge::new();
        let (agent, client) = agent_with(bridge.clone(), env);

        let session = agent.new_session().await.unwrap();
        let response = agent
            .prompt(text_prompt(&session.session_id, "/repo golyzer,cfi,ui,base"))
            .await;
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("Repos atualizados para: golyzer,cfi,ui,base")));

        // The next ask_code payload carries the multi-repo scope.
        agent
            .prompt(text_prompt(&session.session_id, "Pergunta"))
            .await;
        let asked = bridge.asked.lock().await;
        let scope = &asked.last().unwrap()["scope"];
        assert_eq!(
            *scope,
            json!({"type": "repos", "repos": ["golyzer", "cfi", "ui", "base"]})
        );
    }

    #[tokio::test]
    async fn repo_command_rejects_missing_dir_and_keeps_override() {
        let codebase = TempDir::new().unwrap();
        std::fs::create_dir(codebase.path().join("golyzer")).unwrap();
        std::fs::create_dir(codebase.path().join("cfi")).unwrap();
        let env = env_from(&[("CODEBASE_ROOT", codebase.path().to_str().unwrap())]);
        let bridge = DummyBridge::new();
        let (agent, client) = agent_with(bridge.clone(), env);

        let session = agent.new_session().await.unwrap();
        agent
            .prompt(text_prompt(&session.session_id, "/repo golyzer,cfi,ui"))
            .await;
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("Repo 'ui' não existe.")));

        // Scope stays unchanged (no override was applied).
        agent
            .prompt(text_prompt(&session.session_id, "Pergunta"))
            .await;
        let asked = bridge.asked.lock().await;
        assert_eq!(asked.last().unwrap()["scope"], json!({"type": "all"}));
    }

    #[tokio::test]
    async fn repo_single_entry_lowers_to_repo_scope() {
        let codebase = TempDir::new().unwrap();
        std::fs::create_dir(codebase.path().join("golyzer")).unwrap();
        let env = env_from(&[("CODEBASE_ROOT", codebase.path().to_str().unwrap())]);
        let bridge = DummyBridge::new();
        let (agent, client) = agent_with(bridge.clone(), env);

        let session = agent.new_session().await.unwrap();
        agent
            .prompt(text_prompt(&session.session_id, "/repo golyzer"))
            .await;
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("Repo atualizado para: golyzer")));

        agent
            .prompt(text_prompt(&session.session_id, "Pergunta"))
            .await;
        let asked = bridge.asked.lock().await;
        assert_eq!(
            asked.last().unwrap()["scope"],
            json!({"type": "repo", "repo": "golyzer"})
        );
    }

    #[tokio::test]
    async fn config_command_reports_effective_payload() {
        let env = env_from(&[
            ("ACP_REPO", "golyzer,cfi"),
            ("LLM_MODEL", "gpt-5-mini"),
            ("ACP_PATH_PREFIX", "apps/"),
            ("ACP_LANGUAGE", "ts"),
            ("ACP_TOPK", "15"),
            ("ACP_MIN_SCORE", "0.62"),
            ("ACP_GROUNDED", "true"),
            ("ACP_CONTENT_TYPE", "docs"),
            ("ACP_STRICT", "yes"),
            ("ACP_SHOW_META", "1"),
            ("ACP_SHOW_CONTEXT", "on"),
            ("CODEBASE_ROOT", "/tmp/code-base"),
        ]);
        let bridge = DummyBridge::new();
        let (agent, client) = agent_with(bridge, env);

        let session = agent.new_session().await.unwrap();
        let response = agent.prompt(text_prompt(&session.session_id, "/config")).await;
        assert_eq!(response.stop_reason, StopReason::EndTurn);

        let payload = last_config_snapshot(&client).await;
        assert_eq!(
            payload["scope"],
            json!({"type": "repos", "repos": ["golyzer", "cfi"]})
        );
        assert_eq!(payload["model"]["active"], "gpt-5-mini");
        assert_eq!(payload["grounded"]["active"], true);
        assert_eq!(payload["grounded"]["override"], Value::Null);
        assert_eq!(payload["grounded"]["env"], true);
        assert_eq!(payload["contentType"]["active"], "docs");
        assert_eq!(payload["filters"]["pathPrefix"], "apps/");
        assert_eq!(payload["filters"]["language"], "ts");
        assert_eq!(payload["filters"]["topK"], 15);
        assert_eq!(payload["filters"]["minScore"], 0.62);
        assert_eq!(payload["filters"]["grounded"], true);
        assert_eq!(payload["filters"]["strict"], true);
        assert_eq!(payload["passthrough"]["showMeta"], true);
        assert_eq!(payload["passthrough"]["showContext"], true);
        assert_eq!(payload["codebaseRoot"], "/tmp/code-base");
        assert_eq!(
            payload["askCodePayloadPreview"]["scope"],
            json!({"type": "repos", "repos": ["golyzer", "cfi"]})
        );
        assert!(payload["askCodePayloadPreview"].get("query").is_none());
    }

    #[tokio::test]
    async fn grounded_command_on_off_reset() {
        let env = env_from(&[("ACP_GROUNDED", "false")]);
        let bridge = DummyBridge::new();
        let (agent, client) = agent_with(bridge, env);
        let session = agent.new_session().await.unwrap();
        let sid = session.session_id.clone();

        agent.prompt(text_prompt(&sid, "/grounded")).await;
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("Grounded atual: off (fonte: env).")));

        agent.prompt(text_prompt(&sid, "/grounded on")).await;
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("Grounded ativado para esta sessão.")));

        agent.prompt(text_prompt(&sid, "/config")).await;
        let payload = last_config_snapshot(&client).await;
        assert_eq!(payload["grounded"]["active"], true);
        assert_eq!(payload["grounded"]["override"], true);
        assert_eq!(payload["askCodePayloadPreview"]["grounded"], true);

        agent.prompt(text_prompt(&sid, "/grounded off")).await;
        agent.prompt(text_prompt(&sid, "/config")).await;
        let payload = last_config_snapshot(&client).await;
        assert_eq!(payload["grounded"]["active"], false);
        assert_eq!(payload["grounded"]["override"], false);
        assert!(payload["askCodePayloadPreview"].get("grounded").is_none());

        agent.prompt(text_prompt(&sid, "/grounded reset")).await;
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("Grounded resetado para o valor do ambiente.")));
    }

    #[tokio::test]
    async fn content_type_command_set_show_reset_invalid() {
        let env = env_from(&[("ACP_CONTENT_TYPE", "docs")]);
        let bridge = DummyBridge::new();
        let (agent, client) = agent_with(bridge, env);
        let session = agent.new_session().await.unwrap();
        let sid = session.session_id.clone();

        // Camel-case spelling is accepted for the show form too.
        agent.prompt(text_prompt(&sid, "/contentType")).await;
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("contentType atual: docs (fonte: env).")));

        agent.prompt(text_prompt(&sid, "/content-type code")).await;
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("contentType atualizado para: code")));

        agent.prompt(text_prompt(&sid, "/config")).await;
        let payload = last_config_snapshot(&client).await;
        assert_eq!(payload["contentType"]["active"], "code");
        assert_eq!(payload["contentType"]["override"], "code");
        assert_eq!(payload["contentType"]["env"], "docs");
        assert_eq!(payload["askCodePayloadPreview"]["contentType"], "code");

        agent.prompt(text_prompt(&sid, "/content-type reset")).await;
        agent.prompt(text_prompt(&sid, "/config")).await;
        let payload = last_config_snapshot(&client).await;
        assert_eq!(payload["contentType"]["active"], "docs");
        assert_eq!(payload["contentType"]["override"], Value::Null);

        agent.prompt(text_prompt(&sid, "/content-type invalid")).await;
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("Valor inválido. Use /content-type code|docs|all|reset.")));
    }

    #[tokio::test]
    async fn model_profile_rebuilds_bridge_with_profile_env() {
        let tmp = TempDir::new().unwrap();
        let profiles_file = tmp.path().join("model-profiles.toml");
        std::fs::write(
            &profiles_file,
            r#"
[profiles.deepseek]
model = "deepseek-reasoner"
provider = "deepseek"
api_url = "https://api.deepseek.com"
api_key_env = "DEEPSEEK_API_KEY"
"#,
        )
        .unwrap();

        let env = env_from(&[
            ("ACP_MODEL_PROFILES_FILE", profiles_file.to_str().unwrap()),
            ("DEEPSEEK_API_KEY", "token-123"),
        ]);
        let bridge = DummyBridge::new();
        let (factory, calls) = recording_factory(bridge.clone());
        let client = RecordingClient::new();
        let agent = Agent::new(client.clone(), factory, env);

        let session = agent.new_session().await.unwrap();
        let response = agent
            .prompt(text_prompt(&session.session_id, "/model profile:deepseek"))
            .await;
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("Perfil 'deepseek' ativado:")));

        let recorded = calls.lock().unwrap();
        assert!(recorded.len() >= 2);
        let last = recorded.last().unwrap();
        assert_eq!(last.get("LLM_MODEL").map(String::as_str), Some("deepseek-reasoner"));
        assert_eq!(last.get("LLM_MODEL_PROVIDER").map(String::as_str), Some("deepseek"));
        assert_eq!(
            last.get("LLM_MODEL_API_URL").map(String::as_str),
            Some("https://api.deepseek.com")
        );
        assert_eq!(last.get("LLM_MODEL_API_KEY").map(String::as_str), Some("token-123"));
        drop(recorded);

        agent.prompt(text_prompt(&session.session_id, "/config")).await;
        let payload = last_config_snapshot(&client).await;
        assert_eq!(payload["model"]["active"], "deepseek-reasoner");
        assert_eq!(payload["model"]["profile"], "deepseek");
        assert_eq!(payload["model"]["provider"]["active"], "deepseek");
        assert_eq!(payload["model"]["apiUrl"]["active"], "https://api.deepseek.com");
        assert_eq!(payload["model"]["apiKey"]["activeConfigured"], true);
    }

    #[tokio::test]
    async fn model_profile_load_error_is_surfaced_and_overrides_untouched() {
        let tmp = TempDir::new().unwrap();
        let profiles_file = tmp.path().join("model-profiles.toml");
        std::fs::write(&profiles_file, "[profiles.deepseek]\nmodel = \n").unwrap();

        let env = env_from(&[("ACP_MODEL_PROFILES_FILE", profiles_file.to_str().unwrap())]);
        let bridge = DummyBridge::new();
        let (agent, client) = agent_with(bridge, env);

        let session = agent.new_session().await.unwrap();
        agent
            .prompt(text_prompt(&session.session_id, "/model profile:deepseek"))
            .await;
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("Falha ao carregar perfis de modelo.")));

        agent.prompt(text_prompt(&session.session_id, "/config")).await;
        let payload = last_config_snapshot(&client).await;
        assert_eq!(payload["model"]["override"], Value::Null);
        assert_eq!(payload["model"]["profile"], Value::Null);
    }

    #[tokio::test]
    async fn model_set_and_reset_rebuild_bridge() {
        let bridge = DummyBridge::new();
        let (factory, calls) = recording_factory(bridge.clone());
        let client = RecordingClient::new();
        let agent = Agent::new(client.clone(), factory, env_from(&[]));

        let session = agent.new_session().await.unwrap();
        agent
            .prompt(text_prompt(&session.session_id, "/model gpt-5"))
            .await;
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("Modelo atualizado para: gpt-5")));
        assert_eq!(
            calls.lock().unwrap().last().unwrap().get("LLM_MODEL").map(String::as_str),
            Some("gpt-5")
        );

        agent
            .prompt(text_prompt(&session.session_id, "/model reset"))
            .await;
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("Overrides de modelo removidos.")));
        assert!(calls.lock().unwrap().last().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_bridge_swap_restores_overrides_and_keeps_old_bridge() {
        let good = DummyBridge::new();
        let bad = DummyBridge::failing_start();
        let good_for_factory = good.clone();
        let call_count = Arc::new(AtomicUsize::new(0));
        let counter = call_count.clone();
        let factory: BridgeFactory = Arc::new(move |_env| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok(good_for_factory.clone() as Arc<dyn AskBridge>)
            } else {
                Ok(bad.clone() as Arc<dyn AskBridge>)
            }
        });
        let client = RecordingClient::new();
        let agent = Agent::new(client.clone(), factory, env_from(&[]));

        let session = agent.new_session().await.unwrap();
        agent
            .prompt(text_prompt(&session.session_id, "/model gpt-5"))
            .await;
        assert!(client
            .texts()
            .await
            .iter()
            .any(|t| t.contains("Falha ao reiniciar o MCP com o novo modelo.")));

        // Overrides restored, old bridge still answers.
        agent.prompt(text_prompt(&session.session_id, "/config")).await;
        let payload = last_config_snapshot(&client).await;
        assert_eq!(payload["model"]["override"], Value::Null);

        let response = agent
            .prompt(text_prompt(&session.session_id, "Pergunta"))
            .await;
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(good.asked.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn prompts_are_serialized_within_a_session() {
        let bridge = DummyBridge::with_delay(Duration::from_millis(60));
        let (agent, client) = agent_with(bridge, env_from(&[]));
        let agent = Arc::new(agent);

        let session = agent.new_session().await.unwrap();
        let sid = session.session_id.clone();

        let first = {
            let agent = agent.clone();
            let sid = sid.clone();
            tokio::spawn(async move { agent.prompt(text_prompt(&sid, "primeira")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let agent = agent.clone();
            let sid = sid.clone();
            tokio::spawn(async move { agent.prompt(text_prompt(&sid, "segunda")).await })
        };

        assert_eq!(first.await.unwrap().stop_reason, StopReason::EndTurn);
        assert_eq!(second.await.unwrap().stop_reason, StopReason::EndTurn);

        let texts = client.texts().await;
        let first_pos = texts
            .iter()
            .position(|t| t.contains("Resposta para primeira"))
            .unwrap();
        let second_pos = texts
            .iter()
            .position(|t| t.contains("Resposta para segunda"))
            .unwrap();
        assert!(first_pos < second_pos);
    }

    #[tokio::test]
    async fn meta_passthrough_is_emitted_when_enabled() {
        let env = env_from(&[("ACP_SHOW_META", "1")]);
        let bridge = DummyBridge::new();
        let (agent, client) = agent_with(bridge, env);

        let session = agent.new_session().await.unwrap();
        agent
            .prompt(text_prompt(&session.session_id, "Pergunta"))
            .await;

        let texts = client.texts().await;
        let meta = texts
            .iter()
            .find(|t| t.starts_with(META_PASSTHROUGH_PREFIX))
            .unwrap();
        let parsed: Value =
            serde_json::from_str(meta.strip_prefix(META_PASSTHROUGH_PREFIX).unwrap()).unwrap();
        assert_eq!(parsed["meta"]["k"], 1);
    }
}
