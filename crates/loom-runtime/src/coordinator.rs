//! Coordinator: builds models from settings, owns the session agent, and
//! retries once with fresh credentials when a provider rejects them.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use loom_core::{AgentError, Attachment, ProviderOptions, Session, SessionAgentCall, SessionId};
use loom_llm::auth::{needs_refresh, OAuthTokens, TokenRefresher};
use loom_llm::{resolve_model, CallOptions, LanguageModel, ModelInfo, Tool};
use loom_settings::{
    deep_merge, resolve_value, save_settings, OAuthCredentials, ProviderConfig, SelectedModel,
    Settings, VariableResolver,
};
use loom_store::{MessageStore, SessionStore};
use parking_lot::RwLock;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::{
    AgentResult, SessionAgent, SessionAgentConfig, CANCEL_ALL_TIMEOUT, CANCEL_POLL_INTERVAL,
};
use crate::permission::PermissionGate;
use crate::prompts::TASK_SESSION_TITLE;
use crate::snapshot::{AgentSnapshot, ModelHandle};

/// Credential handed to a [`ModelFactory`].
#[derive(Clone, Debug)]
pub enum Credential {
    None,
    ApiKey(SecretString),
    OAuth(SecretString),
}

/// Builds a model runtime for a provider model.
#[async_trait]
pub trait ModelFactory: Send + Sync {
    async fn build(
        &self,
        provider: &ProviderConfig,
        model: &ModelInfo,
        credential: &Credential,
    ) -> Result<Arc<dyn LanguageModel>, AgentError>;
}

#[async_trait]
pub trait ToolFactory: Send + Sync {
    async fn build_tools(&self) -> Vec<Arc<dyn Tool>>;
    /// Restricted set handed to sub-agents.
    async fn build_sub_agent_tools(&self) -> Vec<Arc<dyn Tool>>;
}

#[async_trait]
pub trait PromptBuilder: Send + Sync {
    async fn system_prompt(&self, model: &ModelInfo) -> String;
    async fn task_prompt(&self, model: &ModelInfo) -> String;
}

/// Fixed tool lists.
#[derive(Clone, Default)]
pub struct StaticTools {
    pub tools: Vec<Arc<dyn Tool>>,
    pub sub_agent_tools: Vec<Arc<dyn Tool>>,
}

#[async_trait]
impl ToolFactory for StaticTools {
    async fn build_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }

    async fn build_sub_agent_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.sub_agent_tools.clone()
    }
}

/// Fixed prompt text regardless of model.
#[derive(Clone, Debug, Default)]
pub struct StaticPrompts {
    pub system: String,
    pub task: String,
}

#[async_trait]
impl PromptBuilder for StaticPrompts {
    async fn system_prompt(&self, _model: &ModelInfo) -> String {
        self.system.clone()
    }

    async fn task_prompt(&self, _model: &ModelInfo) -> String {
        self.task.clone()
    }
}

/// Everything the coordinator needs from its host.
pub struct CoordinatorDeps {
    pub settings: Settings,
    /// Refreshed OAuth tokens are written back here when set.
    pub settings_path: Option<PathBuf>,
    pub model_factory: Arc<dyn ModelFactory>,
    pub token_refresher: Arc<dyn TokenRefresher>,
    pub resolver: Arc<dyn VariableResolver>,
    pub tool_factory: Arc<dyn ToolFactory>,
    pub prompt_builder: Arc<dyn PromptBuilder>,
    pub sessions: Arc<dyn SessionStore>,
    pub messages: Arc<dyn MessageStore>,
    pub permissions: Arc<dyn PermissionGate>,
}

/// Catalog defaults, then provider options, then the selection's own
/// options; later layers win.
pub fn merge_call_options(
    info: &ModelInfo,
    provider: &ProviderConfig,
    selected: &SelectedModel,
) -> CallOptions {
    let merged = [
        &info.default_options,
        &provider.provider_options,
        &selected.provider_options,
    ]
    .into_iter()
    .fold(Value::Object(ProviderOptions::new()), |acc, layer| {
        deep_merge(acc, Value::Object(layer.clone()))
    });
    let mut provider_options = match merged {
        Value::Object(map) => map,
        _ => ProviderOptions::new(),
    };
    if let Some(effort) = &selected.reasoning_effort {
        let _ = provider_options.insert("reasoning_effort".to_string(), Value::from(effort.clone()));
    }
    if selected.think {
        let _ = provider_options.insert("think".to_string(), Value::Bool(true));
    }

    let mut sampling = selected.sampling.clone();
    if sampling.max_output_tokens.is_none() && info.default_max_tokens > 0 {
        sampling.max_output_tokens = Some(info.default_max_tokens);
    }
    CallOptions {
        sampling,
        provider_options,
    }
}

fn agent_config(settings: &Settings) -> SessionAgentConfig {
    SessionAgentConfig {
        is_sub_agent: false,
        disable_auto_summarize: settings.options.disable_auto_summarize,
        disable_provider_cache: settings.options.disable_provider_cache,
    }
}

struct ModelBuilder {
    factory: Arc<dyn ModelFactory>,
    resolver: Arc<dyn VariableResolver>,
}

impl ModelBuilder {
    fn credential_for(&self, provider: &ProviderConfig) -> Result<Credential, AgentError> {
        if let Some(oauth) = &provider.oauth {
            return Ok(Credential::OAuth(SecretString::from(oauth.access_token.clone())));
        }
        if provider.api_key.is_empty() {
            return Ok(Credential::None);
        }
        let key = resolve_value(&provider.api_key, self.resolver.as_ref())
            .map_err(|e| AgentError::Auth(format!("provider {}: {e}", provider.id)))?;
        Ok(Credential::ApiKey(SecretString::from(key)))
    }

    async fn build(&self, settings: &Settings, selected: &SelectedModel) -> Result<ModelHandle, AgentError> {
        let provider = settings.provider(&selected.provider).ok_or_else(|| {
            AgentError::Other(format!("provider {} is not configured", selected.provider))
        })?;
        let info = resolve_model(provider, &selected.model).ok_or_else(|| {
            AgentError::Other(format!(
                "model {} not found for provider {}",
                selected.model, provider.id
            ))
        })?;
        let credential = self.credential_for(provider)?;
        let model = self.factory.build(provider, &info, &credential).await?;
        Ok(ModelHandle {
            model,
            provider_id: provider.id.clone(),
            provider_kind: provider.kind,
            options: merge_call_options(&info, provider, selected),
        })
    }

    async fn build_pair(&self, settings: &Settings) -> Result<(ModelHandle, ModelHandle), AgentError> {
        let large = self.build(settings, &settings.models.large).await?;
        let small = self.build(settings, &settings.models.small).await?;
        Ok((large, small))
    }
}

fn prefix_for(settings: &Settings, provider_id: &str) -> String {
    settings
        .provider(provider_id)
        .map(|p| p.system_prompt_prefix.clone())
        .unwrap_or_default()
}

/// A sub-agent run in flight, keyed by its task session.
struct LiveSubAgent {
    parent: SessionId,
    stop: CancellationToken,
}

/// Drops the live entry when the sub-agent run ends.
struct LiveSubAgentGuard<'a> {
    live: &'a DashMap<SessionId, LiveSubAgent>,
    task_id: SessionId,
}

impl Drop for LiveSubAgentGuard<'_> {
    fn drop(&mut self) {
        let _ = self.live.remove(&self.task_id);
    }
}

pub struct Coordinator {
    settings: Arc<RwLock<Settings>>,
    settings_path: Option<PathBuf>,
    builder: ModelBuilder,
    refresher: Arc<dyn TokenRefresher>,
    tool_factory: Arc<dyn ToolFactory>,
    prompt_builder: Arc<dyn PromptBuilder>,
    sessions: Arc<dyn SessionStore>,
    messages: Arc<dyn MessageStore>,
    permissions: Arc<dyn PermissionGate>,
    agent: Arc<SessionAgent>,
    sub_agents: DashMap<SessionId, LiveSubAgent>,
    ready: watch::Receiver<bool>,
}

impl Coordinator {
    /// Build the models and the session agent. Tools and the system prompt
    /// are constructed in the background; `run` waits for them.
    pub async fn new(deps: CoordinatorDeps) -> Result<Self, AgentError> {
        let builder = ModelBuilder {
            factory: deps.model_factory,
            resolver: deps.resolver,
        };
        let (large, small) = builder.build_pair(&deps.settings).await?;
        let prefix = prefix_for(&deps.settings, &large.provider_id);
        let agent = Arc::new(SessionAgent::new(
            agent_config(&deps.settings),
            AgentSnapshot::new(large, small).with_system_prompt_prefix(prefix),
            Arc::clone(&deps.sessions),
            Arc::clone(&deps.messages),
        ));

        let (ready_tx, ready) = watch::channel(false);
        {
            let agent = Arc::clone(&agent);
            let tool_factory = Arc::clone(&deps.tool_factory);
            let prompt_builder = Arc::clone(&deps.prompt_builder);
            drop(tokio::spawn(async move {
                let info = agent.snapshot().large.info().clone();
                let (tools, prompt) = tokio::join!(
                    tool_factory.build_tools(),
                    prompt_builder.system_prompt(&info)
                );
                debug!(tools = tools.len(), "agent tools and system prompt ready");
                agent.set_tools(tools);
                agent.set_system_prompt(prompt);
                let _ = ready_tx.send(true);
            }));
        }

        Ok(Self {
            settings: Arc::new(RwLock::new(deps.settings)),
            settings_path: deps.settings_path,
            builder,
            refresher: deps.token_refresher,
            tool_factory: deps.tool_factory,
            prompt_builder: deps.prompt_builder,
            sessions: deps.sessions,
            messages: deps.messages,
            permissions: deps.permissions,
            agent,
            sub_agents: DashMap::new(),
            ready,
        })
    }

    pub fn agent(&self) -> &Arc<SessionAgent> {
        &self.agent
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Replace the settings; the next `run` rebuilds models from them.
    pub fn reload(&self, settings: Settings) {
        *self.settings.write() = settings;
    }

    pub async fn wait_ready(&self) -> Result<(), AgentError> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|r| *r)
            .await
            .map(|_| ())
            .map_err(|_| AgentError::Other("agent initialization did not complete".to_string()))
    }

    /// Rebuild both models from the current settings. The system prompt is
    /// rebuilt only when the large model changed.
    pub async fn update_models(&self) -> Result<(), AgentError> {
        self.refresh_expired_tokens().await;
        let settings = self.settings();
        let (large, small) = self.builder.build_pair(&settings).await?;
        let previous = self.agent.snapshot();
        let model_changed = previous.large.info().id != large.info().id
            || previous.large.provider_id != large.provider_id;
        if model_changed {
            let prompt = self.prompt_builder.system_prompt(large.info()).await;
            self.agent.set_system_prompt(prompt);
        }
        self.agent
            .set_system_prompt_prefix(prefix_for(&settings, &large.provider_id));
        self.agent.set_models(large, small);
        self.agent.set_config(agent_config(&settings));
        Ok(())
    }

    #[instrument(skip(self, prompt, attachments), fields(session_id = %session_id))]
    pub async fn run(
        &self,
        session_id: &SessionId,
        prompt: &str,
        attachments: Vec<Attachment>,
    ) -> Result<Option<AgentResult>, AgentError> {
        self.wait_ready().await?;
        self.update_models().await?;
        let call = self.build_call(session_id, prompt, attachments);

        match self.agent.run(call.clone()).await {
            Err(err) if err.is_unauthorized() => {
                let provider_id = self.agent.snapshot().large.provider_id.clone();
                if !self.recover_credentials(&provider_id).await {
                    return Err(err);
                }
                if let Err(rebuild) = self.update_models().await {
                    warn!(error = %rebuild, "could not rebuild models after credential refresh");
                    return Err(err);
                }
                info!(provider = %provider_id, "retrying with refreshed credentials");
                self.agent.run(call).await
            }
            other => other,
        }
    }

    fn build_call(
        &self,
        session_id: &SessionId,
        prompt: &str,
        attachments: Vec<Attachment>,
    ) -> SessionAgentCall {
        let snapshot = self.agent.snapshot();
        let large = &snapshot.large;
        let attachments = if large.info().supports_images {
            attachments
        } else {
            let before = attachments.len();
            let kept: Vec<Attachment> = attachments.into_iter().filter(|a| !a.is_image()).collect();
            if kept.len() < before {
                debug!(dropped = before - kept.len(), "model does not accept images");
            }
            kept
        };
        SessionAgentCall {
            session_id: session_id.clone(),
            prompt: prompt.to_string(),
            attachments,
            sampling: large.options.sampling.clone(),
            provider_options: large.options.provider_options.clone(),
        }
    }

    /// Whether a retry can help after a 401: refresh OAuth tokens, or let the
    /// rebuild re-resolve a templated key.
    async fn recover_credentials(&self, provider_id: &str) -> bool {
        let provider = self.settings.read().provider(provider_id).cloned();
        let Some(provider) = provider else {
            return false;
        };
        if let Some(creds) = &provider.oauth {
            info!(provider = %provider_id, "access token rejected, refreshing");
            return self.refresh_oauth(&provider, creds).await;
        }
        if provider.has_templated_key() {
            info!(provider = %provider_id, "api key rejected, re-resolving template");
            return true;
        }
        false
    }

    async fn refresh_oauth(&self, provider: &ProviderConfig, creds: &OAuthCredentials) -> bool {
        let tokens = OAuthTokens::from_credentials(creds);
        match self.refresher.refresh(provider, &tokens).await {
            Ok(fresh) => {
                self.store_oauth(&provider.id, fresh.to_credentials());
                true
            }
            Err(err) => {
                warn!(provider = %provider.id, error = %err, "oauth refresh failed");
                false
            }
        }
    }

    async fn refresh_expired_tokens(&self) {
        let settings = self.settings();
        let mut ids = vec![
            settings.models.large.provider.clone(),
            settings.models.small.provider.clone(),
        ];
        ids.dedup();
        for id in ids {
            let Some(provider) = settings.provider(&id) else {
                continue;
            };
            let Some(creds) = &provider.oauth else {
                continue;
            };
            if needs_refresh(&OAuthTokens::from_credentials(creds)) {
                info!(provider = %id, "oauth token expiring, refreshing");
                let _ = self.refresh_oauth(provider, creds).await;
            }
        }
    }

    fn store_oauth(&self, provider_id: &str, creds: OAuthCredentials) {
        let updated = {
            let mut settings = self.settings.write();
            if let Some(provider) = settings.provider_mut(provider_id) {
                provider.oauth = Some(creds);
            }
            settings.clone()
        };
        if let Some(path) = &self.settings_path {
            if let Err(err) = save_settings(path, &updated) {
                warn!(path = %path.display(), error = %err, "failed to persist refreshed token");
            }
        }
    }

    /// Run `prompt` in a new task session under `parent_session_id` with
    /// the restricted tool set, then charge its cost to the parent.
    ///
    /// The sub-agent stops when `cancel` fires (normally the calling tool's
    /// token) or when the parent or task session is cancelled here.
    #[instrument(skip(self, prompt), fields(parent_session_id = %parent_session_id))]
    pub async fn run_sub_agent(
        &self,
        parent_session_id: &SessionId,
        tool_call_id: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        self.wait_ready().await?;
        let _ = self.sessions.get(parent_session_id).await?;
        let mut task = Session::new_task(parent_session_id.clone(), TASK_SESSION_TITLE);
        if !tool_call_id.is_empty() {
            task.id = SessionId::from_raw(tool_call_id);
        }
        let task = self.sessions.create(task).await?;
        self.permissions.auto_approve_session(&task.id);

        let parent = self.agent.snapshot();
        let tools = self.tool_factory.build_sub_agent_tools().await;
        let system_prompt = self.prompt_builder.task_prompt(parent.large.info()).await;
        let mut config = self.agent.config();
        config.is_sub_agent = true;
        let sub_agent = SessionAgent::new(
            config,
            AgentSnapshot::new(parent.large.clone(), parent.small.clone())
                .with_tools(tools)
                .with_system_prompt(system_prompt)
                .with_system_prompt_prefix(parent.system_prompt_prefix.clone()),
            Arc::clone(&self.sessions),
            Arc::clone(&self.messages),
        );
        let call = SessionAgentCall {
            session_id: task.id.clone(),
            prompt: prompt.to_string(),
            attachments: Vec::new(),
            sampling: parent.large.options.sampling.clone(),
            provider_options: parent.large.options.provider_options.clone(),
        };
        let stop = cancel.child_token();
        let _ = self.sub_agents.insert(
            task.id.clone(),
            LiveSubAgent {
                parent: parent_session_id.clone(),
                stop: stop.clone(),
            },
        );
        let live = LiveSubAgentGuard {
            live: &self.sub_agents,
            task_id: task.id.clone(),
        };
        let run = sub_agent.run(call);
        tokio::pin!(run);
        // The run claims its session on first poll, so poll it before
        // checking for a stop.
        let outcome = tokio::select! {
            biased;
            outcome = &mut run => outcome,
            () = stop.cancelled() => {
                info!(task_session_id = %task.id, "stopping sub-agent");
                sub_agent.cancel(&task.id);
                run.await
            }
        };
        drop(live);

        let child = self.sessions.get(&task.id).await?;
        {
            let _lock = self.agent.session_lock.lock().await;
            let mut parent_session = self.sessions.get(parent_session_id).await?;
            parent_session.cost += child.cost;
            let _ = self.sessions.save(&parent_session).await?;
        }
        debug!(cost = child.cost, "sub-agent cost charged to parent");

        Ok(outcome?.map(|r| r.response.text).unwrap_or_default())
    }

    pub async fn summarize(&self, session_id: &SessionId) -> Result<(), AgentError> {
        let options = self.agent.snapshot().large.options.provider_options.clone();
        self.agent.summarize(session_id, options).await
    }

    /// Cancel the session's run and any sub-agent it started, or the
    /// sub-agent whose task session this is.
    pub fn cancel(&self, session_id: &SessionId) {
        self.agent.cancel(session_id);
        for live in self.sub_agents.iter() {
            if live.key() == session_id || live.parent == *session_id {
                live.stop.cancel();
            }
        }
    }

    /// Cancel every run and sub-agent, waiting (bounded) for them to unwind.
    pub async fn cancel_all(&self) {
        for live in self.sub_agents.iter() {
            live.stop.cancel();
        }
        self.agent.cancel_all().await;

        let deadline = Instant::now() + CANCEL_ALL_TIMEOUT;
        while !self.sub_agents.is_empty() {
            if Instant::now() >= deadline {
                warn!(remaining = self.sub_agents.len(), "timed out waiting for sub-agents");
                return;
            }
            tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
        }
    }

    pub fn is_busy(&self) -> bool {
        self.agent.is_busy() || !self.sub_agents.is_empty()
    }

    /// True while the session runs, or while a sub-agent runs for it or in it.
    pub fn is_session_busy(&self, session_id: &SessionId) -> bool {
        self.agent.is_session_busy(session_id)
            || self.sub_agents.contains_key(session_id)
            || self.sub_agents.iter().any(|live| live.parent == *session_id)
    }

    pub fn queued_prompts(&self, session_id: &SessionId) -> usize {
        self.agent.queued_prompts(session_id)
    }

    pub fn queued_prompt_texts(&self, session_id: &SessionId) -> Vec<String> {
        self.agent.queued_prompt_texts(session_id)
    }

    pub fn clear_queue(&self, session_id: &SessionId) {
        self.agent.clear_queue(session_id);
    }
}
