use crate::assembler::{Assembler, CancelPolicy, UnsupportedTriggerPolicy, DEFAULT_SEPARATOR};
use crate::delegation::{CommandAgent, HookRegistry, SectionExtractor, INLINE_HOOK};
use crate::store::CONFIG_FILE_NAME;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const ENV_UNSUPPORTED_TRIGGERS: &str = "CONTEXT_BLOCKS_UNSUPPORTED_TRIGGERS";
pub const ENV_AGENT_TIMEOUT_MS: &str = "CONTEXT_BLOCKS_AGENT_TIMEOUT_MS";

const DEFAULT_AGENT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CORPUS_HOOK: &str = "corpus";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub unsupported_triggers: UnsupportedTriggerPolicy,

    #[serde(default)]
    pub on_cancel: CancelPolicy,

    #[serde(default = "default_separator")]
    pub separator: String,

    /// Hook used by delegated blocks that do not name one
    #[serde(default = "default_hook")]
    pub default_hook: String,

    /// Timeout for agents that do not set their own
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,

    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corpus: Option<CorpusConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    /// Hook name blocks refer to
    #[serde(default = "default_corpus_name")]
    pub name: String,
    pub root: PathBuf,
}

fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

fn default_hook() -> String {
    INLINE_HOOK.to_string()
}

fn default_agent_timeout_ms() -> u64 {
    DEFAULT_AGENT_TIMEOUT_MS
}

fn default_corpus_name() -> String {
    DEFAULT_CORPUS_HOOK.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unsupported_triggers: UnsupportedTriggerPolicy::default(),
            on_cancel: CancelPolicy::default(),
            separator: default_separator(),
            default_hook: default_hook(),
            agent_timeout_ms: DEFAULT_AGENT_TIMEOUT_MS,
            agents: BTreeMap::new(),
            corpus: None,
        }
    }
}

impl EngineConfig {
    /// Parse JSON, falling back to TOML
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config: Self = match serde_json::from_slice(bytes) {
            Ok(config) => config,
            Err(json_err) => {
                let utf8 = std::str::from_utf8(bytes).map_err(|err| anyhow!("{json_err}; {err}"))?;
                toml::from_str(utf8).map_err(|toml_err| {
                    anyhow!("Config is not valid JSON ({json_err}) or TOML ({toml_err})")
                })?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Read a config file; relative paths inside it resolve against its directory
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_bytes(&bytes)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        Ok(config)
    }

    /// `explicit` if given, else `<blocks_dir>/context-blocks.toml` if present, else defaults
    pub fn discover(blocks_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let candidate = blocks_dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            log::debug!("Using config {}", candidate.display());
            return Self::from_file(&candidate);
        }
        Ok(Self::default())
    }

    fn rebase(&mut self, base: &Path) {
        if let Some(corpus) = &mut self.corpus {
            if corpus.root.is_relative() {
                corpus.root = base.join(&corpus.root);
            }
        }
        for agent in self.agents.values_mut() {
            if let Some(dir) = &agent.working_dir {
                if dir.is_relative() {
                    agent.working_dir = Some(base.join(dir));
                }
            }
        }
    }

    /// Apply `CONTEXT_BLOCKS_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(ENV_UNSUPPORTED_TRIGGERS) {
            self.unsupported_triggers = match raw.trim().to_ascii_lowercase().as_str() {
                "skip" => UnsupportedTriggerPolicy::Skip,
                "fail" => UnsupportedTriggerPolicy::Fail,
                other => bail!("{ENV_UNSUPPORTED_TRIGGERS}={other} (expected skip|fail)"),
            };
        }
        if let Some(raw) = lookup(ENV_AGENT_TIMEOUT_MS) {
            self.agent_timeout_ms = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_AGENT_TIMEOUT_MS}={raw} is not a number"))?;
        }
        self.validate()
    }

    fn hook_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(INLINE_HOOK)
            .chain(self.agents.keys().map(String::as_str))
            .chain(self.corpus.iter().map(|c| c.name.as_str()))
    }

    fn validate(&self) -> Result<()> {
        if self.agent_timeout_ms == 0 {
            bail!("agent_timeout_ms must be greater than zero");
        }
        for (name, agent) in &self.agents {
            if name.trim().is_empty() {
                bail!("agent names must not be empty");
            }
            if name == INLINE_HOOK {
                bail!("agent name '{INLINE_HOOK}' is reserved");
            }
            if agent.command.trim().is_empty() {
                bail!("agents.{name}.command must not be empty");
            }
            if agent.timeout_ms == Some(0) {
                bail!("agents.{name}.timeout_ms must be greater than zero");
            }
        }
        if let Some(corpus) = &self.corpus {
            if corpus.name == INLINE_HOOK || self.agents.contains_key(&corpus.name) {
                bail!("corpus.name '{}' collides with another hook", corpus.name);
            }
        }
        if !self.hook_names().any(|name| name == self.default_hook) {
            bail!(
                "default_hook '{}' is not defined (known hooks: {})",
                self.default_hook,
                self.hook_names().collect::<Vec<_>>().join(", ")
            );
        }
        Ok(())
    }

    pub fn build_registry(&self) -> Result<HookRegistry> {
        let mut registry = HookRegistry::new();
        for (name, agent) in &self.agents {
            let timeout = Duration::from_millis(agent.timeout_ms.unwrap_or(self.agent_timeout_ms));
            let mut hook = CommandAgent::new(name, &agent.command)
                .args(agent.args.iter().cloned())
                .timeout(timeout);
            for (key, value) in &agent.env {
                hook = hook.env(key, value);
            }
            if let Some(dir) = &agent.working_dir {
                hook = hook.working_dir(dir);
            }
            registry.register(Arc::new(hook));
        }
        if let Some(corpus) = &self.corpus {
            registry.register(Arc::new(SectionExtractor::new(&corpus.name, &corpus.root)));
        }
        registry
            .set_default(&self.default_hook)
            .map_err(|err| anyhow!("{err}"))?;
        Ok(registry)
    }

    pub fn assembler(&self) -> Result<Assembler> {
        Ok(Assembler::new(self.build_registry()?)
            .unsupported_triggers(self.unsupported_triggers)
            .on_cancel(self.on_cancel))
    }
}
