//! Delegation hooks: resolve a block's text through a collaborator instead of its inline body.

mod agent;
mod extract;

pub use agent::CommandAgent;
pub use extract::SectionExtractor;

use crate::error::RetrievalError;
use crate::types::{Block, TaskContext};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const INLINE_HOOK: &str = "inline";

#[async_trait]
pub trait DelegationHook: Send + Sync {
    /// Registry key
    fn name(&self) -> &str;

    async fn resolve(&self, block: &Block, ctx: &TaskContext) -> Result<String, RetrievalError>;
}

/// Returns the block's own body
#[derive(Debug, Clone, Copy, Default)]
pub struct InlinePassthrough;

#[async_trait]
impl DelegationHook for InlinePassthrough {
    fn name(&self) -> &str {
        INLINE_HOOK
    }

    async fn resolve(&self, block: &Block, _ctx: &TaskContext) -> Result<String, RetrievalError> {
        Ok(block.body().to_string())
    }
}

/// Named hooks plus the default used by blocks that do not name one
#[derive(Clone)]
pub struct HookRegistry {
    hooks: BTreeMap<String, Arc<dyn DelegationHook>>,
    default_hook: String,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .field("default_hook", &self.default_hook)
            .finish()
    }
}

impl HookRegistry {
    /// Registry holding only [`InlinePassthrough`], which is also the default
    pub fn new() -> Self {
        let mut hooks: BTreeMap<String, Arc<dyn DelegationHook>> = BTreeMap::new();
        hooks.insert(INLINE_HOOK.to_string(), Arc::new(InlinePassthrough));
        Self {
            hooks,
            default_hook: INLINE_HOOK.to_string(),
        }
    }

    /// Register (or replace) a hook under its own name
    pub fn register(&mut self, hook: Arc<dyn DelegationHook>) -> &mut Self {
        self.hooks.insert(hook.name().to_string(), hook);
        self
    }

    pub fn set_default(&mut self, name: &str) -> Result<&mut Self, RetrievalError> {
        if !self.hooks.contains_key(name) {
            return Err(RetrievalError::UnknownHook {
                hook: name.to_string(),
            });
        }
        self.default_hook = name.to_string();
        Ok(self)
    }

    pub fn default_hook(&self) -> &str {
        &self.default_hook
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DelegationHook>> {
        self.hooks.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hooks.keys().map(String::as_str)
    }

    /// Hook responsible for `block`: its declared hook, else the default
    pub fn hook_for(&self, block: &Block) -> Result<Arc<dyn DelegationHook>, RetrievalError> {
        let name = block
            .delegate()
            .and_then(|d| d.hook.as_deref())
            .unwrap_or(self.default_hook.as_str());
        self.get(name).ok_or_else(|| RetrievalError::UnknownHook {
            hook: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::Trigger;
    use crate::types::Delegation;

    struct Fixed(&'static str);

    #[async_trait]
    impl DelegationHook for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn resolve(&self, _block: &Block, _ctx: &TaskContext) -> Result<String, RetrievalError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn inline_passthrough_returns_body() {
        let block = Block::new("b", Trigger::Always, "body text");
        let text = InlinePassthrough
            .resolve(&block, &TaskContext::new())
            .await
            .unwrap();
        assert_eq!(text, "body text");
    }

    #[test]
    fn hook_for_prefers_declared_hook() {
        let mut registry = HookRegistry::new();
        registry.register(Arc::new(Fixed("x")));

        let declared = Block::new("a", Trigger::Always, "").with_delegate(Delegation::via("fixed"));
        assert_eq!(registry.hook_for(&declared).unwrap().name(), "fixed");

        let undeclared = Block::new("b", Trigger::Always, "").with_delegate(Delegation::default());
        assert_eq!(registry.hook_for(&undeclared).unwrap().name(), INLINE_HOOK);

        registry.set_default("fixed").unwrap();
        assert_eq!(registry.hook_for(&undeclared).unwrap().name(), "fixed");
    }

    #[test]
    fn unknown_hooks_are_retrieval_errors() {
        let mut registry = HookRegistry::new();
        let block = Block::new("a", Trigger::Always, "").with_delegate(Delegation::via("nope"));
        assert_eq!(
            registry.hook_for(&block).err(),
            Some(RetrievalError::UnknownHook {
                hook: "nope".to_string()
            })
        );
        assert!(registry.set_default("nope").is_err());
        assert_eq!(registry.default_hook(), INLINE_HOOK);
    }
}
