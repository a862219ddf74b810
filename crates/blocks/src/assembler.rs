use crate::delegation::{HookRegistry, INLINE_HOOK};
use crate::error::{ResolveError, RetrievalError};
use crate::store::BlockStore;
use crate::tracker::InclusionTracker;
use crate::trigger;
use crate::types::{Block, TaskContext};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SEPARATOR: &str = "\n\n";

/// What to do with a block whose trigger kind is unknown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedTriggerPolicy {
    /// Treat as a non-match and report it in [`AssembledOutput::skipped`]
    #[default]
    Skip,
    /// Abort the resolve call
    Fail,
}

/// What a cancelled resolve call does with blocks it already resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Return [`ResolveError::Cancelled`]; nothing is marked seen
    #[default]
    Discard,
    /// Commit and return what was resolved so far
    ReturnPartial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    Inline,
    Delegated { hook: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssembledEntry {
    pub name: String,
    pub text: String,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockFailure {
    pub block: String,
    pub error: RetrievalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    UnsupportedTrigger { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedBlock {
    pub block: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyStatus {
    Complete,
    PartialFailure,
    Cancelled,
}

/// Result of one resolve call. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssembledOutput {
    pub entries: Vec<AssembledEntry>,
    pub errors: Vec<BlockFailure>,
    pub skipped: Vec<SkippedBlock>,
    pub status: AssemblyStatus,
}

impl AssembledOutput {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.text.as_str())
    }

    /// Single document: entry texts joined by `separator`
    pub fn render(&self, separator: &str) -> String {
        self.texts().collect::<Vec<_>>().join(separator)
    }
}

/// Assembler phases, logged at debug level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Filtering,
    Resolving,
    Committing,
}

/// Resolved but not yet committed
struct Staged<'a> {
    block: &'a Block,
    text: String,
    resolution: Resolution,
}

/// Orders matched, unseen blocks, resolves them and records them in the tracker
#[derive(Debug, Clone, Default)]
pub struct Assembler {
    hooks: HookRegistry,
    unsupported: UnsupportedTriggerPolicy,
    on_cancel: CancelPolicy,
}

impl Assembler {
    pub fn new(hooks: HookRegistry) -> Self {
        Self {
            hooks,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn unsupported_triggers(mut self, policy: UnsupportedTriggerPolicy) -> Self {
        self.unsupported = policy;
        self
    }

    #[must_use]
    pub fn on_cancel(mut self, policy: CancelPolicy) -> Self {
        self.on_cancel = policy;
        self
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub async fn resolve(
        &self,
        ctx: &TaskContext,
        store: &BlockStore,
        tracker: &InclusionTracker,
    ) -> Result<AssembledOutput, ResolveError> {
        self.resolve_with_cancel(ctx, store, tracker, &CancellationToken::new())
            .await
    }

    /// Like [`Assembler::resolve`], observing `cancel` at block boundaries.
    ///
    /// The tracker is only updated in the final commit step, so a call that is
    /// cancelled with [`CancelPolicy::Discard`] (or whose future is dropped)
    /// leaves the session untouched.
    pub async fn resolve_with_cancel(
        &self,
        ctx: &TaskContext,
        store: &BlockStore,
        tracker: &InclusionTracker,
        cancel: &CancellationToken,
    ) -> Result<AssembledOutput, ResolveError> {
        log::debug!("assembler: {:?}", Phase::Filtering);
        let mut skipped = Vec::new();
        let mut candidates = Vec::new();
        for block in store.all_blocks() {
            match trigger::matches(block, ctx) {
                Ok(true) if tracker.is_seen(block.name()) => {
                    log::debug!("Block '{}' already in context", block.name());
                }
                Ok(true) => candidates.push(block),
                Ok(false) => {}
                Err(err) => match self.unsupported {
                    UnsupportedTriggerPolicy::Fail => return Err(err.into()),
                    UnsupportedTriggerPolicy::Skip => {
                        log::warn!("{err}; skipping");
                        skipped.push(SkippedBlock {
                            block: err.block,
                            reason: SkipReason::UnsupportedTrigger { kind: err.kind },
                        });
                    }
                },
            }
        }

        log::debug!("assembler: {:?} {} block(s)", Phase::Resolving, candidates.len());
        let mut staged = Vec::with_capacity(candidates.len());
        let mut errors = Vec::new();
        let mut cancelled = false;
        for block in candidates {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = self.resolve_block(block, ctx) => Some(outcome),
            };
            match outcome {
                None => {
                    cancelled = true;
                    break;
                }
                Some(Ok((text, resolution))) => staged.push(Staged {
                    block,
                    text,
                    resolution,
                }),
                Some(Err(error)) => {
                    log::warn!("Block '{}' could not be resolved: {error}", block.name());
                    errors.push(BlockFailure {
                        block: block.name().to_string(),
                        error,
                    });
                }
            }
        }

        if cancelled && self.on_cancel == CancelPolicy::Discard {
            log::debug!("assembler: cancelled, discarding {} staged block(s)", staged.len());
            return Err(ResolveError::Cancelled);
        }

        log::debug!("assembler: {:?} {} block(s)", Phase::Committing, staged.len());
        let claims = tracker.claim_all(staged.iter().map(|s| s.block.name()));
        let entries: Vec<AssembledEntry> = staged
            .into_iter()
            .zip(claims)
            .filter_map(|(staged, claimed)| {
                if !claimed {
                    log::debug!(
                        "Block '{}' was included by a concurrent call",
                        staged.block.name()
                    );
                    return None;
                }
                Some(AssembledEntry {
                    name: staged.block.name().to_string(),
                    text: staged.text,
                    resolution: staged.resolution,
                })
            })
            .collect();
        debug_assert!(
            {
                let mut names = HashSet::new();
                entries.iter().all(|e| names.insert(e.name.as_str()))
            },
            "concurrency violation: duplicate block in one output"
        );

        let status = if cancelled {
            AssemblyStatus::Cancelled
        } else if errors.is_empty() {
            AssemblyStatus::Complete
        } else {
            AssemblyStatus::PartialFailure
        };

        Ok(AssembledOutput {
            entries,
            errors,
            skipped,
            status,
        })
    }

    async fn resolve_block(
        &self,
        block: &Block,
        ctx: &TaskContext,
    ) -> Result<(String, Resolution), RetrievalError> {
        if !block.is_delegated() {
            return Ok((block.body().to_string(), Resolution::Inline));
        }
        let hook = self.hooks.hook_for(block)?;
        let text = hook.resolve(block, ctx).await?;
        let resolution = if hook.name() == INLINE_HOOK {
            Resolution::Inline
        } else {
            Resolution::Delegated {
                hook: hook.name().to_string(),
            }
        };
        Ok((text, resolution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::DelegationHook;
    use crate::trigger::Trigger;
    use crate::types::Delegation;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    /// Resolves after the token is cancelled, to simulate a caller giving up mid-call
    struct CancelOnResolve(CancellationToken);

    #[async_trait]
    impl DelegationHook for CancelOnResolve {
        fn name(&self) -> &str {
            "canceller"
        }

        async fn resolve(&self, block: &Block, _ctx: &TaskContext) -> Result<String, RetrievalError> {
            self.0.cancel();
            Ok(format!("{} via canceller", block.name()))
        }
    }

    fn store(blocks: Vec<Block>) -> BlockStore {
        BlockStore::from_blocks(blocks).unwrap()
    }

    #[tokio::test]
    async fn filters_by_trigger_in_load_order() {
        let store = store(vec![
            Block::new("mission", Trigger::Always, "M"),
            Block::new("api", Trigger::tags(["api"]), "A"),
            Block::new("tests", Trigger::path("test/**").unwrap(), "T"),
        ]);
        let ctx = TaskContext::new()
            .with_tag("api")
            .with_file_path("test/router_test.exs");
        let out = Assembler::default()
            .resolve(&ctx, &store, &InclusionTracker::new())
            .await
            .unwrap();
        assert_eq!(out.names().collect::<Vec<_>>(), vec!["mission", "api", "tests"]);
        assert_eq!(out.render("\n"), "M\nA\nT");
        assert_eq!(out.status, AssemblyStatus::Complete);
    }

    #[tokio::test]
    async fn unsupported_policy_skip_or_fail() {
        let store = store(vec![
            Block::new(
                "fuzzy",
                Trigger::Unsupported {
                    kind: "semantic".to_string(),
                },
                "F",
            ),
            Block::new("core", Trigger::Always, "C"),
        ]);
        let ctx = TaskContext::new();

        let out = Assembler::default()
            .resolve(&ctx, &store, &InclusionTracker::new())
            .await
            .unwrap();
        assert_eq!(out.names().collect::<Vec<_>>(), vec!["core"]);
        assert_eq!(
            out.skipped,
            vec![SkippedBlock {
                block: "fuzzy".to_string(),
                reason: SkipReason::UnsupportedTrigger {
                    kind: "semantic".to_string()
                },
            }]
        );

        let tracker = InclusionTracker::new();
        let err = Assembler::default()
            .unsupported_triggers(UnsupportedTriggerPolicy::Fail)
            .resolve(&ctx, &store, &tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnsupportedTrigger(ref e) if e.block == "fuzzy"));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn failed_blocks_are_not_marked_seen() {
        let store = store(vec![
            Block::new("remote", Trigger::Always, "").with_delegate(Delegation::via("absent")),
            Block::new("local", Trigger::Always, "L"),
        ]);
        let tracker = InclusionTracker::new();
        let out = Assembler::default()
            .resolve(&TaskContext::new(), &store, &tracker)
            .await
            .unwrap();
        assert_eq!(out.status, AssemblyStatus::PartialFailure);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].block, "remote");
        assert!(tracker.is_seen("local"));
        assert!(!tracker.is_seen("remote"));
    }

    #[tokio::test]
    async fn delegated_resolution_names_the_hook() {
        let token = CancellationToken::new();
        let mut hooks = HookRegistry::new();
        hooks.register(Arc::new(CancelOnResolve(CancellationToken::new())));
        let store = store(vec![
            Block::new("a", Trigger::Always, "").with_delegate(Delegation::via("canceller")),
            Block::new("b", Trigger::Always, "B").with_delegate(Delegation::default()),
        ]);
        let out = Assembler::new(hooks)
            .resolve_with_cancel(&TaskContext::new(), &store, &InclusionTracker::new(), &token)
            .await
            .unwrap();
        assert_eq!(
            out.entries,
            vec![
                AssembledEntry {
                    name: "a".to_string(),
                    text: "a via canceller".to_string(),
                    resolution: Resolution::Delegated {
                        hook: "canceller".to_string()
                    },
                },
                AssembledEntry {
                    name: "b".to_string(),
                    text: "B".to_string(),
                    resolution: Resolution::Inline,
                },
            ]
        );
    }

    fn cancelling_store() -> BlockStore {
        store(vec![
            Block::new("first", Trigger::Always, "").with_delegate(Delegation::via("canceller")),
            Block::new("second", Trigger::Always, "S"),
        ])
    }

    #[tokio::test]
    async fn cancellation_discards_without_marking() {
        let token = CancellationToken::new();
        let mut hooks = HookRegistry::new();
        hooks.register(Arc::new(CancelOnResolve(token.clone())));
        let tracker = InclusionTracker::new();

        let err = Assembler::new(hooks)
            .resolve_with_cancel(&TaskContext::new(), &cancelling_store(), &tracker, &token)
            .await
            .unwrap_err();
        assert_eq!(err, ResolveError::Cancelled);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn cancellation_can_return_partial_output() {
        let token = CancellationToken::new();
        let mut hooks = HookRegistry::new();
        hooks.register(Arc::new(CancelOnResolve(token.clone())));
        let tracker = InclusionTracker::new();

        let out = Assembler::new(hooks)
            .on_cancel(CancelPolicy::ReturnPartial)
            .resolve_with_cancel(&TaskContext::new(), &cancelling_store(), &tracker, &token)
            .await
            .unwrap();
        assert_eq!(out.status, AssemblyStatus::Cancelled);
        assert_eq!(out.names().collect::<Vec<_>>(), vec!["first"]);
        assert!(tracker.is_seen("first"));
        assert!(!tracker.is_seen("second"));
    }

    #[test]
    fn output_serializes_with_tagged_errors() {
        let out = AssembledOutput {
            entries: vec![],
            errors: vec![BlockFailure {
                block: "x".to_string(),
                error: RetrievalError::UnknownHook {
                    hook: "h".to_string(),
                },
            }],
            skipped: vec![],
            status: AssemblyStatus::PartialFailure,
        };
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["status"], "partial_failure");
        assert_eq!(value["errors"][0]["error"]["code"], "unknown_hook");
        assert_eq!(value["errors"][0]["error"]["hook"], "h");
    }
}
