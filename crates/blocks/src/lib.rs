//! # Context Blocks
//!
//! Conditional inclusion of instructional context for AI agents.
//!
//! A library of named blocks, each guarded by a trigger, is matched against
//! the task at hand. Matching blocks that were not already supplied earlier
//! in the session are assembled into one prompt document.
//!
//! ## Architecture
//!
//! ```text
//! TaskContext (tags, file path, description)
//!     │
//!     ├──> Block Store (documents with +++ TOML front matter)
//!     │
//!     ├──> Condition Evaluator
//!     │      └─ always | tags | path | mentions | all/any/not
//!     │
//!     ├──> Inclusion Tracker (session-wide seen set)
//!     │
//!     └──> Assembler
//!            ├─ Resolve text inline or via a Delegation Hook
//!            │    (inline | external agent | corpus section extract)
//!            ├─ Collect per-block failures, keep going
//!            └─ Commit: claim blocks in the tracker, return the output
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use context_blocks::{BlockStore, EngineConfig, InclusionTracker, TaskContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = BlockStore::load_dir(".agents/blocks")?;
//!     let assembler = EngineConfig::discover(".agents/blocks".as_ref(), None)?.assembler()?;
//!     let tracker = InclusionTracker::new();
//!
//!     let ctx = TaskContext::new().with_tag("testing").with_file_path("lib/app.ex");
//!     let output = assembler.resolve(&ctx, &store, &tracker).await?;
//!     println!("{}", output.render("\n\n"));
//!     Ok(())
//! }
//! ```

mod assembler;
mod config;
mod delegation;
mod document;
mod error;
mod store;
mod tracker;
mod trigger;
mod types;

pub use assembler::{
    AssembledEntry, AssembledOutput, Assembler, AssemblyStatus, BlockFailure, CancelPolicy,
    Resolution, SkipReason, SkippedBlock, UnsupportedTriggerPolicy, DEFAULT_SEPARATOR,
};
pub use config::{
    AgentConfig, CorpusConfig, EngineConfig, ENV_AGENT_TIMEOUT_MS, ENV_UNSUPPORTED_TRIGGERS,
};
pub use delegation::{
    CommandAgent, DelegationHook, HookRegistry, InlinePassthrough, SectionExtractor, INLINE_HOOK,
};
pub use document::Document;
pub use error::{LoadError, ResolveError, Result, RetrievalError, UnsupportedTriggerError};
pub use store::{BlockStore, DocumentScanner, CONFIG_FILE_NAME};
pub use tracker::{InclusionTracker, SessionLock, SessionSnapshot, SESSION_SCHEMA_VERSION};
pub use trigger::{matches, Keyword, PathGlob, Trigger};
pub use types::{Block, Delegation, TaskContext};

pub use tokio_util::sync::CancellationToken;
