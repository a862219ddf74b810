use crate::trigger::Trigger;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Named unit of instructional text with a trigger condition
#[derive(Debug, Clone)]
pub struct Block {
    name: String,
    trigger: Trigger,
    body: String,

    /// Present when the block is resolved through a delegation hook
    delegate: Option<Delegation>,

    /// Document the block was loaded from (`<inline>` for programmatic blocks)
    origin: String,
}

impl Block {
    pub fn new(name: impl Into<String>, trigger: Trigger, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger,
            body: body.into(),
            delegate: None,
            origin: "<inline>".to_string(),
        }
    }

    #[must_use]
    pub fn with_delegate(mut self, delegate: Delegation) -> Self {
        self.delegate = Some(delegate);
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn delegate(&self) -> Option<&Delegation> {
        self.delegate.as_ref()
    }

    pub fn is_delegated(&self) -> bool {
        self.delegate.is_some()
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// How a delegated block is resolved.
///
/// `hook` names a registered [`crate::DelegationHook`]; when absent the
/// assembler's default hook is used. `source` and `section` are parameters
/// read by the search-then-extract hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Delegation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl Delegation {
    pub fn via(hook: impl Into<String>) -> Self {
        Self {
            hook: Some(hook.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }
}

/// What the caller is currently doing. Read-only for the duration of a resolve call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub intent_tags: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,

    #[serde(default)]
    pub description: String,
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl AsRef<str>) -> Self {
        let tag = normalize_tag(tag.as_ref());
        if !tag.is_empty() {
            self.intent_tags.insert(tag);
        }
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tags.into_iter().fold(self, |ctx, tag| ctx.with_tag(tag))
    }

    #[must_use]
    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Tag membership, insensitive to case and surrounding whitespace
    pub fn has_tag(&self, tag: &str) -> bool {
        let wanted = normalize_tag(tag);
        self.intent_tags.iter().any(|t| normalize_tag(t) == wanted)
    }
}

pub(crate) fn normalize_tag(raw: &str) -> String {
    raw.trim().to_lowercase()
}
