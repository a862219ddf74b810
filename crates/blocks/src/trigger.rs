use crate::error::UnsupportedTriggerError;
use crate::types::{normalize_tag, Block, TaskContext};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Condition deciding whether a block applies to a task
#[derive(Clone, Debug)]
pub enum Trigger {
    /// Always applies
    Always,

    /// Applies when any tag intersects the task's intent tags
    Tags(BTreeSet<String>),

    /// Applies when the task's file path matches any glob
    Path(PathGlob),

    /// Applies when the task description mentions any keyword as a whole word
    Mentions(Vec<Keyword>),

    All(Vec<Trigger>),
    Any(Vec<Trigger>),
    Not(Box<Trigger>),

    /// Kind not understood by this evaluator; evaluation fails
    Unsupported { kind: String },
}

#[derive(Clone, Debug)]
pub struct PathGlob {
    patterns: Vec<String>,
    set: GlobSet,
}

impl PathGlob {
    pub fn new<I, S>(patterns: I) -> Result<Self, globset::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();
        for pattern in patterns {
            let pattern = normalize_path(pattern.as_ref());
            if pattern.is_empty() {
                continue;
            }
            builder.add(GlobBuilder::new(&pattern).literal_separator(true).build()?);
            kept.push(pattern);
        }
        Ok(Self {
            patterns: kept,
            set: builder.build()?,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.set.is_match(normalize_path(path))
    }
}

#[derive(Clone, Debug)]
pub struct Keyword {
    word: String,
    pattern: Regex,
}

impl Keyword {
    pub fn new(word: &str) -> Result<Self, regex::Error> {
        let word = word.trim().to_string();
        let pattern = Regex::new(&format!(r"(?i)(?:^|\W){}(?:$|\W)", regex::escape(&word)))?;
        Ok(Self { word, pattern })
    }

    pub fn word(&self) -> &str {
        &self.word
    }

    fn is_mentioned_in(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

impl Trigger {
    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Tags(
            tags.into_iter()
                .map(|t| normalize_tag(t.as_ref()))
                .filter(|t| !t.is_empty())
                .collect(),
        )
    }

    pub fn path(pattern: &str) -> Result<Self, globset::Error> {
        PathGlob::new([pattern]).map(Self::Path)
    }

    pub fn mentions<I, S>(words: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        words
            .into_iter()
            .filter(|w| !w.as_ref().trim().is_empty())
            .map(|w| Keyword::new(w.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map(Self::Mentions)
    }

    /// Evaluate against a task. `Err` carries the first unsupported kind reached.
    pub fn evaluate(&self, ctx: &TaskContext) -> Result<bool, &str> {
        match self {
            Self::Always => Ok(true),
            Self::Tags(tags) => Ok(tags.iter().any(|t| ctx.has_tag(t))),
            Self::Path(glob) => Ok(ctx
                .file_path
                .as_deref()
                .is_some_and(|path| glob.is_match(path))),
            Self::Mentions(words) => Ok(words.iter().any(|w| w.is_mentioned_in(&ctx.description))),
            Self::All(children) => {
                for child in children {
                    if !child.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any(children) => {
                for child in children {
                    if child.evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not(child) => child.evaluate(ctx).map(|m| !m),
            Self::Unsupported { kind } => Err(kind.as_str()),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Always => "always",
            Self::Tags(_) => "tags",
            Self::Path(_) => "path",
            Self::Mentions(_) => "mentions",
            Self::All(_) => "all",
            Self::Any(_) => "any",
            Self::Not(_) => "not",
            Self::Unsupported { kind } => kind,
        }
    }

    /// First unsupported kind anywhere in the tree, reachable or not
    pub fn unsupported_kind(&self) -> Option<&str> {
        match self {
            Self::All(children) | Self::Any(children) => {
                children.iter().find_map(Self::unsupported_kind)
            }
            Self::Not(child) => child.unsupported_kind(),
            Self::Unsupported { kind } => Some(kind.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: impl Iterator<Item = T>) -> fmt::Result {
            for (i, item) in items.enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }

        match self {
            Self::Always => f.write_str("always"),
            Self::Unsupported { kind } => write!(f, "unsupported({kind})"),
            Self::Not(child) => write!(f, "not({child})"),
            other => {
                write!(f, "{}(", other.kind())?;
                match other {
                    Self::Tags(tags) => list(f, tags.iter())?,
                    Self::Path(glob) => list(f, glob.patterns().iter())?,
                    Self::Mentions(words) => list(f, words.iter().map(Keyword::word))?,
                    Self::All(children) | Self::Any(children) => list(f, children.iter())?,
                    _ => {}
                }
                f.write_str(")")
            }
        }
    }
}

/// Condition Evaluator: does `block` apply to `ctx`?
pub fn matches(block: &Block, ctx: &TaskContext) -> Result<bool, UnsupportedTriggerError> {
    block
        .trigger()
        .evaluate(ctx)
        .map_err(|kind| UnsupportedTriggerError {
            block: block.name().to_string(),
            kind: kind.to_string(),
        })
}

/// Trigger table as written in document front matter
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct RawTrigger {
    kind: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    pattern: Option<String>,
    #[serde(default)]
    patterns: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    conditions: Vec<RawTrigger>,
    condition: Option<Box<RawTrigger>>,

    /// Keys belonging to kinds this evaluator does not know
    #[serde(flatten)]
    extra: BTreeMap<String, toml::Value>,
}

impl RawTrigger {
    fn present_fields(&self) -> Vec<&str> {
        let mut fields = Vec::new();
        if !self.tags.is_empty() {
            fields.push("tags");
        }
        if self.pattern.is_some() {
            fields.push("pattern");
        }
        if !self.patterns.is_empty() {
            fields.push("patterns");
        }
        if !self.keywords.is_empty() {
            fields.push("keywords");
        }
        if !self.conditions.is_empty() {
            fields.push("conditions");
        }
        if self.condition.is_some() {
            fields.push("condition");
        }
        fields.extend(self.extra.keys().map(String::as_str));
        fields
    }

    fn reject_fields_except(&self, kind: &str, allowed: &[&str]) -> Result<(), String> {
        let stray: Vec<&str> = self
            .present_fields()
            .into_iter()
            .filter(|f| !allowed.contains(f))
            .collect();
        if stray.is_empty() {
            Ok(())
        } else {
            Err(format!("field(s) {} not valid for kind '{kind}'", stray.join(", ")))
        }
    }

    /// Compile into a [`Trigger`]. `Err` is a human-readable reason.
    pub(crate) fn compile(self) -> Result<Trigger, String> {
        let kind = self
            .kind
            .as_deref()
            .map(|k| k.trim().to_ascii_lowercase())
            .ok_or_else(|| "trigger is missing 'kind'".to_string())?;

        match kind.as_str() {
            "always" => {
                self.reject_fields_except(&kind, &[])?;
                Ok(Trigger::Always)
            }
            "tags" => {
                self.reject_fields_except(&kind, &["tags"])?;
                let trigger = Trigger::tags(&self.tags);
                match &trigger {
                    Trigger::Tags(tags) if tags.is_empty() => {
                        Err("'tags' trigger needs at least one non-empty tag".to_string())
                    }
                    _ => Ok(trigger),
                }
            }
            "path" | "glob" => {
                self.reject_fields_except(&kind, &["pattern", "patterns"])?;
                let patterns: Vec<String> = self.pattern.into_iter().chain(self.patterns).collect();
                let glob = PathGlob::new(&patterns).map_err(|err| format!("invalid glob: {err}"))?;
                if glob.patterns().is_empty() {
                    return Err("'path' trigger needs 'pattern' or 'patterns'".to_string());
                }
                Ok(Trigger::Path(glob))
            }
            "mentions" => {
                self.reject_fields_except(&kind, &["keywords"])?;
                let trigger = Trigger::mentions(&self.keywords)
                    .map_err(|err| format!("invalid keyword: {err}"))?;
                match &trigger {
                    Trigger::Mentions(words) if words.is_empty() => {
                        Err("'mentions' trigger needs at least one keyword".to_string())
                    }
                    _ => Ok(trigger),
                }
            }
            "all" | "any" => {
                self.reject_fields_except(&kind, &["conditions"])?;
                if self.conditions.is_empty() {
                    return Err(format!("'{kind}' trigger needs at least one condition"));
                }
                let children = self
                    .conditions
                    .into_iter()
                    .map(RawTrigger::compile)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if kind == "all" {
                    Trigger::All(children)
                } else {
                    Trigger::Any(children)
                })
            }
            "not" => {
                self.reject_fields_except(&kind, &["condition"])?;
                let child = self
                    .condition
                    .ok_or_else(|| "'not' trigger needs a 'condition'".to_string())?;
                Ok(Trigger::Not(Box::new(child.compile()?)))
            }
            "" => Err("trigger 'kind' is empty".to_string()),
            _ => Ok(Trigger::Unsupported { kind }),
        }
    }
}

pub(crate) fn normalize_path(raw: &str) -> String {
    let mut value = raw.trim().replace('\\', "/");
    while let Some(rest) = value.strip_prefix("./") {
        value = rest.to_string();
    }
    value
}
