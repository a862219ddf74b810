use crate::error::{LoadError, Result};
use crate::trigger::{RawTrigger, Trigger};
use crate::types::{Block, Delegation};
use serde::Deserialize;
use std::path::Path;

const FENCE: &str = "+++";
const UNTERMINATED: &str = "front matter is missing its closing '+++'";

/// Raw source of one block: where it came from and its full text
#[derive(Debug, Clone)]
pub struct Document {
    pub origin: String,
    pub text: String,
}

impl Document {
    pub fn new(origin: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            text: text.into(),
        }
    }

    pub fn read(path: &Path, root: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let origin = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        Ok(Self { origin, text })
    }

    /// Name used when front matter does not set one: the origin's file stem
    fn default_name(&self) -> String {
        Path::new(&self.origin)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.origin.clone())
    }

    pub(crate) fn into_block(self) -> Result<Block> {
        let (front, body) = split_front_matter(&self.text).map_err(|reason| self.invalid(reason))?;

        let front: FrontMatter = match front {
            Some(src) => toml::from_str(src).map_err(|err| self.invalid(err.to_string()))?,
            None => FrontMatter::default(),
        };

        let name = match front.name {
            Some(name) => name.trim().to_string(),
            None => self.default_name(),
        };
        if name.is_empty() {
            return Err(self.invalid("block name is empty"));
        }

        let trigger = match front.trigger {
            Some(raw) => raw.compile().map_err(|reason| LoadError::MalformedTrigger {
                block: name.clone(),
                reason,
            })?,
            None => Trigger::Always,
        };

        let delegate = match (front.delegated, front.delegate) {
            (true, delegate) => Some(delegate.unwrap_or_default()),
            (false, Some(_)) => {
                return Err(self.invalid("'delegate' table requires 'delegated = true'"));
            }
            (false, None) => None,
        };

        let mut block = Block::new(name, trigger, trim_blank_lines(body)).with_origin(self.origin);
        if let Some(delegate) = delegate {
            block = block.with_delegate(delegate);
        }
        Ok(block)
    }

    fn invalid(&self, reason: impl Into<String>) -> LoadError {
        LoadError::InvalidDocument {
            origin: self.origin.clone(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FrontMatter {
    name: Option<String>,
    trigger: Option<RawTrigger>,
    #[serde(default)]
    delegated: bool,
    delegate: Option<Delegation>,
}

/// Split `+++` fenced TOML front matter from the body.
fn split_front_matter(text: &str) -> std::result::Result<(Option<&str>, &str), String> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let Some(first_line_end) = text.find('\n') else {
        if text.trim_end() == FENCE {
            return Err(UNTERMINATED.to_string());
        }
        return Ok((None, text));
    };
    if text[..first_line_end].trim_end() != FENCE {
        return Ok((None, text));
    }

    let rest = &text[first_line_end + 1..];
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FENCE {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Ok((Some(front), body));
        }
        offset += line.len();
    }
    Err(UNTERMINATED.to_string())
}

fn trim_blank_lines(body: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());
    match (start, end) {
        (Some(start), Some(end)) => lines[start..=end].join("\n"),
        _ => String::new(),
    }
}
