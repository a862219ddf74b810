use super::DelegationHook;
use crate::error::RetrievalError;
use crate::store::DocumentScanner;
use crate::types::{Block, Delegation, TaskContext};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path, PathBuf};

static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(#{1,6})[ \t]+(.*?)[ \t]*#*[ \t]*$").expect("heading regex"));

/// Search-then-extract hook over a directory of markdown documents.
///
/// `delegate.source` selects one document (relative to the corpus root);
/// without it every document is searched in path order. `delegate.section`
/// selects the subsection under a matching heading; it defaults to the block
/// name when no source is given, and to the whole document otherwise.
#[derive(Debug, Clone)]
pub struct SectionExtractor {
    name: String,
    root: PathBuf,
}

impl SectionExtractor {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, source: &str) -> Result<PathBuf, RetrievalError> {
        let relative = Path::new(source);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || source.trim().is_empty() {
            return Err(RetrievalError::InvalidRequest {
                message: format!("source '{source}' must be a relative path inside the corpus"),
            });
        }
        Ok(self.root.join(relative))
    }

    async fn read(&self, path: &Path) -> Result<String, RetrievalError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|err| RetrievalError::Io {
                message: format!("{}: {err}", path.display()),
            })
    }

    async fn search_corpus(&self, section: &str) -> Result<String, RetrievalError> {
        let scanner = DocumentScanner::new(&self.root);
        let paths = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(|err| RetrievalError::Io {
                message: format!("corpus scan task: {err}"),
            })?
            .map_err(|err| RetrievalError::Io {
                message: err.to_string(),
            })?;

        for path in paths {
            let text = self.read(&path).await?;
            if let Some(found) = extract_section(&text, section) {
                log::debug!("Section '{section}' found in {}", path.display());
                return Ok(found);
            }
        }
        Err(RetrievalError::SectionNotFound {
            scope: "corpus".to_string(),
            section: section.to_string(),
        })
    }
}

#[async_trait]
impl DelegationHook for SectionExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, block: &Block, _ctx: &TaskContext) -> Result<String, RetrievalError> {
        let fallback = Delegation::default();
        let delegate = block.delegate().unwrap_or(&fallback);

        match (&delegate.source, &delegate.section) {
            (Some(source), section) => {
                let text = self.read(&self.document_path(source)?).await?;
                match section {
                    Some(section) => extract_section(&text, section).ok_or_else(|| {
                        RetrievalError::SectionNotFound {
                            scope: source.clone(),
                            section: section.clone(),
                        }
                    }),
                    None => Ok(text.trim().to_string()),
                }
            }
            (None, Some(section)) => self.search_corpus(section).await,
            (None, None) => self.search_corpus(block.name()).await,
        }
    }
}

/// The subsection under the first heading titled `title` (case-insensitive),
/// up to the next heading of the same or higher level. Fenced code is not
/// scanned for headings.
pub fn extract_section(text: &str, title: &str) -> Option<String> {
    let wanted = title.trim().to_lowercase();
    let mut in_fence = false;
    let mut level: Option<usize> = None;
    let mut lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }
        let heading = if in_fence {
            None
        } else {
            HEADING
                .captures(line)
                .map(|caps| (caps[1].len(), caps.get(2).map_or("", |m| m.as_str())))
        };

        match (level, heading) {
            (None, Some((found, heading_text))) if heading_text.trim().to_lowercase() == wanted => {
                level = Some(found);
                lines.push(line);
            }
            (Some(current), Some((next, _))) if next <= current => break,
            (Some(_), _) => lines.push(line),
            (None, _) => {}
        }
    }

    level.map(|_| lines.join("\n").trim().to_string())
}
