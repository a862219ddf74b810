use crate::document::Document;
use crate::error::{LoadError, Result};
use crate::types::Block;
use ignore::WalkBuilder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Config file living next to block documents; never loaded as a block
pub const CONFIG_FILE_NAME: &str = "context-blocks.toml";

const DOCUMENT_EXTENSIONS: &[&str] = &["md", "markdown"];

/// Immutable collection of blocks in load order
#[derive(Debug, Clone, Default)]
pub struct BlockStore {
    blocks: Vec<Block>,
    by_name: HashMap<String, usize>,
}

impl BlockStore {
    /// Build a store from documents, rejecting name collisions
    pub fn load<I>(documents: I) -> Result<Self>
    where
        I: IntoIterator<Item = Document>,
    {
        documents
            .into_iter()
            .map(Document::into_block)
            .collect::<Result<Vec<_>>>()
            .and_then(Self::from_blocks)
    }

    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(blocks.len());
        for (idx, block) in blocks.iter().enumerate() {
            if let Some(&first) = by_name.get(block.name()) {
                let first: &Block = &blocks[first];
                return Err(LoadError::DuplicateName {
                    name: block.name().to_string(),
                    first: first.origin().to_string(),
                    second: block.origin().to_string(),
                });
            }
            by_name.insert(block.name().to_string(), idx);
        }
        Ok(Self { blocks, by_name })
    }

    /// Discover and load every block document under `root`
    pub fn load_dir(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let documents = DocumentScanner::new(root)
            .scan()?
            .iter()
            .map(|path| Document::read(path, root))
            .collect::<Result<Vec<_>>>()?;
        let store = Self::load(documents)?;
        log::info!("Loaded {} blocks from {}", store.len(), root.display());
        Ok(store)
    }

    pub fn all_blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get(&self, name: &str) -> Option<&Block> {
        self.by_name.get(name).map(|&idx| &self.blocks[idx])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().map(Block::name)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Finds block documents under a directory (.gitignore aware)
pub struct DocumentScanner {
    root: PathBuf,
}

impl DocumentScanner {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Document paths sorted by their path relative to the root
    pub fn scan(&self) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Err(LoadError::Io {
                path: self.root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            });
        }

        let mut files = Vec::new();
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(true)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(true)
            .require_git(false);

        for result in builder.build() {
            let entry = result?;
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            if !Self::is_document(path) {
                log::debug!("Skipping non-document {}", path.display());
                continue;
            }
            files.push(path.to_path_buf());
        }

        files.sort_by(|a, b| {
            a.strip_prefix(&self.root)
                .unwrap_or(a)
                .cmp(b.strip_prefix(&self.root).unwrap_or(b))
        });
        Ok(files)
    }

    fn is_document(path: &Path) -> bool {
        if path.file_name().and_then(|n| n.to_str()) == Some(CONFIG_FILE_NAME) {
            return false;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                DOCUMENT_EXTENSIONS
                    .iter()
                    .any(|candidate| ext.eq_ignore_ascii_case(candidate))
            })
    }
}
