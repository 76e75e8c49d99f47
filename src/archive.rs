//! Archive manifests, class definitions, and the symbol table that binds
//! class entries to compiled constructors.
//!
//! An archive is a TOML document listing the classes it ships:
//!
//! ```toml
//! name = "core"
//! version = "1.0.0"
//!
//! [[class]]
//! name = "core.CoreModule"
//! entry = "core_module"
//! requires = ["core.Api"]
//!
//! [class.tags.module]
//! name = "Core"
//!
//! [[class]]
//! name = "core.Api"
//! ```
//!
//! The `entry` of a class names a symbol defined in the host's [`Linker`].

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandFactory};
use crate::error::{Error, Result};
use crate::module::{Module, ModuleFactory};

/// Kind of a declarative tag.
///
/// The set of kinds is open: modules may register handlers for new kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagKind(Cow<'static, str>);

impl TagKind {
    /// Declares a module class.
    pub const MODULE: TagKind = TagKind(Cow::Borrowed("module"));
    /// Declares a command class.
    pub const COMMAND: TagKind = TagKind(Cow::Borrowed("command"));

    /// Create a tag kind.
    pub fn new(kind: impl Into<Cow<'static, str>>) -> Self {
        Self(kind.into())
    }

    /// The kind as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TagKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key/value payload of a tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagData(BTreeMap<String, String>);

impl TagData {
    /// Create empty tag data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Value of `key`, treating empty strings as absent.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// Iterate over entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A declarative tag attached to a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tag kind.
    pub kind: TagKind,
    /// Tag payload.
    pub data: TagData,
}

impl Tag {
    /// Create a tag.
    pub fn new(kind: TagKind, data: TagData) -> Self {
        Self { kind, data }
    }

    /// Module declaration with no dependency.
    pub fn module(name: impl Into<String>) -> Self {
        Self::new(TagKind::MODULE, TagData::new().with("name", name))
    }

    /// Module declaration that must load after `dependency`.
    pub fn module_after(name: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::new(
            TagKind::MODULE,
            TagData::new()
                .with("name", name)
                .with("load_after", dependency),
        )
    }

    /// Command declaration owned by `module`.
    pub fn command(module: impl Into<String>) -> Self {
        Self::new(TagKind::COMMAND, TagData::new().with("module", module))
    }
}

/// The executable part of a class.
#[derive(Debug, Clone)]
pub enum ClassBody {
    /// Implements [`Module`].
    Module(ModuleFactory),
    /// Implements [`Command`].
    Command(CommandFactory),
    /// No constructor; the class only exports a name.
    Data,
}

impl ClassBody {
    /// Short description for diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Module(_) => "module",
            Self::Command(_) => "command",
            Self::Data => "data",
        }
    }
}

/// A class loaded from an archive.
#[derive(Debug, Clone)]
pub struct ClassDefinition {
    /// Fully-qualified class name.
    pub name: String,
    /// Tags in declaration order.
    pub tags: Vec<Tag>,
    /// Abstract classes cannot be instantiated.
    pub is_abstract: bool,
    /// Class names this class references.
    pub requires: Vec<String>,
    /// Constructor, if any.
    pub body: ClassBody,
}

impl ClassDefinition {
    /// A data-only class.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            is_abstract: false,
            requires: Vec::new(),
            body: ClassBody::Data,
        }
    }

    /// Set the module constructor.
    pub fn module(mut self, factory: ModuleFactory) -> Self {
        self.body = ClassBody::Module(factory);
        self
    }

    /// Set the command constructor.
    pub fn command(mut self, factory: CommandFactory) -> Self {
        self.body = ClassBody::Command(factory);
        self
    }

    /// Add a tag.
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Add a referenced class name.
    pub fn requires(mut self, class: impl Into<String>) -> Self {
        self.requires.push(class.into());
        self
    }

    /// Mark the class abstract.
    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }
}

/// Class entry as written in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassEntry {
    /// Fully-qualified class name.
    pub name: String,
    /// Linker symbol of the constructor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    /// Whether the class is abstract.
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    /// Referenced class names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Tags keyed by kind.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, TagData>,
}

/// Parsed archive manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// Archive name; defaults to the file stem.
    #[serde(default)]
    pub name: Option<String>,
    /// Archive version.
    #[serde(default)]
    pub version: Option<String>,
    /// Classes in load order.
    #[serde(default, rename = "class")]
    pub classes: Vec<ClassEntry>,
}

impl ArchiveManifest {
    /// Load a manifest from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a manifest from TOML.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Check class names are present and unique.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for class in &self.classes {
            if class.name.is_empty() {
                return Err(Error::ManifestParse("class with empty name".into()));
            }
            if !seen.insert(class.name.as_str()) {
                return Err(Error::ManifestParse(format!(
                    "class {} declared twice",
                    class.name
                )));
            }
            if class.entry.as_deref() == Some("") {
                return Err(Error::ManifestParse(format!(
                    "class {} has an empty entry symbol",
                    class.name
                )));
            }
        }
        Ok(())
    }
}

/// Symbol table binding entry names to compiled constructors.
#[derive(Debug, Default)]
pub struct Linker {
    symbols: DashMap<String, ClassBody>,
}

impl Linker {
    /// Create an empty linker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a symbol. Returns false if the symbol is already bound.
    pub fn define(&self, symbol: impl Into<String>, body: ClassBody) -> bool {
        match self.symbols.entry(symbol.into()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(body);
                true
            }
        }
    }

    /// Bind a default-constructible module type.
    pub fn define_module<T: Module + Default>(&self, symbol: impl Into<String>) -> bool {
        self.define(symbol, ClassBody::Module(ModuleFactory::of::<T>()))
    }

    /// Bind a default-constructible command type.
    pub fn define_command<T: Command + Default>(&self, symbol: impl Into<String>) -> bool {
        self.define(symbol, ClassBody::Command(CommandFactory::of::<T>()))
    }

    /// Look up a symbol.
    pub fn lookup(&self, symbol: &str) -> Option<ClassBody> {
        self.symbols.get(symbol).map(|b| b.clone())
    }

    /// Number of bound symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether no symbols are bound.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// An archive's classes, ready to be loaded into a unit.
#[derive(Debug, Clone)]
pub struct ArchiveImage {
    /// Path the archive was read from.
    pub path: PathBuf,
    /// Archive name.
    pub name: String,
    /// Archive version, if declared.
    pub version: Option<String>,
    /// Classes in manifest order.
    pub classes: Vec<ClassDefinition>,
}

/// Produces class definitions from an archive on disk.
pub trait ArchiveReader: Send + Sync {
    /// Read the archive at `path`.
    fn read(&self, path: &Path) -> Result<ArchiveImage>;
}

/// Reads TOML archive manifests and binds entries through a [`Linker`].
#[derive(Debug, Clone)]
pub struct ManifestReader {
    linker: Arc<Linker>,
    strict: bool,
}

impl ManifestReader {
    /// Create a reader. Strict readers validate manifests before binding.
    pub fn new(linker: Arc<Linker>, strict: bool) -> Self {
        Self { linker, strict }
    }

    /// Turn a parsed manifest into an image.
    pub fn bind(&self, path: &Path, manifest: ArchiveManifest) -> Result<ArchiveImage> {
        if self.strict {
            manifest.validate()?;
        }

        let name = manifest.name.clone().unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unnamed")
                .to_string()
        });

        let classes = manifest
            .classes
            .into_iter()
            .map(|entry| self.bind_class(entry))
            .collect::<Result<Vec<_>>>()?;

        Ok(ArchiveImage {
            path: path.to_path_buf(),
            name,
            version: manifest.version,
            classes,
        })
    }

    fn bind_class(&self, entry: ClassEntry) -> Result<ClassDefinition> {
        let body = match entry.entry {
            Some(ref symbol) => self
                .linker
                .lookup(symbol)
                .ok_or_else(|| Error::unresolved(symbol.clone(), entry.name.clone()))?,
            None => ClassBody::Data,
        };

        let tags = entry
            .tags
            .into_iter()
            .map(|(kind, data)| Tag::new(TagKind::new(kind), data))
            .collect();

        Ok(ClassDefinition {
            name: entry.name,
            tags,
            is_abstract: entry.is_abstract,
            requires: entry.requires,
            body,
        })
    }
}

impl ArchiveReader for ManifestReader {
    fn read(&self, path: &Path) -> Result<ArchiveImage> {
        let manifest = ArchiveManifest::from_file(path)?;
        self.bind(path, manifest)
    }
}
