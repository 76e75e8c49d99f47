//! Loading units and cross-unit class resolution.
//!
//! Every archive gets its own [`LoadingUnit`]. Units are published into the
//! [`UnitArena`] only once their archive has fully loaded; the arena probes
//! published units, in path order, when a name is not found locally.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::archive::{ArchiveImage, ClassDefinition};
use crate::error::{Error, Result};

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Where a resolved class came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassOrigin {
    /// Provided by the host itself.
    Core,
    /// Defined by the unit that asked.
    Local,
    /// Defined by another published unit.
    Unit(PathBuf),
}

/// Result of a successful resolution.
#[derive(Debug, Clone)]
pub struct ClassRef {
    /// Class name.
    pub name: String,
    /// Where it was found.
    pub origin: ClassOrigin,
    /// The definition, for classes that come from archives.
    pub definition: Option<Arc<ClassDefinition>>,
}

#[derive(Default)]
struct UnitClasses {
    order: Vec<Arc<ClassDefinition>>,
    by_name: HashMap<String, Arc<ClassDefinition>>,
}

/// The isolated namespace holding one archive's classes.
pub struct LoadingUnit {
    id: u64,
    archive: PathBuf,
    name: String,
    classes: RwLock<UnitClasses>,
    modules: Mutex<BTreeSet<String>>,
    released: AtomicBool,
}

impl LoadingUnit {
    /// Create a unit owning the classes of `image`.
    pub fn new(image: ArchiveImage) -> Self {
        let mut classes = UnitClasses::default();
        for class in image.classes {
            let class = Arc::new(class);
            classes.by_name.insert(class.name.clone(), class.clone());
            classes.order.push(class);
        }

        Self {
            id: NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed),
            archive: image.path,
            name: image.name,
            classes: RwLock::new(classes),
            modules: Mutex::new(BTreeSet::new()),
            released: AtomicBool::new(false),
        }
    }

    /// Unique unit ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Archive path this unit was created for.
    pub fn archive(&self) -> &Path {
        &self.archive
    }

    /// Archive name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Find a class defined by this unit.
    pub fn find(&self, name: &str) -> Option<Arc<ClassDefinition>> {
        self.classes.read().by_name.get(name).cloned()
    }

    /// Classes in archive order.
    pub fn classes(&self) -> Vec<Arc<ClassDefinition>> {
        self.classes.read().order.clone()
    }

    /// Names of modules enabled from this unit.
    pub fn modules(&self) -> Vec<String> {
        self.modules.lock().iter().cloned().collect()
    }

    pub(crate) fn attach_module(&self, name: &str) {
        self.modules.lock().insert(name.to_string());
    }

    /// Forget a module; returns how many remain.
    pub(crate) fn detach_module(&self, name: &str) -> usize {
        let mut modules = self.modules.lock();
        modules.remove(name);
        modules.len()
    }

    /// Drop every class definition. Idempotent.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut classes = self.classes.write();
        classes.order.clear();
        classes.by_name.clear();
        tracing::debug!("Released loading unit {} ({})", self.id, self.archive.display());
    }

    /// Whether [`release`](Self::release) has run.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LoadingUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingUnit")
            .field("id", &self.id)
            .field("archive", &self.archive)
            .field("classes", &self.classes.read().order.len())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Published loading units plus the host's core classes.
pub struct UnitArena {
    core: HashSet<String>,
    units: RwLock<BTreeMap<PathBuf, Arc<LoadingUnit>>>,
}

impl UnitArena {
    /// Create an arena with the given core class names.
    pub fn new<I, S>(core: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            core: core.into_iter().map(Into::into).collect(),
            units: RwLock::new(BTreeMap::new()),
        }
    }

    /// Make a fully loaded unit visible to resolution.
    pub fn publish(&self, unit: Arc<LoadingUnit>) -> Result<()> {
        let mut units = self.units.write();
        if units.contains_key(unit.archive()) {
            return Err(Error::ArchiveAlreadyLoaded(unit.archive().to_path_buf()));
        }
        tracing::debug!("Published loading unit for {}", unit.archive().display());
        units.insert(unit.archive().to_path_buf(), unit);
        Ok(())
    }

    /// Whether a unit for `archive` is published.
    pub fn is_published(&self, archive: &Path) -> bool {
        self.units.read().contains_key(archive)
    }

    /// The published unit for `archive`.
    pub fn get(&self, archive: &Path) -> Option<Arc<LoadingUnit>> {
        self.units.read().get(archive).cloned()
    }

    /// Unpublish and release the unit for `archive`.
    pub fn release(&self, archive: &Path) -> Option<Arc<LoadingUnit>> {
        let unit = self.units.write().remove(archive)?;
        unit.release();
        Some(unit)
    }

    /// Snapshot of published units in probe order.
    pub fn units(&self) -> Vec<Arc<LoadingUnit>> {
        self.units.read().values().cloned().collect()
    }

    /// Number of published units.
    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    /// Whether no unit is published.
    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }

    /// Resolve a name from the host side: core classes, then every
    /// published unit.
    pub fn resolve(&self, name: &str) -> Result<ClassRef> {
        self.resolve_shared(name, "host")
    }

    /// Resolve a name referenced by `class` inside `unit`, which may still
    /// be loading: the unit's own classes first, then the shared lookup.
    pub fn resolve_for(&self, unit: &LoadingUnit, class: &str, name: &str) -> Result<ClassRef> {
        if let Some(definition) = unit.find(name) {
            return Ok(ClassRef {
                name: name.to_string(),
                origin: ClassOrigin::Local,
                definition: Some(definition),
            });
        }
        self.resolve_shared(name, class)
    }

    fn resolve_shared(&self, name: &str, referenced_by: &str) -> Result<ClassRef> {
        if self.core.contains(name) {
            return Ok(ClassRef {
                name: name.to_string(),
                origin: ClassOrigin::Core,
                definition: None,
            });
        }

        for unit in self.units() {
            if let Some(definition) = unit.find(name) {
                tracing::debug!(
                    "Resolved {} for {} in {}",
                    name,
                    referenced_by,
                    unit.archive().display()
                );
                return Ok(ClassRef {
                    name: name.to_string(),
                    origin: ClassOrigin::Unit(unit.archive().to_path_buf()),
                    definition: Some(definition),
                });
            }
        }

        Err(Error::unresolved(name, referenced_by))
    }
}

impl std::fmt::Debug for UnitArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitArena")
            .field("core_classes", &self.core.len())
            .field("units", &self.len())
            .finish()
    }
}
