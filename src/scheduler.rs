//! Expands scenes, insertable items and a variation count into generation jobs.
//!
//! Jobs come out in `(scene, item, variation)` order with scenes as the outer
//! loop, so a report sorted by key groups each scene's outcomes together.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::ImageFormat;
use serde::Serialize;

use crate::config::{GenerationOptions, TargetArea, TextStyle};
use crate::error::GenerationError;

/// A base image that content gets inserted into.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Scene {
    path: PathBuf,
    stem: String,
    extension: String,
}

impl Scene {
    /// Builds a scene from a path with a file stem and an image extension.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, GenerationError> {
        let path = path.into();
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                GenerationError::Config(format!("scene {} has no file name", path.display()))
            })?
            .to_string();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| {
                GenerationError::Config(format!("scene {} has no extension", path.display()))
            })?
            .to_string();
        if ImageFormat::from_extension(&extension).is_none() {
            return Err(GenerationError::Config(format!(
                "scene {} is not a recognised image format",
                path.display()
            )));
        }
        Ok(Self {
            path,
            stem,
            extension,
        })
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name without extension.
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Extension exactly as found on the scene file.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Image format implied by the extension.
    pub fn format(&self) -> Option<ImageFormat> {
        ImageFormat::from_extension(&self.extension)
    }
}

/// Something to place into a scene.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InsertableItem {
    /// An object cut from another image.
    Object {
        /// Object image on disk.
        path: PathBuf,
        /// Declared or detected type, eg `ball`.
        object_type: Option<String>,
    },
    /// A string rendered onto a surface.
    Text {
        /// The text itself.
        text: String,
        /// Surface to put it on.
        target_area: TargetArea,
        /// Optional typography style.
        style: Option<TextStyle>,
    },
}

impl InsertableItem {
    /// Operation tag used in output names.
    pub fn operation(&self) -> Operation {
        match self {
            Self::Object { .. } => Operation::Object,
            Self::Text { .. } => Operation::Text,
        }
    }

    fn validate(&self) -> Result<(), GenerationError> {
        match self {
            Self::Object { path, object_type } => {
                if path.file_name().is_none() {
                    return Err(GenerationError::Config(format!(
                        "object path {} has no file name",
                        path.display()
                    )));
                }
                if object_type.as_deref().is_some_and(|t| t.trim().is_empty()) {
                    return Err(GenerationError::Config(format!(
                        "object type for {} is empty",
                        path.display()
                    )));
                }
            }
            Self::Text { text, .. } => {
                if text.trim().is_empty() {
                    return Err(GenerationError::Config(
                        "text to insert must not be empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Kind of edit a job performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Object insertion.
    Object,
    /// Text insertion.
    Text,
    /// Item-less, scene driven variation.
    Scene,
}

impl Operation {
    /// Short tag used in output file names.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Object => "obj",
            Self::Text => "text",
            Self::Scene => "scene",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Identity of a job inside one batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct VariationKey {
    /// Position of the scene in the scheduler input.
    pub scene: usize,
    /// Position of the item, `None` for item-less jobs.
    pub item: Option<usize>,
    /// Variation index in `0..num_variations`.
    pub variation: u32,
}

impl fmt::Display for VariationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.item {
            Some(item) => write!(f, "s{}/i{}/v{}", self.scene, item, self.variation),
            None => write!(f, "s{}/-/v{}", self.scene, self.variation),
        }
    }
}

/// One generation job. Cheap to clone; scenes and items are shared, not copied.
#[derive(Clone, Debug)]
pub struct VariationSpec {
    /// Unique key within the batch.
    pub key: VariationKey,
    /// Scene to edit.
    pub scene: Arc<Scene>,
    /// Item to insert, if any.
    pub item: Option<Arc<InsertableItem>>,
    /// Index used in the output file name.
    pub output_index: u32,
    /// Batch wide generation options.
    pub options: Arc<GenerationOptions>,
}

impl VariationSpec {
    /// Operation this job performs.
    pub fn operation(&self) -> Operation {
        self.item
            .as_deref()
            .map_or(Operation::Scene, InsertableItem::operation)
    }
}

/// Validated job expansion for one batch.
#[derive(Clone, Debug)]
pub struct Scheduler {
    scenes: Arc<[Arc<Scene>]>,
    items: Arc<[Arc<InsertableItem>]>,
    num_variations: u32,
    options: Arc<GenerationOptions>,
}

impl Scheduler {
    /// Validates inputs once; every job produced afterwards is valid.
    pub fn new(
        scenes: Vec<Scene>,
        items: Vec<InsertableItem>,
        num_variations: u32,
        options: GenerationOptions,
    ) -> Result<Self, GenerationError> {
        if num_variations < 1 {
            return Err(GenerationError::Config(
                "number of variations must be at least 1".to_string(),
            ));
        }
        if scenes.is_empty() && items.is_empty() {
            return Err(GenerationError::Config(
                "no scenes and no insertable items were given".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for scene in &scenes {
            if !names.insert((scene.stem(), scene.extension())) {
                return Err(GenerationError::Config(format!(
                    "two scenes share the output name {}.{}",
                    scene.stem(),
                    scene.extension()
                )));
            }
        }
        for item in &items {
            item.validate()?;
        }

        Ok(Self {
            scenes: scenes.into_iter().map(Arc::new).collect(),
            items: items.into_iter().map(Arc::new).collect(),
            num_variations,
            options: Arc::new(options),
        })
    }

    /// Number of jobs the batch expands to.
    pub fn len(&self) -> usize {
        self.scenes.len() * self.item_slots() * self.num_variations as usize
    }

    /// True when no job would be produced.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scenes in input order.
    pub fn scenes(&self) -> &[Arc<Scene>] {
        &self.scenes
    }

    /// Items in input order.
    pub fn items(&self) -> &[Arc<InsertableItem>] {
        &self.items
    }

    /// Variations per (scene, item) pair.
    pub fn num_variations(&self) -> u32 {
        self.num_variations
    }

    /// A fresh pass over the jobs, from the first one.
    pub fn jobs(&self) -> Jobs {
        Jobs {
            scheduler: self.clone(),
            cursor: 0,
            total: self.len(),
        }
    }

    fn item_slots(&self) -> usize {
        self.items.len().max(1)
    }

    fn job_at(&self, position: usize) -> VariationSpec {
        let variations = self.num_variations as usize;
        let per_scene = self.item_slots() * variations;
        let scene = position / per_scene;
        let item_slot = (position % per_scene) / variations;
        let variation = (position % variations) as u32;
        let item = self.items.get(item_slot).cloned();
        let item_index = item.as_ref().map(|_| item_slot);

        VariationSpec {
            key: VariationKey {
                scene,
                item: item_index,
                variation,
            },
            scene: Arc::clone(&self.scenes[scene]),
            item,
            output_index: item_slot as u32 * self.num_variations + variation,
            options: Arc::clone(&self.options),
        }
    }
}

/// Lazy, owned job sequence; see [`Scheduler::jobs`].
#[derive(Debug)]
pub struct Jobs {
    scheduler: Scheduler,
    cursor: usize,
    total: usize,
}

impl Iterator for Jobs {
    type Item = VariationSpec;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.total {
            return None;
        }
        let job = self.scheduler.job_at(self.cursor);
        self.cursor += 1;
        Some(job)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.cursor;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Jobs {}
