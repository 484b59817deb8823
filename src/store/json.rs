//! JSON-backed persistence strategy.
//!
//! On-disk layout:
//! - an images directory (flat) with an `info.json` holding the camera
//!   intrinsics per image file name: `{"K": [9 floats], "nearPlane"?, "farPlane"?}`
//! - optional segmentation images named `<image stem><suffix>.<ext>`, either
//!   next to the images or in their own directory
//! - an object models directory, scanned recursively, one mesh per directory
//! - a poses file: `{"<image file>": [{"id", "R": [9 floats], "t": [3 floats], "obj"}]}`
//!
//! The poses file is rewritten as a whole on every mutation.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cgmath::Vector3;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::scan::{self, IMAGE_EXTENSIONS};
use super::watch::ChangeWatcher;
use super::{InvalidEntity, LoadOutcome, PersistMode, PersistenceStrategy};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::math;
use crate::state::data::{derive_pose_id, Image, ObjectModel, Pose};
use crate::state::events::DataKinds;

/// Name of the camera parameters file inside the images directory
pub const CAMERA_INFO_FILE: &str = "info.json";

#[derive(Debug, Deserialize)]
struct CameraInfo {
    #[serde(rename = "K")]
    k: Vec<f64>,
    #[serde(rename = "nearPlane")]
    near_plane: Option<f64>,
    #[serde(rename = "farPlane")]
    far_plane: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PoseEntry {
    id: Option<String>,
    #[serde(rename = "R")]
    rotation: [f64; 9],
    #[serde(rename = "t")]
    translation: [f64; 3],
    obj: String,
}

pub struct JsonStrategy {
    images_path: PathBuf,
    segmentation_images_path: Option<PathBuf>,
    segmentation_suffix: String,
    object_models_path: PathBuf,
    poses_file_path: PathBuf,
    near_plane: f64,
    far_plane: f64,
    watcher: ChangeWatcher,
    /// Every pose id in the document as of the last load or write,
    /// including entries the load skipped
    document_ids: HashSet<String>,
}

impl JsonStrategy {
    /// Create a strategy for the configured paths
    ///
    /// Paths are not required to exist yet; loads report missing paths as
    /// errors and the watcher picks them up once they appear.
    pub fn new(settings: &Settings) -> Self {
        let mut strategy = Self {
            images_path: settings.images_path.clone(),
            segmentation_images_path: settings.segmentation_images_path.clone(),
            segmentation_suffix: settings.segmentation_suffix.clone(),
            object_models_path: settings.object_models_path.clone(),
            poses_file_path: settings.poses_file_path.clone(),
            near_plane: settings.near_plane,
            far_plane: settings.far_plane,
            watcher: ChangeWatcher::new(),
            document_ids: HashSet::new(),
        };
        strategy.watch_images();
        strategy
            .watcher
            .watch(DataKinds::OBJECT_MODELS, &strategy.object_models_path, true);
        strategy
            .watcher
            .watch(DataKinds::POSES, &strategy.poses_file_path, false);
        strategy
    }

    pub fn images_path(&self) -> &Path {
        &self.images_path
    }

    pub fn object_models_path(&self) -> &Path {
        &self.object_models_path
    }

    pub fn poses_file_path(&self) -> &Path {
        &self.poses_file_path
    }

    pub fn watcher(&self) -> &ChangeWatcher {
        &self.watcher
    }

    /// Point the strategy at a new images directory
    ///
    /// Returns the data that has to be reloaded (nothing if the path did not
    /// change).
    pub fn set_images_path(&mut self, path: &Path) -> Result<DataKinds> {
        require_directory(path)?;
        if self.images_path == path {
            return Ok(DataKinds::NONE);
        }
        self.images_path = path.to_path_buf();
        self.watch_images();
        Ok(DataKinds::IMAGES)
    }

    pub fn set_segmentation_images_path(&mut self, path: Option<&Path>) -> Result<DataKinds> {
        if let Some(path) = path {
            require_directory(path)?;
        }
        if self.segmentation_images_path.as_deref() == path {
            return Ok(DataKinds::NONE);
        }
        self.segmentation_images_path = path.map(Path::to_path_buf);
        self.watch_images();
        Ok(DataKinds::IMAGES)
    }

    pub fn set_segmentation_suffix(&mut self, suffix: &str) -> DataKinds {
        if self.segmentation_suffix == suffix {
            return DataKinds::NONE;
        }
        self.segmentation_suffix = suffix.to_string();
        DataKinds::IMAGES
    }

    pub fn set_object_models_path(&mut self, path: &Path) -> Result<DataKinds> {
        require_directory(path)?;
        if self.object_models_path == path {
            return Ok(DataKinds::NONE);
        }
        self.watcher.unwatch(DataKinds::OBJECT_MODELS);
        self.watcher.watch(DataKinds::OBJECT_MODELS, path, true);
        self.object_models_path = path.to_path_buf();
        Ok(DataKinds::OBJECT_MODELS)
    }

    pub fn set_poses_file_path(&mut self, path: &Path) -> Result<DataKinds> {
        if !path.exists() {
            return Err(Error::PathNotFound(path.to_path_buf()));
        }
        if !path.is_file() {
            return Err(Error::PathNotAFile(path.to_path_buf()));
        }
        if self.poses_file_path == path {
            return Ok(DataKinds::NONE);
        }
        self.watcher.unwatch(DataKinds::POSES);
        self.watcher.watch(DataKinds::POSES, path, false);
        self.poses_file_path = path.to_path_buf();
        Ok(DataKinds::POSES)
    }

    /// Apply every path in `settings`, stopping at the first invalid one
    pub fn apply_settings(&mut self, settings: &Settings) -> Result<DataKinds> {
        let mut changed = DataKinds::NONE;
        changed |= self.set_images_path(&settings.images_path)?;
        changed |= self.set_segmentation_images_path(settings.segmentation_images_path.as_deref())?;
        changed |= self.set_segmentation_suffix(&settings.segmentation_suffix);
        changed |= self.set_object_models_path(&settings.object_models_path)?;
        changed |= self.set_poses_file_path(&settings.poses_file_path)?;
        if self.near_plane != settings.near_plane || self.far_plane != settings.far_plane {
            self.near_plane = settings.near_plane;
            self.far_plane = settings.far_plane;
            changed |= DataKinds::IMAGES;
        }
        Ok(changed)
    }

    fn watch_images(&mut self) {
        self.watcher.unwatch(DataKinds::IMAGES);
        self.watcher.watch(DataKinds::IMAGES, &self.images_path, false);
        if let Some(segmentation) = &self.segmentation_images_path {
            if segmentation != &self.images_path {
                self.watcher.watch(DataKinds::IMAGES, segmentation, false);
            }
        }
    }

    /// Whether a file name in the images directory is a segmentation image
    fn is_segmentation_name(&self, name: &str) -> bool {
        !self.segmentation_suffix.is_empty() && stem(name).ends_with(&self.segmentation_suffix)
    }

    /// Map `<image stem>` to the absolute path of its segmentation image
    fn find_segmentation_images(&self, outcome: &mut LoadOutcome<Image>) -> HashMap<String, PathBuf> {
        let mut segmentations = HashMap::new();
        let (directory, separate) = match &self.segmentation_images_path {
            Some(dir) if dir != &self.images_path => (dir.as_path(), true),
            _ => (self.images_path.as_path(), false),
        };
        if !separate && self.segmentation_suffix.is_empty() {
            return segmentations;
        }

        let files = match scan::list_files(directory, &IMAGE_EXTENSIONS) {
            Ok(files) => files,
            Err(_) => {
                outcome.errors.push(Error::PathNotFound(directory.to_path_buf()));
                return segmentations;
            }
        };

        for name in files {
            let file_stem = stem(&name);
            let Some(image_stem) = file_stem.strip_suffix(self.segmentation_suffix.as_str()) else {
                continue;
            };
            // First match wins, files are naturally sorted
            segmentations
                .entry(image_stem.to_string())
                .or_insert_with(|| directory.join(&name));
        }
        segmentations
    }

    fn read_camera_info(&self) -> Result<Map<String, Value>> {
        let path = self.images_path.join(CAMERA_INFO_FILE);
        if !path.is_file() {
            return Err(Error::PathNotFound(path));
        }
        let content = fs::read_to_string(&path).map_err(|e| Error::malformed(&path, e))?;
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(Error::malformed(&path, "expected a JSON object keyed by image file name")),
            Err(e) => Err(Error::malformed(&path, e)),
        }
    }

    fn image_from_camera_info(&self, name: &str, info: &Value) -> std::result::Result<Image, String> {
        let info: CameraInfo = serde_json::from_value(info.clone()).map_err(|e| e.to_string())?;
        let k: [f64; 9] = info
            .k
            .as_slice()
            .try_into()
            .map_err(|_| format!("camera matrix K must have 9 values, got {}", info.k.len()))?;
        if !math::is_finite_matrix(&k) {
            return Err("camera matrix K contains non-finite values".to_string());
        }

        Ok(Image {
            id: name.to_string(),
            relative_path: name.to_string(),
            segmentation_path: None,
            base_path: self.images_path.clone(),
            camera_matrix: math::matrix_from_row_major(&k),
            near_plane: info.near_plane.unwrap_or(self.near_plane),
            far_plane: info.far_plane.unwrap_or(self.far_plane),
        })
    }

    /// Read the poses document; an empty file counts as an empty document
    fn read_poses_document(&self) -> Result<Map<String, Value>> {
        let path = &self.poses_file_path;
        if !path.exists() {
            return Err(Error::PathNotFound(path.clone()));
        }
        if !path.is_file() {
            return Err(Error::PathNotAFile(path.clone()));
        }
        let content = fs::read_to_string(path).map_err(|e| Error::malformed(path, e))?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(Error::malformed(path, "expected a JSON object keyed by image path")),
            Err(e) => Err(Error::malformed(path, e)),
        }
    }

    /// Replace the poses document on disk
    ///
    /// The new content goes to a sibling temporary file that is renamed over
    /// the document, so readers see either the old or the new version. The
    /// write generation is bumped before anything touches the disk.
    fn write_poses_document(&mut self, document: &Map<String, Value>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(document)?;
        let path = self.poses_file_path.clone();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "poses.json".to_string());
        let temporary = path.with_file_name(format!(".{file_name}.tmp"));

        let generation = self.watcher.begin_self_write(&path);
        let result = fs::write(&temporary, json).and_then(|_| fs::rename(&temporary, &path));
        if result.is_err() {
            let _ = fs::remove_file(&temporary);
        }
        self.watcher.finish_self_write(generation, &path);
        result
    }
}

impl PersistenceStrategy for JsonStrategy {
    fn load_images(&mut self) -> LoadOutcome<Image> {
        if !self.images_path.exists() {
            return LoadOutcome::failed(Error::PathNotFound(self.images_path.clone()));
        }
        if !self.images_path.is_dir() {
            return LoadOutcome::failed(Error::PathNotADirectory(self.images_path.clone()));
        }

        let files = match scan::list_files(&self.images_path, &IMAGE_EXTENSIONS) {
            Ok(files) => files,
            Err(e) => {
                return LoadOutcome::failed(Error::malformed(&self.images_path, e));
            }
        };
        let separate_segmentations = matches!(
            &self.segmentation_images_path,
            Some(dir) if dir != &self.images_path
        );
        let image_files: Vec<String> = files
            .into_iter()
            .filter(|name| separate_segmentations || !self.is_segmentation_name(name))
            .collect();

        let mut outcome = LoadOutcome::default();
        if image_files.is_empty() {
            outcome.errors.push(Error::NoImagesFound(self.images_path.clone()));
            return outcome;
        }

        let segmentations = self.find_segmentation_images(&mut outcome);
        if separate_segmentations && segmentations.len() != image_files.len() {
            outcome.errors.push(Error::SegmentationMismatch {
                images: image_files.len(),
                segmentations: segmentations.len(),
            });
        }

        let camera_info = match self.read_camera_info() {
            Ok(info) => info,
            Err(e) => {
                outcome.errors.push(e);
                return outcome;
            }
        };

        for name in image_files {
            let Some(info) = camera_info.get(&name) else {
                outcome.invalid.push(InvalidEntity {
                    name,
                    reason: format!("no camera parameters in {CAMERA_INFO_FILE}"),
                });
                continue;
            };
            match self.image_from_camera_info(&name, info) {
                Ok(mut image) => {
                    image.segmentation_path = segmentations.get(&stem(&name)).cloned();
                    outcome.items.push(image);
                }
                Err(reason) => outcome.invalid.push(InvalidEntity { name, reason }),
            }
        }

        info!(
            loaded = outcome.items.len(),
            invalid = outcome.invalid.len(),
            path = %self.images_path.display(),
            "loaded images"
        );
        outcome
    }

    fn load_object_models(&mut self) -> LoadOutcome<ObjectModel> {
        if !self.object_models_path.exists() {
            return LoadOutcome::failed(Error::PathNotFound(self.object_models_path.clone()));
        }
        if !self.object_models_path.is_dir() {
            return LoadOutcome::failed(Error::PathNotADirectory(self.object_models_path.clone()));
        }

        let items: Vec<ObjectModel> = scan::find_object_models(&self.object_models_path)
            .into_iter()
            .map(|file| ObjectModel {
                id: file.relative,
                relative_path: file.file_name,
                base_path: file.directory,
            })
            .collect();

        info!(
            loaded = items.len(),
            path = %self.object_models_path.display(),
            "loaded object models"
        );
        LoadOutcome {
            items,
            ..LoadOutcome::default()
        }
    }

    fn load_poses(
        &mut self,
        images: &[Arc<Image>],
        object_models: &[Arc<ObjectModel>],
    ) -> LoadOutcome<Pose> {
        let mut document = match self.read_poses_document() {
            Ok(document) => document,
            Err(e) => {
                self.document_ids.clear();
                return LoadOutcome::failed(e);
            }
        };

        let image_map: HashMap<&str, &Arc<Image>> = images
            .iter()
            .map(|image| (image.relative_path.as_str(), image))
            .collect();
        let mut model_map: HashMap<&str, &Arc<ObjectModel>> = HashMap::new();
        for model in object_models {
            model_map.entry(model.relative_path.as_str()).or_insert(model);
        }

        // IDs already present anywhere in the document, so synthesized ones
        // never collide with them
        let mut taken = ids_in(&document);

        let mut outcome = LoadOutcome::default();
        let mut loaded_ids = HashSet::new();
        let mut unresolved = 0usize;
        let mut dirty = false;

        for (image_path, entries) in document.iter_mut() {
            let Some(entries) = entries.as_array_mut() else {
                outcome.invalid.push(InvalidEntity {
                    name: image_path.clone(),
                    reason: "expected an array of pose entries".to_string(),
                });
                continue;
            };

            for (index, raw) in entries.iter_mut().enumerate() {
                let name = format!("{image_path}[{index}]");
                let entry = match parse_entry(raw) {
                    Ok(entry) => entry,
                    Err(reason) => {
                        outcome.invalid.push(InvalidEntity { name, reason });
                        continue;
                    }
                };

                let (Some(image), Some(model)) = (
                    image_map.get(image_path.as_str()),
                    model_map.get(entry.obj.as_str()),
                ) else {
                    unresolved += 1;
                    continue;
                };

                let id = match entry.id {
                    Some(id) => id,
                    None => {
                        let id = derive_pose_id(image, model, |candidate| taken.contains(candidate));
                        taken.insert(id.clone());
                        if let Some(object) = raw.as_object_mut() {
                            object.insert("id".to_string(), Value::String(id.clone()));
                            dirty = true;
                        }
                        id
                    }
                };

                if !loaded_ids.insert(id.clone()) {
                    outcome.invalid.push(InvalidEntity {
                        name,
                        reason: format!("duplicate pose id {id}"),
                    });
                    continue;
                }

                outcome.items.push(Pose::new(
                    id,
                    Vector3::from(entry.translation),
                    math::matrix_from_row_major(&entry.rotation),
                    Arc::clone(image),
                    Arc::clone(model),
                ));
            }
        }

        self.document_ids = taken;

        if dirty {
            debug!(path = %self.poses_file_path.display(), "writing back synthesized pose ids");
            if let Err(e) = self.write_poses_document(&document) {
                warn!(error = %e, "failed to write back synthesized pose ids");
                outcome.errors.push(Error::persistence("<synthesized ids>", e));
            }
        }

        info!(
            loaded = outcome.items.len(),
            invalid = outcome.invalid.len(),
            unresolved,
            "loaded poses"
        );
        outcome
    }

    fn persist_pose(&mut self, pose: &Pose, mode: PersistMode) -> Result<()> {
        let mut document = self
            .read_poses_document()
            .map_err(|e| Error::persistence(pose.id(), e))?;
        let image_key = pose.image().relative_path.clone();

        let stored = find_stored_entry(&document, &image_key, pose);

        match mode {
            PersistMode::Store => match stored {
                Some(index) => {
                    // Keep any extra fields an external tool stored alongside
                    if let Some(entry) = document
                        .get_mut(&image_key)
                        .and_then(|entries| entries.get_mut(index))
                        .and_then(Value::as_object_mut)
                    {
                        write_pose_fields(entry, pose);
                    }
                }
                None => {
                    if ids_in(&document).contains(pose.id()) {
                        return Err(Error::persistence(
                            pose.id(),
                            "the id belongs to another stored pose entry",
                        ));
                    }
                    let entries = document
                        .entry(image_key.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    let Some(entries) = entries.as_array_mut() else {
                        return Err(Error::persistence(
                            pose.id(),
                            format!("entries for {image_key} are not an array"),
                        ));
                    };
                    let mut entry = Map::new();
                    write_pose_fields(&mut entry, pose);
                    entries.push(Value::Object(entry));
                }
            },
            PersistMode::Delete => {
                if let (Some(index), Some(Value::Array(entries))) = (stored, document.get_mut(&image_key)) {
                    entries.remove(index);
                    if entries.is_empty() {
                        document.remove(&image_key);
                    }
                }
            }
        }

        self.write_poses_document(&document).map_err(|e| {
            warn!(id = pose.id(), error = %e, "failed to write poses file");
            Error::persistence(pose.id(), e)
        })?;
        self.document_ids = ids_in(&document);
        Ok(())
    }

    fn is_id_taken(&self, id: &str) -> bool {
        self.document_ids.contains(id)
    }

    fn poll_changes(&mut self) -> DataKinds {
        self.watcher.poll()
    }
}

/// Parse and check one raw pose entry
fn parse_entry(raw: &Value) -> std::result::Result<PoseEntry, String> {
    let entry: PoseEntry = serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;
    if !math::is_finite_matrix(&entry.rotation) || !math::is_finite_matrix(&entry.translation) {
        return Err("pose contains non-finite values".to_string());
    }
    if !math::is_rotation_matrix(&math::matrix_from_row_major(&entry.rotation)) {
        return Err("R is not a rotation matrix".to_string());
    }
    Ok(entry)
}

fn ids_in(document: &Map<String, Value>) -> HashSet<String> {
    document
        .values()
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|entry| entry.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Position of the entry under `image_key` that a load turns into `pose`:
/// the first valid one with the same id and object model
fn find_stored_entry(document: &Map<String, Value>, image_key: &str, pose: &Pose) -> Option<usize> {
    let model = pose.object_model().relative_path.as_str();
    document.get(image_key)?.as_array()?.iter().position(|raw| {
        raw.get("id").and_then(Value::as_str) == Some(pose.id())
            && raw.get("obj").and_then(Value::as_str) == Some(model)
            && parse_entry(raw).is_ok()
    })
}

fn write_pose_fields(entry: &mut Map<String, Value>, pose: &Pose) {
    let position = pose.position();
    entry.insert("id".to_string(), Value::from(pose.id()));
    entry.insert(
        "obj".to_string(),
        Value::from(pose.object_model().relative_path.as_str()),
    );
    entry.insert(
        "R".to_string(),
        Value::from(math::matrix_to_row_major(&pose.rotation_matrix()).to_vec()),
    );
    entry.insert(
        "t".to_string(),
        Value::from(vec![position.x, position.y, position.z]),
    );
}

fn require_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::PathNotFound(path.to_path_buf()));
    }
    if !path.is_dir() {
        return Err(Error::PathNotADirectory(path.to_path_buf()));
    }
    Ok(())
}

fn stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string())
}
