#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cgmath::{Matrix3, SquareMatrix, Vector3};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use pose_editor::{
    Error, Image, LoadOutcome, ObjectModel, PersistMode, PersistenceStrategy, Pose, Result, Settings,
};

/// Row-major intrinsics shared by every fixture image
pub const K: [f64; 9] = [800.0, 0.0, 320.0, 0.0, 800.0, 240.0, 0.0, 0.0, 1.0];

/// A dataset directory in the default layout
pub struct Dataset {
    pub dir: TempDir,
    pub settings: Settings,
}

impl Dataset {
    pub fn new(images: &[&str], models: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::for_dataset(dir.path());
        fs::create_dir(&settings.images_path).unwrap();
        fs::create_dir(&settings.object_models_path).unwrap();
        fs::write(&settings.poses_file_path, "{}").unwrap();

        let mut info = Map::new();
        for name in images {
            fs::write(settings.images_path.join(name), b"png").unwrap();
            info.insert(name.to_string(), json!({ "K": K }));
        }
        write_json(&settings.images_path.join("info.json"), &Value::Object(info));

        for (directory, file) in models {
            let path = settings.object_models_path.join(directory);
            fs::create_dir_all(&path).unwrap();
            fs::write(path.join(file), b"ply").unwrap();
        }

        Self { dir, settings }
    }

    pub fn write_poses(&self, document: &Value) {
        write_json(&self.settings.poses_file_path, document);
    }

    pub fn read_poses(&self) -> Value {
        serde_json::from_str(&fs::read_to_string(&self.settings.poses_file_path).unwrap()).unwrap()
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

pub fn write_json(path: &Path, value: &Value) {
    fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

pub fn identity() -> Matrix3<f64> {
    Matrix3::identity()
}

pub fn assert_matrix_close(actual: &Matrix3<f64>, expected: &Matrix3<f64>, tolerance: f64) {
    let actual = pose_editor::math::matrix_to_row_major(actual);
    let expected = pose_editor::math::matrix_to_row_major(expected);
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!((a - e).abs() < tolerance, "{actual:?} != {expected:?}");
    }
}

pub fn assert_vector_close(actual: Vector3<f64>, expected: Vector3<f64>, tolerance: f64) {
    for (a, e) in [actual.x, actual.y, actual.z].iter().zip([expected.x, expected.y, expected.z].iter()) {
        assert!((a - e).abs() < tolerance, "{actual:?} != {expected:?}");
    }
}

#[derive(Debug, Clone)]
pub struct StoredPose {
    pub id: String,
    pub image: String,
    pub object_model: String,
    pub position: Vector3<f64>,
    pub rotation: Matrix3<f64>,
}

/// Contents of a [`MemoryStrategy`], shared with the test
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub images: Vec<Image>,
    pub object_models: Vec<ObjectModel>,
    pub poses: Vec<StoredPose>,
    /// Every persist call fails while set
    pub fail_writes: bool,
    pub writes: usize,
}

/// In-memory persistence whose writes can be made to fail
#[derive(Clone, Default)]
pub struct MemoryStrategy {
    pub store: Arc<Mutex<MemoryStore>>,
}

impl MemoryStrategy {
    pub fn with_entities(images: &[&str], object_models: &[&str]) -> Self {
        let strategy = Self::default();
        {
            let mut store = strategy.store.lock().unwrap();
            store.images = images.iter().map(|name| image(name)).collect();
            store.object_models = object_models.iter().map(|name| object_model(name)).collect();
        }
        strategy
    }

    pub fn fail_writes(&self, fail: bool) {
        self.store.lock().unwrap().fail_writes = fail;
    }

    pub fn stored_ids(&self) -> Vec<String> {
        self.store.lock().unwrap().poses.iter().map(|p| p.id.clone()).collect()
    }
}

pub fn image(name: &str) -> Image {
    Image {
        id: name.to_string(),
        relative_path: name.to_string(),
        segmentation_path: None,
        base_path: PathBuf::from("/memory/images"),
        camera_matrix: pose_editor::math::matrix_from_row_major(&K),
        near_plane: 50.0,
        far_plane: 2000.0,
    }
}

pub fn object_model(name: &str) -> ObjectModel {
    ObjectModel {
        id: name.to_string(),
        relative_path: name.to_string(),
        base_path: PathBuf::from("/memory/models"),
    }
}

impl PersistenceStrategy for MemoryStrategy {
    fn load_images(&mut self) -> LoadOutcome<Image> {
        LoadOutcome {
            items: self.store.lock().unwrap().images.clone(),
            ..LoadOutcome::default()
        }
    }

    fn load_object_models(&mut self) -> LoadOutcome<ObjectModel> {
        LoadOutcome {
            items: self.store.lock().unwrap().object_models.clone(),
            ..LoadOutcome::default()
        }
    }

    fn load_poses(&mut self, images: &[Arc<Image>], object_models: &[Arc<ObjectModel>]) -> LoadOutcome<Pose> {
        let store = self.store.lock().unwrap();
        let items = store
            .poses
            .iter()
            .filter_map(|stored| {
                let image = images.iter().find(|i| i.id == stored.image)?;
                let model = object_models.iter().find(|m| m.id == stored.object_model)?;
                Some(Pose::new(
                    stored.id.clone(),
                    stored.position,
                    stored.rotation,
                    image.clone(),
                    model.clone(),
                ))
            })
            .collect();
        LoadOutcome {
            items,
            ..LoadOutcome::default()
        }
    }

    fn persist_pose(&mut self, pose: &Pose, mode: PersistMode) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        if store.fail_writes {
            return Err(Error::PersistenceFailed {
                id: pose.id().to_string(),
                reason: "writes are disabled".into(),
            });
        }
        store.writes += 1;
        store.poses.retain(|stored| stored.id != pose.id());
        if mode == PersistMode::Store {
            store.poses.push(StoredPose {
                id: pose.id().to_string(),
                image: pose.image().id.clone(),
                object_model: pose.object_model().id.clone(),
                position: pose.position(),
                rotation: pose.rotation_matrix(),
            });
        }
        Ok(())
    }
}
