/// Entity types shared by the cache, the persistence layer and pose recovery
///
/// Images and object models are immutable once loaded and are handed out as
/// `Arc` snapshots; a reload produces new snapshots, so a stale handle from a
/// previous load simply stops resolving. Poses reference their image and
/// object model through those snapshots.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cgmath::{Matrix3, Quaternion, Vector3};

use crate::math;

/// A photograph with the camera intrinsics it was taken with
#[derive(Debug, Clone)]
pub struct Image {
    /// Stable identifier (the file name; the images directory is flat)
    pub id: String,
    /// Path relative to `base_path` (e.g. "0001.png")
    pub relative_path: String,
    /// Absolute path of the matching segmentation image, if one was found
    pub segmentation_path: Option<PathBuf>,
    /// Directory the image was loaded from
    pub base_path: PathBuf,
    /// 3x3 intrinsic camera matrix
    pub camera_matrix: Matrix3<f64>,
    pub near_plane: f64,
    pub far_plane: f64,
}

impl Image {
    pub fn absolute_path(&self) -> PathBuf {
        self.base_path.join(&self.relative_path)
    }

    /// The segmentation path is stored absolute already
    pub fn absolute_segmentation_path(&self) -> Option<&Path> {
        self.segmentation_path.as_deref()
    }
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.relative_path == other.relative_path
            && self.base_path == other.base_path
            && self.camera_matrix == other.camera_matrix
    }
}

/// A 3D mesh that can be placed onto images
#[derive(Debug, Clone)]
pub struct ObjectModel {
    /// Path relative to the object models root, with '/' separators
    pub id: String,
    /// File name, as referenced by the `obj` field of stored poses
    pub relative_path: String,
    /// Directory containing the mesh file
    pub base_path: PathBuf,
}

impl ObjectModel {
    pub fn absolute_path(&self) -> PathBuf {
        self.base_path.join(&self.relative_path)
    }
}

impl PartialEq for ObjectModel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.relative_path == other.relative_path
    }
}

/// Placement of one object model on one image
#[derive(Debug, Clone)]
pub struct Pose {
    id: String,
    position: Vector3<f64>,
    rotation: Quaternion<f64>,
    image: Arc<Image>,
    object_model: Arc<ObjectModel>,
}

impl Pose {
    pub fn new(
        id: impl Into<String>,
        position: Vector3<f64>,
        rotation: Matrix3<f64>,
        image: Arc<Image>,
        object_model: Arc<ObjectModel>,
    ) -> Self {
        Self {
            id: id.into(),
            position,
            rotation: math::quaternion_from_matrix(&rotation),
            image,
            object_model,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn position(&self) -> Vector3<f64> {
        self.position
    }

    pub fn rotation(&self) -> Quaternion<f64> {
        self.rotation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        math::matrix_from_quaternion(&self.rotation)
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    pub fn object_model(&self) -> &Arc<ObjectModel> {
        &self.object_model
    }

    pub fn set_position(&mut self, position: Vector3<f64>) {
        self.position = position;
    }

    pub fn set_rotation(&mut self, rotation: Quaternion<f64>) {
        self.rotation = rotation;
    }

    pub fn set_rotation_matrix(&mut self, rotation: &Matrix3<f64>) {
        self.rotation = math::quaternion_from_matrix(rotation);
    }
}

/// Poses are the same pose if their IDs match
impl PartialEq for Pose {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Pose {}

/// Derive a pose ID from the image and object model it places
///
/// The base is `<image stem>_<model stem>`; when that is already taken a
/// numeric suffix starting at 2 is appended, so the result is deterministic
/// for a given set of existing IDs.
pub fn derive_pose_id(
    image: &Image,
    object_model: &ObjectModel,
    is_taken: impl Fn(&str) -> bool,
) -> String {
    let base = format!(
        "{}_{}",
        file_stem(&image.relative_path),
        file_stem(&object_model.relative_path)
    );
    if !is_taken(&base) {
        return base;
    }

    let mut counter = 2usize;
    loop {
        let candidate = format!("{base}_{counter}");
        if !is_taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}
