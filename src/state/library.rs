use std::collections::HashMap;
use std::sync::Arc;

use cgmath::{Matrix3, Vector3};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::data::{derive_pose_id, Image, ObjectModel, Pose};
use super::events::{DataKinds, ManagerEvent, ManagerState};
use crate::error::{Error, Result};
use crate::math;
use crate::store::{InvalidEntity, LoadOutcome, PersistMode, PersistenceStrategy};

/// Capacity of the event channel; slow subscribers see `Lagged` past this
const EVENT_CAPACITY: usize = 256;

/// The ModelManager caches every image, object model and pose of a dataset.
/// It owns the persistence strategy and is the only component that mutates
/// stored poses, so the cache and the store never diverge.
pub struct ModelManager {
    strategy: Box<dyn PersistenceStrategy>,
    images: Vec<Arc<Image>>,
    object_models: Vec<Arc<ObjectModel>>,
    poses: Vec<Pose>,
    /// Pose id -> position in `poses`
    pose_index: HashMap<String, usize>,
    /// Image id -> positions in `poses`
    poses_by_image: HashMap<String, Vec<usize>>,
    /// Object model id -> positions in `poses`
    poses_by_object_model: HashMap<String, Vec<usize>>,
    invalid_images: Vec<InvalidEntity>,
    invalid_poses: Vec<InvalidEntity>,
    state: ManagerState,
    events: broadcast::Sender<ManagerEvent>,
}

impl ModelManager {
    /// Create an empty manager; call [`ModelManager::reload`] to fill it.
    pub fn new(strategy: Box<dyn PersistenceStrategy>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            strategy,
            images: Vec::new(),
            object_models: Vec::new(),
            poses: Vec::new(),
            pose_index: HashMap::new(),
            poses_by_image: HashMap::new(),
            poses_by_object_model: HashMap::new(),
            invalid_images: Vec::new(),
            invalid_poses: Vec::new(),
            state: ManagerState::Loading,
            events,
        }
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// Reload everything from the persistence strategy.
    ///
    /// Poses are resolved against the freshly loaded images and object
    /// models, so those are loaded first. The collections are swapped in one
    /// step, then one `DataChanged` event per collection is published in the
    /// order images, object models, poses.
    pub fn reload(&mut self) {
        self.set_state(ManagerState::Loading);
        let mut errors = Vec::new();

        let images = self.strategy.load_images();
        self.invalid_images = images.invalid.clone();
        let images = collect_items(images, &mut errors);

        let object_models = self.strategy.load_object_models();
        let object_models = collect_items(object_models, &mut errors);

        let poses = self.strategy.load_poses(&images, &object_models);
        self.invalid_poses = poses.invalid.clone();
        let poses = poses_from(poses, &mut errors);

        self.images = images;
        self.object_models = object_models;
        self.poses = poses;
        self.rebuild_indices();

        info!(
            images = self.images.len(),
            object_models = self.object_models.len(),
            poses = self.poses.len(),
            "reloaded dataset"
        );

        self.report_errors(&errors);
        self.emit(ManagerEvent::DataChanged(DataKinds::IMAGES));
        self.emit(ManagerEvent::DataChanged(DataKinds::OBJECT_MODELS));
        self.emit(ManagerEvent::DataChanged(DataKinds::POSES));
        self.finish_load(&errors);
    }

    /// Reload only the collections in `kinds`.
    ///
    /// Poses hold references to images and object models, so a change to
    /// either also reloads the poses. A single `DataChanged` event carries
    /// everything that was reloaded.
    pub fn on_data_changed(&mut self, kinds: DataKinds) {
        if kinds.is_empty() {
            return;
        }
        let reloaded = kinds | DataKinds::POSES;
        debug!(kinds = %reloaded, "reloading changed data");
        self.set_state(ManagerState::Loading);
        let mut errors = Vec::new();

        let images = if kinds.contains(DataKinds::IMAGES) {
            let outcome = self.strategy.load_images();
            self.invalid_images = outcome.invalid.clone();
            collect_items(outcome, &mut errors)
        } else {
            self.images.clone()
        };

        let object_models = if kinds.contains(DataKinds::OBJECT_MODELS) {
            collect_items(self.strategy.load_object_models(), &mut errors)
        } else {
            self.object_models.clone()
        };

        let poses = self.strategy.load_poses(&images, &object_models);
        self.invalid_poses = poses.invalid.clone();
        let poses = poses_from(poses, &mut errors);

        self.images = images;
        self.object_models = object_models;
        self.poses = poses;
        self.rebuild_indices();

        self.report_errors(&errors);
        self.emit(ManagerEvent::DataChanged(reloaded));
        self.finish_load(&errors);
    }

    /// Ask the strategy for external modifications and reload what changed.
    /// Returns the kinds that were reloaded.
    pub fn poll_external_changes(&mut self) -> DataKinds {
        let changed = self.strategy.poll_changes();
        if !changed.is_empty() {
            info!(kinds = %changed, "external change detected");
            self.on_data_changed(changed);
        }
        changed
    }

    /// Create a pose placing `object_model` on `image`.
    ///
    /// Both handles must be the exact snapshots this manager holds; stale
    /// handles from before a reload are rejected with `NotFound`. Nothing is
    /// added unless the strategy stored the pose.
    pub fn add_pose(
        &mut self,
        image: &Arc<Image>,
        object_model: &Arc<ObjectModel>,
        position: Vector3<f64>,
        rotation: Matrix3<f64>,
    ) -> Result<String> {
        let image = self
            .images
            .iter()
            .find(|candidate| Arc::ptr_eq(candidate, image))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("image {}", image.id)))?;
        let object_model = self
            .object_models
            .iter()
            .find(|candidate| Arc::ptr_eq(candidate, object_model))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object model {}", object_model.id)))?;

        let id = derive_pose_id(&image, &object_model, |candidate| {
            self.pose_index.contains_key(candidate) || self.strategy.is_id_taken(candidate)
        });
        check_pose_data(&id, position, &rotation)?;
        let pose = Pose::new(id.clone(), position, rotation, image, object_model);

        if let Err(e) = self.strategy.persist_pose(&pose, PersistMode::Store) {
            warn!(id = %id, error = %e, "failed to add pose");
            self.report_errors(std::slice::from_ref(&e));
            return Err(e);
        }

        self.poses.push(pose);
        self.rebuild_indices();
        debug!(id = %id, "pose added");
        self.emit(ManagerEvent::PoseAdded { id: id.clone() });
        Ok(id)
    }

    /// Move and rotate an existing pose; restores the previous values if the
    /// strategy fails to store them.
    pub fn update_pose(&mut self, id: &str, position: Vector3<f64>, rotation: Matrix3<f64>) -> Result<()> {
        let index = self.index_of(id)?;
        check_pose_data(id, position, &rotation)?;

        let pose = &mut self.poses[index];
        let previous_position = pose.position();
        let previous_rotation = pose.rotation();
        pose.set_position(position);
        pose.set_rotation_matrix(&rotation);

        if let Err(e) = self.strategy.persist_pose(&self.poses[index], PersistMode::Store) {
            let pose = &mut self.poses[index];
            pose.set_position(previous_position);
            pose.set_rotation(previous_rotation);
            warn!(id, error = %e, "failed to update pose, previous values restored");
            self.report_errors(std::slice::from_ref(&e));
            return Err(e);
        }

        debug!(id, "pose updated");
        self.emit(ManagerEvent::PoseUpdated { id: id.to_string() });
        Ok(())
    }

    /// Delete a pose from the store, then from the cache
    pub fn remove_pose(&mut self, id: &str) -> Result<()> {
        let index = self.index_of(id)?;

        if let Err(e) = self.strategy.persist_pose(&self.poses[index], PersistMode::Delete) {
            warn!(id, error = %e, "failed to remove pose");
            self.report_errors(std::slice::from_ref(&e));
            return Err(e);
        }

        self.poses.remove(index);
        self.rebuild_indices();
        debug!(id, "pose removed");
        self.emit(ManagerEvent::PoseDeleted { id: id.to_string() });
        Ok(())
    }

    pub fn images(&self) -> &[Arc<Image>] {
        &self.images
    }

    pub fn object_models(&self) -> &[Arc<ObjectModel>] {
        &self.object_models
    }

    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    pub fn pose_by_id(&self, id: &str) -> Option<&Pose> {
        self.pose_index.get(id).map(|&index| &self.poses[index])
    }

    pub fn image_by_id(&self, id: &str) -> Option<&Arc<Image>> {
        self.images.iter().find(|image| image.id == id)
    }

    pub fn object_model_by_id(&self, id: &str) -> Option<&Arc<ObjectModel>> {
        self.object_models.iter().find(|model| model.id == id)
    }

    pub fn poses_for_image(&self, image: &Image) -> Vec<&Pose> {
        self.indexed_poses(self.poses_by_image.get(&image.id))
    }

    pub fn poses_for_object_model(&self, object_model: &ObjectModel) -> Vec<&Pose> {
        self.indexed_poses(self.poses_by_object_model.get(&object_model.id))
    }

    /// Poses of one object model on one image
    pub fn poses_for(&self, image: &Image, object_model: &ObjectModel) -> Vec<&Pose> {
        self.poses_for_image(image)
            .into_iter()
            .filter(|pose| pose.object_model().id == object_model.id)
            .collect()
    }

    /// Images skipped by the last image load because of invalid data
    pub fn invalid_images(&self) -> &[InvalidEntity] {
        &self.invalid_images
    }

    /// Pose entries skipped by the last pose load because of invalid data
    pub fn invalid_poses(&self) -> &[InvalidEntity] {
        &self.invalid_poses
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.pose_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("pose {id}")))
    }

    fn indexed_poses(&self, indices: Option<&Vec<usize>>) -> Vec<&Pose> {
        indices
            .map(|indices| indices.iter().map(|&index| &self.poses[index]).collect())
            .unwrap_or_default()
    }

    fn rebuild_indices(&mut self) {
        self.pose_index.clear();
        self.poses_by_image.clear();
        self.poses_by_object_model.clear();

        for (index, pose) in self.poses.iter().enumerate() {
            self.pose_index.insert(pose.id().to_string(), index);
            self.poses_by_image
                .entry(pose.image().id.clone())
                .or_default()
                .push(index);
            self.poses_by_object_model
                .entry(pose.object_model().id.clone())
                .or_default()
                .push(index);
        }
    }

    fn report_errors(&self, errors: &[Error]) {
        for error in errors {
            warn!(kind = ?error.kind(), "{error}");
            self.emit(ManagerEvent::Error {
                kind: error.kind(),
                message: error.to_string(),
            });
        }
    }

    fn finish_load(&mut self, errors: &[Error]) {
        match errors.first() {
            Some(error) => self.set_state(ManagerState::Error(error.kind())),
            None => self.set_state(ManagerState::Ready),
        }
    }

    fn set_state(&mut self, state: ManagerState) {
        self.state = state;
        self.emit(ManagerEvent::StateChanged(state));
    }

    fn emit(&self, event: ManagerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn check_pose_data(id: &str, position: Vector3<f64>, rotation: &Matrix3<f64>) -> Result<()> {
    let reason = if !math::is_finite_matrix(&[position.x, position.y, position.z]) {
        "position contains non-finite values"
    } else if !math::is_rotation_matrix(rotation) {
        "rotation is not orthonormal with determinant 1"
    } else {
        return Ok(());
    };
    Err(Error::InvalidEntityData {
        entity: format!("pose {id}"),
        reason: reason.to_string(),
    })
}

fn collect_items<T>(outcome: LoadOutcome<T>, errors: &mut Vec<Error>) -> Vec<Arc<T>> {
    errors.extend(outcome.errors);
    outcome.items.into_iter().map(Arc::new).collect()
}

fn poses_from(outcome: LoadOutcome<Pose>, errors: &mut Vec<Error>) -> Vec<Pose> {
    errors.extend(outcome.errors);
    outcome.items
}

// Implement Debug for better error messages
impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("images", &self.images.len())
            .field("object_models", &self.object_models.len())
            .field("poses", &self.poses.len())
            .field("state", &self.state)
            .finish()
    }
}
