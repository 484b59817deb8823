use std::sync::Arc;

use cgmath::{Point2, Point3, Vector3};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::pnp::solve_pnp;
use crate::config::MIN_CORRESPONDENCES;
use crate::error::{Error, Result};
use crate::math;
use crate::state::data::{Image, ObjectModel};
use crate::state::library::ModelManager;

const EVENT_CAPACITY: usize = 64;

/// Where the collector is in gathering 2D-3D correspondences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Empty,
    AwaitingMoreCorrespondences,
    /// The 3D list is one ahead of the 2D list
    Missing2DPoint,
    /// The 2D list is one ahead of the 3D list
    Missing3DPoint,
    ReadyForPoseRecovery,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollectorEvent {
    StateChanged(CollectorState),
    /// A point was added or the lists were cleared
    CorrespondencesChanged,
    PoseRecovered { id: String },
    /// Collection was reset before a pose was recovered
    Aborted,
}

/// Collects clicked 2D image points and 3D model points for one image and
/// object model, and recovers a pose from them once enough pairs exist.
///
/// The i-th 2D point corresponds to the i-th 3D point.
pub struct CorrespondenceCollector {
    image: Option<Arc<Image>>,
    object_model: Option<Arc<ObjectModel>>,
    points_2d: Vec<Point2<f64>>,
    points_3d: Vec<Point3<f64>>,
    minimum_points: usize,
    state: CollectorState,
    events: broadcast::Sender<CollectorEvent>,
}

impl Default for CorrespondenceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrespondenceCollector {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            image: None,
            object_model: None,
            points_2d: Vec::new(),
            points_3d: Vec::new(),
            minimum_points: MIN_CORRESPONDENCES,
            state: CollectorState::Empty,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectorEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn minimum_points(&self) -> usize {
        self.minimum_points
    }

    /// Change how many pairs are needed before a pose can be recovered.
    /// Values below four are rejected.
    pub fn set_minimum_points(&mut self, minimum_points: usize) -> Result<()> {
        if minimum_points < MIN_CORRESPONDENCES {
            return Err(Error::InvalidState(format!(
                "at least {MIN_CORRESPONDENCES} correspondences are required, got {minimum_points}"
            )));
        }
        self.minimum_points = minimum_points;
        if !self.points_2d.is_empty() && self.points_2d.len() == self.points_3d.len() {
            self.set_state(self.paired_state());
        }
        Ok(())
    }

    /// Select the image points are clicked on.
    ///
    /// Switching to a different image discards all points. Passing a newer
    /// snapshot of the same image (e.g. after a reload) keeps them.
    pub fn set_image(&mut self, image: Option<Arc<Image>>) {
        let changed = self.image.as_ref().map(|i| &i.id) != image.as_ref().map(|i| &i.id);
        self.image = image;
        if changed {
            self.clear_points();
        }
    }

    pub fn set_object_model(&mut self, object_model: Option<Arc<ObjectModel>>) {
        let changed =
            self.object_model.as_ref().map(|m| &m.id) != object_model.as_ref().map(|m| &m.id);
        self.object_model = object_model;
        if changed {
            self.clear_points();
        }
    }

    pub fn image(&self) -> Option<&Arc<Image>> {
        self.image.as_ref()
    }

    pub fn object_model(&self) -> Option<&Arc<ObjectModel>> {
        self.object_model.as_ref()
    }

    pub fn is_image_set(&self) -> bool {
        self.image.is_some()
    }

    pub fn is_object_model_set(&self) -> bool {
        self.object_model.is_some()
    }

    pub fn points_2d(&self) -> &[Point2<f64>] {
        &self.points_2d
    }

    pub fn points_3d(&self) -> &[Point3<f64>] {
        &self.points_3d
    }

    /// Number of complete 2D-3D pairs
    pub fn complete_correspondences(&self) -> usize {
        self.points_2d.len().min(self.points_3d.len())
    }

    /// Add a point clicked on the image (pixel coordinates)
    pub fn add_2d_point(&mut self, point: Point2<f64>) -> Result<()> {
        if self.image.is_none() {
            return Err(Error::InvalidState("no image selected".into()));
        }
        self.points_2d.push(point);
        if self.points_2d.len() > self.points_3d.len() + 1 {
            // The previous unmatched click is replaced by this one
            let replaced = self.points_2d.len() - 2;
            self.points_2d.remove(replaced);
        }
        self.after_point_added();
        Ok(())
    }

    /// Add a point picked on the object model (model coordinates)
    pub fn add_3d_point(&mut self, point: Point3<f64>) -> Result<()> {
        if self.image.is_none() {
            return Err(Error::InvalidState("no image selected".into()));
        }
        if self.object_model.is_none() {
            return Err(Error::InvalidState("no object model selected".into()));
        }
        self.points_3d.push(point);
        if self.points_3d.len() > self.points_2d.len() + 1 {
            let replaced = self.points_3d.len() - 2;
            self.points_3d.remove(replaced);
        }
        self.after_point_added();
        Ok(())
    }

    /// Solve for the pose from the collected pairs and add it to `manager`.
    ///
    /// Only valid in [`CollectorState::ReadyForPoseRecovery`]; otherwise the
    /// points are left untouched. Once a solve was attempted the points, the
    /// image and the object model are cleared whatever the outcome, and a
    /// pose that was solved but could not be stored is still an error.
    pub fn recover_pose(&mut self, manager: &mut ModelManager) -> Result<String> {
        if self.state != CollectorState::ReadyForPoseRecovery {
            return Err(Error::InvalidState(format!(
                "cannot recover a pose while {:?}",
                self.state
            )));
        }
        let (Some(image), Some(object_model)) = (self.image.clone(), self.object_model.clone()) else {
            return Err(Error::InvalidState("image and object model must be selected".into()));
        };

        let pairs = self.complete_correspondences();
        let image_points: Vec<nalgebra::Point2<f64>> = self.points_2d[..pairs]
            .iter()
            .map(|p| nalgebra::Point2::new(p.x, p.y))
            .collect();
        let model_points: Vec<nalgebra::Point3<f64>> = self.points_3d[..pairs]
            .iter()
            .map(|p| nalgebra::Point3::new(p.x, p.y, p.z))
            .collect();
        let camera_matrix =
            nalgebra::Matrix3::from_row_slice(&math::matrix_to_row_major(&image.camera_matrix));

        let solution = solve_pnp(&model_points, &image_points, &camera_matrix);

        self.image = None;
        self.object_model = None;
        self.clear_points();

        let solution = solution.map_err(|e| {
            warn!(image = %image.id, error = %e, "pose recovery failed");
            Error::from(e)
        })?;

        let rotation = math::rotation_vector_to_matrix(Vector3::new(
            solution.rotation.x,
            solution.rotation.y,
            solution.rotation.z,
        ));
        let position = Vector3::new(
            solution.translation.x,
            solution.translation.y,
            solution.translation.z,
        );

        let id = manager.add_pose(&image, &object_model, position, rotation)?;
        info!(
            id = %id,
            pairs,
            reprojection_error = solution.reprojection_error,
            "recovered pose"
        );
        self.emit(CollectorEvent::PoseRecovered { id: id.clone() });
        Ok(id)
    }

    /// Drop the image, the object model and all points
    pub fn reset(&mut self) {
        self.image = None;
        self.object_model = None;
        self.clear_points();
        self.emit(CollectorEvent::Aborted);
    }

    fn after_point_added(&mut self) {
        let state = match self.points_2d.len().cmp(&self.points_3d.len()) {
            std::cmp::Ordering::Equal => self.paired_state(),
            std::cmp::Ordering::Greater => CollectorState::Missing3DPoint,
            std::cmp::Ordering::Less => CollectorState::Missing2DPoint,
        };
        self.emit(CollectorEvent::CorrespondencesChanged);
        self.set_state(state);
    }

    /// State when both lists have the same length
    fn paired_state(&self) -> CollectorState {
        if self.points_3d.is_empty() {
            CollectorState::Empty
        } else if self.points_3d.len() >= self.minimum_points {
            CollectorState::ReadyForPoseRecovery
        } else {
            CollectorState::AwaitingMoreCorrespondences
        }
    }

    fn clear_points(&mut self) {
        let had_points = !self.points_2d.is_empty() || !self.points_3d.is_empty();
        self.points_2d.clear();
        self.points_3d.clear();
        if had_points {
            self.emit(CollectorEvent::CorrespondencesChanged);
        }
        self.set_state(CollectorState::Empty);
    }

    fn set_state(&mut self, state: CollectorState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "correspondence state changed");
            self.state = state;
            self.emit(CollectorEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: CollectorEvent) {
        let _ = self.events.send(event);
    }
}
