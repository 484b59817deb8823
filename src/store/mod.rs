/// Persistence layer
///
/// This module translates between the on-disk representation and the entity
/// model:
/// - The strategy interface the model manager talks to (this file)
/// - The JSON-backed strategy (json.rs)
/// - Directory scanning and natural ordering (scan.rs)
/// - Polling change detection (watch.rs)
pub mod json;
pub mod scan;
pub mod watch;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::state::data::{Image, ObjectModel, Pose};
use crate::state::events::DataKinds;

pub use json::JsonStrategy;

/// An entity that was skipped during a load because its data was invalid
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidEntity {
    /// Image file name, or `<image path>[<index>]` for pose entries
    pub name: String,
    pub reason: String,
}

/// Everything a load pass produced
///
/// Loads never fail as a whole: hard problems (missing path, unreadable
/// document) land in `errors` with whatever could still be read, and
/// per-entity problems land in `invalid`.
#[derive(Debug)]
pub struct LoadOutcome<T> {
    pub items: Vec<T>,
    pub invalid: Vec<InvalidEntity>,
    pub errors: Vec<Error>,
}

impl<T> Default for LoadOutcome<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            invalid: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> LoadOutcome<T> {
    pub fn failed(error: Error) -> Self {
        Self {
            errors: vec![error],
            ..Self::default()
        }
    }
}

/// Whether a persist call stores or removes the pose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    Store,
    Delete,
}

/// Storage backend used by the model manager
///
/// Implementations decide how images, object models and poses are stored;
/// the manager only relies on these operations.
pub trait PersistenceStrategy: Send {
    fn load_images(&mut self) -> LoadOutcome<Image>;

    fn load_object_models(&mut self) -> LoadOutcome<ObjectModel>;

    /// Load poses, resolving their references against the given entities.
    /// Entries whose image or object model is not among them are skipped.
    fn load_poses(
        &mut self,
        images: &[Arc<Image>],
        object_models: &[Arc<ObjectModel>],
    ) -> LoadOutcome<Pose>;

    /// Store (create or update) or delete one pose. Either the stored data
    /// reflects the call afterwards or an error is returned and it is
    /// unchanged.
    fn persist_pose(&mut self, pose: &Pose, mode: PersistMode) -> Result<()>;

    /// Whether stored data already uses `id`, including entries the last
    /// load skipped. New pose ids are derived around these.
    fn is_id_taken(&self, _id: &str) -> bool {
        false
    }

    /// Report data that changed outside of this strategy since the last call
    fn poll_changes(&mut self) -> DataKinds {
        DataKinds::NONE
    }
}
