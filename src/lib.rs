//! Headless core of a 6-DoF pose annotation tool.
//!
//! A [`ModelManager`] caches the images, object models and poses of a
//! dataset and keeps them in sync with a [`PersistenceStrategy`]; the
//! [`CorrespondenceCollector`] turns clicked 2D-3D point pairs into new poses.

pub mod config;
pub mod error;
pub mod math;
pub mod recover;
pub mod state;
pub mod store;

pub use config::Settings;
pub use error::{Error, ErrorKind, Result};
pub use recover::{CollectorEvent, CollectorState, CorrespondenceCollector};
pub use state::data::{Image, ObjectModel, Pose};
pub use state::events::{DataKinds, ManagerEvent, ManagerState};
pub use state::library::ModelManager;
pub use state::worker::{ManagerHandle, Snapshot};
pub use store::{InvalidEntity, JsonStrategy, LoadOutcome, PersistMode, PersistenceStrategy};
