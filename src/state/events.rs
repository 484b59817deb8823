/// Change notifications published by the model manager
///
/// Observers subscribe to a broadcast channel and receive typed events
/// carrying the affected entity's identity or the set of changed data.
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::ErrorKind;

/// Set of data collections, OR-able so one reload can report several
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DataKinds(u8);

impl DataKinds {
    pub const NONE: DataKinds = DataKinds(0);
    pub const IMAGES: DataKinds = DataKinds(1);
    pub const OBJECT_MODELS: DataKinds = DataKinds(2);
    pub const POSES: DataKinds = DataKinds(4);
    pub const ALL: DataKinds = DataKinds(1 | 2 | 4);

    pub fn contains(self, other: DataKinds) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for DataKinds {
    type Output = DataKinds;

    fn bitor(self, rhs: DataKinds) -> DataKinds {
        DataKinds(self.0 | rhs.0)
    }
}

impl BitOrAssign for DataKinds {
    fn bitor_assign(&mut self, rhs: DataKinds) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for DataKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(DataKinds::IMAGES) {
            names.push("images");
        }
        if self.contains(DataKinds::OBJECT_MODELS) {
            names.push("object models");
        }
        if self.contains(DataKinds::POSES) {
            names.push("poses");
        }
        if names.is_empty() {
            write!(f, "nothing")
        } else {
            write!(f, "{}", names.join(", "))
        }
    }
}

/// Lifecycle of the manager's data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Loading,
    Ready,
    Error(ErrorKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    StateChanged(ManagerState),
    /// One event per collection after a full reload, images first
    DataChanged(DataKinds),
    PoseAdded { id: String },
    PoseUpdated { id: String },
    PoseDeleted { id: String },
    Error { kind: ErrorKind, message: String },
}
