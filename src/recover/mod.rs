/// Pose recovery module
///
/// This module turns clicked correspondences into poses:
/// - Collecting 2D-3D point pairs for one image and object model (collector.rs)
/// - Solving the perspective-n-point problem (pnp.rs)

pub mod collector;
pub mod pnp;

pub use collector::{CollectorEvent, CollectorState, CorrespondenceCollector};
pub use pnp::{solve_pnp, PnpError, PnpSolution};
