/// State management module
///
/// This module holds the data the application owns:
/// - Entity types shared by every layer (data.rs)
/// - Change notifications and manager state (events.rs)
/// - The model manager caching images, object models and poses (library.rs)
/// - Single-owner access to the manager from async code (worker.rs)

pub mod data;
pub mod events;
pub mod library;
pub mod worker;
