use std::path::{Path, PathBuf};
use std::time::Duration;

use cgmath::{Point2, Point3};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pose_editor::{
    CorrespondenceCollector, Error, JsonStrategy, ManagerEvent, ManagerHandle, ModelManager, Result,
    Settings, Snapshot,
};

/// Headless front-end for a 6D pose annotation dataset.
#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect, watch and annotate 6D pose datasets")]
struct Args {
    /// Settings file (TOML). Defaults to the user config directory.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Dataset root with the default layout (images/, models/, poses.json).
    /// Overrides the paths from the settings file.
    #[arg(long)]
    dataset: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load the dataset and print what was found
    Summary,
    /// Reload whenever the dataset changes on disk
    Watch {
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Recover a pose from a file of 2D-3D correspondences and store it
    Recover {
        /// Image id (file name)
        #[arg(long)]
        image: String,
        /// Object model id (path relative to the models directory)
        #[arg(long)]
        model: String,
        /// JSON array of {"image": [u, v], "model": [x, y, z]} pairs
        #[arg(long)]
        points: PathBuf,
    },
}

/// One clicked correspondence as stored in a points file
#[derive(Debug, Clone, Deserialize)]
struct Correspondence {
    image: [f64; 2],
    model: [f64; 3],
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = try_main(Args::parse()).await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn try_main(args: Args) -> Result<()> {
    let settings = resolve_settings(args.settings.as_deref(), args.dataset.as_deref())?;
    let minimum_points = settings.minimum_points;

    let manager = ModelManager::new(Box::new(JsonStrategy::new(&settings)));
    let (handle, worker) = ManagerHandle::spawn(manager);
    spawn_event_logger(&handle).await?;

    let snapshot = handle.reload().await?;

    match args.command {
        Command::Summary => print_summary(&snapshot),
        Command::Watch { interval_ms } => watch(&handle, Duration::from_millis(interval_ms)).await?,
        Command::Recover { image, model, points } => {
            let pairs = load_correspondences(&points)?;
            let id = handle
                .run(move |manager| recover(manager, &image, &model, &pairs, minimum_points))
                .await??;
            println!("Stored pose {id}");
        }
    }

    drop(handle);
    if let Err(e) = worker.await {
        warn!("model manager task ended abnormally: {e}");
    }
    Ok(())
}

fn resolve_settings(path: Option<&Path>, dataset: Option<&Path>) -> Result<Settings> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Settings::default_path()?,
    };
    let mut settings = Settings::load(&path)?;

    if let Some(root) = dataset {
        let layout = Settings::for_dataset(root);
        settings.images_path = layout.images_path;
        settings.object_models_path = layout.object_models_path;
        settings.poses_file_path = layout.poses_file_path;
    }
    info!(
        images = %settings.images_path.display(),
        models = %settings.object_models_path.display(),
        poses = %settings.poses_file_path.display(),
        "using dataset"
    );
    Ok(settings)
}

/// Log every manager event in the background
async fn spawn_event_logger(handle: &ManagerHandle) -> Result<()> {
    let mut events = handle.subscribe().await?;
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ManagerEvent::Error { kind, message } => warn!(?kind, "{message}"),
                other => info!(event = ?other, "manager event"),
            }
        }
    });
    Ok(())
}

fn print_summary(snapshot: &Snapshot) {
    println!("State:         {:?}", snapshot.state);
    println!("Images:        {}", snapshot.images.len());
    println!("Object models: {}", snapshot.object_models.len());
    println!("Poses:         {}", snapshot.poses.len());

    for invalid in snapshot.invalid_images.iter().chain(&snapshot.invalid_poses) {
        println!("  invalid {}: {}", invalid.name, invalid.reason);
    }
    for model in &snapshot.object_models {
        let poses = snapshot
            .poses
            .iter()
            .filter(|pose| pose.object_model().id == model.id)
            .count();
        println!("  {} ({} poses)", model.id, poses);
    }
}

async fn watch(handle: &ManagerHandle, interval: Duration) -> Result<()> {
    info!(interval_ms = interval.as_millis() as u64, "watching for changes");
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let changed = handle.poll_changes().await?;
        if !changed.is_empty() {
            let snapshot = handle.snapshot().await?;
            println!(
                "Reloaded {changed}: {} images, {} object models, {} poses",
                snapshot.images.len(),
                snapshot.object_models.len(),
                snapshot.poses.len()
            );
        }
    }
}

fn load_correspondences(path: &Path) -> Result<Vec<Correspondence>> {
    let malformed = |reason: String| Error::MalformedDocument {
        path: path.to_path_buf(),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| malformed(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| malformed(e.to_string()))
}

fn recover(
    manager: &mut ModelManager,
    image_id: &str,
    model_id: &str,
    pairs: &[Correspondence],
    minimum_points: usize,
) -> Result<String> {
    let image = manager
        .image_by_id(image_id)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("image {image_id}")))?;
    let model = manager
        .object_model_by_id(model_id)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("object model {model_id}")))?;

    let mut collector = CorrespondenceCollector::new();
    collector.set_minimum_points(minimum_points)?;
    collector.set_image(Some(image));
    collector.set_object_model(Some(model));
    for pair in pairs {
        collector.add_2d_point(Point2::new(pair.image[0], pair.image[1]))?;
        collector.add_3d_point(Point3::new(pair.model[0], pair.model[1], pair.model[2]))?;
    }
    collector.recover_pose(manager)
}
