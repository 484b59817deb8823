/// Single-owner access to the model manager
///
/// The manager lives on a dedicated blocking task and is driven through a
/// command channel, so every mutation runs to completion before the next
/// command is looked at. Readers get cloned snapshots and never observe a
/// collection mid-rebuild.
use std::sync::Arc;

use cgmath::{Matrix3, Vector3};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{self, JoinHandle};
use tracing::debug;

use super::data::{Image, ObjectModel, Pose};
use super::events::{DataKinds, ManagerEvent, ManagerState};
use super::library::ModelManager;
use crate::error::{Error, Result};
use crate::store::InvalidEntity;

const COMMAND_CAPACITY: usize = 32;

/// Copy of the manager's data at one point in time
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: ManagerState,
    pub images: Vec<Arc<Image>>,
    pub object_models: Vec<Arc<ObjectModel>>,
    pub poses: Vec<Pose>,
    pub invalid_images: Vec<InvalidEntity>,
    pub invalid_poses: Vec<InvalidEntity>,
}

impl Snapshot {
    fn of(manager: &ModelManager) -> Self {
        Self {
            state: manager.state(),
            images: manager.images().to_vec(),
            object_models: manager.object_models().to_vec(),
            poses: manager.poses().to_vec(),
            invalid_images: manager.invalid_images().to_vec(),
            invalid_poses: manager.invalid_poses().to_vec(),
        }
    }
}

type Job = Box<dyn FnOnce(&mut ModelManager) + Send>;

enum Command {
    Reload(oneshot::Sender<Snapshot>),
    Snapshot(oneshot::Sender<Snapshot>),
    Subscribe(oneshot::Sender<broadcast::Receiver<ManagerEvent>>),
    PollChanges(oneshot::Sender<DataKinds>),
    AddPose {
        image: Arc<Image>,
        object_model: Arc<ObjectModel>,
        position: Vector3<f64>,
        rotation: Matrix3<f64>,
        reply: oneshot::Sender<Result<String>>,
    },
    UpdatePose {
        id: String,
        position: Vector3<f64>,
        rotation: Matrix3<f64>,
        reply: oneshot::Sender<Result<()>>,
    },
    RemovePose {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Run(Job),
}

/// Cloneable handle to a manager running on its own task
#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
}

impl ManagerHandle {
    /// Move `manager` onto a blocking task; must be called inside a tokio
    /// runtime. The task ends once every handle has been dropped.
    pub fn spawn(manager: ModelManager) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(COMMAND_CAPACITY);
        let worker = task::spawn_blocking(move || serve(manager, receiver));
        (Self { commands }, worker)
    }

    pub async fn reload(&self) -> Result<Snapshot> {
        self.request(Command::Reload).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(Command::Snapshot).await
    }

    pub async fn subscribe(&self) -> Result<broadcast::Receiver<ManagerEvent>> {
        self.request(Command::Subscribe).await
    }

    /// Reload whatever changed on disk; returns the reloaded kinds
    pub async fn poll_changes(&self) -> Result<DataKinds> {
        self.request(Command::PollChanges).await
    }

    pub async fn add_pose(
        &self,
        image: Arc<Image>,
        object_model: Arc<ObjectModel>,
        position: Vector3<f64>,
        rotation: Matrix3<f64>,
    ) -> Result<String> {
        self.request(|reply| Command::AddPose {
            image,
            object_model,
            position,
            rotation,
            reply,
        })
        .await?
    }

    pub async fn update_pose(&self, id: &str, position: Vector3<f64>, rotation: Matrix3<f64>) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::UpdatePose {
            id,
            position,
            rotation,
            reply,
        })
        .await?
    }

    pub async fn remove_pose(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::RemovePose { id, reply }).await?
    }

    /// Run `f` with exclusive access to the manager, e.g. to recover a pose
    /// with a correspondence collector.
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ModelManager) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.request(|reply| {
            Command::Run(Box::new(move |manager: &mut ModelManager| {
                let _ = reply.send(f(manager));
            }))
        })
        .await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())
    }
}

fn stopped() -> Error {
    Error::InvalidState("model manager task has stopped".into())
}

fn serve(mut manager: ModelManager, mut commands: mpsc::Receiver<Command>) {
    debug!("model manager task started");
    // A dropped reply receiver only means the caller went away
    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Reload(reply) => {
                manager.reload();
                let _ = reply.send(Snapshot::of(&manager));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(Snapshot::of(&manager));
            }
            Command::Subscribe(reply) => {
                let _ = reply.send(manager.subscribe());
            }
            Command::PollChanges(reply) => {
                let _ = reply.send(manager.poll_external_changes());
            }
            Command::AddPose {
                image,
                object_model,
                position,
                rotation,
                reply,
            } => {
                let _ = reply.send(manager.add_pose(&image, &object_model, position, rotation));
            }
            Command::UpdatePose {
                id,
                position,
                rotation,
                reply,
            } => {
                let _ = reply.send(manager.update_pose(&id, position, rotation));
            }
            Command::RemovePose { id, reply } => {
                let _ = reply.send(manager.remove_pose(&id));
            }
            Command::Run(job) => job(&mut manager),
        }
    }
    debug!("model manager task stopped");
}
