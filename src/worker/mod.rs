//! Worker lifecycle
//!
//! A worker binds sessions to an external room and to job execution: it
//! connects the room (when one is configured), watches participant and
//! track events, subscribes to user microphones, pushes the session
//! entrypoint onto the job supervisor, and tears everything down when its
//! cancellation signal fires.
//!
//! Ownership runs one way: the worker owns its sessions and the room
//! connection; sessions see the room only through the job context's
//! opaque user data, never an owning reference back.

pub mod room;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::config::WorkerOptions;
use crate::error::{AgentError, Result};
use crate::jobs::{Job, JobContext, JobSupervisor};
use crate::worker::room::{should_subscribe, Room, RoomCredentials, RoomEvent};

pub use room::{MockRoom, MockRoomController, ParticipantInfo, TrackInfo, TrackSource};

/// Binds one or more sessions to one room.
pub struct Worker {
    options: WorkerOptions,
    supervisor: JobSupervisor,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(options: WorkerOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            supervisor: JobSupervisor::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Signal used to stop the worker from outside (CLI ctrl-c handler).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn supervisor(&self) -> &JobSupervisor {
        &self.supervisor
    }

    /// Run until cancelled: connect the room, watch its tracks, run the
    /// entrypoint as a supervised job, then stop everything.
    pub async fn run<F, Fut>(self, mut room: Option<Box<dyn Room>>, entrypoint: F) -> Result<()>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let identity = self.options.identity();
        info!(
            "worker {} starting (identity {})",
            self.options.agent_name, identity
        );

        // 1. Attach to the room, if one is configured.
        let mut room_task = None;
        if let Some(active) = room.as_mut() {
            let url = self
                .options
                .media_server_url
                .as_deref()
                .ok_or_else(|| {
                    AgentError::InvalidConfiguration("worker has a room but no media_server_url".into())
                })?
                .parse::<Url>()
                .map_err(|e| AgentError::InvalidConfiguration(format!("media_server_url: {}", e)))?;
            let credentials = RoomCredentials {
                api_key: self.options.api_key.clone().unwrap_or_default(),
                api_secret: self.options.api_secret.clone().unwrap_or_default(),
            };
            let events = active.connect(&url, &credentials).await?;
            info!("connected to room {}", active.name());

            let shared: Arc<Mutex<Box<dyn Room>>> = Arc::new(Mutex::new(room.take().unwrap()));
            room_task = Some((
                shared.clone(),
                tokio::spawn(Self::room_event_loop(
                    shared,
                    events,
                    identity.clone(),
                    self.cancel.clone(),
                )),
            ));
        }

        // 2. Push the session entrypoint onto the supervisor.
        let user_data = json!({
            "room_name": self.options.room_name,
            "agent_name": self.options.agent_name,
            "identity": identity,
            "metadata": self.options.metadata,
        });
        let job_id = self
            .supervisor
            .schedule(Job::new(entrypoint).with_user_data(user_data))?;
        info!("scheduled session job {}", job_id);

        // 3. Hold until the supervising signal fires.
        self.cancel.cancelled().await;
        info!("worker {} stopping", self.options.agent_name);

        if let Some((shared, task)) = room_task {
            task.abort();
            let _ = task.await;
            if let Err(e) = shared.lock().await.disconnect().await {
                warn!("room disconnect failed: {}", e);
            }
        }
        self.supervisor.shutdown().await;
        Ok(())
    }

    /// Subscribe to user microphones as they appear; skip everything
    /// published under the agent's own identity.
    async fn room_event_loop(
        room: Arc<Mutex<Box<dyn Room>>>,
        mut events: tokio::sync::mpsc::Receiver<RoomEvent>,
        agent_identity: String,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                RoomEvent::ParticipantConnected(participant) => {
                    info!("participant connected: {}", participant.identity);
                }
                RoomEvent::TrackPublished(track) => {
                    if should_subscribe(&track, &agent_identity) {
                        if let Err(e) = room.lock().await.subscribe(&track).await {
                            warn!("subscribe to {} failed: {}", track.sid, e);
                        }
                    } else {
                        info!("ignoring track {} from {}", track.sid, track.participant_identity);
                    }
                }
                RoomEvent::TrackSubscribed(track) => {
                    info!("track subscribed: {}", track.sid);
                }
                RoomEvent::TrackUnsubscribed(track) => {
                    info!("track unsubscribed: {}", track.sid);
                }
                RoomEvent::Disconnected => {
                    warn!("room disconnected");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn console_options() -> WorkerOptions {
        WorkerOptions::default().for_console()
    }

    #[test]
    fn test_worker_requires_valid_options() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        assert!(Worker::new(WorkerOptions::default()).is_err());
        assert!(Worker::new(console_options()).is_ok());
    }

    #[tokio::test]
    async fn test_worker_runs_entrypoint_and_stops() {
        let worker = Worker::new(console_options()).unwrap();
        let cancel = worker.cancel_token();
        let (tx, rx) = tokio::sync::oneshot::channel::<serde_json::Value>();
        let tx = std::sync::Mutex::new(Some(tx));

        let handle = tokio::spawn(worker.run(None, move |ctx: JobContext| {
            let tx = tx.lock().unwrap().take();
            async move {
                if let Some(tx) = tx {
                    let _ = tx.send(ctx.user_data);
                }
                ctx.cancel.cancelled().await;
                Ok(())
            }
        }));

        let data = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data["agent_name"], "vox-agent");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_subscribes_to_user_microphones() {
        let mut options = console_options();
        options.participant_identity = Some("agent-kelly".into());
        let worker = Worker::new(options).unwrap();
        let cancel = worker.cancel_token();

        // Rig a room whose controller we keep. connect() happens inside
        // run(), so pre-wire the controller through a channel.
        struct ProbeRoom {
            inner: MockRoom,
            controller_tx: Option<tokio::sync::oneshot::Sender<MockRoomController>>,
            subscribed_tx: tokio::sync::mpsc::Sender<String>,
        }

        #[async_trait::async_trait]
        impl Room for ProbeRoom {
            fn name(&self) -> &str {
                self.inner.name()
            }
            async fn connect(
                &mut self,
                url: &Url,
                credentials: &RoomCredentials,
            ) -> Result<tokio::sync::mpsc::Receiver<RoomEvent>> {
                let rx = self.inner.connect(url, credentials).await?;
                if let (Some(tx), Some(controller)) =
                    (self.controller_tx.take(), self.inner.controller())
                {
                    let _ = tx.send(controller);
                }
                Ok(rx)
            }
            async fn subscribe(&mut self, track: &TrackInfo) -> Result<()> {
                self.inner.subscribe(track).await?;
                let _ = self.subscribed_tx.send(track.sid.clone()).await;
                Ok(())
            }
            async fn publish_audio(
                &mut self,
                track_name: &str,
                frames: tokio::sync::mpsc::Receiver<crate::audio::frame::AudioFrame>,
            ) -> Result<()> {
                self.inner.publish_audio(track_name, frames).await
            }
            async fn disconnect(&mut self) -> Result<()> {
                self.inner.disconnect().await
            }
        }

        let (controller_tx, controller_rx) = tokio::sync::oneshot::channel();
        let (subscribed_tx, mut subscribed_rx) = tokio::sync::mpsc::channel(4);
        let room = ProbeRoom {
            inner: MockRoom::new("demo"),
            controller_tx: Some(controller_tx),
            subscribed_tx,
        };

        let handle = tokio::spawn(worker.run(Some(Box::new(room)), |ctx: JobContext| async move {
            ctx.cancel.cancelled().await;
            Ok(())
        }));

        let controller = tokio::time::timeout(Duration::from_secs(2), controller_rx)
            .await
            .unwrap()
            .unwrap();

        // The agent's own track must be ignored…
        controller
            .emit(RoomEvent::TrackPublished(TrackInfo {
                sid: "own-mic".into(),
                participant_identity: "agent-kelly".into(),
                source: TrackSource::Microphone,
            }))
            .await;
        // …while a user's microphone is subscribed.
        controller
            .emit(RoomEvent::TrackPublished(TrackInfo {
                sid: "user-mic".into(),
                participant_identity: "user-1".into(),
                source: TrackSource::Microphone,
            }))
            .await;

        let sid = tokio::time::timeout(Duration::from_secs(2), subscribed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sid, "user-mic");
        assert!(subscribed_rx.try_recv().is_err(), "own track must not subscribe");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
