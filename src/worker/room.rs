//! Room abstraction
//!
//! A room is the external real-time-media session the worker may attach
//! to: participants join, publish tracks, and the agent publishes its own
//! audio track back. Transport details live behind the [`Room`] trait;
//! [`MockRoom`] backs console mode and tests.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;
use url::Url;

use crate::audio::frame::AudioFrame;
use crate::error::{AgentError, Result};

/// Where a published track's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    ScreenShare,
    Unknown,
}

/// A participant in the room.
#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    pub identity: String,
    pub name: String,
}

/// A published media track.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub sid: String,
    pub participant_identity: String,
    pub source: TrackSource,
}

/// Lifecycle events delivered after [`Room::connect`].
#[derive(Debug, Clone)]
pub enum RoomEvent {
    ParticipantConnected(ParticipantInfo),
    TrackPublished(TrackInfo),
    TrackSubscribed(TrackInfo),
    TrackUnsubscribed(TrackInfo),
    Disconnected,
}

/// Credentials for the media server.
#[derive(Debug, Clone, Default)]
pub struct RoomCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// External media session contract.
#[async_trait]
pub trait Room: Send + Sync {
    fn name(&self) -> &str;

    /// Connect and hand back the event feed.
    async fn connect(
        &mut self,
        url: &Url,
        credentials: &RoomCredentials,
    ) -> Result<mpsc::Receiver<RoomEvent>>;

    /// Subscribe to a remote track.
    async fn subscribe(&mut self, track: &TrackInfo) -> Result<()>;

    /// Publish an audio track backed by a frame feed the room pulls on
    /// demand.
    async fn publish_audio(
        &mut self,
        track_name: &str,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// In-process room used by console mode and tests: events are injected
/// through [`MockRoomController`], published audio is captured for
/// inspection.
pub struct MockRoom {
    name: String,
    connected: bool,
    event_tx: Option<mpsc::Sender<RoomEvent>>,
    subscribed: Vec<String>,
    published: Vec<String>,
}

/// Test-side handle for injecting room events.
pub struct MockRoomController {
    tx: mpsc::Sender<RoomEvent>,
}

impl MockRoomController {
    pub async fn emit(&self, event: RoomEvent) {
        let _ = self.tx.send(event).await;
    }
}

impl MockRoom {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: false,
            event_tx: None,
            subscribed: Vec::new(),
            published: Vec::new(),
        }
    }

    /// Controller for injecting events; available after `connect`.
    pub fn controller(&self) -> Option<MockRoomController> {
        self.event_tx
            .as_ref()
            .map(|tx| MockRoomController { tx: tx.clone() })
    }

    pub fn subscribed_tracks(&self) -> &[String] {
        &self.subscribed
    }

    pub fn published_tracks(&self) -> &[String] {
        &self.published
    }
}

#[async_trait]
impl Room for MockRoom {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(
        &mut self,
        url: &Url,
        _credentials: &RoomCredentials,
    ) -> Result<mpsc::Receiver<RoomEvent>> {
        if self.connected {
            return Err(AgentError::AlreadyStarted(format!("room {}", self.name)));
        }
        self.connected = true;
        info!("mock room {} connected to {}", self.name, url);
        let (tx, rx) = mpsc::channel(16);
        self.event_tx = Some(tx);
        Ok(rx)
    }

    async fn subscribe(&mut self, track: &TrackInfo) -> Result<()> {
        if !self.connected {
            return Err(AgentError::NotStarted(format!("room {}", self.name)));
        }
        info!("mock room subscribing to track {}", track.sid);
        self.subscribed.push(track.sid.clone());
        Ok(())
    }

    async fn publish_audio(
        &mut self,
        track_name: &str,
        mut frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<()> {
        if !self.connected {
            return Err(AgentError::NotStarted(format!("room {}", self.name)));
        }
        self.published.push(track_name.to_string());
        // Drain the feed so producers never back up against a mock.
        tokio::spawn(async move { while frames.recv().await.is_some() {} });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.event_tx = None;
        Ok(())
    }
}

/// The subscription policy: only microphone tracks, and never the
/// agent's own.
pub fn should_subscribe(track: &TrackInfo, agent_identity: &str) -> bool {
    track.source == TrackSource::Microphone && track.participant_identity != agent_identity
}
