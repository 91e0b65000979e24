//! Local capture capability. Device selection happens outside this crate; the
//! engine only needs the resulting track descriptors.

use async_trait::async_trait;

use crate::transport::MediaKind;

/// Capture preferences handed to the provider explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    pub audio: bool,
    pub video: bool,
    pub audio_device: Option<String>,
    pub video_device: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            audio_device: None,
            video_device: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub audio: bool,
    pub video: bool,
}

impl MediaRequest {
    pub const NONE: MediaRequest = MediaRequest {
        audio: false,
        video: false,
    };

    pub fn is_empty(self) -> bool {
        !self.audio && !self.video
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub id: String,
    pub stream_id: String,
    pub device: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("no {0} device available")]
    Unavailable(MediaKind),
    #[error("capture permission denied: {0}")]
    Denied(String),
    #[error("capture device error: {0}")]
    Device(String),
}

#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Returns tracks for every requested kind, or fails as a whole.
    async fn acquire(
        &self,
        request: MediaRequest,
        config: &MediaConfig,
    ) -> Result<Vec<LocalTrack>, MediaError>;
}

/// Provider for headless clients: never captures anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMedia;

#[async_trait]
impl MediaProvider for NoMedia {
    async fn acquire(
        &self,
        request: MediaRequest,
        _config: &MediaConfig,
    ) -> Result<Vec<LocalTrack>, MediaError> {
        if request.audio {
            return Err(MediaError::Unavailable(MediaKind::Audio));
        }
        if request.video {
            return Err(MediaError::Unavailable(MediaKind::Video));
        }
        Ok(Vec::new())
    }
}

/// Provider backed by a fixed set of available kinds.
#[derive(Debug, Clone, Copy)]
pub struct StaticMedia {
    pub audio: bool,
    pub video: bool,
}

const LOCAL_STREAM_ID: &str = "roulette-local";

#[async_trait]
impl MediaProvider for StaticMedia {
    async fn acquire(
        &self,
        request: MediaRequest,
        config: &MediaConfig,
    ) -> Result<Vec<LocalTrack>, MediaError> {
        let mut tracks = Vec::new();
        if request.audio {
            if !self.audio {
                return Err(MediaError::Unavailable(MediaKind::Audio));
            }
            tracks.push(LocalTrack {
                kind: MediaKind::Audio,
                id: "audio".into(),
                stream_id: LOCAL_STREAM_ID.into(),
                device: config.audio_device.clone(),
            });
        }
        if request.video {
            if !self.video {
                return Err(MediaError::Unavailable(MediaKind::Video));
            }
            tracks.push(LocalTrack {
                kind: MediaKind::Video,
                id: "video".into(),
                stream_id: LOCAL_STREAM_ID.into(),
                device: config.video_device.clone(),
            });
        }
        Ok(tracks)
    }
}

/// Acquires local media, stepping down from audio+video to audio-only to
/// nothing. Never fails.
pub async fn acquire_local_media(
    provider: &dyn MediaProvider,
    config: &MediaConfig,
) -> Vec<LocalTrack> {
    let mut attempts = Vec::with_capacity(2);
    if config.audio || config.video {
        attempts.push(MediaRequest {
            audio: config.audio,
            video: config.video,
        });
    }
    if config.audio && config.video {
        attempts.push(MediaRequest {
            audio: true,
            video: false,
        });
    }

    for request in attempts {
        match provider.acquire(request, config).await {
            Ok(tracks) => {
                tracing::debug!(
                    audio = request.audio,
                    video = request.video,
                    tracks = tracks.len(),
                    "local media acquired"
                );
                return tracks;
            }
            Err(err) => {
                tracing::warn!(
                    audio = request.audio,
                    video = request.video,
                    error = %err,
                    "local media unavailable, degrading"
                );
            }
        }
    }
    tracing::info!("continuing without local media");
    Vec::new()
}
