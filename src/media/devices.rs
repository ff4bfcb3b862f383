use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::media::{Frame, LocalStream, LocalTrack, TrackKind};

/// Viewports narrower than this capture in portrait.
pub const NARROW_VIEWPORT_WIDTH: u32 = 768;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing_mode: String,
    pub ideal_frame_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
}

/// What a call asks the capture provider for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

impl MediaConstraints {
    /// Audio plus video sized for the viewport: portrait first on narrow
    /// screens, landscape otherwise.
    pub fn for_viewport(width: u32) -> Self {
        let (ideal_width, ideal_height) = if width < NARROW_VIEWPORT_WIDTH {
            (720, 1280)
        } else {
            (1280, 720)
        };

        Self {
            video: Some(VideoConstraints {
                ideal_width,
                ideal_height,
                facing_mode: "user".to_string(),
                ideal_frame_rate: 30,
            }),
            audio: Some(AudioConstraints {
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
                sample_rate: 44100,
            }),
        }
    }
}

/// Classified capture failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("Camera and microphone access denied")]
    PermissionDenied,

    #[error("No camera or microphone found")]
    NotFound,

    #[error("Camera or microphone is in use by another application")]
    DeviceBusy,

    #[error("Capture constraints cannot be satisfied")]
    Overconstrained,

    #[error("Media capture is not supported on this platform")]
    Unsupported,

    #[error("Media capture requires a secure context")]
    InsecureContext,

    #[error("Capture failed: {0}")]
    Other(String),
}

impl CaptureError {
    /// Classify a platform error by name (`NotAllowedError`, ...).
    pub fn from_platform_name(name: &str, message: &str) -> Self {
        match name {
            "NotAllowedError" | "PermissionDeniedError" => CaptureError::PermissionDenied,
            "NotFoundError" | "DevicesNotFoundError" => CaptureError::NotFound,
            "NotReadableError" | "TrackStartError" => CaptureError::DeviceBusy,
            "OverconstrainedError" | "ConstraintNotSatisfiedError" => {
                CaptureError::Overconstrained
            }
            "NotSupportedError" => CaptureError::Unsupported,
            "TypeError" | "SecurityError" => CaptureError::InsecureContext,
            _ => CaptureError::Other(message.to_string()),
        }
    }

    /// Stable identifier for clients
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::PermissionDenied => "permission-denied",
            CaptureError::NotFound => "device-not-found",
            CaptureError::DeviceBusy => "device-busy",
            CaptureError::Overconstrained => "overconstrained",
            CaptureError::Unsupported => "unsupported",
            CaptureError::InsecureContext => "insecure-context",
            CaptureError::Other(_) => "capture-failed",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            CaptureError::PermissionDenied => "Camera and microphone access denied. Allow access in your settings and try again.".to_string(),
            CaptureError::NotFound => "No camera or microphone found. Connect a camera and microphone to use video calling.".to_string(),
            CaptureError::DeviceBusy => "Camera or microphone is already in use by another application. Close it and try again.".to_string(),
            CaptureError::Overconstrained => "Your camera or microphone doesn't meet the required specifications. Try different settings.".to_string(),
            CaptureError::Unsupported => "This platform doesn't support video calling.".to_string(),
            CaptureError::InsecureContext => "Security settings are blocking camera access. Use a secure connection.".to_string(),
            CaptureError::Other(message) if !message.is_empty() => message.clone(),
            CaptureError::Other(_) => "An unexpected error occurred while accessing your camera and microphone. Please try again.".to_string(),
        }
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Whether a capture API exists at all.
    fn is_supported(&self) -> bool;

    /// Whether capture is allowed under the current transport security.
    fn is_secure_context(&self) -> bool;

    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, CaptureError>;
}

/// Capture provider whose tracks are fed by the host application.
///
/// Each acquisition creates fresh tracks and keeps the frame senders so the
/// host can push encoded frames. A device stays busy until every track of the
/// previous acquisition has been stopped.
pub struct FeedDevices {
    audio_available: bool,
    video_available: bool,
    acquired: Mutex<Vec<(LocalTrack, mpsc::Sender<Frame>)>>,
}

impl FeedDevices {
    pub fn new(audio_available: bool, video_available: bool) -> Self {
        Self {
            audio_available,
            video_available,
            acquired: Mutex::new(Vec::new()),
        }
    }

    /// Sender feeding the live track of `kind`, if one is captured.
    /// Senders of stopped tracks are dropped here so their feeds close.
    pub async fn frame_sender(&self, kind: TrackKind) -> Option<mpsc::Sender<Frame>> {
        let mut acquired = self.acquired.lock().await;
        acquired.retain(|(track, _)| track.is_live());
        acquired
            .iter()
            .find(|(track, _)| track.kind() == kind)
            .map(|(_, tx)| tx.clone())
    }
}

#[async_trait]
impl MediaDevices for FeedDevices {
    fn is_supported(&self) -> bool {
        true
    }

    fn is_secure_context(&self) -> bool {
        true
    }

    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, CaptureError> {
        let mut acquired = self.acquired.lock().await;
        if acquired.iter().any(|(track, _)| track.is_live()) {
            return Err(CaptureError::DeviceBusy);
        }
        if (constraints.audio.is_some() && !self.audio_available)
            || (constraints.video.is_some() && !self.video_available)
        {
            return Err(CaptureError::NotFound);
        }

        acquired.clear();
        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            let (track, tx) = LocalTrack::new(TrackKind::Audio, "feed-microphone");
            acquired.push((track.clone(), tx));
            tracks.push(track);
        }
        if constraints.video.is_some() {
            let (track, tx) = LocalTrack::new(TrackKind::Video, "feed-camera");
            acquired.push((track.clone(), tx));
            tracks.push(track);
        }

        tracing::debug!(tracks = tracks.len(), "Local media acquired");
        Ok(LocalStream::new(tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn narrow_viewports_capture_portrait() {
        let narrow = MediaConstraints::for_viewport(600);
        let video = narrow.video.unwrap();
        assert_eq!((video.ideal_width, video.ideal_height), (720, 1280));

        let wide = MediaConstraints::for_viewport(NARROW_VIEWPORT_WIDTH);
        let video = wide.video.unwrap();
        assert_eq!((video.ideal_width, video.ideal_height), (1280, 720));
        assert_eq!(video.ideal_frame_rate, 30);
        assert_eq!(wide.audio.unwrap().sample_rate, 44100);
    }

    #[test]
    fn platform_error_names_are_classified() {
        assert_eq!(
            CaptureError::from_platform_name("PermissionDeniedError", ""),
            CaptureError::PermissionDenied
        );
        assert_eq!(
            CaptureError::from_platform_name("TrackStartError", ""),
            CaptureError::DeviceBusy
        );
        assert_eq!(
            CaptureError::from_platform_name("ConstraintNotSatisfiedError", ""),
            CaptureError::Overconstrained
        );
        assert_eq!(
            CaptureError::from_platform_name("TypeError", ""),
            CaptureError::InsecureContext
        );
        assert_eq!(
            CaptureError::from_platform_name("AbortError", "aborted"),
            CaptureError::Other("aborted".to_string())
        );
    }

    #[test]
    fn every_classification_has_a_distinct_message() {
        let all = [
            CaptureError::PermissionDenied,
            CaptureError::NotFound,
            CaptureError::DeviceBusy,
            CaptureError::Overconstrained,
            CaptureError::Unsupported,
            CaptureError::InsecureContext,
            CaptureError::Other(String::new()),
        ];
        let messages: std::collections::HashSet<String> =
            all.iter().map(CaptureError::user_message).collect();
        assert_eq!(messages.len(), all.len());
    }

    #[tokio::test]
    async fn devices_stay_busy_until_tracks_are_released() {
        let devices = FeedDevices::new(true, true);
        let constraints = MediaConstraints::for_viewport(1280);

        let stream = devices.acquire(&constraints).await.unwrap();
        assert_eq!(stream.tracks().len(), 2);
        assert!(devices.frame_sender(TrackKind::Video).await.is_some());
        assert_eq!(
            devices.acquire(&constraints).await.unwrap_err(),
            CaptureError::DeviceBusy
        );

        stream.stop_all();
        assert!(devices.frame_sender(TrackKind::Video).await.is_none());
        assert!(devices.acquire(&constraints).await.is_ok());
    }

    #[tokio::test]
    async fn stopped_tracks_release_their_feeds() {
        let devices = FeedDevices::new(true, false);
        let constraints = MediaConstraints {
            audio: MediaConstraints::for_viewport(1280).audio,
            video: None,
        };

        let stream = devices.acquire(&constraints).await.unwrap();
        let mut feed = stream.tracks()[0].take_feed().await.unwrap();
        assert!(devices.frame_sender(TrackKind::Audio).await.is_some());

        stream.stop_all();
        assert!(devices.frame_sender(TrackKind::Audio).await.is_none());
        assert_eq!(feed.recv().await, None);
    }

    #[tokio::test]
    async fn missing_hardware_is_not_found() {
        let devices = FeedDevices::new(true, false);
        let err = devices
            .acquire(&MediaConstraints::for_viewport(1280))
            .await
            .unwrap_err();
        assert_eq!(err, CaptureError::NotFound);
    }
}
