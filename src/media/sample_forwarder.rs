use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::media::{Frame, LocalTrack, TrackKind};

/// Sample forwarder - reads frames from a local capture feed and writes them
/// to the outgoing RTP track while the track is enabled
pub struct SampleForwarder {
    source: LocalTrack,
    rtc_track: Arc<TrackLocalStaticSample>,
    started: AtomicBool,
    stop: Arc<Notify>,
}

impl SampleForwarder {
    pub fn new(source: LocalTrack, rtc_track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            source,
            rtc_track,
            started: AtomicBool::new(false),
            stop: Arc::new(Notify::new()),
        }
    }

    fn frame_duration(kind: TrackKind) -> Duration {
        match kind {
            TrackKind::Audio => Duration::from_millis(20),
            TrackKind::Video => Duration::from_millis(33),
        }
    }

    /// Start forwarding frames from `feed`. The feed is dropped when the
    /// forwarder stops.
    pub fn start(&self, mut feed: mpsc::Receiver<Frame>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return; // Already running
        }

        let source = self.source.clone();
        let rtc_track = self.rtc_track.clone();
        let stop = self.stop.clone();
        let duration = Self::frame_duration(source.kind());

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = stop.notified() => break,
                    frame = feed.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                if !source.is_live() {
                    break;
                }
                // Muted tracks drop frames instead of sending them
                if !source.is_enabled() {
                    continue;
                }

                let sample = Sample {
                    data: frame,
                    duration,
                    ..Default::default()
                };
                if let Err(e) = rtc_track.write_sample(&sample).await {
                    tracing::trace!(error = %e, "Error writing sample to local track");
                }
            }

            tracing::debug!(kind = %source.kind(), "Sample forwarder stopped");
        });
    }

    /// Stop forwarding, waking the task even when no frame is pending
    pub fn stop(&self) {
        // notify_one stores a permit, so a stop before the first poll still lands
        self.stop.notify_one();
    }
}
