//! Host media environment: local capture acquisition and track control.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use tether_core::TrackKind;

#[derive(Debug, Clone, thiserror::Error)]
#[error("media acquisition failed: {0}")]
pub struct MediaError(pub String);

/// Acquires local audio/video capture. Implemented by the host environment.
pub trait MediaSource: Send + Sync + 'static {
    fn acquire(&self, audio: bool, video: bool) -> Result<MediaStream, MediaError>;
}

/// One capture track. `enabled` mutes without releasing the device; `stop`
/// releases it for good, which is irreversible without re-acquiring.
#[derive(Debug)]
pub struct MediaTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Shared handle over a set of capture tracks; clones observe the same
/// tracks.
#[derive(Clone)]
pub struct MediaStream {
    tracks: Arc<Vec<MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            tracks: Arc::new(tracks),
        }
    }

    /// Audio track plus an optional video track, all enabled.
    pub fn capture(audio: bool, video: bool) -> Self {
        let mut tracks = Vec::new();
        if audio {
            tracks.push(MediaTrack::new(TrackKind::Audio));
        }
        if video {
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        Self::new(tracks)
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn has_track(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    /// Flip `enabled` on every track of `kind`. No-op when none exists.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    /// Release all capture. Idempotent.
    pub fn stop_all(&self) {
        for track in self.tracks.iter() {
            track.stop();
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Stand-in capture source for tests and headless hosts: hands out fresh
/// silent streams.
#[derive(Debug, Default)]
pub struct SyntheticMedia;

impl MediaSource for SyntheticMedia {
    fn acquire(&self, audio: bool, video: bool) -> Result<MediaStream, MediaError> {
        Ok(MediaStream::capture(audio, video))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggling_flips_enabled_without_stopping() {
        let stream = MediaStream::capture(true, true);
        stream.set_enabled(TrackKind::Audio, false);
        let audio = stream
            .tracks()
            .iter()
            .find(|t| t.kind() == TrackKind::Audio)
            .unwrap();
        let video = stream
            .tracks()
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .unwrap();
        assert!(!audio.is_enabled());
        assert!(!audio.is_stopped());
        assert!(video.is_enabled());
        stream.set_enabled(TrackKind::Audio, true);
        assert!(audio.is_enabled());
    }

    #[test]
    fn toggling_a_missing_kind_is_a_noop() {
        let stream = MediaStream::capture(true, false);
        assert!(!stream.has_track(TrackKind::Video));
        stream.set_enabled(TrackKind::Video, false);
        assert!(stream.tracks()[0].is_enabled());
    }

    #[test]
    fn stop_all_is_idempotent() {
        let stream = MediaStream::capture(true, true);
        stream.stop_all();
        stream.stop_all();
        assert!(stream.tracks().iter().all(|t| t.is_stopped()));
    }
}
