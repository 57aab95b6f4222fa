//! Camera vs. screen-share classification of incoming video tracks.
//!
//! Both arrive as plain video-kind tracks. The only hints are the toggle
//! messages the peer sends ahead of each track and the order in which tracks
//! show up. When both kinds are enabled at once the result is a heuristic.
//! Turning the camera off resets its count, so a camera that is disabled and
//! re-enabled is classified correctly. A camera track replaced without a
//! disable toggle in between is reported as a screen share.

use crate::types::call::{MediaKind, TrackClass};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackRouter {
    remote_video_enabled: bool,
    remote_screen_sharing: bool,
    video_tracks_received: u32,
    screen_tracks_received: u32,
}

impl TrackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_remote_video_enabled(&mut self, enabled: bool) {
        self.remote_video_enabled = enabled;
        if !enabled {
            self.video_tracks_received = 0;
        }
    }

    pub fn set_remote_screen_sharing(&mut self, enabled: bool) {
        self.remote_screen_sharing = enabled;
        if !enabled {
            self.screen_tracks_received = 0;
        }
    }

    pub fn remote_video_enabled(&self) -> bool {
        self.remote_video_enabled
    }

    pub fn remote_screen_sharing(&self) -> bool {
        self.remote_screen_sharing
    }

    pub fn video_tracks_received(&self) -> u32 {
        self.video_tracks_received
    }

    pub fn screen_tracks_received(&self) -> u32 {
        self.screen_tracks_received
    }

    /// Classify one incoming track and update the counters.
    pub fn classify(&mut self, kind: MediaKind) -> TrackClass {
        if kind == MediaKind::Audio {
            return TrackClass::Audio;
        }

        match (self.remote_video_enabled, self.remote_screen_sharing) {
            (false, true) => self.count_screen(),
            (true, false) => self.count_video(),
            (true, true) => {
                if self.video_tracks_received == 0 {
                    self.count_video()
                } else {
                    // second track, or a replacement once both have arrived
                    self.count_screen()
                }
            }
            // track raced ahead of its toggle message
            (false, false) => self.count_video(),
        }
    }

    fn count_video(&mut self) -> TrackClass {
        self.video_tracks_received += 1;
        TrackClass::Video
    }

    fn count_screen(&mut self) -> TrackClass {
        self.screen_tracks_received += 1;
        TrackClass::ScreenShare
    }
}
