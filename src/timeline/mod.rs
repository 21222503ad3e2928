//! Reading timeline: one marker per reader in the room
//!
//! The timeline keeps per-marker motion state and turns a room snapshot plus
//! the live local read percentage into frames for whatever draws them.

pub mod animation;
pub mod color;
pub mod geometry;

pub use animation::{MARKER_TRANSITION_MS, MarkerMotion, ease_in_out};
pub use color::{ColorPair, Hsl, Scheme, color_scheme, string_to_hue};
pub use geometry::{Viewport, offset_to_position, position_to_offset, read_percent, scroll_target};

use crate::presence::{PresenceRecord, RoomSnapshot};
use crate::time::format_duration_ms;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::trace;

const LOCAL_OPACITY: f32 = 0.3;
const REMOTE_OPACITY: f32 = 0.15;
const LOCAL_WIDTH_PX: f32 = 45.0;
const REMOTE_WIDTH_PX: f32 = 30.0;

/// Everything needed to draw one marker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerFrame {
    pub identity: String,
    pub is_local: bool,
    /// Offset in pixels, see [`position_to_offset`]
    pub top: f64,
    pub blur: f32,
    pub opacity: f32,
    pub width: f32,
    /// CSS color; `None` for the local marker, which uses the accent color
    pub color: Option<String>,
    pub label: String,
    /// Read percentage shown in the tooltip
    pub position: u8,
    pub reading_duration: String,
}

#[derive(Debug)]
struct Marker {
    record: PresenceRecord,
    motion: MarkerMotion,
    colors: ColorPair,
}

#[derive(Debug)]
pub struct Timeline {
    viewport: Viewport,
    transition: Duration,
    /// In the room's identity order
    markers: Vec<Marker>,
    local: Option<String>,
    local_percent: u8,
    /// Hidden until the local identity has a record in the room
    visible: bool,
}

impl Timeline {
    pub fn new(viewport: Viewport, transition: Duration) -> Self {
        Self {
            viewport,
            transition,
            markers: Vec::new(),
            local: None,
            local_percent: 0,
            visible: false,
        }
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Reconcile markers with the latest room snapshot.
    ///
    /// Remote markers whose position changed start a transition; new ones
    /// fade in where they are. Markers for identities gone from the room are
    /// dropped.
    pub fn sync(
        &mut self,
        snapshot: &RoomSnapshot,
        local_identity: Option<&str>,
        local_percent: u8,
        now: Instant,
    ) {
        self.local = local_identity.map(String::from);
        self.local_percent = local_percent.min(100);
        self.visible = local_identity.is_some_and(|id| snapshot.get(id).is_some());

        let mut previous = std::mem::take(&mut self.markers);
        for record in &snapshot.records {
            let target = f64::from(record.position);
            let existing = previous
                .iter()
                .position(|m| m.record.identity == record.identity)
                .map(|i| previous.swap_remove(i));

            let marker = match existing {
                Some(mut marker) => {
                    if marker.motion.target() != target {
                        trace!(identity = %record.identity, to = record.position, "marker moves");
                        marker.motion.retarget(target, now);
                    }
                    marker.record = record.clone();
                    marker
                }
                None => Marker {
                    record: record.clone(),
                    motion: MarkerMotion::appear(target, now, self.transition),
                    colors: color_scheme(string_to_hue(&record.identity)),
                },
            };
            self.markers.push(marker);
        }
        if !previous.is_empty() {
            trace!(dropped = previous.len(), "markers left the room");
        }
    }

    /// Update only the local read percentage.
    pub fn set_local_percent(&mut self, percent: u8) {
        self.local_percent = percent.min(100);
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    fn is_local(&self, identity: &str) -> bool {
        self.local.as_deref() == Some(identity)
    }

    /// Marker frames at `now`. Empty while hidden.
    pub fn frames(&self, now: Instant, scheme: Scheme) -> Vec<MarkerFrame> {
        if !self.visible {
            return Vec::new();
        }
        self.markers
            .iter()
            .map(|marker| {
                let identity = &marker.record.identity;
                let reading_duration = format_duration_ms(marker.record.reading_duration_ms());
                if self.is_local(identity) {
                    MarkerFrame {
                        identity: identity.clone(),
                        is_local: true,
                        top: position_to_offset(f64::from(self.local_percent), self.viewport),
                        blur: 0.0,
                        opacity: LOCAL_OPACITY,
                        width: LOCAL_WIDTH_PX,
                        color: None,
                        label: "You are here.".to_string(),
                        position: self.local_percent,
                        reading_duration,
                    }
                } else {
                    let (position, blur) = marker.motion.sample(now);
                    MarkerFrame {
                        identity: identity.clone(),
                        is_local: false,
                        top: position_to_offset(position, self.viewport),
                        blur,
                        opacity: REMOTE_OPACITY,
                        width: REMOTE_WIDTH_PX,
                        color: Some(marker.colors.for_scheme(scheme).to_string()),
                        label: format!("Reader {} is here.", short_tag(identity)),
                        position: marker.record.position,
                        reading_duration,
                    }
                }
            })
            .collect()
    }

    /// Whether any remote marker is still moving.
    pub fn is_animating(&self, now: Instant) -> bool {
        self.markers
            .iter()
            .any(|m| !self.is_local(&m.record.identity) && !m.motion.is_settled(now))
    }

    /// Scroll offset for a click on `identity`'s marker.
    pub fn scroll_target_for(&self, identity: &str) -> Option<f64> {
        if self.is_local(identity) {
            return Some(scroll_target(self.local_percent, self.viewport));
        }
        self.markers
            .iter()
            .find(|m| m.record.identity == identity)
            .map(|m| scroll_target(m.record.position, self.viewport))
    }
}

/// First two characters of an identity, uppercased.
fn short_tag(identity: &str) -> String {
    identity.chars().take(2).collect::<String>().to_uppercase()
}
