//! Mapping between read percentages and pixel offsets of the content area

use serde::{Deserialize, Serialize};

/// Vertical extent of the tracked content, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    /// Offset of the content's top edge from the document top
    pub top: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(top: f64, height: f64) -> Self {
        Self { top, height }
    }

    fn usable(&self) -> bool {
        self.top.is_finite() && self.height.is_finite() && self.height > 0.0
    }
}

/// Pixel offset of a read percentage.
pub fn position_to_offset(position: f64, viewport: Viewport) -> f64 {
    viewport.top + (position / 100.0) * viewport.height
}

/// Read percentage at a pixel offset, clamped to `0..=100`.
pub fn offset_to_position(offset: f64, viewport: Viewport) -> f64 {
    if !viewport.usable() || !offset.is_finite() {
        return 0.0;
    }
    ((offset - viewport.top) / viewport.height * 100.0).clamp(0.0, 100.0)
}

/// Integer read percentage for a scroll offset, rounded down.
pub fn read_percent(scroll_top: f64, viewport: Viewport) -> u8 {
    offset_to_position(scroll_top, viewport).floor() as u8
}

/// Scroll offset that brings a marker's position to the top of the window.
pub fn scroll_target(position: u8, viewport: Viewport) -> f64 {
    position_to_offset(f64::from(position), viewport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_position_pixel_round_trip() {
        let vp = Viewport::new(180.0, 2_345.0);
        for position in 0..=100u8 {
            let px = scroll_target(position, vp);
            assert_eq!(offset_to_position(px, vp).round() as u8, position);
        }
        for px in [180.0, 500.5, 1_234.0, 2_525.0] {
            let back = position_to_offset(offset_to_position(px, vp), vp);
            assert!((back - px).abs() < 1e-6);
        }
    }

    #[test]
    fn read_percent_floors_and_clamps() {
        let vp = Viewport::new(100.0, 1_000.0);
        assert_eq!(read_percent(0.0, vp), 0);
        assert_eq!(read_percent(100.0, vp), 0);
        assert_eq!(read_percent(599.0, vp), 49);
        assert_eq!(read_percent(600.0, vp), 50);
        assert_eq!(read_percent(5_000.0, vp), 100);
    }

    #[test]
    fn degenerate_input_reads_zero() {
        assert_eq!(read_percent(300.0, Viewport::new(0.0, 0.0)), 0);
        assert_eq!(read_percent(f64::NAN, Viewport::new(0.0, 100.0)), 0);
        assert_eq!(read_percent(10.0, Viewport::new(0.0, f64::INFINITY)), 0);
    }
}
