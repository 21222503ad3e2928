//! Deterministic per-identity marker colors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Light or dark page theme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hsl {
    pub hue: u16,
    pub saturation: u8,
    pub lightness: u8,
}

impl fmt::Display for Hsl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hsl({}, {}%, {}%)", self.hue, self.saturation, self.lightness)
    }
}

/// Background colors for both themes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorPair {
    pub light: Hsl,
    pub dark: Hsl,
}

impl ColorPair {
    pub fn for_scheme(&self, scheme: Scheme) -> Hsl {
        match scheme {
            Scheme::Light => self.light,
            Scheme::Dark => self.dark,
        }
    }
}

/// Hue in `0..360` from a string hash (31-multiplier over UTF-16 units).
pub fn string_to_hue(s: &str) -> u16 {
    let hash = s
        .encode_utf16()
        .fold(0i32, |hash, c| {
            i32::from(c).wrapping_add((hash << 5).wrapping_sub(hash))
        });
    hash.rem_euclid(360) as u16
}

pub fn color_scheme(hue: u16) -> ColorPair {
    ColorPair {
        light: Hsl {
            hue,
            saturation: 70,
            lightness: 55,
        },
        dark: Hsl {
            hue,
            saturation: 60,
            lightness: 40,
        },
    }
}
