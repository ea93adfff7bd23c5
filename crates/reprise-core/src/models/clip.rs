//! Clip range: the playable window of a source.
//!
//! Offsets handed to and reported by a player are relative to the clip
//! start. Absolute positions only exist inside the decode pipeline.

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// `[start_ms, end_ms)` of a media file. `end_ms = None` plays to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClipRange {
    pub start_ms: u64,
    pub end_ms: Option<u64>,
}

impl ClipRange {
    pub const FULL: ClipRange = ClipRange {
        start_ms: 0,
        end_ms: None,
    };

    pub fn new(start_ms: u64, end_ms: Option<u64>) -> Result<Self, PluginError> {
        if let Some(end) = end_ms {
            if end <= start_ms {
                return Err(PluginError::InvalidArguments(format!(
                    "clip end {} must be after clip start {}",
                    end, start_ms
                )));
            }
        }
        Ok(Self { start_ms, end_ms })
    }

    /// Parse the `clipRange` argument: `[start, end]`, where a negative end
    /// means "to the end of the source".
    pub fn from_args(values: &[i64]) -> Result<Self, PluginError> {
        match values {
            [start, end, ..] => {
                let start = (*start).max(0) as u64;
                let end = if *end < 0 { None } else { Some(*end as u64) };
                Self::new(start, end)
            }
            _ => Err(PluginError::InvalidArguments(
                "clipRange needs a start and an end".into(),
            )),
        }
    }

    /// Absolute end of the window, clamped to the source duration when known.
    pub fn end_abs_ms(&self, total_ms: Option<u64>) -> Option<u64> {
        match (self.end_ms, total_ms) {
            (Some(end), Some(total)) => Some(end.min(total)),
            (Some(end), None) => Some(end),
            (None, total) => total,
        }
    }

    /// Length of the playable window.
    pub fn window_ms(&self, total_ms: Option<u64>) -> Option<u64> {
        self.end_abs_ms(total_ms)
            .map(|end| end.saturating_sub(self.start_ms))
    }

    /// Clip-relative offset → absolute source position.
    pub fn to_abs(&self, offset_ms: u64) -> u64 {
        self.start_ms.saturating_add(offset_ms)
    }

    /// Absolute source position → clip-relative offset (saturating at 0).
    pub fn to_offset(&self, abs_ms: u64) -> u64 {
        abs_ms.saturating_sub(self.start_ms)
    }

    /// True once an absolute position has reached a closed end.
    pub fn reached_end(&self, abs_ms: u64) -> bool {
        self.end_ms.map(|end| abs_ms >= end).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_end_from_negative() {
        let clip = ClipRange::from_args(&[1500, -1]).unwrap();
        assert_eq!(clip.start_ms, 1500);
        assert_eq!(clip.end_ms, None);
        assert_eq!(clip.window_ms(Some(10_000)), Some(8_500));
        assert_eq!(clip.window_ms(None), None);
    }

    #[test]
    fn closed_end_clamped_to_total() {
        let clip = ClipRange::from_args(&[2000, 60_000]).unwrap();
        assert_eq!(clip.window_ms(Some(30_000)), Some(28_000));
        assert_eq!(clip.window_ms(None), Some(58_000));
    }

    #[test]
    fn inverted_range_rejected() {
        assert!(ClipRange::from_args(&[5000, 4000]).is_err());
        assert!(ClipRange::from_args(&[5000, 5000]).is_err());
        assert!(ClipRange::from_args(&[5000]).is_err());
    }

    #[test]
    fn negative_start_is_zero() {
        let clip = ClipRange::from_args(&[-20, 100]).unwrap();
        assert_eq!(clip.start_ms, 0);
    }

    #[test]
    fn offsets_are_relative_to_start() {
        let clip = ClipRange::new(1000, Some(3000)).unwrap();
        assert_eq!(clip.to_abs(500), 1500);
        assert_eq!(clip.to_offset(1500), 500);
        assert_eq!(clip.to_offset(200), 0);
        assert!(clip.reached_end(3000));
        assert!(!clip.reached_end(2999));
        assert!(!ClipRange::FULL.reached_end(u64::MAX));
    }
}
