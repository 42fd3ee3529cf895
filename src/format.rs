use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TranscodeError};

/// Well-known track format keys. Collaborators are free to define more.
pub mod keys {
    pub const MIME: &str = "mime";
    pub const BITRATE: &str = "bitrate";
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const FRAME_RATE: &str = "frame-rate";
    pub const FRAME_COUNT: &str = "frame-count";
    pub const DURATION_US: &str = "durationUs";
    pub const SAMPLE_RATE: &str = "sample-rate";
    pub const CHANNEL_COUNT: &str = "channel-count";
    pub const OPERATING_RATE: &str = "operating-rate";
    pub const PRIORITY: &str = "priority";
    pub const I_FRAME_INTERVAL: &str = "i-frame-interval";
}

/// Default target bitrate applied to transcoded video tracks when the
/// destination format does not name one: 20 Mbps.
pub const DEFAULT_VIDEO_BITRATE: i32 = 20 * 1000 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormatValue {
    Int32(i32),
    Int64(i64),
    Float(f64),
    Str(String),
}

/// Mutable key/value format description for one elementary stream.
///
/// Mirrors the flat typed-field maps containers and codecs speak natively.
/// Built by clients per track for transcode targets, and returned by
/// [`crate::source::MediaSource::tracks`] as the source-side snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackFormat {
    fields: HashMap<String, FormatValue>,
}

impl TrackFormat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mime(mime: &str) -> Self {
        let mut f = Self::new();
        f.set_str(keys::MIME, mime);
        f
    }

    pub fn set_i32(&mut self, key: &str, value: i32) -> &mut Self {
        self.fields.insert(key.to_string(), FormatValue::Int32(value));
        self
    }

    pub fn set_i64(&mut self, key: &str, value: i64) -> &mut Self {
        self.fields.insert(key.to_string(), FormatValue::Int64(value));
        self
    }

    pub fn set_f64(&mut self, key: &str, value: f64) -> &mut Self {
        self.fields.insert(key.to_string(), FormatValue::Float(value));
        self
    }

    pub fn set_str(&mut self, key: &str, value: &str) -> &mut Self {
        self.fields
            .insert(key.to_string(), FormatValue::Str(value.to_string()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&FormatValue> {
        self.fields.get(key)
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.fields.get(key) {
            Some(FormatValue::Int32(v)) => Some(*v),
            Some(FormatValue::Int64(v)) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.fields.get(key) {
            Some(FormatValue::Int64(v)) => Some(*v),
            Some(FormatValue::Int32(v)) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.fields.get(key) {
            Some(FormatValue::Float(v)) => Some(*v),
            Some(FormatValue::Int32(v)) => Some(*v as f64),
            Some(FormatValue::Int64(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(FormatValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn mime(&self) -> Option<&str> {
        self.get_str(keys::MIME)
    }

    /// Mime type is mandatory on every source format (the only field the
    /// engine itself interprets on all tracks).
    pub fn require_mime(&self) -> Result<&str> {
        self.mime()
            .ok_or(TranscodeError::InvalidTrackFormat(keys::MIME))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Overlay `self` on top of `defaults`: every field present in `self`
    /// wins, fields only present in `defaults` are filled in.
    pub fn merged_over(&self, defaults: &TrackFormat) -> TrackFormat {
        let mut merged = defaults.clone();
        for (k, v) in &self.fields {
            merged.fields.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// Engine defaults merged under a client-supplied destination format before
/// an encoder is constructed.
pub fn default_destination(source: &TrackFormat) -> TrackFormat {
    let mut defaults = TrackFormat::new();
    if let Some(mime) = source.mime() {
        defaults.set_str(keys::MIME, mime);
        if mime.starts_with("video/") {
            defaults.set_i32(keys::BITRATE, DEFAULT_VIDEO_BITRATE);
        }
    }
    // Dimensions, rates and counts carry over unless overridden.
    for key in [
        keys::WIDTH,
        keys::HEIGHT,
        keys::FRAME_RATE,
        keys::SAMPLE_RATE,
        keys::CHANNEL_COUNT,
        keys::DURATION_US,
    ] {
        if let Some(v) = source.get(key) {
            defaults.fields.insert(key.to_string(), v.clone());
        }
    }
    defaults
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_coerce_integers() {
        let mut f = TrackFormat::with_mime("video/avc");
        f.set_i32(keys::BITRATE, 8_000_000);
        f.set_i64(keys::DURATION_US, 5_000_000);

        assert_eq!(f.mime(), Some("video/avc"));
        assert_eq!(f.get_i64(keys::BITRATE), Some(8_000_000));
        assert_eq!(f.get_i32(keys::DURATION_US), Some(5_000_000));
        assert_eq!(f.get_f64(keys::BITRATE), Some(8_000_000.0));
        assert_eq!(f.get_str(keys::BITRATE), None);
    }

    #[test]
    fn missing_mime_is_rejected() {
        let f = TrackFormat::new();
        assert!(matches!(
            f.require_mime(),
            Err(TranscodeError::InvalidTrackFormat(k)) if k == keys::MIME
        ));
    }

    #[test]
    fn merge_prefers_override() {
        let mut src = TrackFormat::with_mime("video/avc");
        src.set_i32(keys::WIDTH, 1920);
        src.set_i32(keys::HEIGHT, 1080);
        src.set_f64(keys::FRAME_RATE, 30.0);

        let defaults = default_destination(&src);
        assert_eq!(defaults.get_i32(keys::BITRATE), Some(DEFAULT_VIDEO_BITRATE));

        let mut requested = TrackFormat::new();
        requested.set_i32(keys::BITRATE, 4_000_000);
        let merged = requested.merged_over(&defaults);

        assert_eq!(merged.get_i32(keys::BITRATE), Some(4_000_000));
        assert_eq!(merged.get_i32(keys::WIDTH), Some(1920));
        assert_eq!(merged.mime(), Some("video/avc"));
    }

    #[test]
    fn audio_defaults_have_no_bitrate() {
        let src = TrackFormat::with_mime("audio/mp4a-latm");
        let defaults = default_destination(&src);
        assert_eq!(defaults.get_i32(keys::BITRATE), None);
        assert_eq!(defaults.mime(), Some("audio/mp4a-latm"));
    }
}
