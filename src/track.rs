use crate::format::{TrackFormat, keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
    Other,
}

impl TrackKind {
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("video/") {
            TrackKind::Video
        } else if mime.starts_with("audio/") {
            TrackKind::Audio
        } else {
            TrackKind::Other
        }
    }
}

/// Source-side snapshot of one elementary stream, produced by the demuxer.
///
/// `format` always carries `mime`; video tracks carry `frame-count` and
/// `frame-rate` when the container knows them, and any track may carry
/// `durationUs`.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub index: usize,
    pub format: TrackFormat,
}

impl TrackInfo {
    pub fn kind(&self) -> TrackKind {
        self.format.mime().map(TrackKind::from_mime).unwrap_or(TrackKind::Other)
    }

    pub fn is_video(&self) -> bool {
        self.kind() == TrackKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind() == TrackKind::Audio
    }

    pub fn duration_us(&self) -> Option<i64> {
        self.format.get_i64(keys::DURATION_US)
    }

    pub fn frame_count(&self) -> Option<i64> {
        self.format.get_i64(keys::FRAME_COUNT)
    }
}

/// Per-track configuration snapshot exposed to clients.
///
/// `destination` is only meaningful while `included` is true: `Some` means
/// transcode with those parameters merged over engine defaults, `None` means
/// passthrough copy.
#[derive(Debug, Clone)]
pub struct TrackDescriptor {
    pub index: usize,
    pub mime: String,
    pub source_format: TrackFormat,
    pub included: bool,
    pub destination: Option<TrackFormat>,
}

impl TrackDescriptor {
    pub fn passthrough(&self) -> bool {
        self.included && self.destination.is_none()
    }
}
