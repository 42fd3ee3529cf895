use bytes::Bytes;

pub type FrameSender = tokio::sync::mpsc::Sender<FrameCmd>;
pub type FrameReceiver = tokio::sync::mpsc::Receiver<FrameCmd>;

#[derive(Clone)]
pub enum FrameCmd {
    Data(RawFrame),
    Eof,
}

/// One decoded (raw) frame between the decode and encode stages.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub track: usize,
    pub data: Bytes,
    pub pts_us: i64,
}

impl RawFrame {
    pub fn new(track: usize, data: Bytes, pts_us: i64) -> Self {
        Self { track, data, pts_us }
    }
}
