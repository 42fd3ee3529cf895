use bytes::Bytes;

pub type SampleSender = tokio::sync::mpsc::Sender<SampleCmd>;
pub type SampleReceiver = tokio::sync::mpsc::Receiver<SampleCmd>;

/// One compressed sample on the wire between stages. `Eof` marks the end of
/// the track's stream.
#[derive(Clone)]
pub enum SampleCmd {
    Data(Sample),
    Eof,
}

/// A compressed sample with its presentation timestamp in microseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub track: usize,
    pub data: Bytes,
    pub pts_us: i64,
    pub duration_us: i64,
    pub key: bool,
}

impl Sample {
    pub fn new(track: usize, data: Bytes, pts_us: i64) -> Self {
        Self {
            track,
            data,
            pts_us,
            duration_us: 0,
            key: false,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}
