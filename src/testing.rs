//! In-memory collaborators: a scriptable source, a recording sink, and stub
//! codecs. They back this crate's own tests and give downstream crates a way
//! to exercise session logic without a real container or codec stack.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::{
    decoder::Decoder,
    encoder::{CodecFactory, Encoder},
    error::{Result, TranscodeError},
    format::{TrackFormat, keys},
    frame::RawFrame,
    sample::Sample,
    sink::MediaSink,
    source::MediaSource,
    track::TrackInfo,
};

/// Build a video source format: `count` samples at `fps`, 33-byte payloads
/// seeded per sample so passthrough bit-identity is checkable.
pub fn video_format(width: i32, height: i32, fps: f64, count: i64) -> TrackFormat {
    let mut f = TrackFormat::with_mime("video/avc");
    f.set_i32(keys::WIDTH, width);
    f.set_i32(keys::HEIGHT, height);
    f.set_f64(keys::FRAME_RATE, fps);
    f.set_i64(keys::FRAME_COUNT, count);
    f.set_i64(keys::DURATION_US, ((count as f64 / fps) * 1_000_000.0) as i64);
    f
}

pub fn audio_format(sample_rate: i32, channels: i32, duration_us: i64) -> TrackFormat {
    let mut f = TrackFormat::with_mime("audio/mp4a-latm");
    f.set_i32(keys::SAMPLE_RATE, sample_rate);
    f.set_i32(keys::CHANNEL_COUNT, channels);
    f.set_i64(keys::DURATION_US, duration_us);
    f
}

/// Evenly spaced samples for one track, payload derived from the indices so
/// every sample is distinct.
pub fn make_samples(track: usize, count: usize, interval_us: i64) -> Vec<Sample> {
    (0..count)
        .map(|i| {
            let payload: Vec<u8> = (0..33u8).map(|b| b ^ (i as u8) ^ (track as u8)).collect();
            let mut s = Sample::new(track, Bytes::from(payload), i as i64 * interval_us);
            s.duration_us = interval_us;
            s.key = i % 10 == 0;
            s
        })
        .collect()
}

/// Scriptable demuxer: tracks are added with their sample lists and read
/// back interleaved by pts, the way a container would hand them out.
pub struct MemorySource {
    tracks: Vec<TrackInfo>,
    queue: VecDeque<Sample>,
    fail_after: Option<usize>,
    read: usize,
    read_delay: Option<std::time::Duration>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            queue: VecDeque::new(),
            fail_after: None,
            read: 0,
            read_delay: None,
        }
    }

    /// Slow the demux loop down; read_sample runs on a blocking worker, so
    /// tests can open race windows without touching engine code.
    pub fn delay_per_read(&mut self, delay: std::time::Duration) {
        self.read_delay = Some(delay);
    }

    pub fn add_track(&mut self, format: TrackFormat, mut samples: Vec<Sample>) -> usize {
        let index = self.tracks.len();
        for s in &mut samples {
            s.track = index;
        }
        self.tracks.push(TrackInfo { index, format });

        // Merge into the queue keeping global pts order (stable for ties).
        let mut merged = Vec::with_capacity(self.queue.len() + samples.len());
        let mut old = std::mem::take(&mut self.queue).into_iter().peekable();
        let mut new = samples.into_iter().peekable();
        loop {
            match (old.peek(), new.peek()) {
                (Some(a), Some(b)) => {
                    if b.pts_us < a.pts_us {
                        merged.push(new.next().unwrap());
                    } else {
                        merged.push(old.next().unwrap());
                    }
                }
                (Some(_), None) => merged.push(old.next().unwrap()),
                (None, Some(_)) => merged.push(new.next().unwrap()),
                (None, None) => break,
            }
        }
        self.queue = merged.into();
        index
    }

    /// Fail the nth read with a demux error.
    pub fn fail_after(&mut self, reads: usize) {
        self.fail_after = Some(reads);
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaSource for MemorySource {
    fn tracks(&self) -> Vec<TrackInfo> {
        self.tracks.clone()
    }

    fn read_sample(&mut self) -> Result<Option<Sample>> {
        if let Some(delay) = self.read_delay {
            std::thread::sleep(delay);
        }
        if let Some(limit) = self.fail_after {
            if self.read >= limit {
                return Err(TranscodeError::SourceFailure {
                    track: usize::MAX,
                    message: "injected demux failure".to_string(),
                });
            }
        }
        self.read += 1;
        Ok(self.queue.pop_front())
    }
}

#[derive(Default)]
struct SinkInner {
    tracks: Vec<TrackFormat>,
    samples: HashMap<usize, Vec<Sample>>,
    finalized: bool,
}

/// Shared view on what a [`MemorySink`] received; stays valid after the
/// session is gone.
#[derive(Clone, Default)]
pub struct SinkRecord {
    inner: Arc<Mutex<SinkInner>>,
}

impl SinkRecord {
    pub fn track_count(&self) -> usize {
        self.inner.lock().unwrap().tracks.len()
    }

    pub fn track_format(&self, sink_index: usize) -> Option<TrackFormat> {
        self.inner.lock().unwrap().tracks.get(sink_index).cloned()
    }

    pub fn samples(&self, sink_index: usize) -> Vec<Sample> {
        self.inner
            .lock()
            .unwrap()
            .samples
            .get(&sink_index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_samples(&self) -> usize {
        self.inner.lock().unwrap().samples.values().map(Vec::len).sum()
    }

    pub fn finalized(&self) -> bool {
        self.inner.lock().unwrap().finalized
    }
}

/// Recording muxer. Enforces the real muxer contract: tracks registered
/// before writes, no writes after finalize, finalize once.
pub struct MemorySink {
    record: SinkRecord,
    fail_write_at: Option<usize>,
    fail_add_track: bool,
    writes: usize,
}

impl MemorySink {
    pub fn new() -> (Self, SinkRecord) {
        let record = SinkRecord::default();
        (
            Self {
                record: record.clone(),
                fail_write_at: None,
                fail_add_track: false,
                writes: 0,
            },
            record,
        )
    }

    /// Fail the nth write with a mux error.
    pub fn fail_write_at(&mut self, write: usize) {
        self.fail_write_at = Some(write);
    }

    pub fn fail_add_track(&mut self) {
        self.fail_add_track = true;
    }
}

impl MediaSink for MemorySink {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize> {
        if self.fail_add_track {
            return Err(TranscodeError::MuxFailure(
                "injected add_track failure".to_string(),
            ));
        }
        let mut inner = self.record.inner.lock().unwrap();
        if inner.finalized {
            return Err(TranscodeError::MuxFailure("sink finalized".to_string()));
        }
        inner.tracks.push(format.clone());
        Ok(inner.tracks.len() - 1)
    }

    fn write_sample(&mut self, track: usize, sample: &Sample) -> Result<()> {
        if let Some(limit) = self.fail_write_at {
            if self.writes >= limit {
                return Err(TranscodeError::MuxFailure(
                    "injected write failure".to_string(),
                ));
            }
        }
        self.writes += 1;
        let mut inner = self.record.inner.lock().unwrap();
        if inner.finalized {
            return Err(TranscodeError::MuxFailure("write after finalize".to_string()));
        }
        if track >= inner.tracks.len() {
            return Err(TranscodeError::MuxFailure(format!(
                "write to unregistered track {track}"
            )));
        }
        inner.samples.entry(track).or_default().push(sample.clone());
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let mut inner = self.record.inner.lock().unwrap();
        if inner.finalized {
            return Err(TranscodeError::MuxFailure("finalize twice".to_string()));
        }
        inner.finalized = true;
        Ok(())
    }
}

/// Pass-the-payload decoder with a configurable reorder buffer so the
/// EOS flush path actually has something to flush.
pub struct StubDecoder {
    buffered: VecDeque<RawFrame>,
    hold: usize,
    eof: bool,
    fail_after: Option<usize>,
    seen: usize,
}

impl StubDecoder {
    pub fn new(hold: usize) -> Self {
        Self {
            buffered: VecDeque::new(),
            hold,
            eof: false,
            fail_after: None,
            seen: 0,
        }
    }

    pub fn fail_after(mut self, samples: usize) -> Self {
        self.fail_after = Some(samples);
        self
    }
}

impl Decoder for StubDecoder {
    fn send_sample(&mut self, sample: &Sample) -> Result<()> {
        if let Some(limit) = self.fail_after {
            if self.seen >= limit {
                return Err(TranscodeError::DecodeFailure {
                    track: sample.track,
                    message: "injected decode failure".to_string(),
                });
            }
        }
        self.seen += 1;
        self.buffered
            .push_back(RawFrame::new(sample.track, sample.data.clone(), sample.pts_us));
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.eof || self.buffered.len() > self.hold {
            Ok(self.buffered.pop_front())
        } else {
            Ok(None)
        }
    }

    fn send_eof(&mut self) -> Result<()> {
        self.eof = true;
        Ok(())
    }
}

/// Buffering encoder; emitted samples keep the frame payload and pts so
/// tests can check ordering and flush completeness.
pub struct StubEncoder {
    buffered: VecDeque<Sample>,
    hold: usize,
    eof: bool,
}

impl StubEncoder {
    pub fn new(hold: usize) -> Self {
        Self {
            buffered: VecDeque::new(),
            hold,
            eof: false,
        }
    }
}

impl Encoder for StubEncoder {
    fn send_frame(&mut self, frame: &RawFrame) -> Result<()> {
        let mut sample = Sample::new(frame.track, frame.data.clone(), frame.pts_us);
        sample.key = true;
        self.buffered.push_back(sample);
        Ok(())
    }

    fn receive_sample(&mut self) -> Result<Option<Sample>> {
        if self.eof || self.buffered.len() > self.hold {
            Ok(self.buffered.pop_front())
        } else {
            Ok(None)
        }
    }

    fn send_eof(&mut self) -> Result<()> {
        self.eof = true;
        Ok(())
    }
}

/// Factory for the stubs. Records every encoder construction so tests can
/// assert the destination parameters (defaults merged under overrides) that
/// actually reached the codec.
pub struct StubCodecs {
    supported: Vec<String>,
    decoder_hold: usize,
    encoder_hold: usize,
    decoder_fail_after: Option<usize>,
    pub encoder_formats: Arc<Mutex<Vec<(TrackFormat, TrackFormat)>>>,
}

impl StubCodecs {
    pub fn new() -> Self {
        Self {
            supported: vec!["video/avc".to_string(), "audio/mp4a-latm".to_string()],
            decoder_hold: 2,
            encoder_hold: 2,
            decoder_fail_after: None,
            encoder_formats: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn supporting(mimes: &[&str]) -> Self {
        let mut c = Self::new();
        c.supported = mimes.iter().map(|m| m.to_string()).collect();
        c
    }

    pub fn decoder_fail_after(mut self, samples: usize) -> Self {
        self.decoder_fail_after = Some(samples);
        self
    }
}

impl Default for StubCodecs {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecFactory for StubCodecs {
    fn supports(&self, mime: &str) -> bool {
        self.supported.iter().any(|m| m == mime)
    }

    fn new_decoder(&self, source: &TrackFormat) -> Result<Box<dyn Decoder>> {
        let mime = source.require_mime()?;
        if !self.supports(mime) {
            return Err(TranscodeError::UnsupportedMime(mime.to_string()));
        }
        let mut decoder = StubDecoder::new(self.decoder_hold);
        if let Some(limit) = self.decoder_fail_after {
            decoder = decoder.fail_after(limit);
        }
        Ok(Box::new(decoder))
    }

    fn new_encoder(&self, source: &TrackFormat, dest: &TrackFormat) -> Result<Box<dyn Encoder>> {
        let mime = dest.require_mime()?;
        if !self.supports(mime) {
            return Err(TranscodeError::UnsupportedMime(mime.to_string()));
        }
        self.encoder_formats
            .lock()
            .unwrap()
            .push((source.clone(), dest.clone()));
        Ok(Box::new(StubEncoder::new(self.encoder_hold)))
    }
}
