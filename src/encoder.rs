use tokio_util::sync::CancellationToken;

use crate::{
    error::{Result, TranscodeError},
    format::{TrackFormat, keys},
    frame::{FrameCmd, FrameReceiver, RawFrame},
    pipeline::PipelineMsg,
    sample::Sample,
    sink::{SinkCmd, SinkSender},
};

/// Codec encode collaborator, same push/pull contract as
/// [`crate::decoder::Decoder`]: `send_frame` then drain `receive_sample`
/// until `None`; at end of stream `send_eof` then drain whatever the encoder
/// buffered before its own end-of-stream.
pub trait Encoder: Send {
    fn send_frame(&mut self, frame: &RawFrame) -> Result<()>;
    fn receive_sample(&mut self) -> Result<Option<Sample>>;
    fn send_eof(&mut self) -> Result<()>;
}

/// Constructs codecs for the session. `supports` gates
/// track configuration: an included transcode track with a mime the factory
/// does not support fails configuration before any pipeline exists.
pub trait CodecFactory: Send + Sync {
    fn supports(&self, mime: &str) -> bool;
    fn new_decoder(&self, source: &TrackFormat) -> Result<Box<dyn Decoder>>;
    fn new_encoder(&self, source: &TrackFormat, dest: &TrackFormat) -> Result<Box<dyn Encoder>>;
}

pub use crate::decoder::Decoder;

/// Rebase of output timestamps when the destination frame rate differs from
/// the source: output pts becomes a clean `index / rate` ramp, matching the
/// encoder's actual output timing.
struct PtsRebase {
    per_frame_us: i64,
    next_index: i64,
}

impl PtsRebase {
    /// Only rebases when both rates are known and differ.
    fn for_rates(source: &TrackFormat, dest: &TrackFormat) -> Option<Self> {
        let src_rate = source.get_f64(keys::FRAME_RATE)?;
        let dst_rate = dest.get_f64(keys::FRAME_RATE)?;
        if dst_rate <= 0.0 || (src_rate - dst_rate).abs() < f64::EPSILON {
            return None;
        }
        Some(Self {
            per_frame_us: (1_000_000.0 / dst_rate) as i64,
            next_index: 0,
        })
    }

    fn apply(&mut self, sample: &mut Sample) {
        sample.pts_us = self.next_index * self.per_frame_us;
        sample.duration_us = self.per_frame_us;
        self.next_index += 1;
    }
}

/// Encode stage worker for one track: raw frames in, compressed samples out
/// to the sink writer, flushing the codec at end of stream before emitting
/// the track's own `Eos`.
pub struct EncoderTask {
    cancel: CancellationToken,
}

impl EncoderTask {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn start(
        &self,
        track: usize,
        encoder: Box<dyn Encoder>,
        source_format: TrackFormat,
        dest_format: TrackFormat,
        rx: FrameReceiver,
        sink: SinkSender,
        report: tokio::sync::mpsc::Sender<PipelineMsg>,
    ) {
        let cancel = self.cancel.clone();
        let rebase = PtsRebase::for_rates(&source_format, &dest_format);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = Self::encode_loop(track, encoder, rebase, rx, sink, &cancel) {
                log::error!("encode loop failed on track {track}: {e}");
                let _ = report.blocking_send(PipelineMsg::Failed(e));
            }
        });
    }

    fn encode_loop(
        track: usize,
        mut encoder: Box<dyn Encoder>,
        mut rebase: Option<PtsRebase>,
        mut rx: FrameReceiver,
        sink: SinkSender,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let failure = |e: TranscodeError| TranscodeError::EncodeFailure {
            track,
            message: e.to_string(),
        };

        while let Some(cmd) = rx.blocking_recv() {
            if cancel.is_cancelled() {
                log::info!("encoder cancelled, track {track}");
                return Ok(());
            }
            match cmd {
                FrameCmd::Data(frame) => {
                    encoder.send_frame(&frame).map_err(failure)?;
                    if !Self::drain(track, &mut encoder, &mut rebase, &sink).map_err(failure)? {
                        return Ok(());
                    }
                }
                FrameCmd::Eof => {
                    encoder.send_eof().map_err(failure)?;
                    if Self::drain(track, &mut encoder, &mut rebase, &sink).map_err(failure)? {
                        log::debug!("encoder eof, track {track}");
                        let _ = sink.blocking_send(SinkCmd::Eos { track });
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn drain(
        track: usize,
        encoder: &mut Box<dyn Encoder>,
        rebase: &mut Option<PtsRebase>,
        sink: &SinkSender,
    ) -> Result<bool> {
        while let Some(mut sample) = encoder.receive_sample()? {
            sample.track = track;
            if let Some(rebase) = rebase {
                rebase.apply(&mut sample);
            }
            if sink.blocking_send(SinkCmd::Write(sample)).is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Drop for EncoderTask {
    fn drop(&mut self) {
        self.stop();
    }
}
