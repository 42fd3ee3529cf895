use tokio_util::sync::CancellationToken;

use crate::{
    decoder::{Decoder, DecoderTask},
    encoder::{Encoder, EncoderTask},
    error::TranscodeError,
    format::TrackFormat,
    sample::{SampleCmd, SampleSender},
    sink::{SinkCmd, SinkSender},
};

/// Reports from pipeline workers and the sink writer to the session actor.
pub enum PipelineMsg {
    /// Overall per-track percent increased.
    Progress {
        track: usize,
        percent: u32,
        samples_written: u64,
    },
    /// Sample committed without a percent change; keeps pause checkpoints
    /// current.
    Wrote { track: usize, samples_written: u64 },
    /// Track reached end of stream at the destination.
    Eos { track: usize },
    /// Destination finalized; every included track is complete.
    Finalized,
    /// First unrecoverable failure anywhere in the session.
    Failed(TranscodeError),
}

/// Queue sizing between stages. Samples are small and bursty, raw frames are
/// large; both bound memory and carry backpressure to the demuxer.
const SAMPLE_CHAN_CAP: usize = 64;
const FRAME_CHAN_CAP: usize = 16;

/// One track's worth of moving machinery: either a passthrough forwarder or
/// a decode-then-encode chain, with its tail feeding the shared sink writer.
/// Stopping is cooperative, at sample boundaries.
pub struct TrackPipeline {
    track: usize,
    cancel: CancellationToken,
    decoder: Option<DecoderTask>,
    encoder: Option<EncoderTask>,
}

impl TrackPipeline {
    /// Passthrough: compressed samples are forwarded to the destination
    /// bit-identical, timestamps preserved.
    pub fn passthrough(track: usize, sink: SinkSender) -> (Self, SampleSender) {
        let (tx, mut rx) = tokio::sync::mpsc::channel(SAMPLE_CHAN_CAP);
        let cancel = CancellationToken::new();

        let forward_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forward_cancel.cancelled() => {
                        log::info!("passthrough cancelled, track {track}");
                        break;
                    }
                    cmd = rx.recv() => match cmd {
                        Some(SampleCmd::Data(sample)) => {
                            if sink.send(SinkCmd::Write(sample)).await.is_err() {
                                break;
                            }
                        }
                        Some(SampleCmd::Eof) => {
                            log::debug!("passthrough eof, track {track}");
                            let _ = sink.send(SinkCmd::Eos { track }).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        });

        (
            Self {
                track,
                cancel,
                decoder: None,
                encoder: None,
            },
            tx,
        )
    }

    /// Transcode: decode, then re-encode with `dest_format` (already merged
    /// over engine defaults). Decode and encode run on separate workers
    /// connected by a bounded frame queue so the two stages overlap. Codecs
    /// are constructed by the caller before anything is spawned.
    pub fn transcode(
        track: usize,
        decoder: Box<dyn Decoder>,
        encoder: Box<dyn Encoder>,
        source_format: &TrackFormat,
        dest_format: &TrackFormat,
        sink: SinkSender,
        report: tokio::sync::mpsc::Sender<PipelineMsg>,
    ) -> (Self, SampleSender) {
        let (sample_tx, sample_rx) = tokio::sync::mpsc::channel(SAMPLE_CHAN_CAP);
        let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(FRAME_CHAN_CAP);

        let decoder_task = DecoderTask::new();
        decoder_task.start(track, decoder, sample_rx, frame_tx, report.clone());

        let encoder_task = EncoderTask::new();
        encoder_task.start(
            track,
            encoder,
            source_format.clone(),
            dest_format.clone(),
            frame_rx,
            sink,
            report,
        );

        (
            Self {
                track,
                cancel: CancellationToken::new(),
                decoder: Some(decoder_task),
                encoder: Some(encoder_task),
            },
            sample_tx,
        )
    }

    pub fn track(&self) -> usize {
        self.track
    }

    /// Signal every worker of this pipeline to stop at its next sample
    /// boundary.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(d) = &self.decoder {
            d.stop();
        }
        if let Some(e) = &self.encoder {
            e.stop();
        }
    }
}

impl Drop for TrackPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
