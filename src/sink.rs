use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::{
    error::{Result, TranscodeError},
    pipeline::PipelineMsg,
    sample::Sample,
};

/// Destination muxer collaborator. Tracks are registered up front with
/// `add_track`; `finalize` is called exactly once after every registered
/// track reached end of stream.
pub trait MediaSink: Send {
    fn add_track(&mut self, format: &crate::format::TrackFormat) -> Result<usize>;
    fn write_sample(&mut self, track: usize, sample: &Sample) -> Result<()>;
    fn finalize(&mut self) -> Result<()>;
}

pub type SinkSender = tokio::sync::mpsc::Sender<SinkCmd>;
pub type SinkReceiver = tokio::sync::mpsc::Receiver<SinkCmd>;

pub enum SinkCmd {
    /// Write one sample; `sample.track` is the source-side track index, the
    /// writer maps it to the sink-side index assigned by `add_track`.
    Write(Sample),
    Eos { track: usize },
}

/// Expected extent of one track, for progress accounting. Percent is derived
/// from pts against duration when known, falling back to sample count.
#[derive(Debug, Clone, Default)]
pub struct TrackExtent {
    pub duration_us: Option<i64>,
    pub sample_count: Option<i64>,
}

struct TrackWriteState {
    sink_index: usize,
    extent: TrackExtent,
    samples_written: u64,
    last_pts_us: i64,
    percent: u32,
    eos: bool,
}

/// Single-writer mux loop: the one task allowed to touch the `MediaSink`.
/// All pipeline tails feed it over one bounded channel, which is also what
/// serializes cross-track interleaving. Reports per-track progress, EOS, and
/// the finalize outcome to the session actor.
pub struct SinkWriterTask {
    cancel: CancellationToken,
    tx: SinkSender,
    rx: Option<SinkReceiver>,
}

impl SinkWriterTask {
    /// Write queue capacity; pipelines block here when the muxer is slower
    /// than the producers.
    const CHAN_CAP: usize = 256;

    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel(Self::CHAN_CAP);
        Self {
            cancel: CancellationToken::new(),
            tx,
            rx: Some(rx),
        }
    }

    pub fn sender(&self) -> SinkSender {
        self.tx.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// `tracks` maps source track index -> (sink track index, extent).
    pub fn start(
        &mut self,
        sink: Box<dyn MediaSink>,
        tracks: HashMap<usize, (usize, TrackExtent)>,
        report: tokio::sync::mpsc::Sender<PipelineMsg>,
    ) {
        let rx = self.rx.take().expect("sink writer started twice");
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || {
            Self::write_loop(sink, tracks, rx, cancel, report);
        });
    }

    fn write_loop(
        mut sink: Box<dyn MediaSink>,
        tracks: HashMap<usize, (usize, TrackExtent)>,
        mut rx: SinkReceiver,
        cancel: CancellationToken,
        report: tokio::sync::mpsc::Sender<PipelineMsg>,
    ) {
        let mut states: HashMap<usize, TrackWriteState> = tracks
            .into_iter()
            .map(|(track, (sink_index, extent))| {
                (
                    track,
                    TrackWriteState {
                        sink_index,
                        extent,
                        samples_written: 0,
                        last_pts_us: 0,
                        percent: 0,
                        eos: false,
                    },
                )
            })
            .collect();

        while let Some(cmd) = rx.blocking_recv() {
            if cancel.is_cancelled() {
                log::info!("sink writer cancelled");
                return;
            }
            match cmd {
                SinkCmd::Write(sample) => {
                    let Some(state) = states.get_mut(&sample.track) else {
                        log::warn!("sample for unregistered track {}", sample.track);
                        continue;
                    };
                    if let Err(e) = sink.write_sample(state.sink_index, &sample) {
                        log::error!("mux write error on track {}: {e}", sample.track);
                        let _ = report.blocking_send(PipelineMsg::Failed(
                            TranscodeError::MuxFailure(e.to_string()),
                        ));
                        return;
                    }
                    state.samples_written += 1;
                    state.last_pts_us = sample.pts_us.max(state.last_pts_us);
                    let percent = state.current_percent();
                    if percent > state.percent {
                        state.percent = percent;
                        let _ = report.blocking_send(PipelineMsg::Progress {
                            track: sample.track,
                            percent,
                            samples_written: state.samples_written,
                        });
                    } else {
                        // Checkpoint bookkeeping even when percent is flat.
                        let _ = report.try_send(PipelineMsg::Wrote {
                            track: sample.track,
                            samples_written: state.samples_written,
                        });
                    }
                }
                SinkCmd::Eos { track } => {
                    let Some(state) = states.get_mut(&track) else {
                        continue;
                    };
                    if state.eos {
                        continue;
                    }
                    state.eos = true;
                    state.percent = 100;
                    log::info!(
                        "track {track} eos after {} samples",
                        state.samples_written
                    );
                    let _ = report.blocking_send(PipelineMsg::Eos { track });
                    if states.values().all(|s| s.eos) {
                        break;
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        if !states.values().all(|s| s.eos) {
            // Producers went away without EOS: session is tearing down.
            log::debug!("sink writer: input closed before eos on all tracks");
            return;
        }

        match sink.finalize() {
            Ok(()) => {
                let _ = report.blocking_send(PipelineMsg::Finalized);
            }
            Err(e) => {
                log::error!("mux finalize error: {e}");
                let _ = report.blocking_send(PipelineMsg::Failed(TranscodeError::MuxFailure(
                    e.to_string(),
                )));
            }
        }
    }
}

impl TrackWriteState {
    fn current_percent(&self) -> u32 {
        if let Some(duration) = self.extent.duration_us.filter(|d| *d > 0) {
            let pct = (self.last_pts_us.max(0) as f64 / duration as f64) * 100.0;
            return (pct as u32).min(100);
        }
        if let Some(count) = self.extent.sample_count.filter(|c| *c > 0) {
            let pct = (self.samples_written as f64 / count as f64) * 100.0;
            return (pct as u32).min(100);
        }
        0
    }
}

impl Drop for SinkWriterTask {
    fn drop(&mut self) {
        self.stop();
    }
}
