use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::{
    arbiter::PauseGate,
    error::{Result, TranscodeError},
    pipeline::PipelineMsg,
    sample::{Sample, SampleCmd, SampleSender},
    track::TrackInfo,
};

/// Container demuxer collaborator. Samples arrive container-interleaved
/// across tracks; `read_sample` returning `Ok(None)` means the whole source
/// is exhausted.
pub trait MediaSource: Send {
    fn tracks(&self) -> Vec<TrackInfo>;
    fn read_sample(&mut self) -> Result<Option<Sample>>;
}

/// Demux loop for one session: reads interleaved samples on a blocking
/// worker and routes each to its track's pipeline over a bounded channel
/// (backpressure, no drops). Samples for tracks without a route (excluded
/// from the output) are discarded. On exhaustion every route gets one `Eof`.
///
/// The pause gate is observed between samples; a closed gate suspends
/// demuxing in place, and bounded queues drain downstream until every worker
/// idles.
pub struct SourceReaderTask {
    cancel: CancellationToken,
}

impl SourceReaderTask {
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
        source: Box<dyn MediaSource>,
        routes: HashMap<usize, SampleSender>,
        gate: PauseGate,
        report: tokio::sync::mpsc::Sender<PipelineMsg>,
    ) {
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || {
            Self::read_loop(source, routes, cancel, gate, report);
        });
    }

    fn read_loop(
        mut source: Box<dyn MediaSource>,
        routes: HashMap<usize, SampleSender>,
        cancel: CancellationToken,
        gate: PauseGate,
        report: tokio::sync::mpsc::Sender<PipelineMsg>,
    ) {
        loop {
            if cancel.is_cancelled() {
                log::info!("source reader cancelled");
                return;
            }
            if gate.is_closed() {
                gate.wait_open_blocking(&cancel);
                continue;
            }
            match source.read_sample() {
                Ok(Some(sample)) => {
                    if let Err(e) = Self::route(&routes, sample) {
                        // Receiver gone: downstream already stopped.
                        log::debug!("source reader: route closed: {e}");
                        return;
                    }
                }
                Ok(None) => {
                    log::info!("source exhausted, signalling eof to {} tracks", routes.len());
                    for tx in routes.values() {
                        let _ = tx.blocking_send(SampleCmd::Eof);
                    }
                    return;
                }
                Err(e) => {
                    log::error!("source read error: {e}");
                    let failure = match e {
                        e @ TranscodeError::SourceFailure { .. } => e,
                        other => TranscodeError::SourceFailure {
                            track: usize::MAX,
                            message: other.to_string(),
                        },
                    };
                    let _ = report.blocking_send(PipelineMsg::Failed(failure));
                    return;
                }
            }
        }
    }

    fn route(routes: &HashMap<usize, SampleSender>, sample: Sample) -> Result<()> {
        let Some(tx) = routes.get(&sample.track) else {
            // Track not included in the output.
            return Ok(());
        };
        tx.blocking_send(SampleCmd::Data(sample))
            .map_err(|_| TranscodeError::Closed)
    }
}

impl Drop for SourceReaderTask {
    fn drop(&mut self) {
        self.stop();
    }
}
