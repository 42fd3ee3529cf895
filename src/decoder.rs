use tokio_util::sync::CancellationToken;

use crate::{
    error::{Result, TranscodeError},
    frame::{FrameCmd, FrameSender, RawFrame},
    pipeline::PipelineMsg,
    sample::{Sample, SampleCmd, SampleReceiver},
};

/// Codec decode collaborator. Push/pull contract: `send_sample` then drain
/// `receive_frame` until `None` (the codec may buffer and return nothing for
/// a while); at end of stream `send_eof` then drain the remaining frames.
pub trait Decoder: Send {
    fn send_sample(&mut self, sample: &Sample) -> Result<()>;
    fn receive_frame(&mut self) -> Result<Option<RawFrame>>;
    fn send_eof(&mut self) -> Result<()>;
}

/// Decode stage worker for one track: a blocking loop pulling compressed
/// samples off the track's bounded queue and pushing raw frames toward the
/// encoder. Exits after forwarding `Eof`, on cancel, or when either side of
/// the chain goes away.
pub struct DecoderTask {
    cancel: CancellationToken,
}

impl DecoderTask {
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
        decoder: Box<dyn Decoder>,
        rx: SampleReceiver,
        tx: FrameSender,
        report: tokio::sync::mpsc::Sender<PipelineMsg>,
    ) {
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = Self::decode_loop(track, decoder, rx, tx, &cancel) {
                log::error!("decode loop failed on track {track}: {e}");
                let _ = report.blocking_send(PipelineMsg::Failed(e));
            }
        });
    }

    fn decode_loop(
        track: usize,
        mut decoder: Box<dyn Decoder>,
        mut rx: SampleReceiver,
        tx: FrameSender,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let failure = |e: TranscodeError| TranscodeError::DecodeFailure {
            track,
            message: e.to_string(),
        };

        while let Some(cmd) = rx.blocking_recv() {
            if cancel.is_cancelled() {
                log::info!("decoder cancelled, track {track}");
                return Ok(());
            }
            match cmd {
                SampleCmd::Data(sample) => {
                    decoder.send_sample(&sample).map_err(failure)?;
                    if !Self::drain(&mut decoder, &tx).map_err(failure)? {
                        return Ok(());
                    }
                }
                SampleCmd::Eof => {
                    decoder.send_eof().map_err(failure)?;
                    if Self::drain(&mut decoder, &tx).map_err(failure)? {
                        log::debug!("decoder eof, track {track}");
                        let _ = tx.blocking_send(FrameCmd::Eof);
                    }
                    return Ok(());
                }
            }
        }
        // Upstream dropped without Eof: teardown in progress.
        Ok(())
    }

    /// Forward every frame the decoder has ready. Returns false when the
    /// encoder side is gone.
    fn drain(decoder: &mut Box<dyn Decoder>, tx: &FrameSender) -> Result<bool> {
        while let Some(frame) = decoder.receive_frame()? {
            if tx.blocking_send(FrameCmd::Data(frame)).is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Drop for DecoderTask {
    fn drop(&mut self) {
        self.stop();
    }
}
