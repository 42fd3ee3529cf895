use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    arbiter::{PauseGate, PauseToken, ResourceBroker, ResourceReclaim, TrackCheckpoint},
    decoder::Decoder,
    encoder::{CodecFactory, Encoder},
    error::{Result, TranscodeError},
    events::{Completion, EventSender, Events},
    format::{TrackFormat, default_destination, keys},
    pipeline::{PipelineMsg, TrackPipeline},
    sink::{MediaSink, SinkWriterTask, TrackExtent},
    source::{MediaSource, SourceReaderTask},
    track::{TrackDescriptor, TrackInfo},
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Observable lifecycle states. `Paused` is only reachable from `Running`
/// via resource arbitration; `Finished`, `Failed` and `Cancelled` are
/// terminal and a session is not reusable past them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Configured,
    Running,
    Paused,
    Finished,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Finished | SessionState::Failed | SessionState::Cancelled
        )
    }
}

/// Session tuning knobs.
#[derive(Clone)]
pub struct SessionConfig {
    /// How long a paused session waits for `resume` before failing with
    /// `Timeout`.
    pub grace_window: Duration,
    /// Resource broker to listen on while running; no broker means the
    /// session is never paused externally.
    pub broker: Option<ResourceBroker>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_secs(5),
            broker: None,
        }
    }
}

enum SessionCommand {
    ConfigureSource {
        source: Box<dyn MediaSource>,
        result: tokio::sync::oneshot::Sender<Result<()>>,
    },
    ConfigureDestination {
        sink: Box<dyn MediaSink>,
        result: tokio::sync::oneshot::Sender<Result<()>>,
    },
    TrackFormats {
        result: tokio::sync::oneshot::Sender<Result<Vec<TrackDescriptor>>>,
    },
    ConfigureTrack {
        index: usize,
        dest: Option<TrackFormat>,
        result: tokio::sync::oneshot::Sender<Result<()>>,
    },
    Start {
        result: tokio::sync::oneshot::Sender<Result<Completion>>,
    },
    Resume {
        token: Vec<u8>,
        result: tokio::sync::oneshot::Sender<Result<()>>,
    },
    State {
        result: tokio::sync::oneshot::Sender<SessionState>,
    },
}

/// One end-to-end transcoding operation from a single source to a single
/// destination.
///
/// All methods delegate to a session actor and return as soon as it has
/// processed the command; the transcoding outcome itself only ever arrives
/// through the [`Events`] stream and the [`Completion`] handle returned by
/// [`start`](Self::start). Dropping the handle cancels the session.
pub struct TranscodeSession {
    cancel: CancellationToken,
    tx: tokio::sync::mpsc::Sender<SessionCommand>,
}

impl TranscodeSession {
    const COMMAND_CAP: usize = 64;

    pub fn create(codecs: Arc<dyn CodecFactory>, config: SessionConfig) -> (Self, Events) {
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::mpsc::channel(Self::COMMAND_CAP);
        let (events, stream) = EventSender::channel();

        let actor_cancel = cancel.clone();
        tokio::spawn(async move {
            SessionActor::new(codecs, config, events).run(actor_cancel, rx).await;
        });

        (Self { cancel, tx }, stream)
    }

    /// Bind the demuxable source. Fails with `InvalidSource` if it exposes
    /// no tracks, `InvalidState` once started.
    pub async fn configure_source(&self, source: Box<dyn MediaSource>) -> Result<()> {
        self.call(|result| SessionCommand::ConfigureSource { source, result })
            .await?
    }

    /// Bind the destination sink. Fails with `InvalidState` once started.
    pub async fn configure_destination(&self, sink: Box<dyn MediaSink>) -> Result<()> {
        self.call(|result| SessionCommand::ConfigureDestination { sink, result })
            .await?
    }

    /// Snapshot of every source track with its current configuration.
    pub async fn track_formats(&self) -> Result<Vec<TrackDescriptor>> {
        self.call(|result| SessionCommand::TrackFormats { result })
            .await?
    }

    /// Include track `index` in the output: `None` copies samples unchanged
    /// (passthrough), `Some` transcodes with the given parameters merged
    /// over engine defaults. Tracks never configured are excluded.
    pub async fn configure_track(&self, index: usize, dest: Option<TrackFormat>) -> Result<()> {
        self.call(|result| SessionCommand::ConfigureTrack { index, dest, result })
            .await?
    }

    /// Spawn one pipeline per included track and begin transcoding. On any
    /// unmet prerequisite fails with `StartFailure` and spawns nothing. The
    /// returned [`Completion`] resolves with the terminal outcome.
    pub async fn start(&self) -> Result<Completion> {
        self.call(|result| SessionCommand::Start { result }).await?
    }

    /// Request cancellation. Pipelines stop at their next sample boundary;
    /// a `Cancelled` acknowledgement is the terminal event unless another
    /// terminal event already won. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resume a session paused by resource reclamation, using the token from
    /// the `ResourceLost` event.
    pub async fn resume(&self, token: &[u8]) -> Result<()> {
        let token = token.to_vec();
        self.call(|result| SessionCommand::Resume { token, result })
            .await?
    }

    pub async fn state(&self) -> Result<SessionState> {
        self.call(|result| SessionCommand::State { result }).await
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(tokio::sync::oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| TranscodeError::Closed)?;
        rx.await.map_err(|_| TranscodeError::Closed)
    }
}

impl Drop for TranscodeSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct TrackRunState {
    percent: u32,
    samples_written: u64,
    eos: bool,
}

struct SessionActor {
    id: u64,
    state: SessionState,
    config: SessionConfig,
    codecs: Arc<dyn CodecFactory>,
    events: EventSender,

    source: Option<Box<dyn MediaSource>>,
    tracks: Vec<TrackInfo>,
    sink: Option<Box<dyn MediaSink>>,
    /// Included tracks: source index -> destination override (None =
    /// passthrough). Insertion order does not matter; output track order
    /// follows source index order.
    selections: HashMap<usize, Option<TrackFormat>>,

    gate: PauseGate,
    reader: Option<SourceReaderTask>,
    sink_task: Option<SinkWriterTask>,
    pipelines: Vec<TrackPipeline>,

    report_tx: tokio::sync::mpsc::Sender<PipelineMsg>,
    report_rx: tokio::sync::mpsc::Receiver<PipelineMsg>,

    run_state: HashMap<usize, TrackRunState>,
    emitted_percent: u32,
    grace_deadline: Option<Instant>,
}

impl SessionActor {
    /// Report queue between workers and the actor. Large enough that
    /// blocking reports never stall a healthy session.
    const REPORT_CAP: usize = 256;

    fn new(codecs: Arc<dyn CodecFactory>, config: SessionConfig, events: EventSender) -> Self {
        let (report_tx, report_rx) = tokio::sync::mpsc::channel(Self::REPORT_CAP);
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: SessionState::Created,
            config,
            codecs,
            events,
            source: None,
            tracks: Vec::new(),
            sink: None,
            selections: HashMap::new(),
            gate: PauseGate::new(),
            reader: None,
            sink_task: None,
            pipelines: Vec::new(),
            report_tx,
            report_rx,
            run_state: HashMap::new(),
            emitted_percent: 0,
            grace_deadline: None,
        }
    }

    async fn run(
        mut self,
        cancel: CancellationToken,
        mut rx: tokio::sync::mpsc::Receiver<SessionCommand>,
    ) {
        let mut broker_rx = self.config.broker.as_ref().map(|b| b.subscribe());
        let mut cancel_handled = false;

        loop {
            let deadline = self.grace_deadline;
            let arbitrable =
                matches!(self.state, SessionState::Running | SessionState::Paused);
            tokio::select! {
                _ = cancel.cancelled(), if !cancel_handled => {
                    cancel_handled = true;
                    self.handle_cancel();
                }
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    // Session handle dropped; cancellation already fired via
                    // its Drop, nothing left to serve.
                    None => break,
                },
                Some(msg) = self.report_rx.recv() => {
                    self.handle_report(msg);
                }
                _ = Self::recv_reclaim(&mut broker_rx), if arbitrable => {
                    self.handle_reclaim();
                }
                _ = Self::sleep_until_deadline(deadline), if deadline.is_some() => {
                    self.handle_grace_timeout();
                }
            }
        }
    }

    /// Resolves on the next reclaim signal; pends forever without a broker
    /// or once the broker is gone.
    async fn recv_reclaim(
        rx: &mut Option<tokio::sync::broadcast::Receiver<ResourceReclaim>>,
    ) -> ResourceReclaim {
        use tokio::sync::broadcast::error::RecvError;
        let Some(rx) = rx.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            match rx.recv().await {
                Ok(signal) => return signal,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return std::future::pending().await,
            }
        }
    }

    async fn sleep_until_deadline(deadline: Option<Instant>) {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::ConfigureSource { source, result } => {
                let _ = result.send(self.configure_source(source));
            }
            SessionCommand::ConfigureDestination { sink, result } => {
                let _ = result.send(self.configure_destination(sink));
            }
            SessionCommand::TrackFormats { result } => {
                let _ = result.send(self.track_formats());
            }
            SessionCommand::ConfigureTrack { index, dest, result } => {
                let _ = result.send(self.configure_track(index, dest));
            }
            SessionCommand::Start { result } => {
                let _ = result.send(self.start());
            }
            SessionCommand::Resume { token, result } => {
                let _ = result.send(self.resume(&token));
            }
            SessionCommand::State { result } => {
                let _ = result.send(self.state);
            }
        }
    }

    fn require_configurable(&self) -> Result<()> {
        match self.state {
            SessionState::Created | SessionState::Configured => Ok(()),
            other => Err(TranscodeError::InvalidState(other)),
        }
    }

    fn configure_source(&mut self, source: Box<dyn MediaSource>) -> Result<()> {
        self.require_configurable()?;
        let tracks = source.tracks();
        if tracks.is_empty() {
            return Err(TranscodeError::InvalidSource(
                "source exposes no demuxable tracks".to_string(),
            ));
        }
        log::info!("session {}: source configured, {} tracks", self.id, tracks.len());
        self.source = Some(source);
        self.tracks = tracks;
        self.selections.clear();
        self.state = SessionState::Configured;
        Ok(())
    }

    fn configure_destination(&mut self, sink: Box<dyn MediaSink>) -> Result<()> {
        self.require_configurable()?;
        log::info!("session {}: destination configured", self.id);
        self.sink = Some(sink);
        if self.source.is_some() {
            self.state = SessionState::Configured;
        }
        Ok(())
    }

    fn track_formats(&self) -> Result<Vec<TrackDescriptor>> {
        if self.source.is_none() {
            return Err(TranscodeError::InvalidState(self.state));
        }
        Ok(self
            .tracks
            .iter()
            .map(|t| {
                let selection = self.selections.get(&t.index);
                TrackDescriptor {
                    index: t.index,
                    mime: t.format.mime().unwrap_or_default().to_string(),
                    source_format: t.format.clone(),
                    included: selection.is_some(),
                    destination: selection.and_then(|d| d.clone()),
                }
            })
            .collect())
    }

    fn configure_track(&mut self, index: usize, dest: Option<TrackFormat>) -> Result<()> {
        self.require_configurable()?;
        if self.source.is_none() {
            return Err(TranscodeError::InvalidState(self.state));
        }
        let info = self
            .tracks
            .iter()
            .find(|t| t.index == index)
            .ok_or(TranscodeError::InvalidTrackIndex(index))?;
        let mime = info.format.require_mime()?.to_string();

        if let Some(dest) = &dest {
            Self::validate_dest_format(dest)?;
            // The merged destination keeps the source mime unless overridden.
            let target_mime = dest.mime().unwrap_or(&mime);
            if !self.codecs.supports(target_mime) {
                return Err(TranscodeError::UnsupportedMime(target_mime.to_string()));
            }
            if !self.codecs.supports(&mime) {
                // Transcoding also needs a decoder for the source.
                return Err(TranscodeError::UnsupportedMime(mime));
            }
        }

        log::info!(
            "session {}: track {index} included ({})",
            self.id,
            if dest.is_some() { "transcode" } else { "passthrough" }
        );
        self.selections.insert(index, dest);
        Ok(())
    }

    /// Destination formats are validated before any pipeline exists: numeric
    /// parameters the engine understands must be positive.
    fn validate_dest_format(dest: &TrackFormat) -> Result<()> {
        for key in [
            keys::BITRATE,
            keys::WIDTH,
            keys::HEIGHT,
            keys::SAMPLE_RATE,
            keys::CHANNEL_COUNT,
        ] {
            if dest.contains(key) && dest.get_i64(key).is_none_or(|v| v <= 0) {
                return Err(TranscodeError::InvalidTrackFormat(key));
            }
        }
        if dest.contains(keys::FRAME_RATE) && dest.get_f64(keys::FRAME_RATE).is_none_or(|v| v <= 0.0)
        {
            return Err(TranscodeError::InvalidTrackFormat(keys::FRAME_RATE));
        }
        Ok(())
    }

    /// Everything that can fail is done before anything is spawned: codec
    /// construction and destination track registration first, workers last.
    fn start(&mut self) -> Result<Completion> {
        if self.state != SessionState::Configured {
            return Err(TranscodeError::InvalidState(self.state));
        }
        if self.source.is_none() {
            return Err(TranscodeError::StartFailure("no source configured".into()));
        }
        if self.sink.is_none() {
            return Err(TranscodeError::StartFailure(
                "no destination configured".into(),
            ));
        }
        if self.selections.is_empty() {
            return Err(TranscodeError::StartFailure("no tracks included".into()));
        }

        let mut included: Vec<usize> = self.selections.keys().copied().collect();
        included.sort_unstable();

        // Phase 1: build codecs and output formats, nothing spawned yet.
        struct Plan {
            track: usize,
            output_format: TrackFormat,
            codecs: Option<(Box<dyn Decoder>, Box<dyn Encoder>)>,
            source_format: TrackFormat,
            dest_format: Option<TrackFormat>,
            extent: TrackExtent,
        }
        let mut plans = Vec::with_capacity(included.len());
        for &index in &included {
            let info = self
                .tracks
                .iter()
                .find(|t| t.index == index)
                .expect("selection for unknown track");
            let source_format = info.format.clone();
            let extent = TrackExtent {
                duration_us: info.duration_us(),
                sample_count: info.frame_count(),
            };
            match self.selections.get(&index).and_then(|d| d.clone()) {
                Some(requested) => {
                    let dest = requested.merged_over(&default_destination(&source_format));
                    let decoder = self
                        .codecs
                        .new_decoder(&source_format)
                        .map_err(|e| TranscodeError::StartFailure(e.to_string()))?;
                    let encoder = self
                        .codecs
                        .new_encoder(&source_format, &dest)
                        .map_err(|e| TranscodeError::StartFailure(e.to_string()))?;
                    plans.push(Plan {
                        track: index,
                        output_format: dest.clone(),
                        codecs: Some((decoder, encoder)),
                        source_format,
                        dest_format: Some(dest),
                        extent,
                    });
                }
                None => {
                    plans.push(Plan {
                        track: index,
                        output_format: source_format.clone(),
                        codecs: None,
                        source_format,
                        dest_format: None,
                        extent,
                    });
                }
            }
        }

        // Phase 2: register output tracks on the sink we still own. On
        // rejection the sink goes back so the caller is left with a clean
        // Configured session and nothing spawned.
        let mut sink = self.sink.take().expect("sink presence checked above");
        let mut sink_tracks: HashMap<usize, (usize, TrackExtent)> = HashMap::new();
        for plan in &plans {
            match sink.add_track(&plan.output_format) {
                Ok(sink_index) => {
                    sink_tracks.insert(plan.track, (sink_index, plan.extent.clone()));
                }
                Err(e) => {
                    self.sink = Some(sink);
                    return Err(TranscodeError::StartFailure(format!(
                        "destination rejected track {}: {e}",
                        plan.track
                    )));
                }
            }
        }

        // Phase 3: spawn. Sink writer first, then per-track pipelines, then
        // the demux reader that feeds them.
        let mut sink_task = SinkWriterTask::new();
        sink_task.start(sink, sink_tracks, self.report_tx.clone());

        let mut routes = HashMap::new();
        for plan in plans {
            let (pipeline, sample_tx) = match plan.codecs {
                Some((decoder, encoder)) => TrackPipeline::transcode(
                    plan.track,
                    decoder,
                    encoder,
                    &plan.source_format,
                    plan.dest_format.as_ref().expect("transcode plan"),
                    sink_task.sender(),
                    self.report_tx.clone(),
                ),
                None => TrackPipeline::passthrough(plan.track, sink_task.sender()),
            };
            routes.insert(plan.track, sample_tx);
            self.pipelines.push(pipeline);
            self.run_state.insert(plan.track, TrackRunState::default());
        }

        let reader = SourceReaderTask::new();
        reader.start(
            self.source.take().expect("source presence checked above"),
            routes,
            self.gate.clone(),
            self.report_tx.clone(),
        );

        self.reader = Some(reader);
        self.sink_task = Some(sink_task);
        self.state = SessionState::Running;
        log::info!(
            "session {}: running with {} pipelines",
            self.id,
            self.pipelines.len()
        );
        Ok(self.events.completion_handle())
    }

    fn handle_report(&mut self, msg: PipelineMsg) {
        match msg {
            PipelineMsg::Progress {
                track,
                percent,
                samples_written,
            } => {
                if let Some(rs) = self.run_state.get_mut(&track) {
                    rs.percent = percent.min(100);
                    rs.samples_written = samples_written;
                }
                self.emit_progress();
            }
            PipelineMsg::Wrote {
                track,
                samples_written,
            } => {
                if let Some(rs) = self.run_state.get_mut(&track) {
                    rs.samples_written = samples_written;
                }
            }
            PipelineMsg::Eos { track } => {
                if let Some(rs) = self.run_state.get_mut(&track) {
                    rs.percent = 100;
                    rs.eos = true;
                }
                self.emit_progress();
            }
            PipelineMsg::Finalized => {
                if self.state.is_terminal() {
                    return;
                }
                log::info!("session {}: finished", self.id);
                self.teardown();
                self.state = SessionState::Finished;
                self.events.finished();
            }
            PipelineMsg::Failed(error) => {
                if self.state.is_terminal() {
                    // First observed error already won.
                    log::debug!("session {}: late failure ignored: {error}", self.id);
                    return;
                }
                log::error!("session {}: failed: {error}", self.id);
                self.teardown();
                self.state = SessionState::Failed;
                self.events.errored(error.code());
            }
        }
    }

    /// Aggregate percent is the mean across included tracks, emitted only
    /// when the integer value grows.
    fn emit_progress(&mut self) {
        if self.run_state.is_empty() || self.state.is_terminal() {
            return;
        }
        let sum: u32 = self.run_state.values().map(|rs| rs.percent).sum();
        let overall = sum / self.run_state.len() as u32;
        if overall > self.emitted_percent {
            self.emitted_percent = overall;
            self.events.progress(overall);
        }
    }

    fn handle_cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        log::info!("session {}: cancelled in state {:?}", self.id, self.state);
        self.teardown();
        self.state = SessionState::Cancelled;
        self.events.cancelled();
    }

    fn handle_reclaim(&mut self) {
        if self.state == SessionState::Running {
            self.gate.close();
            self.state = SessionState::Paused;
            self.grace_deadline = Some(Instant::now() + self.config.grace_window);
            log::warn!("session {}: codec resources reclaimed, paused", self.id);
        }
        // A repeated reclaim while paused re-issues a fresh checkpoint; the
        // grace deadline is not extended.
        let token = self.checkpoint();
        self.events.resource_lost(token.to_bytes());
    }

    fn checkpoint(&self) -> PauseToken {
        let mut tracks: Vec<TrackCheckpoint> = self
            .run_state
            .iter()
            .map(|(track, rs)| TrackCheckpoint {
                track: *track,
                samples_written: rs.samples_written,
            })
            .collect();
        tracks.sort_unstable_by_key(|c| c.track);
        PauseToken {
            session: self.id,
            tracks,
        }
    }

    fn resume(&mut self, token: &[u8]) -> Result<()> {
        if self.state != SessionState::Paused {
            return Err(TranscodeError::InvalidState(self.state));
        }
        let token = PauseToken::from_bytes(token)?;
        if token.session != self.id {
            return Err(TranscodeError::ResumeRejected(format!(
                "token belongs to session {}",
                token.session
            )));
        }
        self.gate.open();
        self.grace_deadline = None;
        self.state = SessionState::Running;
        log::info!("session {}: resumed", self.id);
        Ok(())
    }

    fn handle_grace_timeout(&mut self) {
        self.grace_deadline = None;
        if self.state != SessionState::Paused {
            return;
        }
        log::error!("session {}: no resume within grace window", self.id);
        self.teardown();
        self.state = SessionState::Failed;
        self.events.errored(TranscodeError::Timeout.code());
    }

    /// Stop every worker and drop collaborator handles. Runs before any
    /// terminal event is emitted so a finished/failed/cancelled session has
    /// already let go of its codecs and file handles.
    fn teardown(&mut self) {
        self.gate.open();
        self.grace_deadline = None;
        if let Some(reader) = self.reader.take() {
            reader.stop();
        }
        for pipeline in self.pipelines.drain(..) {
            pipeline.stop();
        }
        if let Some(sink_task) = self.sink_task.take() {
            sink_task.stop();
        }
        self.source = None;
        self.sink = None;
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
