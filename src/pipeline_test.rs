use std::time::Duration;

use tokio::time::timeout;

use crate::error::ErrorCode;
use crate::pipeline::{PipelineMsg, TrackPipeline};
use crate::sample::SampleCmd;
use crate::sink::SinkCmd;
use crate::testing::{StubDecoder, StubEncoder, make_samples, video_format};

const WAIT: Duration = Duration::from_secs(5);

async fn next_cmd(rx: &mut tokio::sync::mpsc::Receiver<SinkCmd>) -> Option<SinkCmd> {
    timeout(WAIT, rx.recv()).await.expect("timed out waiting on sink channel")
}

#[tokio::test]
async fn passthrough_forwards_bit_identical() -> anyhow::Result<()> {
    let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel(32);
    let (_pipeline, tx) = TrackPipeline::passthrough(3, sink_tx);

    let samples = make_samples(3, 4, 33_333);
    for s in &samples {
        tx.send(SampleCmd::Data(s.clone())).await?;
    }
    tx.send(SampleCmd::Eof).await?;

    for expected in &samples {
        match next_cmd(&mut sink_rx).await {
            Some(SinkCmd::Write(sample)) => assert_eq!(&sample, expected),
            other => panic!("expected a write, got {}", kind(&other)),
        }
    }
    match next_cmd(&mut sink_rx).await {
        Some(SinkCmd::Eos { track }) => assert_eq!(track, 3),
        other => panic!("expected eos, got {}", kind(&other)),
    }
    // Forwarder exits after Eof; nothing else holds the sink channel.
    assert!(next_cmd(&mut sink_rx).await.is_none());
    Ok(())
}

#[tokio::test]
async fn stopped_passthrough_ends_without_eos() -> anyhow::Result<()> {
    let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel(32);
    let (pipeline, tx) = TrackPipeline::passthrough(0, sink_tx);

    let samples = make_samples(0, 2, 33_333);
    tx.send(SampleCmd::Data(samples[0].clone())).await?;
    assert!(matches!(next_cmd(&mut sink_rx).await, Some(SinkCmd::Write(_))));

    pipeline.stop();
    // The forwarder breaks at the next boundary and drops its sender; no
    // Eos is fabricated for a track that did not finish.
    assert!(next_cmd(&mut sink_rx).await.is_none());
    Ok(())
}

#[tokio::test]
async fn transcode_chain_flushes_codec_buffers_at_eof() -> anyhow::Result<()> {
    let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel(32);
    let (report_tx, _report_rx) = tokio::sync::mpsc::channel(8);
    let format = video_format(1280, 720, 30.0, 5);

    // Both codec stubs hold two buffers back until end of stream.
    let (_pipeline, tx) = TrackPipeline::transcode(
        0,
        Box::new(StubDecoder::new(2)),
        Box::new(StubEncoder::new(2)),
        &format,
        &format,
        sink_tx,
        report_tx,
    );

    let samples = make_samples(0, 5, 33_333);
    for s in &samples {
        tx.send(SampleCmd::Data(s.clone())).await?;
    }
    tx.send(SampleCmd::Eof).await?;

    for expected in &samples {
        match next_cmd(&mut sink_rx).await {
            Some(SinkCmd::Write(sample)) => {
                assert_eq!(sample.pts_us, expected.pts_us);
                assert_eq!(sample.data, expected.data);
            }
            other => panic!("expected a write, got {}", kind(&other)),
        }
    }
    assert!(matches!(next_cmd(&mut sink_rx).await, Some(SinkCmd::Eos { track: 0 })));
    assert!(next_cmd(&mut sink_rx).await.is_none());
    Ok(())
}

#[tokio::test]
async fn frame_rate_change_rebases_output_pts() -> anyhow::Result<()> {
    let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel(32);
    let (report_tx, _report_rx) = tokio::sync::mpsc::channel(8);
    let source = video_format(1280, 720, 30.0, 4);
    let dest = video_format(1280, 720, 15.0, 4);

    let (_pipeline, tx) = TrackPipeline::transcode(
        0,
        Box::new(StubDecoder::new(0)),
        Box::new(StubEncoder::new(0)),
        &source,
        &dest,
        sink_tx,
        report_tx,
    );

    for s in make_samples(0, 4, 33_333) {
        tx.send(SampleCmd::Data(s)).await?;
    }
    tx.send(SampleCmd::Eof).await?;

    // 15 fps output: a clean 66666us ramp regardless of the input pts.
    let mut got = Vec::new();
    loop {
        match next_cmd(&mut sink_rx).await {
            Some(SinkCmd::Write(sample)) => {
                assert_eq!(sample.duration_us, 66_666);
                got.push(sample.pts_us);
            }
            Some(SinkCmd::Eos { .. }) => break,
            None => panic!("sink channel closed before eos"),
        }
    }
    assert_eq!(got, vec![0, 66_666, 133_332, 199_998]);
    Ok(())
}

#[tokio::test]
async fn decode_failure_reaches_the_report_channel() -> anyhow::Result<()> {
    let (sink_tx, _sink_rx) = tokio::sync::mpsc::channel(32);
    let (report_tx, mut report_rx) = tokio::sync::mpsc::channel(8);
    let format = video_format(1280, 720, 30.0, 3);

    let (_pipeline, tx) = TrackPipeline::transcode(
        0,
        Box::new(StubDecoder::new(0).fail_after(2)),
        Box::new(StubEncoder::new(0)),
        &format,
        &format,
        sink_tx,
        report_tx,
    );

    for s in make_samples(0, 3, 33_333) {
        tx.send(SampleCmd::Data(s)).await?;
    }

    match timeout(WAIT, report_rx.recv()).await? {
        Some(PipelineMsg::Failed(e)) => assert_eq!(e.code(), ErrorCode::DecodeFailure),
        _ => panic!("expected a failure report"),
    }
    Ok(())
}

fn kind(cmd: &Option<SinkCmd>) -> &'static str {
    match cmd {
        Some(SinkCmd::Write(_)) => "write",
        Some(SinkCmd::Eos { .. }) => "eos",
        None => "closed channel",
    }
}
