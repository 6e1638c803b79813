//! Call lifecycle: start, mute, hang up.
//!
//! One `CallResources` struct owns everything a call holds (capture stream,
//! playback sink, transport, meter); it is built at `start_call` and torn
//! down unconditionally at `end_call`, so a partial failure never leaks a
//! device handle. A dispatcher thread drains two channels (captured frames
//! and transport events), which keeps the state machine a plain function of
//! events and makes it testable with fakes, no device or network required.

use crate::audio::{
    convert_block, decode_pcm16, encode_pcm16, rms_db, CaptureSource, CaptureStream, LevelMeter,
    PlaybackSink, CAPTURE_BLOCK_SAMPLES, CAPTURE_RATE, PLAYBACK_RATE,
};
use crate::config::{AppConfig, CallPipelineConfig};
use crate::log_debug;
use crate::transport::{
    live::LiveTransport, SessionTransport, TransportConfig, TransportEvent,
};
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// User-visible call lifecycle. Exactly one per call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Erroring = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Erroring,
            _ => SessionState::Disconnected,
        }
    }
}

#[derive(Clone, Debug)]
struct SessionStateHandle(Arc<AtomicU8>);

impl SessionStateHandle {
    fn new(state: SessionState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Events surfaced to whatever is driving the call (the CLI, a test).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// Transport acknowledged setup; audio is flowing.
    Connected,
    /// The remote finished a response turn.
    TurnComplete,
    /// The call failed; teardown has been performed.
    Error(String),
    /// The call is over (hangup, remote close, or error teardown finished).
    Ended,
}

/// Per-call counters, logged as one `call_metrics|…` line on teardown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallMetrics {
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub frames_muted: u64,
    pub frames_dropped_capture: u64,
    pub frames_dropped_unsent: u64,
    pub chunks_played: u64,
    pub chunks_dropped: u64,
    pub interruptions: u64,
}

/// Playback side of the dispatcher, as a seam so tests can observe
/// scheduling decisions without an output device.
pub(crate) trait AudioOut {
    fn enqueue(&mut self, frame: Vec<f32>);
    fn interrupt(&mut self);
}

impl AudioOut for PlaybackSink {
    fn enqueue(&mut self, frame: Vec<f32>) {
        PlaybackSink::enqueue(self, frame);
    }

    fn interrupt(&mut self) {
        PlaybackSink::interrupt(self);
    }
}

/// Everything one call owns. Teardown is unconditional and idempotent: each
/// resource is released independently of the others, and a second pass finds
/// nothing left to release.
struct CallResources {
    transport: Option<Box<dyn SessionTransport>>,
    capture: Option<CaptureStream>,
    sink: Option<PlaybackSink>,
    meter: LevelMeter,
}

impl CallResources {
    fn empty(meter: LevelMeter) -> Self {
        Self {
            transport: None,
            capture: None,
            sink: None,
            meter,
        }
    }

    fn teardown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
        if let Some(mut sink) = self.sink.take() {
            sink.close();
        }
        self.meter.reset();
    }
}

/// Handle to an in-flight call.
pub struct CallSession {
    state: SessionStateHandle,
    muted: Arc<AtomicBool>,
    meter: LevelMeter,
    events: Receiver<CallEvent>,
    hangup: Sender<()>,
    worker: Option<JoinHandle<CallMetrics>>,
}

impl CallSession {
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn meter(&self) -> &LevelMeter {
        &self.meter
    }

    pub fn events(&self) -> &Receiver<CallEvent> {
        &self.events
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Flip the mute gate; returns the new state. Capture and metering keep
    /// running while muted, only the encode/send path stops.
    pub fn toggle_mute(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::Relaxed)
    }

    /// Hang up and wait for teardown. Safe to call any number of times, and
    /// also invoked on drop; ending a call that already ended is a no-op.
    pub fn end_call(&mut self) -> Option<CallMetrics> {
        let _ = self.hangup.try_send(());
        self.worker.take().and_then(|worker| worker.join().ok())
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.end_call();
    }
}

/// Start a call: acquire the microphone and speaker, connect the transport,
/// and spin up the dispatcher. Device acquisition happens before this
/// returns: a capture failure means the call never starts.
pub fn start_call(config: &AppConfig) -> Result<CallSession> {
    let state = SessionStateHandle::new(SessionState::Disconnected);
    let muted = Arc::new(AtomicBool::new(false));
    let meter = LevelMeter::new();
    let (event_tx, event_rx) = unbounded();
    let (hangup_tx, hangup_rx) = bounded(1);
    let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

    let transport_config = config.transport_config();
    let pipeline = config.pipeline_config();

    let worker = {
        let state = state.clone();
        let muted = muted.clone();
        let meter = meter.clone();
        thread::spawn(move || {
            run_call(
                transport_config,
                pipeline,
                state,
                muted,
                meter,
                event_tx,
                hangup_rx,
                ready_tx,
            )
        })
    };

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            let _ = worker.join();
            return Err(err);
        }
        Err(_) => {
            let _ = worker.join();
            return Err(anyhow!("call worker exited before acquiring audio devices"));
        }
    }

    Ok(CallSession {
        state,
        muted,
        meter,
        events: event_rx,
        hangup: hangup_tx,
        worker: Some(worker),
    })
}

#[allow(clippy::too_many_arguments)]
fn run_call(
    transport_config: TransportConfig,
    pipeline: CallPipelineConfig,
    state: SessionStateHandle,
    muted: Arc<AtomicBool>,
    meter: LevelMeter,
    events: Sender<CallEvent>,
    hangup: Receiver<()>,
    ready: Sender<Result<()>>,
) -> CallMetrics {
    let mut metrics = CallMetrics::default();
    let mut resources = CallResources::empty(meter.clone());

    let (frame_tx, frame_rx) = bounded::<Vec<f32>>(pipeline.frame_channel_capacity);
    let capture_dropped = Arc::new(AtomicUsize::new(0));

    // cpal streams are not Send on every platform, so the dispatcher thread
    // opens and owns them; start_call waits on the ready handshake.
    let device_rate = match open_audio(&pipeline, frame_tx, capture_dropped.clone()) {
        Ok((capture, sink)) => {
            let rate = capture.device_rate();
            resources.capture = Some(capture);
            resources.sink = Some(sink);
            let _ = ready.send(Ok(()));
            rate
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return metrics;
        }
    };

    let (transport_tx, transport_rx) = unbounded();
    state.set(SessionState::Connecting);
    resources.transport = Some(Box::new(LiveTransport::connect(
        transport_config,
        transport_tx,
    )));

    loop {
        select! {
            recv(frame_rx) -> msg => match msg {
                Ok(frame) => {
                    if let Some(transport) = resources.transport.as_deref() {
                        handle_captured_frame(
                            frame,
                            device_rate,
                            &muted,
                            &meter,
                            transport,
                            &mut metrics,
                        );
                    }
                }
                Err(_) => {
                    state.set(SessionState::Erroring);
                    let _ = events.send(CallEvent::Error(
                        "capture stream stopped unexpectedly".to_string(),
                    ));
                    break;
                }
            },
            recv(transport_rx) -> msg => match msg {
                Ok(event) => {
                    let sink = resources.sink.as_mut();
                    if dispatch_transport_event(event, &state, sink, &events, &mut metrics)
                        == LoopControl::Stop
                    {
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(hangup) -> _ => break,
        }
    }

    resources.teardown();
    state.set(SessionState::Disconnected);
    metrics.frames_dropped_capture = capture_dropped.load(Ordering::Relaxed) as u64;
    let _ = events.send(CallEvent::Ended);
    log_call_metrics(&metrics);
    metrics
}

fn open_audio(
    pipeline: &CallPipelineConfig,
    frames: Sender<Vec<f32>>,
    dropped: Arc<AtomicUsize>,
) -> Result<(CaptureStream, PlaybackSink)> {
    let source = CaptureSource::new(pipeline.input_device.as_deref())?;
    log_debug(&format!("capturing from '{}'", source.device_name()));
    let capture = source.open_stream(CAPTURE_BLOCK_SAMPLES, CAPTURE_RATE, frames, dropped)?;
    let sink = PlaybackSink::open(PLAYBACK_RATE)?;
    Ok((capture, sink))
}

/// Normalize one captured block, feed the meter, and, unless muted or the
/// transport is not Open, encode and send it. Frames that cannot be sent
/// are dropped, not queued.
fn handle_captured_frame(
    frame: Vec<f32>,
    device_rate: u32,
    muted: &AtomicBool,
    meter: &LevelMeter,
    transport: &dyn SessionTransport,
    metrics: &mut CallMetrics,
) {
    let block = convert_block(frame, device_rate, CAPTURE_RATE, CAPTURE_BLOCK_SAMPLES);
    meter.set_db(rms_db(&block));
    metrics.frames_captured += 1;

    if muted.load(Ordering::Relaxed) {
        metrics.frames_muted += 1;
        return;
    }

    if transport.send(&encode_pcm16(&block)) {
        metrics.frames_sent += 1;
    } else {
        metrics.frames_dropped_unsent += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Stop,
}

fn dispatch_transport_event(
    event: TransportEvent,
    state: &SessionStateHandle,
    sink: Option<&mut PlaybackSink>,
    events: &Sender<CallEvent>,
    metrics: &mut CallMetrics,
) -> LoopControl {
    match sink {
        Some(sink) => handle_transport_event(event, state, sink, events, metrics),
        None => handle_transport_event(event, state, &mut NullAudioOut, events, metrics),
    }
}

/// The dispatcher state machine: one inbound transport event in, state
/// transitions and playback actions out.
fn handle_transport_event(
    event: TransportEvent,
    state: &SessionStateHandle,
    audio_out: &mut dyn AudioOut,
    events: &Sender<CallEvent>,
    metrics: &mut CallMetrics,
) -> LoopControl {
    match event {
        TransportEvent::Opened => {
            state.set(SessionState::Connected);
            let _ = events.send(CallEvent::Connected);
            LoopControl::Continue
        }
        TransportEvent::Audio(bytes) => {
            match decode_pcm16(&bytes) {
                Ok(frame) => {
                    audio_out.enqueue(frame);
                    metrics.chunks_played += 1;
                }
                Err(err) => {
                    // One bad chunk must not end the stream.
                    log_debug(&format!("dropping inbound chunk: {err}"));
                    metrics.chunks_dropped += 1;
                }
            }
            LoopControl::Continue
        }
        TransportEvent::Interrupted => {
            audio_out.interrupt();
            metrics.interruptions += 1;
            LoopControl::Continue
        }
        TransportEvent::TurnComplete => {
            let _ = events.send(CallEvent::TurnComplete);
            LoopControl::Continue
        }
        TransportEvent::Closed => LoopControl::Stop,
        TransportEvent::Error(message) => {
            state.set(SessionState::Erroring);
            let _ = events.send(CallEvent::Error(message));
            LoopControl::Stop
        }
    }
}

struct NullAudioOut;

impl AudioOut for NullAudioOut {
    fn enqueue(&mut self, _frame: Vec<f32>) {}
    fn interrupt(&mut self) {}
}

/// Structured counters in the log for post-call inspection.
/// Format: `call_metrics|frames_captured=…|…|interruptions=…`
fn log_call_metrics(metrics: &CallMetrics) {
    log_debug(&format!(
        "call_metrics|frames_captured={}|frames_sent={}|frames_muted={}|capture_dropped={}|unsent_dropped={}|chunks_played={}|chunks_dropped={}|interruptions={}",
        metrics.frames_captured,
        metrics.frames_sent,
        metrics.frames_muted,
        metrics.frames_dropped_capture,
        metrics.frames_dropped_unsent,
        metrics.chunks_played,
        metrics.chunks_dropped,
        metrics.interruptions,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{encode_pcm16, METER_FLOOR_DB};
    use crate::transport::TransportState;
    use std::sync::Mutex;

    struct FakeTransport {
        state: TransportState,
        sends: Mutex<Vec<Vec<u8>>>,
        dropped: AtomicUsize,
        closed: AtomicUsize,
    }

    impl FakeTransport {
        fn new(state: TransportState) -> Self {
            Self {
                state,
                sends: Mutex::new(Vec::new()),
                dropped: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            }
        }

        fn sent(&self) -> usize {
            self.sends.lock().unwrap().len()
        }
    }

    impl SessionTransport for FakeTransport {
        fn state(&self) -> TransportState {
            self.state
        }

        fn send(&self, chunk: &[u8]) -> bool {
            if self.state != TransportState::Open {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            self.sends.lock().unwrap().push(chunk.to_vec());
            true
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }

        fn dropped_sends(&self) -> usize {
            self.dropped.load(Ordering::Relaxed)
        }
    }

    #[derive(Default)]
    struct RecordingAudioOut {
        enqueued: Vec<Vec<f32>>,
        interruptions: usize,
    }

    impl AudioOut for RecordingAudioOut {
        fn enqueue(&mut self, frame: Vec<f32>) {
            self.enqueued.push(frame);
        }

        fn interrupt(&mut self) {
            self.interruptions += 1;
        }
    }

    fn loud_frame() -> Vec<f32> {
        vec![0.5; CAPTURE_BLOCK_SAMPLES]
    }

    #[test]
    fn teardown_with_nothing_opened_is_a_no_op() {
        let mut resources = CallResources::empty(LevelMeter::new());
        resources.teardown();
        resources.teardown();
    }

    #[test]
    fn teardown_closes_the_transport_exactly_once() {
        let mut resources = CallResources::empty(LevelMeter::new());
        resources.transport = Some(Box::new(FakeTransport::new(TransportState::Open)));
        resources.teardown();
        assert!(resources.transport.is_none());
        // A second teardown finds nothing left to release.
        resources.teardown();
    }

    #[test]
    fn teardown_resets_the_meter() {
        let meter = LevelMeter::new();
        meter.set_db(-10.0);
        let mut resources = CallResources::empty(meter.clone());
        resources.teardown();
        assert_eq!(meter.level_db(), METER_FLOOR_DB);
    }

    #[test]
    fn end_call_twice_without_a_worker_does_not_panic() {
        let (hangup_tx, _hangup_rx) = bounded(1);
        let (_event_tx, event_rx) = unbounded();
        let mut session = CallSession {
            state: SessionStateHandle::new(SessionState::Disconnected),
            muted: Arc::new(AtomicBool::new(false)),
            meter: LevelMeter::new(),
            events: event_rx,
            hangup: hangup_tx,
            worker: None,
        };
        assert!(session.end_call().is_none());
        assert!(session.end_call().is_none());
    }

    #[test]
    fn captured_frames_are_encoded_and_sent_while_open() {
        let transport = FakeTransport::new(TransportState::Open);
        let muted = AtomicBool::new(false);
        let meter = LevelMeter::new();
        let mut metrics = CallMetrics::default();

        handle_captured_frame(
            loud_frame(),
            CAPTURE_RATE,
            &muted,
            &meter,
            &transport,
            &mut metrics,
        );

        assert_eq!(transport.sent(), 1);
        assert_eq!(metrics.frames_sent, 1);
        let sends = transport.sends.lock().unwrap();
        assert_eq!(sends[0], encode_pcm16(&loud_frame()));
    }

    #[test]
    fn muting_stops_sends_but_keeps_the_meter_live() {
        let transport = FakeTransport::new(TransportState::Open);
        let muted = AtomicBool::new(true);
        let meter = LevelMeter::new();
        let mut metrics = CallMetrics::default();

        handle_captured_frame(
            loud_frame(),
            CAPTURE_RATE,
            &muted,
            &meter,
            &transport,
            &mut metrics,
        );

        assert_eq!(transport.sent(), 0);
        assert_eq!(metrics.frames_muted, 1);
        assert!(
            meter.level_db() > METER_FLOOR_DB,
            "visualizer must keep updating while muted"
        );
    }

    #[test]
    fn frames_during_connection_setup_are_dropped_not_queued() {
        let transport = FakeTransport::new(TransportState::Opening);
        let muted = AtomicBool::new(false);
        let meter = LevelMeter::new();
        let mut metrics = CallMetrics::default();

        for _ in 0..3 {
            handle_captured_frame(
                loud_frame(),
                CAPTURE_RATE,
                &muted,
                &meter,
                &transport,
                &mut metrics,
            );
        }

        assert_eq!(transport.sent(), 0);
        assert_eq!(transport.dropped_sends(), 3);
        assert_eq!(metrics.frames_dropped_unsent, 3);
    }

    #[test]
    fn opened_event_transitions_to_connected() {
        let state = SessionStateHandle::new(SessionState::Connecting);
        let (tx, rx) = unbounded();
        let mut out = RecordingAudioOut::default();
        let mut metrics = CallMetrics::default();

        let control =
            handle_transport_event(TransportEvent::Opened, &state, &mut out, &tx, &mut metrics);

        assert_eq!(control, LoopControl::Continue);
        assert_eq!(state.get(), SessionState::Connected);
        assert_eq!(rx.try_recv(), Ok(CallEvent::Connected));
    }

    #[test]
    fn audio_events_decode_into_playback() {
        let state = SessionStateHandle::new(SessionState::Connected);
        let (tx, _rx) = unbounded();
        let mut out = RecordingAudioOut::default();
        let mut metrics = CallMetrics::default();

        let bytes = encode_pcm16(&[0.1, -0.1, 0.2]);
        let control = handle_transport_event(
            TransportEvent::Audio(bytes),
            &state,
            &mut out,
            &tx,
            &mut metrics,
        );

        assert_eq!(control, LoopControl::Continue);
        assert_eq!(out.enqueued.len(), 1);
        assert_eq!(out.enqueued[0].len(), 3);
        assert_eq!(metrics.chunks_played, 1);
    }

    #[test]
    fn malformed_chunk_is_dropped_and_the_stream_continues() {
        let state = SessionStateHandle::new(SessionState::Connected);
        let (tx, _rx) = unbounded();
        let mut out = RecordingAudioOut::default();
        let mut metrics = CallMetrics::default();

        let control = handle_transport_event(
            TransportEvent::Audio(vec![1, 2, 3]),
            &state,
            &mut out,
            &tx,
            &mut metrics,
        );

        assert_eq!(control, LoopControl::Continue);
        assert!(out.enqueued.is_empty());
        assert_eq!(metrics.chunks_dropped, 1);
        assert_eq!(state.get(), SessionState::Connected);
    }

    #[test]
    fn interruption_flushes_playback() {
        let state = SessionStateHandle::new(SessionState::Connected);
        let (tx, _rx) = unbounded();
        let mut out = RecordingAudioOut::default();
        let mut metrics = CallMetrics::default();

        let control = handle_transport_event(
            TransportEvent::Interrupted,
            &state,
            &mut out,
            &tx,
            &mut metrics,
        );

        assert_eq!(control, LoopControl::Continue);
        assert_eq!(out.interruptions, 1);
        assert_eq!(metrics.interruptions, 1);
    }

    #[test]
    fn transport_error_stops_the_loop_and_surfaces_the_message() {
        let state = SessionStateHandle::new(SessionState::Connected);
        let (tx, rx) = unbounded();
        let mut out = RecordingAudioOut::default();
        let mut metrics = CallMetrics::default();

        let control = handle_transport_event(
            TransportEvent::Error("boom".to_string()),
            &state,
            &mut out,
            &tx,
            &mut metrics,
        );

        assert_eq!(control, LoopControl::Stop);
        assert_eq!(state.get(), SessionState::Erroring);
        assert_eq!(rx.try_recv(), Ok(CallEvent::Error("boom".to_string())));
    }

    #[test]
    fn remote_close_stops_the_loop() {
        let state = SessionStateHandle::new(SessionState::Connected);
        let (tx, _rx) = unbounded();
        let mut out = RecordingAudioOut::default();
        let mut metrics = CallMetrics::default();

        let control = handle_transport_event(
            TransportEvent::Closed,
            &state,
            &mut out,
            &tx,
            &mut metrics,
        );
        assert_eq!(control, LoopControl::Stop);
    }

    #[test]
    fn synthetic_event_sequence_walks_the_full_lifecycle() {
        let state = SessionStateHandle::new(SessionState::Connecting);
        let (tx, rx) = unbounded();
        let mut out = RecordingAudioOut::default();
        let mut metrics = CallMetrics::default();

        let script = vec![
            TransportEvent::Opened,
            TransportEvent::Audio(encode_pcm16(&[0.3; 240])),
            TransportEvent::Audio(encode_pcm16(&[0.2; 240])),
            TransportEvent::Interrupted,
            TransportEvent::Audio(encode_pcm16(&[0.1; 240])),
            TransportEvent::TurnComplete,
            TransportEvent::Closed,
        ];

        let mut stopped = false;
        for event in script {
            if handle_transport_event(event, &state, &mut out, &tx, &mut metrics)
                == LoopControl::Stop
            {
                stopped = true;
                break;
            }
        }

        assert!(stopped);
        assert_eq!(out.enqueued.len(), 3);
        assert_eq!(out.interruptions, 1);
        assert_eq!(metrics.chunks_played, 3);
        assert_eq!(rx.try_recv(), Ok(CallEvent::Connected));
        assert_eq!(rx.try_recv(), Ok(CallEvent::TurnComplete));
    }
}
