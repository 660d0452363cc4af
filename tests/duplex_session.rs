//! End-to-end sessions against in-memory devices and an in-process remote.

use parley::audio::devices::MockDevices;
use parley::codec::encode_samples;
use parley::config::Config;
use parley::defaults;
use parley::error::ParleyError;
use parley::session::loopback::{LoopbackConnector, RemoteEnd};
use parley::session::protocol::ServerMessage;
use parley::session::SessionState;
use parley::{EngineCallbacks, VoiceEngine};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<(String, bool)>>,
    errors: Mutex<Vec<String>>,
    closes: Mutex<u32>,
}

impl Recorder {
    fn messages(&self) -> Vec<(String, bool)> {
        self.messages.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    fn closes(&self) -> u32 {
        *self.closes.lock().unwrap()
    }
}

impl EngineCallbacks for Recorder {
    fn on_message(&self, text: &str, is_user: bool) {
        self.messages.lock().unwrap().push((text.to_string(), is_user));
    }

    fn on_error(&self, error: &ParleyError) {
        self.errors.lock().unwrap().push(error.to_string());
    }

    fn on_close(&self) {
        *self.closes.lock().unwrap() += 1;
    }
}

struct Harness {
    devices: Arc<MockDevices>,
    remote: RemoteEnd,
    engine: VoiceEngine,
    recorder: Arc<Recorder>,
}

impl Harness {
    fn new() -> Self {
        Self::with_devices(MockDevices::new())
    }

    fn with_devices(devices: MockDevices) -> Self {
        let devices = Arc::new(devices);
        let (connector, remote) = LoopbackConnector::new();
        let engine = VoiceEngine::new(devices.clone(), Arc::new(connector));
        Self {
            devices,
            remote,
            engine,
            recorder: Arc::new(Recorder::default()),
        }
    }

    async fn start(&self) {
        self.engine
            .start(&Config::default(), self.recorder.clone())
            .await
            .unwrap();
    }
}

fn speech(samples: usize) -> ServerMessage {
    let payload = encode_samples(&vec![2000i16; samples], defaults::PLAYBACK_MIME);
    ServerMessage::Audio {
        data: payload.data,
        mime_type: Some(payload.mime_type),
    }
}

fn said(text: &str) -> ServerMessage {
    ServerMessage::OutputTranscription {
        text: text.to_string(),
    }
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

#[tokio::test(flavor = "multi_thread")]
async fn excited_reply_plays_faster() {
    let h = Harness::new();
    h.start().await;

    h.remote.push(said("Great"));
    h.remote.push(said(" job!"));
    h.remote.push(speech(2400));

    let sink = h.devices.sink().unwrap();
    assert!(eventually(|| async { sink.scheduled().len() == 1 }).await);

    let segment = &sink.scheduled()[0];
    assert!(segment.rate > 1.0, "rate was {}", segment.rate);
    assert_eq!(
        h.recorder.messages().last(),
        Some(&("Great job!".to_string(), false))
    );

    h.engine.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn capture_failure_releases_output() {
    let h = Harness::with_devices(MockDevices::new().with_input_failure("busy"));

    let result = h.engine.start(&Config::default(), h.recorder.clone()).await;

    assert!(matches!(result, Err(ParleyError::DeviceUnavailable { .. })));
    assert_eq!(h.devices.open_handles(), 0);
    assert!(h.devices.sink().unwrap().is_closed());
    assert_eq!(h.remote.connections(), 0);
    assert!(!h.engine.is_running().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn output_failure_acquires_nothing() {
    let h = Harness::with_devices(MockDevices::new().with_output_failure("no speakers"));

    let result = h.engine.start(&Config::default(), h.recorder.clone()).await;

    assert!(matches!(result, Err(ParleyError::DeviceUnavailable { .. })));
    assert_eq!(h.devices.open_handles(), 0);
    assert!(h.devices.sink().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_payload_dropped_valid_one_plays() {
    let h = Harness::new();
    h.start().await;

    h.remote.push_raw("{not json");
    h.remote.push(ServerMessage::Audio {
        data: "%%%".to_string(),
        mime_type: None,
    });
    h.remote.push(speech(480));

    let sink = h.devices.sink().unwrap();
    assert!(eventually(|| async { sink.scheduled().len() == 1 }).await);
    assert!(eventually(|| async { h.engine.stats().await.payloads_dropped == 2 }).await);
    assert!(h.recorder.errors().is_empty());
    assert!(h.engine.is_running().await);

    h.engine.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn barge_in_stops_every_segment() {
    let h = Harness::new();
    h.start().await;

    h.remote.push(speech(24000));
    h.remote.push(speech(24000));
    let sink = h.devices.sink().unwrap();
    assert!(eventually(|| async { sink.scheduled().len() == 2 }).await);

    sink.advance(0.25);
    h.remote.push(ServerMessage::Interrupted);
    assert!(eventually(|| async { h.engine.stats().await.segments_active == 0 }).await);
    assert_eq!(sink.stopped().len(), 2);
    assert_eq!(h.engine.stats().await.interrupts, 1);

    // Audio after the barge-in starts now, not after the dropped reply.
    h.remote.push(speech(2400));
    assert!(eventually(|| async { sink.scheduled().len() == 3 }).await);
    assert!((sink.scheduled()[2].start - 0.25).abs() < 1e-9);

    h.engine.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_segments_leave_the_active_set() {
    let h = Harness::new();
    h.start().await;

    h.remote.push(speech(2400));
    let sink = h.devices.sink().unwrap();
    assert!(eventually(|| async { sink.scheduled().len() == 1 }).await);
    assert_eq!(h.engine.stats().await.segments_active, 1);

    sink.advance(1.0);
    assert_eq!(sink.finish_due().len(), 1);
    assert!(eventually(|| async { h.engine.stats().await.segments_active == 0 }).await);

    h.engine.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn microphone_audio_reaches_remote() {
    let mut h = Harness::new();
    h.start().await;

    let payload = tokio::time::timeout(Duration::from_secs(2), h.remote.next_audio())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload.mime_type, defaults::CAPTURE_MIME);
    assert!(eventually(|| async { h.engine.stats().await.frames_sent > 0 }).await);
    assert!(h.engine.stats().await.frames_encoded > 0);

    h.engine.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_fault_tears_down_then_reports() {
    let h = Harness::new();
    h.start().await;

    h.remote.fault("connection reset");

    assert!(eventually(|| async { h.recorder.errors().len() == 1 }).await);
    assert!(!h.engine.is_running().await);
    assert_eq!(h.devices.open_handles(), 0);
    assert!(h.devices.sink().unwrap().is_closed());
    assert_eq!(h.recorder.closes(), 0);

    // Nothing more is reported after teardown.
    h.remote.push(said("late"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.recorder.messages().is_empty());
    assert_eq!(h.recorder.errors().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_error_message_is_a_fault() {
    let h = Harness::new();
    h.start().await;

    h.remote.push(ServerMessage::Error {
        message: "quota exceeded".to_string(),
    });

    assert!(eventually(|| async { h.recorder.errors().len() == 1 }).await);
    assert!(h.recorder.errors()[0].contains("quota exceeded"));
    assert_eq!(h.devices.open_handles(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_close_reports_once() {
    let h = Harness::new();
    h.start().await;

    h.remote.close();

    assert!(eventually(|| async { h.recorder.closes() == 1 }).await);
    assert!(!h.engine.is_running().await);
    assert_eq!(h.devices.open_handles(), 0);
    assert!(h.recorder.errors().is_empty());

    h.engine.stop().await;
    assert_eq!(h.recorder.closes(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_ack_times_out() {
    let devices = Arc::new(MockDevices::new());
    let (connector, remote) = LoopbackConnector::new();
    let engine = VoiceEngine::new(devices.clone(), Arc::new(connector.without_auto_ack()));
    let mut config = Config::default();
    config.session.connect_timeout_ms = 100;

    let result = engine.start(&config, Arc::new(Recorder::default())).await;

    assert!(matches!(result, Err(ParleyError::ChannelFault { .. })));
    assert_eq!(remote.connections(), 1);
    assert_eq!(devices.open_handles(), 0);
    assert_eq!(engine.stats().await.state, SessionState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_while_connecting_cancels_start() {
    let devices = Arc::new(MockDevices::new());
    let (connector, remote) = LoopbackConnector::new();
    let engine = Arc::new(VoiceEngine::new(
        devices.clone(),
        Arc::new(connector.without_auto_ack()),
    ));
    let mut config = Config::default();
    config.session.connect_timeout_ms = 3000;

    let starting = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.start(&config, Arc::new(Recorder::default())).await }
    });
    assert!(eventually(|| async { remote.connections() == 1 }).await);
    assert_eq!(devices.open_handles(), 2);

    let began = std::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(1), engine.stop())
        .await
        .expect("stop waited for the connect timeout");
    assert!(began.elapsed() < Duration::from_secs(1));
    assert_eq!(devices.open_handles(), 0);

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(ParleyError::ChannelFault { .. })));
    assert!(!engine.is_running().await);
    assert_eq!(engine.stats().await.state, SessionState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connection_releases_devices() {
    let devices = Arc::new(MockDevices::new());
    let (connector, _remote) = LoopbackConnector::new();
    let engine = VoiceEngine::new(devices.clone(), Arc::new(connector.refusing("401 unauthorized")));

    let result = engine.start(&Config::default(), Arc::new(Recorder::default())).await;

    assert!(matches!(result, Err(ParleyError::ChannelFault { .. })));
    assert_eq!(devices.open_handles(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_idempotent() {
    let h = Harness::new();

    // Never started.
    h.engine.stop().await;
    assert_eq!(h.devices.open_handles(), 0);

    h.start().await;
    h.engine.stop().await;
    h.engine.stop().await;

    assert_eq!(h.devices.open_handles(), 0);
    assert!(h.remote.was_closed_by_client());
    assert!(h.recorder.errors().is_empty());
    assert_eq!(h.recorder.closes(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_replaces_running_session() {
    let h = Harness::new();
    h.start().await;
    let first = h.engine.stats().await.session_id;

    h.start().await;
    let stats = h.engine.stats().await;

    assert_ne!(stats.session_id, first);
    assert_eq!(stats.state, SessionState::Open);
    assert_eq!(h.remote.connections(), 2);
    assert_eq!(h.devices.open_handles(), 2);

    h.engine.stop().await;
    assert_eq!(h.devices.open_handles(), 0);
}
