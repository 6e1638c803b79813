//! Live API client: a bidirectional WebSocket session with the generative
//! realtime endpoint.
//!
//! The wire protocol is one `setup` message out, a `setupComplete` ack back,
//! then `realtimeInput` media chunks upstream and `serverContent` messages
//! (inline audio, `interrupted`, `turnComplete`) downstream. All socket I/O
//! runs on one thread; the handle only flips atomics and pushes onto a
//! bounded outbound queue, so `send` and `close` never block the session
//! loop.

use super::{SessionTransport, StateCell, TransportConfig, TransportEvent, TransportState};
use crate::audio::{from_base64, to_base64};
use crate::log_debug;
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

const OUTBOUND_CAPACITY: usize = 64;
const READ_POLL: Duration = Duration::from_millis(20);
const CAPTURE_MIME: &str = "audio/pcm;rate=16000";

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Handle to a live session; I/O happens on the spawned thread.
pub struct LiveTransport {
    state: StateCell,
    stop: Arc<AtomicBool>,
    outbound: Sender<Vec<u8>>,
    dropped_sends: Arc<AtomicUsize>,
}

impl LiveTransport {
    /// Connect without blocking: the handle returns immediately in Opening;
    /// the Opening→Open transition and every inbound message arrive on
    /// `events`.
    pub fn connect(config: TransportConfig, events: Sender<TransportEvent>) -> Self {
        let state = StateCell::new(TransportState::Opening);
        let stop = Arc::new(AtomicBool::new(false));
        let (outbound_tx, outbound_rx) = bounded::<Vec<u8>>(OUTBOUND_CAPACITY);

        {
            let state = state.clone();
            let stop = stop.clone();
            thread::spawn(move || run_io(config, state, stop, outbound_rx, events));
        }

        Self {
            state,
            stop,
            outbound: outbound_tx,
            dropped_sends: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SessionTransport for LiveTransport {
    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn send(&self, chunk: &[u8]) -> bool {
        if self.state.get() != TransportState::Open {
            self.dropped_sends.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.outbound.try_send(chunk.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped_sends.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn close(&mut self) {
        // Local state resolves immediately; the I/O thread notices the stop
        // flag within one poll interval and closes the socket on its own,
        // so a wedged remote cannot stall teardown.
        self.stop.store(true, Ordering::Relaxed);
        self.state.set(TransportState::Closed);
    }

    fn dropped_sends(&self) -> usize {
        self.dropped_sends.load(Ordering::Relaxed)
    }
}

impl Drop for LiveTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_io(
    config: TransportConfig,
    state: StateCell,
    stop: Arc<AtomicBool>,
    outbound: Receiver<Vec<u8>>,
    events: Sender<TransportEvent>,
) {
    let mut socket = match connect_socket(&config) {
        Ok(socket) => socket,
        Err(err) => {
            state.set(TransportState::Closed);
            let _ = events.send(TransportEvent::Error(format!("connect failed: {err:#}")));
            return;
        }
    };

    if let Err(err) = send_setup(&mut socket, &config) {
        state.set(TransportState::Closed);
        let _ = events.send(TransportEvent::Error(format!("setup failed: {err:#}")));
        return;
    }

    loop {
        if stop.load(Ordering::Relaxed) {
            let _ = socket.close(None);
            break;
        }

        let mut failed = false;
        while let Ok(chunk) = outbound.try_recv() {
            if let Err(err) = send_chunk(&mut socket, &chunk) {
                state.set(TransportState::Closed);
                let _ = events.send(TransportEvent::Error(format!("send failed: {err:#}")));
                failed = true;
                break;
            }
        }
        if failed {
            break;
        }

        match socket.read() {
            Ok(Message::Text(text)) => handle_server_message(text.as_bytes(), &state, &events),
            Ok(Message::Binary(bytes)) => handle_server_message(&bytes, &state, &events),
            Ok(Message::Close(_)) => {
                state.set(TransportState::Closed);
                let _ = events.send(TransportEvent::Closed);
                break;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(err) => {
                state.set(TransportState::Closed);
                let _ = events.send(TransportEvent::Error(format!("connection lost: {err}")));
                break;
            }
        }
    }

    state.set(TransportState::Closed);
}

fn connect_socket(config: &TransportConfig) -> Result<Socket> {
    let url = format!(
        "wss://{}/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key={}",
        config.host, config.api_key
    );
    let (mut socket, _response) =
        tungstenite::connect(url.as_str()).context("websocket handshake failed")?;
    set_read_poll(&mut socket)?;
    Ok(socket)
}

/// Short read timeout so the I/O loop can interleave outbound chunks and
/// notice the stop flag.
fn set_read_poll(socket: &mut Socket) -> Result<()> {
    match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => stream.set_read_timeout(Some(READ_POLL)),
        MaybeTlsStream::NativeTls(stream) => stream.get_mut().set_read_timeout(Some(READ_POLL)),
        _ => Ok(()),
    }
    .context("failed to set socket read timeout")
}

fn send_setup(socket: &mut Socket, config: &TransportConfig) -> Result<()> {
    let setup = ClientSetup {
        setup: Setup {
            model: format!("models/{}", config.model),
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: &config.voice,
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: [TextPart {
                    text: &config.system_instruction,
                }],
            },
        },
    };
    let json = serde_json::to_string(&setup).context("failed to serialize setup")?;
    socket
        .send(Message::Text(json))
        .context("failed to send setup")
}

fn send_chunk(socket: &mut Socket, chunk: &[u8]) -> Result<()> {
    let input = ClientRealtimeInput {
        realtime_input: RealtimeInput {
            media_chunks: [MediaChunk {
                mime_type: CAPTURE_MIME,
                data: to_base64(chunk),
            }],
        },
    };
    let json = serde_json::to_string(&input).context("failed to serialize media chunk")?;
    socket
        .send(Message::Text(json))
        .context("failed to send media chunk")
}

/// Parse one server message and fan it out as events. A malformed message is
/// logged and skipped; it must not end the stream.
fn handle_server_message(raw: &[u8], state: &StateCell, events: &Sender<TransportEvent>) {
    let message: ServerMessage = match serde_json::from_slice(raw) {
        Ok(message) => message,
        Err(err) => {
            log_debug(&format!("unparseable server message: {err}"));
            return;
        }
    };

    if message.setup_complete.is_some() && state.get() == TransportState::Opening {
        state.set(TransportState::Open);
        let _ = events.send(TransportEvent::Opened);
    }

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                let Some(inline) = part.inline_data else {
                    continue;
                };
                match from_base64(&inline.data) {
                    Ok(bytes) => {
                        let _ = events.send(TransportEvent::Audio(bytes));
                    }
                    Err(err) => log_debug(&format!("dropping undecodable audio part: {err}")),
                }
            }
        }
        if content.interrupted.unwrap_or(false) {
            let _ = events.send(TransportEvent::Interrupted);
        }
        if content.turn_complete.unwrap_or(false) {
            let _ = events.send(TransportEvent::TurnComplete);
        }
    }

    if message.go_away.is_some() {
        log_debug("server signalled goAway");
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientSetup<'a> {
    setup: Setup<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
    system_instruction: Content<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'static str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig<'a> {
    voice_name: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientRealtimeInput {
    realtime_input: RealtimeInput,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: [MediaChunk; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: &'static str,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: Option<bool>,
    #[serde(default)]
    turn_complete: Option<bool>,
}

#[derive(Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ModelPart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelPart {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
struct InlineData {
    data: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::to_base64;
    use crossbeam_channel::unbounded;

    fn test_config() -> TransportConfig {
        TransportConfig {
            api_key: "key".into(),
            host: "example.invalid".into(),
            model: "demo-live".into(),
            voice: "Kore".into(),
            system_instruction: "Be brief.".into(),
        }
    }

    #[test]
    fn setup_message_carries_modality_voice_and_instruction() {
        let config = test_config();
        let setup = ClientSetup {
            setup: Setup {
                model: format!("models/{}", config.model),
                generation_config: GenerationConfig {
                    response_modalities: ["AUDIO"],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: &config.voice,
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: [TextPart {
                        text: &config.system_instruction,
                    }],
                },
            },
        };
        let json = serde_json::to_string(&setup).expect("serialize");
        assert!(json.contains("\"model\":\"models/demo-live\""));
        assert!(json.contains("\"responseModalities\":[\"AUDIO\"]"));
        assert!(json.contains("\"prebuiltVoiceConfig\":{\"voiceName\":\"Kore\"}"));
        assert!(json.contains("\"systemInstruction\""));
        assert!(json.contains("Be brief."));
    }

    #[test]
    fn realtime_input_wraps_base64_pcm() {
        let input = ClientRealtimeInput {
            realtime_input: RealtimeInput {
                media_chunks: [MediaChunk {
                    mime_type: CAPTURE_MIME,
                    data: to_base64(&[1, 2, 3, 4]),
                }],
            },
        };
        let json = serde_json::to_string(&input).expect("serialize");
        assert!(json.contains("\"realtimeInput\""));
        assert!(json.contains("\"mediaChunks\""));
        assert!(json.contains("\"mimeType\":\"audio/pcm;rate=16000\""));
    }

    #[test]
    fn setup_complete_opens_the_channel_once() {
        let state = StateCell::new(TransportState::Opening);
        let (tx, rx) = unbounded();
        handle_server_message(br#"{"setupComplete":{}}"#, &state, &tx);
        assert_eq!(state.get(), TransportState::Open);
        assert_eq!(rx.try_recv(), Ok(TransportEvent::Opened));

        handle_server_message(br#"{"setupComplete":{}}"#, &state, &tx);
        assert!(rx.try_recv().is_err(), "no duplicate Opened event");
    }

    #[test]
    fn server_content_emits_audio_then_interrupted() {
        let state = StateCell::new(TransportState::Open);
        let (tx, rx) = unbounded();
        let payload = to_base64(&[0u8, 1, 2, 3]);
        let raw = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"data":"{payload}"}}}}]}},"interrupted":true}}}}"#
        );
        handle_server_message(raw.as_bytes(), &state, &tx);
        assert_eq!(rx.try_recv(), Ok(TransportEvent::Audio(vec![0, 1, 2, 3])));
        assert_eq!(rx.try_recv(), Ok(TransportEvent::Interrupted));
    }

    #[test]
    fn turn_complete_is_surfaced() {
        let state = StateCell::new(TransportState::Open);
        let (tx, rx) = unbounded();
        handle_server_message(
            br#"{"serverContent":{"turnComplete":true}}"#,
            &state,
            &tx,
        );
        assert_eq!(rx.try_recv(), Ok(TransportEvent::TurnComplete));
    }

    #[test]
    fn unparseable_message_is_skipped() {
        let state = StateCell::new(TransportState::Open);
        let (tx, rx) = unbounded();
        handle_server_message(b"not json", &state, &tx);
        assert!(rx.try_recv().is_err());
        assert_eq!(state.get(), TransportState::Open);
    }

    #[test]
    fn undecodable_audio_part_is_dropped_without_stopping() {
        let state = StateCell::new(TransportState::Open);
        let (tx, rx) = unbounded();
        let raw = br#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"%%%"}}]},"turnComplete":true}}"#;
        handle_server_message(raw, &state, &tx);
        assert_eq!(rx.try_recv(), Ok(TransportEvent::TurnComplete));
    }
}
