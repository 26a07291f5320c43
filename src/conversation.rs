use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::client::{RequestTx, ResponseRx, SessionEvent};
use crate::types::audio::PLAYBACK_FRAME_SAMPLES;
use crate::types::request::{AudioInEvent, ConfigEvent};
use crate::types::{ConverseConfig, ConverseEventType, ConverseRequest, ConverseResponse, MicrophoneMode};
use crate::utils;

/// Upper bound on one turn, connection setup included.
pub const TURN_DEADLINE: Duration = Duration::from_secs(240);

const QUIT_WORDS: [&str; 2] = ["quit", "exit"];

/// What to do once a turn is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Ask the user whether to start another turn.
    Continue,
    /// The user asked to leave.
    Quit,
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("failed to send session config: {0}")]
    Configure(String),
    #[error("assistant reported an error: {0}")]
    Assistant(String),
    #[error("session stream failed: {0}")]
    Stream(String),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture device stream closed unexpectedly")]
    DeviceClosed,
}

/// Runs bounded conversation turns and carries the continuation token from
/// one turn into the next. The token never leaves process memory.
pub struct Coordinator {
    conversation_state: Option<String>,
    turn_deadline: Duration,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::with_deadline(TURN_DEADLINE)
    }

    pub fn with_deadline(turn_deadline: Duration) -> Self {
        Self {
            conversation_state: None,
            turn_deadline,
        }
    }

    pub fn conversation_state(&self) -> Option<&str> {
        self.conversation_state.as_deref()
    }

    fn config(&self) -> ConverseConfig {
        let mut builder = ConverseConfig::builder();
        if let Some(token) = &self.conversation_state {
            tracing::info!("continuing conversation");
            builder = builder.with_conversation_state(token.clone());
        }
        builder.build()
    }

    /// Run one turn to completion: send the config, forward captured audio
    /// in the background, and consume assistant events until a terminal
    /// condition or the deadline. The capture task is always stopped before
    /// the session channels are dropped.
    pub async fn run_turn(
        &mut self,
        requests: RequestTx,
        responses: ResponseRx,
        capture_frames: mpsc::Receiver<Vec<f32>>,
        playback: mpsc::Sender<Vec<f32>>,
    ) -> Result<TurnOutcome, TurnError> {
        let config = ConverseRequest::Config(ConfigEvent::new(self.config()));
        requests
            .send(config)
            .await
            .map_err(|e| TurnError::Configure(e.to_string()))?;

        let stop = CancellationToken::new();
        let capture = tokio::spawn(forward_capture(
            capture_frames,
            requests.clone(),
            stop.clone(),
        ));

        tracing::info!("listening");
        let outcome = match tokio::time::timeout(
            self.turn_deadline,
            self.receive_loop(responses, &playback, &stop),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::info!("turn deadline elapsed, closing the session");
                Ok(TurnOutcome::Continue)
            }
        };

        // Invariant: capture must be told to stop before the session goes away.
        // cancel() is idempotent, so paths that already stopped it are fine.
        stop.cancel();
        match capture.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("capture task failed: {}", e);
                if outcome.is_ok() {
                    return Err(e.into());
                }
            }
            Err(e) => {
                tracing::error!("capture task panicked: {}", e);
            }
        }
        outcome
    }

    async fn receive_loop(
        &mut self,
        mut responses: ResponseRx,
        playback: &mpsc::Sender<Vec<f32>>,
        stop: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        loop {
            let response = match responses.recv().await {
                Ok(SessionEvent::Response(response)) => response,
                Ok(SessionEvent::TransportError(message)) => {
                    tracing::error!("cannot get a response from the assistant: {}", message);
                    return Err(TurnError::Stream(message));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("assistant closed the stream");
                    return Ok(TurnOutcome::Continue);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("dropped {} assistant events", n);
                    continue;
                }
            };
            if let Some(outcome) = self.handle_response(response, playback, stop).await? {
                return Ok(outcome);
            }
        }
    }

    /// Process one assistant event. Fields are handled independently, in
    /// the order: error, result, end-of-utterance, audio, microphone mode.
    async fn handle_response(
        &mut self,
        response: ConverseResponse,
        playback: &mpsc::Sender<Vec<f32>>,
        stop: &CancellationToken,
    ) -> Result<Option<TurnOutcome>, TurnError> {
        if let Some(error) = response.error() {
            tracing::error!("received error from the assistant: {}", error.message());
            return Err(TurnError::Assistant(error.message().to_string()));
        }
        if response.is_empty() {
            tracing::debug!("empty assistant event");
            return Ok(None);
        }

        if let Some(result) = response.result() {
            if let Some(transcript) = result.spoken_request_text() {
                tracing::info!("transcript of what you said: {}", transcript);
                if QUIT_WORDS.contains(&transcript) {
                    tracing::info!("got it, see you later!");
                    stop.cancel();
                    return Ok(Some(TurnOutcome::Quit));
                }
            }
            if let Some(text) = result.spoken_response_text() {
                tracing::info!("response from the assistant: {}", text);
            }
            if let Some(token) = result.conversation_state() {
                tracing::debug!("conversation state updated ({} bytes)", token.len());
                self.conversation_state = Some(token.to_string());
            }
        }

        if response.event_type() == Some(ConverseEventType::EndOfUtterance) {
            tracing::info!("assistant heard the end of the request");
            stop.cancel();
            return Ok(Some(TurnOutcome::Continue));
        }

        if let Some(audio) = response.audio_out() {
            tracing::debug!("audio out from the assistant");
            play_frames(audio.audio_data(), playback).await;
        }

        if let Some(result) = response.result() {
            match result.microphone_mode() {
                Some(MicrophoneMode::CloseMicrophone) => {
                    tracing::info!("microphone closed");
                    stop.cancel();
                    return Ok(Some(TurnOutcome::Continue));
                }
                Some(MicrophoneMode::DialogFollowOn) => {
                    tracing::info!("continuing dialog");
                }
                Some(MicrophoneMode::Unspecified) => {
                    tracing::warn!("unmanaged microphone mode");
                    stop.cancel();
                    return Ok(Some(TurnOutcome::Continue));
                }
                None => {}
            }
        }
        Ok(None)
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode one synthesized-speech payload and write it to the playback
/// channel one full frame at a time, in order. A trailing fragment smaller
/// than a frame is dropped.
async fn play_frames(audio_data: &str, playback: &mpsc::Sender<Vec<f32>>) {
    let samples = utils::audio::decode(audio_data);
    let mut frames = samples.chunks_exact(PLAYBACK_FRAME_SAMPLES);
    for frame in &mut frames {
        if let Err(e) = playback.send(frame.to_vec()).await {
            tracing::warn!("failed to write to audio out: {}", e);
            return;
        }
    }
    let leftover = frames.remainder().len();
    if leftover > 0 {
        tracing::debug!("dropping undersized audio tail ({} samples)", leftover);
    }
}

/// Background capture-and-send task: encode each 16kHz mono frame and
/// forward it to the session. Send failures are soft; the stop token is
/// checked after every frame; the frame channel closing before the stop
/// signal means the device side died.
pub async fn forward_capture(
    mut frames: mpsc::Receiver<Vec<f32>>,
    requests: RequestTx,
    stop: CancellationToken,
) -> Result<(), CaptureError> {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                tracing::info!("turning off the mic");
                return Ok(());
            }
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    tracing::error!("capture stream ended before the stop signal");
                    return Err(CaptureError::DeviceClosed);
                };
                let audio = utils::audio::encode(&frame);
                let message = ConverseRequest::AudioIn(AudioInEvent::new(audio));
                if let Err(e) = requests.send(message).await {
                    tracing::warn!("could not send audio: {}", e);
                } else {
                    tracing::trace!("sent audio frame ({} samples)", frame.len());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn response(json: &str) -> SessionEvent {
        SessionEvent::Response(serde_json::from_str::<ConverseResponse>(json).unwrap())
    }

    fn pcm16_base64(frame_count: usize, first_sample_of: impl Fn(usize) -> i16) -> String {
        let mut bytes = Vec::with_capacity(frame_count * PLAYBACK_FRAME_SAMPLES * 2);
        for frame in 0..frame_count {
            for sample in 0..PLAYBACK_FRAME_SAMPLES {
                let value = if sample == 0 { first_sample_of(frame) } else { 0 };
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        base64::engine::general_purpose::STANDARD.encode(&bytes)
    }

    struct TurnRun {
        result: Result<TurnOutcome, TurnError>,
        config: ConverseConfig,
        playback: Vec<Vec<f32>>,
        capture_stopped: bool,
    }

    /// Run one turn against a scripted assistant: the driver side takes the
    /// config message, replays `events`, then closes the stream.
    async fn run_scripted_turn(coordinator: &mut Coordinator, events: Vec<SessionEvent>) -> TurnRun {
        let (requests_tx, mut requests_rx) = mpsc::channel(64);
        let (responses_tx, responses_rx) = broadcast::channel(64);
        let (frames_tx, frames_rx) = mpsc::channel::<Vec<f32>>(64);
        let (playback_tx, mut playback_rx) = mpsc::channel(64);

        let driver = async move {
            let config = match requests_rx.recv().await.expect("a config message first") {
                ConverseRequest::Config(event) => event.config().clone(),
                other => panic!("expected config message, got {:?}", other),
            };
            for event in events {
                responses_tx.send(event).expect("turn still receiving");
            }
            config
        };

        let (result, config) = tokio::join!(
            coordinator.run_turn(requests_tx, responses_rx, frames_rx, playback_tx),
            driver,
        );

        let mut playback = Vec::new();
        while let Ok(frame) = playback_rx.try_recv() {
            playback.push(frame);
        }
        TurnRun {
            result,
            config,
            playback,
            capture_stopped: frames_tx.is_closed(),
        }
    }

    #[tokio::test]
    async fn first_turn_config_carries_no_state() {
        let mut coordinator = Coordinator::new();
        let run = run_scripted_turn(&mut coordinator, vec![]).await;

        assert!(run.config.state().is_none());
        // end of stream without a quit is a normal turn end
        assert_eq!(run.result.unwrap(), TurnOutcome::Continue);
    }

    #[tokio::test]
    async fn continuation_token_threads_into_the_next_turn() {
        let mut coordinator = Coordinator::new();

        let run = run_scripted_turn(
            &mut coordinator,
            vec![
                response(r#"{"result": {"conversation_state": "T"}}"#),
                response(r#"{"event_type": "END_OF_UTTERANCE"}"#),
            ],
        )
        .await;
        assert_eq!(run.result.unwrap(), TurnOutcome::Continue);
        assert_eq!(coordinator.conversation_state(), Some("T"));

        let run = run_scripted_turn(&mut coordinator, vec![]).await;
        assert_eq!(run.config.state().unwrap().conversation_state(), "T");
    }

    #[tokio::test]
    async fn quit_transcript_ignores_other_fields_in_the_same_event() {
        let mut coordinator = Coordinator::new();
        let audio = pcm16_base64(1, |_| 7);
        let run = run_scripted_turn(
            &mut coordinator,
            vec![response(&format!(
                r#"{{"audio_out": {{"audio_data": "{}"}}, "result": {{"spoken_request_text": "quit", "conversation_state": "IGNORED"}}}}"#,
                audio
            ))],
        )
        .await;

        assert_eq!(run.result.unwrap(), TurnOutcome::Quit);
        assert!(run.playback.is_empty(), "no playback writes expected");
        assert!(run.capture_stopped);
    }

    #[tokio::test]
    async fn exit_transcript_also_quits() {
        let mut coordinator = Coordinator::new();
        let run = run_scripted_turn(
            &mut coordinator,
            vec![response(r#"{"result": {"spoken_request_text": "exit"}}"#)],
        )
        .await;

        assert_eq!(run.result.unwrap(), TurnOutcome::Quit);
    }

    #[tokio::test]
    async fn follow_on_mode_never_ends_the_turn() {
        let mut coordinator = Coordinator::new();
        let run = run_scripted_turn(
            &mut coordinator,
            vec![
                response(r#"{"result": {"microphone_mode": "DIALOG_FOLLOW_ON"}}"#),
                response(r#"{"result": {"microphone_mode": "DIALOG_FOLLOW_ON"}}"#),
                response(r#"{"result": {"conversation_state": "after"}}"#),
                response(r#"{"event_type": "END_OF_UTTERANCE"}"#),
            ],
        )
        .await;

        assert_eq!(run.result.unwrap(), TurnOutcome::Continue);
        // the events after the follow-ons were still processed
        assert_eq!(coordinator.conversation_state(), Some("after"));
    }

    #[tokio::test]
    async fn close_microphone_ends_the_turn() {
        let mut coordinator = Coordinator::new();
        let run = run_scripted_turn(
            &mut coordinator,
            vec![response(
                r#"{"result": {"microphone_mode": "CLOSE_MICROPHONE"}}"#,
            )],
        )
        .await;

        assert_eq!(run.result.unwrap(), TurnOutcome::Continue);
        assert!(run.capture_stopped);
    }

    #[tokio::test]
    async fn unknown_microphone_mode_ends_the_turn() {
        let mut coordinator = Coordinator::new();
        let run = run_scripted_turn(
            &mut coordinator,
            vec![response(r#"{"result": {"microphone_mode": "BRAND_NEW"}}"#)],
        )
        .await;

        assert_eq!(run.result.unwrap(), TurnOutcome::Continue);
    }

    #[tokio::test]
    async fn error_event_is_fatal_with_no_playback() {
        let mut coordinator = Coordinator::new();
        let run = run_scripted_turn(
            &mut coordinator,
            vec![response(r#"{"error": {"message": "x"}}"#)],
        )
        .await;

        match run.result {
            Err(TurnError::Assistant(message)) => assert_eq!(message, "x"),
            other => panic!("expected assistant error, got {:?}", other),
        }
        assert!(run.playback.is_empty());
    }

    #[tokio::test]
    async fn transport_error_is_fatal() {
        let mut coordinator = Coordinator::new();
        let run = run_scripted_turn(
            &mut coordinator,
            vec![SessionEvent::TransportError("reset by peer".to_string())],
        )
        .await;

        assert!(matches!(run.result, Err(TurnError::Stream(_))));
    }

    #[tokio::test]
    async fn empty_events_are_skipped() {
        let mut coordinator = Coordinator::new();
        let run = run_scripted_turn(
            &mut coordinator,
            vec![
                response("{}"),
                response(r#"{"result": {"conversation_state": "still-here"}}"#),
                response(r#"{"event_type": "END_OF_UTTERANCE"}"#),
            ],
        )
        .await;

        assert_eq!(run.result.unwrap(), TurnOutcome::Continue);
        assert_eq!(coordinator.conversation_state(), Some("still-here"));
    }

    #[tokio::test]
    async fn audio_payload_becomes_sequential_full_frames() {
        let mut coordinator = Coordinator::new();
        let audio = pcm16_base64(3, |frame| (frame as i16 + 1) * 100);
        let run = run_scripted_turn(
            &mut coordinator,
            vec![
                response(&format!(r#"{{"audio_out": {{"audio_data": "{}"}}}}"#, audio)),
                response(r#"{"event_type": "END_OF_UTTERANCE"}"#),
            ],
        )
        .await;

        assert_eq!(run.result.unwrap(), TurnOutcome::Continue);
        assert_eq!(run.playback.len(), 3);
        for (index, frame) in run.playback.iter().enumerate() {
            assert_eq!(frame.len(), PLAYBACK_FRAME_SAMPLES);
            let expected = ((index as i16 + 1) * 100) as f32 / i16::MAX as f32;
            assert!((frame[0] - expected).abs() < 1e-4, "frames must arrive in order");
        }
    }

    #[tokio::test]
    async fn undersized_audio_payload_is_dropped() {
        let mut coordinator = Coordinator::new();
        // 3200 bytes = 1600 samples, less than one 8192-sample frame
        let audio = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 3200]);
        let run = run_scripted_turn(
            &mut coordinator,
            vec![
                response(r#"{"result": {"spoken_request_text": "hello"}}"#),
                response(&format!(r#"{{"audio_out": {{"audio_data": "{}"}}}}"#, audio)),
                response(r#"{"event_type": "END_OF_UTTERANCE"}"#),
            ],
        )
        .await;

        assert_eq!(run.result.unwrap(), TurnOutcome::Continue);
        assert!(run.playback.is_empty(), "no full frame, no write");
        assert!(run.capture_stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_the_turn_normally() {
        let mut coordinator = Coordinator::with_deadline(Duration::from_secs(1));
        let (requests_tx, _requests_rx) = mpsc::channel(64);
        let (responses_tx, responses_rx) = broadcast::channel(64);
        let (_frames_tx, frames_rx) = mpsc::channel(64);
        let (playback_tx, _playback_rx) = mpsc::channel(64);

        // no assistant events arrive at all
        let result = coordinator
            .run_turn(requests_tx, responses_rx, frames_rx, playback_tx)
            .await;
        drop(responses_tx);

        assert_eq!(result.unwrap(), TurnOutcome::Continue);
    }

    #[tokio::test]
    async fn capture_forwards_frames_and_honours_stop() {
        let (frames_tx, frames_rx) = mpsc::channel(4);
        let (requests_tx, mut requests_rx) = mpsc::channel(4);
        let stop = CancellationToken::new();

        let task = tokio::spawn(forward_capture(frames_rx, requests_tx, stop.clone()));

        frames_tx.send(vec![0.0, 0.5, -0.5]).await.unwrap();
        match requests_rx.recv().await.unwrap() {
            ConverseRequest::AudioIn(event) => {
                assert_eq!(event.audio_in(), utils::audio::encode(&[0.0, 0.5, -0.5]));
            }
            other => panic!("expected audio message, got {:?}", other),
        }

        stop.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn capture_send_failure_is_soft() {
        let (frames_tx, frames_rx) = mpsc::channel(4);
        let (requests_tx, requests_rx) = mpsc::channel::<ConverseRequest>(4);
        drop(requests_rx); // session is gone, sends will fail
        let stop = CancellationToken::new();

        let task = tokio::spawn(forward_capture(frames_rx, requests_tx, stop.clone()));

        frames_tx.send(vec![0.1; 8]).await.unwrap();
        frames_tx.send(vec![0.2; 8]).await.unwrap();
        tokio::task::yield_now().await;

        // still running despite the failures, until told to stop
        stop.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn capture_device_failure_is_an_error() {
        let (frames_tx, frames_rx) = mpsc::channel::<Vec<f32>>(4);
        let (requests_tx, _requests_rx) = mpsc::channel(4);
        let stop = CancellationToken::new();

        let task = tokio::spawn(forward_capture(frames_rx, requests_tx, stop));
        drop(frames_tx); // the device side died

        assert!(matches!(
            task.await.unwrap(),
            Err(CaptureError::DeviceClosed)
        ));
    }
}
