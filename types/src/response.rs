use crate::audio::Base64EncodedAudioBytes;

/// One event received from the assistant. Several fields may be present in
/// the same event; each is handled independently by the receive loop.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ConverseResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_type: Option<ConverseEventType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    audio_out: Option<AudioOut>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<ConverseResult>,
}

impl ConverseResponse {
    pub fn error(&self) -> Option<&ErrorDetails> {
        self.error.as_ref()
    }

    pub fn event_type(&self) -> Option<ConverseEventType> {
        self.event_type
    }

    pub fn audio_out(&self) -> Option<&AudioOut> {
        self.audio_out.as_ref()
    }

    pub fn result(&self) -> Option<&ConverseResult> {
        self.result.as_ref()
    }

    /// True when no field of interest is set.
    pub fn is_empty(&self) -> bool {
        self.error.is_none()
            && self.event_type.is_none()
            && self.audio_out.is_none()
            && self.result.is_none()
    }
}

/// Details about an assistant-side error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorDetails {
    #[serde(default)]
    code: Option<i32>,
    message: String,
}

impl ErrorDetails {
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(from = "String")]
pub enum ConverseEventType {
    /// The assistant detected the end of the user's spoken request.
    #[serde(rename = "END_OF_UTTERANCE")]
    EndOfUtterance,
    #[serde(rename = "EVENT_TYPE_UNSPECIFIED")]
    Unspecified,
}

impl From<String> for ConverseEventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "END_OF_UTTERANCE" => Self::EndOfUtterance,
            _ => Self::Unspecified,
        }
    }
}

/// Synthesized speech for the current turn
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AudioOut {
    audio_data: Base64EncodedAudioBytes,
}

impl AudioOut {
    pub fn audio_data(&self) -> &str {
        &self.audio_data
    }
}

/// Semantic result fields for the current turn
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ConverseResult {
    /// Transcript of what the user said
    #[serde(default, skip_serializing_if = "Option::is_none")]
    spoken_request_text: Option<String>,

    /// Text of the assistant's spoken answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    spoken_response_text: Option<String>,

    /// Continuation token to resume this dialog on the next turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conversation_state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    microphone_mode: Option<MicrophoneMode>,
}

impl ConverseResult {
    pub fn spoken_request_text(&self) -> Option<&str> {
        self.spoken_request_text.as_deref()
    }

    pub fn spoken_response_text(&self) -> Option<&str> {
        self.spoken_response_text.as_deref()
    }

    pub fn conversation_state(&self) -> Option<&str> {
        self.conversation_state.as_deref()
    }

    pub fn microphone_mode(&self) -> Option<MicrophoneMode> {
        self.microphone_mode
    }
}

/// What the assistant expects the client to do with the microphone after
/// this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(from = "String")]
pub enum MicrophoneMode {
    #[serde(rename = "CLOSE_MICROPHONE")]
    CloseMicrophone,
    #[serde(rename = "DIALOG_FOLLOW_ON")]
    DialogFollowOn,
    #[serde(rename = "MICROPHONE_MODE_UNSPECIFIED")]
    Unspecified,
}

impl From<String> for MicrophoneMode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CLOSE_MICROPHONE" => Self::CloseMicrophone,
            "DIALOG_FOLLOW_ON" => Self::DialogFollowOn,
            _ => Self::Unspecified,
        }
    }
}
