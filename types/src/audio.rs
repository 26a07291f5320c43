/// Audio data encoded as base64 PCM16 little-endian
pub type Base64EncodedAudioBytes = String;

/// Sample rate used on both legs of the conversation.
pub const CONVERSE_SAMPLE_RATE_HERTZ: u32 = 16_000;

/// Playback frame size in samples; undersized trailing data is dropped.
pub const PLAYBACK_FRAME_SAMPLES: usize = 8192;

/// Output volume requested from the assistant.
pub const DEFAULT_VOLUME_PERCENTAGE: u8 = 60;

/// The format of audio sent to the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AudioInEncoding {
    #[serde(rename = "linear16")]
    Linear16,
    #[serde(rename = "flac")]
    Flac,
}

/// The format of audio returned by the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AudioOutEncoding {
    #[serde(rename = "linear16")]
    Linear16,
    #[serde(rename = "mp3")]
    Mp3,
    #[serde(rename = "opus_in_ogg")]
    OpusInOgg,
}
