use crate::audio::{
    AudioInEncoding, AudioOutEncoding, Base64EncodedAudioBytes, CONVERSE_SAMPLE_RATE_HERTZ,
    DEFAULT_VOLUME_PERCENTAGE,
};

/// Messages sent to the assistant over the session.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ConverseRequest {
    /// `converse.config` message, first on every session
    #[serde(rename = "converse.config")]
    Config(ConfigEvent),
    /// `converse.audio_in` message carrying one captured frame
    #[serde(rename = "converse.audio_in")]
    AudioIn(AudioInEvent),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConfigEvent {
    config: ConverseConfig,
}

impl ConfigEvent {
    pub fn new(config: ConverseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConverseConfig {
        &self.config
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AudioInEvent {
    audio_in: Base64EncodedAudioBytes,
}

impl AudioInEvent {
    pub fn new(audio_in: Base64EncodedAudioBytes) -> Self {
        Self { audio_in }
    }

    pub fn audio_in(&self) -> &str {
        &self.audio_in
    }
}

/// Session configuration: audio formats for both legs and, when a prior
/// turn left one behind, the continuation state to resume the dialog.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConverseConfig {
    audio_in_config: AudioInConfig,
    audio_out_config: AudioOutConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<ConverseState>,
}

impl ConverseConfig {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn audio_in_config(&self) -> &AudioInConfig {
        &self.audio_in_config
    }

    pub fn audio_out_config(&self) -> &AudioOutConfig {
        &self.audio_out_config
    }

    pub fn state(&self) -> Option<&ConverseState> {
        self.state.as_ref()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AudioInConfig {
    encoding: AudioInEncoding,
    sample_rate_hertz: u32,
}

impl AudioInConfig {
    pub fn encoding(&self) -> AudioInEncoding {
        self.encoding
    }

    pub fn sample_rate_hertz(&self) -> u32 {
        self.sample_rate_hertz
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AudioOutConfig {
    encoding: AudioOutEncoding,
    sample_rate_hertz: u32,
    volume_percentage: u8,
}

impl AudioOutConfig {
    pub fn encoding(&self) -> AudioOutEncoding {
        self.encoding
    }

    pub fn sample_rate_hertz(&self) -> u32 {
        self.sample_rate_hertz
    }

    pub fn volume_percentage(&self) -> u8 {
        self.volume_percentage
    }
}

/// Opaque continuation token from a prior turn, passed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConverseState {
    conversation_state: String,
}

impl ConverseState {
    pub fn new(conversation_state: String) -> Self {
        Self { conversation_state }
    }

    pub fn conversation_state(&self) -> &str {
        &self.conversation_state
    }
}

pub struct ConfigBuilder {
    config: ConverseConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ConverseConfig {
                audio_in_config: AudioInConfig {
                    encoding: AudioInEncoding::Linear16,
                    sample_rate_hertz: CONVERSE_SAMPLE_RATE_HERTZ,
                },
                audio_out_config: AudioOutConfig {
                    encoding: AudioOutEncoding::Linear16,
                    sample_rate_hertz: CONVERSE_SAMPLE_RATE_HERTZ,
                    volume_percentage: DEFAULT_VOLUME_PERCENTAGE,
                },
                state: None,
            },
        }
    }

    pub fn with_audio_in_encoding(mut self, encoding: AudioInEncoding) -> Self {
        self.config.audio_in_config.encoding = encoding;
        self
    }

    pub fn with_audio_out_encoding(mut self, encoding: AudioOutEncoding) -> Self {
        self.config.audio_out_config.encoding = encoding;
        self
    }

    pub fn with_volume_percentage(mut self, volume_percentage: u8) -> Self {
        self.config.audio_out_config.volume_percentage = volume_percentage;
        self
    }

    pub fn with_conversation_state(mut self, token: String) -> Self {
        self.config.state = Some(ConverseState::new(token));
        self
    }

    pub fn build(self) -> ConverseConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_without_state_omits_the_field() {
        let config = ConverseConfig::builder().build();
        let request = ConverseRequest::Config(ConfigEvent::new(config));
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["type"], "converse.config");
        assert!(json["config"].get("state").is_none());
        assert_eq!(json["config"]["audio_in_config"]["encoding"], "linear16");
        assert_eq!(json["config"]["audio_in_config"]["sample_rate_hertz"], 16000);
        assert_eq!(json["config"]["audio_out_config"]["volume_percentage"], 60);
    }

    #[test]
    fn config_carries_continuation_state() {
        let config = ConverseConfig::builder()
            .with_conversation_state("dGgNCg==".to_string())
            .build();
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["state"]["conversation_state"], "dGgNCg==");
    }

    #[test]
    fn audio_in_message_is_tagged() {
        let request = ConverseRequest::AudioIn(AudioInEvent::new("AAAA".to_string()));
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["type"], "converse.audio_in");
        assert_eq!(json["audio_in"], "AAAA");
    }
}
