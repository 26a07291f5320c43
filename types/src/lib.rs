pub mod audio;
pub mod request;
pub mod response;

pub use request::{ConverseConfig, ConverseRequest, ConverseState};
pub use response::{ConverseEventType, ConverseResponse, ConverseResult, MicrophoneMode};
