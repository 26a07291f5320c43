pub mod client;
pub mod conversation;

pub use converse_types as types;
pub use converse_utils as utils;

pub use client::{connect, ClientError, Session, SessionEvent};
pub use conversation::{Coordinator, TurnError, TurnOutcome};
