use std::time::Duration;

pub const CONVERSE_API_KEY: &str = "CONVERSE_API_KEY";
pub const CONVERSE_URL: &str = "CONVERSE_URL";

pub const BASE_URL: &str = "wss://api.converse.dev/v1";

pub const AUTHORIZATION_HEADER: &str = "Authorization";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
