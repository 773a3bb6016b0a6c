use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    // Preferred environment variable for the chat-model API key.
    pub AXE_API_KEY: Option<&str> = None;

    // Fallback when AXE_API_KEY is not set.
    pub OPENAI_API_KEY: Option<&str> = None;

    pub OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

    pub AXE_REQUEST_MAX_RETRIES: u64 = 4;

    // Give up on a stream that has gone quiet for this long.
    pub AXE_STREAM_IDLE_TIMEOUT_MS: Duration = Duration::from_millis(300_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}
