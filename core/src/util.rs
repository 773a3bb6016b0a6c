use std::time::Duration;

use rand::Rng;

const INITIAL_DELAY_MS: u64 = 200;
const BACKOFF_FACTOR: f64 = 2.0;

pub(crate) fn backoff(attempt: u64) -> Duration {
    let exp = BACKOFF_FACTOR.powi(attempt.saturating_sub(1) as i32);
    let base = (INITIAL_DELAY_MS as f64 * exp) as u64;
    let jitter = rand::rng().random_range(0.9..1.1);
    Duration::from_millis((base as f64 * jitter) as u64)
}

const TRUNCATED_MARKER: &str = "\n...truncated...\n";

/// Clips `input` to at most `limit` characters, keeping the head and tail
/// around a marker. Counts characters, not bytes, so multi-byte output from a
/// subprocess cannot be split mid-character.
pub(crate) fn clip_string(input: &str, limit: usize) -> String {
    if limit == 0 {
        return input.to_string();
    }
    let chars: Vec<char> = input.chars().collect();
    if chars.len() <= limit {
        return input.to_string();
    }
    let mut half = limit / 2;
    if half == 0 {
        half = limit;
    }
    let prefix: String = chars[..half].iter().collect();
    let suffix: String = chars[chars.len() - half..].iter().collect();
    format!("{prefix}{TRUNCATED_MARKER}{suffix}")
}
