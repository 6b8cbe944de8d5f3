//! Payload source for the observable resource.

use chrono::{DateTime, Utc};

use crate::mode::ResourceMode;

/// Build the textual payload for one notification or one-shot read.
///
/// In [`ResourceMode::ElapsedTime`] the payload is the time between
/// `started_at` and `now`. In [`ResourceMode::TickCount`] it is the
/// notification index; one-shot reads pass `None` and report 0.
pub fn current_payload(
    mode: ResourceMode,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    tick: Option<u64>,
) -> Vec<u8> {
    let text = match mode {
        ResourceMode::ElapsedTime => {
            // Clock steps backwards clamp to zero
            let elapsed = (now - started_at).to_std().unwrap_or_default();
            format!("Been running for {elapsed:?}")
        }
        ResourceMode::TickCount => format!("Been running for {}", tick.unwrap_or(0)),
    };
    text.into_bytes()
}
