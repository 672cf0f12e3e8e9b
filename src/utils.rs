use rand::RngCore;

/// Builds a W3C `traceparent` value (`00-<trace id>-<parent id>-01`)
/// with freshly generated random ids.
pub fn generate_traceparent() -> String {
    let mut rng = rand::thread_rng();
    let mut trace_id = [0u8; 16];
    let mut parent_id = [0u8; 8];
    rng.fill_bytes(&mut trace_id);
    rng.fill_bytes(&mut parent_id);
    format!("00-{}-{}-01", hex::encode(trace_id), hex::encode(parent_id))
}

/// Cuts `text` to at most `max_chars` characters, appending `...` when something was dropped.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
