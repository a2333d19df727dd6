use viva_types::event::{AgentEvent, TokenUsage};

/// Concatenate every text fragment of every event, in event order. Events
/// without content parts contribute nothing.
pub fn extract_text(events: &[AgentEvent]) -> String {
    events.iter().flat_map(|e| e.text_fragments()).collect()
}

/// Token counts from the first usage-bearing event, if any.
pub fn extract_usage(events: &[AgentEvent]) -> Option<TokenUsage> {
    events.iter().find_map(|e| e.token_usage())
}
