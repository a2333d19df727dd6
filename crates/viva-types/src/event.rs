use serde::{Deserialize, Serialize};

/// One decoded event from the upstream agent service.
///
/// Events carry an optional content block (incremental assistant text) and,
/// on the terminal event of a turn, token usage. Fields we don't model are
/// preserved in `extra` so an event re-serializes without loss — the relay
/// forwards the original payload to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<EventContent>,
    #[serde(
        rename = "usageMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub usage_metadata: Option<UsageMetadata>,
    /// Legacy terminal-event shape: totals at the top level of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_input_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_output_tokens: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventContent {
    #[serde(default)]
    pub parts: Vec<ContentPart>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Nested usage block. The upstream protocol has gone through several field
/// namings; every known variant is modeled so precedence is explicit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    #[serde(
        rename = "promptTokenCount",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub prompt_token_count: Option<i64>,
    #[serde(
        rename = "candidatesTokenCount",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub candidates_token_count: Option<i64>,
    #[serde(
        rename = "inputTokens",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub input_tokens: Option<i64>,
    #[serde(
        rename = "outputTokens",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_tokens: Option<i64>,
    #[serde(
        rename = "input_tokens",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub input_tokens_snake: Option<i64>,
    #[serde(
        rename = "output_tokens",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_tokens_snake: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_input_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_output_tokens: Option<i64>,
}

impl UsageMetadata {
    /// Resolve the field-name variants into one pair, highest precedence
    /// first: promptTokenCount/candidatesTokenCount, then
    /// inputTokens/outputTokens, then input_tokens/output_tokens, then
    /// total_input_tokens/total_output_tokens.
    pub fn resolve(&self) -> Option<TokenUsage> {
        let variants = [
            (self.prompt_token_count, self.candidates_token_count),
            (self.input_tokens, self.output_tokens),
            (self.input_tokens_snake, self.output_tokens_snake),
            (self.total_input_tokens, self.total_output_tokens),
        ];
        for (input, output) in variants {
            if input.is_some() || output.is_some() {
                return Some(TokenUsage {
                    input: input.unwrap_or(0),
                    output: output.unwrap_or(0),
                });
            }
        }
        None
    }
}

/// Where an event's usage came from. The two wire shapes are kept distinct
/// so the precedence rule can be tested in isolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventUsage {
    /// Nested `usageMetadata` object (current protocol).
    Metadata(UsageMetadata),
    /// Flat `total_input_tokens`/`total_output_tokens` on the event itself
    /// (legacy terminal-event shape).
    LegacyTotals { input: i64, output: i64 },
}

impl EventUsage {
    pub fn resolve(&self) -> Option<TokenUsage> {
        match self {
            Self::Metadata(meta) => meta.resolve(),
            Self::LegacyTotals { input, output } => Some(TokenUsage {
                input: *input,
                output: *output,
            }),
        }
    }
}

/// Input/output token counts for one turn (or a running aggregate).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: i64,
    pub output: i64,
}

impl AgentEvent {
    /// The usage shape this event carries, if any. Nested `usageMetadata`
    /// takes precedence over the legacy flat totals.
    pub fn usage_shape(&self) -> Option<EventUsage> {
        if let Some(meta) = &self.usage_metadata {
            return Some(EventUsage::Metadata(meta.clone()));
        }
        match (self.total_input_tokens, self.total_output_tokens) {
            (Some(input), Some(output)) => Some(EventUsage::LegacyTotals { input, output }),
            _ => None,
        }
    }

    /// Resolved token counts, falling back to the legacy totals when the
    /// nested block is present but carries no recognized field pair.
    pub fn token_usage(&self) -> Option<TokenUsage> {
        if let Some(meta) = &self.usage_metadata {
            if let Some(usage) = meta.resolve() {
                return Some(usage);
            }
        }
        match (self.total_input_tokens, self.total_output_tokens) {
            (Some(input), Some(output)) => Some(TokenUsage { input, output }),
            _ => None,
        }
    }

    /// A turn's terminal event is the one that reports usage.
    pub fn is_terminal(&self) -> bool {
        self.token_usage().is_some()
    }

    /// Text fragments of this event's content parts, in part order.
    pub fn text_fragments(&self) -> impl Iterator<Item = &str> {
        self.content
            .iter()
            .flat_map(|c| c.parts.iter())
            .filter_map(|p| p.text.as_deref())
    }
}
