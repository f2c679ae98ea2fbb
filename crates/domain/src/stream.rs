use serde::{Deserialize, Serialize};

/// Token usage for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Why a request finished, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinishReason {
    /// The model emitted its end-of-generation token.
    EogToken,
    /// The `max_tokens` budget was exhausted.
    MaxTokens,
    /// A built-in or custom stop trigger matched.
    StopTrigger,
    /// One or more function calls were surfaced to the caller.
    FunctionCall,
    /// The caller aborted mid-generation.
    Abort,
    /// Generation failed mid-stream; the result carries whatever partial
    /// tokens were already streamed.
    Error,
}
