//! Turn boundary detection
//!
//! llama-cli has no message framing. It prints an interactive prompt when it
//! is ready for more input, so the end of a turn is inferred from the text.
//! Output that happens to contain the prompt text ends a turn early; there is
//! no structured signal to tell the two apart.

/// Decides whether the output accumulated so far completes a turn
pub trait BoundaryDetector: Send + Sync {
    fn is_boundary(&self, buffer: &str) -> bool;
}

/// Matches the interactive prompt at the start of a line, or trailing the buffer
#[derive(Debug, Clone)]
pub struct PromptBoundary {
    prompt: String,
    line_prompt: String,
}

impl PromptBoundary {
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            line_prompt: format!("\n{}", prompt),
        }
    }
}

impl Default for PromptBoundary {
    fn default() -> Self {
        Self::new("> ")
    }
}

impl BoundaryDetector for PromptBoundary {
    fn is_boundary(&self, buffer: &str) -> bool {
        if self.prompt.is_empty() {
            return false;
        }
        buffer.contains(&self.line_prompt)
            || buffer.ends_with(&self.line_prompt)
            || buffer.ends_with(&self.prompt)
    }
}
