//! Assistant persona — display name plus system prompt, owned by a session
//! and carried in its snapshot.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assistant {
    name: String,
    system_prompt: String,
}

const DEFAULT_NAME: &str = "Retriever";
const DEFAULT_SYSTEM_PROMPT: &str = "You are Retriever, a cheerful and loyal dog assistant. \
You answer briefly, plainly, and honestly, and you never invent facts. \
When you do not know something, say so.";

impl Assistant {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }
}

impl Default for Assistant {
    fn default() -> Self {
        Self::new(DEFAULT_NAME, DEFAULT_SYSTEM_PROMPT)
    }
}
