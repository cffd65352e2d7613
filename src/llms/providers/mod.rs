//! Concrete completion clients.
//!
//! | Provider | Module | Wire shape |
//! |----------|--------|------------|
//! | OpenAI, xAI, OpenRouter | [`openai`] | `/chat/completions` |
//! | Z.AI | [`zai`] | `/chat/completions` (GLM dialect) |
//! | Anthropic | [`anthropic`] | `/v1/messages` |
//! | Gemini | [`gemini`] | `:generateContent` |
//! | Claude / Codex CLI | [`cli`] | subprocess, JSON on stdout |

pub mod anthropic;
pub mod cli;
pub mod gemini;
pub mod openai;
pub mod zai;
