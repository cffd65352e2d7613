//! # Perception Layer
//!
//! Turns a user's natural-language message into a structured intent for a
//! neuro-symbolic coding agent.
//!
//! Every turn asks an LLM for a Piggyback envelope: a `control_packet` the
//! agent acts on and a `surface_response` shown to the user. Regex
//! candidates, embedding retrieval and a symbolic kernel vote on the verb
//! before the model is called; rule updates the model proposes are
//! validated and repaired; and when the model is unavailable an offline
//! heuristic still produces a coherent intent.
//!
//! - [`llms`] - provider clients behind one [`Completer`] trait
//! - [`kernel`] - the symbolic kernel interface and an in-memory kernel
//! - [`embedding`] - embedding engines for semantic classification
//! - [`perception`] - intents, envelopes, taxonomy, transducer and critic
//! - [`layer`] - the process-wide perception layer

pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod kernel;
pub mod layer;
pub mod llms;
pub mod perception;

pub use context::Context;
pub use error::{PerceptionError, Result};
pub use kernel::{Kernel, MemoryKernel};
pub use layer::{close_perception_layer, init_perception_layer, perception_layer, LayerConfig, PerceptionLayer};
pub use llms::{new_completer, Completer};
pub use perception::{Category, Critic, Intent, PiggybackEnvelope, Transducer, Understanding};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
