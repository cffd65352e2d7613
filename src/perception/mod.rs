//! Natural language to structured intent.
//!
//! - [`intent`] - `Intent`, `Understanding` and fact sanitization
//! - [`envelope`] - the Piggyback dual-payload envelope and its parser
//! - [`taxonomy`] - verb corpus, regex candidates and heuristic scoring
//! - [`semantic`] - embedding retrieval over canonical and learned phrases
//! - [`matcher`] - the hybrid verb matcher
//! - [`fallback`] - simple and heuristic parsers used when the model fails
//! - [`prompts`] - default system prompts
//! - [`transducer`] - one turn of classification
//! - [`autopoiesis`] - the critic that learns from corrections

pub mod autopoiesis;
pub mod envelope;
pub mod fallback;
pub mod intent;
pub mod matcher;
pub mod prompts;
pub mod semantic;
pub mod taxonomy;
pub mod transducer;

pub use autopoiesis::{Critic, LearnedExemplar};
pub use envelope::{parse_envelope, PiggybackEnvelope};
pub use intent::{Category, Intent, Understanding};
pub use matcher::{match_verb, VerbMatch};
pub use semantic::{SemanticClassifier, SemanticConfig, SemanticMatch};
pub use taxonomy::{Taxonomy, VerbCorpus, VerbEntry};
pub use transducer::{FocusResolution, Role, Transducer, TransducerConfig, Turn};
