//! Symbolic kernel interface.
//!
//! The perception layer talks to the rule engine only through [`Kernel`]:
//! asserting facts, querying by predicate, asking for a verb verdict on an
//! input, and validating rule strings the model proposes. [`MemoryKernel`]
//! is an in-process implementation used when no external engine is wired in
//! and in tests.

use std::fmt;

use async_trait::async_trait;

use crate::error::{PerceptionError, Result};

pub mod memory;
pub mod syntax;

pub use memory::MemoryKernel;

// ---------------------------------------------------------------------------
// Terms and facts
// ---------------------------------------------------------------------------

/// A ground argument of a fact.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// A name constant such as `/fix`.
    Atom(String),
    Str(String),
    Int(i64),
    Float(f64),
}

impl Term {
    pub fn atom(name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        if name.starts_with('/') {
            Self::Atom(name.to_string())
        } else {
            Self::Atom(format!("/{}", name))
        }
    }

    pub fn str(value: impl Into<String>) -> Self {
        Self::Str(value.into())
    }

    /// The text of an atom or string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Atom(s) | Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Quote and escape a string for fact text.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(a) => f.write_str(a),
            Self::Str(s) => f.write_str(&quote(s)),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) if x.fract() == 0.0 && x.is_finite() => write!(f, "{:.1}", x),
            Self::Float(x) => write!(f, "{}", x),
        }
    }
}

/// A ground fact `predicate(arg, ...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub predicate: String,
    pub args: Vec<Term>,
}

impl Fact {
    pub fn new(predicate: impl Into<String>, args: Vec<Term>) -> Self {
        Self {
            predicate: predicate.into(),
            args,
        }
    }

    pub fn arg(&self, index: usize) -> Option<&Term> {
        self.args.get(index)
    }

    /// Fact text terminated with a period, as written to `.mg` files.
    pub fn to_source(&self) -> String {
        format!("{}.", self)
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.predicate)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str(")")
    }
}

// ---------------------------------------------------------------------------
// Kernel trait
// ---------------------------------------------------------------------------

/// A verb chosen by the kernel with its confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelVerdict {
    pub verb: String,
    pub confidence: f64,
}

/// The rule engine as seen by the perception layer.
///
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait Kernel: Send + Sync {
    async fn assert_fact(&self, fact: Fact) -> Result<()>;

    /// Assert a batch of facts.
    async fn load_facts(&self, facts: Vec<Fact>) -> Result<()> {
        for fact in facts {
            self.assert_fact(fact).await?;
        }
        Ok(())
    }

    /// All facts of `predicate`, in assertion order.
    async fn query(&self, predicate: &str) -> Result<Vec<Fact>>;

    /// Remove every fact of `predicate`; returns how many were removed.
    async fn retract(&self, predicate: &str) -> Result<usize> {
        Err(PerceptionError::Unsupported(format!("retract({})", predicate)))
    }

    /// Ask the rules for the best verb for `input`.
    async fn classify_input(&self, _input: &str, _candidates: &[String]) -> Result<Option<KernelVerdict>> {
        Ok(None)
    }

    /// Check that a model-proposed rule string is well formed.
    async fn validate_rule(&self, rule: &str) -> Result<()> {
        syntax::validate_rule(rule)
    }

    /// Parse program text and assert its facts into the running kernel.
    /// Returns the number of facts loaded.
    async fn hot_load(&self, source: &str) -> Result<usize> {
        let facts: Vec<Fact> = syntax::parse_program(source)?
            .into_iter()
            .filter_map(|clause| clause.into_fact())
            .collect();
        let n = facts.len();
        self.load_facts(facts).await?;
        Ok(n)
    }
}
