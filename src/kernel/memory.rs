//! In-process kernel holding facts in memory.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::kernel::syntax::{self, Clause};
use crate::kernel::{Fact, Kernel, KernelVerdict, Term};

/// Minimum `semantic_match` similarity (0-100) the kernel acts on.
pub const SEMANTIC_VERDICT_THRESHOLD: i64 = 60;

/// Bonus given to verbs that also came out of regex candidate generation.
pub const CANDIDATE_BONUS: i64 = 10;

#[derive(Debug, Default)]
struct Store {
    facts: Vec<Fact>,
    keys: HashSet<String>,
    rules: Vec<Clause>,
}

/// A fact store implementing [`Kernel`].
///
/// Facts are de-duplicated by their text form and returned in assertion
/// order. Rules are validated and kept but not evaluated; verb verdicts
/// come from `semantic_match` facts.
#[derive(Debug, Default)]
pub struct MemoryKernel {
    store: RwLock<Store>,
}

impl MemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A kernel preloaded with program text.
    pub fn from_source(source: &str) -> Result<Self> {
        let kernel = Self::new();
        kernel.load_source(source)?;
        Ok(kernel)
    }

    /// Load facts and rules from program text; returns the number of new facts.
    pub fn load_source(&self, source: &str) -> Result<usize> {
        let clauses = syntax::parse_program(source)?;
        let mut store = self.store.write();
        let mut added = 0;
        for clause in clauses {
            if clause.body.is_empty() {
                if let Some(fact) = clause.clone().into_fact() {
                    if insert(&mut store, fact) {
                        added += 1;
                    }
                    continue;
                }
            }
            syntax::validate_rule(&format!("{}.", render_clause(&clause)))?;
            store.rules.push(clause);
        }
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.store.read().facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rule_count(&self) -> usize {
        self.store.read().rules.len()
    }

    pub fn facts_of(&self, predicate: &str) -> Vec<Fact> {
        self.store
            .read()
            .facts
            .iter()
            .filter(|f| f.predicate == predicate)
            .cloned()
            .collect()
    }

    /// Remove every fact of `predicate`; returns how many were removed.
    pub fn remove_facts(&self, predicate: &str) -> usize {
        let mut store = self.store.write();
        let Store { facts, keys, .. } = &mut *store;
        let mut removed = 0;
        facts.retain(|f| {
            if f.predicate != predicate {
                return true;
            }
            keys.remove(&f.to_string());
            removed += 1;
            false
        });
        removed
    }
}

fn insert(store: &mut Store, fact: Fact) -> bool {
    if store.keys.insert(fact.to_string()) {
        store.facts.push(fact);
        true
    } else {
        false
    }
}

fn render_clause(clause: &Clause) -> String {
    use crate::kernel::syntax::{Arg, BodyItem, Literal};

    fn arg(a: &Arg) -> String {
        match a {
            Arg::Term(t) => t.to_string(),
            Arg::Var(v) => v.clone(),
        }
    }
    fn literal(l: &Literal) -> String {
        let args: Vec<String> = l.args.iter().map(arg).collect();
        format!("{}({})", l.predicate, args.join(", "))
    }

    let head = literal(&clause.head);
    if clause.body.is_empty() {
        return head;
    }
    let body: Vec<String> = clause
        .body
        .iter()
        .map(|item| match item {
            BodyItem::Positive(l) => literal(l),
            BodyItem::Negated(l) => format!("!{}", literal(l)),
            BodyItem::Compare { left, op, right } => format!("{} {} {}", arg(left), op, arg(right)),
        })
        .collect();
    format!("{} :- {}", head, body.join(", "))
}

#[async_trait]
impl Kernel for MemoryKernel {
    async fn assert_fact(&self, fact: Fact) -> Result<()> {
        insert(&mut self.store.write(), fact);
        Ok(())
    }

    async fn load_facts(&self, facts: Vec<Fact>) -> Result<()> {
        let mut store = self.store.write();
        for fact in facts {
            insert(&mut store, fact);
        }
        Ok(())
    }

    async fn query(&self, predicate: &str) -> Result<Vec<Fact>> {
        Ok(self.facts_of(predicate))
    }

    /// Pick the verb of the strongest `semantic_match` fact for `input`.
    ///
    /// Verbs among `candidates` get a small bonus; matches below
    /// [`SEMANTIC_VERDICT_THRESHOLD`] are ignored.
    async fn classify_input(&self, input: &str, candidates: &[String]) -> Result<Option<KernelVerdict>> {
        let store = self.store.read();
        let best = store
            .facts
            .iter()
            .filter(|f| f.predicate == "semantic_match" && f.args.len() >= 6)
            .filter(|f| f.args[0].as_str() == Some(input))
            .filter_map(|f| {
                let verb = match &f.args[2] {
                    Term::Atom(v) => v.clone(),
                    _ => return None,
                };
                let similarity = f.args[5].as_i64()?;
                Some((verb, similarity))
            })
            .filter(|(_, sim)| *sim >= SEMANTIC_VERDICT_THRESHOLD)
            .max_by_key(|(verb, sim)| {
                let bonus = if candidates.iter().any(|c| c == verb) { CANDIDATE_BONUS } else { 0 };
                sim + bonus
            });

        Ok(best.map(|(verb, similarity)| KernelVerdict {
            verb,
            confidence: (similarity.clamp(0, 100) as f64) / 100.0,
        }))
    }

    async fn retract(&self, predicate: &str) -> Result<usize> {
        Ok(self.remove_facts(predicate))
    }

    async fn hot_load(&self, source: &str) -> Result<usize> {
        self.load_source(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn semantic(input: &str, verb: &str, sim: i64) -> Fact {
        Fact::new(
            "semantic_match",
            vec![
                Term::str(input),
                Term::str("phrase"),
                Term::atom(verb),
                Term::str("none"),
                Term::Int(1),
                Term::Int(sim),
            ],
        )
    }

    #[tokio::test]
    async fn test_dedup_and_query_order() {
        let k = MemoryKernel::new();
        k.assert_fact(Fact::new("p", vec![Term::Int(1)])).await.unwrap();
        k.assert_fact(Fact::new("p", vec![Term::Int(2)])).await.unwrap();
        k.assert_fact(Fact::new("p", vec![Term::Int(1)])).await.unwrap();
        let facts = k.query("p").await.unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].args[0], Term::Int(1));
    }

    #[tokio::test]
    async fn test_load_source_keeps_rules() {
        let k = MemoryKernel::from_source(
            "verb_def(/fix, /mutation, \"coder\", 90).\nfixes(V) :- verb_def(V, /mutation, _, _).",
        )
        .unwrap();
        assert_eq!(k.len(), 1);
        assert_eq!(k.rule_count(), 1);
    }

    #[tokio::test]
    async fn test_classify_input_prefers_candidates_and_threshold() {
        let k = MemoryKernel::new();
        k.load_facts(vec![
            semantic("review auth", "/review", 80),
            semantic("review auth", "/security", 85),
            semantic("review auth", "/explain", 40),
            semantic("other input", "/delete", 99),
        ])
        .await
        .unwrap();

        let verdict = k.classify_input("review auth", &["/review".to_string()]).await.unwrap().unwrap();
        assert_eq!(verdict.verb, "/review");
        assert!((verdict.confidence - 0.8).abs() < 1e-9);

        let verdict = k.classify_input("review auth", &[]).await.unwrap().unwrap();
        assert_eq!(verdict.verb, "/security");

        assert!(k.classify_input("unknown", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retract_and_hot_load() {
        let k = MemoryKernel::new();
        let n = k.hot_load("a(/x).\na(/y).\nb(1).").await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(k.retract("a").await.unwrap(), 2);
        assert_eq!(k.len(), 1);
        k.assert_fact(Fact::new("a", vec![Term::atom("x")])).await.unwrap();
        assert_eq!(k.facts_of("a").len(), 1);
    }
}
