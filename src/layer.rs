//! Process-wide perception layer.
//!
//! The verb taxonomy, the semantic classifier and the transducer are shared
//! by every turn. [`init_perception_layer`] builds them once;
//! [`close_perception_layer`] drops them. Both are idempotent. Tests and
//! embedders that want their own instance use [`PerceptionLayer::build`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use crate::config::{self, Provider, ProviderConfig, UserConfig, WORKSPACE_DIR};
use crate::context::Context;
use crate::embedding::{EmbeddingEngine, GenAiEmbedder};
use crate::error::Result;
use crate::kernel::Kernel;
use crate::llms::{new_completer, Completer};
use crate::perception::autopoiesis::Critic;
use crate::perception::semantic::store::{MemoryPatternStore, PatternStore, SqlitePatternStore};
use crate::perception::semantic::{SemanticClassifier, SemanticConfig};
use crate::perception::taxonomy::{Taxonomy, DEFAULT_TAXONOMY};
use crate::perception::transducer::{Transducer, TransducerConfig};

/// Rule directory inside the workspace state directory.
pub const MANGLE_DIR: &str = "mangle";

/// How to assemble the layer.
#[derive(Default)]
pub struct LayerConfig {
    /// A ready client. Takes precedence over `provider`.
    pub completer: Option<Arc<dyn Completer>>,
    /// Build the client from this config. When neither is set, the
    /// workspace config file and environment are consulted.
    pub provider: Option<ProviderConfig>,
    /// Without an engine the semantic classifier is disabled.
    pub embedder: Option<Arc<dyn EmbeddingEngine>>,
    /// Workspace root. Enables `learned_patterns.db` and `learned_taxonomy.mg`.
    pub workspace: Option<PathBuf>,
    pub transducer: TransducerConfig,
    pub semantic: SemanticConfig,
}

impl std::fmt::Debug for LayerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerConfig")
            .field("completer", &self.completer.as_ref().map(|c| c.provider().to_string()))
            .field("provider", &self.provider)
            .field("embedder", &self.embedder.as_ref().map(|e| e.name().to_string()))
            .field("workspace", &self.workspace)
            .field("transducer", &self.transducer)
            .field("semantic", &self.semantic)
            .finish()
    }
}

/// A Gemini embedder when a Gemini key is in the config file or environment.
pub fn embedder_from_config(user: Option<&UserConfig>) -> Option<Arc<dyn EmbeddingEngine>> {
    let key = user
        .and_then(|u| u.key_for(Provider::Gemini).map(String::from))
        .or_else(|| std::env::var(Provider::Gemini.env_key()).ok())
        .filter(|k| !k.trim().is_empty())?;
    match GenAiEmbedder::new(key) {
        Ok(engine) => Some(Arc::new(engine)),
        Err(e) => {
            log::warn!("Gemini embedder unavailable: {}", e);
            None
        }
    }
}

pub struct PerceptionLayer {
    kernel: Arc<dyn Kernel>,
    taxonomy: Arc<Taxonomy>,
    semantic: Option<Arc<SemanticClassifier>>,
    store: Arc<dyn PatternStore>,
    transducer: Arc<Transducer>,
    critic: Arc<Critic>,
}

impl std::fmt::Debug for PerceptionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerceptionLayer")
            .field("verbs", &self.taxonomy.corpus().len())
            .field("semantic", &self.semantic)
            .field("transducer", &self.transducer)
            .field("critic", &self.critic)
            .finish()
    }
}

impl PerceptionLayer {
    /// Assemble a layer over `kernel`.
    ///
    /// Loads the bundled taxonomy when the kernel has no `verb_def` or
    /// `intent_definition` facts,
    /// replays `learned_taxonomy.mg`, and hydrates the semantic classifier
    /// when an embedder is configured. A classifier that fails to build is
    /// logged and left out.
    pub async fn build(ctx: &Context, kernel: Arc<dyn Kernel>, config: LayerConfig) -> Result<Self> {
        let completer = match (config.completer, config.provider) {
            (Some(completer), _) => completer,
            (None, Some(provider)) => new_completer(&provider)?,
            (None, None) => {
                let user = match &config.workspace {
                    Some(ws) => UserConfig::load(&UserConfig::default_path(ws))?,
                    None => None,
                };
                new_completer(&config::resolve_provider(user.as_ref())?)?
            }
        };

        if ctx.run_result(kernel.query("verb_def")).await?.is_empty()
            && ctx.run_result(kernel.query("intent_definition")).await?.is_empty()
        {
            let n = ctx.run_result(kernel.hot_load(DEFAULT_TAXONOMY)).await?;
            log::info!("Loaded bundled taxonomy ({} facts)", n);
        }

        let state_dir = config.workspace.as_deref().map(|ws| ws.join(WORKSPACE_DIR));
        let store: Arc<dyn PatternStore> = match &state_dir {
            Some(dir) => Arc::new(SqlitePatternStore::in_dir(dir)?),
            None => Arc::new(MemoryPatternStore::new()),
        };

        let taxonomy = Arc::new(Taxonomy::load(ctx, kernel.as_ref()).await);

        let semantic = match config.embedder {
            Some(engine) => {
                match SemanticClassifier::new(ctx, engine, kernel.as_ref(), store.clone(), config.semantic).await {
                    Ok(classifier) => Some(Arc::new(classifier)),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        log::warn!("Semantic classifier disabled: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let mut critic = Critic::new(completer.clone(), kernel.clone())
            .with_store(store.clone())
            .with_taxonomy(taxonomy.clone());
        if let Some(dir) = &state_dir {
            critic = critic.with_learned_dir(dir.join(MANGLE_DIR));
        }
        if let Some(semantic) = &semantic {
            critic = critic.with_semantic(semantic.clone());
        }
        critic.load_learned(ctx).await?;

        let mut transducer = Transducer::new(completer, taxonomy.clone())
            .with_kernel(kernel.clone())
            .with_config(config.transducer);
        if let Some(semantic) = &semantic {
            transducer = transducer.with_semantic(semantic.clone());
        }

        log::info!(
            "Perception layer ready: {} verbs, semantic {}",
            taxonomy.corpus().len(),
            if semantic.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            kernel,
            taxonomy,
            semantic,
            store,
            transducer: Arc::new(transducer),
            critic: Arc::new(critic),
        })
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    pub fn taxonomy(&self) -> &Arc<Taxonomy> {
        &self.taxonomy
    }

    pub fn semantic(&self) -> Option<&Arc<SemanticClassifier>> {
        self.semantic.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn PatternStore> {
        &self.store
    }

    pub fn transducer(&self) -> &Arc<Transducer> {
        &self.transducer
    }

    pub fn critic(&self) -> &Arc<Critic> {
        &self.critic
    }
}

// ---------------------------------------------------------------------------
// Global instance
// ---------------------------------------------------------------------------

static LAYER: Lazy<Mutex<Option<Arc<PerceptionLayer>>>> = Lazy::new(|| Mutex::new(None));

/// Build the shared layer, or return the one already built.
pub async fn init_perception_layer(
    ctx: &Context,
    kernel: Arc<dyn Kernel>,
    config: LayerConfig,
) -> Result<Arc<PerceptionLayer>> {
    let mut guard = LAYER.lock().await;
    if let Some(layer) = guard.as_ref() {
        return Ok(layer.clone());
    }
    let layer = Arc::new(PerceptionLayer::build(ctx, kernel, config).await?);
    *guard = Some(layer.clone());
    Ok(layer)
}

/// Drop the shared layer. Safe to call when none is initialized.
pub async fn close_perception_layer() {
    if LAYER.lock().await.take().is_some() {
        log::info!("Perception layer closed");
    }
}

/// The shared layer, if initialized.
pub async fn perception_layer() -> Option<Arc<PerceptionLayer>> {
    LAYER.lock().await.clone()
}

/// The workspace rule directory for `workspace`.
pub fn mangle_dir(workspace: &Path) -> PathBuf {
    workspace.join(WORKSPACE_DIR).join(MANGLE_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::BagOfWordsEmbedder;
    use crate::kernel::MemoryKernel;
    use crate::llms::completer::testing::ScriptedCompleter;
    use crate::perception::autopoiesis::LEARNED_TAXONOMY_FILE;
    use crate::perception::semantic::store::PATTERN_DB_FILE;

    fn scripted() -> Option<Arc<dyn Completer>> {
        Some(Arc::new(ScriptedCompleter::new(&[])))
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let ctx = Context::background();
        let kernel = Arc::new(MemoryKernel::new());
        let config = LayerConfig {
            completer: scripted(),
            ..Default::default()
        };
        let first = init_perception_layer(&ctx, kernel.clone(), config).await.unwrap();
        assert_eq!(first.taxonomy().corpus().len(), 20);
        assert!(first.semantic().is_none());
        assert!(!kernel.facts_of("verb_def").is_empty());

        let second = init_perception_layer(
            &ctx,
            Arc::new(MemoryKernel::new()),
            LayerConfig {
                completer: scripted(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(perception_layer().await.is_some());

        close_perception_layer().await;
        close_perception_layer().await;
        assert!(perception_layer().await.is_none());
    }

    #[tokio::test]
    async fn test_build_with_workspace_and_embedder() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::background();
        let mangle = mangle_dir(dir.path());
        std::fs::create_dir_all(&mangle).unwrap();
        std::fs::write(
            mangle.join(LEARNED_TAXONOMY_FILE),
            "learned_exemplar(\"ship it\", /deploy, \"none\", \"\", 80).\n",
        )
        .unwrap();

        let kernel = Arc::new(MemoryKernel::new());
        let layer = PerceptionLayer::build(
            &ctx,
            kernel.clone(),
            LayerConfig {
                completer: scripted(),
                embedder: Some(Arc::new(BagOfWordsEmbedder::new(32))),
                workspace: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(dir.path().join(WORKSPACE_DIR).join(PATTERN_DB_FILE).exists());
        assert!(!layer.semantic().unwrap().embedded().is_empty());
        assert_eq!(kernel.facts_of("learned_exemplar").len(), 1);
        let corpus = layer.taxonomy().corpus();
        assert!(corpus.get("/deploy").unwrap().synonyms.iter().any(|s| s == "ship it"));
    }

    #[tokio::test]
    async fn test_build_survives_truncated_learned_file() {
        let dir = tempfile::tempdir().unwrap();
        let mangle = mangle_dir(dir.path());
        std::fs::create_dir_all(&mangle).unwrap();
        std::fs::write(
            mangle.join(LEARNED_TAXONOMY_FILE),
            "learned_exemplar(\"ship it\", /deploy, \"none\", \"\", 80).\nlearned_exemplar(\"half wri",
        )
        .unwrap();

        let kernel = Arc::new(MemoryKernel::new());
        let layer = PerceptionLayer::build(
            &Context::background(),
            kernel.clone(),
            LayerConfig {
                completer: scripted(),
                workspace: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(kernel.facts_of("learned_exemplar").len(), 1);
        assert_eq!(layer.taxonomy().corpus().len(), 20);
    }

    #[tokio::test]
    async fn test_build_keeps_existing_taxonomy() {
        let kernel = Arc::new(MemoryKernel::from_source("verb_def(/fix, /mutation, \"coder\", 90).").unwrap());
        let layer = PerceptionLayer::build(
            &Context::background(),
            kernel,
            LayerConfig {
                completer: scripted(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(layer.taxonomy().corpus().len(), 1);
    }
}
