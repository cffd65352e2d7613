//! perceive: classify one utterance and print the result as JSON.
//!
//! # Usage
//!
//! ```bash
//! perceive "fix the null pointer in auth.go"
//! echo "what does parser.rs do?" | perceive --understanding
//! ```
//!
//! The provider comes from `.perception/config.json` in the current
//! directory or from the `*_API_KEY` environment variables. With no provider
//! configured the offline heuristic classifier is used.
//!
//! - `RUST_LOG` - tracing filter (default: "info,perception=debug")

use std::io::Read;
use std::sync::Arc;

use perception::config::UserConfig;
use perception::kernel::{Kernel, MemoryKernel};
use perception::layer::{embedder_from_config, init_perception_layer, LayerConfig};
use perception::llms::dispatcher::completer_from_user_config;
use perception::perception::fallback::heuristic_intent;
use perception::perception::taxonomy::{Taxonomy, DEFAULT_TAXONOMY};
use perception::{Context, PerceptionError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,perception=debug".into()),
        )
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let understanding = match args.iter().position(|a| a == "--understanding") {
        Some(i) => {
            args.remove(i);
            true
        }
        None => false,
    };
    let input = if args.is_empty() {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf.trim().to_string()
    } else {
        args.join(" ")
    };
    if input.is_empty() {
        anyhow::bail!("no input: pass an utterance as arguments or on stdin");
    }

    let ctx = Context::background();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let workspace = std::env::current_dir()?;
    let user = UserConfig::load(&UserConfig::default_path(&workspace))?;
    let kernel: Arc<dyn Kernel> = Arc::new(MemoryKernel::new());

    let completer = match completer_from_user_config(user.as_ref()) {
        Ok(completer) => completer,
        Err(PerceptionError::NoProvider) => {
            tracing::warn!("no LLM provider configured, using the offline classifier");
            kernel.hot_load(DEFAULT_TAXONOMY).await?;
            let taxonomy = Taxonomy::load(&ctx, kernel.as_ref()).await;
            let intent = heuristic_intent(&ctx, &input, &taxonomy, None, Some(kernel.as_ref())).await?;
            if understanding {
                let u = perception::Understanding::from_intent(&intent, &input);
                println!("{}", serde_json::to_string_pretty(&u)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&intent)?);
            }
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let layer = init_perception_layer(
        &ctx,
        kernel,
        LayerConfig {
            completer: Some(completer),
            embedder: embedder_from_config(user.as_ref()),
            workspace: Some(workspace),
            ..Default::default()
        },
    )
    .await?;

    if understanding {
        let u = layer.transducer().parse_understanding(&ctx, &input, &[]).await?;
        println!("{}", serde_json::to_string_pretty(&u)?);
    } else {
        let intent = layer.transducer().parse_intent(&ctx, &input).await?;
        println!("{}", serde_json::to_string_pretty(&intent)?);
    }
    Ok(())
}
