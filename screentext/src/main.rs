use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use screentext::config::{Config, EngineKind};
use screentext::engine::{OcrEngineAdapter, RecognitionRequest};

#[derive(Parser)]
#[command(name = "screentext")]
#[command(about = "Recognize text in screen captures")]
struct Args {
    /// Engine to use: service, cloud or manga (defaults to OCR_ENGINE)
    #[arg(long)]
    engine: Option<EngineKind>,

    /// Language code of the text (defaults to OCR_LANGUAGE)
    #[arg(long)]
    language: Option<String>,

    /// Print the languages the engine supports and exit
    #[arg(long)]
    list_languages: bool,

    /// Image files to recognize
    images: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screentext=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if args.images.is_empty() && !args.list_languages {
        return Err(anyhow::anyhow!("no image files given"));
    }

    let mut config = Config::from_env();
    if let Some(kind) = args.engine {
        config.engine.kind = kind;
    }
    let language = args
        .language
        .unwrap_or_else(|| config.engine.language.clone());

    tracing::info!("Initializing OCR engine: {:?}...", config.engine.kind);
    let adapter = OcrEngineAdapter::from_config(&config)?;
    adapter.start().await?;

    let cancel_token = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel_token.clone()));

    let languages = adapter.get_supported_languages().await;
    if args.list_languages {
        for code in &languages {
            println!("{code}");
        }
    } else if !languages.is_empty() && !languages.contains(&language) {
        tracing::warn!(
            "Engine {} does not list language '{}' (supported: {})",
            adapter.name(),
            language,
            languages.join(", ")
        );
    }

    for path in &args.images {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to read {}: {}", path.display(), e);
                continue;
            }
        };

        let request = RecognitionRequest::new(bytes, language.as_str());
        let result = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = adapter.recognize(request) => result,
        };

        match result {
            Some(result) => println!("{}\n{}", path.display(), result.text()),
            None => tracing::warn!("No text recognized in {}", path.display()),
        }
    }

    adapter.shutdown().await;
    Ok(())
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping OCR engine...");
    cancel_token.cancel();
}
