//! # Media Batch - Main Entry Point
//!
//! Questo è il punto di ingresso del driver CLI della pipeline.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del sistema di logging con `tracing`
//! - Discovery ricorsiva dei file accettati dal profilo scelto
//! - Intake → enqueue → attesa del batch → export dei risultati
//!
//! ## Flusso di esecuzione:
//! 1. Parsa gli argomenti CLI (directory, profile, format, quality, workers)
//! 2. Configura il logging (INFO o DEBUG a seconda del flag verbose)
//! 3. Registra i codec per il profilo (image transcoder o passthrough)
//! 4. Crea la `Pipeline`, applica gli override dei settings e avvia il batch
//! 5. Scrive gli item completati nella directory di output, se specificata
//!
//! ## Esempio di utilizzo:
//! ```bash
//! media-batch /path/to/photos --profile image --format jpeg --quality 85 -o ./out
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use media_batch_pipeline::{
    completed_exports, formats::format_size, json_output, progress::ProgressView, AppProfile,
    CodecRegistry, FileBackend, ImageTranscoder, InputFormat, IntakeFile, Operation, OutputFormat,
    PassthroughCodec, Pipeline, ResizeMode, ResizeSpec, SettingsPatch,
};

#[derive(Parser)]
#[command(name = "media-batch")]
#[command(about = "Run a local batch processing pipeline over media files")]
struct Args {
    /// Directory containing files to process
    directory: PathBuf,

    /// Tool profile: image, video, pdf or gif
    #[arg(short, long, default_value = "image")]
    profile: String,

    /// Output format override (e.g. jpeg, png, webp)
    #[arg(short, long)]
    format: Option<String>,

    /// Encoding quality (1-100)
    #[arg(short, long)]
    quality: Option<u8>,

    /// Number of parallel workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Resize so the longest side fits this many pixels
    #[arg(long)]
    resize: Option<u32>,

    /// Output directory for processed files (omit to only report)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Emit machine-readable JSON events instead of a progress bar
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Validate arguments
    if !args.directory.exists() {
        return Err(anyhow::anyhow!(
            "Directory does not exist: {}",
            args.directory.display()
        ));
    }
    let profile: AppProfile = args
        .profile
        .parse()
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let format = args
        .format
        .as_deref()
        .map(|f| f.parse::<OutputFormat>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    if let Some(ref output_dir) = args.output {
        if !output_dir.exists() {
            std::fs::create_dir_all(output_dir)?;
            info!("Created output directory: {}", output_dir.display());
        }
        if !output_dir.is_dir() {
            return Err(anyhow::anyhow!(
                "Output path is not a directory: {}",
                output_dir.display()
            ));
        }
    }

    // Register the codec services for this profile. The image profile gets
    // the real transcoder; the others run copy-only until a codec is wired.
    let mut registry = CodecRegistry::new();
    let operation = Operation::for_profile(profile);
    match profile {
        AppProfile::Image => registry.register(operation, Arc::new(ImageTranscoder)),
        _ => {
            info!("🎬 Profile '{}' has no codec wired: running copy-only", profile);
            registry.register(operation, Arc::new(PassthroughCodec));
        }
    }

    let pipeline = Pipeline::new(profile, Arc::new(registry), Arc::new(FileBackend::new()?));

    // CLI overrides become the session settings (and persist like any update)
    if format.is_some() || args.quality.is_some() || args.workers.is_some() || args.resize.is_some()
    {
        pipeline.settings().update(SettingsPatch {
            format,
            quality: args.quality,
            workers: args.workers,
            resize: args.resize.map(|target| {
                Some(ResizeSpec {
                    mode: ResizeMode::LongestSide,
                    target,
                })
            }),
            ..Default::default()
        })?;
    }
    let settings = pipeline.settings().get();
    info!(
        "🎯 Mode: {} → {} (quality: {})",
        profile, settings.format, settings.quality
    );

    // Discover and read accepted files
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(&args.directory)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy().to_string();
        match InputFormat::detect(&name, None) {
            Some(detected) if profile.accepts(detected) => {
                let bytes = tokio::fs::read(entry.path()).await?;
                files.push(IntakeFile::new(name, bytes));
            }
            _ => debug!("Skipping {}", entry.path().display()),
        }
    }
    if files.is_empty() {
        info!("No matching files found in {}", args.directory.display());
        return Ok(());
    }
    info!("📁 Found {} file(s) to process", files.len());

    let report = pipeline.add_files(files);
    if !report.rejected.is_empty() {
        info!("⏩ Skipped {} unsupported file(s)", report.rejected.len());
    }

    let json_subscription = if args.json {
        json_output::JsonEvent::BatchStart {
            items: report.accepted.len(),
        }
        .emit();
        Some(json_output::attach(pipeline.store().clone()))
    } else {
        None
    };
    let view = if args.json {
        None
    } else {
        Some(ProgressView::attach(
            pipeline.store().clone(),
            report.accepted.len() as u64,
        ))
    };

    pipeline.process(&report.accepted);
    pipeline.wait_idle().await;

    let store = pipeline.store();
    let counts = store.counts();
    let duration = pipeline
        .orchestrator()
        .last_batch()
        .and_then(|batch| batch.duration())
        .unwrap_or_default();

    if let Some(view) = &view {
        view.finish();
    }
    if let Some(subscription) = json_subscription {
        store.unsubscribe(subscription);
        json_output::JsonEvent::BatchComplete {
            items: counts.total(),
            completed: counts.completed,
            errored: counts.errored,
            input_bytes: store.total_input_bytes(),
            output_bytes: store.total_output_bytes(),
            duration_seconds: duration.as_secs_f64(),
        }
        .emit();
    }

    // Write results via the export view
    if let Some(ref output_dir) = args.output {
        let entries = completed_exports(store);
        let count = entries.len();
        for entry in entries {
            tokio::fs::write(output_dir.join(&entry.filename), &entry.bytes[..]).await?;
        }
        info!("📁 Wrote {} file(s) to {}", count, output_dir.display());
    }

    let saved = store
        .total_input_bytes()
        .saturating_sub(store.total_output_bytes());
    info!("=== Batch Complete ===");
    info!("Completed: {}", counts.completed);
    info!("Errors: {}", counts.errored);
    info!("Bytes saved: {}", format_size(saved));
    info!("Duration: {:.2}s", duration.as_secs_f64());

    pipeline.shutdown().await;
    Ok(())
}
