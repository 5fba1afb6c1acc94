use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use infermux::pipeline::{InferencePipeline, PredictionSink, SinkMode};

/// Run a multi-source inference pipeline over the given video references
/// with a pass-through inference function and a logging sink. Useful for
/// smoke-testing sources and observing pipeline behavior:
///
///   imux "synthetic://gradient?frames=300" --max-fps 30
///   imux clip-a.raw clip-b.raw --sink-mode batch
#[derive(Parser, Debug)]
#[command(name = "imux")]
#[command(about = "Multiplex video sources through a demo inference pipeline")]
struct Args {
    /// Video references: URIs (synthetic://..., file://...) or bare paths
    /// to raw BGRA frame files.
    #[arg(required = true)]
    references: Vec<String>,

    /// Global FPS ceiling for batch emission.
    #[arg(long)]
    max_fps: Option<f64>,

    /// How results are handed to the sink.
    #[arg(long, value_enum, default_value = "adaptive")]
    sink_mode: SinkModeArg,

    /// Grace period in milliseconds for late sources per batch.
    #[arg(long)]
    batch_timeout_ms: Option<u64>,

    /// Log a sink line only every Nth batch.
    #[arg(long, default_value_t = 30)]
    log_every: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkModeArg {
    Adaptive,
    Batch,
    Sequential,
}

impl From<SinkModeArg> for SinkMode {
    fn from(value: SinkModeArg) -> Self {
        match value {
            SinkModeArg::Adaptive => SinkMode::Adaptive,
            SinkModeArg::Batch => SinkMode::Batch,
            SinkModeArg::Sequential => SinkMode::Sequential,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let batches = Arc::new(AtomicU64::new(0));
    let sink_batches = Arc::clone(&batches);
    let log_every = args.log_every.max(1);

    let mut builder = InferencePipeline::builder(args.references.clone())
        .on_video_frame(|frames| {
            // Pass-through "model": echo frame metadata as the prediction.
            Ok(frames
                .iter()
                .map(|frame| {
                    json!({
                        "frame_id": frame.frame_id,
                        "source_id": frame.source_id,
                        "bytes": frame.image.len(),
                        "fps": frame.fps,
                        "measured_fps": frame.measured_fps,
                    })
                })
                .collect())
        })
        .on_prediction(PredictionSink::batch(move |predictions, frames| {
            let batch = sink_batches.fetch_add(1, Ordering::Relaxed);
            if batch % log_every == 0 {
                let ids: Vec<_> = frames
                    .iter()
                    .map(|f| format!("{}#{}", f.source_id, f.frame_id))
                    .collect();
                info!(batch, frames = ?ids, first = %predictions[0], "dispatched");
            }
            Ok(())
        }))
        .on_pipeline_start(|| info!("pipeline started"))
        .on_pipeline_end(|| info!("pipeline finished"))
        .sink_mode(args.sink_mode.into());
    if let Some(max_fps) = args.max_fps {
        builder = builder.max_fps(max_fps);
    }
    if let Some(timeout_ms) = args.batch_timeout_ms {
        builder = builder.batch_collection_timeout(Duration::from_millis(timeout_ms));
    }

    let pipeline = Arc::new(builder.build()?);
    pipeline.start(false).await?;
    for source in pipeline.sources() {
        let description = source.describe_source();
        info!(source = %serde_json::to_string(&description)?, "connected");
    }

    let interrupt_target = Arc::clone(&pipeline);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, terminating pipeline");
            interrupt_target.terminate().await;
        }
    });

    pipeline.join().await;
    info!(batches = batches.load(Ordering::Relaxed), "done");
    Ok(())
}
