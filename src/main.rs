use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use serde::Serialize;

use framepull::cli::Args;
use framepull::core::{CacheStats, Core, CoreInfo};
use framepull::entities::{FilterMode, NodeRef, VideoFormat, VideoInfo};
use framepull::filters::{BlankSource, Invert, PROP_INDEX, TemporalAverage};
use framepull::{CoreConfig, FrameResult};

#[derive(Debug, Serialize)]
struct NodeReport {
    name: String,
    mode: FilterMode,
    computes: u64,
    cache_enabled: bool,
    cache: Option<CacheStats>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    frames: i32,
    failed: usize,
    mode: &'static str,
    elapsed_ms: f64,
    fps: f64,
    nodes: Vec<NodeReport>,
    core: CoreInfo,
}

fn init_logging(args: &Args) -> Result<()> {
    let log_level = args.log_level();

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| "framepull.log".into());
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("creating log file {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!(
            "Logging to file: {} (level: {:?})",
            log_path.display(),
            log_level
        );
    } else {
        // Console logging with specified verbosity level (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<CoreConfig> {
    let mut config = match &args.config {
        Some(path) => CoreConfig::from_json_file(path)?,
        None => CoreConfig::default(),
    };
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(mb) = args.mem_mb {
        config.max_cache_bytes = mb * 1024 * 1024;
    }
    Ok(config)
}

/// Pull every frame, one blocking call at a time.
fn pull_sync(core: &Core, node: &NodeRef, frames: i32) -> Vec<FrameResult<i64>> {
    (0..frames)
        .map(|n| {
            core.get_frame(node, n)
                .map(|f| f.props().get_int_or(PROP_INDEX, -1))
        })
        .collect()
}

/// Request every frame up front and collect the callbacks.
fn pull_async(core: &Core, node: &NodeRef, frames: i32) -> Vec<FrameResult<i64>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    for n in 0..frames {
        let tx = tx.clone();
        core.get_frame_async(node, n, move |result| {
            let _ = tx.send(result.map(|f| f.props().get_int_or(PROP_INDEX, -1)));
        });
    }
    drop(tx);
    rx.iter().collect()
}

fn node_report(node: &NodeRef) -> NodeReport {
    NodeReport {
        name: node.name().to_string(),
        mode: node.mode(),
        computes: node.compute_count(),
        cache_enabled: node.cache_enabled(),
        cache: node.cache_stats(0),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("framepull {} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    if args.frames <= 0 {
        anyhow::bail!("--frames must be positive, got {}", args.frames);
    }
    if args.width == 0 || args.height == 0 || args.width % 2 != 0 || args.height % 2 != 0 {
        anyhow::bail!(
            "--width/--height must be positive and even, got {}x{}",
            args.width,
            args.height
        );
    }
    let config = load_config(&args)?;
    let core = Core::new(config);

    let info = VideoInfo::new(VideoFormat::YUV420P8, args.width, args.height, args.frames);
    let source = BlankSource::create(&core, info, vec![40, 128, 128]);
    let inverted = Invert::create(&core, &source);
    let averaged = TemporalAverage::create(&core, &inverted);

    let start = Instant::now();
    let results = if args.run_async {
        pull_async(&core, &averaged, args.frames)
    } else {
        pull_sync(&core, &averaged, args.frames)
    };
    let elapsed = start.elapsed();

    let mut failed = 0;
    for result in &results {
        if let Err(e) = result {
            warn!("Frame failed: {}", e);
            failed += 1;
        }
    }

    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    let report = RunReport {
        frames: args.frames,
        failed,
        mode: if args.run_async { "async" } else { "sync" },
        elapsed_ms,
        fps: if elapsed_ms > 0.0 {
            args.frames as f64 * 1000.0 / elapsed_ms
        } else {
            0.0
        },
        nodes: [&source, &inverted, &averaged]
            .into_iter()
            .map(node_report)
            .collect(),
        core: core.core_info(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} frames ({}) in {:.1} ms, {:.1} fps, {} failed",
            report.frames, report.mode, report.elapsed_ms, report.fps, report.failed
        );
        for node in &report.nodes {
            let cache = node
                .cache
                .map(|c| {
                    format!(
                        "live {}/{} ghost {}/{}",
                        c.live, c.max_live, c.ghosts, c.max_ghost
                    )
                })
                .unwrap_or_default();
            println!(
                "  {:<16} {:<16} computes {:>6}  cache {:<3} {}",
                node.name,
                format!("{:?}", node.mode),
                node.computes,
                if node.cache_enabled { "on" } else { "off" },
                cache
            );
        }
        println!(
            "  threads {} (spawned {}), memory {} / {} MB",
            report.core.max_threads,
            report.core.spawned_threads,
            report.core.used_memory / 1024 / 1024,
            report.core.max_memory / 1024 / 1024
        );
    }

    if failed > 0 {
        anyhow::bail!("{} of {} frames failed", failed, args.frames);
    }
    Ok(())
}
