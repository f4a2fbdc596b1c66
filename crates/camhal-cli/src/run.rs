// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use crate::utils;
use camhal::factory::{FactoryFlags, FrameFactory};
use camhal::meta::PipelineParams;
use clap::Args as ClapArgs;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Pipeline topology (preview, still, front, vision)
    #[arg(short, long, default_value = "preview")]
    topology: String,

    /// Number of frames to process (0=unlimited)
    #[arg(short, long, default_value = "0")]
    frames: u64,

    /// Zoom factor in percent applied mid-run (100-400)
    #[arg(short, long)]
    zoom: Option<u32>,

    /// Enable the capture-scaler tap
    #[arg(long)]
    scc: bool,

    /// Enable digital image stabilization
    #[arg(long)]
    dis: bool,

    /// Print per-second progress
    #[arg(long)]
    progress: bool,
}

#[derive(Debug, Default, Serialize)]
struct RunMetrics {
    topology: String,
    frames_completed: u64,
    frames_invalid: u64,
    duration_ms: u64,
}

impl RunMetrics {
    fn fps(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        (self.frames_completed as f64 * 1000.0) / self.duration_ms as f64
    }
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    let id = utils::parse_topology(&args.topology)?;
    log::info!("Running {} graph over software nodes", args.topology);
    log::debug!("Run parameters: {:?}", args);

    let term = utils::install_signal_handler()?;

    let flags = FactoryFlags {
        scaler_capture: args.scc,
        dis: args.dis,
        ..Default::default()
    };
    let params = Arc::new(PipelineParams::default());
    let mut factory = FrameFactory::with_sim_nodes(id, flags, params.clone())?;

    factory.init_pipes()?;
    factory.prepare_pipes()?;
    factory.start_pipes()?;
    factory.start_threads()?;
    log::info!(
        "Pipeline up: {:?}",
        factory
            .stage_ids()
            .iter()
            .map(|id| id.name())
            .collect::<Vec<_>>()
    );

    let max_frames = if args.frames == 0 {
        u64::MAX
    } else {
        args.frames
    };
    let mut metrics = RunMetrics {
        topology: args.topology.clone(),
        ..Default::default()
    };
    let begin = Instant::now();
    let mut last_report = Instant::now();

    while metrics.frames_completed < max_frames && !term.load(Ordering::Relaxed) {
        // Apply the zoom change halfway through a bounded run.
        if let Some(zoom) = args.zoom {
            if args.frames > 0 && metrics.frames_completed == args.frames / 2 {
                let generation = params.set_zoom(zoom);
                log::info!("Zoom set to {}% (generation {})", zoom, generation);
            }
        }

        let frame = factory.create_frame()?;
        factory.push_frame(frame)?;

        match factory.pop_done(Duration::from_secs(2))? {
            Some(done) => {
                metrics.frames_completed += 1;
                if done.is_invalid() {
                    metrics.frames_invalid += 1;
                }
                factory.recycle(&done)?;
            }
            None => continue,
        }

        if args.progress && last_report.elapsed() >= Duration::from_secs(1) {
            log::info!(
                "{} frames ({} invalid)",
                metrics.frames_completed,
                metrics.frames_invalid
            );
            last_report = Instant::now();
        }
    }
    metrics.duration_ms = begin.elapsed().as_millis() as u64;

    factory.set_stop_flag(true);
    factory.stop_pipes()?;
    factory.destroy()?;

    if json {
        let out = serde_json::json!({
            "topology": metrics.topology,
            "frames_completed": metrics.frames_completed,
            "frames_invalid": metrics.frames_invalid,
            "duration_ms": metrics.duration_ms,
            "fps": metrics.fps(),
        });
        println!("{}", out);
    } else {
        println!(
            "{}: {} frames ({} invalid) in {} ms ({:.1} fps)",
            metrics.topology,
            metrics.frames_completed,
            metrics.frames_invalid,
            metrics.duration_ms,
            metrics.fps()
        );
    }
    Ok(())
}
