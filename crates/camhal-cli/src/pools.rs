// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use camhal::alloc::HeapBackend;
use camhal::buffer::Position;
use camhal::manager::{AllocMode, BufferManager, BufferPool, PoolInfo};
use clap::Args as ClapArgs;
use std::time::{Duration, Instant};

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Initial buffer count
    #[arg(short, long, default_value = "4")]
    count: usize,

    /// Maximum buffer count for the growing modes
    #[arg(short, long, default_value = "8")]
    max: usize,

    /// Plane size in bytes
    #[arg(short, long, default_value = "65536")]
    plane: usize,

    /// Use one shared allocation split across all buffers
    #[arg(long)]
    multi: bool,
}

struct ModeReport {
    mode: &'static str,
    allocated: usize,
    grown: u64,
    duration_us: u128,
}

fn exercise(args: &Args, mode: AllocMode, name: &'static str) -> Result<ModeReport, CliError> {
    let backend = if args.multi {
        HeapBackend::multi()
    } else {
        HeapBackend::new()
    };
    let mgr = BufferManager::new(name, Box::new(backend));
    mgr.set_info(
        PoolInfo::new(vec![args.plane], args.count)
            .with_mode(mode)
            .with_max(args.max)
            .with_meta_plane(),
    )?;

    let begin = Instant::now();
    mgr.alloc()?;

    // Lease everything the pool will give us, then hand it all back.
    let mut leased = Vec::new();
    loop {
        match mgr.get_buffer(None, Position::Hal) {
            Ok(buffer) => leased.push(buffer),
            Err(camhal::Error::NoBuffer) => break,
            Err(e) => return Err(e.into()),
        }
    }
    for buffer in leased.drain(..) {
        mgr.put_buffer(buffer.index(), Position::Unbound)?;
    }

    // Background growth needs a moment to fill to the maximum.
    if mode == AllocMode::Background {
        let deadline = Instant::now() + Duration::from_secs(1);
        while mgr.allocated_count() < args.max && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    let stats = mgr.stats();
    let report = ModeReport {
        mode: name,
        allocated: mgr.allocated_count(),
        grown: stats.grows,
        duration_us: begin.elapsed().as_micros(),
    };
    mgr.free_buffers();
    Ok(report)
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    if args.count == 0 || args.plane == 0 {
        return Err(CliError::InvalidArgs(
            "count and plane size must be > 0".to_string(),
        ));
    }
    log::debug!("Pool parameters: {:?}", args);

    let reports = vec![
        exercise(&args, AllocMode::Upfront, "upfront")?,
        exercise(&args, AllocMode::OnDemand, "on-demand")?,
        exercise(&args, AllocMode::Background, "background")?,
    ];

    if json {
        let out: Vec<_> = reports
            .iter()
            .map(|r| {
                serde_json::json!({
                    "mode": r.mode,
                    "allocated": r.allocated,
                    "grown": r.grown,
                    "duration_us": r.duration_us,
                })
            })
            .collect();
        println!("{}", serde_json::json!({ "pools": out }));
    } else {
        for r in &reports {
            println!(
                "{:<12} allocated {:>2} buffers ({} grown) in {} us",
                r.mode, r.allocated, r.grown, r.duration_us
            );
        }
    }
    Ok(())
}
