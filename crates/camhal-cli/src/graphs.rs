// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use camhal::factory::topologies;
use clap::Args as ClapArgs;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Only show this topology
    #[arg(short, long)]
    topology: Option<String>,
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    let filter = args.topology.map(|t| t.to_ascii_lowercase());

    if json {
        let graphs: Vec<_> = topologies()
            .iter()
            .filter(|t| filter.as_deref().map_or(true, |f| f == t.name))
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "stages": t.stages.iter().map(|s| {
                        serde_json::json!({
                            "pipe": s.pipe.name(),
                            "parent": s.parent.map(|p| p.name()),
                            "counted": s.counted,
                            "optional": s.gate.is_some(),
                            "dual": s.dual,
                        })
                    }).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::json!({ "graphs": graphs }));
        return Ok(());
    }

    for table in topologies() {
        if let Some(filter) = &filter {
            if filter != table.name {
                continue;
            }
        }
        println!("{}", table.name);
        for stage in table.stages {
            let mut notes = Vec::new();
            if stage.counted {
                notes.push("request");
            }
            if stage.gate.is_some() {
                notes.push("optional");
            }
            if stage.dual {
                notes.push("dual-node");
            }
            match stage.parent {
                Some(parent) => println!(
                    "  {} <- {} [{}]",
                    stage.pipe.name(),
                    parent.name(),
                    notes.join(", ")
                ),
                None => println!("  {} (root) [{}]", stage.pipe.name(), notes.join(", ")),
            }
        }
    }
    Ok(())
}
