// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use camhal::factory::TopologyId;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Parse a topology name into its id
pub fn parse_topology(name: &str) -> Result<TopologyId, CliError> {
    match name.to_ascii_lowercase().as_str() {
        "preview" => Ok(TopologyId::Preview),
        "still" => Ok(TopologyId::Still),
        "front" => Ok(TopologyId::Front),
        "vision" => Ok(TopologyId::Vision),
        other => Err(CliError::InvalidArgs(format!(
            "unknown topology '{}' (expected preview, still, front or vision)",
            other
        ))),
    }
}

/// Install a SIGINT/SIGTERM handler for graceful shutdown
pub fn install_signal_handler() -> Result<Arc<AtomicBool>, CliError> {
    let term = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, term.clone())
            .map_err(|e| CliError::General(format!("signal handler: {}", e)))?;
    }
    Ok(term)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topology() {
        assert_eq!(parse_topology("preview").unwrap(), TopologyId::Preview);
        assert_eq!(parse_topology("STILL").unwrap(), TopologyId::Still);
        assert!(parse_topology("rear").is_err());
    }
}
