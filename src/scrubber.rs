//! Modem-scraping subprocess boundary.
//!
//! The scrubber executable itself is an opaque external collaborator: it is
//! invoked with the modem's address and a timeout, and its stdout is parsed
//! as 20 delimiter-separated numeric fields (8 downstream power/SNR pairs,
//! then 4 upstream power values). Malformed fields are recorded as missing
//! rather than treated as a hard failure, matching how a modem firmware
//! that omits a channel shows up.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

use crate::store::Sample;

#[derive(Debug, thiserror::Error)]
pub enum ScrubberError {
    #[error("failed to spawn scrubber: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("scrubber exceeded its timeout")]
    Timeout,
    #[error("scrubber exited with status {0}")]
    NonZeroExit(i32),
    #[error("scrubber output did not contain 20 fields")]
    ShortOutput,
}

/// Run the scrubber against `modem_address`, parse its stdout, and return a
/// partially-populated [`Sample`] (missing fields become `NaN` markers
/// rather than aborting the whole sample).
pub async fn run_scrubber(
    scrubber_path: &Path,
    modem_address: &str,
    timeout: Duration,
) -> Result<Sample, ScrubberError> {
    let child = Command::new(scrubber_path)
        .arg(modem_address)
        .env_clear()
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| ScrubberError::Timeout)?
        .map_err(ScrubberError::Spawn)?;

    if !output.status.success() {
        return Err(ScrubberError::NonZeroExit(output.status.code().unwrap_or(-1)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_scrubber_output(&stdout)
}

/// Parse the 20-field scrubber line: 8 `power,snr` downstream pairs
/// followed by 4 upstream power values, all delimiter-separated.
pub fn parse_scrubber_output(line: &str) -> Result<Sample, ScrubberError> {
    let fields: Vec<f64> = line
        .trim()
        .split([',', ' ', '\t'])
        .filter(|f| !f.is_empty())
        .map(|f| f.parse::<f64>().unwrap_or(f64::NAN))
        .collect();

    if fields.len() < 20 {
        return Err(ScrubberError::ShortOutput);
    }

    let downstream_power_snr = fields[0..16]
        .chunks(2)
        .map(|pair| (pair[0], pair[1]))
        .collect();
    let upstream_power = fields[16..20].to_vec();

    Ok(Sample {
        collected_at: chrono::Utc::now(),
        reachable: true,
        downstream_power_snr,
        upstream_power,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_line() {
        let line = (0..20).map(|n| n.to_string()).collect::<Vec<_>>().join(",");
        let sample = parse_scrubber_output(&line).unwrap();
        assert_eq!(sample.downstream_power_snr.len(), 8);
        assert_eq!(sample.upstream_power.len(), 4);
    }

    #[test]
    fn rejects_short_output() {
        assert!(parse_scrubber_output("1,2,3").is_err());
    }

    #[test]
    fn non_numeric_field_becomes_nan_not_an_error() {
        let mut fields: Vec<String> = (0..20).map(|n| n.to_string()).collect();
        fields[5] = "garbled".to_string();
        let line = fields.join(",");
        let sample = parse_scrubber_output(&line).unwrap();
        assert!(sample.downstream_power_snr[2].1.is_nan());
    }
}
