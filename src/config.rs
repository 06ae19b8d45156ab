//! Configuration snapshot, config-file grammar, and CLI overlay.
//!
//! Precedence, lowest to highest: compiled defaults, the config file, the
//! command line. A `-config=PATH` option on the command line is special: it
//! has to be known before the file is read, so it is extracted with a
//! pre-pass rather than through the normal overlay order (see
//! [`crate::supervisor`] startup sequence).

use std::path::PathBuf;
use std::time::Duration;

use crate::error::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingMode {
    /// Never stage; write every sample straight to the persistent store.
    Off,
    /// Always stage; a background task flushes to the persistent store.
    On,
    /// Measure store-write latency at startup and decide.
    Auto,
}

impl std::str::FromStr for StagingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(StagingMode::Off),
            "on" => Ok(StagingMode::On),
            "auto" => Ok(StagingMode::Auto),
            other => Err(format!("\"{other}\" is not one of off, on, auto")),
        }
    }
}

/// The live, validated configuration snapshot. Immutable once built; a
/// reload constructs a new one and swaps it in atomically.
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the supervisor forks a data-collection worker.
    ///
    /// Default: 5 minutes.
    pub probe_interval: Duration,

    /// Per-host timeout for the worker's reachability probes.
    ///
    /// Default: 4 seconds.
    pub ping_timeout: Duration,

    /// Hosts the worker checks for internet reachability. At least one
    /// entry is required.
    pub ping_hosts: Vec<String>,

    /// IPv4 or IPv6 literal of the cable modem's management interface.
    pub modem_address: String,

    /// Path to the scrubber executable that scrapes the modem's line
    /// statistics page.
    pub scrubber_path: PathBuf,

    /// How long the supervisor waits for the scrubber child before killing
    /// it.
    ///
    /// Default: 10 seconds.
    pub scrubber_timeout: Duration,

    /// How long a worker may run in total (probe + scrubber) before the
    /// supervisor sends it SIGKILL.
    ///
    /// Default: 30 seconds. Must be comfortably larger than
    /// `ping_timeout + scrubber_timeout`.
    pub worker_timeout: Duration,

    /// How long a staging-flush ancillary child may run before the
    /// supervisor sends it SIGKILL.
    ///
    /// Default: 60 seconds.
    pub ancillary_timeout: Duration,

    /// Whether and how to buffer samples in RAM before committing them to
    /// the persistent store.
    pub staging_mode: StagingMode,

    /// `StagingMode::Auto` threshold: if a startup latency probe's mean or
    /// max insert latency exceeds this, staging is turned on for the run.
    ///
    /// Default: 2ms.
    pub staging_latency_threshold: Duration,

    /// Raw schedule string; see [`crate::event::parse_schedule`] for the
    /// grammar.
    pub schedule: String,

    /// If true, DAILY schedule offsets follow the real local clock
    /// (daylight saving observed). If false, they follow local *standard*
    /// time year-round, matching a mechanical timeswitch.
    pub apply_dst: bool,

    /// Whether an external power controller is wired up for the modem.
    pub power_control: bool,

    /// How long before a RESUME event the supervisor should fire the
    /// synthesized POWERON event, when `power_control` is set.
    ///
    /// Default: 10 minutes.
    pub power_up_delay: Duration,

    /// Unprivileged account the daemon drops to after binding any
    /// privileged resources.
    pub run_as_user: String,

    /// `tracing`/`EnvFilter` directive, e.g. `"info"` or `"icmond=debug"`.
    pub loglevel: String,

    /// Path to the sqlite database file.
    pub database_path: PathBuf,

    /// Path to the pidfile used for single-instance enforcement.
    pub pidfile_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5 * 60),
            ping_timeout: Duration::from_secs(4),
            ping_hosts: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            modem_address: "192.168.100.1".to_string(),
            scrubber_path: PathBuf::from("/usr/local/bin/icmond-scrubber"),
            scrubber_timeout: Duration::from_secs(10),
            worker_timeout: Duration::from_secs(30),
            ancillary_timeout: Duration::from_secs(60),
            staging_mode: StagingMode::Auto,
            staging_latency_threshold: Duration::from_micros(2_000),
            schedule: "23:00 SUSPEND, 06:00 RESUME, @00:01 WATCHDOG".to_string(),
            apply_dst: false,
            power_control: false,
            power_up_delay: Duration::from_secs(10 * 60),
            run_as_user: "daemon".to_string(),
            loglevel: "info".to_string(),
            database_path: PathBuf::from("/var/lib/icmond/icmond.db"),
            pidfile_path: PathBuf::from("/var/lock/icmond.lck"),
        }
    }
}

impl Config {
    /// Validate cross-field and range invariants that a type alone can't
    /// enforce. Called after every overlay (file, then CLI) and again
    /// before a reload is allowed to take effect.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.ping_hosts.is_empty() {
            return Err(SupervisorError::Configuration(
                "pinghosts must name at least one host".to_string(),
            ));
        }
        if self.worker_timeout <= self.ping_timeout + self.scrubber_timeout {
            return Err(SupervisorError::Configuration(format!(
                "workertimeout ({:?}) must exceed pingtimeout + scrubbertimeout ({:?})",
                self.worker_timeout,
                self.ping_timeout + self.scrubber_timeout
            )));
        }
        let parsed = crate::event::parse_schedule(&self.schedule);
        if !parsed.diagnostics.is_empty() {
            let joined = parsed
                .diagnostics
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(SupervisorError::Configuration(format!(
                "schedule string has errors: {joined}"
            )));
        }
        Ok(())
    }

    /// Apply a set of `key = value` overrides parsed from a config file or
    /// derived from the command line. Unknown keys are reported as an
    /// error rather than silently ignored.
    pub fn apply_overrides(&mut self, overrides: &[(String, String)]) -> Result<(), SupervisorError> {
        for (key, value) in overrides {
            self.apply_one(key, value)?;
        }
        Ok(())
    }

    fn apply_one(&mut self, key: &str, value: &str) -> Result<(), SupervisorError> {
        let bad = |field: &str, value: &str| {
            SupervisorError::Configuration(format!("invalid value \"{value}\" for {field}"))
        };
        match key.to_ascii_lowercase().as_str() {
            "probeinterval" => {
                self.probe_interval = parse_secs(value).map_err(|_| bad(key, value))?
            }
            "pingtimeout" => self.ping_timeout = parse_secs(value).map_err(|_| bad(key, value))?,
            "pinghosts" => {
                self.ping_hosts = value.split(',').map(|s| s.trim().to_string()).collect()
            }
            "modemaddress" => self.modem_address = value.to_string(),
            "scrubberpath" => self.scrubber_path = PathBuf::from(value),
            "scrubbertimeout" => {
                self.scrubber_timeout = parse_secs(value).map_err(|_| bad(key, value))?
            }
            "workertimeout" => {
                self.worker_timeout = parse_secs(value).map_err(|_| bad(key, value))?
            }
            "ancillarytimeout" => {
                self.ancillary_timeout = parse_secs(value).map_err(|_| bad(key, value))?
            }
            "stagingmode" => {
                self.staging_mode = value.parse().map_err(|_| bad(key, value))?
            }
            "staginglatencythreshold" => {
                self.staging_latency_threshold =
                    parse_micros(value).map_err(|_| bad(key, value))?
            }
            "schedule" => self.schedule = value.to_string(),
            "applydst" => self.apply_dst = parse_bool(value).map_err(|_| bad(key, value))?,
            "powercontrol" => {
                self.power_control = parse_bool(value).map_err(|_| bad(key, value))?
            }
            "powerupdelay" => {
                self.power_up_delay = parse_secs(value).map_err(|_| bad(key, value))?
            }
            "runasuser" => self.run_as_user = value.to_string(),
            "loglevel" => self.loglevel = value.to_string(),
            "database" => self.database_path = PathBuf::from(value),
            "pidfile" => self.pidfile_path = PathBuf::from(value),
            other => {
                return Err(SupervisorError::Configuration(format!(
                    "unrecognized configuration key \"{other}\""
                )))
            }
        }
        Ok(())
    }
}

fn parse_secs(s: &str) -> Result<Duration, ()> {
    s.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| ())
}

fn parse_micros(s: &str) -> Result<Duration, ()> {
    s.trim().parse::<u64>().map(Duration::from_micros).map_err(|_| ())
}

fn parse_bool(s: &str) -> Result<bool, ()> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(()),
    }
}

/// Parse the config file's line grammar:
///
/// ```text
/// line    := ws* (comment | assignment)? ws* "\n"
/// comment := "#" any*
/// assignment := key ws* "=" ws* value
/// ```
///
/// Backslash escapes `\\`, `\#`, `\,`, `\;`, and `\=` are honored inside
/// values so that list-valued keys (comma-separated) and the schedule
/// string (which itself uses `,`/`;` as entry separators) can carry those
/// characters literally when needed.
pub fn parse_config_file(contents: &str) -> Result<Vec<(String, String)>, SupervisorError> {
    let mut overrides = Vec::new();

    for (lineno, raw_line) in contents.lines().enumerate() {
        let line = strip_unescaped_comment(raw_line).trim().to_string();
        if line.is_empty() {
            continue;
        }

        let eq = find_unescaped(&line, '=').ok_or_else(|| {
            SupervisorError::Configuration(format!(
                "line {}: expected \"key = value\"",
                lineno + 1
            ))
        })?;

        let key = unescape(line[..eq].trim());
        let value = unescape(line[eq + 1..].trim());
        overrides.push((key, value));
    }

    Ok(overrides)
}

fn strip_unescaped_comment(line: &str) -> &str {
    match find_unescaped(line, '#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn find_unescaped(s: &str, needle: char) -> Option<usize> {
    let mut escaped = false;
    for (idx, ch) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
            continue;
        }
        if ch == needle {
            return Some(idx);
        }
    }
    None
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Command-line surface. Every `Config` key is also its own `-key=value`
/// flag, always overriding the config file; see [`Cli::overrides`].
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "icmond", about = "Cable modem line-statistics monitor")]
pub struct Cli {
    /// Path to the config file. Must be read before any other overlay.
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Run in the foreground instead of daemonizing.
    #[arg(long = "nodaemon")]
    pub nodaemon: bool,

    /// Create the database schema and exit.
    #[arg(long = "createdb")]
    pub createdb: bool,

    /// Write the effective configuration to stdout and exit.
    #[arg(long = "writeconfig")]
    pub writeconfig: bool,

    /// Measure staging-store write latency N times (default 100) and exit.
    #[arg(long = "testdbwrite", num_args = 0..=1, default_missing_value = "100")]
    pub testdbwrite: Option<u32>,

    /// Hidden flag used by the supervisor to re-exec itself as a
    /// data-collection worker.
    #[arg(long = "worker-child", hide = true)]
    pub worker_child: bool,

    /// Hidden flag used by the supervisor to re-exec itself as a staging
    /// flush ancillary.
    #[arg(long = "ancillary-child", hide = true)]
    pub ancillary_child: bool,

    #[arg(long = "probeinterval")]
    pub probeinterval: Option<String>,
    #[arg(long = "pingtimeout")]
    pub pingtimeout: Option<String>,
    #[arg(long = "pinghosts")]
    pub pinghosts: Option<String>,
    #[arg(long = "modemaddress")]
    pub modemaddress: Option<String>,
    #[arg(long = "scrubberpath")]
    pub scrubberpath: Option<String>,
    #[arg(long = "scrubbertimeout")]
    pub scrubbertimeout: Option<String>,
    #[arg(long = "workertimeout")]
    pub workertimeout: Option<String>,
    #[arg(long = "ancillarytimeout")]
    pub ancillarytimeout: Option<String>,
    #[arg(long = "stagingmode")]
    pub stagingmode: Option<String>,
    #[arg(long = "staginglatencythreshold")]
    pub staginglatencythreshold: Option<String>,
    #[arg(long = "schedule")]
    pub schedule: Option<String>,
    #[arg(long = "applydst")]
    pub applydst: Option<String>,
    #[arg(long = "powercontrol")]
    pub powercontrol: Option<String>,
    #[arg(long = "powerupdelay")]
    pub powerupdelay: Option<String>,
    #[arg(long = "runasuser")]
    pub runasuser: Option<String>,
    #[arg(long = "loglevel")]
    pub loglevel: Option<String>,
    #[arg(long = "database")]
    pub database: Option<String>,
    #[arg(long = "pidfile")]
    pub pidfile: Option<String>,
}

impl Cli {
    /// Collect every populated per-key flag into `(key, value)` pairs, in
    /// declaration order, so they can flow through the same
    /// `Config::apply_overrides` path a config file's assignments use.
    pub fn overrides(&self) -> Vec<(String, String)> {
        let mut overrides = Vec::new();
        macro_rules! collect {
            ($field:ident) => {
                if let Some(value) = &self.$field {
                    overrides.push((stringify!($field).to_string(), value.clone()));
                }
            };
        }
        collect!(probeinterval);
        collect!(pingtimeout);
        collect!(pinghosts);
        collect!(modemaddress);
        collect!(scrubberpath);
        collect!(scrubbertimeout);
        collect!(workertimeout);
        collect!(ancillarytimeout);
        collect!(stagingmode);
        collect!(staginglatencythreshold);
        collect!(schedule);
        collect!(applydst);
        collect!(powercontrol);
        collect!(powerupdelay);
        collect!(runasuser);
        collect!(loglevel);
        collect!(database);
        collect!(pidfile);
        overrides
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_empty_pinghosts() {
        let mut cfg = Config::default();
        cfg.ping_hosts.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_file_with_comments_and_escapes() {
        let text = "probeinterval = 120 # five minutes became two\nmodemaddress = 10.0.0.1\npinghosts = 8.8.8.8\\, oops, 1.1.1.1\n";
        let overrides = parse_config_file(text).unwrap();
        assert_eq!(overrides[0], ("probeinterval".to_string(), "120".to_string()));
        assert_eq!(
            overrides[2],
            ("pinghosts".to_string(), "8.8.8.8, oops, 1.1.1.1".to_string())
        );
    }

    #[test]
    fn apply_overrides_rejects_unknown_key() {
        let mut cfg = Config::default();
        let err = cfg.apply_overrides(&[("bogus".to_string(), "1".to_string())]);
        assert!(err.is_err());
    }

    #[test]
    fn apply_overrides_rejects_timeout_ordering_only_at_validate() {
        let mut cfg = Config::default();
        cfg.apply_overrides(&[("workertimeout".to_string(), "1".to_string())])
            .unwrap();
        assert!(cfg.validate().is_err());
    }
}
