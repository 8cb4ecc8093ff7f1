//! Configuration: CLI flags plus the sibling `<argv0>.conf` key/value file.
//!
//! Out of scope at the interface level per spec.md §4.5; this module
//! implements that collaborator in full since it is part of a complete
//! binary. Grammar and defaults are grounded on `load_conf()` in the
//! original source this crate reimplements.

use std::path::{Path, PathBuf};
use std::{env, fs};

use anyhow::Result;
use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters, Setters};
use log::{debug, warn, LevelFilter};
use serde::{Deserialize, Serialize};

macro_rules! prefix {
    () => {
        "IOLOG_"
    };
}

const DEFAULT_LOGFILE: &str = "/tmp/iolog.log";
const DEFAULT_EXEC: &str = "/bin/sh";

#[derive(Builder, CopyGetters, Debug, Deserialize, Getters, Parser, Serialize, Setters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "kebab-case")]
#[clap(after_help("A transparent I/O recorder for interactive child processes."))]
/// Launcher configuration: CLI/environment overrides plus the resolved
/// `logfile`/`exec` pair.
pub struct Config {
    #[get_copy = "pub"]
    #[clap(
        default_value("info"),
        env(concat!(prefix!(), "LOG_LEVEL")),
        long("log-level"),
        possible_values(["trace", "debug", "info", "warn", "error", "off"]),
        value_name("LEVEL")
    )]
    /// The logging level of the application.
    log_level: LevelFilter,

    #[getset(get = "pub", set)]
    #[clap(
        env(concat!(prefix!(), "CONFIG_PATH")),
        long("config"),
        value_name("PATH")
    )]
    /// Override the sibling `<argv0>.conf` path normally consulted for
    /// `logfile`/`exec` directives.
    config_path: Option<PathBuf>,

    #[get = "pub"]
    #[clap(
        allow_hyphen_values(true),
        value_name("ARGS"),
        multiple_values(true)
    )]
    /// Arguments forwarded verbatim to the spawned child; `argv[0]` is
    /// replaced by the resolved `exec` path.
    args: Vec<String>,

    #[serde(skip)]
    #[get = "pub"]
    #[clap(skip)]
    /// Resolved path of the log file to unlink and (re)create on startup.
    logfile: PathBuf,

    #[serde(skip)]
    #[get = "pub"]
    #[clap(skip)]
    /// Resolved path of the program to spawn as the child.
    exec: PathBuf,

    #[serde(skip)]
    #[clap(skip)]
    argv0: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Self::parse();
        config.argv0 = env::args().next().unwrap_or_else(|| DEFAULT_EXEC.into());
        config.logfile = DEFAULT_LOGFILE.into();
        config.exec = DEFAULT_EXEC.into();
        config
    }
}

impl Config {
    /// Resolve `logfile`/`exec` from the sibling conf file, if present,
    /// overriding the built-in defaults. Unknown keys and malformed lines
    /// are reported to stderr and skipped; parsing continues.
    pub fn load(&mut self) -> Result<()> {
        let conf_path = self
            .config_path
            .clone()
            .unwrap_or_else(|| default_conf_path(&self.argv0));

        match fs::read_to_string(&conf_path) {
            Ok(text) => {
                for (key, value) in parse_conf(&text, &conf_path) {
                    match key.to_ascii_lowercase().as_str() {
                        "logfile" => self.logfile = value.into(),
                        "exec" => self.exec = value.into(),
                        _ => warn!(
                            "Wrong option \"{}\" = \"{}\" in \"{}\"",
                            key,
                            value,
                            conf_path.display()
                        ),
                    }
                }
            }
            Err(_) => debug!(
                "no configuration file at {}, using defaults",
                conf_path.display()
            ),
        }
        Ok(())
    }
}

fn default_conf_path(argv0: &str) -> PathBuf {
    let mut s = argv0.to_string();
    s.push_str(".conf");
    s.into()
}

/// Parse `KEY = VALUE` directives terminated by `\r`/`\n`. `#` introduces a
/// line comment, blank lines are ignored. Returns the recognized
/// `(key, value)` pairs in file order; malformed lines are reported via
/// `log::warn!` and skipped.
fn parse_conf(text: &str, conf_path: &Path) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim_end_matches('\r');
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match trimmed.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                let value = value.trim();
                if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
                    warn!("Wrong syntax in \"{}\" after \"{}\"", conf_path.display(), key);
                    continue;
                }
                out.push((key.to_string(), value.to_string()));
            }
            None => warn!(
                "Wrong syntax in \"{}\": \"{}\"",
                conf_path.display(),
                trimmed
            ),
        }
    }
    out
}
