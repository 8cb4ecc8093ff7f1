#![deny(missing_docs)]

//! A transparent I/O recorder for interactive child processes.
//!
//! [`Iolog`] spawns a configured program, interposes on its stdin, stdout,
//! and stderr, and produces one annotated log file interleaving all three
//! streams plus signal activity, while remaining otherwise invisible to
//! both ends: a parent shell driving this process and the child it spawns
//! see the same bytes they would have seen running the child directly.

mod buffer;
mod config;
mod engine;
mod logbuf;
mod signal;

use anyhow::{Context, Result};
use derive_builder::Builder;
use env_logger::fmt::Color;
use getset::{Getters, MutGetters};
use log::{debug, LevelFilter};
use std::{env, io::Write};

pub use config::Config;

#[derive(Builder, Debug, Default, Getters, MutGetters)]
#[builder(default, pattern = "owned", setter(into))]
/// The main entry point: owns the resolved configuration and drives a
/// single child process from spawn to exit.
pub struct Iolog {
    #[doc = "The recorder's configuration."]
    #[getset(get, get_mut)]
    config: Config,
}

impl Iolog {
    /// Resolve the configuration, spawn the configured child, and run it
    /// to completion, returning the exit code this process should itself
    /// exit with.
    pub fn run(&mut self) -> Result<i32> {
        self.init_logging().context("init logging")?;
        debug!("set log level to {}", self.config().log_level());

        self.config_mut().load().context("load configuration")?;

        let engine = engine::Engine::spawn(self.config()).context("spawn child")?;
        engine.run().context("run event loop")
    }

    /// Initialize the logger and set the verbosity to the configured
    /// level.
    fn init_logging(&self) -> Result<()> {
        // Set the logging verbosity via the env
        let level = self.config().log_level().to_string();
        env::set_var("RUST_LOG", level);

        // Initialize the logger with the format:
        // [YYYY-MM-DDTHH:MM:SS:MMM LEVEL crate::module file:LINE] MSG…
        // The file and line will be only printed when running with debug or trace level.
        let log_level = self.config().log_level();
        env_logger::builder()
            .format(move |buf, r| {
                let mut style = buf.style();
                style.set_color(Color::Black).set_intense(true);
                writeln!(
                    buf,
                    "{}{} {:<5} {}{}{} {}",
                    style.value("["),
                    buf.timestamp_millis(),
                    buf.default_styled_level(r.level()),
                    r.target(),
                    match (log_level >= LevelFilter::Debug, r.file(), r.line()) {
                        (true, Some(file), Some(line)) => format!(" {}:{}", file, line),
                        _ => "".into(),
                    },
                    style.value("]"),
                    r.args()
                )
            })
            .try_init()
            .context("init env logger")
    }
}
