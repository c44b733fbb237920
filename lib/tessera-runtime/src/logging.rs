// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide logging.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `TESSERA_LOGGING_JSONL` environment variable to `1`.
//!
//! Filters can be configured using the `TESSERA_LOG` environment variable (`EnvFilter`
//! syntax) or the `[logging]` section of the configuration file. The default log level is
//! `info`.

use std::sync::Once;

use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{
    EnvFilter,
    filter::{Directive, LevelFilter},
    fmt,
};

use crate::config::{LoggingConfig, TesseraConfig};

/// ENV used to set the log filter
const FILTER_ENV: &str = "TESSERA_LOG";

const JSONL_ENV: &str = "TESSERA_LOGGING_JSONL";

const DISABLE_ANSI_ENV: &str = "TESSERA_LOGGING_DISABLE_ANSI";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

/// Initialize the logger from the `[logging]` section of the merged configuration.
pub fn init() {
    INIT.call_once(|| setup_logging(load_config()));
}

/// Initialize the logger from an explicit configuration.
///
/// Has no effect once the logger is initialized.
pub fn init_with(config: &LoggingConfig) {
    INIT.call_once(|| setup_logging(config.clone()));
}

fn setup_logging(config: LoggingConfig) {
    let filter_layer = filters(&config);
    // Each builder method returns a specialized type, so both arms repeat the chain.
    if env_is_truthy(JSONL_ENV) {
        let l = fmt::layer()
            .json()
            .with_current_span(true)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).init();
    } else {
        let l = fmt::layer()
            .with_ansi(!env_is_truthy(DISABLE_ANSI_ENV))
            .event_format(fmt::format().compact().with_timer(UtcTime::rfc_3339()))
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).init();
    }
}

fn filters(config: &LoggingConfig) -> EnvFilter {
    let default_directive: Directive = match config.level.parse::<LevelFilter>() {
        Ok(level) => level.into(),
        Err(e) => {
            eprintln!("Invalid log level '{}', using info: {e}", config.level);
            LevelFilter::INFO.into()
        }
    };

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    for (module, level) in &config.filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    match TesseraConfig::figment().extract_inner::<LoggingConfig>("logging") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load logging configuration, using defaults: {e}");
            LoggingConfig::default()
        }
    }
}

fn env_is_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(false)
}
