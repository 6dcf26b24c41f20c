// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

/// Configuration for the waldod control server.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "waldod", about = "Animatronic control backend")]
pub struct ServerConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "WALDO_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8600, env = "WALDO_PORT")]
    pub port: u16,

    /// Directory holding the JSON configuration files.
    #[arg(long, default_value = "config", env = "WALDO_CONFIG_DIR")]
    pub config_dir: std::path::PathBuf,

    /// Run against in-memory hardware doubles instead of real devices.
    #[arg(long, env = "WALDO_SIM")]
    pub sim: bool,

    /// Watch the config directory and hot-reload edited files.
    #[arg(long, default_value_t = true, env = "WALDO_WATCH_CONFIG")]
    pub watch_config: bool,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
