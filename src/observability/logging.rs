use anyhow::{Context, Result};
use tracing::{debug, info_span, Span};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::config::Config;

/// Handle on the installed subscriber's level filter
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    env_override: bool,
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level
/// for the lifetime of the process.
pub fn init(config: &Config) -> Result<LogHandle> {
    let (filter, env_override) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(config.log_filter()), false),
    };
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogHandle {
        filter: handle,
        env_override,
    })
}

impl LogHandle {
    /// Follow the level of a reloaded configuration
    pub fn apply(&self, config: &Config) -> Result<()> {
        if self.env_override {
            return Ok(());
        }

        let level = config.log_filter();
        self.filter
            .reload(EnvFilter::new(level))
            .context("Failed to reload log filter")?;
        debug!("Log level set to {}", level);
        Ok(())
    }
}

/// Root span carrying the service identity fields
pub fn service_span(config: &Config) -> Span {
    let (service, node_ip, pod_ip) = match &config.logger {
        Some(logger) => (
            logger.service_name.as_str(),
            logger.node_ip.as_str(),
            logger.pod_ip.as_str(),
        ),
        None => ("lb-proxy", "", ""),
    };
    info_span!("service", service = %service, node_ip = %node_ip, pod_ip = %pod_ip)
}
