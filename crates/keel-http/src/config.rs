use std::{env, net::SocketAddr, path::PathBuf, str::FromStr};

use anyhow::{Context, Error};

/// Settings for a static file server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to listen on.
    pub addr: SocketAddr,
    /// Document root files are served from.
    pub root: PathBuf,
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum number of requests waiting for a worker.
    pub max_requests: usize,
    /// Maximum number of open connections, further peers are refused.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            root: PathBuf::from("./resources"),
            workers: 8,
            max_requests: 10000,
            max_connections: 65535,
        }
    }
}

impl ServerConfig {
    /// Load the defaults, overridden by any `KEEL_*` environment variables set.
    pub fn load() -> Result<Self, Error> {
        Self::load_from(|name| env::var(name).ok())
    }

    /// Load the defaults, overridden by values found through `lookup`.
    pub fn load_from<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        override_from(&lookup, "KEEL_ADDR", &mut config.addr)?;
        override_from(&lookup, "KEEL_ROOT", &mut config.root)?;
        override_from(&lookup, "KEEL_WORKERS", &mut config.workers)?;
        override_from(&lookup, "KEEL_MAX_REQUESTS", &mut config.max_requests)?;
        override_from(&lookup, "KEEL_MAX_CONNECTIONS", &mut config.max_connections)?;

        Ok(config)
    }
}

fn override_from<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<(), Error>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(value) = lookup(name) else {
        return Ok(());
    };

    *target = value
        .trim()
        .parse()
        .with_context(|| format!("invalid value {:?} for {}", value, name))?;

    Ok(())
}
