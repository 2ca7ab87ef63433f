//! Node manager configuration: resolution chain CLI flag > env var >
//! config file > default, mirroring the controller's `FleetConfig`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use fleet_db::models::Labels;

/// The `[node]` table of the shared config file.
#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigFile {
    pub node: NodeSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeSection {
    pub controller_url: Option<String>,
    pub labels: Labels,
    pub max_concurrent: Option<i32>,
    pub heartbeat_interval_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            controller_url: None,
            labels: Labels::new(),
            max_concurrent: None,
            heartbeat_interval_secs: None,
            poll_interval_secs: None,
        }
    }
}

fn config_path() -> PathBuf {
    let dir = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("fleet")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("fleet")
    };
    dir.join("config.toml")
}

fn load_config_file() -> Option<ConfigFile> {
    let contents = std::fs::read_to_string(config_path()).ok()?;
    toml::from_str(&contents).ok()
}

/// Fully resolved node manager configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub labels: Labels,
    pub max_concurrent: i32,
    pub controller_url: String,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
}

/// CLI-supplied overrides, `None` where the flag was not passed.
pub struct NodeCliArgs {
    pub node_id: Option<String>,
    pub labels: Vec<String>,
    pub max_concurrent: Option<i32>,
    pub controller_url: Option<String>,
}

impl NodeConfig {
    /// Resolve configuration using the chain: CLI flag > env var >
    /// config file > default.
    ///
    /// `node_id` has no default -- it must come from `--node-id` or
    /// `FLEET_NODE_ID`.
    pub fn resolve(cli: NodeCliArgs) -> Result<Self> {
        let file_config = load_config_file();

        let node_id = cli
            .node_id
            .or_else(|| std::env::var("FLEET_NODE_ID").ok())
            .context("node id is required: pass --node-id or set FLEET_NODE_ID")?;

        let controller_url = cli
            .controller_url
            .or_else(|| std::env::var("FLEET_CONTROLLER_URL").ok())
            .or_else(|| file_config.as_ref().and_then(|c| c.node.controller_url.clone()))
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string());

        let labels = if !cli.labels.is_empty() {
            parse_labels(&cli.labels)?
        } else if let Ok(raw) = std::env::var("FLEET_NODE_LABELS") {
            parse_labels(&raw.split(',').map(str::to_string).collect::<Vec<_>>())?
        } else {
            file_config
                .as_ref()
                .map(|c| c.node.labels.clone())
                .unwrap_or_default()
        };

        let max_concurrent = cli
            .max_concurrent
            .or_else(|| {
                std::env::var("FLEET_NODE_MAX_CONCURRENT")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .or_else(|| file_config.as_ref().and_then(|c| c.node.max_concurrent))
            .unwrap_or(1);

        let heartbeat_interval = Duration::from_secs(
            file_config
                .as_ref()
                .and_then(|c| c.node.heartbeat_interval_secs)
                .unwrap_or(10),
        );
        let poll_interval = Duration::from_secs(
            file_config
                .as_ref()
                .and_then(|c| c.node.poll_interval_secs)
                .unwrap_or(2),
        );

        if max_concurrent < 1 {
            bail!("max_concurrent must be at least 1, got {max_concurrent}");
        }

        Ok(Self {
            node_id,
            labels,
            max_concurrent,
            controller_url,
            heartbeat_interval,
            poll_interval,
        })
    }
}

/// Parse `key=value` entries into a `Labels` map.
fn parse_labels(raw: &[String]) -> Result<Labels> {
    let mut labels = Labels::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("label {entry:?} is not in key=value form"))?;
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(node_id: Option<&str>) -> NodeCliArgs {
        NodeCliArgs {
            node_id: node_id.map(str::to_string),
            labels: vec![],
            max_concurrent: None,
            controller_url: None,
        }
    }

    #[test]
    fn resolve_requires_node_id() {
        let err = NodeConfig::resolve(args(None)).unwrap_err();
        assert!(err.to_string().contains("node id is required"));
    }

    #[test]
    fn resolve_applies_defaults() {
        let config = NodeConfig::resolve(args(Some("node-a"))).unwrap();
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.controller_url, "http://127.0.0.1:8080");
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn resolve_parses_cli_labels() {
        let mut cli = args(Some("node-a"));
        cli.labels = vec!["os=linux".to_string(), "gpu=true".to_string()];
        let config = NodeConfig::resolve(cli).unwrap();
        assert_eq!(config.labels.get("os"), Some(&"linux".to_string()));
        assert_eq!(config.labels.get("gpu"), Some(&"true".to_string()));
    }

    #[test]
    fn resolve_rejects_zero_max_concurrent() {
        let mut cli = args(Some("node-a"));
        cli.max_concurrent = Some(0);
        let err = NodeConfig::resolve(cli).unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }
}
