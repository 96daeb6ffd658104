use std::{fs, path::Path};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control endpoint port.
    pub endpoint: u16,
    /// Correlation mode: flows wait for an out-of-band identity instead of
    /// notifying immediately.
    pub use_rest_api: bool,
    /// Persist username -> last-known address records.
    pub save_player_ip: bool,
    pub listeners: Vec<ListenerConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind: String,
    pub tcp: Option<u16>,
    pub udp: Option<u16>,
    /// Prepend a PROXY protocol v2 header towards the target.
    pub emit_ppv2: bool,
    pub webhook: Option<String>,
    pub target: TargetConfig,
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub host: String,
    pub tcp: Option<u16>,
    pub udp: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    endpoint: Option<i64>,
    #[serde(rename = "useRestApi")]
    use_rest_api: Option<bool>,
    #[serde(rename = "savePlayerIP")]
    save_player_ip: Option<bool>,
    listeners: Option<Vec<FileListener>>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
struct FileListener {
    #[serde(default)]
    bind: String,
    tcp: Option<u16>,
    udp: Option<u16>,
    #[serde(default)]
    haproxy: bool,
    webhook: Option<String>,
    target: FileTarget,
}

#[derive(Debug, Deserialize)]
struct FileTarget {
    host: String,
    tcp: Option<u16>,
    udp: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

/// Create the default config file when none exists.
///
/// Returns true when a new file was written. An existing regular file is
/// left untouched; anything else at the path is a hard error.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!("config: {} exists but is not a regular file", path.display());
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(DEFAULT_CONFIG_TEMPLATE.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_config(&data).with_context(|| format!("parse {}", path.display()))
}

fn parse_config(s: &str) -> anyhow::Result<Config> {
    let fc: FileConfig = serde_yaml::from_str(s).context("config: invalid yaml")?;

    let Some(listeners) = fc.listeners else {
        anyhow::bail!("config: listeners is required and must be a list");
    };

    let mut cfg = Config {
        endpoint: port_from(fc.endpoint.unwrap_or(6000)).context("config: endpoint")?,
        use_rest_api: fc.use_rest_api.unwrap_or(false),
        save_player_ip: fc.save_player_ip.unwrap_or(true),
        listeners: Vec::with_capacity(listeners.len()),
        logging: LoggingConfig::default(),
    };

    for (i, l) in listeners.into_iter().enumerate() {
        // An empty bind means all interfaces; the orchestrator normalizes it.
        let bind = l.bind.trim().to_string();
        let host = l.target.host.trim().to_string();
        if host.is_empty() {
            anyhow::bail!("config: listeners[{i}] target missing host");
        }

        cfg.listeners.push(ListenerConfig {
            bind,
            tcp: l.tcp,
            udp: l.udp,
            emit_ppv2: l.haproxy,
            webhook: l
                .webhook
                .map(|w| w.trim().to_string())
                .filter(|w| !w.is_empty()),
            target: TargetConfig {
                host,
                tcp: l.target.tcp,
                udp: l.target.udp,
            },
        });
    }

    if let Some(l) = fc.logging {
        if let Some(level) = l.level {
            if !level.trim().is_empty() {
                cfg.logging.level = level.trim().to_string();
            }
        }
        if let Some(fmt) = l.format {
            if !fmt.trim().is_empty() {
                cfg.logging.format = fmt.trim().to_string();
            }
        }
        if let Some(out) = l.output {
            if !out.trim().is_empty() {
                cfg.logging.output = out.trim().to_string();
            }
        }
        cfg.logging.add_source = l.add_source;
    }

    Ok(cfg)
}

fn port_from(v: i64) -> anyhow::Result<u16> {
    u16::try_from(v).map_err(|_| anyhow::anyhow!("port {v} out of range"))
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Lodestone configuration (auto-generated)
#
# This file was created because no config.yml was found in the working
# directory. Each listener forwards TCP and/or UDP traffic to a target;
# set haproxy: true to prepend a PROXY protocol v2 header so the target
# learns the real client address.

# Control endpoint port (only used with useRestApi: true).
endpoint: 6000

# Correlate flows with login/logout events posted to the control endpoint.
useRestApi: false

# Remember each player's last-known address in playerIP.json.
savePlayerIP: true

listeners:
  - bind: 0.0.0.0
    tcp: 25565
    haproxy: false
    # webhook: https://discord.com/api/webhooks/...
    target:
      host: 127.0.0.1
      tcp: 25566

logging:
  level: "info"   # debug | info | warn | error
  format: "text"  # text | json
  output: "stderr" # stderr | stdout | discard | <file path>
  add_source: false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_parses() {
        let cfg = parse_config(DEFAULT_CONFIG_TEMPLATE).expect("template");
        assert_eq!(cfg.endpoint, 6000);
        assert!(!cfg.use_rest_api);
        assert!(cfg.save_player_ip);
        assert_eq!(cfg.listeners.len(), 1);
        assert_eq!(cfg.listeners[0].tcp, Some(25565));
        assert_eq!(cfg.listeners[0].target.tcp, Some(25566));
        assert!(cfg.listeners[0].webhook.is_none());
    }

    #[test]
    fn camel_case_fields_and_defaults() {
        let cfg = parse_config(
            r#"
useRestApi: true
listeners:
  - bind: "::"
    udp: 19132
    haproxy: true
    webhook: "  https://example.invalid/hook  "
    target:
      host: 2001:db8::5
      udp: 19133
"#,
        )
        .expect("parse");
        assert_eq!(cfg.endpoint, 6000);
        assert!(cfg.use_rest_api);
        assert!(cfg.save_player_ip);
        let l = &cfg.listeners[0];
        assert!(l.emit_ppv2);
        assert_eq!(l.udp, Some(19132));
        assert_eq!(l.webhook.as_deref(), Some("https://example.invalid/hook"));
        assert_eq!(l.target.host, "2001:db8::5");
    }

    #[test]
    fn missing_listeners_is_fatal() {
        let err = parse_config("endpoint: 6000\n").unwrap_err();
        assert!(err.to_string().contains("listeners"));
    }

    #[test]
    fn non_list_listeners_is_fatal() {
        assert!(parse_config("listeners: nope\n").is_err());
    }

    #[test]
    fn blank_webhook_is_dropped() {
        let cfg = parse_config(
            r#"
listeners:
  - bind: 0.0.0.0
    tcp: 1
    webhook: "   "
    target:
      host: 127.0.0.1
      tcp: 2
"#,
        )
        .expect("parse");
        assert!(cfg.listeners[0].webhook.is_none());
    }
}
