use std::{collections::BTreeMap, collections::BTreeSet, sync::Arc};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::lodestone::{net::Protocol, persist::IpEntry};

const COLOR_JOIN: u32 = 0x2ECC71;
const COLOR_LEAVE: u32 = 0xE74C3C;

/// One embed of the webhook wire shape: `{"embeds": [ ... ]}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: u32,
    pub timestamp: String,
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Serialize)]
struct WebhookBody {
    embeds: Vec<Embed>,
}

/// Outbound webhook transport. Dispatch is fire-and-forget: failures are
/// logged once and dropped, and blank URLs are skipped.
pub trait WebhookSink: Send + Sync {
    fn dispatch(&self, url: &str, embed: Embed);
}

pub type SharedSink = Arc<dyn WebhookSink>;

pub struct Notifier {
    client: reqwest::Client,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookSink for Notifier {
    fn dispatch(&self, url: &str, embed: Embed) {
        let url = url.trim();
        if url.is_empty() {
            return;
        }
        let url = url.to_string();
        let client = self.client.clone();

        tokio::spawn(async move {
            let body = WebhookBody {
                embeds: vec![embed],
            };
            match client.post(&url).json(&body).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    tracing::warn!(url = %url, status = %resp.status(), "notify: webhook rejected");
                }
                Ok(_) => {
                    tracing::debug!(url = %url, "notify: webhook delivered");
                }
                Err(err) => {
                    tracing::warn!(url = %url, err = %err, "notify: webhook failed");
                }
            }
        });
    }
}

fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ports_value(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Identified join: a login correlated with one or more observed flows on
/// the same address.
pub fn identity_join(username: &str, ip: &str, ports: &[u16], protocol: Protocol) -> Embed {
    Embed {
        title: Some("Player joined".into()),
        description: Some(format!("**{username}** joined")),
        color: COLOR_JOIN,
        timestamp: timestamp_now(),
        fields: vec![
            EmbedField {
                name: "Address".into(),
                value: ip.to_string(),
                inline: true,
            },
            EmbedField {
                name: "Ports".into(),
                value: ports_value(ports),
                inline: true,
            },
            EmbedField {
                name: "Protocol".into(),
                value: protocol.as_str().into(),
                inline: true,
            },
        ],
        footer: None,
    }
}

/// Identified leave, with the user's stored addresses when known.
pub fn identity_leave(username: &str, ips: &[IpEntry]) -> Embed {
    let fields = ips
        .iter()
        .map(|e| EmbedField {
            name: e.ip.clone(),
            value: e.protocol.clone(),
            inline: true,
        })
        .collect();
    Embed {
        title: Some("Player left".into()),
        description: Some(format!("**{username}** left")),
        color: COLOR_LEAVE,
        timestamp: timestamp_now(),
        fields,
        footer: None,
    }
}

/// Leave for a session whose player name is known but whose address list
/// is a single live flow rather than a stored record.
pub fn session_leave(username: &str, ip: &str, protocol: Protocol) -> Embed {
    Embed {
        title: Some("Player left".into()),
        description: Some(format!("**{username}** left")),
        color: COLOR_LEAVE,
        timestamp: timestamp_now(),
        fields: vec![
            EmbedField {
                name: "Address".into(),
                value: ip.to_string(),
                inline: true,
            },
            EmbedField {
                name: "Protocol".into(),
                value: protocol.as_str().into(),
                inline: true,
            },
        ],
        footer: None,
    }
}

/// Login event with no correlated flow.
pub fn generic_login(username: &str) -> Embed {
    Embed {
        title: Some("Player joined".into()),
        description: Some(format!("**{username}** logged in")),
        color: COLOR_JOIN,
        timestamp: timestamp_now(),
        fields: Vec::new(),
        footer: None,
    }
}

/// Logout event for a user with no stored address.
pub fn generic_logout(username: &str) -> Embed {
    Embed {
        title: Some("Player left".into()),
        description: Some(format!("**{username}** logged out")),
        color: COLOR_LEAVE,
        timestamp: timestamp_now(),
        fields: Vec::new(),
        footer: None,
    }
}

/// Aggregated anonymous connects: one field per client address with its
/// sorted ports.
pub fn connect_summary(
    target: &str,
    protocol: Protocol,
    ports_by_ip: &BTreeMap<String, BTreeSet<u16>>,
) -> Embed {
    summary_embed("Connections opened", COLOR_JOIN, target, protocol, ports_by_ip)
}

pub fn disconnect_summary(
    target: &str,
    protocol: Protocol,
    ports_by_ip: &BTreeMap<String, BTreeSet<u16>>,
) -> Embed {
    summary_embed("Connections closed", COLOR_LEAVE, target, protocol, ports_by_ip)
}

fn summary_embed(
    title: &str,
    color: u32,
    target: &str,
    protocol: Protocol,
    ports_by_ip: &BTreeMap<String, BTreeSet<u16>>,
) -> Embed {
    let fields = ports_by_ip
        .iter()
        .map(|(ip, ports)| EmbedField {
            name: ip.clone(),
            value: ports
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            inline: true,
        })
        .collect();
    Embed {
        title: Some(title.into()),
        description: Some(format!(
            "{} client(s) on {} ({})",
            ports_by_ip.len(),
            target,
            protocol
        )),
        color,
        timestamp: timestamp_now(),
        fields,
        footer: Some(EmbedFooter {
            text: target.to_string(),
        }),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_serializes_to_wire_shape() {
        let mut ports = BTreeSet::new();
        ports.insert(19132);
        ports.insert(19133);
        let mut by_ip = BTreeMap::new();
        by_ip.insert("198.51.100.7".to_string(), ports);

        let v = serde_json::to_value(connect_summary("127.0.0.1:9000", Protocol::Udp, &by_ip))
            .unwrap();
        assert_eq!(v["title"], "Connections opened");
        assert_eq!(v["fields"][0]["name"], "198.51.100.7");
        assert_eq!(v["fields"][0]["value"], "19132, 19133");
        assert_eq!(v["fields"][0]["inline"], true);
        assert_eq!(v["footer"]["text"], "127.0.0.1:9000");
        assert!(v["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn optional_parts_are_omitted() {
        let v = serde_json::to_value(generic_login("Steve")).unwrap();
        assert!(v.get("footer").is_none());
        assert_eq!(v["fields"].as_array().unwrap().len(), 0);
        assert_eq!(v["description"], "**Steve** logged in");
    }
}
