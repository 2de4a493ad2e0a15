use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{CrlNumber, RevokedEntry};

/// Whether a worker may fetch incrementally or must rebuild from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Incremental,
    Full,
}

/// Requests sent to the external harvester and downloader.
///
/// Every variant carries enough context to be replayed safely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchMessage {
    Harvest {
        issuer: String,
        crl_location: String,
        mode: FetchMode,
    },
    Download {
        issuer: String,
        mode: FetchMode,
    },
    ColdStart {
        crl_url: String,
        cert_url: String,
    },
    RemoveCa {
        issuer: String,
    },
}

impl DispatchMessage {
    /// The worker queue this message belongs to.
    pub fn queue(&self) -> Queue {
        match self {
            DispatchMessage::Harvest { .. } | DispatchMessage::RemoveCa { .. } => {
                Queue::Harvester
            }
            DispatchMessage::Download { .. } | DispatchMessage::ColdStart { .. } => {
                Queue::Downloader
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DispatchMessage::Harvest { .. } => "harvest",
            DispatchMessage::Download { .. } => "download",
            DispatchMessage::ColdStart { .. } => "cold_start",
            DispatchMessage::RemoveCa { .. } => "remove_ca",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    Harvester,
    Downloader,
}

impl Queue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Harvester => "harvester",
            Queue::Downloader => "downloader",
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound proxy a worker should use for its fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
}

/// A message plus the identity that stays stable across redeliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub message: DispatchMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySettings>,
}

impl Envelope {
    pub fn new(message: DispatchMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            message,
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<ProxySettings>) -> Self {
        self.proxy = proxy;
        self
    }
}

/// A parsed CRL, as reported back by the harvester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestReport {
    pub issuer: String,
    pub crl_number: CrlNumber,
    #[serde(default)]
    pub this_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_update: Option<DateTime<Utc>>,
    pub entries: Vec<RevokedEntry>,
}

/// A CA certificate fetched by the downloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColdStartReport {
    /// Name of the already registered authority that issued the certificate.
    pub parent_issuer: String,
    /// Hex encoded DER certificate.
    pub certificate_der: String,
    pub crl_url: Option<String>,
}

/// Worker completion reports, in the shape they travel on the report queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReport {
    Harvested(HarvestReport),
    Downloaded(ColdStartReport),
    Removed { issuer: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_routing() {
        let harvest = DispatchMessage::Harvest {
            issuer: "CN=CA".into(),
            crl_location: "http://crl".into(),
            mode: FetchMode::Incremental,
        };
        assert_eq!(harvest.queue(), Queue::Harvester);
        assert_eq!(
            DispatchMessage::RemoveCa {
                issuer: "CN=CA".into()
            }
            .queue(),
            Queue::Harvester
        );
        assert_eq!(
            DispatchMessage::ColdStart {
                crl_url: "a".into(),
                cert_url: "b".into()
            }
            .queue(),
            Queue::Downloader
        );
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new(DispatchMessage::Download {
            issuer: "CN=CA".into(),
            mode: FetchMode::Full,
        });
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["message"]["type"], "download");
        assert_eq!(json["message"]["mode"], "full");

        assert!(json.get("proxy").is_none());

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_envelope_carries_proxy() {
        let envelope = Envelope::new(DispatchMessage::ColdStart {
            crl_url: "http://crl.example.com/root.crl".into(),
            cert_url: "http://ca.example.com/root.cer".into(),
        })
        .with_proxy(Some(ProxySettings {
            host: "proxy.internal".into(),
            port: 3128,
        }));

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["proxy"]["host"], "proxy.internal");
        assert_eq!(json["proxy"]["port"], 3128);
    }

    #[test]
    fn test_report_decoding() {
        let report: WorkerReport = serde_json::from_str(
            r#"{"type":"harvested","issuer":"CN=CA","crl_number":"7",
                "entries":[{"serial_number":"12","revocation_date":"2024-01-01T00:00:00Z"}]}"#,
        )
        .unwrap();
        let WorkerReport::Harvested(report) = report else {
            panic!("expected a harvest report");
        };
        assert_eq!(report.crl_number, CrlNumber::from(7u64));
        assert_eq!(report.entries.len(), 1);
    }
}
