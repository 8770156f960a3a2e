use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One ranked row of speed-test output.
///
/// Metric columns keep the text the tool printed; the typed accessors below
/// coerce on demand. Columns with no canonical name live in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_speed_mbps: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ResultRecord {
    /// Stores a value under its canonical column name.
    pub fn set_field(&mut self, column: &str, value: String) {
        match column {
            "ip" => self.ip = value,
            "sent" => self.sent = Some(value),
            "received" => self.received = Some(value),
            "loss_rate" => self.loss_rate = Some(value),
            "avg_latency_ms" => self.avg_latency_ms = Some(value),
            "jitter_ms" => self.jitter_ms = Some(value),
            "download_speed_mbps" => self.download_speed_mbps = Some(value),
            other => {
                self.extra.insert(other.to_string(), value);
            }
        }
    }

    pub fn sent(&self) -> Option<u32> {
        parse_num(self.sent.as_deref())
    }

    pub fn received(&self) -> Option<u32> {
        parse_num(self.received.as_deref())
    }

    /// Loss as a ratio. The tool prints 0.00–1.00; a value above 1 is read as a percentage.
    pub fn loss_rate(&self) -> Option<f64> {
        parse_num::<f64>(self.loss_rate.as_deref()).map(|v| if v > 1.0 { v / 100.0 } else { v })
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        parse_num(self.avg_latency_ms.as_deref())
    }

    pub fn jitter_ms(&self) -> Option<f64> {
        parse_num(self.jitter_ms.as_deref())
    }

    pub fn download_speed_mbps(&self) -> Option<f64> {
        parse_num(self.download_speed_mbps.as_deref())
    }

    pub fn detail(&self) -> RecordDetail {
        RecordDetail {
            ip: self.ip.clone(),
            sent: self.sent(),
            received: self.received(),
            loss_rate: self.loss_rate(),
            avg_latency_ms: self.avg_latency_ms(),
            jitter_ms: self.jitter_ms(),
            download_speed_mbps: self.download_speed_mbps(),
        }
    }
}

fn parse_num<T: std::str::FromStr>(raw: Option<&str>) -> Option<T> {
    raw.map(str::trim)
        .map(|s| s.trim_end_matches('%'))
        .and_then(|s| s.parse().ok())
}

/// Typed view of a record for API consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordDetail {
    pub ip: String,
    pub sent: Option<u32>,
    pub received: Option<u32>,
    pub loss_rate: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub download_speed_mbps: Option<f64>,
}

/// What the parser dropped or could not map, so silent fallbacks stay observable.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParseDiagnostics {
    pub dropped_rows: usize,
    pub unrecognized_headers: Vec<String>,
    pub missing_ip_column: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let mut r = ResultRecord::default();
        r.set_field("ip", "104.16.1.1".into());
        r.set_field("sent", "4".into());
        r.set_field("loss_rate", "0.25".into());
        r.set_field("avg_latency_ms", "142.50".into());
        r.set_field("download_speed_mbps", "n/a".into());
        r.set_field("colo", "HKG".into());

        assert_eq!(r.sent(), Some(4));
        assert_eq!(r.received(), None);
        assert_eq!(r.loss_rate(), Some(0.25));
        assert_eq!(r.avg_latency_ms(), Some(142.5));
        assert_eq!(r.download_speed_mbps(), None);
        assert_eq!(r.extra.get("colo").map(String::as_str), Some("HKG"));
    }

    #[test]
    fn test_percent_loss_is_normalized() {
        let r = ResultRecord { loss_rate: Some("12%".into()), ..Default::default() };
        assert_eq!(r.loss_rate(), Some(0.12));
    }
}
