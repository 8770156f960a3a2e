//! CSV result parser for the speed-test tool.
//!
//! The tool ranks its own output: row order is kept exactly and the first
//! record is the run's best IP. Nothing here re-sorts.

use crate::models::{ParseDiagnostics, ResultRecord};

const DELIMITER: char = ',';

/// Header label (whitespace removed, lower-cased) -> canonical column.
const HEADER_MAP: &[(&str, &str)] = &[
    ("ip地址", "ip"),
    ("ip", "ip"),
    ("已发送", "sent"),
    ("sent", "sent"),
    ("已接收", "received"),
    ("received", "received"),
    ("丢包率", "loss_rate"),
    ("loss_rate", "loss_rate"),
    ("平均延迟", "avg_latency_ms"),
    ("延迟", "avg_latency_ms"),
    ("avg_latency_ms", "avg_latency_ms"),
    ("抖动", "jitter_ms"),
    ("jitter_ms", "jitter_ms"),
    ("下载速度(mb/s)", "download_speed_mbps"),
    ("下载速度", "download_speed_mbps"),
    ("download_speed_mbps", "download_speed_mbps"),
    ("地区码", "colo"),
    ("城市", "city"),
    ("国家", "country"),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseReport {
    pub records: Vec<ResultRecord>,
    pub diagnostics: ParseDiagnostics,
}

impl ParseReport {
    /// The first record's IP, when it has one.
    pub fn best_ip(&self) -> Option<&str> {
        self.records.first().map(|r| r.ip.as_str()).filter(|ip| !ip.is_empty())
    }
}

/// Normalises a header label and maps it onto its canonical column name.
/// Returns `(name, recognized)`.
pub fn canonical_header(label: &str) -> (String, bool) {
    let normalized: String = label
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    match HEADER_MAP.iter().find(|(k, _)| *k == normalized) {
        Some((_, canonical)) => (canonical.to_string(), true),
        None => (normalized, false),
    }
}

pub fn parse(raw: &str) -> ParseReport {
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());

    let Some(header_line) = lines.next() else {
        return ParseReport::default();
    };

    let mut diagnostics = ParseDiagnostics::default();
    let columns: Vec<String> = header_line
        .split(DELIMITER)
        .map(|label| {
            let (name, recognized) = canonical_header(label);
            if !recognized {
                diagnostics.unrecognized_headers.push(name.clone());
            }
            name
        })
        .collect();
    diagnostics.missing_ip_column = !columns.iter().any(|c| c == "ip");

    let mut records = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split(DELIMITER).collect();
        if fields.len() < columns.len() {
            diagnostics.dropped_rows += 1;
            continue;
        }
        let mut record = ResultRecord::default();
        for (column, value) in columns.iter().zip(fields) {
            record.set_field(column, value.trim().to_string());
        }
        records.push(record);
    }

    ParseReport { records, diagnostics }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "IP 地址,已发送,已接收,丢包率,平均延迟,下载速度 (MB/s)\n\
104.16.12.3,4,4,0.00,142.31,12.40\n\
172.64.33.9,4,3,0.25,150.02,9.87\n\
104.17.0.8,4,4,0.00,160.77,8.01\n";

    #[test]
    fn test_empty_input_yields_no_records() {
        assert!(parse("").records.is_empty());
        assert!(parse("\n\n").records.is_empty());
    }

    #[test]
    fn test_header_only_yields_no_records() {
        let report = parse("IP 地址,已发送,已接收,丢包率,平均延迟,下载速度 (MB/s)\n");
        assert!(report.records.is_empty());
        assert_eq!(report.diagnostics.dropped_rows, 0);
        assert_eq!(report.best_ip(), None);
    }

    #[test]
    fn test_order_is_preserved_and_first_is_best() {
        let report = parse(SAMPLE);
        let ips: Vec<&str> = report.records.iter().map(|r| r.ip.as_str()).collect();
        assert_eq!(ips, vec!["104.16.12.3", "172.64.33.9", "104.17.0.8"]);
        assert_eq!(report.best_ip(), Some("104.16.12.3"));
    }

    #[test]
    fn test_worse_latency_first_is_not_resorted() {
        let csv = "IP 地址,平均延迟\n9.9.9.9,300\n1.1.1.1,10\n";
        assert_eq!(parse(csv).best_ip(), Some("9.9.9.9"));
    }

    #[test]
    fn test_headers_map_to_canonical_fields() {
        let report = parse(SAMPLE);
        let second = &report.records[1];
        assert_eq!(second.sent.as_deref(), Some("4"));
        assert_eq!(second.received.as_deref(), Some("3"));
        assert_eq!(second.loss_rate.as_deref(), Some("0.25"));
        assert_eq!(second.avg_latency_ms.as_deref(), Some("150.02"));
        assert_eq!(second.download_speed_mbps.as_deref(), Some("9.87"));
        assert!(report.diagnostics.unrecognized_headers.is_empty());
    }

    #[test]
    fn test_header_spacing_and_case_are_ignored() {
        assert_eq!(canonical_header("IP地址").0, "ip");
        assert_eq!(canonical_header(" ip 地址 ").0, "ip");
        assert_eq!(canonical_header("下载速度(MB/s)").0, "download_speed_mbps");
        assert_eq!(canonical_header("Avg_Latency_MS").0, "avg_latency_ms");
    }

    #[test]
    fn test_unrecognized_headers_pass_through_normalized() {
        let report = parse("IP 地址,Data Center\n1.0.0.1,SJC\n");
        assert_eq!(report.diagnostics.unrecognized_headers, vec!["datacenter".to_string()]);
        assert_eq!(report.records[0].extra.get("datacenter").map(String::as_str), Some("SJC"));
    }

    #[test]
    fn test_short_rows_dropped_long_rows_kept() {
        let csv = "IP 地址,已发送,已接收\n1.1.1.1,4,4\n2.2.2.2,4\n3.3.3.3,4,4,extra,fields\n";
        let report = parse(csv);
        let ips: Vec<&str> = report.records.iter().map(|r| r.ip.as_str()).collect();
        assert_eq!(ips, vec!["1.1.1.1", "3.3.3.3"]);
        assert_eq!(report.diagnostics.dropped_rows, 1);
        assert!(report.records[1].extra.is_empty());
    }

    #[test]
    fn test_bom_and_crlf() {
        let csv = "\u{feff}IP 地址,平均延迟\r\n1.1.1.1,20\r\n";
        let report = parse(csv);
        assert_eq!(report.best_ip(), Some("1.1.1.1"));
        assert_eq!(report.records[0].avg_latency_ms.as_deref(), Some("20"));
    }

    #[test]
    fn test_ipv6_records() {
        let report = parse("IP 地址,平均延迟\n2606:4700::6810:1,55\n");
        assert_eq!(report.best_ip(), Some("2606:4700::6810:1"));
    }

    #[test]
    fn test_missing_ip_column_is_reported() {
        let report = parse("平均延迟,丢包率\n20,0.0\n");
        assert!(report.diagnostics.missing_ip_column);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.best_ip(), None);
    }
}
