//! Observation of limiting decisions and proxied traffic.

use std::fmt::Write as _;

use dashmap::DashMap;

/// Receives every decision a limiter makes. Purely observational.
pub trait DecisionRecorder: Send + Sync {
    fn record(&self, limiter: &str, key: &str, allowed: bool);
}

/// Discards every decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl DecisionRecorder for NoopRecorder {
    fn record(&self, _limiter: &str, _key: &str, _allowed: bool) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct DecisionLabels {
    limiter: String,
    key: String,
    allowed: bool,
}

/// Decision totals per limiter, key and outcome, plus forwarded request
/// totals per destination.
#[derive(Debug, Default)]
pub struct DecisionCounters {
    totals: DashMap<DecisionLabels, u64>,
    /// Keyed by upstream name followed by the matched route prefix
    proxied: DashMap<String, u64>,
}

impl DecisionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total recorded for one label set.
    pub fn get(&self, limiter: &str, key: &str, allowed: bool) -> u64 {
        let labels = DecisionLabels {
            limiter: limiter.to_string(),
            key: key.to_string(),
            allowed,
        };
        self.totals.get(&labels).map(|total| *total).unwrap_or(0)
    }

    /// Count one request forwarded to `dest`.
    pub fn record_proxied(&self, dest: &str) {
        *self.proxied.entry(dest.to_string()).or_insert(0) += 1;
    }

    /// Requests forwarded to `dest` so far.
    pub fn proxied(&self, dest: &str) -> u64 {
        self.proxied.get(dest).map(|total| *total).unwrap_or(0)
    }

    /// Render the totals in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut rows: Vec<(DecisionLabels, u64)> = self
            .totals
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        rows.sort();

        let mut out = String::new();
        out.push_str("# HELP floodgate_limiter_decisions_total Rate limiting decisions.\n");
        out.push_str("# TYPE floodgate_limiter_decisions_total counter\n");
        for (labels, total) in rows {
            let _ = writeln!(
                out,
                "floodgate_limiter_decisions_total{{limiter=\"{}\",key=\"{}\",allowed=\"{}\"}} {}",
                escape(&labels.limiter),
                escape(&labels.key),
                labels.allowed,
                total
            );
        }

        let mut proxied: Vec<(String, u64)> = self
            .proxied
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        proxied.sort();

        out.push_str("# HELP floodgate_proxied_requests_total Requests forwarded to upstreams.\n");
        out.push_str("# TYPE floodgate_proxied_requests_total counter\n");
        for (dest, total) in proxied {
            let _ = writeln!(out, "floodgate_proxied_requests_total{{dest=\"{}\"}} {}", escape(&dest), total);
        }
        out
    }
}

impl DecisionRecorder for DecisionCounters {
    fn record(&self, limiter: &str, key: &str, allowed: bool) {
        let labels = DecisionLabels {
            limiter: limiter.to_string(),
            key: key.to_string(),
            allowed,
        };
        *self.totals.entry(labels).or_insert(0) += 1;
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_label_set() {
        let counters = DecisionCounters::new();
        counters.record("edge", "10.0.0.1", true);
        counters.record("edge", "10.0.0.1", true);
        counters.record("edge", "10.0.0.1", false);
        counters.record("upstream", "api", true);

        assert_eq!(counters.get("edge", "10.0.0.1", true), 2);
        assert_eq!(counters.get("edge", "10.0.0.1", false), 1);
        assert_eq!(counters.get("upstream", "api", true), 1);
        assert_eq!(counters.get("upstream", "api", false), 0);
    }

    #[test]
    fn test_render_exposition() {
        let counters = DecisionCounters::new();
        counters.record("upstream", "api", false);
        counters.record("edge", "global", true);

        let text = counters.render();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[1], "# TYPE floodgate_limiter_decisions_total counter");
        assert_eq!(
            lines[2],
            r#"floodgate_limiter_decisions_total{limiter="edge",key="global",allowed="true"} 1"#
        );
        assert_eq!(
            lines[3],
            r#"floodgate_limiter_decisions_total{limiter="upstream",key="api",allowed="false"} 1"#
        );
    }

    #[test]
    fn test_proxied_requests_per_destination() {
        let counters = DecisionCounters::new();
        counters.record_proxied("api/v1");
        counters.record_proxied("api/v1");
        counters.record_proxied("web");

        assert_eq!(counters.proxied("api/v1"), 2);
        assert_eq!(counters.proxied("web"), 1);
        assert_eq!(counters.proxied("api"), 0);

        let text = counters.render();
        assert!(text.contains("# TYPE floodgate_proxied_requests_total counter\n"));
        assert!(text.contains("floodgate_proxied_requests_total{dest=\"api/v1\"} 2\n"));
        assert!(text.contains("floodgate_proxied_requests_total{dest=\"web\"} 1\n"));
    }

    #[test]
    fn test_label_values_are_escaped() {
        let counters = DecisionCounters::new();
        counters.record("edge", "a\"b", true);
        assert!(counters.render().contains(r#"key="a\"b""#));
    }
}
