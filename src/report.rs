use crate::campaign::SweepResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The two fields scraped out of the otherwise-opaque client logs: the
/// per-interval throughput samples (a bracketed numeric sequence) and the
/// `lat = <number>ms` token (`latency = ` is also accepted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub peak_throughput: u64,
    pub latency_ms: f64,
}

/// Extracts every bracketed integer sequence from `text`. Bracketed spans
/// that are not comma-separated integers are ignored.
pub fn throughput_samples(text: &str) -> Vec<Vec<u64>> {
    let mut sequences = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('[') {
        let after = &rest[start + 1..];
        let Some(end) = after.find(']') else { break };
        if let Some(samples) = parse_samples(&after[..end]) {
            sequences.push(samples);
        }
        rest = &after[end + 1..];
    }
    sequences
}

fn parse_samples(inner: &str) -> Option<Vec<u64>> {
    let mut samples = Vec::new();
    for token in inner.split(',') {
        samples.push(token.trim().parse().ok()?);
    }
    if samples.is_empty() {
        None
    } else {
        Some(samples)
    }
}

/// Extracts every latency token from `text`.
pub fn latencies(text: &str) -> Vec<f64> {
    let mut found = Vec::new();
    for prefix in ["lat = ", "latency = "] {
        let mut rest = text;
        while let Some(start) = rest.find(prefix) {
            let after = &rest[start + prefix.len()..];
            if let Some(end) = after.find("ms") {
                if let Ok(latency) = after[..end].trim().parse::<f64>() {
                    found.push(latency);
                }
            }
            rest = after;
        }
    }
    found
}

/// Metrics of one run from the concatenated text of its fetched logs:
/// peak throughput is the maximum interval sample across all clients,
/// latency the average of the reported per-client latencies.
pub fn scan_text(text: &str) -> Option<RunMetrics> {
    let peak = throughput_samples(text)
        .into_iter()
        .flatten()
        .max()?;
    let latencies = latencies(text);
    if latencies.is_empty() {
        return None;
    }
    let latency_ms = latencies.iter().sum::<f64>() / latencies.len() as f64;
    Some(RunMetrics {
        peak_throughput: peak,
        latency_ms,
    })
}

/// Reads and concatenates every file under the fetched artifact paths.
fn collect_text(paths: &[std::path::PathBuf]) -> String {
    let mut text = String::new();
    for path in paths {
        append_files(path, &mut text);
    }
    text
}

fn append_files(path: &Path, text: &mut String) {
    if path.is_dir() {
        let Ok(entries) = std::fs::read_dir(path) else { return };
        let mut entries: Vec<_> = entries.flatten().map(|entry| entry.path()).collect();
        entries.sort();
        for entry in entries {
            append_files(&entry, text);
        }
    } else if let Ok(content) = std::fs::read_to_string(path) {
        text.push_str(&content);
        text.push('\n');
    }
}

/// The data behind the throughput/latency-vs-parameter curves: one metrics
/// entry per sweep point that produced scannable logs, sorted by value.
pub fn summarize(result: &SweepResult) -> Vec<(u64, RunMetrics)> {
    let mut summary = Vec::new();
    for point in &result.points {
        let Some(artifact) = &point.artifact else { continue };
        let text = collect_text(&artifact.fetched);
        match scan_text(&text) {
            Some(metrics) => summary.push((point.value, metrics)),
            None => tracing::warn!(
                "run {} produced no scannable throughput/latency data",
                point.run_id
            ),
        }
    }
    summary.sort_by_key(|(value, _)| *value);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{PointStatus, SweepPoint};
    use crate::run::RunArtifact;

    const LOG: &str = "\
starting client
[100, 250, 200]
lat = 12.5ms
";

    #[test]
    fn scrapes_samples_and_latency() {
        let metrics = scan_text(LOG).unwrap();
        assert_eq!(metrics.peak_throughput, 250);
        assert_eq!(metrics.latency_ms, 12.5);
    }

    #[test]
    fn ignores_non_numeric_brackets() {
        let text = "[warn] something\n[1, 2, 3]\nlat = 1.0ms\n";
        assert_eq!(throughput_samples(text), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn accepts_the_long_latency_spelling() {
        let text = "[5]\nlatency = 7ms\n";
        let metrics = scan_text(text).unwrap();
        assert_eq!(metrics.latency_ms, 7.0);
    }

    #[test]
    fn averages_latencies_across_clients() {
        let text = "[10, 20]\nlat = 4.0ms\n[30]\nlat = 6.0ms\n";
        let metrics = scan_text(text).unwrap();
        assert_eq!(metrics.peak_throughput, 30);
        assert_eq!(metrics.latency_ms, 5.0);
    }

    #[test]
    fn no_data_yields_none() {
        assert_eq!(scan_text("nothing to see"), None);
        assert_eq!(scan_text("[1, 2] but no latency"), None);
    }

    #[test]
    fn summarize_walks_fetched_directories() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("client-a").join("log");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join("stderr"), LOG).unwrap();

        let result = SweepResult {
            campaign: "bench".to_string(),
            points: vec![
                SweepPoint {
                    value: 20,
                    run_id: "bench_b20".to_string(),
                    status: PointStatus::Ok,
                    artifact: Some(RunArtifact {
                        run_id: "bench_b20".to_string(),
                        fetched: vec![dir.path().join("client-a")],
                        degraded: false,
                    }),
                },
                SweepPoint {
                    value: 10,
                    run_id: "bench_b10".to_string(),
                    status: PointStatus::Failed,
                    artifact: None,
                },
            ],
            aborted: false,
        };

        let summary = summarize(&result);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].0, 20);
        assert_eq!(summary[0].1.peak_throughput, 250);
    }
}
