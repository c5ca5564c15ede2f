//! Cluster metrics aggregation. Each worker exposes Prometheus text on its
//! metric port; the coordinator pulls every instance, parses the text into
//! per-metric blocks, aggregates across instances and serializes back to
//! Prometheus text. Responses are cached for a configurable window.

use std::collections::BTreeMap;
use std::sync::{
    Arc,
    Mutex as StdMutex,
};
use std::time::{
    Duration,
    Instant,
};

use infermesh_cluster::{
    ClusterNodes,
    InstanceInfo,
};
use tracing::{
    debug,
    warn,
};

use crate::error::MetricsError;
use crate::manager::{
    ReqManager,
    RequestStats,
};

/// One metric family: HELP/TYPE plus parallel label/value sample arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricBlock {
    pub name: String,
    pub help: String,
    pub mtype: String,
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

/// Metrics of one worker plus its weighting term.
#[derive(Debug, Clone)]
pub struct PodMetrics {
    pub npu_mem_size: u64,
    pub metrics: Vec<MetricBlock>,
}

/// Parses Prometheus text: `# HELP`, `# TYPE`, then samples of the form
/// `<labelset> <value>` until the next `#` line.
pub fn parse_metric_text(text: &str) -> Result<Vec<MetricBlock>, MetricsError> {
    let mut blocks: Vec<MetricBlock> = Vec::new();
    let mut lines = text.lines().peekable();
    while let Some(&line) = lines.peek() {
        if line.trim().is_empty() {
            lines.next();
            continue;
        }
        let help_line = lines
            .next()
            .ok_or_else(|| MetricsError::Parse("missing # HELP line".to_string()))?;
        let (name, help) = parse_comment_line(help_line, "HELP")?;
        let type_line = lines
            .next()
            .ok_or_else(|| MetricsError::Parse(format!("metric {name} missing # TYPE line")))?;
        let (type_name, mtype) = parse_comment_line(type_line, "TYPE")?;
        if type_name != name {
            return Err(MetricsError::Parse(format!(
                "TYPE line names {type_name} inside metric {name}"
            )));
        }
        let mut block = MetricBlock {
            name,
            help,
            mtype,
            labels: Vec::new(),
            values: Vec::new(),
        };
        while let Some(&sample) = lines.peek() {
            if sample.starts_with('#') || sample.trim().is_empty() {
                break;
            }
            lines.next();
            let mut parts = sample.split_whitespace();
            let label = parts
                .next()
                .ok_or_else(|| MetricsError::Parse(format!("empty sample in {}", block.name)))?;
            let value_text = parts.next().ok_or_else(|| {
                MetricsError::Parse(format!("sample {label} has no value in {}", block.name))
            })?;
            let value = value_text.parse::<f64>().map_err(|_| {
                MetricsError::Parse(format!("invalid value {value_text} for {label}"))
            })?;
            block.labels.push(label.to_string());
            block.values.push(value);
        }
        blocks.push(block);
    }
    if blocks.is_empty() {
        return Err(MetricsError::Parse("no metrics in text".to_string()));
    }
    Ok(blocks)
}

fn parse_comment_line(line: &str, keyword: &str) -> Result<(String, String), MetricsError> {
    let rest = line
        .strip_prefix('#')
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix(keyword))
        .map(str::trim_start)
        .ok_or_else(|| MetricsError::Parse(format!("expected # {keyword} line, got: {line}")))?;
    let mut parts = rest.splitn(2, [' ', '\t']);
    let name = parts
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| MetricsError::Parse(format!("missing metric name in {keyword} line")))?;
    let tail = parts.next().unwrap_or("").trim().to_string();
    Ok((name.to_string(), tail))
}

/// Aggregates per metric across instances, applying the per-name rules and
/// overwriting the request totals from the manager's counters.
pub fn aggregate_metrics(
    pods: &[PodMetrics], stats: RequestStats,
) -> Result<Vec<MetricBlock>, MetricsError> {
    let first = pods.first().ok_or(MetricsError::NoInstances)?;
    let metric_count = first.metrics.len();
    if pods.iter().any(|pod| pod.metrics.len() != metric_count) {
        return Err(MetricsError::CountMismatch);
    }

    let mut aggregate: Vec<MetricBlock> = Vec::with_capacity(metric_count);
    let mut fail_req_index = None;
    for index in 0..metric_count {
        let template = &first.metrics[index];
        let mut block = MetricBlock {
            name: template.name.clone(),
            help: template.help.clone(),
            mtype: template.mtype.clone(),
            labels: template.labels.clone(),
            values: Vec::new(),
        };
        match block.name.as_str() {
            "npu_cache_usage_perc" | "cpu_cache_usage_perc" => {
                let mut weighted = 0.0;
                let mut total_weight = 0.0;
                for pod in pods {
                    let value = pod.metrics[index].values.first().copied().unwrap_or(0.0);
                    weighted += pod.npu_mem_size as f64 * value;
                    total_weight += pod.npu_mem_size as f64;
                }
                block.values.push(weighted / total_weight);
            }
            "npu_prefix_cache_hit_rate" => {
                if block.mtype == "counter" || block.mtype == "gauge" {
                    let sum: f64 = pods
                        .iter()
                        .map(|pod| pod.metrics[index].values.first().copied().unwrap_or(0.0))
                        .sum();
                    block.values.push(sum / pods.len() as f64);
                }
            }
            "failed_request_perc" => {
                fail_req_index = Some(aggregate.len());
            }
            "request_received_total" => block.values.push(stats.all as f64),
            "request_failed_total" => block.values.push(stats.fail as f64),
            "request_success_total" => block.values.push(stats.success as f64),
            _ => {
                if block.mtype == "counter" || block.mtype == "gauge" {
                    let sum: f64 = pods
                        .iter()
                        .map(|pod| pod.metrics[index].values.first().copied().unwrap_or(0.0))
                        .sum();
                    block.values.push(sum);
                } else {
                    // Histograms sum element-wise across every bucket slot.
                    let slots = template.labels.len();
                    let mut sums = vec![0.0; slots];
                    for pod in pods {
                        for (slot, sum) in sums.iter_mut().enumerate() {
                            *sum += pod.metrics[index].values.get(slot).copied().unwrap_or(0.0);
                        }
                    }
                    block.values = sums;
                }
            }
        }
        aggregate.push(block);
    }

    if let Some(index) = fail_req_index {
        let failed_rate = if stats.all > 0 {
            stats.fail as f64 / stats.all as f64
        } else {
            0.0
        };
        aggregate[index].values = vec![failed_rate];
        debug!(failed_rate, "updated failed request percentage");
    }
    Ok(aggregate)
}

fn write_value(out: &mut String, value: f64) {
    if value.is_nan() {
        out.push_str("Nan");
    } else if value.is_infinite() {
        out.push_str(if value < 0.0 { "-Inf" } else { "+Inf" });
    } else {
        out.push_str(&format!("{value}"));
    }
}

pub fn serialize_metrics(blocks: &[MetricBlock]) -> String {
    let mut out = String::new();
    for block in blocks {
        out.push_str(&format!("# HELP {} {}\n", block.name, block.help));
        out.push_str(&format!("# TYPE {} {}\n", block.name, block.mtype));
        for (label, value) in block.labels.iter().zip(block.values.iter()) {
            out.push_str(label);
            out.push(' ');
            write_value(&mut out, *value);
            out.push('\n');
        }
    }
    out
}

/// Serves `GET /metrics`: pulls every instance, aggregates and caches the
/// rendered text for `reuse` to amortize the fan-out.
pub struct MetricsListener {
    cluster: Arc<ClusterNodes>,
    manager: Arc<ReqManager>,
    http: reqwest::Client,
    reuse: Duration,
    cache: StdMutex<Option<(String, Instant)>>,
}

impl MetricsListener {
    pub fn new(cluster: Arc<ClusterNodes>, manager: Arc<ReqManager>, reuse: Duration) -> Self {
        Self {
            cluster,
            manager,
            http: reqwest::Client::new(),
            reuse,
            cache: StdMutex::new(None),
        }
    }

    pub async fn handle(&self) -> Result<String, MetricsError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((text, at)) = cache.as_ref() {
                if at.elapsed() < self.reuse {
                    debug!("rapid recall, reusing last metric results");
                    return Ok(text.clone());
                }
            }
        }

        let pods = self.collect(self.cluster.all_infos()).await?;
        let aggregated = aggregate_metrics(&pods, self.manager.stats())?;
        let text = serialize_metrics(&aggregated);
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((text.clone(), Instant::now()));
        Ok(text)
    }

    async fn collect(
        &self, infos: BTreeMap<u64, InstanceInfo>,
    ) -> Result<Vec<PodMetrics>, MetricsError> {
        if infos.is_empty() {
            return Err(MetricsError::NoInstances);
        }
        let mut pods = Vec::with_capacity(infos.len());
        for (id, info) in infos {
            let addr = format!("http://{}:{}/metrics", info.ip, info.metric_port);
            debug!(id, %addr, "pulling instance metrics");
            let response = self
                .http
                .get(&addr)
                .send()
                .await
                .map_err(|e| MetricsError::Pull {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })?;
            if !response.status().is_success() {
                return Err(MetricsError::Pull {
                    addr,
                    reason: format!("status {}", response.status()),
                });
            }
            let text = response.text().await.map_err(|e| MetricsError::Pull {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
            let metrics = parse_metric_text(&text)?;
            if let Some(first) = pods.first() {
                let first: &PodMetrics = first;
                if first.metrics.len() != metrics.len() {
                    warn!(id, "instance reported a different metric count");
                    return Err(MetricsError::CountMismatch);
                }
            }
            pods.push(PodMetrics {
                npu_mem_size: info.total_block_num,
                metrics,
            });
        }
        Ok(pods)
    }
}
