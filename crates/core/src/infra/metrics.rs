use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::error::ErrorCode;

/// 保持するレイテンシ記録の上限
const MAX_LATENCIES: usize = 1000;

/// ローカルメトリクス収集器
pub struct Metrics {
    counters: Mutex<MetricsCounters>,
    latencies: Mutex<Vec<LatencyRecord>>,
}

#[derive(Debug, Default)]
struct MetricsCounters {
    stories_created: u64,
    chapters_generated: u64,
    choices_recorded: u64,
    transcriptions: u64,
    contract_retries: u64,
    errors_upstream: u64,
    errors_timeout: u64,
    errors_contract: u64,
    errors_transcription: u64,
    errors_internal: u64,
}

/// 計測フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Narration,
    Synthesis,
    Transcription,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub phase: Phase,
    pub duration_ms: u64,
    pub timestamp: String,
}

/// メトリクスサマリー（/api/metrics で返す）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub stories_created: u64,
    pub chapters_generated: u64,
    pub choices_recorded: u64,
    pub transcriptions: u64,
    pub contract_retries: u64,
    pub error_counts: ErrorCounts,
    pub avg_latency_ms: AvgLatency,
    pub recent_latencies: Vec<LatencyRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorCounts {
    pub upstream: u64,
    pub timeout: u64,
    pub contract: u64,
    pub transcription: u64,
    pub internal: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvgLatency {
    pub narration: Option<f64>,
    pub synthesis: Option<f64>,
    pub transcription: Option<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(MetricsCounters::default()),
            latencies: Mutex::new(Vec::new()),
        }
    }

    pub fn inc_stories_created(&self) {
        self.counters.lock().stories_created += 1;
    }

    pub fn inc_chapters_generated(&self) {
        self.counters.lock().chapters_generated += 1;
    }

    pub fn inc_choices_recorded(&self) {
        self.counters.lock().choices_recorded += 1;
    }

    pub fn inc_transcriptions(&self) {
        self.counters.lock().transcriptions += 1;
    }

    pub fn inc_contract_retries(&self) {
        self.counters.lock().contract_retries += 1;
    }

    /// 上流・内部エラーのみ数える。入力起因 (validation / not found) は対象外
    pub fn inc_error(&self, code: ErrorCode) {
        let mut c = self.counters.lock();
        match code {
            ErrorCode::Upstream => c.errors_upstream += 1,
            ErrorCode::Timeout => c.errors_timeout += 1,
            ErrorCode::ContractViolation => c.errors_contract += 1,
            ErrorCode::Transcription => c.errors_transcription += 1,
            ErrorCode::Storage | ErrorCode::Internal => c.errors_internal += 1,
            ErrorCode::Validation
            | ErrorCode::NotFound
            | ErrorCode::InvalidState
            | ErrorCode::PlaybackBlocked => {}
        }
    }

    pub fn record_latency(&self, phase: Phase, duration_ms: u64) {
        let record = LatencyRecord {
            phase,
            duration_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut latencies = self.latencies.lock();
        latencies.push(record);
        if latencies.len() > MAX_LATENCIES {
            let excess = latencies.len() - MAX_LATENCIES;
            latencies.drain(0..excess);
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let c = self.counters.lock();
        let latencies = self.latencies.lock();

        let avg = |phase: Phase| -> Option<f64> {
            let vals: Vec<f64> = latencies
                .iter()
                .filter(|r| r.phase == phase)
                .map(|r| r.duration_ms as f64)
                .collect();
            if vals.is_empty() {
                None
            } else {
                Some(vals.iter().sum::<f64>() / vals.len() as f64)
            }
        };

        let recent: Vec<LatencyRecord> = latencies.iter().rev().take(20).cloned().collect();

        MetricsSummary {
            stories_created: c.stories_created,
            chapters_generated: c.chapters_generated,
            choices_recorded: c.choices_recorded,
            transcriptions: c.transcriptions,
            contract_retries: c.contract_retries,
            error_counts: ErrorCounts {
                upstream: c.errors_upstream,
                timeout: c.errors_timeout,
                contract: c.errors_contract,
                transcription: c.errors_transcription,
                internal: c.errors_internal,
            },
            avg_latency_ms: AvgLatency {
                narration: avg(Phase::Narration),
                synthesis: avg(Phase::Synthesis),
                transcription: avg(Phase::Transcription),
            },
            recent_latencies: recent,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
