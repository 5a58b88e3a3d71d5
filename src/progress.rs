//! 전송 진행률 집계
//!
//! update()는 원자적 덧셈뿐이다 - 임의 개수의 워커가 동시에 불러도
//! 블로킹이 없다. rate/ETA 계산은 읽는 쪽(snapshot)에서만 수행해
//! 업데이트 경합을 피한다. 집계기는 표시 계층을 전혀 모른다.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// rate 윈도우 샘플 수 상한
const RATE_WINDOW_SAMPLES: usize = 32;

/// rate 윈도우 시간 폭
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// 진행률 스냅샷 (읽기 전용 뷰)
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// 세션 ID
    pub session_id: u64,

    /// 누적 전송 바이트
    pub bytes_transferred: u64,

    /// 총 바이트
    pub total_bytes: u64,

    /// 순간 전송률 (bytes/sec, 슬라이딩 윈도우)
    pub rate_bps: f64,

    /// 남은 시간 추정 (전송률 0이면 None)
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    /// 진행 비율 (0.0 ~ 1.0)
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.bytes_transferred as f64 / self.total_bytes as f64
    }
}

/// 스냅샷 시점 샘플
#[derive(Debug, Clone, Copy)]
struct RateSample {
    at: Instant,
    bytes: u64,
}

/// 세션 하나의 진행 상태
struct SessionProgress {
    total_bytes: u64,

    /// 워커별 누적 카운터
    workers: DashMap<u32, AtomicU64>,

    /// rate 계산용 샘플 윈도우 (읽기 시점에만 갱신)
    samples: Mutex<VecDeque<RateSample>>,
}

/// 진행률 집계기
pub struct ProgressAggregator {
    sessions: DashMap<u64, Arc<SessionProgress>>,
}

impl ProgressAggregator {
    /// 새 집계기 생성
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// 세션 등록
    pub fn register(&self, session_id: u64, total_bytes: u64) {
        self.sessions.insert(
            session_id,
            Arc::new(SessionProgress {
                total_bytes,
                workers: DashMap::new(),
                samples: Mutex::new(VecDeque::with_capacity(RATE_WINDOW_SAMPLES)),
            }),
        );
    }

    /// 워커 바이트 증가분 기록
    ///
    /// 등록되지 않은 세션이면 무시 (취소 경합 중의 늦은 보고)
    pub fn update(&self, session_id: u64, worker_id: u32, delta: u64) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };

        if let Some(counter) = session.workers.get(&worker_id) {
            counter.fetch_add(delta, Ordering::Relaxed);
        } else {
            session
                .workers
                .entry(worker_id)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(delta, Ordering::Relaxed);
        };
    }

    /// 세션 스냅샷 계산 (누적 카운터 합산 + 슬라이딩 윈도우)
    pub fn snapshot(&self, session_id: u64) -> Option<ProgressSnapshot> {
        let session = self.sessions.get(&session_id)?;

        let bytes: u64 = session
            .workers
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .sum();

        let now = Instant::now();
        let rate_bps = {
            let mut samples = session.samples.lock();
            samples.push_back(RateSample { at: now, bytes });

            while samples.len() > RATE_WINDOW_SAMPLES {
                samples.pop_front();
            }
            while samples
                .front()
                .is_some_and(|s| now.duration_since(s.at) > RATE_WINDOW)
            {
                samples.pop_front();
            }

            match (samples.front(), samples.back()) {
                (Some(first), Some(last)) if last.at > first.at => {
                    (last.bytes - first.bytes) as f64
                        / last.at.duration_since(first.at).as_secs_f64()
                }
                _ => 0.0,
            }
        };

        let remaining = session.total_bytes.saturating_sub(bytes);
        let eta = if rate_bps > 0.0 && remaining > 0 {
            Some(Duration::from_secs_f64(remaining as f64 / rate_bps))
        } else {
            None
        };

        Some(ProgressSnapshot {
            session_id,
            bytes_transferred: bytes,
            total_bytes: session.total_bytes,
            rate_bps,
            eta,
        })
    }

    /// 세션 제거 (종료 상태 승인 후)
    pub fn remove(&self, session_id: u64) {
        self.sessions.remove(&session_id);
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new()
    }
}
