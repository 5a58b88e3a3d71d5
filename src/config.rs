//! 엔진 설정

use std::time::Duration;

use crate::{DEFAULT_BUFFER_SIZE, DEFAULT_DISCOVERY_PORT};

/// NetShare 엔진 설정
///
/// 모드/분할 의미가 걸린 값(multi_stream_threshold, min_parallel_chunk,
/// max_workers)은 핸드쉐이크에 실려 세션마다 양쪽이 같은 값을 사용한다.
/// 로컬 설정이 달라도 프로토콜은 깨지지 않는다.
#[derive(Debug, Clone)]
pub struct Config {
    /// 소켓/파일 버퍼 크기 (바이트)
    pub buffer_size: usize,

    /// 소켓 유휴 타임아웃 (밀리초)
    /// 이 시간 동안 바이트가 흐르지 않으면 세션 실패
    pub idle_timeout_ms: u64,

    /// 최대 병렬 워커 수
    pub max_workers: u32,

    /// 멀티스트림 전환 기준 파일 크기 (바이트)
    pub multi_stream_threshold: u64,

    /// 워커당 최소 담당 범위 (바이트)
    pub min_parallel_chunk: u64,

    /// 탐색 announce 주기 (밀리초)
    pub discovery_interval_ms: u64,

    /// 탐색 포트 (UDP 브로드캐스트)
    pub discovery_port: u16,

    /// 수락 결정 타임아웃 (밀리초)
    /// 초과 시 자동 거절
    pub decision_timeout_ms: u64,

    /// 진행률 구독 샘플 주기 (밀리초)
    pub progress_interval_ms: u64,

    /// 핸드쉐이크 봉투 최대 크기 (바이트, 비정상 길이 방어)
    pub handshake_max_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout_ms: 30_000,                      // 30초
            max_workers: 4,
            multi_stream_threshold: 200 * 1024 * 1024,    // 200MB
            min_parallel_chunk: 100 * 1024 * 1024,        // 워커당 최소 100MB
            discovery_interval_ms: 3_000,                 // 3초
            discovery_port: DEFAULT_DISCOVERY_PORT,
            decision_timeout_ms: 30_000,                  // 30초
            progress_interval_ms: 200,
            handshake_max_bytes: 16 * 1024 * 1024,        // 16MB
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 소켓 유휴 타임아웃
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// 탐색 announce 주기
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    /// 피어 신선도 한계 (announce 주기의 2배)
    /// 이 시간 동안 announce가 없으면 피어 테이블에서 제거
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms * 2)
    }

    /// 수락 결정 타임아웃
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    /// 진행률 샘플 주기
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// 고속 유선 LAN용 설정
    pub fn high_throughput() -> Self {
        Self {
            buffer_size: 4 * 1024 * 1024,                 // 4MB
            idle_timeout_ms: 15_000,
            max_workers: 8,
            multi_stream_threshold: 100 * 1024 * 1024,    // 100MB
            min_parallel_chunk: 50 * 1024 * 1024,
            discovery_interval_ms: 2_000,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            decision_timeout_ms: 30_000,
            progress_interval_ms: 100,
            handshake_max_bytes: 16 * 1024 * 1024,
        }
    }

    /// 불안정/저속 네트워크용 설정
    pub fn conservative() -> Self {
        Self {
            buffer_size: 256 * 1024,                      // 256KB
            idle_timeout_ms: 60_000,
            max_workers: 2,
            multi_stream_threshold: 500 * 1024 * 1024,    // 500MB
            min_parallel_chunk: 200 * 1024 * 1024,
            discovery_interval_ms: 5_000,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            decision_timeout_ms: 60_000,
            progress_interval_ms: 500,
            handshake_max_bytes: 16 * 1024 * 1024,
        }
    }
}
