//! 청크 분할 계획
//!
//! (크기, 병렬도, 최소 범위)만으로 송수신 양쪽이 동일한 범위를 계산한다.
//! 추가 조정 메시지 없이 오프셋 기반 조립이 가능하다.
//! 범위들은 [0, size)를 겹침도 틈도 없이 정확히 한 번 덮는다.

use crate::session::{TransferManifest, TransferMode};

/// 워커 하나가 담당하는 연속 바이트 범위
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAssignment {
    /// 매니페스트 내 파일 인덱스
    pub file_index: u32,

    /// 파일 내 시작 오프셋 (바이트)
    pub offset: u64,

    /// 담당 길이 (바이트)
    pub length: u64,

    /// 세션 내 보조 연결 순번
    pub conn_index: u32,
}

impl ChunkAssignment {
    /// 담당 보조 포트 (기본 포트에서 결정적으로 유도)
    pub fn aux_port(&self, primary_port: u16) -> u16 {
        primary_port
            .wrapping_add(1)
            .wrapping_add(self.conn_index as u16)
    }
}

/// 파일 하나를 근사 균등한 연속 범위들로 분할
///
/// 범위 수 = min(parallelism, ceil(size / min_chunk)), 최소 1.
/// 마지막 범위가 나머지를 가져간다.
pub fn plan_file_chunks(
    file_index: u32,
    size: u64,
    parallelism: u32,
    min_chunk: u64,
) -> Vec<ChunkAssignment> {
    let min_chunk = min_chunk.max(1);
    let by_size = ((size + min_chunk - 1) / min_chunk).max(1);
    let count = (parallelism.max(1) as u64).min(by_size);
    let base = size / count;

    (0..count)
        .map(|i| {
            let offset = i * base;
            let length = if i == count - 1 { size - offset } else { base };
            ChunkAssignment {
                file_index,
                offset,
                length,
                conn_index: i as u32,
            }
        })
        .collect()
}

/// 세션 전체 보조 연결 계획
///
/// 임계값 이상인 파일만 분할 대상이며, conn_index는 전역 순번으로 다시 매긴다.
/// 보조 포트 = 기본 포트 + 1 + conn_index.
pub fn plan_session_chunks(
    manifest: &TransferManifest,
    parallelism: u32,
    threshold: u64,
    min_chunk: u64,
) -> Vec<ChunkAssignment> {
    let mut assignments = Vec::new();

    for (index, file) in manifest.files.iter().enumerate() {
        if file.is_dir || file.size_bytes < threshold {
            continue;
        }
        for mut assign in plan_file_chunks(index as u32, file.size_bytes, parallelism, min_chunk) {
            assign.conn_index = assignments.len() as u32;
            assignments.push(assign);
        }
    }

    assignments
}

/// 기본 연결로 순차 전송되는 파일 인덱스 (매니페스트 순서)
///
/// Single 모드면 전부, Multi 모드면 임계값 미만 파일만
pub fn sequential_file_indices(
    manifest: &TransferManifest,
    mode: TransferMode,
    threshold: u64,
) -> Vec<usize> {
    manifest
        .files
        .iter()
        .enumerate()
        .filter(|(_, f)| !f.is_dir)
        .filter(|(_, f)| mode == TransferMode::Single || f.size_bytes < threshold)
        .map(|(i, _)| i)
        .collect()
}
