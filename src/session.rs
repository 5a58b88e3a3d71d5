//! 세션 핸드쉐이크 프로토콜
//!
//! 기본 연결에서 파일 바이트에 앞서 전송되는 메타데이터 봉투.
//! 같은 연결 위에 원시 바이트가 이어지므로 길이 프리픽스(4바이트 BE)로
//! 봉투의 끝을 정확히 알린다. 해석 실패는 ProtocolViolation이며
//! 연결은 닫힌다 - 반쯤 읽힌 채로 두지 않는다.

use std::path::{Component, Path};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 전송 완료 마커 (1바이트, 송신자 → 수신자)
pub const COMPLETION_MARKER: u8 = 0xC5;

/// 전송 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// 기본 연결 하나로 순차 전송
    Single,

    /// 임계값 이상 파일을 보조 연결들로 분할 전송
    Multi,
}

/// 파일 디스크립터 (매니페스트 항목)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// 상대 경로
    pub relative_path: String,

    /// 파일 크기 (바이트)
    pub size_bytes: u64,

    /// 내용 CRC32 체크섬 (디렉터리는 0)
    pub checksum: u32,

    /// 디렉터리 항목 여부
    pub is_dir: bool,
}

/// 전송 매니페스트
///
/// 송신자가 핸드쉐이크 전에 구성하며 전송 후 불변
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransferManifest {
    /// 파일 목록 (순서 고정)
    pub files: Vec<FileDescriptor>,
}

impl TransferManifest {
    /// 항목 수
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// 전송 대상 총 바이트 (디렉터리 제외)
    pub fn total_bytes(&self) -> u64 {
        self.files
            .iter()
            .filter(|f| !f.is_dir)
            .map(|f| f.size_bytes)
            .sum()
    }

    /// 실제 바이트가 흐르는 항목 (매니페스트 인덱스 포함)
    pub fn payload_files(&self) -> impl Iterator<Item = (usize, &FileDescriptor)> {
        self.files.iter().enumerate().filter(|(_, f)| !f.is_dir)
    }

    /// 수락 전 매니페스트 검증
    ///
    /// 빈 경로, 절대 경로, 상위 디렉터리 탈출, 중복 경로는 ProtocolViolation
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();

        for file in &self.files {
            if file.relative_path.is_empty() {
                return Err(Error::ProtocolViolation {
                    detail: "빈 경로 항목".into(),
                });
            }

            let path = Path::new(&file.relative_path);
            let escapes = path.components().any(|c| {
                matches!(
                    c,
                    Component::ParentDir | Component::RootDir | Component::Prefix(_)
                )
            });
            if escapes {
                return Err(Error::ProtocolViolation {
                    detail: format!("경로 탈출 시도: {}", file.relative_path),
                });
            }

            if !seen.insert(file.relative_path.as_str()) {
                return Err(Error::ProtocolViolation {
                    detail: format!("중복 경로: {}", file.relative_path),
                });
            }
        }

        Ok(())
    }
}

/// 핸드쉐이크 봉투
///
/// 모드/병렬도/임계값은 로컬 설정이 아니라 여기 실린 값이 세션의 합의값이다
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeEnvelope {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 송신자 표시 이름 (수락 판단용)
    pub sender_name: String,

    /// 전송 매니페스트
    pub manifest: TransferManifest,

    /// 전송 모드
    pub mode: TransferMode,

    /// 요청 병렬도 (>= 1)
    pub parallelism: u32,

    /// 멀티스트림 전환 기준 (바이트)
    pub multi_stream_threshold: u64,

    /// 워커당 최소 담당 범위 (바이트)
    pub min_chunk: u64,
}

impl HandshakeEnvelope {
    /// 새 봉투 생성
    pub fn new(
        sender_name: impl Into<String>,
        manifest: TransferManifest,
        mode: TransferMode,
        parallelism: u32,
        multi_stream_threshold: u64,
        min_chunk: u64,
    ) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            sender_name: sender_name.into(),
            manifest,
            mode,
            parallelism,
            multi_stream_threshold,
            min_chunk,
        }
    }

    /// 페이로드 바이트로 직렬화 (길이 프리픽스는 write_frame이 붙인다)
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// 프레임 페이로드에서 역직렬화
    pub fn from_payload(bytes: &[u8]) -> Result<Self> {
        let envelope: HandshakeEnvelope =
            bincode::deserialize(bytes).map_err(|e| Error::ProtocolViolation {
                detail: format!("봉투 해석 실패: {}", e),
            })?;

        if envelope.magic != MAGIC_NUMBER {
            return Err(Error::ProtocolViolation {
                detail: format!("매직 넘버 불일치: {:08X}", envelope.magic),
            });
        }
        if envelope.version != PROTOCOL_VERSION {
            return Err(Error::ProtocolViolation {
                detail: format!("버전 불일치: {}", envelope.version),
            });
        }
        if envelope.parallelism == 0 {
            return Err(Error::ProtocolViolation {
                detail: "병렬도 0".into(),
            });
        }

        Ok(envelope)
    }
}

/// 수락 응답 토큰 (수신자 → 송신자, 게이트 해소 후 1바이트)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyReply {
    /// 수락 - 워커 연결 준비 완료
    Ready,

    /// 거절
    Rejected,

    /// 결정 타임아웃으로 자동 거절
    Timeout,
}

impl ReadyReply {
    /// 토큰 바이트로 변환
    pub fn to_byte(self) -> u8 {
        match self {
            ReadyReply::Ready => 0x01,
            ReadyReply::Rejected => 0x02,
            ReadyReply::Timeout => 0x03,
        }
    }

    /// 토큰 바이트에서 변환
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(ReadyReply::Ready),
            0x02 => Ok(ReadyReply::Rejected),
            0x03 => Ok(ReadyReply::Timeout),
            other => Err(Error::ProtocolViolation {
                detail: format!("알 수 없는 응답 토큰: {:02X}", other),
            }),
        }
    }
}

/// 길이 프리픽스 프레임 읽기
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Bytes> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::ConnectionLost {
            detail: format!("프레임 길이 수신 실패: {}", e),
        })?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(Error::ProtocolViolation {
            detail: format!("프레임 크기 초과: {} > {}", len, max_len),
        });
    }

    let mut payload = BytesMut::zeroed(len);
    reader
        .read_exact(&mut payload[..])
        .await
        .map_err(|e| Error::ConnectionLost {
            detail: format!("프레임 본문 수신 실패: {}", e),
        })?;

    Ok(payload.freeze())
}

/// 길이 프리픽스 프레임 쓰기
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| Error::ConnectionLost {
            detail: format!("프레임 길이 전송 실패: {}", e),
        })?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| Error::ConnectionLost {
            detail: format!("프레임 본문 전송 실패: {}", e),
        })?;
    writer.flush().await.map_err(|e| Error::ConnectionLost {
        detail: format!("프레임 플러시 실패: {}", e),
    })?;
    Ok(())
}

/// 토큰 1바이트 읽기
pub async fn read_token<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    reader
        .read_exact(&mut byte)
        .await
        .map_err(|e| Error::ConnectionLost {
            detail: format!("토큰 수신 실패: {}", e),
        })?;
    Ok(byte[0])
}

/// 토큰 1바이트 쓰기
pub async fn write_token<W: AsyncWrite + Unpin>(writer: &mut W, token: u8) -> Result<()> {
    writer
        .write_all(&[token])
        .await
        .map_err(|e| Error::ConnectionLost {
            detail: format!("토큰 전송 실패: {}", e),
        })?;
    writer.flush().await.map_err(|e| Error::ConnectionLost {
        detail: format!("토큰 플러시 실패: {}", e),
    })?;
    Ok(())
}
