//! 탐색 데이터그램 코덱
//!
//! 순수 코덱 - I/O 없음, 바이트 픽스처로 단독 테스트 가능.
//! 해석 불가 패킷은 MalformedDatagram으로 버려지며 수신 루프를 멈추지 않는다.

use serde::{Deserialize, Serialize};

use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 피어 가용 상태
///
/// 표시용이다 - 수락 여부는 핸드쉐이크 이후 게이트가 결정한다
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// 대기 중
    Idle,

    /// 전송 진행 중
    Busy,
}

/// 탐색 announce 데이터그램
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceDatagram {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 프로세스 식별 토큰 (자기 announce 필터용)
    pub instance: u64,

    /// 표시 이름
    pub display_name: String,

    /// 전송 수신 포트 (TCP)
    pub listen_port: u16,

    /// 가용 상태
    pub status: PeerStatus,
}

impl PresenceDatagram {
    /// 새 데이터그램 생성
    pub fn new(
        instance: u64,
        display_name: impl Into<String>,
        listen_port: u16,
        status: PeerStatus,
    ) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            instance,
            display_name: display_name.into(),
            listen_port,
            status,
        }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// 바이트에서 역직렬화
    ///
    /// 잘린 패킷, 다른 매직, 다른 버전 모두 MalformedDatagram
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let datagram: PresenceDatagram =
            bincode::deserialize(bytes).map_err(|e| Error::MalformedDatagram {
                detail: e.to_string(),
            })?;

        if datagram.magic != MAGIC_NUMBER {
            return Err(Error::MalformedDatagram {
                detail: format!("매직 넘버 불일치: {:08X}", datagram.magic),
            });
        }
        if datagram.version != PROTOCOL_VERSION {
            return Err(Error::MalformedDatagram {
                detail: format!("버전 불일치: {}", datagram.version),
            });
        }

        Ok(datagram)
    }
}
