//! 에러 타입 정의

use thiserror::Error;

/// NetShare 엔진 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("비정상 탐색 데이터그램: {detail}")]
    MalformedDatagram { detail: String },

    #[error("프로토콜 위반: {detail}")]
    ProtocolViolation { detail: String },

    #[error("수락 결정 타임아웃: request_id={request_id}")]
    DecisionTimeout { request_id: u64 },

    #[error("연결 끊김: {detail}")]
    ConnectionLost { detail: String },

    #[error("체크섬 불일치: {path} expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch {
        path: String,
        expected: u32,
        got: u32,
    },

    #[error("알 수 없는 세션: session_id={session_id}")]
    SessionNotFound { session_id: u64 },

    #[error("알 수 없는 요청: request_id={request_id}")]
    UnknownRequest { request_id: u64 },

    #[error("세션이 아직 종료 상태가 아님: session_id={session_id}")]
    NotTerminal { session_id: u64 },

    #[error("채널 에러")]
    ChannelClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
