//! 수락 게이트
//!
//! 네트워크 태스크가 사람 속도의 결정을 기다리는 유일한 지점.
//! submit()은 해당 연결의 핸들러 태스크 하나만 세우고, 탐색과 다른
//! 연결은 계속 돈다. 결정이 제때 오지 않으면 자동 거절한다.
//! 결정의 출처(사람 UI든 자동 정책이든)는 게이트가 알 필요 없다.

use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::session::{TransferManifest, TransferMode};
use crate::{Error, Result};

/// 수락/거절 결정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// 수락
    Accept,

    /// 거절
    Reject,
}

/// 인바운드 요청 처리 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptPolicy {
    /// 소비자가 decide()로 직접 결정
    Manual,

    /// 전부 수락 (자동 수락 설정)
    AcceptAll,

    /// 전부 거절
    RejectAll,
}

/// 보류 중인 인바운드 전송 요청
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// 요청 ID
    pub request_id: u64,

    /// 송신자 주소
    pub peer: SocketAddr,

    /// 송신자 표시 이름
    pub sender_name: String,

    /// 제안된 매니페스트
    pub manifest: TransferManifest,

    /// 제안된 전송 모드
    pub mode: TransferMode,

    /// 제안된 병렬도
    pub parallelism: u32,
}

/// 수락 게이트
pub struct AcceptanceGate {
    /// 결정 대기 중인 요청들
    pending: DashMap<u64, oneshot::Sender<Decision>>,

    /// 소비자 알림 채널
    notify_tx: mpsc::Sender<TransferRequest>,

    /// 결정 타임아웃
    timeout: Duration,
}

impl AcceptanceGate {
    /// 게이트와 요청 알림 수신기 생성
    pub fn new(timeout: Duration) -> (Self, mpsc::Receiver<TransferRequest>) {
        let (notify_tx, notify_rx) = mpsc::channel(32);
        (
            Self {
                pending: DashMap::new(),
                notify_tx,
                timeout,
            },
            notify_rx,
        )
    }

    /// 요청 제출 후 결정까지 대기
    ///
    /// 호출한 핸들러 태스크만 멈춘다. 제한 시간 내 decide()가 없으면
    /// DecisionTimeout으로 자동 거절.
    pub async fn submit(&self, request: TransferRequest) -> Result<Decision> {
        let request_id = request.request_id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        // 알림 실패(소비자 부재/적체)는 타임아웃 경로로 흘러간다
        if let Err(e) = self.notify_tx.try_send(request) {
            warn!("요청 알림 전달 실패: {}", e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(_)) => {
                self.pending.remove(&request_id);
                Err(Error::ChannelClosed)
            }
            Err(_) => {
                self.pending.remove(&request_id);
                Err(Error::DecisionTimeout { request_id })
            }
        }
    }

    /// 보류 요청에 결정 공급 (요청당 정확히 한 번)
    ///
    /// 알 수 없는 ID나 이미 결정된 요청은 UnknownRequest
    pub fn decide(&self, request_id: u64, decision: Decision) -> Result<()> {
        let (_, tx) = self
            .pending
            .remove(&request_id)
            .ok_or(Error::UnknownRequest { request_id })?;
        tx.send(decision).map_err(|_| Error::ChannelClosed)?;
        debug!("요청 {} 결정: {:?}", request_id, decision);
        Ok(())
    }

    /// 결정 대기 중인 요청 수
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(id: u64) -> TransferRequest {
        TransferRequest {
            request_id: id,
            peer: "127.0.0.1:12345".parse().unwrap(),
            sender_name: "sender".into(),
            manifest: TransferManifest::default(),
            mode: TransferMode::Single,
            parallelism: 1,
        }
    }

    #[tokio::test]
    async fn test_submit_then_accept() {
        let (gate, mut rx) = AcceptanceGate::new(Duration::from_secs(5));
        let gate = Arc::new(gate);

        let submitter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.submit(request(1)).await })
        };

        // 소비자: 알림을 받고 결정 공급
        let notified = rx.recv().await.unwrap();
        assert_eq!(notified.request_id, 1);
        gate.decide(1, Decision::Accept).unwrap();

        assert_eq!(submitter.await.unwrap().unwrap(), Decision::Accept);
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_then_reject() {
        let (gate, mut rx) = AcceptanceGate::new(Duration::from_secs(5));
        let gate = Arc::new(gate);

        let submitter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.submit(request(2)).await })
        };

        rx.recv().await.unwrap();
        gate.decide(2, Decision::Reject).unwrap();
        assert_eq!(submitter.await.unwrap().unwrap(), Decision::Reject);
    }

    #[tokio::test]
    async fn test_timeout_auto_rejects() {
        let (gate, _rx) = AcceptanceGate::new(Duration::from_millis(50));

        let result = gate.submit(request(3)).await;
        assert!(matches!(
            result,
            Err(Error::DecisionTimeout { request_id: 3 })
        ));
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_decide_is_exactly_once() {
        let (gate, mut rx) = AcceptanceGate::new(Duration::from_secs(5));
        let gate = Arc::new(gate);

        let submitter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.submit(request(4)).await })
        };
        rx.recv().await.unwrap();

        gate.decide(4, Decision::Accept).unwrap();
        // 두 번째 결정과 미지의 ID는 거부된다
        assert!(matches!(
            gate.decide(4, Decision::Reject),
            Err(Error::UnknownRequest { .. })
        ));
        assert!(matches!(
            gate.decide(999, Decision::Accept),
            Err(Error::UnknownRequest { .. })
        ));

        submitter.await.unwrap().unwrap();
    }
}
