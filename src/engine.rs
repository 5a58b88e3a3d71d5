//! 소비자 파사드
//!
//! 구성 요소들을 명시적 참조로 배선한다 - 공유 전역 객체는 없다.
//! UI/CLI 계층은 이 표면만 사용하며, 엔진은 표시 기술을 전혀 모른다.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::coordinator::{SendPolicy, SessionState, TransferCoordinator, TransferSession};
use crate::discovery::{DiscoveryService, PeerRecord};
use crate::gate::{AcceptPolicy, AcceptanceGate, Decision, TransferRequest};
use crate::listener::ConnectionListener;
use crate::progress::{ProgressAggregator, ProgressSnapshot};
use crate::{Config, Result};

/// 전송 엔진 파사드
pub struct Engine {
    config: Config,

    /// announce/핸드쉐이크에 실리는 표시 이름
    display_name: RwLock<String>,

    progress: Arc<ProgressAggregator>,
    coordinator: Arc<TransferCoordinator>,
    gate: Arc<AcceptanceGate>,

    /// 인바운드 요청 알림 수신기 (take_requests로 한 번만 가져간다)
    requests_rx: Mutex<Option<mpsc::Receiver<TransferRequest>>>,

    discovery: RwLock<Option<Arc<DiscoveryService>>>,
    listener: RwLock<Option<Arc<ConnectionListener>>>,
}

impl Engine {
    /// 새 엔진 생성 (아무것도 시작하지 않는다)
    pub fn new(config: Config) -> Self {
        let progress = Arc::new(ProgressAggregator::new());
        let coordinator = Arc::new(TransferCoordinator::new(config.clone(), progress.clone()));
        let (gate, requests_rx) = AcceptanceGate::new(config.decision_timeout());

        Self {
            config,
            display_name: RwLock::new("netshare".to_string()),
            progress,
            coordinator,
            gate: Arc::new(gate),
            requests_rx: Mutex::new(Some(requests_rx)),
            discovery: RwLock::new(None),
            listener: RwLock::new(None),
        }
    }

    /// 탐색 시작 (announce + 수신) - 이미 시작됐으면 무시
    pub async fn start_discovery(&self, display_name: &str, advertised_port: u16) -> Result<()> {
        *self.display_name.write() = display_name.to_string();

        if self.discovery.read().is_some() {
            return Ok(());
        }

        let service = Arc::new(DiscoveryService::new(
            self.config.clone(),
            display_name,
            advertised_port,
        ));
        service.start().await?;
        *self.discovery.write() = Some(service);
        Ok(())
    }

    /// 현재 알려진 피어 목록
    pub fn discover_peers(&self) -> Vec<PeerRecord> {
        self.discovery
            .read()
            .as_ref()
            .map(|d| d.snapshot_peers())
            .unwrap_or_default()
    }

    /// 수신 서비스 시작: 연결 리스너 + 탐색 announce
    pub async fn start_receiving(
        &self,
        port: u16,
        display_name: &str,
        policy: AcceptPolicy,
        save_dir: PathBuf,
    ) -> Result<()> {
        self.start_discovery(display_name, port).await?;

        if self.listener.read().is_some() {
            return Ok(());
        }

        let listener = Arc::new(ConnectionListener::new(
            self.config.clone(),
            self.coordinator.clone(),
            self.gate.clone(),
            policy,
            save_dir,
            self.discovery.read().clone(),
        ));

        let serve = listener.clone();
        tokio::spawn(async move {
            if let Err(e) = serve.serve(port).await {
                warn!("리스너 종료: {}", e);
            }
        });

        *self.listener.write() = Some(listener);
        Ok(())
    }

    /// 파일 송신 세션 시작, session_id 반환
    pub async fn send_files(
        &self,
        peer: SocketAddr,
        paths: Vec<PathBuf>,
        policy: SendPolicy,
    ) -> Result<u64> {
        let sender_name = self.display_name.read().clone();
        self.coordinator
            .start_send(peer, paths, sender_name, policy)
            .await
    }

    /// 세션 취소 요청
    pub fn cancel(&self, session_id: u64) -> Result<()> {
        self.coordinator.cancel(session_id)
    }

    /// 보류 중인 인바운드 요청에 결정 공급
    pub fn decide(&self, request_id: u64, decision: Decision) -> Result<()> {
        self.gate.decide(request_id, decision)
    }

    /// 인바운드 요청 알림 수신기 (한 번만 가져갈 수 있다)
    pub fn take_requests(&self) -> Option<mpsc::Receiver<TransferRequest>> {
        self.requests_rx.lock().take()
    }

    /// 진행률 스냅샷 (폴링)
    pub fn progress(&self, session_id: u64) -> Option<ProgressSnapshot> {
        self.progress.snapshot(session_id)
    }

    /// 진행률 구독: 주기 샘플링된 watch 스트림
    ///
    /// 세션이 종료되면 마지막 스냅샷을 남기고 샘플러가 멈춘다
    pub fn subscribe_progress(&self, session_id: u64) -> Option<watch::Receiver<ProgressSnapshot>> {
        let initial = self.progress.snapshot(session_id)?;
        let (tx, rx) = watch::channel(initial);

        let progress = self.progress.clone();
        let coordinator = self.coordinator.clone();
        let period = self.config.progress_interval();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;

                let Some(snapshot) = progress.snapshot(session_id) else {
                    break;
                };
                if tx.send(snapshot).is_err() {
                    // 구독자 전원 해제
                    break;
                }
                if coordinator
                    .session_state(session_id)
                    .map_or(true, |s| s.is_terminal())
                {
                    break;
                }
            }
        });

        Some(rx)
    }

    /// 세션 상태 조회
    pub fn session_state(&self, session_id: u64) -> Option<SessionState> {
        self.coordinator.session_state(session_id)
    }

    /// 세션 핸들 조회
    pub fn session(&self, session_id: u64) -> Option<Arc<TransferSession>> {
        self.coordinator.session(session_id)
    }

    /// 현재 등록된 세션 ID 목록
    pub fn session_ids(&self) -> Vec<u64> {
        self.coordinator.session_ids()
    }

    /// 비 Completed 종료 사유 조회
    pub fn end_reason(&self, session_id: u64) -> Option<String> {
        self.coordinator
            .session(session_id)
            .and_then(|s| s.end_reason())
    }

    /// 종료 상태 승인 - 세션/진행률 정리
    pub fn acknowledge(&self, session_id: u64) -> Result<()> {
        self.coordinator.acknowledge(session_id)
    }

    /// 탐색/리스너 정지 (진행 중 세션은 cancel()로 따로 끝낸다)
    pub fn stop(&self) {
        if let Some(discovery) = self.discovery.read().as_ref() {
            discovery.stop();
        }
        if let Some(listener) = self.listener.read().as_ref() {
            listener.stop();
        }
    }
}
