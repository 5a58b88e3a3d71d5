//! 인바운드 연결 리스너
//!
//! 연결마다 독립 태스크로 처리한다 - 수락 결정 대기가 새 연결이나
//! 탐색을 막지 않는다. 봉투 해석 실패는 해당 연결만 닫는다.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::coordinator::{SessionState, TransferCoordinator};
use crate::discovery::DiscoveryService;
use crate::gate::{AcceptPolicy, AcceptanceGate, Decision, TransferRequest};
use crate::presence::PeerStatus;
use crate::session::{self, HandshakeEnvelope, ReadyReply};
use crate::{Config, Error, Result};

/// 연결 리스너
pub struct ConnectionListener {
    config: Config,
    coordinator: Arc<TransferCoordinator>,
    gate: Arc<AcceptanceGate>,
    policy: AcceptPolicy,

    /// 수신 파일 저장 경로
    save_dir: PathBuf,

    /// 수신 중 Busy 상태 announce용 (없으면 무시)
    discovery: Option<Arc<DiscoveryService>>,

    /// 실행 중 플래그
    running: AtomicBool,
}

impl ConnectionListener {
    /// 새 리스너 생성
    pub fn new(
        config: Config,
        coordinator: Arc<TransferCoordinator>,
        gate: Arc<AcceptanceGate>,
        policy: AcceptPolicy,
        save_dir: PathBuf,
        discovery: Option<Arc<DiscoveryService>>,
    ) -> Self {
        Self {
            config,
            coordinator,
            gate,
            policy,
            save_dir,
            discovery,
            running: AtomicBool::new(false),
        }
    }

    /// 수락 루프
    ///
    /// stop() 호출 시 다음 틱에 종료된다
    pub async fn serve(self: Arc<Self>, port: u16) -> Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        self.running.store(true, Ordering::SeqCst);
        info!("수신 대기 시작: 포트 {} ({:?})", port, self.policy);

        while self.running.load(Ordering::SeqCst) {
            match timeout(Duration::from_millis(500), listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    debug!("연결 수락: {}", peer);
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_connection(stream, peer, port).await;
                    });
                }
                Ok(Err(e)) => {
                    warn!("연결 수락 에러: {}", e);
                }
                Err(_) => {
                    // 타임아웃 - running 재확인
                }
            }
        }

        Ok(())
    }

    /// 정지
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 연결 하나 처리: 봉투 해석 → 정책/게이트 → 코디네이터 인계
    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr, primary_port: u16) {
        let envelope = match self.read_envelope(&mut stream).await {
            Ok(envelope) => envelope,
            Err(e) => {
                // 반쯤 읽힌 채로 두지 않는다 - 연결을 닫고 끝
                warn!("핸드쉐이크 실패 ({}): {}", peer, e);
                return;
            }
        };

        let request = TransferRequest {
            request_id: rand::random(),
            peer,
            sender_name: envelope.sender_name.clone(),
            manifest: envelope.manifest.clone(),
            mode: envelope.mode,
            parallelism: envelope.parallelism,
        };
        info!(
            "전송 요청 {}: {} ({}) - {} files, {} bytes",
            request.request_id,
            request.sender_name,
            peer,
            request.manifest.file_count(),
            request.manifest.total_bytes()
        );

        let decision = match self.policy {
            AcceptPolicy::AcceptAll => Ok(Decision::Accept),
            AcceptPolicy::RejectAll => Ok(Decision::Reject),
            AcceptPolicy::Manual => self.gate.submit(request.clone()).await,
        };

        match decision {
            Ok(Decision::Accept) => {
                if let Some(discovery) = &self.discovery {
                    discovery.set_status(PeerStatus::Busy);
                }

                let session = self
                    .coordinator
                    .register_receive(peer, envelope.manifest.clone());
                let result = self
                    .coordinator
                    .drive_receive(
                        session.clone(),
                        stream,
                        envelope,
                        self.save_dir.clone(),
                        primary_port,
                    )
                    .await;
                if let Err(e) = result {
                    session.end(SessionState::Failed, e.to_string());
                }

                if let Some(discovery) = &self.discovery {
                    discovery.set_status(PeerStatus::Idle);
                }
            }
            Ok(Decision::Reject) => {
                let _ = session::write_token(&mut stream, ReadyReply::Rejected.to_byte()).await;
                self.coordinator
                    .register_rejected(peer, envelope.manifest, "소비자가 거절");
                info!("요청 {} 거절", request.request_id);
            }
            Err(Error::DecisionTimeout { .. }) => {
                let _ = session::write_token(&mut stream, ReadyReply::Timeout.to_byte()).await;
                self.coordinator.register_rejected(
                    peer,
                    envelope.manifest,
                    "결정 타임아웃 - 자동 거절",
                );
                warn!("요청 {} 결정 타임아웃, 자동 거절", request.request_id);
            }
            Err(e) => {
                warn!("요청 {} 게이트 에러: {}", request.request_id, e);
            }
        }
    }

    /// 봉투 수신 + 해석 + 매니페스트 검증
    async fn read_envelope(&self, stream: &mut TcpStream) -> Result<HandshakeEnvelope> {
        let payload = timeout(
            self.config.idle_timeout(),
            session::read_frame(stream, self.config.handshake_max_bytes),
        )
        .await
        .map_err(|_| Error::ConnectionLost {
            detail: "핸드쉐이크 타임아웃".into(),
        })??;

        let envelope = HandshakeEnvelope::from_payload(&payload)?;
        envelope.manifest.validate()?;
        Ok(envelope)
    }
}
