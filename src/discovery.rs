//! 피어 탐색 서비스
//!
//! - 주기적 브로드캐스트 announce
//! - announce 수신으로 피어 테이블 갱신, 읽기 시점 lazy 프루닝
//!
//! 테이블은 내부에서만 잠그며 snapshot_peers()는 즉시 반환한다.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::presence::{PeerStatus, PresenceDatagram};
use crate::{Config, Result};

/// 알려진 피어 레코드
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// 표시 이름
    pub display_name: String,

    /// 전송 연결 주소 (발신지 IP + announce된 포트)
    pub addr: SocketAddr,

    /// 가용 상태 (표시용)
    pub status: PeerStatus,

    /// 마지막 announce 시각
    pub last_seen: Instant,
}

/// 탐색 서비스
pub struct DiscoveryService {
    config: Config,

    /// 자기 announce 필터용 토큰
    instance: u64,

    /// announce에 실리는 표시 이름
    display_name: String,

    /// announce에 실리는 전송 수신 포트
    listen_port: u16,

    /// announce에 실리는 가용 상태
    status: RwLock<PeerStatus>,

    /// 피어 테이블 (키 = 발신지 IP + announce된 포트)
    peers: RwLock<HashMap<SocketAddr, PeerRecord>>,

    /// 실행 중 플래그
    running: AtomicBool,

    /// announce 태스크 기동 여부
    announcing: AtomicBool,

    /// 수신 태스크 기동 여부
    listening: AtomicBool,
}

impl DiscoveryService {
    /// 새 탐색 서비스 생성
    pub fn new(config: Config, display_name: impl Into<String>, listen_port: u16) -> Self {
        Self {
            config,
            instance: rand::random(),
            display_name: display_name.into(),
            listen_port,
            status: RwLock::new(PeerStatus::Idle),
            peers: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            announcing: AtomicBool::new(false),
            listening: AtomicBool::new(false),
        }
    }

    /// announce + 수신 태스크 시작
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.start_announcing().await?;
        self.start_listening().await
    }

    /// 주기적 브로드캐스트 announce 시작
    ///
    /// 이미 실행 중이면 무시
    pub async fn start_announcing(self: &Arc<Self>) -> Result<()> {
        if self.announcing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let announce_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        announce_socket.set_broadcast(true)?;

        info!(
            "announce 시작: \"{}\" 포트 {}, 주기 {}ms",
            self.display_name, self.listen_port, self.config.discovery_interval_ms
        );

        let this = self.clone();
        tokio::spawn(async move {
            let broadcast_addr = SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                this.config.discovery_port,
            );

            while this.running.load(Ordering::SeqCst) {
                let datagram = PresenceDatagram::new(
                    this.instance,
                    this.display_name.clone(),
                    this.listen_port,
                    *this.status.read(),
                );

                if let Err(e) = announce_socket
                    .send_to(&datagram.to_bytes(), broadcast_addr)
                    .await
                {
                    warn!("announce 전송 실패: {}", e);
                }

                tokio::time::sleep(this.config.discovery_interval()).await;
            }
        });

        Ok(())
    }

    /// announce 수신 시작
    ///
    /// 이미 실행 중이면 무시
    pub async fn start_listening(self: &Arc<Self>) -> Result<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let listen_socket =
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.discovery_port)).await?;

        info!("탐색 수신 시작: 포트 {}", self.config.discovery_port);

        let this = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];

            while this.running.load(Ordering::SeqCst) {
                match tokio::time::timeout(
                    Duration::from_millis(500),
                    listen_socket.recv_from(&mut buf),
                )
                .await
                {
                    Ok(Ok((len, from))) => {
                        this.handle_datagram(&buf[..len], from);
                    }
                    Ok(Err(e)) => {
                        warn!("탐색 수신 에러: {}", e);
                    }
                    Err(_) => {
                        // 타임아웃 - running 재확인
                    }
                }
            }
        });

        Ok(())
    }

    /// 수신한 announce 처리
    ///
    /// 비정상 패킷은 버리고 계속 - 전송 세션으로 절대 전파되지 않는다
    fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let datagram = match PresenceDatagram::from_bytes(bytes) {
            Ok(d) => d,
            Err(e) => {
                debug!("비정상 데이터그램 무시 ({}): {}", from, e);
                return;
            }
        };

        // 자기 announce 필터
        if datagram.instance == self.instance {
            return;
        }

        let peer_addr = SocketAddr::new(from.ip(), datagram.listen_port);
        let record = PeerRecord {
            display_name: datagram.display_name,
            addr: peer_addr,
            status: datagram.status,
            last_seen: Instant::now(),
        };

        self.peers.write().insert(peer_addr, record);
    }

    /// 현재 피어 테이블 스냅샷
    ///
    /// 신선도 한계(announce 주기 2배)를 넘긴 항목은 여기서 정리된다
    pub fn snapshot_peers(&self) -> Vec<PeerRecord> {
        let ttl = self.config.peer_ttl();
        let mut peers = self.peers.write();
        peers.retain(|_, record| record.last_seen.elapsed() <= ttl);
        peers.values().cloned().collect()
    }

    /// announce에 실을 가용 상태 변경
    pub fn set_status(&self, status: PeerStatus) {
        *self.status.write() = status;
    }

    /// 정지
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.announcing.store(false, Ordering::SeqCst);
        self.listening.store(false, Ordering::SeqCst);
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 프로세스 식별 토큰
    pub fn instance(&self) -> u64 {
        self.instance
    }
}
