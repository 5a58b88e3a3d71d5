//! 전송 코디네이터
//!
//! 세션 하나의 전 과정을 직접 소유한다: 모드 결정, 연결 수립, 워커 감독,
//! 종료 상태 1회 보고. 전역 오케스트레이터는 없다 - 탐색과 진행률 집계는
//! 생성자에서 주입된 참조로만 엮인다.
//!
//! 워커 하나의 실패는 형제 워커 취소로 이어지고, 세션 실패는 정확히
//! 한 번만 기록된다. 코디네이터는 모든 워커의 종료를 확인한 뒤에야
//! 종료 상태로 전이한다 - 소켓이나 태스크가 세션보다 오래 살지 않는다.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::chunk::{plan_session_chunks, sequential_file_indices};
use crate::progress::ProgressAggregator;
use crate::session::{
    self, FileDescriptor, HandshakeEnvelope, ReadyReply, TransferManifest, TransferMode,
    COMPLETION_MARKER,
};
use crate::worker::{self, WorkerCtx};
use crate::{Config, Error, Result};

/// 전송 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// 송신
    Send,

    /// 수신
    Receive,
}

/// 세션 상태 머신
///
/// Negotiating → Ready → Transferring → Finalizing → Completed.
/// 비종료 상태 어디서든 Failed / Rejected / Cancelled로 빠질 수 있고,
/// 종료 상태에서는 다시 나오지 않는다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 핸드쉐이크 송수신, 수락/거절 대기
    Negotiating,

    /// 피어 수락, 워커 연결 준비 완료
    Ready,

    /// 워커 전송 중
    Transferring,

    /// 완료 마커/체크섬 검증 단계
    Finalizing,

    /// 전 파일 검증 통과
    Completed,

    /// 피어가 거절 (타임아웃 자동 거절 포함)
    Rejected,

    /// 소비자 취소
    Cancelled,

    /// 복구 불가 에러
    Failed,
}

impl SessionState {
    /// 종료 상태 여부
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Rejected
                | SessionState::Cancelled
                | SessionState::Failed
        )
    }
}

/// 송신 정책
///
/// 여기 담긴 값이 핸드쉐이크에 실려 세션의 합의값이 된다
#[derive(Debug, Clone, Copy)]
pub struct SendPolicy {
    /// 병렬도 (>= 1)
    pub parallelism: u32,

    /// 멀티스트림 전환 기준 (바이트)
    pub multi_stream_threshold: u64,

    /// 워커당 최소 담당 범위 (바이트)
    pub min_chunk: u64,
}

impl SendPolicy {
    /// 설정값으로 정책 구성
    pub fn from_config(config: &Config) -> Self {
        Self {
            parallelism: config.max_workers.max(1),
            multi_stream_threshold: config.multi_stream_threshold,
            min_chunk: config.min_parallel_chunk,
        }
    }
}

/// 세션 핸들
///
/// 코디네이터가 소유하며 소비자는 상태/사유 조회만 한다
pub struct TransferSession {
    /// 세션 ID (재사용되지 않는 랜덤 64비트)
    pub session_id: u64,

    /// 전송 방향
    pub direction: TransferDirection,

    /// 상대 주소
    pub peer: SocketAddr,

    /// 전송 매니페스트
    pub manifest: TransferManifest,

    /// 현재 상태
    state: RwLock<SessionState>,

    /// 비 Completed 종료 사유
    end_reason: RwLock<Option<String>>,

    /// 워커 정지 신호 (취소/실패/종료 시 설정, 형제 워커 공유)
    stop: Arc<AtomicBool>,

    /// 소비자 취소 의사 (정지 신호와 구분해 종료 상태를 가른다)
    cancel_requested: AtomicBool,
}

impl TransferSession {
    fn new(
        session_id: u64,
        direction: TransferDirection,
        peer: SocketAddr,
        manifest: TransferManifest,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            direction,
            peer,
            manifest,
            state: RwLock::new(SessionState::Negotiating),
            end_reason: RwLock::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            cancel_requested: AtomicBool::new(false),
        })
    }

    /// 현재 상태
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// 비 Completed 종료 사유
    pub fn end_reason(&self) -> Option<String> {
        self.end_reason.read().clone()
    }

    /// 소비자 취소 요청 여부
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// 상태 전이 (종료 상태에서는 불변)
    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.write();
        if state.is_terminal() {
            return false;
        }
        debug!("세션 {} 상태: {:?} → {:?}", self.session_id, *state, next);
        *state = next;
        true
    }

    /// 종료 상태 진입 (멱등 - 최초 1회만 기록)
    pub(crate) fn end(&self, terminal: SessionState, reason: impl Into<String>) -> bool {
        debug_assert!(terminal.is_terminal());
        let reason = reason.into();

        if !self.transition(terminal) {
            return false;
        }

        if terminal == SessionState::Completed {
            info!("세션 {} 완료", self.session_id);
        } else {
            warn!("세션 {} {:?}: {}", self.session_id, terminal, reason);
            *self.end_reason.write() = Some(reason);
        }
        // 남은 워커들 중단
        self.stop.store(true, Ordering::SeqCst);
        true
    }
}

/// 워커 종료 보고
struct WorkerOutcome {
    worker_id: u32,
    result: Result<()>,
}

/// 전송 코디네이터
pub struct TransferCoordinator {
    config: Config,
    progress: Arc<ProgressAggregator>,
    sessions: DashMap<u64, Arc<TransferSession>>,
}

impl TransferCoordinator {
    /// 새 코디네이터 생성
    pub fn new(config: Config, progress: Arc<ProgressAggregator>) -> Self {
        Self {
            config,
            progress,
            sessions: DashMap::new(),
        }
    }

    /// 세션 핸들 조회
    pub fn session(&self, session_id: u64) -> Option<Arc<TransferSession>> {
        self.sessions.get(&session_id).map(|s| Arc::clone(&s))
    }

    /// 세션 상태 조회
    pub fn session_state(&self, session_id: u64) -> Option<SessionState> {
        self.sessions.get(&session_id).map(|s| s.state())
    }

    /// 현재 등록된 세션 ID 목록
    pub fn session_ids(&self) -> Vec<u64> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// 세션 취소 요청
    ///
    /// 워커들은 현재 버퍼 단위를 마친 뒤 멈추고 연결을 닫는다.
    /// 코디네이터가 전원 종료를 확인한 뒤 Cancelled로 전이한다.
    pub fn cancel(&self, session_id: u64) -> Result<()> {
        let session = self
            .sessions
            .get(&session_id)
            .ok_or(Error::SessionNotFound { session_id })?;
        info!("세션 {} 취소 요청", session_id);
        session.cancel_requested.store(true, Ordering::SeqCst);
        session.stop.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// 종료 상태 승인 - 세션과 진행률 항목 제거
    pub fn acknowledge(&self, session_id: u64) -> Result<()> {
        let state = self
            .session_state(session_id)
            .ok_or(Error::SessionNotFound { session_id })?;
        if !state.is_terminal() {
            return Err(Error::NotTerminal { session_id });
        }

        self.sessions.remove(&session_id);
        self.progress.remove(session_id);
        Ok(())
    }

    // ── 송신측 ──

    /// 송신 세션 시작
    ///
    /// 매니페스트(크기 + CRC32)를 구성한 뒤 세션을 백그라운드로 진행한다.
    /// 반환된 session_id로 상태/진행률을 조회한다.
    pub async fn start_send(
        self: &Arc<Self>,
        peer: SocketAddr,
        paths: Vec<PathBuf>,
        sender_name: String,
        policy: SendPolicy,
    ) -> Result<u64> {
        let (manifest, sources) = build_manifest(&paths).await?;
        manifest.validate()?;

        let mode = select_mode(&manifest, policy.multi_stream_threshold);
        let session_id = rand::random();
        let session = TransferSession::new(session_id, TransferDirection::Send, peer, manifest);
        self.progress
            .register(session_id, session.manifest.total_bytes());
        self.sessions.insert(session_id, session.clone());

        info!(
            "송신 세션 {} 시작: {} ({} files, {} bytes, {:?})",
            session_id,
            peer,
            session.manifest.file_count(),
            session.manifest.total_bytes(),
            mode
        );

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this
                .run_send(session.clone(), sources, sender_name, mode, policy)
                .await
            {
                session.end(SessionState::Failed, e.to_string());
            }
        });

        Ok(session_id)
    }

    /// 송신 세션 진행
    async fn run_send(
        &self,
        session: Arc<TransferSession>,
        sources: Vec<PathBuf>,
        sender_name: String,
        mode: TransferMode,
        policy: SendPolicy,
    ) -> Result<()> {
        let peer = session.peer;

        // 기본 연결 수립 + 봉투 전송
        let mut stream = timeout(self.config.idle_timeout(), TcpStream::connect(peer))
            .await
            .map_err(|_| Error::ConnectionLost {
                detail: format!("연결 타임아웃: {}", peer),
            })?
            .map_err(|e| Error::ConnectionLost {
                detail: format!("연결 실패 {}: {}", peer, e),
            })?;

        let envelope = HandshakeEnvelope::new(
            sender_name,
            session.manifest.clone(),
            mode,
            policy.parallelism,
            policy.multi_stream_threshold,
            policy.min_chunk,
        );
        session::write_frame(&mut stream, &envelope.to_bytes()).await?;

        // 수락/거절 대기 - 사람 속도 이벤트라 취소에 즉시 반응해야 한다
        let reply = self.await_reply(&mut stream, &session).await?;
        if session.is_cancel_requested() {
            session.end(SessionState::Cancelled, "소비자 취소 (협상 중)");
            return Ok(());
        }
        match reply {
            ReadyReply::Ready => {}
            ReadyReply::Rejected => {
                session.end(SessionState::Rejected, "수신자가 거절");
                return Ok(());
            }
            ReadyReply::Timeout => {
                session.end(SessionState::Rejected, "수신자 결정 타임아웃");
                return Ok(());
            }
        }

        session.transition(SessionState::Ready);

        let assignments = match mode {
            TransferMode::Multi => plan_session_chunks(
                &session.manifest,
                policy.parallelism,
                policy.multi_stream_threshold,
                policy.min_chunk,
            ),
            TransferMode::Single => Vec::new(),
        };
        let sequential =
            sequential_file_indices(&session.manifest, mode, policy.multi_stream_threshold);

        session.transition(SessionState::Transferring);

        let (outcome_tx, mut outcome_rx) = mpsc::channel(assignments.len() + 1);

        // 보조 연결 워커들
        for assign in &assignments {
            let ctx = self.worker_ctx(&session, assign.conn_index + 1);
            let path = sources[assign.file_index as usize].clone();
            let aux = SocketAddr::new(peer.ip(), assign.aux_port(peer.port()));
            let assign = *assign;
            let tx = outcome_tx.clone();

            tokio::spawn(async move {
                let result = worker::send_chunk(aux, path, assign, ctx).await;
                let _ = tx
                    .send(WorkerOutcome {
                        worker_id: assign.conn_index + 1,
                        result,
                    })
                    .await;
            });
        }

        // 기본 연결 순차 전송 (이 태스크가 워커 0)
        let ctx = self.worker_ctx(&session, 0);
        let files: Vec<(PathBuf, u64)> = sequential
            .iter()
            .map(|&i| (sources[i].clone(), session.manifest.files[i].size_bytes))
            .collect();
        let result = worker::send_sequential(&mut stream, &files, &ctx).await;
        let _ = outcome_tx
            .send(WorkerOutcome {
                worker_id: 0,
                result,
            })
            .await;
        drop(outcome_tx);

        // 전원 종료 확인 후 종료 상태 결정 - 취소 의사가 종료 중의
        // 워커 에러(정리 소음)보다 우선한다
        let failure = drain_outcomes(&session, &mut outcome_rx).await;
        if session.is_cancel_requested() {
            session.end(SessionState::Cancelled, "소비자 취소");
            return Ok(());
        }
        if let Some(reason) = failure {
            session.end(SessionState::Failed, reason);
            return Ok(());
        }

        // 완료 마커 전송 - 수신자가 이걸 받고 체크섬 검증에 들어간다
        session.transition(SessionState::Finalizing);
        session::write_token(&mut stream, COMPLETION_MARKER).await?;

        session.end(SessionState::Completed, "");
        Ok(())
    }

    /// 수락 응답 대기
    ///
    /// 전체 한도는 결정 타임아웃 + 유휴 타임아웃이되, 짧은 조각으로
    /// 기다리며 취소 플래그에 즉시 반응한다
    async fn await_reply(
        &self,
        stream: &mut TcpStream,
        session: &TransferSession,
    ) -> Result<ReadyReply> {
        let deadline = tokio::time::Instant::now()
            + self.config.decision_timeout()
            + self.config.idle_timeout();
        let mut byte = [0u8; 1];

        loop {
            if session.is_cancel_requested() {
                // 호출측이 취소를 먼저 확인한다
                return Ok(ReadyReply::Rejected);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::ConnectionLost {
                    detail: "수락 응답 타임아웃".into(),
                });
            }

            match timeout(Duration::from_millis(200), stream.read_exact(&mut byte)).await {
                Ok(Ok(_)) => return ReadyReply::from_byte(byte[0]),
                Ok(Err(e)) => {
                    return Err(Error::ConnectionLost {
                        detail: format!("수락 응답 수신 실패: {}", e),
                    })
                }
                Err(_) => continue,
            }
        }
    }

    // ── 수신측 ──

    /// 수신 세션 등록 (리스너가 수락 결정 직후 호출)
    pub(crate) fn register_receive(
        &self,
        peer: SocketAddr,
        manifest: TransferManifest,
    ) -> Arc<TransferSession> {
        let session_id = rand::random();
        let session = TransferSession::new(session_id, TransferDirection::Receive, peer, manifest);
        self.progress
            .register(session_id, session.manifest.total_bytes());
        self.sessions.insert(session_id, session.clone());

        info!(
            "수신 세션 {} 시작: {} ({} files, {} bytes)",
            session_id,
            peer,
            session.manifest.file_count(),
            session.manifest.total_bytes()
        );
        session
    }

    /// 거절된 요청을 종료 세션으로 기록 (워커는 절대 생성되지 않는다)
    pub(crate) fn register_rejected(
        &self,
        peer: SocketAddr,
        manifest: TransferManifest,
        reason: &str,
    ) -> u64 {
        let session_id = rand::random();
        let session = TransferSession::new(session_id, TransferDirection::Receive, peer, manifest);
        session.end(SessionState::Rejected, reason);
        self.sessions.insert(session_id, session);
        session_id
    }

    /// 수신 세션 진행 (수락된 연결 위에서)
    ///
    /// 보조 리스너를 전부 바인딩한 뒤에야 Ready를 보낸다 - 송신 워커가
    /// 연결할 곳이 없는 경쟁을 막는다
    pub(crate) async fn drive_receive(
        &self,
        session: Arc<TransferSession>,
        mut stream: TcpStream,
        envelope: HandshakeEnvelope,
        save_dir: PathBuf,
        primary_port: u16,
    ) -> Result<()> {
        let manifest = &session.manifest;

        // 수신 경로 준비: 디렉터리 항목 + 상대 경로 부모
        fs::create_dir_all(&save_dir).await?;
        for file in &manifest.files {
            let target = save_dir.join(&file.relative_path);
            if file.is_dir {
                fs::create_dir_all(&target).await?;
            } else if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
        }

        // 분할 계획은 봉투의 합의값으로 계산한다 - 로컬 설정이 아니라
        let assignments = match envelope.mode {
            TransferMode::Multi => plan_session_chunks(
                manifest,
                envelope.parallelism,
                envelope.multi_stream_threshold,
                envelope.min_chunk,
            ),
            TransferMode::Single => Vec::new(),
        };
        let sequential =
            sequential_file_indices(manifest, envelope.mode, envelope.multi_stream_threshold);

        // 분할 대상 파일 사전 할당 - 워커들이 오프셋에 바로 쓴다
        let mut preallocated = HashSet::new();
        for assign in &assignments {
            if preallocated.insert(assign.file_index) {
                let file = &manifest.files[assign.file_index as usize];
                let target = save_dir.join(&file.relative_path);
                File::create(&target).await?.set_len(file.size_bytes).await?;
            }
        }

        // 보조 리스너 바인딩 (기본 포트 + 1 + conn_index)
        let mut listeners = Vec::with_capacity(assignments.len());
        for assign in &assignments {
            let port = assign.aux_port(primary_port);
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
            listeners.push(listener);
        }

        // 준비 완료 통지
        session::write_token(&mut stream, ReadyReply::Ready.to_byte()).await?;
        session.transition(SessionState::Ready);
        session.transition(SessionState::Transferring);

        let (outcome_tx, mut outcome_rx) = mpsc::channel(assignments.len() + 1);

        for (assign, listener) in assignments.iter().zip(listeners) {
            let ctx = self.worker_ctx(&session, assign.conn_index + 1);
            let path = save_dir.join(&manifest.files[assign.file_index as usize].relative_path);
            let assign = *assign;
            let tx = outcome_tx.clone();

            tokio::spawn(async move {
                let result = worker::recv_chunk(listener, path, assign, ctx).await;
                let _ = tx
                    .send(WorkerOutcome {
                        worker_id: assign.conn_index + 1,
                        result,
                    })
                    .await;
            });
        }

        // 기본 연결 순차 수신 (이 태스크가 워커 0)
        let ctx = self.worker_ctx(&session, 0);
        let files: Vec<(PathBuf, u64)> = sequential
            .iter()
            .map(|&i| {
                (
                    save_dir.join(&manifest.files[i].relative_path),
                    manifest.files[i].size_bytes,
                )
            })
            .collect();
        let result = worker::recv_sequential(&mut stream, &files, &ctx).await;
        let _ = outcome_tx
            .send(WorkerOutcome {
                worker_id: 0,
                result,
            })
            .await;
        drop(outcome_tx);

        let failure = drain_outcomes(&session, &mut outcome_rx).await;
        if session.is_cancel_requested() {
            session.end(SessionState::Cancelled, "소비자 취소");
            return Ok(());
        }
        if let Some(reason) = failure {
            session.end(SessionState::Failed, reason);
            return Ok(());
        }

        // 완료 마커 수신 후 체크섬 검증
        session.transition(SessionState::Finalizing);
        let token = timeout(self.config.idle_timeout(), session::read_token(&mut stream))
            .await
            .map_err(|_| Error::ConnectionLost {
                detail: "완료 마커 대기 타임아웃".into(),
            })??;
        if token != COMPLETION_MARKER {
            return Err(Error::ProtocolViolation {
                detail: format!("완료 마커 기대, {:02X} 수신", token),
            });
        }

        // 불일치는 하드 실패 - 부분 산출물은 사유와 함께 디스크에 남는다
        for (_, file) in manifest.payload_files() {
            let target = save_dir.join(&file.relative_path);
            let got = file_checksum(&target).await?;
            if got != file.checksum {
                return Err(Error::ChecksumMismatch {
                    path: file.relative_path.clone(),
                    expected: file.checksum,
                    got,
                });
            }
        }

        session.end(SessionState::Completed, "");
        Ok(())
    }

    /// 워커 컨텍스트 구성
    fn worker_ctx(&self, session: &TransferSession, worker_id: u32) -> WorkerCtx {
        WorkerCtx {
            session_id: session.session_id,
            worker_id,
            buffer_size: self.config.buffer_size,
            idle_timeout: self.config.idle_timeout(),
            progress: self.progress.clone(),
            cancel: session.stop.clone(),
        }
    }
}

/// 워커 결과 수거
///
/// 최초 실패가 형제 취소를 유발하며, 채널이 닫힐 때까지(전원 종료까지)
/// 기다린 뒤 최초 실패 사유만 반환한다 - 실패 보고는 세션당 1회
async fn drain_outcomes(
    session: &TransferSession,
    rx: &mut mpsc::Receiver<WorkerOutcome>,
) -> Option<String> {
    let mut first_failure = None;

    while let Some(outcome) = rx.recv().await {
        if let Err(e) = outcome.result {
            if first_failure.is_none() {
                first_failure = Some(format!("워커 {}: {}", outcome.worker_id, e));
                session.stop.store(true, Ordering::SeqCst);
            } else {
                debug!(
                    "세션 {} 워커 {} 후속 실패 무시: {}",
                    session.session_id, outcome.worker_id, e
                );
            }
        }
    }

    first_failure
}

/// 전송 모드 결정: 임계값 이상 파일이 하나라도 있으면 멀티스트림
fn select_mode(manifest: &TransferManifest, threshold: u64) -> TransferMode {
    let has_large = manifest
        .files
        .iter()
        .any(|f| !f.is_dir && f.size_bytes >= threshold);
    if has_large {
        TransferMode::Multi
    } else {
        TransferMode::Single
    }
}

/// 파일 내용 CRC32 계산 (스트리밍)
pub async fn file_checksum(path: &Path) -> Result<u32> {
    let mut file = File::open(path).await?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hasher.finalize())
}

/// 명시된 경로들로 매니페스트 구성
///
/// 경로 열거는 호출 계층의 몫이다 - 디렉터리는 항목으로만 실리고
/// 내용은 따라가지 않는다. 반환된 소스 목록은 매니페스트 인덱스와 정렬된다.
pub async fn build_manifest(paths: &[PathBuf]) -> Result<(TransferManifest, Vec<PathBuf>)> {
    let mut files = Vec::with_capacity(paths.len());
    let mut sources = Vec::with_capacity(paths.len());

    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("이름 없는 경로: {}", path.display()),
                ))
            })?
            .to_string();

        let meta = fs::metadata(path).await?;
        if meta.is_dir() {
            files.push(FileDescriptor {
                relative_path: name,
                size_bytes: 0,
                checksum: 0,
                is_dir: true,
            });
        } else {
            let checksum = file_checksum(path).await?;
            files.push(FileDescriptor {
                relative_path: name,
                size_bytes: meta.len(),
                checksum,
                is_dir: false,
            });
        }
        sources.push(path.clone());
    }

    Ok((TransferManifest { files }, sources))
}
