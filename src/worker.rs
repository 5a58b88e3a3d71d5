//! 청크 전송 워커
//!
//! 워커 하나 = 담당 범위 하나 = 연결 하나.
//! 버퍼 단위로 진행률을 보고하고 취소 플래그를 버퍼 단위로 확인한다.
//! 소켓 에러와 유휴 타임아웃은 ConnectionLost로 코디네이터에 올라가며,
//! 워커는 조용히 재시도하지 않는다 - 재시도 정책은 호출 계층의 몫이다.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::chunk::ChunkAssignment;
use crate::progress::ProgressAggregator;
use crate::{Error, Result};

/// 워커 공용 컨텍스트
#[derive(Clone)]
pub struct WorkerCtx {
    /// 세션 ID
    pub session_id: u64,

    /// 워커 ID (0 = 기본 연결 순차 스트림)
    pub worker_id: u32,

    /// 버퍼 크기 (바이트)
    pub buffer_size: usize,

    /// 소켓 유휴 타임아웃
    pub idle_timeout: Duration,

    /// 진행률 집계기
    pub progress: Arc<ProgressAggregator>,

    /// 세션 취소 플래그 (형제 워커 공유)
    pub cancel: Arc<AtomicBool>,
}

impl WorkerCtx {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// 송신측 워커: 보조 연결을 열고 담당 범위를 전송
pub async fn send_chunk(
    peer: SocketAddr,
    path: PathBuf,
    assign: ChunkAssignment,
    ctx: WorkerCtx,
) -> Result<()> {
    let mut stream = timeout(ctx.idle_timeout, TcpStream::connect(peer))
        .await
        .map_err(|_| Error::ConnectionLost {
            detail: format!("보조 연결 타임아웃: {}", peer),
        })?
        .map_err(|e| Error::ConnectionLost {
            detail: format!("보조 연결 실패 {}: {}", peer, e),
        })?;

    send_range(&mut stream, &path, assign, &ctx).await
}

/// 수신측 워커: 보조 포트에서 연결 하나를 받아 담당 범위에 기록
pub async fn recv_chunk(
    listener: TcpListener,
    path: PathBuf,
    assign: ChunkAssignment,
    ctx: WorkerCtx,
) -> Result<()> {
    let (mut stream, peer) = timeout(ctx.idle_timeout, listener.accept())
        .await
        .map_err(|_| Error::ConnectionLost {
            detail: format!("보조 연결 수락 타임아웃 (conn {})", assign.conn_index),
        })?
        .map_err(|e| Error::ConnectionLost {
            detail: format!("보조 연결 수락 실패 (conn {}): {}", assign.conn_index, e),
        })?;

    debug!("보조 연결 수락: {} (conn {})", peer, assign.conn_index);
    recv_range(&mut stream, &path, assign, &ctx).await
}

/// 열린 연결로 담당 범위 전송
pub async fn send_range(
    stream: &mut TcpStream,
    path: &Path,
    assign: ChunkAssignment,
    ctx: &WorkerCtx,
) -> Result<()> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(assign.offset)).await?;

    let label = format!(
        "file {} [{}..{})",
        assign.file_index,
        assign.offset,
        assign.offset + assign.length
    );
    push_bytes(stream, &mut file, assign.length, ctx, &label).await?;

    debug!(
        "워커 {} 전송 완료: {} ({} bytes)",
        ctx.worker_id, label, assign.length
    );
    Ok(())
}

/// 열린 연결에서 담당 범위 수신
///
/// 워커들이 각자 오프셋에 직접 쓰므로 물리적 기록 순서는 무관하다
pub async fn recv_range(
    stream: &mut TcpStream,
    path: &Path,
    assign: ChunkAssignment,
    ctx: &WorkerCtx,
) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(assign.offset)).await?;

    let label = format!(
        "file {} [{}..{})",
        assign.file_index,
        assign.offset,
        assign.offset + assign.length
    );
    pull_bytes(stream, &mut file, assign.length, ctx, &label).await?;
    file.flush().await?;

    debug!(
        "워커 {} 수신 완료: {} ({} bytes)",
        ctx.worker_id, label, assign.length
    );
    Ok(())
}

/// 기본 연결로 파일들을 매니페스트 순서대로 순차 전송 (워커 0)
pub async fn send_sequential(
    stream: &mut TcpStream,
    files: &[(PathBuf, u64)],
    ctx: &WorkerCtx,
) -> Result<()> {
    for (path, size) in files {
        if ctx.cancelled() {
            return Ok(());
        }

        let mut file = File::open(path).await?;
        let label = format!("{} [0..{})", path.display(), size);
        // 크기만큼 그대로 전송 - 수신자는 매니페스트로 경계를 안다
        push_bytes(stream, &mut file, *size, ctx, &label).await?;
    }
    Ok(())
}

/// 기본 연결에서 파일들을 매니페스트 순서대로 순차 수신 (워커 0)
pub async fn recv_sequential(
    stream: &mut TcpStream,
    files: &[(PathBuf, u64)],
    ctx: &WorkerCtx,
) -> Result<()> {
    for (path, size) in files {
        if ctx.cancelled() {
            return Ok(());
        }

        let mut file = File::create(path).await?;
        let label = format!("{} [0..{})", path.display(), size);
        pull_bytes(stream, &mut file, *size, ctx, &label).await?;
        file.flush().await?;
    }
    Ok(())
}

/// 파일 → 스트림 복사 (버퍼 단위 진행률/취소 확인)
async fn push_bytes(
    stream: &mut TcpStream,
    file: &mut File,
    length: u64,
    ctx: &WorkerCtx,
    label: &str,
) -> Result<()> {
    let mut buf = vec![0u8; ctx.buffer_size.max(1)];
    let mut remaining = length;

    while remaining > 0 {
        if ctx.cancelled() {
            debug!("워커 {} 취소 확인, 중단: {}", ctx.worker_id, label);
            return Ok(());
        }

        let want = remaining.min(buf.len() as u64) as usize;
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("파일 조기 EOF: {} (+{} bytes)", label, length - remaining),
            )));
        }

        timeout(ctx.idle_timeout, stream.write_all(&buf[..read]))
            .await
            .map_err(|_| Error::ConnectionLost {
                detail: format!("유휴 타임아웃: {} (+{} bytes)", label, length - remaining),
            })?
            .map_err(|e| Error::ConnectionLost {
                detail: format!("전송 실패: {} (+{} bytes): {}", label, length - remaining, e),
            })?;

        remaining -= read as u64;
        ctx.progress.update(ctx.session_id, ctx.worker_id, read as u64);
    }

    stream.flush().await.map_err(|e| Error::ConnectionLost {
        detail: format!("플러시 실패: {}: {}", label, e),
    })?;
    Ok(())
}

/// 스트림 → 파일 복사 (버퍼 단위 진행률/취소 확인)
async fn pull_bytes(
    stream: &mut TcpStream,
    file: &mut File,
    length: u64,
    ctx: &WorkerCtx,
    label: &str,
) -> Result<()> {
    let mut buf = vec![0u8; ctx.buffer_size.max(1)];
    let mut remaining = length;

    while remaining > 0 {
        if ctx.cancelled() {
            debug!("워커 {} 취소 확인, 중단: {}", ctx.worker_id, label);
            return Ok(());
        }

        let want = remaining.min(buf.len() as u64) as usize;
        let read = timeout(ctx.idle_timeout, stream.read(&mut buf[..want]))
            .await
            .map_err(|_| Error::ConnectionLost {
                detail: format!("유휴 타임아웃: {} (+{} bytes)", label, length - remaining),
            })?
            .map_err(|e| Error::ConnectionLost {
                detail: format!("수신 실패: {} (+{} bytes): {}", label, length - remaining, e),
            })?;

        if read == 0 {
            return Err(Error::ConnectionLost {
                detail: format!(
                    "상대가 연결을 닫음: {} (+{} bytes)",
                    label,
                    length - remaining
                ),
            });
        }

        file.write_all(&buf[..read]).await?;
        remaining -= read as u64;
        ctx.progress.update(ctx.session_id, ctx.worker_id, read as u64);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ctx(progress: Arc<ProgressAggregator>, cancel: Arc<AtomicBool>) -> WorkerCtx {
        WorkerCtx {
            session_id: 1,
            worker_id: 1,
            buffer_size: 4 * 1024,
            idle_timeout: Duration::from_secs(5),
            progress,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_range_transfer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");

        let data: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        // 수신 파일 사전 할당
        let dst_file = std::fs::File::create(&dst).unwrap();
        dst_file.set_len(data.len() as u64).unwrap();

        let assign = ChunkAssignment {
            file_index: 0,
            offset: 16 * 1024,
            length: 32 * 1024,
            conn_index: 0,
        };

        let progress = Arc::new(ProgressAggregator::new());
        progress.register(1, assign.length);
        let cancel = Arc::new(AtomicBool::new(false));

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let receiver = {
            let dst = dst.clone();
            let ctx = ctx(progress.clone(), cancel.clone());
            tokio::spawn(async move { recv_chunk(listener, dst, assign, ctx).await })
        };

        send_chunk(addr, src.clone(), assign, ctx(progress.clone(), cancel)).await.unwrap();
        receiver.await.unwrap().unwrap();

        // 담당 범위만 일치하면 된다 - 범위 밖은 사전 할당된 0
        let received = std::fs::read(&dst).unwrap();
        let start = assign.offset as usize;
        let end = start + assign.length as usize;
        assert_eq!(&received[start..end], &data[start..end]);

        // 송수신 워커가 같은 범위를 보고했으므로 합계는 2배
        let snapshot = progress.snapshot(1).unwrap();
        assert_eq!(snapshot.bytes_transferred, assign.length * 2);
    }

    #[tokio::test]
    async fn test_cancelled_worker_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, vec![0xABu8; 256 * 1024]).unwrap();

        let assign = ChunkAssignment {
            file_index: 0,
            offset: 0,
            length: 256 * 1024,
            conn_index: 0,
        };

        let progress = Arc::new(ProgressAggregator::new());
        progress.register(1, assign.length);
        let cancel = Arc::new(AtomicBool::new(true)); // 시작 전 취소

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepter = tokio::spawn(async move { listener.accept().await });

        // 취소된 워커는 에러 없이 즉시 반환하고 소켓을 닫는다
        send_chunk(addr, src, assign, ctx(progress.clone(), cancel)).await.unwrap();
        accepter.await.unwrap().unwrap();

        let snapshot = progress.snapshot(1).unwrap();
        assert_eq!(snapshot.bytes_transferred, 0);
    }
}
