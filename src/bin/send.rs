//! NetShare 송신 CLI
//!
//! LAN 피어를 탐색하고 파일들을 전송한다
//!
//! 사용법:
//!   cargo run --release --bin netshare-send -- [OPTIONS] <FILE>...
//!
//! 예시:
//!   # 피어 목록만 출력
//!   cargo run --release --bin netshare-send -- --discover
//!
//!   # 지정한 피어로 전송
//!   cargo run --release --bin netshare-send -- --peer 192.168.0.10:12345 video.mkv
//!
//!   # 워커 8개 + 100MB 임계값
//!   cargo run --release --bin netshare-send -- -p 192.168.0.10:12345 --workers 8 --threshold 100 data.bin

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use netshare::{Config, Engine, SendPolicy, SessionState};

/// 송신 CLI 설정
struct SendArgs {
    peer: Option<SocketAddr>,
    name: String,
    files: Vec<PathBuf>,
    workers: Option<u32>,
    threshold_mb: Option<u64>,
    discover_only: bool,
}

impl Default for SendArgs {
    fn default() -> Self {
        Self {
            peer: None,
            name: hostname(),
            files: Vec::new(),
            workers: None,
            threshold_mb: None,
            discover_only: false,
        }
    }
}

/// 표시 이름 기본값 (호스트 이름, 실패 시 고정 문자열)
fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "netshare-sender".to_string())
}

fn parse_args() -> SendArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = SendArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--peer" | "-p" => {
                if i + 1 < args.len() {
                    parsed.peer = Some(args[i + 1].parse().expect("유효한 주소 필요"));
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    parsed.name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--workers" | "-w" => {
                if i + 1 < args.len() {
                    parsed.workers = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--threshold" | "-t" => {
                if i + 1 < args.len() {
                    parsed.threshold_mb = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--discover" | "-d" => {
                parsed.discover_only = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"NetShare 송신 CLI

사용법:
  netshare-send [OPTIONS] <FILE>...

옵션:
  --peer, -p <ADDR>    대상 피어 주소 (ip:port)
  --name, -n <NAME>    표시 이름
  --workers, -w <N>    병렬 워커 수 (기본: 4)
  --threshold, -t <MB> 멀티스트림 전환 크기 (기본: 200)
  --discover, -d       피어 목록만 출력하고 종료
  --help, -h           이 도움말
"#
                );
                std::process::exit(0);
            }
            other => {
                parsed.files.push(PathBuf::from(other));
            }
        }
        i += 1;
    }

    parsed
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args();
    let config = Config::default();
    let engine = Engine::new(config.clone());

    // 피어가 지정되지 않았으면 브로드캐스트 탐색
    let peer = match args.peer {
        Some(peer) if !args.discover_only => peer,
        _ => {
            engine.start_discovery(&args.name, 0).await?;
            info!("피어 탐색 중...");
            tokio::time::sleep(config.discovery_interval() * 2).await;

            let peers = engine.discover_peers();
            if peers.is_empty() {
                info!("발견된 피어 없음");
                return Ok(());
            }
            for peer in &peers {
                info!("  {} - {} ({:?})", peer.addr, peer.display_name, peer.status);
            }
            if args.discover_only {
                engine.stop();
                return Ok(());
            }
            peers[0].addr
        }
    };

    if args.files.is_empty() {
        info!("전송할 파일이 없습니다 (--help 참고)");
        return Ok(());
    }

    let mut policy = SendPolicy::from_config(&config);
    if let Some(workers) = args.workers {
        policy.parallelism = workers.max(1);
    }
    if let Some(mb) = args.threshold_mb {
        policy.multi_stream_threshold = mb * 1024 * 1024;
    }

    info!(
        "전송 시작: {} ({} files, 워커 {})",
        peer,
        args.files.len(),
        policy.parallelism
    );
    let session_id = engine.send_files(peer, args.files, policy).await?;

    // 진행률 출력 루프
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;

        if let Some(snapshot) = engine.progress(session_id) {
            info!(
                "진행: {}/{} bytes ({:.1}%) {:.2} MB/s",
                snapshot.bytes_transferred,
                snapshot.total_bytes,
                snapshot.ratio() * 100.0,
                snapshot.rate_bps / 1_000_000.0
            );
        }

        match engine.session_state(session_id) {
            Some(state) if state.is_terminal() => {
                match state {
                    SessionState::Completed => info!("전송 완료"),
                    other => info!(
                        "전송 종료: {:?} ({})",
                        other,
                        engine.end_reason(session_id).unwrap_or_default()
                    ),
                }
                break;
            }
            Some(_) => {}
            None => break,
        }
    }

    engine.acknowledge(session_id)?;
    engine.stop();
    Ok(())
}
