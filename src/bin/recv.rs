//! NetShare 수신 CLI
//!
//! 수신 서비스를 올리고 announce를 시작한다. 기본은 수동 수락 -
//! 요청이 오면 콘솔에서 y/n으로 결정한다.
//!
//! 사용법:
//!   cargo run --release --bin netshare-recv -- [OPTIONS]
//!
//! 예시:
//!   # 기본 포트에서 수동 수락
//!   cargo run --release --bin netshare-recv -- --dir ./received
//!
//!   # 자동 수락
//!   cargo run --release --bin netshare-recv -- --auto --dir ./received

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use netshare::{AcceptPolicy, Config, Decision, Engine, DEFAULT_TRANSFER_PORT};

/// 수신 CLI 설정
struct RecvArgs {
    port: u16,
    name: String,
    save_dir: PathBuf,
    auto_accept: bool,
}

impl Default for RecvArgs {
    fn default() -> Self {
        Self {
            port: DEFAULT_TRANSFER_PORT,
            name: std::env::var("HOSTNAME").unwrap_or_else(|_| "netshare-receiver".to_string()),
            save_dir: PathBuf::from("received"),
            auto_accept: false,
        }
    }
}

fn parse_args() -> RecvArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = RecvArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    parsed.port = args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    parsed.name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--dir" | "-d" => {
                if i + 1 < args.len() {
                    parsed.save_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--auto" | "-a" => {
                parsed.auto_accept = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"NetShare 수신 CLI

사용법:
  netshare-recv [OPTIONS]

옵션:
  --port, -p <PORT>  수신 포트 (기본: 12345)
  --name, -n <NAME>  표시 이름
  --dir, -d <DIR>    저장 경로 (기본: ./received)
  --auto, -a         전부 자동 수락
  --help, -h         이 도움말
"#
                );
                std::process::exit(0);
            }
            _ => {}
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
    let policy = if args.auto_accept {
        AcceptPolicy::AcceptAll
    } else {
        AcceptPolicy::Manual
    };

    let engine = Engine::new(Config::default());
    let mut requests = engine.take_requests().expect("요청 수신기는 한 번만");

    engine
        .start_receiving(args.port, &args.name, policy, args.save_dir.clone())
        .await?;
    info!(
        "수신 대기: 포트 {}, 저장 경로 {:?}, 정책 {:?}",
        args.port, args.save_dir, policy
    );

    // 수동 수락 루프: 요청을 출력하고 콘솔에서 결정을 읽는다
    let decide_loop = async {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();

        while let Some(request) = requests.recv().await {
            info!(
                "수신 요청 {}: {} ({}) - {} files, {} bytes. 수락? [y/N]",
                request.request_id,
                request.sender_name,
                request.peer,
                request.manifest.file_count(),
                request.manifest.total_bytes()
            );

            let decision = match stdin.next_line().await {
                Ok(Some(line)) if line.trim().eq_ignore_ascii_case("y") => Decision::Accept,
                _ => Decision::Reject,
            };

            // 타임아웃으로 이미 자동 거절됐을 수 있다
            if let Err(e) = engine.decide(request.request_id, decision) {
                warn!("결정 전달 실패: {}", e);
            }
        }
    };

    tokio::select! {
        _ = decide_loop => {}
        _ = tokio::signal::ctrl_c() => {
            info!("종료 신호 수신");
        }
    }

    engine.stop();
    Ok(())
}
