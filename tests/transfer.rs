//! 루프백 종단 간 전송 테스트
//!
//! 수신 엔진과 송신 엔진을 같은 프로세스에 올리고 127.0.0.1로 실제
//! 전송을 돌린다. 테스트마다 포트 대역을 분리해 병렬 실행과 보조
//! 포트(기본 + 1 + N)가 충돌하지 않게 한다.

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use netshare::{AcceptPolicy, Config, Decision, Engine, SendPolicy, SessionState};

/// 테스트용 설정 (탐색 포트는 테스트별로 분리)
fn test_config(discovery_port: u16) -> Config {
    Config {
        buffer_size: 64 * 1024,
        idle_timeout_ms: 5_000,
        discovery_interval_ms: 500,
        discovery_port,
        decision_timeout_ms: 5_000,
        ..Config::default()
    }
}

/// 패턴 데이터 생성 (경계 검증이 쉬운 줄 번호 포함 텍스트)
fn generate_test_data(size: usize) -> Vec<u8> {
    let patterns = [
        "The quick brown fox jumps over the lazy dog. ",
        "Lorem ipsum dolor sit amet, consectetur adipiscing elit. ",
        "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789 ",
    ];

    let mut data = Vec::with_capacity(size + 128);
    let mut line = 0u64;
    while data.len() < size {
        data.extend_from_slice(
            format!("[{:08}] {}\n", line, patterns[line as usize % patterns.len()]).as_bytes(),
        );
        line += 1;
    }
    data.truncate(size);
    data
}

/// 세션이 종료 상태에 도달할 때까지 폴링
async fn wait_terminal(engine: &Engine, session_id: u64, within: Duration) -> SessionState {
    let deadline = Instant::now() + within;
    loop {
        match engine.session_state(session_id) {
            Some(state) if state.is_terminal() => return state,
            Some(_) => {}
            None => panic!("세션 {} 이 사라짐", session_id),
        }
        assert!(Instant::now() < deadline, "세션 {} 종료 대기 초과", session_id);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// 수신 엔진에서 첫 세션이 등록될 때까지 폴링
async fn wait_first_session(engine: &Engine, within: Duration) -> u64 {
    let deadline = Instant::now() + within;
    loop {
        if let Some(&session_id) = engine.session_ids().first() {
            return session_id;
        }
        assert!(Instant::now() < deadline, "수신 세션 등록 대기 초과");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn checksum_of(path: &Path) -> u32 {
    crc32fast::hash(&std::fs::read(path).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_stream_small_file() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();

    let data = generate_test_data(512 * 1024);
    let src = send_dir.path().join("report.txt");
    std::fs::write(&src, &data).unwrap();

    let receiver = Engine::new(test_config(48801));
    receiver
        .start_receiving(47801, "recv-a", AcceptPolicy::AcceptAll, recv_dir.path().into())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let sender = Engine::new(test_config(48802));
    let peer: SocketAddr = "127.0.0.1:47801".parse().unwrap();

    // 기본 임계값 200MB - 512KB 파일은 단일 스트림
    let policy = SendPolicy::from_config(&test_config(0));
    let session_id = sender.send_files(peer, vec![src.clone()], policy).await.unwrap();

    assert_eq!(
        wait_terminal(&sender, session_id, Duration::from_secs(15)).await,
        SessionState::Completed
    );

    // 수신측도 체크섬 검증까지 통과해야 한다
    let recv_session = wait_first_session(&receiver, Duration::from_secs(5)).await;
    assert_eq!(
        wait_terminal(&receiver, recv_session, Duration::from_secs(15)).await,
        SessionState::Completed
    );

    let dst = recv_dir.path().join("report.txt");
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    assert_eq!(checksum_of(&dst), checksum_of(&src));

    sender.stop();
    receiver.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_stream_four_workers_reassembles() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();

    // 1MB 큰 파일 + 10KB 작은 파일 + 디렉터리 항목
    let big = generate_test_data(1024 * 1024);
    let small = generate_test_data(10 * 1024);
    let big_src = send_dir.path().join("big.bin");
    let small_src = send_dir.path().join("small.txt");
    let dir_src = send_dir.path().join("photos");
    std::fs::write(&big_src, &big).unwrap();
    std::fs::write(&small_src, &small).unwrap();
    std::fs::create_dir(&dir_src).unwrap();

    let receiver = Engine::new(test_config(48811));
    receiver
        .start_receiving(47811, "recv-b", AcceptPolicy::AcceptAll, recv_dir.path().into())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let sender = Engine::new(test_config(48812));
    let peer: SocketAddr = "127.0.0.1:47811".parse().unwrap();

    // 임계값 256KB, 워커당 최소 128KB, 병렬도 4
    // -> big.bin은 워커 4개(보조 포트 47812..47815), small.txt는 기본 연결
    let policy = SendPolicy {
        parallelism: 4,
        multi_stream_threshold: 256 * 1024,
        min_chunk: 128 * 1024,
    };
    let session_id = sender
        .send_files(peer, vec![small_src, big_src, dir_src], policy)
        .await
        .unwrap();

    assert_eq!(
        wait_terminal(&sender, session_id, Duration::from_secs(30)).await,
        SessionState::Completed
    );
    let recv_session = wait_first_session(&receiver, Duration::from_secs(5)).await;
    assert_eq!(
        wait_terminal(&receiver, recv_session, Duration::from_secs(30)).await,
        SessionState::Completed
    );

    // 바이트 단위 재조립 확인
    assert_eq!(std::fs::read(recv_dir.path().join("big.bin")).unwrap(), big);
    assert_eq!(std::fs::read(recv_dir.path().join("small.txt")).unwrap(), small);
    assert!(recv_dir.path().join("photos").is_dir());

    // 송신측 진행률 합계 = 전체 페이로드
    let snapshot = sender.progress(session_id).unwrap();
    assert_eq!(snapshot.bytes_transferred, (big.len() + small.len()) as u64);

    sender.stop();
    receiver.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_session_spawns_nothing() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();

    let src = send_dir.path().join("secret.bin");
    std::fs::write(&src, generate_test_data(64 * 1024)).unwrap();

    let receiver = Engine::new(test_config(48821));
    let mut requests = receiver.take_requests().unwrap();
    receiver
        .start_receiving(47821, "recv-c", AcceptPolicy::Manual, recv_dir.path().into())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let sender = Engine::new(test_config(48822));
    let peer: SocketAddr = "127.0.0.1:47821".parse().unwrap();
    let session_id = sender
        .send_files(peer, vec![src], SendPolicy::from_config(&test_config(0)))
        .await
        .unwrap();

    // 소비자가 거절
    let request = requests.recv().await.unwrap();
    assert_eq!(request.sender_name, "netshare");
    receiver.decide(request.request_id, Decision::Reject).unwrap();

    assert_eq!(
        wait_terminal(&sender, session_id, Duration::from_secs(10)).await,
        SessionState::Rejected
    );

    // 수신측: Rejected 세션 기록, 워커/파일 생성 없음
    let recv_session = wait_first_session(&receiver, Duration::from_secs(5)).await;
    assert_eq!(
        receiver.session_state(recv_session).unwrap(),
        SessionState::Rejected
    );
    assert_eq!(std::fs::read_dir(recv_dir.path()).unwrap().count(), 0);

    // 송신측 바이트도 전혀 흐르지 않았다
    assert_eq!(sender.progress(session_id).unwrap().bytes_transferred, 0);

    sender.stop();
    receiver.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn decision_timeout_auto_rejects() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();

    let src = send_dir.path().join("data.bin");
    std::fs::write(&src, generate_test_data(16 * 1024)).unwrap();

    // 결정 타임아웃 500ms, 아무도 decide하지 않는다
    let mut receiver_config = test_config(48831);
    receiver_config.decision_timeout_ms = 500;
    let receiver = Engine::new(receiver_config);
    receiver
        .start_receiving(47831, "recv-d", AcceptPolicy::Manual, recv_dir.path().into())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let sender = Engine::new(test_config(48832));
    let peer: SocketAddr = "127.0.0.1:47831".parse().unwrap();
    let session_id = sender
        .send_files(peer, vec![src], SendPolicy::from_config(&test_config(0)))
        .await
        .unwrap();

    assert_eq!(
        wait_terminal(&sender, session_id, Duration::from_secs(10)).await,
        SessionState::Rejected
    );
    assert!(sender
        .end_reason(session_id)
        .unwrap()
        .contains("타임아웃"));

    sender.stop();
    receiver.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_while_awaiting_decision() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();

    let src = send_dir.path().join("payload.bin");
    std::fs::write(&src, generate_test_data(256 * 1024)).unwrap();

    let receiver = Engine::new(test_config(48841));
    let mut requests = receiver.take_requests().unwrap();
    receiver
        .start_receiving(47841, "recv-e", AcceptPolicy::Manual, recv_dir.path().into())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let sender = Engine::new(test_config(48842));
    let peer: SocketAddr = "127.0.0.1:47841".parse().unwrap();
    let session_id = sender
        .send_files(peer, vec![src], SendPolicy::from_config(&test_config(0)))
        .await
        .unwrap();

    // 요청이 게이트에 걸린 시점 = 송신자는 응답 대기 중
    let request = requests.recv().await.unwrap();

    sender.cancel(session_id).unwrap();
    assert_eq!(
        wait_terminal(&sender, session_id, Duration::from_secs(10)).await,
        SessionState::Cancelled
    );
    assert!(sender.end_reason(session_id).unwrap().contains("취소"));

    // 워커가 생성되기 전이므로 바이트는 전혀 흐르지 않았다
    assert_eq!(sender.progress(session_id).unwrap().bytes_transferred, 0);

    // 뒤늦은 결정은 이미 닫힌 연결로 흘러가고 세션은 실패로 끝난다 - 송신측엔 영향 없음
    let _ = receiver.decide(request.request_id, Decision::Reject);

    sender.stop();
    receiver.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_mid_transfer_closes_worker_sockets() {
    use netshare::session::{read_frame, write_token};
    use netshare::{HandshakeEnvelope, ReadyReply, TransferMode};
    use tokio::io::AsyncReadExt;

    let send_dir = tempfile::tempdir().unwrap();
    let src = send_dir.path().join("stream.bin");
    let total = 8 * 1024 * 1024usize;
    std::fs::write(&src, generate_test_data(total)).unwrap();

    // 느린 가짜 수신자: 핸드쉐이크만 정상 처리하고 본문은 천천히 읽어
    // 세션을 Transferring에 묶어둔다
    let listener = tokio::net::TcpListener::bind("127.0.0.1:47861").await.unwrap();

    let sender = Engine::new(test_config(48861));
    let peer: SocketAddr = "127.0.0.1:47861".parse().unwrap();
    let session_id = sender
        .send_files(peer, vec![src], SendPolicy::from_config(&test_config(0)))
        .await
        .unwrap();

    let (mut stream, _) = listener.accept().await.unwrap();
    let payload = read_frame(&mut stream, 16 * 1024 * 1024).await.unwrap();
    let envelope = HandshakeEnvelope::from_payload(&payload).unwrap();
    assert_eq!(envelope.mode, TransferMode::Single);
    write_token(&mut stream, ReadyReply::Ready.to_byte()).await.unwrap();

    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        let mut received = 0u64;
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return received, // 송신측이 소켓을 닫았다
                Ok(n) => received += n as u64,
            }
        }
    });

    // 바이트가 흐르기 시작한 뒤(Transferring) 취소
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if sender
            .progress(session_id)
            .map_or(false, |s| s.bytes_transferred > 0)
        {
            break;
        }
        assert!(Instant::now() < deadline, "전송 시작 대기 초과");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        sender.session_state(session_id).unwrap(),
        SessionState::Transferring
    );
    sender.cancel(session_id).unwrap();

    // 워커가 현재 버퍼 단위를 마치고 멈춘 뒤에야 Cancelled로 전이한다
    assert_eq!(
        wait_terminal(&sender, session_id, Duration::from_secs(10)).await,
        SessionState::Cancelled
    );

    // 워커 소켓이 닫혔다 - 느린 수신측이 EOF를 본다
    let received = tokio::time::timeout(Duration::from_secs(10), reader)
        .await
        .unwrap()
        .unwrap();
    assert!(received < total as u64);

    sender.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checksum_mismatch_hard_fails_receiver() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();

    let original = generate_test_data(128 * 1024);
    let src = send_dir.path().join("tampered.bin");
    std::fs::write(&src, &original).unwrap();

    let receiver = Engine::new(test_config(48851));
    let mut requests = receiver.take_requests().unwrap();
    receiver
        .start_receiving(47851, "recv-f", AcceptPolicy::Manual, recv_dir.path().into())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let sender = Engine::new(test_config(48852));
    let peer: SocketAddr = "127.0.0.1:47851".parse().unwrap();
    let session_id = sender
        .send_files(peer, vec![src.clone()], SendPolicy::from_config(&test_config(0)))
        .await
        .unwrap();

    // 송신자가 응답을 기다리는 동안 파일을 바꿔치기한다 (크기는 동일)
    // - 매니페스트의 체크섬은 원본 기준이므로 수신 검증이 반드시 어긋난다
    let request = requests.recv().await.unwrap();
    let mut tampered = original.clone();
    tampered[0] ^= 0xFF;
    std::fs::write(&src, &tampered).unwrap();

    receiver.decide(request.request_id, Decision::Accept).unwrap();

    // 송신자는 바이트를 다 보냈으니 완료, 수신자는 검증에서 하드 실패
    assert_eq!(
        wait_terminal(&sender, session_id, Duration::from_secs(15)).await,
        SessionState::Completed
    );
    let recv_session = wait_first_session(&receiver, Duration::from_secs(5)).await;
    assert_eq!(
        wait_terminal(&receiver, recv_session, Duration::from_secs(15)).await,
        SessionState::Failed
    );
    assert!(receiver
        .end_reason(recv_session)
        .unwrap()
        .contains("체크섬 불일치"));

    // 부분 산출물은 삭제되지 않고 남는다 - 성공으로 위장하지 않을 뿐
    assert!(recv_dir.path().join("tampered.bin").exists());

    sender.stop();
    receiver.stop();
}
