use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use vatk_abi::{SyscallResult, VatDelivery, VatSyscall, WorkerCode, WorkerOptions};
use vatk_worker::{WorkerError, WorkerHandle};

const WORKER_BIN: &str = env!("CARGO_BIN_EXE_vatk-worker");

fn code() -> WorkerCode {
    WorkerCode {
        bundle_id: "b0-counter".into(),
        module_format: "nestedEvaluate".into(),
        source: r#"{"step": 2}"#.into(),
    }
}

async fn count_three_times(worker: &mut WorkerHandle) -> Vec<VatSyscall> {
    let mut syscalls = Vec::new();
    worker.evaluate(code()).await.unwrap();
    let start = VatDelivery::StartVat {
        vat_parameters: json!({"initial": 1}),
    };
    worker
        .deliver(&start, |sc| {
            syscalls.push(sc.clone());
            SyscallResult::ok()
        })
        .await
        .unwrap();
    for _ in 0..3 {
        let res = worker
            .deliver(&VatDelivery::message("o+0", "increment", json!([])), |sc| {
                syscalls.push(sc.clone());
                SyscallResult::ok()
            })
            .await
            .unwrap();
        assert!(res.is_ok());
        assert!(res.metering.is_some());
    }
    syscalls
}

fn last_count(syscalls: &[VatSyscall]) -> Option<&str> {
    syscalls.iter().rev().find_map(|sc| match sc {
        VatSyscall::VatstoreSet { key, value } if key == "count" => Some(value.as_str()),
        _ => None,
    })
}

#[tokio::test]
async fn subprocess_worker_speaks_the_protocol() {
    let mut worker = WorkerHandle::spawn(&WorkerOptions::Subprocess {
        program: WORKER_BIN.into(),
        args: vec!["--engine".into(), "counter".into()],
    })
    .await
    .unwrap();
    let syscalls = count_three_times(&mut worker).await;
    assert_eq!(last_count(&syscalls), Some("7"));
    worker.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn transports_agree_on_results() {
    let mut local = WorkerHandle::spawn(&WorkerOptions::local("counter"))
        .await
        .unwrap();
    let mut child = WorkerHandle::spawn(&WorkerOptions::Subprocess {
        program: WORKER_BIN.into(),
        args: vec![],
    })
    .await
    .unwrap();
    assert_eq!(
        count_three_times(&mut local).await,
        count_three_times(&mut child).await
    );
    assert_eq!(local.snapshot().await.unwrap(), child.snapshot().await.unwrap());
    local.shutdown(Duration::from_secs(1)).await;
    child.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn remote_worker_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("worker.sock");
    let mut server = tokio::process::Command::new(WORKER_BIN)
        .arg("--listen")
        .arg(&socket)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let mut waited = Duration::ZERO;
    while !socket.exists() {
        assert!(waited < Duration::from_secs(10), "worker socket never appeared");
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }

    let mut worker = WorkerHandle::spawn(&WorkerOptions::Remote {
        socket: socket.display().to_string(),
    })
    .await
    .unwrap();
    let syscalls = count_three_times(&mut worker).await;
    assert_eq!(last_count(&syscalls), Some("7"));
    worker.shutdown(Duration::from_secs(5)).await;

    server.kill().await.unwrap();
}

#[tokio::test]
async fn dead_subprocess_is_a_crash() {
    let mut worker = WorkerHandle::spawn(&WorkerOptions::Subprocess {
        program: "true".into(),
        args: vec![],
    })
    .await
    .unwrap();
    let err = worker.evaluate(code()).await.unwrap_err();
    assert!(err.is_crash(), "{err:?}");
}

#[tokio::test]
async fn missing_program_fails_to_spawn() {
    let err = WorkerHandle::spawn(&WorkerOptions::Subprocess {
        program: "/nonexistent/vatk-worker".into(),
        args: vec![],
    })
    .await
    .unwrap_err();
    assert!(matches!(err, WorkerError::Spawn(_)));
}
