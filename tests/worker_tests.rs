use sshkit::*;
use sshkit_core::mock::{loopback_stream, MockRemote};
use std::sync::Arc;
use std::time::Duration;

fn spawn_worker() -> (MockRemote, SessionWorker) {
    let remote = MockRemote::new();
    remote.add_user("ci", "pipeline");
    let mut config = SessionConfig::new("runner-07", "ci");
    config.password = Some("pipeline".into());
    let session = establish(
        Session::new(remote.connection()),
        loopback_stream().unwrap(),
        &config,
        None,
    )
    .unwrap();
    (remote, SessionWorker::spawn(session).unwrap())
}

#[tokio::test]
async fn test_concurrent_jobs_are_serialised() {
    let (remote, worker) = spawn_worker();
    let worker = Arc::new(worker);

    let mut handles = Vec::new();
    for i in 0..8u32 {
        let worker = worker.clone();
        handles.push(tokio::spawn(async move {
            worker
                .run(move |session| {
                    let sftp = session.open_sftp()?;
                    let mut file = sftp.open("/home/ci/order.log", "a")?;
                    file.write(format!("{}\n", i).as_bytes())?;
                    file.close()
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let log = String::from_utf8(remote.read_file("/home/ci/order.log").unwrap()).unwrap();
    assert_eq!(log.lines().count(), 8);

    let worker = Arc::try_unwrap(worker).unwrap();
    worker.shutdown().await.unwrap();
    assert_eq!(remote.open_subsystems(), 0);
}

#[tokio::test]
async fn test_push_through_worker() {
    let (remote, worker) = spawn_worker();
    let scratch = tempfile::tempdir().unwrap();
    let local = scratch.path().join("artifact.txt");
    std::fs::write(&local, b"build 42 ok\n").unwrap();

    let report = worker
        .run(move |session| {
            push(session, &local, "/home/ci/artifact.txt", &TransferOptions::default())
        })
        .await
        .unwrap();
    assert_eq!(report.bytes_transferred, 12);
    assert_eq!(remote.read_file("/home/ci/artifact.txt").unwrap(), b"build 42 ok\n");
    worker.shutdown().await.unwrap();
}

#[test]
fn test_deadline_met_from_blocking_context() {
    let (_remote, worker) = spawn_worker();
    let authenticated = tokio_test::block_on(
        worker.run_with_deadline(|session| Ok(session.authenticated()), Duration::from_secs(5)),
    )
    .unwrap();
    assert!(authenticated);
    assert!(!worker.is_aborted());
    tokio_test::block_on(worker.shutdown()).unwrap();
}
