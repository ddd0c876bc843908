//! Blocking calls from plain threads into the async core.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{JAIL_ROOT, latency_memory, p, populated_memory};
use ufs_core::scheduler::{Scheduler, SchedulerConfig};
use ufs_core::{Jail, OpenMode, SyncBridge, Ufs, UfsError};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn call_after_shutdown_fails_fast() {
    let rt = runtime();
    let fs = rt.block_on(populated_memory());
    let scheduler = Scheduler::new(fs, SchedulerConfig::default());
    let bridge = SyncBridge::new(rt.handle().clone(), scheduler.caller());

    rt.block_on(scheduler.shutdown()).unwrap();

    let started = Instant::now();
    for _ in 0..100 {
        assert!(matches!(bridge.stat(&p("/")), Err(UfsError::CoreShutdown)));
    }
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn shutdown_releases_blocked_threads() {
    let rt = runtime();
    let fs = latency_memory();
    fs.script("/a", [Duration::from_millis(300)]);
    let scheduler = Scheduler::new(fs.clone(), SchedulerConfig::default());
    let bridge = Arc::new(SyncBridge::new(rt.handle().clone(), scheduler.caller()));

    let running = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || bridge.mkdir(&p("/a")))
    };
    rt.block_on(fs.wait_started(1));
    let queued = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || bridge.stat(&p("/a")))
    };
    // Give the second call time to be queued behind the first.
    while scheduler.stats().snapshot().submitted < 2 {
        thread::sleep(Duration::from_millis(5));
    }

    rt.block_on(scheduler.shutdown()).unwrap();

    assert!(running.join().unwrap().is_ok());
    assert!(matches!(queued.join().unwrap(), Err(UfsError::CoreShutdown)));
}

#[test]
fn bridge_timeout_applies() {
    let rt = runtime();
    let fs = latency_memory();
    fs.script("/", [Duration::from_secs(5)]);
    let scheduler = Scheduler::new(fs, SchedulerConfig::default());
    let bridge = SyncBridge::new(rt.handle().clone(), scheduler.caller())
        .with_timeout(Duration::from_millis(50));

    let started = Instant::now();
    assert!(matches!(bridge.list(&p("/")), Err(UfsError::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        bridge
            .stats()
            .operations_timed_out
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn threads_share_a_jailed_stack() {
    let rt = runtime();
    let memory = rt.block_on(populated_memory());
    let jail: Arc<dyn Ufs> = Arc::new(Jail::new(memory, p(JAIL_ROOT)));
    let scheduler = Scheduler::new(jail, SchedulerConfig::default());

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let bridge = SyncBridge::new(rt.handle().clone(), scheduler.caller());
            thread::spawn(move || {
                let path = p(&format!("{JAIL_ROOT}/t{t}"));
                let fh = bridge.open(&path, OpenMode::write()).unwrap();
                for i in 0..10u64 {
                    bridge
                        .write_at(fh, i, Bytes::from(vec![b'0' + t as u8]))
                        .unwrap();
                }
                bridge.close(fh).unwrap();
                assert_eq!(bridge.stat(&path).unwrap().size, 10);
                assert!(matches!(
                    bridge.stat(&p("/etc/passwd")),
                    Err(UfsError::PathEscape { .. })
                ));
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    rt.block_on(scheduler.shutdown()).unwrap();
}
