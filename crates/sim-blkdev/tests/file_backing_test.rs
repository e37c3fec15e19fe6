//! File-backed disk persistence and completion behaviour.

use std::sync::mpsc;

use common::{Bio, BioVec, BlockDevice, IoStatus};
use sim_blkdev::{CompletionMode, SimDisk, SimDiskConfig};
use tracing_test::traced_test;

fn file_config(path: &std::path::Path, completion: CompletionMode) -> SimDiskConfig {
    SimDiskConfig {
        name: "file0".into(),
        capacity_sectors: 64,
        backing_path: path.to_string_lossy().to_string(),
        completion,
        simulated_latency_us: 0,
    }
}

fn run(disk: &SimDisk, bio: Bio) -> (Bio, IoStatus) {
    let (tx, rx) = mpsc::channel();
    disk.submit(bio.with_end_io(move |bio, status| {
        let _ = tx.send((bio, status));
    }));
    rx.recv().expect("bio completed")
}

#[test]
fn test_file_backing_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let payload = vec![0xa5u8; 2048];

    {
        let disk = SimDisk::new(file_config(&path, CompletionMode::Threaded)).unwrap();
        let (_, status) = run(&disk, Bio::write(8, vec![BioVec::from_vec(payload.clone()).unwrap()]));
        status.unwrap();
        disk.flush().unwrap();
    }

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 64 * 512);

    let disk = SimDisk::new(file_config(&path, CompletionMode::Inline)).unwrap();
    let (bio, status) = run(&disk, Bio::read(8, vec![BioVec::zeroed(2048).unwrap()]));
    status.unwrap();
    assert_eq!(bio.copy_out(), payload);

    println!("✅ File-backed disk persisted 4 sectors across reopen");
}

#[traced_test]
#[test]
fn test_range_fault_is_logged() {
    let dir = tempfile::tempdir().unwrap();
    let disk = SimDisk::new(file_config(&dir.path().join("faulty.img"), CompletionMode::Inline))
        .unwrap();
    disk.faults().fail_range(4..6);

    let (_, status) = run(&disk, Bio::write(5, vec![BioVec::zeroed(512).unwrap()]));
    assert!(status.is_err());
    assert!(logs_contain("bio failed"));
    assert_eq!(disk.stats().errors, 1);
}

#[test]
fn test_latency_is_applied() {
    let disk = SimDisk::new(SimDiskConfig {
        simulated_latency_us: 2_000,
        ..SimDiskConfig::default()
    })
    .unwrap();

    let started = std::time::Instant::now();
    let (_, status) = run(&disk, Bio::read(0, vec![BioVec::zeroed(512).unwrap()]));
    status.unwrap();
    assert!(started.elapsed() >= std::time::Duration::from_millis(2));
}
