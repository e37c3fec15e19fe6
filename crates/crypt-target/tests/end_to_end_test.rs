//! The target driven over a simulated disk.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use common::{Bio, BioVec, BlockDevice, DeviceRegistry, IoError, SECTOR_SIZE};
use crypt_target::{CryptTarget, StatusType, TargetConfig};
use sim_blkdev::{start_registered, CompletionMode, SimDisk, SimDiskConfig};

const KEY: &str = "00112233445566778899aabbccddeeff";

fn disk(devices: &DeviceRegistry, capacity: u64, completion: CompletionMode) -> Arc<SimDisk> {
    start_registered(
        devices,
        SimDiskConfig {
            name: "sim0".into(),
            capacity_sectors: capacity,
            completion,
            ..SimDiskConfig::default()
        },
    )
    .unwrap()
}

fn config() -> TargetConfig {
    TargetConfig {
        workers: 2,
        io_pool_size: 8,
        page_pool_size: 16,
        alloc_timeout_ms: 500,
        congestion_backoff_ms: 0,
    }
}

fn pattern(sectors: usize, seed: u8) -> Vec<u8> {
    (0..sectors * SECTOR_SIZE)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn write(target: &CryptTarget, sector: u64, data: &[u8]) -> Result<(), IoError> {
    let bio = Bio::write(sector, vec![BioVec::from_vec(data.to_vec()).unwrap()]);
    target.map_and_wait(bio).1
}

fn read(target: &CryptTarget, sector: u64, sectors: usize) -> Result<Vec<u8>, IoError> {
    let bio = Bio::read(sector, vec![BioVec::zeroed(sectors * SECTOR_SIZE).unwrap()]);
    let (bio, status) = target.map_and_wait(bio);
    status.map(|_| bio.copy_out())
}

/// Passes bios to a [`SimDisk`], noting the target's outstanding control
/// blocks at every submit.
struct Recorder {
    disk: Arc<SimDisk>,
    target: OnceLock<Weak<CryptTarget>>,
    seen: Mutex<Vec<usize>>,
}

impl Recorder {
    fn seen(&self) -> Vec<usize> {
        std::mem::take(&mut *self.seen.lock().unwrap())
    }
}

impl BlockDevice for Recorder {
    fn name(&self) -> &str {
        "rec0"
    }

    fn capacity_sectors(&self) -> u64 {
        self.disk.capacity_sectors()
    }

    fn submit(&self, bio: Bio) {
        if let Some(target) = self.target.get().and_then(Weak::upgrade) {
            self.seen.lock().unwrap().push(target.pending_requests());
        }
        self.disk.submit(bio);
    }
}

#[test]
fn test_essiv_round_trip_on_1000_sector_disk() {
    let devices = DeviceRegistry::new();
    let recorder = Arc::new(Recorder {
        disk: Arc::new(SimDisk::memory("sim0", 1000).unwrap()),
        target: OnceLock::new(),
        seen: Mutex::new(Vec::new()),
    });
    devices.register(Arc::clone(&recorder) as Arc<dyn BlockDevice>);
    let target = Arc::new(
        CryptTarget::new(&["aes-cbc-essiv:sha256", KEY, "0", "rec0", "0"], &devices, config())
            .unwrap(),
    );
    recorder.target.set(Arc::downgrade(&target)).unwrap();

    let data = pattern(3, 1);
    write(&target, 10, &data).unwrap();
    assert_eq!(recorder.seen(), vec![1]);
    assert_eq!(target.pending_requests(), 0);

    assert_eq!(read(&target, 10, 3).unwrap(), data);
    assert_eq!(recorder.seen(), vec![1]);
    assert_eq!(target.pending_requests(), 0);

    let raw = recorder.disk.read_sectors(10, 3).unwrap();
    assert_ne!(raw, data, "disk must hold ciphertext");
}

#[test]
fn test_pending_requests_zero_once_caller_sees_completion() {
    let devices = DeviceRegistry::new();
    disk(&devices, 64, CompletionMode::Threaded);
    let target =
        CryptTarget::new(&["aes-cbc-plain", KEY, "0", "sim0", "0"], &devices, config()).unwrap();

    let data = pattern(1, 8);
    for i in 0..500u64 {
        write(&target, i % 64, &data).unwrap();
        assert_eq!(target.pending_requests(), 0, "after write {i}");
    }
    assert_eq!(read(&target, 5, 1).unwrap(), data);
    assert_eq!(target.pending_requests(), 0);
}

#[test]
fn test_threaded_completion_round_trip() {
    let devices = DeviceRegistry::new();
    disk(&devices, 256, CompletionMode::Threaded);
    let target =
        CryptTarget::new(&["aes-xts-plain", KEY.repeat(2).as_str(), "0", "sim0", "0"], &devices, config())
            .unwrap();

    for (i, sector) in [0u64, 7, 100, 255].into_iter().enumerate() {
        let data = pattern(1, i as u8);
        write(&target, sector, &data).unwrap();
        assert_eq!(read(&target, sector, 1).unwrap(), data);
    }
}

#[test]
fn test_start_and_iv_offset_placement() {
    let devices = DeviceRegistry::new();
    let disk = disk(&devices, 128, CompletionMode::Inline);
    let data = pattern(2, 9);

    let shifted =
        CryptTarget::new(&["aes-cbc-plain", KEY, "0", "sim0", "64"], &devices, config()).unwrap();
    write(&shifted, 0, &data).unwrap();
    assert_ne!(disk.read_sectors(64, 2).unwrap(), data);
    assert_eq!(read(&shifted, 0, 2).unwrap(), data);

    // Unshifted view: the IV sectors no longer line up.
    let plain_view =
        CryptTarget::new(&["aes-cbc-plain", KEY, "0", "sim0", "0"], &devices, config()).unwrap();
    assert_ne!(read(&plain_view, 64, 2).unwrap(), data);

    // An iv_offset of -64 (mod 2^64) lines them up again.
    let wrapped = (64u64).wrapping_neg().to_string();
    let realigned =
        CryptTarget::new(&["aes-cbc-plain", KEY, wrapped.as_str(), "sim0", "0"], &devices, config())
            .unwrap();
    assert_eq!(read(&realigned, 64, 2).unwrap(), data);

    assert!(CryptTarget::new(&["aes-cbc-plain", KEY, "-64", "sim0", "0"], &devices, config()).is_err());
}

#[test]
fn test_large_write_split_into_clones() {
    let devices = DeviceRegistry::new();
    let disk = disk(&devices, 512, CompletionMode::Threaded);
    let config = TargetConfig {
        page_pool_size: 2,
        ..config()
    };
    let target = CryptTarget::new(&["aes-cbc-benbi", KEY, "0", "sim0", "0"], &devices, config)
        .unwrap();

    // 64 sectors need 8 pages; the pool holds 2.
    let data = pattern(64, 3);
    write(&target, 32, &data).unwrap();
    assert!(disk.stats().writes >= 4);
    assert_eq!(read(&target, 32, 64).unwrap(), data);
    assert_eq!(target.pending_requests(), 0);
}

#[test]
fn test_slow_device_stalls_writes_instead_of_failing_them() {
    let devices = DeviceRegistry::new();
    start_registered(
        &devices,
        SimDiskConfig {
            name: "sim0".into(),
            capacity_sectors: 64,
            completion: CompletionMode::Threaded,
            simulated_latency_us: 100_000,
            ..SimDiskConfig::default()
        },
    )
    .unwrap();
    // The only clone page is held by the device well past alloc_timeout_ms.
    let target = Arc::new(
        CryptTarget::new(&["aes-cbc-plain", KEY, "0", "sim0", "0"], &devices, TargetConfig {
            workers: 3,
            page_pool_size: 1,
            alloc_timeout_ms: 10,
            ..config()
        })
        .unwrap(),
    );

    let writers: Vec<_> = (0..3u8)
        .map(|i| {
            let target = Arc::clone(&target);
            std::thread::spawn(move || write(&target, u64::from(i), &pattern(1, i)))
        })
        .collect();
    for writer in writers {
        writer.join().unwrap().unwrap();
    }

    for i in 0..3u8 {
        assert_eq!(read(&target, u64::from(i), 1).unwrap(), pattern(1, i));
    }
    assert_eq!(target.pending_requests(), 0);
}

#[test]
fn test_later_clone_failure_keeps_earlier_clone_and_completes_once() {
    let devices = DeviceRegistry::new();
    let disk = disk(&devices, 128, CompletionMode::Inline);
    let target = CryptTarget::new(&["aes-cbc-plain", KEY, "0", "sim0", "0"], &devices, TargetConfig {
        page_pool_size: 2,
        ..config()
    })
    .unwrap();

    // Two pages per clone: sectors 0..16, 16..32, 32..48, 48..64.
    disk.faults().fail_range(16..17);
    let data = pattern(64, 7);
    let (tx, rx) = std::sync::mpsc::channel();
    target.map(
        Bio::write(0, vec![BioVec::from_vec(data.clone()).unwrap()]).with_end_io(
            move |_, status| {
                let _ = tx.send(status);
            },
        ),
    );

    let status = rx.recv().unwrap();
    assert!(matches!(status, Err(IoError::Device { .. })), "{status:?}");
    assert!(rx.recv().is_err(), "request completed more than once");
    assert_eq!(target.pending_requests(), 0);
    let stats = disk.stats();
    assert_eq!((stats.writes, stats.errors), (3, 1));

    // The first clone landed before the failure and stays readable.
    disk.faults().clear();
    assert_ne!(disk.read_sectors(0, 16).unwrap(), &data[..16 * SECTOR_SIZE]);
    assert_eq!(read(&target, 0, 16).unwrap(), &data[..16 * SECTOR_SIZE]);
}

#[test]
fn test_fragmented_request() {
    let devices = DeviceRegistry::new();
    disk(&devices, 64, CompletionMode::Inline);
    let target =
        CryptTarget::new(&["aes-cbc-essiv:sha256", KEY, "0", "sim0", "0"], &devices, config())
            .unwrap();
    let data = pattern(4, 5);
    let segments = vec![
        BioVec::new(data[..SECTOR_SIZE].to_vec(), 0, SECTOR_SIZE).unwrap(),
        BioVec::new(data[SECTOR_SIZE..].to_vec(), 0, 3 * SECTOR_SIZE).unwrap(),
    ];
    target.map_and_wait(Bio::write(2, segments)).1.unwrap();

    let (bio, status) = target.map_and_wait(Bio::read(
        2,
        vec![
            BioVec::zeroed(2 * SECTOR_SIZE).unwrap(),
            BioVec::zeroed(2 * SECTOR_SIZE).unwrap(),
        ],
    ));
    status.unwrap();
    assert_eq!(bio.copy_out(), data);
}

#[test]
fn test_staged_segments_round_trip() {
    let devices = DeviceRegistry::new();
    disk(&devices, 64, CompletionMode::Threaded);
    let target =
        CryptTarget::new(&["aes-cbc-plain", KEY, "0", "sim0", "0"], &devices, config()).unwrap();

    let data = pattern(3, 4);
    let bio = Bio::write(5, vec![BioVec::from_vec(data.clone()).unwrap().staged()]);
    let (bio, status) = target.map_and_wait(bio);
    status.unwrap();
    assert!(bio.vecs()[0].is_staged());
    assert_eq!(bio.copy_out(), data);

    let bio = Bio::read(5, vec![BioVec::zeroed(3 * SECTOR_SIZE).unwrap().staged()]);
    let (bio, status) = target.map_and_wait(bio);
    status.unwrap();
    assert!(bio.vecs()[0].is_staged());
    assert_eq!(bio.copy_out(), data);
    assert_eq!(target.pending_requests(), 0);
}

#[test]
fn test_device_errors_reach_the_caller() {
    let devices = DeviceRegistry::new();
    let disk = disk(&devices, 64, CompletionMode::Inline);
    let target =
        CryptTarget::new(&["aes-cbc-plain", KEY, "0", "sim0", "0"], &devices, config()).unwrap();

    disk.faults().fail_range(20..22);
    let err = write(&target, 20, &pattern(1, 0)).unwrap_err();
    assert!(matches!(err, IoError::Device { .. }));
    let err = read(&target, 21, 1).unwrap_err();
    assert!(matches!(err, IoError::Device { .. }));

    disk.faults().clear();
    write(&target, 20, &pattern(1, 0)).unwrap();
    assert_eq!(target.pending_requests(), 0);
}

#[test]
fn test_out_of_range_rejected() {
    let devices = DeviceRegistry::new();
    disk(&devices, 64, CompletionMode::Inline);
    let target =
        CryptTarget::new(&["aes-cbc-plain", KEY, "0", "sim0", "60"], &devices, config()).unwrap();

    let err = write(&target, 2, &pattern(4, 0)).unwrap_err();
    assert!(matches!(err, IoError::OutOfRange { capacity: 4, .. }));
    write(&target, 0, &pattern(4, 0)).unwrap();
}

#[test]
fn test_no_key_requests_not_ready() {
    let devices = DeviceRegistry::new();
    disk(&devices, 64, CompletionMode::Inline);
    let target =
        CryptTarget::new(&["aes-cbc-essiv:sha256", "-", "0", "sim0", "0"], &devices, config())
            .unwrap();
    assert_eq!(
        target.status(StatusType::Table),
        "aes-cbc-essiv:sha256 - 0 sim0 0"
    );

    let err = write(&target, 0, &pattern(1, 0)).unwrap_err();
    assert!(matches!(err, IoError::NotReady(_)));
    assert!(target.preresume().is_err());

    target.postsuspend();
    target.message(&["key", "set", KEY]).unwrap();
    target.preresume().unwrap();
    target.resume();

    let data = pattern(1, 2);
    write(&target, 0, &data).unwrap();
    assert_eq!(read(&target, 0, 1).unwrap(), data);
}

#[test]
fn test_rekey_changes_plaintext_view() {
    let devices = DeviceRegistry::new();
    disk(&devices, 64, CompletionMode::Inline);
    let target =
        CryptTarget::new(&["aes-cbc-plain", KEY, "0", "sim0", "0"], &devices, config()).unwrap();
    let data = pattern(2, 6);
    write(&target, 8, &data).unwrap();

    target.postsuspend();
    target
        .message(&["key", "set", "ffeeddccbbaa99887766554433221100"])
        .unwrap();
    target.resume();
    assert_ne!(read(&target, 8, 2).unwrap(), data);

    target.postsuspend();
    target.message(&["key", "set", KEY]).unwrap();
    target.resume();
    assert_eq!(read(&target, 8, 2).unwrap(), data);
}

#[test]
fn test_concurrent_requests_all_complete() {
    let devices = DeviceRegistry::new();
    disk(&devices, 512, CompletionMode::Threaded);
    let target = Arc::new(
        CryptTarget::new(&["aes-cbc-essiv:sha256", KEY, "0", "sim0", "0"], &devices, TargetConfig {
            io_pool_size: 4,
            page_pool_size: 4,
            ..config()
        })
        .unwrap(),
    );

    let writers: Vec<_> = (0..8u8)
        .map(|i| {
            let target = Arc::clone(&target);
            std::thread::spawn(move || {
                let data = pattern(16, i);
                write(&target, u64::from(i) * 16, &data).unwrap();
                data
            })
        })
        .collect();
    let written: Vec<Vec<u8>> = writers.into_iter().map(|t| t.join().unwrap()).collect();

    for (i, data) in written.iter().enumerate() {
        assert_eq!(&read(&target, i as u64 * 16, 16).unwrap(), data);
    }
    assert_eq!(target.pending_requests(), 0);
}

#[test]
fn test_shutdown_waits_and_rejects_new_requests() {
    let devices = DeviceRegistry::new();
    start_registered(
        &devices,
        SimDiskConfig {
            name: "sim0".into(),
            capacity_sectors: 64,
            completion: CompletionMode::Threaded,
            simulated_latency_us: 2_000,
            ..SimDiskConfig::default()
        },
    )
    .unwrap();
    let target =
        CryptTarget::new(&["aes-cbc-plain", KEY, "0", "sim0", "0"], &devices, config()).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    for sector in 0..4u64 {
        let tx = tx.clone();
        let bio = Bio::write(sector, vec![BioVec::from_vec(pattern(1, 1)).unwrap()])
            .with_end_io(move |_, status| {
                let _ = tx.send(status);
            });
        target.map(bio);
    }
    drop(tx);

    target.shutdown();
    assert_eq!(target.pending_requests(), 0);
    let statuses: Vec<_> = rx.try_iter().collect();
    assert_eq!(statuses.len(), 4);
    assert!(statuses.iter().all(Result::is_ok));

    let err = write(&target, 0, &pattern(1, 0)).unwrap_err();
    assert!(matches!(err, IoError::NotReady(_)));
}
