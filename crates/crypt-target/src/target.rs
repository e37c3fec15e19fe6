//! The logical device.
//!
//! [`CryptTarget`] owns everything one mapping needs: the parsed table, the
//! keyed converter, both pools, the crypt workers and the handle to the
//! underlying device. Requests enter through [`CryptTarget::map`]; the
//! control surface is [`CryptTarget::status`], [`CryptTarget::message`] and
//! the suspend/resume hooks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, instrument, warn};

use crate::buffer::{page_pool, PagePool};
use crate::config::TargetConfig;
use crate::error::{CryptError, Result};
use crate::io::{CryptIo, IoSlot};
use crate::kcryptd::{InFlight, Kcryptd, KcryptdHandle};
use crate::mempool::Mempool;
use crate::table::CryptTable;
use common::{Bio, BlockDevice, DeviceRegistry, IoError, IoStatus, Sector};
use encryption::{
    iv, BackendFactory, CipherInfo, Converter, IvGenerator, KeyMaterial, SoftwareBackendFactory,
};

/// What `map` did with a bio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapResult {
    /// The target took ownership and will complete the bio.
    Submitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    Info,
    Table,
}

/// State shared between the target and its in-flight requests.
pub(crate) struct TargetCore {
    name: String,
    pub(crate) table: RwLock<CryptTable>,
    pub(crate) info: CipherInfo,
    pub(crate) factory: Arc<dyn BackendFactory>,
    pub(crate) converter: RwLock<Option<Arc<Converter>>>,
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) start: Sector,
    pub(crate) iv_offset: u64,
    pub(crate) config: TargetConfig,
    /// Pages for write clones.
    pub(crate) page_pool: PagePool,
    /// Pages standing in for staged caller segments.
    pub(crate) staging_pool: PagePool,
    pub(crate) io_pool: Mempool<IoSlot>,
    /// Caller completions running after their control block was returned.
    pub(crate) completing: Arc<InFlight>,
    pub(crate) kcryptd: KcryptdHandle,
    /// Serialises clone page allocation across writers.
    pub(crate) alloc_lock: Mutex<()>,
}

impl TargetCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Usable size of the logical device.
    pub(crate) fn len_sectors(&self) -> Sector {
        self.device.capacity_sectors().saturating_sub(self.start)
    }

    fn table(&self) -> RwLockReadGuard<'_, CryptTable> {
        self.table.read().unwrap_or_else(|p| p.into_inner())
    }

    fn table_mut(&self) -> RwLockWriteGuard<'_, CryptTable> {
        self.table.write().unwrap_or_else(|p| p.into_inner())
    }

    fn converter(&self) -> Option<Arc<Converter>> {
        self.converter
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set_converter(&self, converter: Option<Arc<Converter>>) {
        *self.converter.write().unwrap_or_else(|p| p.into_inner()) = converter;
    }
}

/// Keyed backend plus IV generator for `table`, or `None` without a key.
fn build_converter(
    factory: &dyn BackendFactory,
    table: &CryptTable,
    info: &CipherInfo,
    key: &KeyMaterial,
) -> Result<Option<Arc<Converter>>> {
    if key.is_empty() {
        return Ok(None);
    }
    let spec = &table.spec;
    let backend = factory.create(&spec.cipher, spec.chain_mode, key)?;
    let iv = match &spec.iv {
        Some(iv) => Some(IvGenerator::new(iv.mode, &spec.cipher, info, key)?),
        None => None,
    };
    Ok(Some(Arc::new(Converter::new(backend, iv))))
}

/// A transparent encryption mapping over one underlying device.
pub struct CryptTarget {
    core: Arc<TargetCore>,
    kcryptd: Mutex<Kcryptd>,
    suspended: AtomicBool,
    shut_down: AtomicBool,
}

impl CryptTarget {
    /// Build a target from the five table arguments using the software
    /// cipher backends.
    pub fn new(args: &[&str], devices: &DeviceRegistry, config: TargetConfig) -> Result<Self> {
        Self::with_factory(args, devices, config, Arc::new(SoftwareBackendFactory))
    }

    /// Build a target whose cipher backends come from `factory`.
    ///
    /// On error nothing is left behind: the decoded key is zeroized when the
    /// partly built state is dropped.
    #[instrument(skip_all, fields(cipher = args.first().copied().unwrap_or_default()))]
    pub fn with_factory(
        args: &[&str],
        devices: &DeviceRegistry,
        config: TargetConfig,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let mut table = CryptTable::parse(args)?;

        let info = factory.info(&table.spec.cipher, table.spec.chain_mode)?;
        if !table.key.is_empty() && !info.accepts_key_len(table.key.len()) {
            return Err(encryption::EncryptionError::InvalidKeyLength {
                cipher: table.spec.to_string(),
                expected: info.key_sizes.to_vec(),
                actual: table.key.len(),
            }
            .into());
        }

        match &table.spec.iv {
            Some(_) if info.iv_size == 0 => {
                warn!(cipher = %table.spec, "Selected cipher does not support IVs");
                table.spec = table.spec.clone().without_iv();
            }
            Some(iv_spec) => iv::validate(iv_spec.mode, &table.spec.cipher, &info)?,
            None => {}
        }

        let device = devices
            .lookup(&table.device)
            .ok_or_else(|| CryptError::DeviceLookup(table.device.clone()))?;
        if table.start > device.capacity_sectors() {
            return Err(CryptError::config(format!(
                "start sector {} beyond end of {} ({} sectors)",
                table.start,
                table.device,
                device.capacity_sectors()
            )));
        }

        let converter = build_converter(factory.as_ref(), &table, &info, &table.key)?;
        let kcryptd = Kcryptd::new(config.workers)?;

        let next_id = AtomicU64::new(0);
        let io_pool = Mempool::new("io", config.io_pool_size, || {
            IoSlot::new(next_id.fetch_add(1, Ordering::Relaxed))
        });

        let name = format!("crypt({})", table.device);
        info!(
            target_name = %name,
            cipher = %table.spec,
            key_bytes = table.key.len(),
            iv_offset = table.iv_offset,
            start = table.start,
            workers = kcryptd.workers(),
            "crypt target created"
        );

        let core = TargetCore {
            name,
            start: table.start,
            iv_offset: table.iv_offset,
            table: RwLock::new(table),
            info,
            factory,
            converter: RwLock::new(converter),
            device,
            page_pool: page_pool(config.page_pool_size),
            staging_pool: page_pool(config.page_pool_size),
            io_pool,
            completing: Arc::new(InFlight::default()),
            kcryptd: kcryptd.handle(),
            alloc_lock: Mutex::new(()),
            config,
        };

        Ok(Self {
            core: Arc::new(core),
            kcryptd: Mutex::new(kcryptd),
            suspended: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Size of the logical device in sectors.
    pub fn len_sectors(&self) -> Sector {
        self.core.len_sectors()
    }

    pub fn config(&self) -> &TargetConfig {
        &self.core.config
    }

    /// Accept `bio`.
    ///
    /// Blocks while every control block is in use. The bio always completes
    /// through its own callback, possibly before this returns.
    pub fn map(&self, bio: Bio) -> MapResult {
        if self.shut_down.load(Ordering::Acquire) {
            bio.complete(Err(IoError::NotReady(format!("{} is shut down", self.name()))));
            return MapResult::Submitted;
        }

        let slot = self.core.io_pool.alloc();
        debug!(
            io = slot.id(),
            direction = %bio.direction(),
            sector = bio.sector(),
            sectors = bio.sectors(),
            "mapping request"
        );
        let io = Arc::new(CryptIo::new(
            Arc::clone(&self.core),
            self.core.converter(),
            bio,
            slot,
        ));
        self.core.kcryptd.queue(move || io.process());
        MapResult::Submitted
    }

    /// Map `bio` and block until it completes.
    ///
    /// Any end-io callback already installed on `bio` is replaced.
    pub fn map_and_wait(&self, bio: Bio) -> (Bio, IoStatus) {
        let (tx, rx) = mpsc::sync_channel(1);
        self.map(bio.with_end_io(move |bio, status| {
            let _ = tx.send((bio, status));
        }));
        match rx.recv() {
            Ok(done) => done,
            // The callback was dropped without running; only reachable on a
            // worker panic.
            Err(_) => (
                Bio::read(0, Vec::new()),
                Err(IoError::NotReady("request dropped".into())),
            ),
        }
    }

    /// Status line: empty for `Info`, the reconstructed table for `Table`.
    pub fn status(&self, kind: StatusType) -> String {
        match kind {
            StatusType::Info => String::new(),
            StatusType::Table => self.core.table().to_string(),
        }
    }

    /// Handle `key set <hex>` or `key wipe`.
    #[instrument(skip_all, fields(target_name = %self.name()))]
    pub fn message(&self, argv: &[&str]) -> Result<()> {
        let unrecognised = || CryptError::InvalidMessage(argv.first().copied().unwrap_or_default().to_string());
        if argv.len() < 2 || !argv[0].eq_ignore_ascii_case("key") {
            warn!("Unrecognised message received");
            return Err(unrecognised());
        }
        if !self.is_suspended() {
            warn!("not suspended during key manipulation");
            return Err(CryptError::NotSuspended);
        }

        match argv {
            [_, op, hex] if op.eq_ignore_ascii_case("set") => self.set_key(hex),
            [_, op] if op.eq_ignore_ascii_case("wipe") => {
                self.wipe_key();
                Ok(())
            }
            _ => {
                warn!("Unrecognised message received");
                Err(unrecognised())
            }
        }
    }

    fn set_key(&self, hex: &str) -> Result<()> {
        let key = KeyMaterial::from_hex(hex)?;
        let mut table = self.core.table_mut();
        if !table.key.is_empty() && table.key.len() != key.len() {
            return Err(CryptError::KeySizeMismatch {
                expected: table.key.len(),
                actual: key.len(),
            });
        }
        if !self.core.info.accepts_key_len(key.len()) {
            return Err(encryption::EncryptionError::InvalidKeyLength {
                cipher: table.spec.to_string(),
                expected: self.core.info.key_sizes.to_vec(),
                actual: key.len(),
            }
            .into());
        }

        let converter = build_converter(self.core.factory.as_ref(), &table, &self.core.info, &key)?;
        table.key = key;
        self.core.set_converter(converter);
        info!(key_bytes = table.key.len(), "crypt key set");
        Ok(())
    }

    fn wipe_key(&self) {
        self.core.table_mut().key.wipe();
        self.core.set_converter(None);
        info!("crypt key wiped");
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn postsuspend(&self) {
        self.suspended.store(true, Ordering::Release);
        debug!(target_name = %self.name(), "suspended");
    }

    /// Refuse to resume without a usable key.
    pub fn preresume(&self) -> Result<()> {
        if self.core.converter().is_none() {
            warn!(target_name = %self.name(), "Aborting resume - crypt key is not set.");
            return Err(CryptError::KeyNotSet);
        }
        Ok(())
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
        debug!(target_name = %self.name(), "resumed");
    }

    /// Control blocks on loan from the io pool.
    ///
    /// A request holds its control block from `map` until just before its
    /// bio completes, so this reads 0 once every caller has seen completion.
    pub fn pending_requests(&self) -> usize {
        self.core.io_pool.outstanding()
    }

    /// Wait for every accepted request, stop the workers and wipe the key.
    ///
    /// Bios mapped afterwards complete with [`IoError::NotReady`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.core.io_pool.wait_idle(None);
        self.core.completing.wait();
        self.kcryptd
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .shutdown();
        self.core.table_mut().key.wipe();
        self.core.set_converter(None);
        info!(target_name = %self.name(), "crypt target shut down");
    }
}

impl Drop for CryptTarget {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CryptTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptTarget")
            .field("name", &self.core.name)
            .field("table", &*self.core.table())
            .field("suspended", &self.is_suspended())
            .field("pending", &self.pending_requests())
            .finish()
    }
}
