//! Sector cipher backends
//!
//! A [`CipherBackend`] transforms whole sectors in place given a per-sector
//! IV. The conversion engine only talks to this trait, so an accelerator can
//! be plugged in through a [`BackendFactory`] without touching the request
//! path. [`SoftwareCipher`] is the default implementation on top of the
//! RustCrypto block ciphers.
//!
//! ## Supported combinations
//!
//! | cipher     | block | key bytes                  | modes             |
//! |------------|-------|----------------------------|-------------------|
//! | `aes`      | 16    | 16, 24, 32 (xts: 32, 64)   | ecb, cbc, xts     |
//! | `des`      | 8     | 8                          | ecb, cbc          |
//! | `des3_ede` | 8     | 24                         | ecb, cbc          |

use std::fmt;
use std::sync::Arc;

use aes::{Aes128, Aes192, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{
    BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, BlockSizeUser,
    InnerIvInit, KeyInit,
};
use des::{Des, TdesEde3};
use tracing::debug;
use xts_mode::Xts128;

use crate::error::{EncryptionError, Result};
use crate::key::KeyMaterial;

const AES_KEY_SIZES: &[usize] = &[16, 24, 32];
const AES_XTS_KEY_SIZES: &[usize] = &[32, 64];
const DES_KEY_SIZES: &[usize] = &[8];
const DES3_KEY_SIZES: &[usize] = &[24];

/// Block chaining mode applied within one sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainMode {
    Ecb,
    Cbc,
    Xts,
}

impl ChainMode {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ecb" => Some(ChainMode::Ecb),
            "cbc" => Some(ChainMode::Cbc),
            "xts" => Some(ChainMode::Xts),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChainMode::Ecb => "ecb",
            ChainMode::Cbc => "cbc",
            ChainMode::Xts => "xts",
        }
    }
}

impl fmt::Display for ChainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static properties of a cipher/mode pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherInfo {
    pub block_size: usize,
    /// IV bytes consumed per sector; zero when the mode takes no IV.
    pub iv_size: usize,
    pub key_sizes: &'static [usize],
}

impl CipherInfo {
    pub fn accepts_key_len(&self, len: usize) -> bool {
        self.key_sizes.contains(&len)
    }
}

/// Block size and key sizes of a bare block cipher.
pub fn block_cipher_info(cipher: &str) -> Result<(usize, &'static [usize])> {
    match cipher {
        "aes" => Ok((16, AES_KEY_SIZES)),
        "des" => Ok((8, DES_KEY_SIZES)),
        "des3_ede" => Ok((8, DES3_KEY_SIZES)),
        other => Err(EncryptionError::UnsupportedCipher(other.to_string())),
    }
}

/// Properties of `cipher` chained with `mode`.
pub fn cipher_info(cipher: &str, mode: ChainMode) -> Result<CipherInfo> {
    let (block_size, key_sizes) = block_cipher_info(cipher)?;
    match (cipher, mode) {
        (_, ChainMode::Ecb) => Ok(CipherInfo {
            block_size,
            iv_size: 0,
            key_sizes,
        }),
        (_, ChainMode::Cbc) => Ok(CipherInfo {
            block_size,
            iv_size: block_size,
            key_sizes,
        }),
        ("aes", ChainMode::Xts) => Ok(CipherInfo {
            block_size,
            iv_size: 16,
            key_sizes: AES_XTS_KEY_SIZES,
        }),
        (cipher, mode) => Err(EncryptionError::UnsupportedChainMode {
            cipher: cipher.to_string(),
            mode: mode.to_string(),
        }),
    }
}

/// Pluggable sector transform.
///
/// `data` is always a whole number of cipher blocks and `iv` holds at least
/// [`CipherBackend::iv_size`] bytes. Implementations must be usable from many
/// worker threads at once.
pub trait CipherBackend: Send + Sync {
    fn cipher_name(&self) -> &str;

    fn chain_mode(&self) -> ChainMode;

    fn block_size(&self) -> usize;

    fn iv_size(&self) -> usize;

    fn encrypt(&self, data: &mut [u8], iv: &[u8]) -> Result<()>;

    fn decrypt(&self, data: &mut [u8], iv: &[u8]) -> Result<()>;
}

/// Builds keyed backends for a device.
pub trait BackendFactory: Send + Sync {
    /// Properties of the pair, without needing a key.
    fn info(&self, cipher: &str, mode: ChainMode) -> Result<CipherInfo> {
        cipher_info(cipher, mode)
    }

    fn create(
        &self,
        cipher: &str,
        mode: ChainMode,
        key: &KeyMaterial,
    ) -> Result<Arc<dyn CipherBackend>>;
}

/// Factory for [`SoftwareCipher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareBackendFactory;

impl BackendFactory for SoftwareBackendFactory {
    fn create(
        &self,
        cipher: &str,
        mode: ChainMode,
        key: &KeyMaterial,
    ) -> Result<Arc<dyn CipherBackend>> {
        Ok(Arc::new(SoftwareCipher::new(cipher, mode, key)?))
    }
}

/// A keyed single-block cipher, used directly for ECB and by ESSIV.
pub trait BlockPrimitive: Send + Sync {
    fn block_size(&self) -> usize;

    /// Encrypt one block; `block.len()` must equal [`Self::block_size`].
    fn encrypt_one(&self, block: &mut [u8]);

    fn decrypt_one(&self, block: &mut [u8]);
}

impl<C> BlockPrimitive for C
where
    C: BlockEncrypt + BlockDecrypt + Send + Sync,
{
    fn block_size(&self) -> usize {
        <C as BlockSizeUser>::block_size()
    }

    fn encrypt_one(&self, block: &mut [u8]) {
        BlockEncrypt::encrypt_block(self, GenericArray::from_mut_slice(block));
    }

    fn decrypt_one(&self, block: &mut [u8]) {
        BlockDecrypt::decrypt_block(self, GenericArray::from_mut_slice(block));
    }
}

fn check_key(cipher: &str, key_sizes: &[usize], key: &[u8]) -> Result<()> {
    if key_sizes.contains(&key.len()) {
        Ok(())
    } else {
        Err(EncryptionError::InvalidKeyLength {
            cipher: cipher.to_string(),
            expected: key_sizes.to_vec(),
            actual: key.len(),
        })
    }
}

/// Key a bare block cipher by name.
pub fn new_block_cipher(cipher: &str, key: &[u8]) -> Result<Box<dyn BlockPrimitive>> {
    let (_, key_sizes) = block_cipher_info(cipher)?;
    check_key(cipher, key_sizes, key)?;

    let primitive: Box<dyn BlockPrimitive> = match (cipher, key.len()) {
        ("aes", 16) => Box::new(Aes128::new_from_slice(key)?),
        ("aes", 24) => Box::new(Aes192::new_from_slice(key)?),
        ("aes", 32) => Box::new(Aes256::new_from_slice(key)?),
        ("des", _) => Box::new(Des::new_from_slice(key)?),
        ("des3_ede", _) => Box::new(TdesEde3::new_from_slice(key)?),
        (other, _) => return Err(EncryptionError::UnsupportedCipher(other.to_string())),
    };
    Ok(primitive)
}

/// Chaining applied to one sector worth of blocks.
trait SectorTransform: Send + Sync {
    fn encrypt(&self, data: &mut [u8], iv: &[u8]) -> Result<()>;
    fn decrypt(&self, data: &mut [u8], iv: &[u8]) -> Result<()>;
}

struct EcbMode(Box<dyn BlockPrimitive>);

impl SectorTransform for EcbMode {
    fn encrypt(&self, data: &mut [u8], _iv: &[u8]) -> Result<()> {
        let bs = self.0.block_size();
        data.chunks_exact_mut(bs).for_each(|block| self.0.encrypt_one(block));
        Ok(())
    }

    fn decrypt(&self, data: &mut [u8], _iv: &[u8]) -> Result<()> {
        let bs = self.0.block_size();
        data.chunks_exact_mut(bs).for_each(|block| self.0.decrypt_one(block));
        Ok(())
    }
}

struct CbcMode<C>(C);

impl<C> CbcMode<C>
where
    C: KeyInit,
{
    fn keyed(key: &[u8]) -> Result<Self> {
        Ok(Self(C::new_from_slice(key)?))
    }
}

impl<C> SectorTransform for CbcMode<C>
where
    C: BlockCipher + BlockEncrypt + BlockDecrypt + Clone + Send + Sync,
{
    fn encrypt(&self, data: &mut [u8], iv: &[u8]) -> Result<()> {
        let bs = <C as BlockSizeUser>::block_size();
        let mut chain = cbc::Encryptor::<C>::inner_iv_slice_init(self.0.clone(), &iv[..bs])?;
        for block in data.chunks_exact_mut(bs) {
            chain.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    fn decrypt(&self, data: &mut [u8], iv: &[u8]) -> Result<()> {
        let bs = <C as BlockSizeUser>::block_size();
        let mut chain = cbc::Decryptor::<C>::inner_iv_slice_init(self.0.clone(), &iv[..bs])?;
        for block in data.chunks_exact_mut(bs) {
            chain.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

/// XTS keys are two equal halves: data key then tweak key.
enum XtsMode {
    Aes128(Xts128<Aes128>),
    Aes256(Xts128<Aes256>),
}

impl XtsMode {
    fn keyed(key: &[u8]) -> Result<Self> {
        let (data_key, tweak_key) = key.split_at(key.len() / 2);
        match key.len() {
            32 => Ok(XtsMode::Aes128(Xts128::new(
                Aes128::new_from_slice(data_key)?,
                Aes128::new_from_slice(tweak_key)?,
            ))),
            64 => Ok(XtsMode::Aes256(Xts128::new(
                Aes256::new_from_slice(data_key)?,
                Aes256::new_from_slice(tweak_key)?,
            ))),
            actual => Err(EncryptionError::InvalidKeyLength {
                cipher: "aes-xts".into(),
                expected: AES_XTS_KEY_SIZES.to_vec(),
                actual,
            }),
        }
    }

    fn tweak(iv: &[u8]) -> [u8; 16] {
        let mut tweak = [0u8; 16];
        tweak.copy_from_slice(&iv[..16]);
        tweak
    }
}

impl SectorTransform for XtsMode {
    fn encrypt(&self, data: &mut [u8], iv: &[u8]) -> Result<()> {
        let tweak = Self::tweak(iv);
        match self {
            XtsMode::Aes128(xts) => xts.encrypt_sector(data, tweak),
            XtsMode::Aes256(xts) => xts.encrypt_sector(data, tweak),
        }
        Ok(())
    }

    fn decrypt(&self, data: &mut [u8], iv: &[u8]) -> Result<()> {
        let tweak = Self::tweak(iv);
        match self {
            XtsMode::Aes128(xts) => xts.decrypt_sector(data, tweak),
            XtsMode::Aes256(xts) => xts.decrypt_sector(data, tweak),
        }
        Ok(())
    }
}

fn cbc_for(cipher: &str, key: &[u8]) -> Result<Box<dyn SectorTransform>> {
    let transform: Box<dyn SectorTransform> = match (cipher, key.len()) {
        ("aes", 16) => Box::new(CbcMode::<Aes128>::keyed(key)?),
        ("aes", 24) => Box::new(CbcMode::<Aes192>::keyed(key)?),
        ("aes", 32) => Box::new(CbcMode::<Aes256>::keyed(key)?),
        ("des", _) => Box::new(CbcMode::<Des>::keyed(key)?),
        ("des3_ede", _) => Box::new(CbcMode::<TdesEde3>::keyed(key)?),
        (other, _) => return Err(EncryptionError::UnsupportedCipher(other.to_string())),
    };
    Ok(transform)
}

/// RustCrypto-backed [`CipherBackend`].
pub struct SoftwareCipher {
    cipher: String,
    mode: ChainMode,
    info: CipherInfo,
    transform: Box<dyn SectorTransform>,
}

impl SoftwareCipher {
    /// Key `cipher` in `mode`.
    ///
    /// # Errors
    /// Unknown cipher, unsupported mode for the cipher, or a key whose length
    /// the pair does not accept.
    pub fn new(cipher: &str, mode: ChainMode, key: &KeyMaterial) -> Result<Self> {
        let info = cipher_info(cipher, mode)?;
        check_key(cipher, info.key_sizes, key.as_bytes())?;

        let transform: Box<dyn SectorTransform> = match mode {
            ChainMode::Ecb => Box::new(EcbMode(new_block_cipher(cipher, key.as_bytes())?)),
            ChainMode::Cbc => cbc_for(cipher, key.as_bytes())?,
            ChainMode::Xts => Box::new(XtsMode::keyed(key.as_bytes())?),
        };

        debug!(cipher, mode = %mode, key_bits = key.len() * 8, "keyed software cipher");
        Ok(Self {
            cipher: cipher.to_string(),
            mode,
            info,
            transform,
        })
    }

    fn check(&self, data: &[u8], iv: &[u8]) -> Result<()> {
        let block_size = self.info.block_size;
        if data.is_empty() || data.len() % block_size != 0 {
            return Err(EncryptionError::InvalidDataLength {
                len: data.len(),
                block_size,
            });
        }
        if iv.len() < self.info.iv_size {
            return Err(EncryptionError::InvalidIvLength {
                expected: self.info.iv_size,
                actual: iv.len(),
            });
        }
        Ok(())
    }
}

impl CipherBackend for SoftwareCipher {
    fn cipher_name(&self) -> &str {
        &self.cipher
    }

    fn chain_mode(&self) -> ChainMode {
        self.mode
    }

    fn block_size(&self) -> usize {
        self.info.block_size
    }

    fn iv_size(&self) -> usize {
        self.info.iv_size
    }

    fn encrypt(&self, data: &mut [u8], iv: &[u8]) -> Result<()> {
        self.check(data, iv)?;
        self.transform.encrypt(data, iv)
    }

    fn decrypt(&self, data: &mut [u8], iv: &[u8]) -> Result<()> {
        self.check(data, iv)?;
        self.transform.decrypt(data, iv)
    }
}

impl fmt::Debug for SoftwareCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareCipher")
            .field("cipher", &self.cipher)
            .field("mode", &self.mode)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(len: usize) -> KeyMaterial {
        KeyMaterial::new((0..len as u8).collect())
    }

    #[test]
    fn test_cipher_info() {
        let info = cipher_info("aes", ChainMode::Cbc).unwrap();
        assert_eq!(info.block_size, 16);
        assert_eq!(info.iv_size, 16);
        assert!(info.accepts_key_len(24));

        assert_eq!(cipher_info("aes", ChainMode::Ecb).unwrap().iv_size, 0);
        assert_eq!(cipher_info("des", ChainMode::Cbc).unwrap().iv_size, 8);
        assert_eq!(
            cipher_info("aes", ChainMode::Xts).unwrap().key_sizes,
            &[32, 64]
        );
    }

    #[test]
    fn test_unsupported_pairs() {
        assert!(matches!(
            cipher_info("twofish", ChainMode::Cbc),
            Err(EncryptionError::UnsupportedCipher(_))
        ));
        assert!(matches!(
            cipher_info("des", ChainMode::Xts),
            Err(EncryptionError::UnsupportedChainMode { .. })
        ));
    }

    #[test]
    fn test_key_length_checked() {
        let err = SoftwareCipher::new("aes", ChainMode::Cbc, &key(10)).unwrap_err();
        assert!(matches!(err, EncryptionError::InvalidKeyLength { actual: 10, .. }));

        let err = SoftwareCipher::new("aes", ChainMode::Xts, &key(16)).unwrap_err();
        assert!(matches!(err, EncryptionError::InvalidKeyLength { actual: 16, .. }));
    }

    #[test]
    fn test_roundtrip_all_pairs() {
        let cases = [
            ("aes", ChainMode::Ecb, 16),
            ("aes", ChainMode::Cbc, 16),
            ("aes", ChainMode::Cbc, 24),
            ("aes", ChainMode::Cbc, 32),
            ("aes", ChainMode::Xts, 32),
            ("aes", ChainMode::Xts, 64),
            ("des", ChainMode::Ecb, 8),
            ("des", ChainMode::Cbc, 8),
            ("des3_ede", ChainMode::Cbc, 24),
        ];
        let plaintext: Vec<u8> = (0..512).map(|i| (i * 7 % 256) as u8).collect();
        let iv = [0x42u8; 16];

        for (name, mode, key_len) in cases {
            let backend = SoftwareCipher::new(name, mode, &key(key_len)).unwrap();
            let mut data = plaintext.clone();
            backend.encrypt(&mut data, &iv).unwrap();
            assert_ne!(data, plaintext, "{name}-{mode} left data unchanged");
            backend.decrypt(&mut data, &iv).unwrap();
            assert_eq!(data, plaintext, "{name}-{mode}/{key_len} round trip failed");
        }
    }

    #[test]
    fn test_cbc_iv_changes_ciphertext() {
        let backend = SoftwareCipher::new("aes", ChainMode::Cbc, &key(16)).unwrap();
        let mut a = vec![0u8; 512];
        let mut b = vec![0u8; 512];
        backend.encrypt(&mut a, &[1u8; 16]).unwrap();
        backend.encrypt(&mut b, &[2u8; 16]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_cbc_matches_known_vector() {
        // NIST SP 800-38A F.2.1, first block
        let key = KeyMaterial::from_hex("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let iv = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let mut block = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();

        let backend = SoftwareCipher::new("aes", ChainMode::Cbc, &key).unwrap();
        backend.encrypt(&mut block, &iv).unwrap();
        assert_eq!(hex::encode(&block), "7649abac8119b246cee98e9b12e9197d");
    }

    #[test]
    fn test_rejects_bad_lengths() {
        let backend = SoftwareCipher::new("aes", ChainMode::Cbc, &key(16)).unwrap();
        let mut data = vec![0u8; 20];
        assert!(matches!(
            backend.encrypt(&mut data, &[0u8; 16]),
            Err(EncryptionError::InvalidDataLength { len: 20, .. })
        ));

        let mut data = vec![0u8; 32];
        assert!(matches!(
            backend.encrypt(&mut data, &[0u8; 4]),
            Err(EncryptionError::InvalidIvLength { .. })
        ));
    }

    #[test]
    fn test_block_primitive() {
        let primitive = new_block_cipher("des3_ede", &[7u8; 24]).unwrap();
        assert_eq!(primitive.block_size(), 8);
        let mut block = [1u8; 8];
        primitive.encrypt_one(&mut block);
        assert_ne!(block, [1u8; 8]);
        primitive.decrypt_one(&mut block);
        assert_eq!(block, [1u8; 8]);

        assert!(new_block_cipher("aes", &[0u8; 20]).is_err());
    }

    #[test]
    fn test_factory_builds_backend() {
        let backend = SoftwareBackendFactory
            .create("aes", ChainMode::Xts, &key(64))
            .unwrap();
        assert_eq!(backend.cipher_name(), "aes");
        assert_eq!(backend.chain_mode(), ChainMode::Xts);
        assert_eq!(backend.iv_size(), 16);
    }
}
