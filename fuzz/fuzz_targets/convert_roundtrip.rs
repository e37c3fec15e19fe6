#![no_main]

use std::sync::Arc;

use common::{BioVec, Direction, SECTOR_SIZE};
use encryption::{
    cipher_info, ChainMode, ConvertContext, Converter, EssivDigest, IvGenerator, IvMode,
    KeyMaterial, SoftwareCipher,
};
use libfuzzer_sys::fuzz_target;

const KEY_SIZE: usize = 32;
const MODES: [IvMode; 4] = [
    IvMode::Plain,
    IvMode::Essiv(EssivDigest::Sha256),
    IvMode::Benbi,
    IvMode::Null,
];

fuzz_target!(|data: &[u8]| {
    if data.len() < KEY_SIZE + 10 + SECTOR_SIZE {
        return;
    }

    let key = KeyMaterial::new(data[..KEY_SIZE].to_vec());
    let mode = MODES[usize::from(data[KEY_SIZE]) % MODES.len()];
    let sector = u64::from_le_bytes(data[KEY_SIZE + 1..KEY_SIZE + 9].try_into().unwrap());
    let split = usize::from(data[KEY_SIZE + 9]);

    let payload = &data[KEY_SIZE + 10..];
    let sectors = payload.len() / SECTOR_SIZE;
    let plaintext = &payload[..sectors * SECTOR_SIZE];

    let info = cipher_info("aes", ChainMode::Cbc).unwrap();
    let backend = Arc::new(SoftwareCipher::new("aes", ChainMode::Cbc, &key).unwrap());
    let iv = IvGenerator::new(mode, "aes", &info, &key).unwrap();
    let converter = Converter::new(backend, Some(iv));

    // Input in two fragments, output in one.
    let cut = (split % sectors) * SECTOR_SIZE;
    let mut input = Vec::new();
    if cut > 0 {
        input.push(BioVec::from_vec(plaintext[..cut].to_vec()).unwrap());
    }
    input.push(BioVec::from_vec(plaintext[cut..].to_vec()).unwrap());
    let mut output = vec![BioVec::zeroed(plaintext.len()).unwrap()];

    let mut ctx = ConvertContext::new(Direction::Write, sector, 0);
    converter.convert(&mut ctx, &input, &mut output).unwrap();

    let mut ctx = ConvertContext::new(Direction::Read, sector, 0);
    converter.convert_in_place(&mut ctx, &mut output).unwrap();
    assert_eq!(output[0].as_slice(), plaintext);
});
