//! Sector-wise conversion over fragmented buffer sets
//!
//! The request path hands the converter two segment lists: the caller's data
//! and the buffers of the clone being built. They rarely line up (a 4 KiB
//! caller page may feed a clone assembled from pool pages), so the context
//! keeps an independent cursor into each list and moves one sector at a time.
//! A write that needs several clones keeps the same context and resets only
//! the output cursor between clones, which keeps the IV sector counting on.

use std::sync::Arc;

use tracing::trace;

use crate::cipher::CipherBackend;
use crate::error::Result;
use crate::iv::{IvGenerator, MIN_IV_SIZE};
use common::{BioVec, Direction, Sector, SECTOR_SIZE};

/// Cursor state for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertContext {
    direction: Direction,
    sector: Sector,
    idx_in: usize,
    offset_in: usize,
    idx_out: usize,
    offset_out: usize,
}

impl ConvertContext {
    /// Start at logical `sector`; IVs are computed for `sector + iv_offset`.
    pub fn new(direction: Direction, sector: Sector, iv_offset: u64) -> Self {
        Self {
            direction,
            sector: sector.wrapping_add(iv_offset),
            idx_in: 0,
            offset_in: 0,
            idx_out: 0,
            offset_out: 0,
        }
    }

    /// Point the output cursor at the start of a fresh buffer set.
    pub fn reset_output(&mut self) {
        self.idx_out = 0;
        self.offset_out = 0;
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// IV sector of the next sector to convert.
    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn input_exhausted(&self, input: &[BioVec]) -> bool {
        self.idx_in >= input.len()
    }

    fn advance_in(&mut self, input: &[BioVec]) {
        self.offset_in += SECTOR_SIZE;
        if self.offset_in >= input[self.idx_in].len() {
            self.offset_in = 0;
            self.idx_in += 1;
        }
    }

    fn advance_out(&mut self, output: &[BioVec]) {
        self.offset_out += SECTOR_SIZE;
        if self.offset_out >= output[self.idx_out].len() {
            self.offset_out = 0;
            self.idx_out += 1;
        }
    }
}

/// Cipher backend paired with the device's IV generator.
///
/// `iv` is `None` when the chaining mode takes no IV.
pub struct Converter {
    backend: Arc<dyn CipherBackend>,
    iv: Option<IvGenerator>,
}

impl Converter {
    pub fn new(backend: Arc<dyn CipherBackend>, iv: Option<IvGenerator>) -> Self {
        Self { backend, iv }
    }

    pub fn backend(&self) -> &Arc<dyn CipherBackend> {
        &self.backend
    }

    pub fn iv_generator(&self) -> Option<&IvGenerator> {
        self.iv.as_ref()
    }

    fn iv_buffer(&self) -> Vec<u8> {
        let size = match &self.iv {
            Some(iv_gen) => iv_gen.iv_size(),
            None => self.backend.iv_size().max(MIN_IV_SIZE),
        };
        vec![0u8; size]
    }

    fn convert_sector(
        &self,
        direction: Direction,
        sector: Sector,
        data: &mut [u8],
        iv: &mut [u8],
    ) -> Result<()> {
        if let Some(iv_gen) = &self.iv {
            iv_gen.generate(sector, iv)?;
        }
        match direction {
            Direction::Write => self.backend.encrypt(data, iv),
            Direction::Read => self.backend.decrypt(data, iv),
        }
    }

    /// Convert from `input` into `output` until either side runs out.
    ///
    /// Returns the number of sectors converted by this call. On a backend
    /// error the sectors already written to `output` stay converted and the
    /// cursors point at the failing sector.
    pub fn convert(
        &self,
        ctx: &mut ConvertContext,
        input: &[BioVec],
        output: &mut [BioVec],
    ) -> Result<u64> {
        let mut iv = self.iv_buffer();
        let mut done = 0u64;

        while ctx.idx_in < input.len() && ctx.idx_out < output.len() {
            let src = &input[ctx.idx_in].as_slice()[ctx.offset_in..ctx.offset_in + SECTOR_SIZE];
            let dst = &mut output[ctx.idx_out].as_mut_slice()
                [ctx.offset_out..ctx.offset_out + SECTOR_SIZE];
            dst.copy_from_slice(src);

            self.convert_sector(ctx.direction, ctx.sector, dst, &mut iv)?;

            ctx.advance_in(input);
            ctx.advance_out(output);
            ctx.sector = ctx.sector.wrapping_add(1);
            done += 1;
        }

        trace!(direction = %ctx.direction, sectors = done, next = ctx.sector, "converted");
        Ok(done)
    }

    /// Convert `bufs` in place; input and output cursors move together.
    pub fn convert_in_place(&self, ctx: &mut ConvertContext, bufs: &mut [BioVec]) -> Result<u64> {
        let mut iv = self.iv_buffer();
        let mut done = 0u64;

        while ctx.idx_in < bufs.len() {
            let offset = ctx.offset_in;
            let data = &mut bufs[ctx.idx_in].as_mut_slice()[offset..offset + SECTOR_SIZE];
            self.convert_sector(ctx.direction, ctx.sector, data, &mut iv)?;

            ctx.advance_in(bufs);
            ctx.idx_out = ctx.idx_in;
            ctx.offset_out = ctx.offset_in;
            ctx.sector = ctx.sector.wrapping_add(1);
            done += 1;
        }

        trace!(direction = %ctx.direction, sectors = done, next = ctx.sector, "converted in place");
        Ok(done)
    }
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("cipher", &self.backend.cipher_name())
            .field("mode", &self.backend.chain_mode())
            .field("iv", &self.iv)
            .finish()
    }
}
