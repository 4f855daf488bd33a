//! Garbage-collection ceilings.
//!
//! Each flavor has a global ceiling (freed bytes across every pool of that
//! flavor) and a per-pool ceiling. Crossing either after a free sweeps the
//! offending pool or the whole flavor.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The four free-list flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Flavor {
    Regular,
    Array,
    Block,
    Factory,
}

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Byte ceilings for every flavor. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreeListLimits {
    pub reg_global: Option<usize>,
    pub reg_list: Option<usize>,
    pub arr_global: Option<usize>,
    pub arr_list: Option<usize>,
    pub blk_global: Option<usize>,
    pub blk_list: Option<usize>,
    pub fac_global: Option<usize>,
    pub fac_list: Option<usize>,
}

impl Default for FreeListLimits {
    fn default() -> Self {
        Self {
            reg_global: Some(MIB),
            reg_list: Some(64 * KIB),
            arr_global: Some(4 * MIB),
            arr_list: Some(256 * KIB),
            blk_global: Some(16 * MIB),
            blk_list: Some(MIB),
            fac_global: Some(16 * MIB),
            fac_list: Some(MIB),
        }
    }
}

fn from_raw(value: i64) -> Option<usize> {
    usize::try_from(value).ok()
}

impl FreeListLimits {
    /// No ceilings at all.
    pub fn unlimited() -> Self {
        Self {
            reg_global: None,
            reg_list: None,
            arr_global: None,
            arr_list: None,
            blk_global: None,
            blk_list: None,
            fac_global: None,
            fac_list: None,
        }
    }

    /// Build limits from raw byte counts, where any negative value
    /// (conventionally `-1`) means unlimited.
    #[allow(clippy::too_many_arguments)]
    pub fn from_raw(
        reg_global: i64,
        reg_list: i64,
        arr_global: i64,
        arr_list: i64,
        blk_global: i64,
        blk_list: i64,
        fac_global: i64,
        fac_list: i64,
    ) -> Self {
        Self {
            reg_global: from_raw(reg_global),
            reg_list: from_raw(reg_list),
            arr_global: from_raw(arr_global),
            arr_list: from_raw(arr_list),
            blk_global: from_raw(blk_global),
            blk_list: from_raw(blk_list),
            fac_global: from_raw(fac_global),
            fac_list: from_raw(fac_list),
        }
    }

    pub fn with_list_limit(mut self, flavor: Flavor, limit: Option<usize>) -> Self {
        match flavor {
            Flavor::Regular => self.reg_list = limit,
            Flavor::Array => self.arr_list = limit,
            Flavor::Block => self.blk_list = limit,
            Flavor::Factory => self.fac_list = limit,
        }
        self
    }

    pub fn with_global_limit(mut self, flavor: Flavor, limit: Option<usize>) -> Self {
        match flavor {
            Flavor::Regular => self.reg_global = limit,
            Flavor::Array => self.arr_global = limit,
            Flavor::Block => self.blk_global = limit,
            Flavor::Factory => self.fac_global = limit,
        }
        self
    }
}

/// Atomic ceilings read on every free. `usize::MAX` encodes unlimited.
#[derive(Debug)]
pub(crate) struct AtomicLimits {
    global: [AtomicUsize; 4],
    list: [AtomicUsize; 4],
}

fn slot(flavor: Flavor) -> usize {
    match flavor {
        Flavor::Regular => 0,
        Flavor::Array => 1,
        Flavor::Block => 2,
        Flavor::Factory => 3,
    }
}

fn encode(limit: Option<usize>) -> usize {
    limit.unwrap_or(usize::MAX)
}

fn decode(raw: usize) -> Option<usize> {
    (raw != usize::MAX).then_some(raw)
}

impl AtomicLimits {
    pub(crate) fn new(limits: FreeListLimits) -> Self {
        let this = Self {
            global: Default::default(),
            list: Default::default(),
        };
        this.store(limits);
        this
    }

    pub(crate) fn store(&self, limits: FreeListLimits) {
        let pairs = [
            (Flavor::Regular, limits.reg_global, limits.reg_list),
            (Flavor::Array, limits.arr_global, limits.arr_list),
            (Flavor::Block, limits.blk_global, limits.blk_list),
            (Flavor::Factory, limits.fac_global, limits.fac_list),
        ];
        for (flavor, global, list) in pairs {
            self.global[slot(flavor)].store(encode(global), Ordering::Relaxed);
            self.list[slot(flavor)].store(encode(list), Ordering::Relaxed);
        }
    }

    pub(crate) fn load(&self) -> FreeListLimits {
        let g = |f| decode(self.global[slot(f)].load(Ordering::Relaxed));
        let l = |f| decode(self.list[slot(f)].load(Ordering::Relaxed));
        FreeListLimits {
            reg_global: g(Flavor::Regular),
            reg_list: l(Flavor::Regular),
            arr_global: g(Flavor::Array),
            arr_list: l(Flavor::Array),
            blk_global: g(Flavor::Block),
            blk_list: l(Flavor::Block),
            fac_global: g(Flavor::Factory),
            fac_list: l(Flavor::Factory),
        }
    }

    /// Whether `freed` bytes on one list exceed the per-pool ceiling.
    pub(crate) fn list_exceeded(&self, flavor: Flavor, freed: usize) -> bool {
        freed > self.list[slot(flavor)].load(Ordering::Relaxed)
    }

    /// Whether the flavor-wide freed total exceeds the global ceiling.
    pub(crate) fn global_exceeded(&self, flavor: Flavor, freed: usize) -> bool {
        freed > self.global[slot(flavor)].load(Ordering::Relaxed)
    }
}
