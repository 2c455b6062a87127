use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, trace};

use super::backend::{CodeGenerator, CodeMmu, CodegenError};
use super::block::{TbId, TbKey, TranslationBlock};
use super::jmp_cache::JmpCache;
use crate::config::{ConfigError, ExecConfig};
use crate::exec::ExecCpu;

/// Block cache shared between the CPUs of one machine.
///
/// Every structural change happens under the mutex; the lock is not held
/// while compiled code runs.
pub type SharedTbCache<C> = Arc<Mutex<TbCache<C>>>;

/// Locks a shared cache, taking over a poisoned lock.
///
/// Poisoning only means a previous holder panicked; the cache keeps its
/// invariants between method calls.
pub fn lock_cache<C>(cache: &SharedTbCache<C>) -> MutexGuard<'_, TbCache<C>> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Flag raised whenever cached blocks may have been removed.
///
/// Clones share one flag, so memory-write instrumentation outside the cache
/// can raise it too.
#[derive(Debug, Clone, Default)]
pub struct InvalidationFlag(Arc<AtomicBool>);

impl InvalidationFlag {
    /// Creates a lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` while the flag is raised.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Lowers the flag, returning whether it was raised.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Block lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// The code MMU has no mapping for the guest PC.
    #[error("code at {pc:#x} is not mapped")]
    NotMapped {
        /// Unmapped guest virtual address.
        pc: u64,
    },
    /// The code generator failed.
    #[error(transparent)]
    Codegen(#[from] CodegenError),
}

/// How a block was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupPath {
    /// Jump cache hit.
    Fast,
    /// Found in the physical hash table.
    Slow,
    /// Compiled on this lookup.
    Generated,
    /// Reached through an existing direct jump, without any lookup.
    Chained,
}

/// Result of a block lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TbLookup {
    /// Block to execute.
    pub id: TbId,
    /// Lookup path taken.
    pub path: LookupPath,
    /// Blocks may have been removed since the previous lookup; pending link
    /// hints must be discarded.
    pub invalidated: bool,
}

/// Saturating cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TbCacheStats {
    /// Jump cache hits.
    pub fast_hits: u64,
    /// Physical hash hits.
    pub slow_hits: u64,
    /// Blocks compiled.
    pub generated: u64,
    /// Direct jumps installed.
    pub links: u64,
    /// Direct jumps followed.
    pub chained: u64,
    /// Blocks removed by invalidation.
    pub invalidations: u64,
    /// Whole-cache flushes.
    pub flushes: u64,
}

struct Slot<C> {
    generation: u32,
    block: Option<TranslationBlock<C>>,
}

/// Translation block cache.
///
/// Blocks live in an arena addressed by [`TbId`]. The physical hash table
/// owns the lookup order of each bucket. Jump caches are per CPU and hold
/// non-owning ids that are re-validated on every hit; a flush advances the
/// cache epoch, which empties them on their next lookup.
pub struct TbCache<C> {
    config: ExecConfig,
    slots: Vec<Slot<C>>,
    free: Vec<u32>,
    live: usize,
    phys_hash: Vec<Vec<TbId>>,
    epoch: u64,
    invalidated: InvalidationFlag,
    stats: TbCacheStats,
}

impl<C> fmt::Debug for TbCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TbCache")
            .field("config", &self.config)
            .field("live", &self.live)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<C> TbCache<C> {
    /// Creates an empty cache sized by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` fails validation.
    pub fn new(config: ExecConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            phys_hash: vec![Vec::new(); 1 << config.phys_hash_bits],
            epoch: 0,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            invalidated: InvalidationFlag::new(),
            stats: TbCacheStats::default(),
            config,
        })
    }

    /// Wraps the cache for sharing between CPUs.
    #[must_use]
    pub fn into_shared(self) -> SharedTbCache<C> {
        Arc::new(Mutex::new(self))
    }

    /// Configuration the cache was built with.
    #[must_use]
    pub const fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Counters since creation.
    #[must_use]
    pub const fn stats(&self) -> &TbCacheStats {
        &self.stats
    }

    /// Handle to the invalidation flag.
    #[must_use]
    pub const fn invalidation_flag(&self) -> &InvalidationFlag {
        &self.invalidated
    }

    /// Number of live blocks.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` when no block is cached.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Block named by `id`, unless it has been removed.
    #[must_use]
    pub fn get(&self, id: TbId) -> Option<&TranslationBlock<C>> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation == id.generation() {
            slot.block.as_ref()
        } else {
            None
        }
    }

    fn get_mut(&mut self, id: TbId) -> Option<&mut TranslationBlock<C>> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation == id.generation() {
            slot.block.as_mut()
        } else {
            None
        }
    }

    /// Returns `true` while `id` names a cached block.
    #[must_use]
    pub fn contains(&self, id: TbId) -> bool {
        self.get(id).is_some()
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn phys_bucket(&self, phys_pc: u64) -> usize {
        ((phys_pc >> 2) & ((1_u64 << self.config.phys_hash_bits) - 1)) as usize
    }

    /// Number of flushes since creation; per-CPU jump caches compare it to
    /// drop entries from before a flush.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Jump-cache lookup of `key`, validating the cached id and all key fields.
    #[must_use]
    pub fn lookup_jmp_cache(&self, jmp: &JmpCache, key: TbKey) -> Option<TbId> {
        let id = jmp.get(key.pc)?;
        self.get(id).filter(|tb| tb.key == key).map(|_| id)
    }

    /// Virtual page holding the last byte of a block, when it differs from
    /// the page of its first byte.
    fn last_page(&self, pc: u64, guest_size: u32) -> Option<u64> {
        let page_mask = self.config.page_mask();
        let last = pc.wrapping_add(u64::from(guest_size.max(1)) - 1) & page_mask;
        if last == pc & page_mask {
            None
        } else {
            Some(last)
        }
    }

    /// Looks up the block for the CPU's current state through the CPU's own
    /// jump cache, compiling it on a miss.
    ///
    /// The jump cache is bypassed while the invalidation flag is raised. The
    /// flag is consumed and reported in [`TbLookup::invalidated`]. The block
    /// found is installed in `jmp`.
    ///
    /// # Errors
    ///
    /// See [`Self::find_slow`].
    pub fn find_fast<G, M>(
        &mut self,
        cpu: &mut C,
        jmp: &mut JmpCache,
        codegen: &mut G,
        mmu: &mut M,
    ) -> Result<TbLookup, LookupError>
    where
        C: ExecCpu,
        G: CodeGenerator<C>,
        M: CodeMmu<C>,
    {
        let key = cpu.tb_key();
        jmp.sync(self.epoch);
        let bypass = self.invalidated.is_raised();
        if !bypass {
            if let Some(id) = self.lookup_jmp_cache(jmp, key) {
                self.stats.fast_hits = self.stats.fast_hits.saturating_add(1);
                return Ok(TbLookup {
                    id,
                    path: LookupPath::Fast,
                    invalidated: false,
                });
            }
        }

        let (id, path) = self.find_slow(cpu, key, codegen, mmu)?;
        jmp.sync(self.epoch);
        jmp.insert(key.pc, id);
        let invalidated = self.invalidated.take() || bypass;
        Ok(TbLookup {
            id,
            path,
            invalidated,
        })
    }

    /// Looks `key` up by physical address, compiling the block on a miss.
    ///
    /// A hit is moved to the head of its bucket.
    ///
    /// # Errors
    ///
    /// [`LookupError::NotMapped`] when the PC (or the second page of a
    /// compiled block) has no physical mapping, [`LookupError::Codegen`]
    /// when compilation fails.
    pub fn find_slow<G, M>(
        &mut self,
        cpu: &mut C,
        key: TbKey,
        codegen: &mut G,
        mmu: &mut M,
    ) -> Result<(TbId, LookupPath), LookupError>
    where
        G: CodeGenerator<C>,
        M: CodeMmu<C>,
    {
        let page_mask = self.config.page_mask();
        let phys_pc = mmu
            .code_phys_addr(cpu, key.pc)
            .ok_or(LookupError::NotMapped { pc: key.pc })?;
        let phys_page1 = phys_pc & page_mask;
        let bucket = self.phys_bucket(phys_pc);

        let mut found = None;
        for (pos, &id) in self.phys_hash[bucket].iter().enumerate() {
            let Some(tb) = self.get(id) else { continue };
            if tb.key != key || tb.page_addr != phys_page1 {
                continue;
            }
            let matches = match (tb.second_page, self.last_page(key.pc, tb.guest_size)) {
                (None, _) => true,
                (Some(page2), Some(virt_page2)) => mmu
                    .code_phys_addr(cpu, virt_page2)
                    .is_some_and(|phys| phys & page_mask == page2),
                (Some(_), None) => false,
            };
            if matches {
                found = Some((pos, id));
                break;
            }
        }

        let (id, path) = if let Some((pos, id)) = found {
            if pos > 0 {
                let chain = &mut self.phys_hash[bucket];
                chain.remove(pos);
                chain.insert(0, id);
            }
            self.stats.slow_hits = self.stats.slow_hits.saturating_add(1);
            (id, LookupPath::Slow)
        } else {
            (
                self.generate(cpu, key, phys_pc, codegen, mmu)?,
                LookupPath::Generated,
            )
        };

        Ok((id, path))
    }

    fn generate<G, M>(
        &mut self,
        cpu: &mut C,
        key: TbKey,
        phys_pc: u64,
        codegen: &mut G,
        mmu: &mut M,
    ) -> Result<TbId, LookupError>
    where
        G: CodeGenerator<C>,
        M: CodeMmu<C>,
    {
        if self.live >= self.config.max_blocks {
            self.flush();
        }
        let generated = match codegen.generate(cpu, key, 0) {
            Err(CodegenError::BufferFull) => {
                self.flush();
                codegen.generate(cpu, key, 0)?
            }
            result => result?,
        };

        let page_mask = self.config.page_mask();
        let second_page = match self.last_page(key.pc, generated.guest_size) {
            None => None,
            Some(virt_page2) => {
                let phys = mmu
                    .code_phys_addr(cpu, virt_page2)
                    .ok_or(LookupError::NotMapped { pc: virt_page2 })?;
                Some(phys & page_mask)
            }
        };

        let id = self.insert(TranslationBlock {
            key,
            phys_pc,
            page_addr: phys_pc & page_mask,
            second_page,
            guest_size: generated.guest_size,
            code: generated.code,
            jmp_next: [None, None],
            jmp_incoming: Vec::new(),
        });
        self.stats.generated = self.stats.generated.saturating_add(1);
        trace!(
            "generated {} for pc {:#x} (phys {:#x}, {} bytes{})",
            id,
            key.pc,
            phys_pc,
            generated.guest_size,
            if second_page.is_some() { ", two pages" } else { "" }
        );
        Ok(id)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn insert(&mut self, block: TranslationBlock<C>) -> TbId {
        let bucket = self.phys_bucket(block.phys_pc);
        let id = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.block = Some(block);
            TbId::new(index, slot.generation)
        } else {
            // Slot count never exceeds max_blocks, which fits the exit word.
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                block: Some(block),
            });
            TbId::new(index, 0)
        };
        self.phys_hash[bucket].insert(0, id);
        self.live += 1;
        id
    }

    /// Links exit `slot` of `from` directly to `to`.
    ///
    /// Refused when either block spans two pages, either id is stale, the
    /// slot is not `0` or `1`, or the slot already jumps elsewhere. Returns
    /// `true` when the link is in place.
    pub fn add_jump(&mut self, from: TbId, slot: usize, to: TbId) -> bool {
        if slot > 1 {
            return false;
        }
        let (Some(src), Some(dst)) = (self.get(from), self.get(to)) else {
            return false;
        };
        if src.spans_two_pages() || dst.spans_two_pages() {
            return false;
        }
        if let Some(existing) = src.jmp_next[slot] {
            return existing == to;
        }

        if let Some(src) = self.get_mut(from) {
            src.jmp_next[slot] = Some(to);
        }
        if let Some(dst) = self.get_mut(to) {
            dst.jmp_incoming.push((from, slot));
        }
        self.stats.links = self.stats.links.saturating_add(1);
        true
    }

    /// Follows an installed direct jump of `from` when its target matches `key`.
    pub fn follow_link(&mut self, from: TbId, slot: usize, key: TbKey) -> Option<TbId> {
        let to = (*self.get(from)?.jmp_next.get(slot)?)?;
        if self.get(to)?.key != key {
            return None;
        }
        self.stats.chained = self.stats.chained.saturating_add(1);
        Some(to)
    }

    /// Removes one block and every direct jump into or out of it.
    pub fn invalidate_block(&mut self, id: TbId) -> bool {
        let removed = self.remove(id);
        if removed {
            self.invalidated.raise();
        }
        removed
    }

    /// Removes every block with code on the physical page containing `addr`.
    ///
    /// Returns the number of blocks removed.
    pub fn invalidate_phys_page(&mut self, addr: u64) -> usize {
        let page = addr & self.config.page_mask();
        let victims: Vec<TbId> = self
            .slots
            .iter()
            .zip(0_u32..)
            .filter_map(|(slot, index)| {
                slot.block
                    .as_ref()
                    .filter(|tb| tb.touches_page(page))
                    .map(|_| TbId::new(index, slot.generation))
            })
            .collect();
        for &id in &victims {
            self.remove(id);
        }
        if !victims.is_empty() {
            debug!("invalidated {} blocks on page {:#x}", victims.len(), page);
            self.invalidated.raise();
        }
        victims.len()
    }

    /// Drops every cached block.
    pub fn flush(&mut self) {
        let dropped = self.live;
        for slot in &mut self.slots {
            if slot.block.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free.clear();
        self.free.extend((0..self.slots.len()).filter_map(|i| u32::try_from(i).ok()).rev());
        for bucket in &mut self.phys_hash {
            bucket.clear();
        }
        self.epoch = self.epoch.wrapping_add(1);
        self.live = 0;
        self.stats.flushes = self.stats.flushes.saturating_add(1);
        self.invalidated.raise();
        debug!("flushed translation block cache ({} blocks)", dropped);
    }

    fn remove(&mut self, id: TbId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index() as usize) else {
            return false;
        };
        if slot.generation != id.generation() {
            return false;
        }
        let Some(block) = slot.block.take() else {
            return false;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.live -= 1;

        let bucket = self.phys_bucket(block.phys_pc);
        self.phys_hash[bucket].retain(|&other| other != id);

        for (slot, target) in block.jmp_next.iter().enumerate() {
            if let Some(dst) = target.and_then(|to| self.get_mut(to)) {
                dst.jmp_incoming.retain(|&edge| edge != (id, slot));
            }
        }
        for &(from, slot) in &block.jmp_incoming {
            if let Some(src) = self.get_mut(from) {
                if src.jmp_next[slot] == Some(id) {
                    src.jmp_next[slot] = None;
                }
            }
        }

        self.stats.invalidations = self.stats.invalidations.saturating_add(1);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{InvalidationFlag, JmpCache, LookupError, LookupPath, TbCache};
    use crate::tb::{CodeGenerator, CodegenError, GeneratedCode, IdentityMmu, NextTb, TbKey};
    use crate::{CpuExecState, ExecConfig, ExecCpu, LoopExit, TbId};

    #[derive(Default)]
    struct Cpu {
        exec: CpuExecState,
        key: TbKey,
    }

    impl ExecCpu for Cpu {
        fn exec_state(&self) -> &CpuExecState {
            &self.exec
        }

        fn exec_state_mut(&mut self) -> &mut CpuExecState {
            &mut self.exec
        }

        fn tb_key(&self) -> TbKey {
            self.key
        }

        fn restore_pc(&mut self, key: &TbKey) {
            self.key.pc = key.pc;
        }
    }

    struct FixedSize {
        size: u32,
        calls: usize,
        fail_full: usize,
    }

    impl FixedSize {
        const fn new(size: u32) -> Self {
            Self {
                size,
                calls: 0,
                fail_full: 0,
            }
        }
    }

    fn halt(_cpu: &mut Cpu, _tb: TbId) -> Result<NextTb, LoopExit> {
        Ok(NextTb::NONE)
    }

    impl CodeGenerator<Cpu> for FixedSize {
        fn generate(
            &mut self,
            _cpu: &mut Cpu,
            _key: TbKey,
            _cflags: u32,
        ) -> Result<GeneratedCode<Cpu>, CodegenError> {
            self.calls += 1;
            if self.fail_full > 0 {
                self.fail_full -= 1;
                return Err(CodegenError::BufferFull);
            }
            Ok(GeneratedCode::new(Arc::new(halt), self.size))
        }
    }

    fn cache() -> TbCache<Cpu> {
        TbCache::new(ExecConfig::default()).expect("default config is valid")
    }

    fn cpu_at(pc: u64) -> Cpu {
        Cpu {
            key: TbKey::new(pc, 0, 0),
            ..Cpu::default()
        }
    }

    #[test]
    fn miss_then_fast_hit_returns_same_block() {
        let mut cache = cache();
        let mut jmp = JmpCache::new(cache.config());
        let mut gen = FixedSize::new(8);
        let mut cpu = cpu_at(0x1000);

        let first = cache
            .find_fast(&mut cpu, &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup");
        assert_eq!(first.path, LookupPath::Generated);

        let second = cache
            .find_fast(&mut cpu, &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup");
        assert_eq!(second.path, LookupPath::Fast);
        assert_eq!(second.id, first.id);
        assert_eq!(gen.calls, 1);
    }

    #[test]
    fn jmp_cache_collision_falls_back_to_phys_hash() {
        let mut cache = cache();
        let mut jmp = JmpCache::new(cache.config());
        let mut gen = FixedSize::new(4);
        let a = 0x1000;
        let b = a + (1 << 24);
        assert_eq!(jmp.hash(a), jmp.hash(b));

        let first = cache
            .find_fast(&mut cpu_at(a), &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup");
        cache
            .find_fast(&mut cpu_at(b), &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup");
        let again = cache
            .find_fast(&mut cpu_at(a), &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup");

        assert_eq!(again.path, LookupPath::Slow);
        assert_eq!(again.id, first.id);
    }

    #[test]
    fn unmapped_pc_is_reported() {
        struct NoMapping;
        impl crate::tb::CodeMmu<Cpu> for NoMapping {
            fn code_phys_addr(&mut self, _cpu: &mut Cpu, _vaddr: u64) -> Option<u64> {
                None
            }
        }

        let mut cache = cache();
        let mut jmp = JmpCache::new(cache.config());
        let result = cache.find_fast(
            &mut cpu_at(0x40),
            &mut jmp,
            &mut FixedSize::new(4),
            &mut NoMapping,
        );
        assert_eq!(result, Err(LookupError::NotMapped { pc: 0x40 }));
        assert!(cache.is_empty());
    }

    #[test]
    fn block_crossing_page_boundary_records_second_page() {
        let mut cache = cache();
        let mut jmp = JmpCache::new(cache.config());
        let lookup = cache
            .find_fast(
                &mut cpu_at(0x1FFC),
                &mut jmp,
                &mut FixedSize::new(8),
                &mut IdentityMmu,
            )
            .expect("lookup");
        let tb = cache.get(lookup.id).expect("live block");
        assert_eq!(tb.page_addr, 0x1000);
        assert_eq!(tb.second_page, Some(0x2000));
    }

    #[test]
    fn block_longer_than_a_page_hits_in_slow_path() {
        let mut cache = cache();
        let mut gen = FixedSize::new(0x2008);
        let key = TbKey::new(0x1FF0, 0, 0);
        let (first, _) = cache
            .find_slow(&mut cpu_at(0x1FF0), key, &mut gen, &mut IdentityMmu)
            .expect("lookup");
        assert_eq!(cache.get(first).expect("live block").second_page, Some(0x3000));

        let (again, path) = cache
            .find_slow(&mut cpu_at(0x1FF0), key, &mut gen, &mut IdentityMmu)
            .expect("lookup");
        assert_eq!((again, path), (first, LookupPath::Slow));
        assert_eq!(gen.calls, 1);
    }

    #[test]
    fn flush_empties_jump_caches_through_epoch() {
        let mut cache = cache();
        let mut jmp = JmpCache::new(cache.config());
        let mut gen = FixedSize::new(4);
        cache
            .find_fast(&mut cpu_at(0x100), &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup");
        assert!(jmp.get(0x100).is_some());

        cache.flush();
        assert_eq!(cache.epoch(), 1);
        let lookup = cache
            .find_fast(&mut cpu_at(0x200), &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup");
        assert!(lookup.invalidated);
        assert_eq!(jmp.get(0x100), None);
    }

    #[test]
    fn buffer_full_flushes_and_retries_once() {
        let mut cache = cache();
        let mut jmp = JmpCache::new(cache.config());
        let mut gen = FixedSize::new(4);
        let old = cache
            .find_fast(&mut cpu_at(0x100), &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup")
            .id;

        gen.fail_full = 1;
        let lookup = cache
            .find_fast(&mut cpu_at(0x200), &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup");

        assert!(lookup.invalidated);
        assert!(!cache.contains(old));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().flushes, 1);
    }

    #[test]
    fn reaching_max_blocks_flushes_before_generating() {
        let config = ExecConfig {
            max_blocks: 2,
            ..ExecConfig::default()
        };
        let mut cache = TbCache::new(config).expect("valid");
        let mut jmp = JmpCache::new(cache.config());
        let mut gen = FixedSize::new(4);
        for pc in [0x100, 0x200, 0x300] {
            cache
                .find_fast(&mut cpu_at(pc), &mut jmp, &mut gen, &mut IdentityMmu)
                .expect("lookup");
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().flushes, 1);
    }

    #[test]
    fn stale_ids_are_rejected_after_slot_reuse() {
        let mut cache = cache();
        let mut jmp = JmpCache::new(cache.config());
        let mut gen = FixedSize::new(4);
        let old = cache
            .find_fast(&mut cpu_at(0x100), &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup")
            .id;
        assert!(cache.invalidate_block(old));
        let new = cache
            .find_fast(&mut cpu_at(0x100), &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup")
            .id;

        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);
        assert!(cache.get(old).is_none());
        assert!(!cache.invalidate_block(old));
    }

    #[test]
    fn add_jump_rejects_bad_slot_and_existing_link() {
        let mut cache = cache();
        let mut jmp = JmpCache::new(cache.config());
        let mut gen = FixedSize::new(4);
        let a = cache
            .find_fast(&mut cpu_at(0x100), &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup")
            .id;
        let b = cache
            .find_fast(&mut cpu_at(0x200), &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup")
            .id;
        let c = cache
            .find_fast(&mut cpu_at(0x300), &mut jmp, &mut gen, &mut IdentityMmu)
            .expect("lookup")
            .id;

        assert!(!cache.add_jump(a, 2, b));
        assert!(cache.add_jump(a, 0, b));
        assert!(cache.add_jump(a, 0, b));
        assert!(!cache.add_jump(a, 0, c));
        assert_eq!(cache.get(b).expect("live").incoming(), &[(a, 0)]);
        assert_eq!(cache.stats().links, 1);
    }

    #[test]
    fn invalidation_flag_clones_share_state() {
        let flag = InvalidationFlag::new();
        let remote = flag.clone();
        remote.raise();
        assert!(flag.is_raised());
        assert!(flag.take());
        assert!(!remote.is_raised());
    }
}
