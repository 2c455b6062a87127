//! Translation block cache lookup, linking and invalidation.

#![allow(clippy::pedantic, clippy::nursery, clippy::too_many_lines)]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use dbt_core::{
    lock_cache, CodeGenerator, CodeMmu, CodegenError, CpuExecState, ExecConfig, ExecCpu,
    GeneratedCode, IdentityMmu, JmpCache, LookupPath, LoopExit, NextTb, TbCache, TbId, TbKey,
};
use rstest::rstest;

use bitflags as _;
use proptest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;

#[derive(Default)]
struct Cpu {
    exec: CpuExecState,
    pc: u64,
    mode: u64,
}

impl Cpu {
    fn at(pc: u64) -> Self {
        Self {
            pc,
            ..Self::default()
        }
    }
}

impl ExecCpu for Cpu {
    fn exec_state(&self) -> &CpuExecState {
        &self.exec
    }

    fn exec_state_mut(&mut self) -> &mut CpuExecState {
        &mut self.exec
    }

    fn tb_key(&self) -> TbKey {
        TbKey::new(self.pc, 0, self.mode)
    }

    fn restore_pc(&mut self, key: &TbKey) {
        self.pc = key.pc;
    }
}

fn nop(_cpu: &mut Cpu, tb: TbId) -> Result<NextTb, LoopExit> {
    Ok(NextTb::chain(tb, 0))
}

/// Generator with per-PC block sizes, counting compilations.
#[derive(Default)]
struct SizedGen {
    sizes: HashMap<u64, u32>,
    compiled: Vec<TbKey>,
}

impl SizedGen {
    fn with(sizes: &[(u64, u32)]) -> Self {
        Self {
            sizes: sizes.iter().copied().collect(),
            compiled: Vec::new(),
        }
    }
}

impl CodeGenerator<Cpu> for SizedGen {
    fn generate(
        &mut self,
        _cpu: &mut Cpu,
        key: TbKey,
        _cflags: u32,
    ) -> Result<GeneratedCode<Cpu>, CodegenError> {
        self.compiled.push(key);
        let size = self.sizes.get(&key.pc).copied().unwrap_or(4);
        Ok(GeneratedCode::new(Arc::new(nop), size))
    }
}

/// MMU relocating the guest's first 16 pages by a fixed physical offset.
struct OffsetMmu(u64);

impl CodeMmu<Cpu> for OffsetMmu {
    fn code_phys_addr(&mut self, _cpu: &mut Cpu, vaddr: u64) -> Option<u64> {
        (vaddr < 0x1_0000).then_some(vaddr + self.0)
    }
}

fn new_cache() -> TbCache<Cpu> {
    TbCache::new(ExecConfig::default()).expect("default config is valid")
}

fn lookup(
    cache: &mut TbCache<Cpu>,
    jmp: &mut JmpCache,
    gen: &mut SizedGen,
    cpu: &mut Cpu,
) -> (TbId, LookupPath, bool) {
    let found = cache
        .find_fast(cpu, jmp, gen, &mut IdentityMmu)
        .expect("lookup succeeds");
    (found.id, found.path, found.invalidated)
}

#[test]
fn same_key_returns_identical_block_without_recompiling() {
    let mut cache = new_cache();
    let mut jmp = JmpCache::new(cache.config());
    let mut gen = SizedGen::default();
    let mut cpu = Cpu::at(0x4000);

    let (first, path, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut cpu);
    assert_eq!(path, LookupPath::Generated);
    for _ in 0..3 {
        let (again, path, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut cpu);
        assert_eq!(again, first);
        assert_eq!(path, LookupPath::Fast);
    }
    assert_eq!(gen.compiled.len(), 1);
    assert_eq!(cache.stats().fast_hits, 3);
}

#[rstest]
#[case::flags(0x4000, 1, 0x4000, 0)]
#[case::pc(0x4000, 0, 0x4004, 0)]
fn changed_key_forces_new_translation(
    #[case] pc_a: u64,
    #[case] mode_a: u64,
    #[case] pc_b: u64,
    #[case] mode_b: u64,
) {
    let mut cache = new_cache();
    let mut jmp = JmpCache::new(cache.config());
    let mut gen = SizedGen::default();

    let mut cpu = Cpu::at(pc_a);
    cpu.mode = mode_a;
    let (a, _, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut cpu);

    cpu.pc = pc_b;
    cpu.mode = mode_b;
    let (b, path, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut cpu);

    assert_ne!(a, b);
    assert_eq!(path, LookupPath::Generated);
    assert_eq!(gen.compiled.len(), 2);
    assert_eq!(cache.get(b).map(|tb| tb.key), Some(TbKey::new(pc_b, 0, mode_b)));
}

#[test]
fn physical_remapping_is_a_different_block() {
    let mut cache = new_cache();
    let mut jmp = JmpCache::new(cache.config());
    let mut gen = SizedGen::default();
    let mut cpu = Cpu::at(0x100);

    let a = cache
        .find_fast(&mut cpu, &mut jmp, &mut gen, &mut OffsetMmu(0x10_0000))
        .expect("mapped")
        .id;
    let b = cache
        .find_slow(
            &mut cpu,
            TbKey::new(0x100, 0, 0),
            &mut gen,
            &mut OffsetMmu(0x20_0000),
        )
        .expect("mapped")
        .0;

    assert_ne!(a, b);
    assert_eq!(cache.get(a).map(|tb| tb.page_addr), Some(0x10_0000));
    assert_eq!(cache.get(b).map(|tb| tb.page_addr), Some(0x20_0000));
}

#[test]
fn cpus_with_different_code_mappings_get_their_own_blocks() {
    let shared = new_cache().into_shared();
    let mut gen = SizedGen::default();
    let mut jmp_a = JmpCache::new(lock_cache(&shared).config());
    let mut jmp_b = jmp_a.clone();

    let a = lock_cache(&shared)
        .find_fast(&mut Cpu::at(0x1000), &mut jmp_a, &mut gen, &mut IdentityMmu)
        .expect("mapped");
    let b = lock_cache(&shared)
        .find_fast(&mut Cpu::at(0x1000), &mut jmp_b, &mut gen, &mut OffsetMmu(0x8000))
        .expect("mapped");
    assert_eq!(b.path, LookupPath::Generated);
    assert_ne!(a.id, b.id);

    let again_a = lock_cache(&shared)
        .find_fast(&mut Cpu::at(0x1000), &mut jmp_a, &mut gen, &mut IdentityMmu)
        .expect("mapped");
    let again_b = lock_cache(&shared)
        .find_fast(&mut Cpu::at(0x1000), &mut jmp_b, &mut gen, &mut OffsetMmu(0x8000))
        .expect("mapped");
    assert_eq!((again_a.id, again_a.path), (a.id, LookupPath::Fast));
    assert_eq!((again_b.id, again_b.path), (b.id, LookupPath::Fast));

    let cache = lock_cache(&shared);
    assert_eq!(cache.get(a.id).map(|tb| tb.page_addr), Some(0x1000));
    assert_eq!(cache.get(b.id).map(|tb| tb.page_addr), Some(0x9000));
}

#[test]
fn two_page_blocks_are_never_linked() {
    let mut cache = new_cache();
    let mut jmp = JmpCache::new(cache.config());
    let mut gen = SizedGen::with(&[(0x1FF8, 0x10)]);

    let (straddler, _, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut Cpu::at(0x1FF8));
    let (plain_a, _, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut Cpu::at(0x3000));
    let (plain_b, _, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut Cpu::at(0x3010));

    assert!(cache.get(straddler).expect("live").spans_two_pages());
    assert!(!cache.add_jump(plain_a, 0, straddler));
    assert!(!cache.add_jump(straddler, 1, plain_a));
    assert!(cache.add_jump(plain_a, 1, plain_b));

    assert_eq!(cache.get(plain_a).expect("live").jmp_next, [None, Some(plain_b)]);
    assert_eq!(cache.get(straddler).expect("live").jmp_next, [None, None]);
    assert!(cache.get(straddler).expect("live").incoming().is_empty());
}

#[test]
fn second_page_remap_misses_in_slow_path() {
    struct SplitMmu(u64);
    impl CodeMmu<Cpu> for SplitMmu {
        fn code_phys_addr(&mut self, _cpu: &mut Cpu, vaddr: u64) -> Option<u64> {
            Some(if vaddr >= 0x2000 { vaddr + self.0 } else { vaddr })
        }
    }

    let mut cache = new_cache();
    let mut gen = SizedGen::with(&[(0x1FF8, 0x10)]);
    let key = TbKey::new(0x1FF8, 0, 0);
    let mut cpu = Cpu::at(0x1FF8);

    let (first, _) = cache
        .find_slow(&mut cpu, key, &mut gen, &mut SplitMmu(0))
        .expect("mapped");
    let (same, path) = cache
        .find_slow(&mut cpu, key, &mut gen, &mut SplitMmu(0))
        .expect("mapped");
    assert_eq!((same, path), (first, LookupPath::Slow));

    let (remapped, path) = cache
        .find_slow(&mut cpu, key, &mut gen, &mut SplitMmu(0x8000))
        .expect("mapped");
    assert_ne!(remapped, first);
    assert_eq!(path, LookupPath::Generated);
}

#[test]
fn raised_invalidation_flag_forces_slow_path() {
    let mut cache = new_cache();
    let mut jmp = JmpCache::new(cache.config());
    let mut gen = SizedGen::default();
    let mut cpu = Cpu::at(0x800);
    let (id, _, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut cpu);

    let instrumentation = cache.invalidation_flag().clone();
    instrumentation.raise();

    let (again, path, invalidated) = lookup(&mut cache, &mut jmp, &mut gen, &mut cpu);
    assert_eq!(again, id);
    assert_eq!(path, LookupPath::Slow);
    assert!(invalidated);
    assert!(!instrumentation.is_raised());

    let (_, path, invalidated) = lookup(&mut cache, &mut jmp, &mut gen, &mut cpu);
    assert_eq!(path, LookupPath::Fast);
    assert!(!invalidated);
}

#[test]
fn invalidating_a_page_unlinks_jumps_into_it() {
    let mut cache = new_cache();
    let mut jmp = JmpCache::new(cache.config());
    let mut gen = SizedGen::default();
    let (caller, _, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut Cpu::at(0x1000));
    let (callee, _, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut Cpu::at(0x5000));
    let (neighbour, _, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut Cpu::at(0x5100));
    assert!(cache.add_jump(caller, 0, callee));
    assert!(cache.add_jump(callee, 0, caller));

    assert_eq!(cache.invalidate_phys_page(0x5080), 2);

    assert!(!cache.contains(callee));
    assert!(!cache.contains(neighbour));
    let caller_tb = cache.get(caller).expect("other page survives");
    assert_eq!(caller_tb.jmp_next, [None, None]);
    assert!(caller_tb.incoming().is_empty());
    assert_eq!(cache.follow_link(caller, 0, TbKey::new(0x5000, 0, 0)), None);
    assert!(cache.invalidation_flag().is_raised());
    assert_eq!(cache.stats().invalidations, 2);

    let (_, path, invalidated) = lookup(&mut cache, &mut jmp, &mut gen, &mut Cpu::at(0x5000));
    assert_eq!(path, LookupPath::Generated);
    assert!(invalidated);
}

#[test]
fn follow_link_checks_target_key() {
    let mut cache = new_cache();
    let mut jmp = JmpCache::new(cache.config());
    let mut gen = SizedGen::default();
    let (a, _, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut Cpu::at(0x100));
    let (b, _, _) = lookup(&mut cache, &mut jmp, &mut gen, &mut Cpu::at(0x200));
    assert!(cache.add_jump(a, 0, b));

    assert_eq!(cache.follow_link(a, 0, TbKey::new(0x200, 0, 0)), Some(b));
    assert_eq!(cache.follow_link(a, 0, TbKey::new(0x200, 0, 1)), None);
    assert_eq!(cache.follow_link(a, 1, TbKey::new(0x200, 0, 0)), None);
    assert_eq!(cache.stats().chained, 1);
}

#[test]
fn flush_drops_everything_and_raises_flag() {
    let mut cache = new_cache();
    let mut jmp = JmpCache::new(cache.config());
    let mut gen = SizedGen::default();
    let ids: Vec<TbId> = (0..8)
        .map(|i| lookup(&mut cache, &mut jmp, &mut gen, &mut Cpu::at(0x100 * i)).0)
        .collect();

    cache.flush();

    assert!(cache.is_empty());
    assert!(ids.iter().all(|id| !cache.contains(*id)));
    assert!(cache.invalidation_flag().is_raised());
    assert_eq!(cache.stats().flushes, 1);
}

#[test]
fn shared_cache_serves_sibling_cpus() {
    let shared = new_cache().into_shared();

    thread::scope(|scope| {
        for worker in 0..4_u64 {
            let cache = Arc::clone(&shared);
            scope.spawn(move || {
                let mut gen = SizedGen::default();
                let mut jmp = JmpCache::new(&ExecConfig::default());
                for pc in (0..64).map(|i| 0x1000 + i * 0x10) {
                    let mut cpu = Cpu::at(pc);
                    cpu.mode = worker % 2;
                    lock_cache(&cache)
                        .find_fast(&mut cpu, &mut jmp, &mut gen, &mut IdentityMmu)
                        .expect("lookup succeeds");
                }
            });
        }
    });

    assert_eq!(lock_cache(&shared).len(), 128);
}
