//! Dispatch throughput harness.
//!
//! Runs several virtual CPUs on host threads against one shared block cache.
//! Each guest spins through a ring of blocks that jump to each other, so after
//! warm-up nearly every transition follows an installed direct jump.
//!
//! ## Usage
//!
//! ```sh
//! cargo run -p dbt-core --example dispatch_harness
//! ```

#![allow(clippy::pedantic, clippy::nursery)]

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use dbt_core::{
    lock_cache, CodeGenerator, CodegenError, CpuExecState, ExecConfig, ExecCpu, Executor, ExitCode,
    GeneratedCode, IdentityMmu, LoopExit, NextTb, NoInterruptPolicy, TbCache, TbId, TbKey,
};

use bitflags as _;
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;

const NUM_THREADS: usize = 4;
const RING_BLOCKS: u64 = 32;
const BLOCK_BYTES: u64 = 0x40;
const RUN_BUDGET: u32 = 10_000;

#[derive(Default)]
struct RingCpu {
    exec: CpuExecState,
    pc: u64,
    budget: u32,
}

impl ExecCpu for RingCpu {
    fn exec_state(&self) -> &CpuExecState {
        &self.exec
    }

    fn exec_state_mut(&mut self) -> &mut CpuExecState {
        &mut self.exec
    }

    fn tb_key(&self) -> TbKey {
        TbKey::new(self.pc, 0, 0)
    }

    fn restore_pc(&mut self, key: &TbKey) {
        self.pc = key.pc;
    }
}

fn ring_step(cpu: &mut RingCpu, tb: TbId) -> Result<NextTb, LoopExit> {
    if cpu.budget == 0 {
        return Err(cpu.exec.raise_exit(ExitCode::Hlt));
    }
    cpu.budget -= 1;
    cpu.pc = (cpu.pc + BLOCK_BYTES) % (RING_BLOCKS * BLOCK_BYTES);
    Ok(NextTb::chain(tb, 0))
}

struct RingGen;

impl CodeGenerator<RingCpu> for RingGen {
    fn generate(
        &mut self,
        _cpu: &mut RingCpu,
        _key: TbKey,
        _cflags: u32,
    ) -> Result<GeneratedCode<RingCpu>, CodegenError> {
        Ok(GeneratedCode::new(Arc::new(ring_step), BLOCK_BYTES as u32))
    }
}

fn main() {
    let cache = TbCache::new(ExecConfig::default())
        .expect("default config is valid")
        .into_shared();
    let duration = Duration::from_secs(2);
    let (tx, rx) = mpsc::channel();

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let tx = tx.clone();
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let mut exec = Executor::new(cache, RingGen, IdentityMmu, NoInterruptPolicy);
                let mut cpu = RingCpu::default();
                let start = Instant::now();

                while start.elapsed() < duration {
                    cpu.budget = RUN_BUDGET;
                    if exec.run(&mut cpu).is_err() {
                        break;
                    }
                }

                tx.send(*exec.diagnostics()).ok();
            })
        })
        .collect();

    for h in handles {
        h.join().ok();
    }
    drop(tx);

    let mut blocks = 0u64;
    let mut chained = 0u64;
    for diag in rx {
        blocks += diag.blocks_executed;
        chained += diag.blocks_chained;
    }

    let stats = *lock_cache(&cache).stats();
    let secs = duration.as_secs_f64();
    println!("threads:          {NUM_THREADS}");
    println!("blocks/sec:       {:.2}M", blocks as f64 / secs / 1_000_000.0);
    println!("chained share:    {:.1}%", 100.0 * chained as f64 / blocks.max(1) as f64);
    println!("blocks compiled:  {}", stats.generated);
    println!("direct jumps:     {}", stats.links);
    println!("jump cache hits:  {}", stats.fast_hits);
}
