#![no_main]

use std::sync::Arc;

use dbt_core::{
    FieldAccessor, RegisterDescriptor, RegisterFlags, RegisterKey, RegisterTable, RegisterWidth,
    Selector,
};
use libfuzzer_sys::fuzz_target;

#[derive(Default)]
struct Bank {
    value: u64,
}

fn get(bank: &Bank) -> u64 {
    bank.value
}

fn set(bank: &mut Bank, value: u64) {
    bank.value = value;
}

fn selector(byte: u8, max: u8) -> Selector {
    if byte & 0x80 != 0 {
        Selector::Any
    } else {
        Selector::Exact(byte % (max + 1))
    }
}

fuzz_target!(|data: &[u8]| {
    let mut table = RegisterTable::new();
    let mut chunks = data.chunks_exact(6);
    for chunk in &mut chunks {
        let flags = RegisterFlags::from_bits_truncate(u32::from(chunk[5]));
        let desc = RegisterDescriptor::new(
            "FUZZ",
            15,
            Selector::Exact(chunk[0] & 0x1F),
            selector(chunk[1], 15),
            selector(chunk[2], 7),
            selector(chunk[3], 7),
        )
        .with_flags(flags)
        .with_reset_value(u64::from(chunk[4]) << 28)
        .with_field(FieldAccessor::new(RegisterWidth::W64, get, set));
        let before = table.len();
        match table.register(Arc::new(desc)) {
            Ok(added) => assert_eq!(table.len(), before + added),
            Err(_) => assert_eq!(table.len(), before),
        }
    }

    let mut bank = Bank::default();
    let _ = table.reset(&mut bank);
    for key in table.keys() {
        let _ = table.read64(&mut bank, key);
        let _ = table.write32(&mut bank, key, 0xFFFF_FFFF);
    }
    if let Some(rest) = chunks.remainder().first() {
        let _ = table.read32(&mut bank, RegisterKey::from_raw(u32::from(*rest) << 11));
    }
});
