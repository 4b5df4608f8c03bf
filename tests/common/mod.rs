#![allow(dead_code)]

//! Shared helpers for the end-to-end collector tests.
//!
//! A conservative collector can be defeated by its own test harness: object
//! addresses linger in dead stack frames and callee-saved registers long
//! after the last real reference is gone.  The helpers here scrub both so
//! that "drop all references" means what it says.

use consgc::Address;

/// Overwrite a deep span of dead stack with zeroes.
#[inline(never)]
pub fn clobber_stack() {
    clobber_stack_inner(40);
}

#[inline(never)]
fn clobber_stack_inner(depth: usize) {
    let mut frame = [0usize; 256];
    std::hint::black_box(&mut frame);
    if depth > 0 {
        clobber_stack_inner(depth - 1);
    }
    std::hint::black_box(&frame);
}

/// Churn the register file with useless arithmetic.
#[inline(never)]
pub fn clobber_registers() {
    let mut acc: usize = 0x5151_5151;
    for i in 0..64usize {
        acc = std::hint::black_box(acc.rotate_left(7) ^ i);
    }
    std::hint::black_box(acc);
}

/// Scrub stacks and registers, then run `n` collections.
pub fn collect_hard(n: usize) {
    for _ in 0..n {
        clobber_registers();
        clobber_stack();
        consgc::gcollect();
    }
}

/// Store a word into a heap slot.
pub fn poke(slot: Address, value: usize) {
    unsafe { slot.store(value) }
}

/// Read a word back from a heap slot.
pub fn peek(slot: Address) -> usize {
    unsafe { slot.load() }
}
