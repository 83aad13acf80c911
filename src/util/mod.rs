pub mod spin_lock;

pub use spin_lock::LockGuard;
pub use spin_lock::SpinLock;

/// Lehmer PRNG. Good enough for address-space layout randomization;
/// not a CSPRNG. `add_entropy` mixes caller-supplied entropy (boot time,
/// cycle counters) into the state; pass zero when none is available.
pub fn prng(add_entropy: u64) -> u32 {
    use core::ops::DerefMut;

    // https://en.wikipedia.org/wiki/Lehmer_random_number_generator
    static PRNG_BASE: SpinLock<core::num::Wrapping<u64>> = SpinLock::new(core::num::Wrapping(13));

    const MUL: core::num::Wrapping<u64> = core::num::Wrapping(48271);
    const MOD: core::num::Wrapping<u64> = core::num::Wrapping(2_147_483_647);

    let mut lock = PRNG_BASE.lock(line!());
    let val = lock.deref_mut();

    *val *= MUL;
    *val += core::num::Wrapping(add_entropy);
    *val %= MOD;

    val.0 as u32
}
