// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Safety watchdog EndInit lock.
//!
//! The safety watchdog guards a set of safety-critical registers behind a
//! global write-protection bit (EndInit). Writes to protected registers are
//! only accepted while EndInit is disengaged, and disengaging requires the
//! watchdog password. The watchdog service logic itself (feeding, timeout
//! handling) is not implemented here; this module only exposes the lock.
//!
//! Consumers take the lock as an injected [`SafetyLockControl`] capability
//! so that acquire/release pairing can be tested against a fake.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs};

use crate::static_ref::StaticRef;

register_structs! {
    pub WdtRegisters {
        /// Control register 0: password, lock and EndInit bits
        (0x00 => con0: ReadWrite<u32, CON0::Register>),
        /// Control register 1: operating modes
        (0x04 => con1: ReadWrite<u32, CON1::Register>),
        /// Status register
        (0x08 => sr: ReadOnly<u32, SR::Register>),
        (0x0C => @END),
    }
}

register_bitfields![u32,
    CON0 [
        /// EndInit protection bit. 1 = protected registers are locked.
        ENDINIT OFFSET(0) NUMBITS(1) [],
        /// Register lock. Writing CON0 requires a password unlock while
        /// this bit is set.
        LCK OFFSET(1) NUMBITS(1) [],
        /// Watchdog password
        PW OFFSET(2) NUMBITS(14) [],
        /// Reload value
        REL OFFSET(16) NUMBITS(16) [],
    ],
    CON1 [
        CLRIRF OFFSET(0) NUMBITS(1) [],
        IR0 OFFSET(2) NUMBITS(1) [],
        /// Disable request
        DR OFFSET(3) NUMBITS(1) [],
    ],
    SR [
        /// Access error status
        AE OFFSET(0) NUMBITS(1) [],
        /// Overflow error status
        OE OFFSET(1) NUMBITS(1) [],
        /// Current timer value
        TIM OFFSET(16) NUMBITS(16) [],
    ],
];

pub const SCU_WDTS_BASE: StaticRef<WdtRegisters> =
    unsafe { StaticRef::new(0xF00362A8 as *const WdtRegisters) };

/// The safety register lock, as consumed by safety-relevant drivers.
///
/// Process-wide mutable state: at most one acquire/release pairing may be in
/// flight at a time. Nesting is supported only as "already disengaged, leave
/// it alone"; there is no reentrant counting. Callers must restore the
/// exact engagement state they observed on entry.
pub trait SafetyLockControl {
    /// Read the live EndInit status bit. Never cache this; another lock
    /// consumer may have changed it.
    fn is_engaged(&self) -> bool;

    /// The password credential for this lock, derived from platform
    /// identity at chip configuration time.
    fn password(&self) -> u16;

    /// Disengage the protection so protected registers accept writes.
    fn disengage(&self, password: u16);

    /// Re-engage the protection.
    fn engage(&self, password: u16);
}

pub struct ScuWdt {
    registers: StaticRef<WdtRegisters>,
}

impl ScuWdt {
    pub const fn new(base: StaticRef<WdtRegisters>) -> ScuWdt {
        ScuWdt { registers: base }
    }
}

impl SafetyLockControl for ScuWdt {
    fn is_engaged(&self) -> bool {
        self.registers.con0.is_set(CON0::ENDINIT)
    }

    fn password(&self) -> u16 {
        self.registers.con0.read(CON0::PW) as u16
    }

    fn disengage(&self, password: u16) {
        let regs = self.registers;
        // Password access: presenting the password with LCK clear opens the
        // modify window. The hardware rejects the write if the password is
        // wrong, leaving ENDINIT engaged.
        regs.con0
            .write(CON0::PW.val(password as u32) + CON0::ENDINIT::SET);
        // Modify access: relock the register with ENDINIT clear.
        regs.con0
            .write(CON0::PW.val(password as u32) + CON0::LCK::SET);
    }

    fn engage(&self, password: u16) {
        let regs = self.registers;
        regs.con0
            .write(CON0::PW.val(password as u32) + CON0::ENDINIT::SET);
        regs.con0.write(
            CON0::PW.val(password as u32) + CON0::LCK::SET + CON0::ENDINIT::SET,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    fn fake_wdt() -> (ScuWdt, *mut u32) {
        let mem = Box::leak(Box::new([0u32; 3]));
        let ptr = mem.as_mut_ptr();
        let wdt = ScuWdt::new(unsafe { StaticRef::new(ptr as *const WdtRegisters) });
        (wdt, ptr)
    }

    #[test]
    fn engage_disengage_round_trip() {
        let (wdt, mem) = fake_wdt();
        // Reset state: locked, engaged, password 0x3c.
        unsafe { mem.write_volatile((0x3c << 2) | 0b11) };
        assert!(wdt.is_engaged());
        assert_eq!(wdt.password(), 0x3c);

        wdt.disengage(0x3c);
        assert!(!wdt.is_engaged());
        // The register must end relocked after the two-write sequence.
        assert_eq!(unsafe { mem.read_volatile() } & 0b10, 0b10);

        wdt.engage(0x3c);
        assert!(wdt.is_engaged());
        assert_eq!(wdt.password(), 0x3c);
    }
}
