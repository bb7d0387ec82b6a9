// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Clock control unit driver.
//!
//! Only the divider fields consumed by the memory test unit are exposed.
//! The dividers are live, reconfigurable hardware state: consumers must
//! read a fresh [`ClockDividers`] snapshot for every timing decision and
//! never cache one across operations.

use tock_registers::interfaces::Readable;
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

use crate::static_ref::StaticRef;

register_structs! {
    pub CcuRegisters {
        /// Clock control register 0, core divider tree
        (0x00 => ccucon0: ReadWrite<u32, CCUCON0::Register>),
        /// Clock control register 1, peripheral domain dividers
        (0x04 => ccucon1: ReadWrite<u32, CCUCON1::Register>),
        /// Clock control register 2, back-bone bus divider
        (0x08 => ccucon2: ReadWrite<u32, CCUCON2::Register>),
        (0x0C => @END),
    }
}

register_bitfields![u32,
    CCUCON0 [
        BAUD1DIV OFFSET(0) NUMBITS(4) [],
        BAUD2DIV OFFSET(4) NUMBITS(4) [],
        /// SRAM interface clock divider
        SRIDIV OFFSET(8) NUMBITS(4) [],
        LPDIV OFFSET(12) NUMBITS(4) [],
        /// System peripheral bus divider
        SPBDIV OFFSET(16) NUMBITS(4) [],
        FSI2DIV OFFSET(20) NUMBITS(2) [],
        FSIDIV OFFSET(24) NUMBITS(2) [],
        CLKSEL OFFSET(28) NUMBITS(2) [],
        /// Update request, transfers the divider writes to the clock tree
        UP OFFSET(30) NUMBITS(1) [],
    ],
    CCUCON1 [
        /// CAN controller memory clock divider
        MCANDIV OFFSET(0) NUMBITS(4) [],
        CLKSELMCAN OFFSET(4) NUMBITS(2) [],
        STMDIV OFFSET(8) NUMBITS(4) [],
        /// Generic timer module divider, also feeds the Ethernet MAC memory
        GTMDIV OFFSET(12) NUMBITS(4) [],
        /// FlexRay communication controller divider
        ERAYDIV OFFSET(16) NUMBITS(4) [],
        UP OFFSET(30) NUMBITS(1) [],
    ],
    CCUCON2 [
        /// Back-bone bus divider, clocks the extended and FFT memories
        BBBDIV OFFSET(0) NUMBITS(4) [],
        UP OFFSET(30) NUMBITS(1) [],
    ],
];

pub const SCU_CCU_BASE: StaticRef<CcuRegisters> =
    unsafe { StaticRef::new(0xF0036030 as *const CcuRegisters) };

/// Snapshot of the divider fields relevant to memory test timing.
///
/// A divider field of 0 means the corresponding clock is stopped; ratio
/// computations clamp each field to at least 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockDividers {
    pub spb: u32,
    pub sri: u32,
    pub mcan: u32,
    pub gtm: u32,
    pub eray: u32,
    pub bbb: u32,
}

/// Source of live clock divider values.
///
/// Injected into consumers (rather than read through a global) so tests can
/// substitute fixed ratios without touching hardware.
pub trait ClockDividerSource {
    /// Read the current divider configuration. Implementations must return
    /// live values on every call; dividers change under reconfiguration.
    fn dividers(&self) -> ClockDividers;
}

pub struct ScuCcu {
    registers: StaticRef<CcuRegisters>,
}

impl ScuCcu {
    pub const fn new(base: StaticRef<CcuRegisters>) -> ScuCcu {
        ScuCcu { registers: base }
    }
}

impl ClockDividerSource for ScuCcu {
    fn dividers(&self) -> ClockDividers {
        let regs = self.registers;
        ClockDividers {
            spb: regs.ccucon0.read(CCUCON0::SPBDIV),
            sri: regs.ccucon0.read(CCUCON0::SRIDIV),
            mcan: regs.ccucon1.read(CCUCON1::MCANDIV),
            gtm: regs.ccucon1.read(CCUCON1::GTMDIV),
            eray: regs.ccucon1.read(CCUCON1::ERAYDIV),
            bbb: regs.ccucon2.read(CCUCON2::BBBDIV),
        }
    }
}
