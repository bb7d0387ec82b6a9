// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Memory test unit (MTU) driver.
//!
//! The MTU sequences built-in self-test (MBIST) operations over the on-die
//! SRAM banks. Each testable memory has a memory controller register block
//! at a fixed stride from the MTU base; enabling a bank's "shell" routes
//! that memory's port through the test logic, so a shell left enabled by
//! accident diverts ordinary accesses through the test port. Every
//! operation here therefore disables the shell again on all return paths.
//!
//! MEMTEST and the controller start pulses are EndInit-protected. The
//! driver takes the safety lock as an injected [`SafetyLockControl`]
//! capability and restores the exact engagement state observed on entry,
//! on success and failure alike.
//!
//! Scan duration depends on live, reconfigurable clock dividers, so every
//! completion and quiescence poll is bounded by a fresh estimate from
//! [`estimate_wait_cycles`]; a poll that exhausts its budget returns
//! [`MtuError::ScanTimedOut`] instead of spinning forever.

use core::cell::Cell;

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs, LocalRegisterCopy};

use crate::ccu::{ClockDividerSource, ClockDividers};
use crate::static_ref::StaticRef;
use crate::wdt::SafetyLockControl;

/// Number of testable memories, one memory controller block each.
pub const NUM_BANKS: usize = 12;

/// Hardware limit on simultaneously tracked fault addresses per bank.
pub const MAX_TRACKED_ADDRESSES: usize = 4;

/// Capacity of the fill buffer register array, in 16-bit words.
pub const MAX_FILL_WORDS: usize = 64;

/// Fixed completion margin added to every wait estimate, in cycles.
const POLL_MARGIN_CYCLES: u32 = 30;

/// Empirical calibration of the wait estimate against silicon. The model
/// overestimates by roughly this factor; the derivation is not documented
/// and the value must be re-validated when retargeting.
const CALIBRATION_DIVISOR: u32 = 3;

/// Poll budgets are the wait estimate times this, so a timeout means the
/// operation overshot its worst case severalfold, not a tight race.
const TIMEOUT_SAFETY_MULTIPLIER: u32 = 8;

/// Single reads complete in a fixed, shallow scan independent of the
/// bank's tower depth.
const READ_OP_TOWER_DEPTH: u32 = 256;

/// Bound on the module enable handshake, in poll iterations.
const MODULE_ENABLE_BOUND: u32 = 4096;

register_structs! {
    pub McRegisters {
        /// Operation control: start/resume pulses, direction, data init
        (0x00 => mcontrol: ReadWrite<u16, MCONTROL::Register>),
        /// Operation status
        (0x02 => mstatus: ReadOnly<u16, MSTATUS::Register>),
        /// Access count and type
        (0x04 => config0: ReadWrite<u16, CONFIG0::Register>),
        /// Address generation mode
        (0x06 => config1: ReadWrite<u16, CONFIG1::Register>),
        /// Address range bounds and range-enable flag
        (0x08 => range: ReadWrite<u16, RANGE::Register>),
        (0x0A => _reserved0),
        /// Fill/read data buffer, serialized 16 bits per slot
        (0x10 => rdbfl: [ReadWrite<u16>; 64]),
        (0x90 => _reserved1),
        /// ECC safety configuration
        (0xE0 => eccs: ReadWrite<u16, ECCS::Register>),
        /// ECC detection status and tracking validity
        (0xE2 => eccd: ReadWrite<u16, ECCD::Register>),
        /// Error tracking registers
        (0xE4 => etrr: [ReadOnly<u16, ETRR::Register>; 4]),
        (0xEC => _reserved2),
        (0x100 => @END),
    },

    pub MtuRegisters {
        /// Module clock control
        (0x000 => clc: ReadWrite<u32, CLC::Register>),
        (0x004 => _reserved0),
        /// Module identification
        (0x008 => id: ReadOnly<u32>),
        (0x00C => _reserved1),
        /// Shell enable bits, MBIST selectors 0..=31
        (0x010 => memtest0: ReadWrite<u32>),
        /// Shell enable bits, MBIST selectors 32..=63
        (0x014 => memtest1: ReadWrite<u32>),
        /// Shell enable bits, MBIST selectors 64..=95
        (0x018 => memtest2: ReadWrite<u32>),
        (0x01C => _reserved2),
        /// Per-bank memory controller blocks, 0x100 stride
        (0x100 => mc: [McRegisters; 12]),
        (0xD00 => @END),
    }
}

register_bitfields![u32,
    CLC [
        /// Disable request
        DISR OFFSET(0) NUMBITS(1) [],
        /// Disable status
        DISS OFFSET(1) NUMBITS(1) [],
        /// Sleep mode enable control
        EDIS OFFSET(3) NUMBITS(1) [],
    ],
];

register_bitfields![u16,
    MCONTROL [
        /// Start pulse; written high then low to launch an operation
        START OFFSET(0) NUMBITS(1) [],
        RESUME OFFSET(1) NUMBITS(1) [],
        /// Transfer direction of single accesses
        DIR OFFSET(2) NUMBITS(1) [],
        /// Data initialization from the fill buffer
        DINIT OFFSET(3) NUMBITS(1) [],
        /// Uncorrectable-error reporting stays enabled during the test
        USERED OFFSET(14) NUMBITS(1) [],
    ],
    MSTATUS [
        /// Last requested operation has completed
        DONE OFFSET(0) NUMBITS(1) [],
        FDA OFFSET(1) NUMBITS(1) [],
        /// Auto-init scrub pass in progress; manual test access must wait
        AIBUSY OFFSET(3) NUMBITS(1) [],
    ],
    CONFIG0 [
        /// Access type code of the selected algorithm
        ACCSTYPE OFFSET(0) NUMBITS(4) [],
        /// Number of accesses per address
        NUMACCS OFFSET(12) NUMBITS(4) [],
    ],
    CONFIG1 [
        /// Address generation mode; 0 selects linear scrambling
        AG_MOD OFFSET(12) NUMBITS(4) [],
    ],
    RANGE [
        /// Lower address bound
        ADDR_LOW OFFSET(0) NUMBITS(7) [],
        /// Upper address bound
        ADDR_UP OFFSET(7) NUMBITS(8) [],
        /// Range enable; clear to address a single location
        RAEN OFFSET(15) NUMBITS(1) [],
    ],
    ECCS [
        /// Correctable error notification enable
        CENE OFFSET(0) NUMBITS(1) [],
        /// Uncorrectable error notification enable
        SENE OFFSET(1) NUMBITS(1) [],
        /// Error tracking enable
        TRE OFFSET(8) NUMBITS(1) [],
    ],
    ECCD [
        /// Write 1 to clear the tracked addresses
        TRC OFFSET(0) NUMBITS(1) [],
        /// Correctable error detected
        CERR OFFSET(1) NUMBITS(1) [],
        /// Uncorrectable error detected
        UERR OFFSET(2) NUMBITS(1) [],
        /// Validity bits for the tracking registers, one per slot
        VAL OFFSET(12) NUMBITS(4) [],
    ],
    ETRR [
        /// Failing address, test-local
        ADDR OFFSET(0) NUMBITS(13) [],
        /// Memory block interleave index
        MBI OFFSET(13) NUMBITS(3) [],
    ],
];

pub const MTU_BASE: StaticRef<MtuRegisters> =
    unsafe { StaticRef::new(0xF0060000 as *const MtuRegisters) };

/// The testable memories, in memory controller block order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MbistSel {
    Cpu0Dspr = 0,
    Cpu0Pspr = 1,
    Lmu = 2,
    EtherMac = 3,
    Mcan0 = 4,
    Mcan1 = 5,
    ErayObf = 6,
    ErayIbfTbf = 7,
    ErayMbf = 8,
    Emem0 = 9,
    Emem1 = 10,
    Fft0 = 11,
}

/// Clock domain a memory is scanned from. Banks outside the core SRAM
/// domain run the test logic at a different rate, and a wait estimate that
/// ignored this would systematically under- or over-wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimingDomain {
    /// Core SRAM interface clock
    Sri,
    /// Ethernet MAC memory, scaled by the GTM divider
    EtherMac,
    /// CAN controller message RAM; no extra scaling on this silicon
    MCan,
    /// FlexRay buffers, clocked from the ERAY branch
    Eray,
    /// Extended and FFT memories behind the back-bone bus bridge
    Baseband,
}

impl TimingDomain {
    /// Cycles of wait per tower step and instruction, from the live divider
    /// snapshot. FlexRay memories replace the bus ratio with the ERAY
    /// branch ratio rather than scaling it.
    fn instruction_factor(self, dividers: &ClockDividers, num_instructions: u32) -> u32 {
        let spb = dividers.spb.max(1);
        let sri = dividers.sri.max(1);
        match self {
            TimingDomain::Sri | TimingDomain::MCan => (spb / sri) * num_instructions,
            TimingDomain::EtherMac => (spb / sri) * num_instructions * dividers.gtm.max(1),
            TimingDomain::Baseband => (spb / sri) * num_instructions * dividers.bbb.max(1),
            TimingDomain::Eray => (dividers.eray.max(1) / sri) * num_instructions,
        }
    }
}

/// Compiled-in description of one testable memory.
pub struct BankDescriptor {
    /// Logical word width in bits.
    pub data_width: u16,
    /// ECC check bits per word.
    pub ecc_width: u8,
    /// Bit positions, counted from the start of the combined data+ECC
    /// codeword, that must be forced high for an all-zero payload to pass
    /// the ECC check.
    pub ecc_inv_pos: [u16; 2],
    /// Interleaved block repetitions per fill row.
    pub num_blocks: u8,
    /// Tower depth of the memory array; scales scan duration.
    pub tower_depth: u32,
    pub domain: TimingDomain,
}

static SRAM_TABLE: [BankDescriptor; NUM_BANKS] = [
    // Cpu0Dspr
    BankDescriptor {
        data_width: 32,
        ecc_width: 7,
        ecc_inv_pos: [34, 37],
        num_blocks: 4,
        tower_depth: 0x2000,
        domain: TimingDomain::Sri,
    },
    // Cpu0Pspr
    BankDescriptor {
        data_width: 64,
        ecc_width: 8,
        ecc_inv_pos: [66, 69],
        num_blocks: 2,
        tower_depth: 0x1000,
        domain: TimingDomain::Sri,
    },
    // Lmu
    BankDescriptor {
        data_width: 64,
        ecc_width: 8,
        ecc_inv_pos: [64, 71],
        num_blocks: 1,
        tower_depth: 0x0800,
        domain: TimingDomain::Sri,
    },
    // EtherMac
    BankDescriptor {
        data_width: 32,
        ecc_width: 7,
        ecc_inv_pos: [33, 36],
        num_blocks: 1,
        tower_depth: 0x0400,
        domain: TimingDomain::EtherMac,
    },
    // Mcan0
    BankDescriptor {
        data_width: 32,
        ecc_width: 7,
        ecc_inv_pos: [32, 38],
        num_blocks: 1,
        tower_depth: 0x0400,
        domain: TimingDomain::MCan,
    },
    // Mcan1
    BankDescriptor {
        data_width: 32,
        ecc_width: 7,
        ecc_inv_pos: [32, 38],
        num_blocks: 1,
        tower_depth: 0x0400,
        domain: TimingDomain::MCan,
    },
    // ErayObf
    BankDescriptor {
        data_width: 32,
        ecc_width: 7,
        ecc_inv_pos: [34, 36],
        num_blocks: 1,
        tower_depth: 0x0100,
        domain: TimingDomain::Eray,
    },
    // ErayIbfTbf
    BankDescriptor {
        data_width: 32,
        ecc_width: 7,
        ecc_inv_pos: [34, 36],
        num_blocks: 1,
        tower_depth: 0x0100,
        domain: TimingDomain::Eray,
    },
    // ErayMbf
    BankDescriptor {
        data_width: 32,
        ecc_width: 7,
        ecc_inv_pos: [34, 36],
        num_blocks: 2,
        tower_depth: 0x0200,
        domain: TimingDomain::Eray,
    },
    // Emem0
    BankDescriptor {
        data_width: 64,
        ecc_width: 8,
        ecc_inv_pos: [65, 70],
        num_blocks: 1,
        tower_depth: 0x2000,
        domain: TimingDomain::Baseband,
    },
    // Emem1
    BankDescriptor {
        data_width: 64,
        ecc_width: 8,
        ecc_inv_pos: [65, 70],
        num_blocks: 1,
        tower_depth: 0x2000,
        domain: TimingDomain::Baseband,
    },
    // Fft0
    BankDescriptor {
        data_width: 32,
        ecc_width: 7,
        ecc_inv_pos: [33, 37],
        num_blocks: 1,
        tower_depth: 0x0800,
        domain: TimingDomain::Baseband,
    },
];

/// Look up the compiled-in descriptor for a bank.
pub fn sram_descriptor(bank: MbistSel) -> &'static BankDescriptor {
    &SRAM_TABLE[bank as usize]
}

/// Estimate the completion wait for an operation, in cycles.
///
/// Recompute on every use: the result is a pure function of the divider
/// snapshot, and dividers change under clock reconfiguration. Caching an
/// estimate across operations reintroduces the spurious-timeout failures a
/// static bound would have.
pub fn estimate_wait_cycles(
    domain: TimingDomain,
    tower_depth: u32,
    num_instructions: u32,
    dividers: &ClockDividers,
) -> u32 {
    let factor = domain.instruction_factor(dividers, num_instructions);
    let wait = if num_instructions == 4 {
        tower_depth
            .saturating_mul(factor)
            .saturating_add(POLL_MARGIN_CYCLES)
    } else {
        (tower_depth / 4)
            .saturating_mul(factor)
            .saturating_add(POLL_MARGIN_CYCLES)
    };
    wait / CALIBRATION_DIVISOR
}

/// Serialize the fill pattern for an all-zero clear of `desc` into `words`,
/// returning the number of 16-bit slots used.
///
/// Emits `num_blocks` codewords back to back; a block boundary does not
/// align to a slot boundary, so a running bit position is carried across
/// blocks. A trailing partial slot is still emitted, zero padded: the
/// hardware requires every addressed fill-buffer slot to be written.
pub fn zero_codeword_fill(desc: &BankDescriptor, words: &mut [u16; MAX_FILL_WORDS]) -> usize {
    let code_width = desc.data_width as u32 + desc.ecc_width as u32;
    let mut bit_pos: u32 = 0;
    let mut word_ix: usize = 0;
    let mut data: u16 = 0;

    for _ in 0..desc.num_blocks {
        for bit in 0..code_width {
            if bit == desc.ecc_inv_pos[0] as u32 || bit == desc.ecc_inv_pos[1] as u32 {
                data |= 1 << bit_pos;
            }
            bit_pos += 1;

            if bit_pos == 16 {
                words[word_ix] = data;
                word_ix += 1;
                bit_pos = 0;
                data = 0;
            }
        }
    }

    // Trailing partial slot.
    if bit_pos != 0 {
        words[word_ix] = data;
        word_ix += 1;
    }

    word_ix
}

/// One captured fault record from the error tracking registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackedAddress(u16);

impl TrackedAddress {
    pub const fn from_raw(raw: u16) -> TrackedAddress {
        TrackedAddress(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Failing address in the bank's test-local address space.
    pub fn sram_address(self) -> u16 {
        LocalRegisterCopy::<u16, ETRR::Register>::new(self.0).read(ETRR::ADDR)
    }

    /// Interleave index of the failing block.
    pub fn interleave(self) -> u8 {
        LocalRegisterCopy::<u16, ETRR::Register>::new(self.0).read(ETRR::MBI) as u8
    }
}

/// Descramble a tracked fault into the system address space.
///
/// Each supported bank routes its address bits differently between the
/// test port and the bus. Banks without a defined descrambling return 0;
/// callers probe capability this way, so this is a sentinel, not an error.
pub fn system_address(bank: MbistSel, tracked: TrackedAddress) -> u32 {
    let sram_address = tracked.sram_address() as u32;
    let mbi = tracked.interleave() as u32;

    match bank {
        MbistSel::Cpu0Pspr => 0x7010_0000 | (sram_address << 3) | ((mbi & 1) << 2),
        MbistSel::Cpu0Dspr => 0x7000_0000 | (sram_address << 4) | ((mbi & 3) << 2),
        MbistSel::Lmu => 0xB000_0000 | (sram_address << 3),
        _ => 0,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MtuError {
    /// A completion or quiescence poll exhausted its bounded budget. The
    /// bank may be stuck; callers can retry or escalate.
    ScanTimedOut,
}

/// Coarse operation state, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShellState {
    Idle,
    ShellEnabled,
    OperationPending,
    Done,
    Faulted,
}

pub struct Mtu<'a> {
    registers: StaticRef<MtuRegisters>,
    lock: &'a dyn SafetyLockControl,
    clocks: &'a dyn ClockDividerSource,
    state: Cell<ShellState>,
}

impl<'a> Mtu<'a> {
    pub const fn new(
        base: StaticRef<MtuRegisters>,
        lock: &'a dyn SafetyLockControl,
        clocks: &'a dyn ClockDividerSource,
    ) -> Mtu<'a> {
        Mtu {
            registers: base,
            lock,
            clocks,
            state: Cell::new(ShellState::Idle),
        }
    }

    pub fn shell_state(&self) -> ShellState {
        self.state.get()
    }

    /// Enable the MTU module clock.
    pub fn enable_module(&self) -> Result<(), MtuError> {
        self.with_safety_unlocked(|| {
            self.registers.clc.write(CLC::DISR::CLEAR);
            let mut budget = MODULE_ENABLE_BOUND;
            loop {
                if !self.registers.clc.is_set(CLC::DISS) {
                    return Ok(());
                }
                if budget == 0 {
                    return Err(MtuError::ScanTimedOut);
                }
                budget -= 1;
                core::hint::spin_loop();
            }
        })
    }

    pub fn is_module_enabled(&self) -> bool {
        !self.registers.clc.is_set(CLC::DISS)
    }

    /// Route `bank` through the test shell.
    ///
    /// Waits for any in-flight auto-init scrub to quiesce before returning.
    /// If the scrub never quiesces the enable is rolled back, so a timeout
    /// never leaks an enabled shell.
    pub fn enable_shell(&self, bank: MbistSel) -> Result<(), MtuError> {
        self.with_safety_unlocked(|| {
            self.set_shell_bit(bank, true);
            match self.wait_for_auto_init_idle(bank) {
                Ok(()) => {
                    self.state.set(ShellState::ShellEnabled);
                    Ok(())
                }
                Err(e) => {
                    self.set_shell_bit(bank, false);
                    self.state.set(ShellState::Faulted);
                    Err(e)
                }
            }
        })
    }

    /// Hand `bank` back to functional operation.
    pub fn disable_shell(&self, bank: MbistSel) -> Result<(), MtuError> {
        self.with_safety_unlocked(|| {
            self.set_shell_bit(bank, false);
            match self.wait_for_auto_init_idle(bank) {
                Ok(()) => {
                    self.state.set(ShellState::Idle);
                    Ok(())
                }
                Err(e) => {
                    self.state.set(ShellState::Faulted);
                    Err(e)
                }
            }
        })
    }

    /// Clear `bank` to all-zero data with valid ECC.
    ///
    /// Destructive. The register-level setup and teardown run under the
    /// safety lock; the completion poll runs outside it so the lock is
    /// never held across a bounded-but-long wait.
    pub fn clear_sram(&self, bank: MbistSel) -> Result<(), MtuError> {
        self.with_safety_unlocked(|| -> Result<(), MtuError> {
            self.enable_shell(bank)?;
            self.load_zero_fill(bank);
            self.start_fill(bank);
            Ok(())
        })?;

        let done = self.wait_for_mbist_done(bank, 1);

        // Teardown also runs on the timeout path: a leaked enabled shell
        // diverts subsequent accesses through the test port.
        let cleanup = self.with_safety_unlocked(|| self.clear_sram_continue(bank));

        let result = done.and(cleanup);
        if result.is_err() {
            self.state.set(ShellState::Faulted);
        }
        result
    }

    /// Read one address of `bank` through the test port. The shell must be
    /// enabled.
    pub fn read_sram_address(&self, bank: MbistSel, sram_address: u16) -> Result<(), MtuError> {
        let mc = self.mc(bank);

        mc.mcontrol
            .write(MCONTROL::USERED::SET + MCONTROL::DIR::SET);
        // 1 read access
        mc.config0
            .write(CONFIG0::NUMACCS.val(1) + CONFIG0::ACCSTYPE.val(1));
        // linear scrambling
        mc.config1.set(0);
        // single location, RAEN clear
        mc.range.set(sram_address);

        mc.mcontrol
            .write(MCONTROL::USERED::SET + MCONTROL::DIR::SET + MCONTROL::START::SET);
        mc.mcontrol
            .write(MCONTROL::USERED::SET + MCONTROL::DIR::SET);
        self.state.set(ShellState::OperationPending);

        let result = self.wait_done_with_depth(bank, READ_OP_TOWER_DEPTH, 1);
        if result.is_err() {
            self.state.set(ShellState::Faulted);
        }
        result
    }

    /// Write one address of `bank` through the test port. The shell must be
    /// enabled.
    pub fn write_sram_address(&self, bank: MbistSel, sram_address: u16) -> Result<(), MtuError> {
        self.with_safety_unlocked(|| {
            let mc = self.mc(bank);

            mc.mcontrol
                .write(MCONTROL::USERED::SET + MCONTROL::DIR::SET);
            // 1 write access
            mc.config0
                .write(CONFIG0::NUMACCS.val(1) + CONFIG0::ACCSTYPE.val(0));
            mc.config1.set(0);
            mc.range.set(sram_address);

            mc.mcontrol
                .write(MCONTROL::USERED::SET + MCONTROL::DIR::SET + MCONTROL::START::SET);
            mc.mcontrol
                .write(MCONTROL::USERED::SET + MCONTROL::DIR::SET);
            self.state.set(ShellState::OperationPending);
        });

        // Poll after the lock state is restored.
        let result = self.wait_for_mbist_done(bank, 1);
        if result.is_err() {
            self.state.set(ShellState::Faulted);
        }
        result
    }

    /// Run the non-destructive inversion test over `bank`.
    ///
    /// Reads every covered address, inverts, verifies and restores it; the
    /// memory content survives. Returns the first tracked fault record if
    /// the error flags assert, `None` on a clean pass. A fault here is an
    /// expected diagnostic outcome, not a driver failure.
    pub fn run_inversion_test(
        &self,
        bank: MbistSel,
        range_select: bool,
        range_up: u8,
        range_low: u8,
    ) -> Result<Option<TrackedAddress>, MtuError> {
        self.with_safety_unlocked(|| -> Result<(), MtuError> {
            self.enable_shell(bank)?;

            let mc = self.mc(bank);
            // NUMACCS=4, ACCSTYPE=5: read, invert-write, read, restore-write
            mc.config0
                .write(CONFIG0::NUMACCS.val(4) + CONFIG0::ACCSTYPE.val(5));
            mc.config1.write(CONFIG1::AG_MOD.val(5));
            mc.range.write(
                RANGE::RAEN.val(u16::from(range_select))
                    + RANGE::ADDR_UP.val(range_up as u16)
                    + RANGE::ADDR_LOW.val(range_low as u16),
            );

            // DIR must stay clear for this access type (erratum MTU_TC.007).
            mc.mcontrol
                .write(MCONTROL::USERED::SET + MCONTROL::START::SET);
            mc.mcontrol.modify(MCONTROL::START::CLEAR);
            self.state.set(ShellState::OperationPending);
            Ok(())
        })?;

        let done = self.wait_for_mbist_done(bank, 4);

        let outcome = self.with_safety_unlocked(|| -> Result<Option<TrackedAddress>, MtuError> {
            let record = if self.check_error_flags(bank) {
                Some(TrackedAddress::from_raw(self.mc(bank).etrr[0].get()))
            } else {
                None
            };
            self.disable_shell(bank)?;
            Ok(record)
        });

        match (done, outcome) {
            (Ok(()), Ok(record)) => Ok(record),
            (Err(e), _) | (_, Err(e)) => {
                self.state.set(ShellState::Faulted);
                Err(e)
            }
        }
    }

    /// True if the last scan flagged an ECC error on `bank`.
    pub fn check_error_flags(&self, bank: MbistSel) -> bool {
        let eccd = &self.mc(bank).eccd;
        eccd.is_set(ECCD::CERR) || eccd.is_set(ECCD::UERR)
    }

    pub fn enable_error_tracking(&self, bank: MbistSel, enable: bool) {
        let eccs = &self.mc(bank).eccs;
        if enable {
            eccs.modify(ECCS::TRE::SET);
        } else {
            eccs.modify(ECCS::TRE::CLEAR);
        }
    }

    /// Invalidate all tracked fault addresses on `bank`.
    pub fn clear_error_tracking(&self, bank: MbistSel) {
        self.mc(bank).eccd.modify(ECCD::TRC::SET);
    }

    /// Copy the valid tracked fault records of `bank` into `out`, in
    /// ascending slot order, returning how many were populated. Slots
    /// beyond the returned count are untouched; there is no terminator.
    pub fn tracked_sram_addresses(
        &self,
        bank: MbistSel,
        out: &mut [TrackedAddress; MAX_TRACKED_ADDRESSES],
    ) -> usize {
        let mc = self.mc(bank);
        let valid = mc.eccd.read(ECCD::VAL);
        let mut count = 0;

        for slot in 0..MAX_TRACKED_ADDRESSES {
            if valid & (1 << slot) != 0 {
                out[count] = TrackedAddress::from_raw(mc.etrr[slot].get());
                count += 1;
            }
        }

        count
    }

    fn mc(&self, bank: MbistSel) -> &McRegisters {
        &self.registers.mc[bank as usize]
    }

    fn set_shell_bit(&self, bank: MbistSel, enable: bool) {
        let index = bank as usize;
        let regs = self.registers;
        let memtest = match index / 32 {
            0 => &regs.memtest0,
            1 => &regs.memtest1,
            _ => &regs.memtest2,
        };
        let mask = 1u32 << (index % 32);
        if enable {
            memtest.set(memtest.get() | mask);
        } else {
            memtest.set(memtest.get() & !mask);
        }
    }

    /// Run `body` with the safety lock disengaged, restoring the exact
    /// engagement state observed on entry on every return path. A lock the
    /// caller intentionally left open is never re-engaged here.
    fn with_safety_unlocked<R>(&self, body: impl FnOnce() -> R) -> R {
        let was_engaged = self.lock.is_engaged();

        if was_engaged {
            self.lock.disengage(self.lock.password());
            if self.lock.is_engaged() {
                // The password is a compiled-in platform constant; rejection
                // means the safety configuration is wrong, and continuing
                // would run an assumed-unlocked sequence against locked
                // registers.
                panic!("MTU: safety lock password rejected");
            }
        }

        let result = body();

        if was_engaged {
            self.lock.engage(self.lock.password());
        }

        result
    }

    fn load_zero_fill(&self, bank: MbistSel) {
        let desc = sram_descriptor(bank);
        let mut words = [0u16; MAX_FILL_WORDS];
        let count = zero_codeword_fill(desc, &mut words);

        let mc = self.mc(bank);
        for (slot, word) in words[..count].iter().enumerate() {
            mc.rdbfl[slot].set(*word);
        }
    }

    fn start_fill(&self, bank: MbistSel) {
        let mc = self.mc(bank);
        mc.mcontrol
            .write(MCONTROL::USERED::SET + MCONTROL::DINIT::SET + MCONTROL::START::SET);
        mc.mcontrol
            .write(MCONTROL::USERED::SET + MCONTROL::DINIT::SET);
        self.state.set(ShellState::OperationPending);
    }

    fn clear_sram_continue(&self, bank: MbistSel) -> Result<(), MtuError> {
        // Dummy access so the memory output latches valid data before the
        // error flags can be trusted.
        let read = self.read_sram_address(bank, 0x0000);
        let disabled = self.disable_shell(bank);
        read.and(disabled)
    }

    fn poll_budget(&self, bank: MbistSel, tower_depth: u32, num_instructions: u32) -> u32 {
        let desc = sram_descriptor(bank);
        estimate_wait_cycles(
            desc.domain,
            tower_depth,
            num_instructions,
            &self.clocks.dividers(),
        )
        .saturating_mul(TIMEOUT_SAFETY_MULTIPLIER)
    }

    fn wait_for_mbist_done(&self, bank: MbistSel, num_instructions: u32) -> Result<(), MtuError> {
        self.wait_done_with_depth(bank, sram_descriptor(bank).tower_depth, num_instructions)
    }

    fn wait_done_with_depth(
        &self,
        bank: MbistSel,
        tower_depth: u32,
        num_instructions: u32,
    ) -> Result<(), MtuError> {
        let mc = self.mc(bank);
        let mut budget = self.poll_budget(bank, tower_depth, num_instructions);
        loop {
            if mc.mstatus.is_set(MSTATUS::DONE) {
                self.state.set(ShellState::Done);
                return Ok(());
            }
            if budget == 0 {
                return Err(MtuError::ScanTimedOut);
            }
            budget -= 1;
            core::hint::spin_loop();
        }
    }

    /// Wait for the background auto-init scrub on `bank` to go idle.
    fn wait_for_auto_init_idle(&self, bank: MbistSel) -> Result<(), MtuError> {
        let mc = self.mc(bank);
        let mut budget = self.poll_budget(bank, sram_descriptor(bank).tower_depth, 1);
        loop {
            if !mc.mstatus.is_set(MSTATUS::AIBUSY) {
                return Ok(());
            }
            if budget == 0 {
                return Err(MtuError::ScanTimedOut);
            }
            budget -= 1;
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccu::{ClockDividerSource, ClockDividers};
    use crate::wdt::SafetyLockControl;
    use core::cell::Cell;
    use std::boxed::Box;

    // Byte offsets into the fake register memory, bank Cpu0Dspr (block 0).
    const MEMTEST0: usize = 0x010;
    const MC0: usize = 0x100;
    const MC0_MCONTROL: usize = MC0;
    const MC0_MSTATUS: usize = MC0 + 0x02;
    const MC0_CONFIG0: usize = MC0 + 0x04;
    const MC0_CONFIG1: usize = MC0 + 0x06;
    const MC0_RANGE: usize = MC0 + 0x08;
    const MC0_RDBFL: usize = MC0 + 0x10;
    const MC0_ECCD: usize = MC0 + 0xE2;
    const MC0_ETRR: usize = MC0 + 0xE4;

    const DONE: u16 = 1 << 0;
    const AIBUSY: u16 = 1 << 3;

    const DIVIDERS: ClockDividers = ClockDividers {
        spb: 2,
        sri: 1,
        mcan: 1,
        gtm: 1,
        eray: 1,
        bbb: 1,
    };

    fn fake_registers() -> (*mut u32, StaticRef<MtuRegisters>) {
        let mem = Box::leak(Box::new([0u32; 0xD00 / 4]));
        let ptr = mem.as_mut_ptr();
        (ptr, unsafe { StaticRef::new(ptr as *const MtuRegisters) })
    }

    fn poke16(mem: *mut u32, offset: usize, value: u16) {
        unsafe { (mem as *mut u16).add(offset / 2).write_volatile(value) }
    }

    fn peek16(mem: *mut u32, offset: usize) -> u16 {
        unsafe { (mem as *mut u16).add(offset / 2).read_volatile() }
    }

    fn peek32(mem: *mut u32, offset: usize) -> u32 {
        unsafe { mem.add(offset / 4).read_volatile() }
    }

    struct FakeClocks(ClockDividers);

    impl ClockDividerSource for FakeClocks {
        fn dividers(&self) -> ClockDividers {
            self.0
        }
    }

    /// Fake lock that records pairing instead of touching hardware.
    struct FakeLock {
        engaged: Cell<bool>,
        disengages: Cell<usize>,
        engages: Cell<usize>,
        reject_password: bool,
    }

    impl FakeLock {
        fn new(engaged: bool) -> FakeLock {
            FakeLock {
                engaged: Cell::new(engaged),
                disengages: Cell::new(0),
                engages: Cell::new(0),
                reject_password: false,
            }
        }

        fn rejecting() -> FakeLock {
            FakeLock {
                reject_password: true,
                ..FakeLock::new(true)
            }
        }
    }

    impl SafetyLockControl for FakeLock {
        fn is_engaged(&self) -> bool {
            self.engaged.get()
        }

        fn password(&self) -> u16 {
            0x003C
        }

        fn disengage(&self, _password: u16) {
            if !self.reject_password {
                self.engaged.set(false);
            }
            self.disengages.set(self.disengages.get() + 1);
        }

        fn engage(&self, _password: u16) {
            self.engaged.set(true);
            self.engages.set(self.engages.get() + 1);
        }
    }

    fn descriptor(
        data_width: u16,
        ecc_width: u8,
        ecc_inv_pos: [u16; 2],
        num_blocks: u8,
    ) -> BankDescriptor {
        BankDescriptor {
            data_width,
            ecc_width,
            ecc_inv_pos,
            num_blocks,
            tower_depth: 0x100,
            domain: TimingDomain::Sri,
        }
    }

    #[test]
    fn fill_sets_inversion_bits_and_pads_final_word() {
        let desc = descriptor(32, 7, [2, 5], 1);
        let mut words = [0u16; MAX_FILL_WORDS];
        let count = zero_codeword_fill(&desc, &mut words);

        // 39 bits serialize into three slots, the last two zero padded.
        assert_eq!(count, 3);
        assert_eq!(words[0], 0x0024);
        assert_eq!(words[1], 0x0000);
        assert_eq!(words[2], 0x0000);
    }

    #[test]
    fn fill_single_word_codeword() {
        let desc = descriptor(9, 7, [11, 14], 1);
        let mut words = [0u16; MAX_FILL_WORDS];
        let count = zero_codeword_fill(&desc, &mut words);

        assert_eq!(count, 1);
        assert_eq!(words[0], (1 << 11) | (1 << 14));
    }

    #[test]
    fn fill_carries_bit_position_across_blocks() {
        let desc = descriptor(32, 7, [34, 37], 2);
        let mut words = [0u16; MAX_FILL_WORDS];
        let count = zero_codeword_fill(&desc, &mut words);

        // 78 bits -> 5 slots. Block 0 sets bits 34/37 (slot 2), block 1
        // sets bits 73/76 (slot 4).
        assert_eq!(count, 5);
        assert_eq!(words[0], 0x0000);
        assert_eq!(words[1], 0x0000);
        assert_eq!(words[2], 0x0024);
        assert_eq!(words[3], 0x0000);
        assert_eq!(words[4], 0x1200);
    }

    #[test]
    fn fill_matches_expected_count_for_every_bank() {
        let banks = [
            MbistSel::Cpu0Dspr,
            MbistSel::Cpu0Pspr,
            MbistSel::Lmu,
            MbistSel::EtherMac,
            MbistSel::Mcan0,
            MbistSel::Mcan1,
            MbistSel::ErayObf,
            MbistSel::ErayIbfTbf,
            MbistSel::ErayMbf,
            MbistSel::Emem0,
            MbistSel::Emem1,
            MbistSel::Fft0,
        ];
        for bank in banks {
            let desc = sram_descriptor(bank);
            let mut words = [0u16; MAX_FILL_WORDS];
            let count = zero_codeword_fill(desc, &mut words);

            let total_bits =
                desc.num_blocks as usize * (desc.data_width as usize + desc.ecc_width as usize);
            assert_eq!(count, (total_bits + 15) / 16);
            assert!(count <= MAX_FILL_WORDS);

            // Exactly two forced-high bits per block, at the inversion
            // positions.
            let bit = |pos: usize| words[pos / 16] >> (pos % 16) & 1;
            let code_width = desc.data_width as usize + desc.ecc_width as usize;
            let mut ones = 0u32;
            for word in &words[..count] {
                ones += word.count_ones();
            }
            assert_eq!(ones, 2 * desc.num_blocks as u32);
            for block in 0..desc.num_blocks as usize {
                assert_eq!(bit(block * code_width + desc.ecc_inv_pos[0] as usize), 1);
                assert_eq!(bit(block * code_width + desc.ecc_inv_pos[1] as usize), 1);
            }
        }
    }

    #[test]
    fn wait_cycles_monotonic_in_tower_depth() {
        for num_instructions in [1, 4] {
            let mut last = 0;
            for depth in [0, 64, 1024, 8192, 0x2_0000] {
                let estimate =
                    estimate_wait_cycles(TimingDomain::Sri, depth, num_instructions, &DIVIDERS);
                assert!(estimate >= last);
                last = estimate;
            }
        }
    }

    #[test]
    fn wait_cycles_four_instruction_form() {
        let dividers = ClockDividers {
            spb: 4,
            sri: 2,
            ..DIVIDERS
        };
        // factor = (4/2) * 4
        assert_eq!(
            estimate_wait_cycles(TimingDomain::Sri, 1000, 4, &dividers),
            (1000 * 8 + 30) / 3
        );
        // Single-instruction variant walks a quarter of the tower.
        assert_eq!(
            estimate_wait_cycles(TimingDomain::Sri, 1000, 1, &dividers),
            ((1000 / 4) * 2 + 30) / 3
        );
    }

    #[test]
    fn wait_cycles_domain_multipliers() {
        let dividers = ClockDividers {
            spb: 2,
            sri: 1,
            mcan: 7,
            gtm: 3,
            eray: 6,
            bbb: 5,
        };
        let base = estimate_wait_cycles(TimingDomain::Sri, 4096, 4, &dividers);

        // Ethernet MAC memory scales by the GTM divider.
        assert_eq!(
            estimate_wait_cycles(TimingDomain::EtherMac, 4096, 4, &dividers),
            (4096 * (2 * 4 * 3) + 30) / 3
        );
        // Extended/FFT memories scale by the back-bone bus divider.
        assert_eq!(
            estimate_wait_cycles(TimingDomain::Baseband, 4096, 4, &dividers),
            (4096 * (2 * 4 * 5) + 30) / 3
        );
        // CAN memories take no extra multiplier on this silicon.
        assert_eq!(
            estimate_wait_cycles(TimingDomain::MCan, 4096, 4, &dividers),
            base
        );
        // FlexRay replaces the bus ratio with the ERAY branch ratio.
        let eray = estimate_wait_cycles(TimingDomain::Eray, 4096, 4, &dividers);
        assert_eq!(eray, (4096 * (6 * 4) + 30) / 3);
        let faster_spb = ClockDividers {
            spb: 8,
            ..dividers
        };
        assert_eq!(
            estimate_wait_cycles(TimingDomain::Eray, 4096, 4, &faster_spb),
            eray
        );
    }

    #[test]
    fn system_address_descrambles_supported_banks() {
        // ADDR=0x10, MBI=1
        let pspr = TrackedAddress::from_raw((1 << 13) | 0x10);
        assert_eq!(system_address(MbistSel::Cpu0Pspr, pspr), 0x7010_0084);

        // ADDR=1, MBI=2
        let dspr = TrackedAddress::from_raw((2 << 13) | 0x01);
        assert_eq!(system_address(MbistSel::Cpu0Dspr, dspr), 0x7000_0018);

        let lmu = TrackedAddress::from_raw(0x20);
        assert_eq!(system_address(MbistSel::Lmu, lmu), 0xB000_0100);
    }

    #[test]
    fn system_address_is_zero_for_unsupported_banks() {
        let tracked = TrackedAddress::from_raw(0x1234);
        assert_eq!(system_address(MbistSel::EtherMac, tracked), 0);
        assert_eq!(system_address(MbistSel::Emem0, tracked), 0);
    }

    #[test]
    fn clear_sram_restores_engaged_lock_and_disables_shell() {
        let (mem, registers) = fake_registers();
        let lock = FakeLock::new(true);
        let clocks = FakeClocks(DIVIDERS);
        let mtu = Mtu::new(registers, &lock, &clocks);

        // Completion latches immediately in the fake block.
        poke16(mem, MC0_MSTATUS, DONE);

        assert_eq!(mtu.clear_sram(MbistSel::Cpu0Dspr), Ok(()));

        // Shell handed back, lock state as found, one release per acquire.
        assert_eq!(peek32(mem, MEMTEST0), 0);
        assert!(lock.is_engaged());
        assert_eq!(lock.disengages.get(), lock.engages.get());
        assert_eq!(lock.disengages.get(), 2);
        assert_eq!(mtu.shell_state(), ShellState::Idle);

        // The fill pattern for Cpu0Dspr: 4 blocks of 32+7 bits, inversion
        // positions 34/37 of each codeword.
        assert_eq!(peek16(mem, MC0_RDBFL), 0x0000);
        assert_eq!(peek16(mem, MC0_RDBFL + 2 * 2), 0x0024);
        assert_eq!(peek16(mem, MC0_RDBFL + 4 * 2), 0x1200);
        assert_eq!(peek16(mem, MC0_RDBFL + 7 * 2), 0x0009);
        assert_eq!(peek16(mem, MC0_RDBFL + 9 * 2), 0x0480);
    }

    #[test]
    fn clear_sram_leaves_open_lock_open() {
        let (mem, registers) = fake_registers();
        let lock = FakeLock::new(false);
        let clocks = FakeClocks(DIVIDERS);
        let mtu = Mtu::new(registers, &lock, &clocks);

        poke16(mem, MC0_MSTATUS, DONE);

        assert_eq!(mtu.clear_sram(MbistSel::Cpu0Dspr), Ok(()));
        // A lock the caller left open is not re-engaged.
        assert!(!lock.is_engaged());
        assert_eq!(lock.disengages.get(), 0);
        assert_eq!(lock.engages.get(), 0);
    }

    #[test]
    fn clear_sram_timeout_still_cleans_up() {
        let (mem, registers) = fake_registers();
        let lock = FakeLock::new(true);
        let clocks = FakeClocks(DIVIDERS);
        let mtu = Mtu::new(registers, &lock, &clocks);

        // DONE never asserts.
        assert_eq!(
            mtu.clear_sram(MbistSel::Cpu0Dspr),
            Err(MtuError::ScanTimedOut)
        );

        assert_eq!(peek32(mem, MEMTEST0), 0);
        assert!(lock.is_engaged());
        assert_eq!(lock.disengages.get(), lock.engages.get());
        assert_eq!(mtu.shell_state(), ShellState::Faulted);
    }

    #[test]
    fn enable_shell_times_out_on_stuck_auto_init() {
        let (mem, registers) = fake_registers();
        let lock = FakeLock::new(true);
        let clocks = FakeClocks(DIVIDERS);
        let mtu = Mtu::new(registers, &lock, &clocks);

        poke16(mem, MC0_MSTATUS, AIBUSY);

        assert_eq!(
            mtu.enable_shell(MbistSel::Cpu0Dspr),
            Err(MtuError::ScanTimedOut)
        );
        // The enable is rolled back rather than leaking a half-open shell.
        assert_eq!(peek32(mem, MEMTEST0), 0);
        assert!(lock.is_engaged());
        assert_eq!(mtu.shell_state(), ShellState::Faulted);
    }

    #[test]
    fn enable_module_reports_clock_status() {
        let (_mem, registers) = fake_registers();
        let lock = FakeLock::new(true);
        let clocks = FakeClocks(DIVIDERS);
        let mtu = Mtu::new(registers, &lock, &clocks);

        assert_eq!(mtu.enable_module(), Ok(()));
        assert!(mtu.is_module_enabled());
        assert!(lock.is_engaged());
    }

    #[test]
    fn read_sram_address_configures_single_access() {
        let (mem, registers) = fake_registers();
        let lock = FakeLock::new(true);
        let clocks = FakeClocks(DIVIDERS);
        let mtu = Mtu::new(registers, &lock, &clocks);

        poke16(mem, MC0_MSTATUS, DONE);

        assert_eq!(mtu.read_sram_address(MbistSel::Cpu0Dspr, 0x0123), Ok(()));
        // NUMACCS=1, ACCSTYPE=1 (read), linear scrambling, RAEN clear.
        assert_eq!(peek16(mem, MC0_CONFIG0), 0x1001);
        assert_eq!(peek16(mem, MC0_CONFIG1), 0x0000);
        assert_eq!(peek16(mem, MC0_RANGE), 0x0123);
        // The read path needs no lock handling at all.
        assert_eq!(lock.disengages.get(), 0);
    }

    #[test]
    fn write_sram_address_times_out_without_done() {
        let (_mem, registers) = fake_registers();
        let lock = FakeLock::new(true);
        let clocks = FakeClocks(DIVIDERS);
        let mtu = Mtu::new(registers, &lock, &clocks);

        assert_eq!(
            mtu.write_sram_address(MbistSel::Cpu0Dspr, 0x0040),
            Err(MtuError::ScanTimedOut)
        );
        assert!(lock.is_engaged());
        assert_eq!(lock.disengages.get(), lock.engages.get());
    }

    #[test]
    fn inversion_test_reports_first_tracked_record() {
        let (mem, registers) = fake_registers();
        let lock = FakeLock::new(true);
        let clocks = FakeClocks(DIVIDERS);
        let mtu = Mtu::new(registers, &lock, &clocks);

        poke16(mem, MC0_MSTATUS, DONE);
        // CERR flagged, first tracking register holds the fault.
        poke16(mem, MC0_ECCD, 1 << 1);
        poke16(mem, MC0_ETRR, 0x2468);

        let outcome = mtu.run_inversion_test(MbistSel::Cpu0Dspr, true, 0x7F, 0x00);
        assert_eq!(outcome, Ok(Some(TrackedAddress::from_raw(0x2468))));

        // NUMACCS=4/ACCSTYPE=5, AG_MOD=5, range composed, DIR left clear.
        assert_eq!(peek16(mem, MC0_CONFIG0), 0x4005);
        assert_eq!(peek16(mem, MC0_CONFIG1), 0x5000);
        assert_eq!(peek16(mem, MC0_RANGE), 0xBF80);
        assert_eq!(peek16(mem, MC0_MCONTROL), 0x4000);

        assert_eq!(peek32(mem, MEMTEST0), 0);
        assert!(lock.is_engaged());
        assert_eq!(lock.disengages.get(), lock.engages.get());
    }

    #[test]
    fn inversion_test_clean_pass_returns_none() {
        let (mem, registers) = fake_registers();
        let lock = FakeLock::new(false);
        let clocks = FakeClocks(DIVIDERS);
        let mtu = Mtu::new(registers, &lock, &clocks);

        poke16(mem, MC0_MSTATUS, DONE);

        let outcome = mtu.run_inversion_test(MbistSel::Cpu0Dspr, false, 0x00, 0x00);
        assert_eq!(outcome, Ok(None));
        assert!(!lock.is_engaged());
        assert_eq!(lock.engages.get(), 0);
    }

    #[test]
    fn tracked_addresses_follow_validity_mask() {
        let (mem, registers) = fake_registers();
        let lock = FakeLock::new(true);
        let clocks = FakeClocks(DIVIDERS);
        let mtu = Mtu::new(registers, &lock, &clocks);

        // Slots 0 and 2 valid.
        poke16(mem, MC0_ECCD, 0b0101 << 12);
        poke16(mem, MC0_ETRR, 0x0123);
        poke16(mem, MC0_ETRR + 2 * 2, 0x0456);

        let mut out = [TrackedAddress::from_raw(0); MAX_TRACKED_ADDRESSES];
        let count = mtu.tracked_sram_addresses(MbistSel::Cpu0Dspr, &mut out);

        assert_eq!(count, 2);
        assert_eq!(out[0].raw(), 0x0123);
        assert_eq!(out[1].raw(), 0x0456);
    }

    #[test]
    fn tracked_address_splits_fields() {
        let tracked = TrackedAddress::from_raw((0b101 << 13) | 0x1FFF);
        assert_eq!(tracked.sram_address(), 0x1FFF);
        assert_eq!(tracked.interleave(), 0b101);
    }

    #[test]
    #[should_panic(expected = "password rejected")]
    fn rejected_password_is_fatal() {
        let (mem, registers) = fake_registers();
        let lock = FakeLock::rejecting();
        let clocks = FakeClocks(DIVIDERS);
        let mtu = Mtu::new(registers, &lock, &clocks);

        poke16(mem, MC0_MSTATUS, DONE);
        let _ = mtu.clear_sram(MbistSel::Cpu0Dspr);
    }
}
