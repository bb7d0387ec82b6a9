// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2025.

//! Peripheral implementations for the TC29x TriCore safety MCU family.
//!
//! This crate currently covers the memory test unit (MTU) and the two
//! system peripherals it consumes: the clock control unit divider fields
//! and the safety watchdog EndInit lock.

#![no_std]

pub mod ccu;
pub mod mtu;
pub mod static_ref;
pub mod wdt;

// This is used to run the tests on a host.
#[cfg(test)]
#[macro_use]
extern crate std;
