// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Default size for a fiber stack (and for the scheduler stack).
pub const STACK_SIZE_DEFAULT: usize = 64 * 1024;

/// Smallest stack we accept. Below this, logging from a fiber is likely to overflow.
pub const STACK_SIZE_MIN: usize = 16 * 1024;

/// Default preemption quantum, in microseconds.
pub const QUANTUM_US_DEFAULT: u64 = 10_000;

/// Identifier reserved for the root fiber.
pub const ROOT_FIBER_ID: u64 = 0;
