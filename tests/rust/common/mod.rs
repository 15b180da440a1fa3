// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::fiberlib::{
    Fail,
    Runtime,
    RuntimeOptions,
    TickSource,
};
use ::std::time::Duration;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Fiber stack size used by tests. Headroom for test bodies that collect values and format failures.
pub const TEST_STACK_SIZE: usize = 256 * 1024;

/// Preemption quantum used by tests.
pub const TEST_QUANTUM: Duration = Duration::from_millis(2);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Settings used by tests.
pub fn options(tick_source: TickSource) -> RuntimeOptions {
    RuntimeOptions::default()
        .with_stack_size(TEST_STACK_SIZE)
        .with_quantum(TEST_QUANTUM)
        .with_tick_source(tick_source)
}

/// Creates a runtime for tests on the calling thread.
pub fn runtime(tick_source: TickSource) -> Result<Runtime> {
    Ok(Runtime::new(options(tick_source))?)
}

/// Extracts the error code of a failed operation.
#[allow(dead_code)]
pub fn errno<T>(result: Result<T, Fail>) -> Option<i32> {
    result.err().map(|e| e.errno)
}
