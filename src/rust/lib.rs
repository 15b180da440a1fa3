// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! User-level fibers.
//!
//! Many fibers are multiplexed onto the kernel thread that creates a [Runtime]. Fibers are scheduled round-robin in
//! creation order. They switch at joins, exits and yield points, and a periodic preemption tick makes busy fibers give
//! the processor away at their next preemption point.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod runtime;
pub mod scheduler;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    runtime::{
        config::{
            Config,
            RuntimeOptions,
        },
        downcast,
        fail::Fail,
        timer::TickSource,
        value,
        Fibers,
        Runtime,
    },
    scheduler::fiber::{
        FiberId,
        FiberStatus,
        FiberValue,
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, bailing out of the enclosing `anyhow::Result` function otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                ::anyhow::ensure!(
                    *left_val == *right_val,
                    "ensure_eq!({}, {}) failed: left={:?} right={:?}",
                    stringify!($left),
                    stringify!($right),
                    left_val,
                    right_val
                );
            },
        }
    }};
}

/// Ensures that two expressions differ, bailing out of the enclosing `anyhow::Result` function otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                ::anyhow::ensure!(
                    *left_val != *right_val,
                    "ensure_neq!({}, {}) failed: left={:?}",
                    stringify!($left),
                    stringify!($right),
                    left_val
                );
            },
        }
    }};
}
