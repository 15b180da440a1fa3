// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Saved execution contexts.
//!
//! This is the only module that touches raw machine state. It wraps the host `ucontext` primitives behind three
//! operations: capture the current state, replace the current state (never returns), and save-and-switch (returns
//! when something switches back). Each fiber context owns a fixed-size stack.
//!
//! Saved states are boxed: the host stores pointers into the saved state itself, so a state must never move once it
//! has been captured.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::libc::{
    c_int,
    c_uint,
    c_void,
    ucontext_t,
};
use ::std::{
    fmt,
    io,
    mem,
    process,
};

cfg_if::cfg_if! {
    if #[cfg(not(all(target_os = "linux", target_env = "gnu")))] {
        compile_error!("fiberlib requires the ucontext primitives of Linux/glibc");
    }
}

//======================================================================================================================
// Foreign Functions
//======================================================================================================================

extern "C" {
    fn getcontext(ucp: *mut ucontext_t) -> c_int;
    fn setcontext(ucp: *const ucontext_t) -> c_int;
    fn makecontext(ucp: *mut ucontext_t, func: extern "C" fn(), argc: c_int, ...);
    fn swapcontext(oucp: *mut ucontext_t, ucp: *const ucontext_t) -> c_int;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Entry procedure of a context. Receives an opaque pointer split in two halves.
pub type EntryFn = extern "C" fn(c_uint, c_uint);

/// Stack owned by a context.
pub struct Stack {
    buffer: Box<[u8]>,
}

/// Saved execution state plus, for fiber contexts, the stack it runs on.
pub struct Context {
    state: Box<ucontext_t>,
    stack: Option<Stack>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Stack {
    /// Allocates a zeroed stack of `size` bytes. Failure to allocate is reported, not fatal.
    pub fn new(size: usize) -> Result<Self, Fail> {
        let mut buffer: Vec<u8> = Vec::new();
        if let Err(e) = buffer.try_reserve_exact(size) {
            let cause: String = format!("cannot allocate stack (size={:?}, error={:?})", size, e);
            error!("new(): {}", cause);
            return Err(Fail::new(libc::ENOMEM, &cause));
        }
        buffer.resize(size, 0);
        Ok(Self {
            buffer: buffer.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    fn base(&mut self) -> *mut c_void {
        self.buffer.as_mut_ptr() as *mut c_void
    }
}

impl Context {
    /// Captures the current execution state. The result has no stack of its own.
    pub fn capture() -> Result<Self, Fail> {
        let mut state: Box<ucontext_t> = Box::new(unsafe { mem::zeroed() });
        if unsafe { getcontext(state.as_mut()) } != 0 {
            let e: io::Error = io::Error::last_os_error();
            error!("capture(): getcontext failed (error={:?})", e);
            return Err(Fail::from(e));
        }
        Ok(Self { state, stack: None })
    }

    /// Creates a context that runs `entry(arg)` on a freshly allocated stack of `stack_size` bytes. If `entry` ever
    /// returns, execution continues at `link`.
    ///
    /// # Safety
    ///
    /// `link` must outlive this context, and `arg` must be valid whenever `entry` runs.
    pub unsafe fn new(stack_size: usize, entry: EntryFn, arg: *mut c_void, link: Option<&Context>) -> Result<Self, Fail> {
        let mut stack: Stack = Stack::new(stack_size)?;
        let mut context: Self = Self::capture()?;

        context.state.uc_stack.ss_sp = stack.base();
        context.state.uc_stack.ss_size = stack.len();
        context.state.uc_stack.ss_flags = 0;
        context.state.uc_link = match link {
            Some(link) => link.as_ptr() as *mut ucontext_t,
            None => ::std::ptr::null_mut(),
        };

        let (hi, lo): (c_uint, c_uint) = split_pointer(arg);
        // The host calls `entry` with exactly the number of integer arguments we announce here.
        let entry: extern "C" fn() = mem::transmute::<EntryFn, extern "C" fn()>(entry);
        makecontext(context.state.as_mut(), entry, 2, hi, lo);

        context.stack = Some(stack);
        Ok(context)
    }

    /// Abandons the current execution state and continues at `target`. Failing here leaves no sane place to
    /// continue from, so the process is aborted.
    ///
    /// # Safety
    ///
    /// `target` must point to a live context that was either captured or created with [Context::new].
    pub unsafe fn resume(target: *const Context) -> ! {
        setcontext((*target).as_ptr());
        error!("resume(): setcontext failed (error={:?})", io::Error::last_os_error());
        process::abort()
    }

    /// Saves the current execution state into `from` and continues at `to`. Returns once something switches back
    /// to `from`.
    ///
    /// # Safety
    ///
    /// Both pointers must reference live contexts, and `from` must stay alive until it is resumed.
    pub unsafe fn switch(from: *mut Context, to: *const Context) {
        if swapcontext((*from).as_mut_ptr(), (*to).as_ptr()) != 0 {
            error!("switch(): swapcontext failed (error={:?})", io::Error::last_os_error());
            process::abort();
        }
    }

    /// Size of the owned stack, if any.
    pub fn stack_size(&self) -> Option<usize> {
        self.stack.as_ref().map(Stack::len)
    }

    fn as_ptr(&self) -> *const ucontext_t {
        self.state.as_ref() as *const ucontext_t
    }

    fn as_mut_ptr(&mut self) -> *mut ucontext_t {
        self.state.as_mut() as *mut ucontext_t
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Splits a pointer in two 32-bit halves, which is what the host entry convention can carry.
fn split_pointer(ptr: *mut c_void) -> (c_uint, c_uint) {
    let value: u64 = ptr as usize as u64;
    ((value >> 32) as c_uint, value as c_uint)
}

/// Rebuilds a pointer split by [split_pointer].
pub fn join_pointer(hi: c_uint, lo: c_uint) -> *mut c_void {
    (((hi as u64) << 32) | (lo as u64)) as usize as *mut c_void
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("state", &self.as_ptr())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
