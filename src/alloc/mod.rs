//! Allocates executable buffers to hold relocated function bodies
//!
//! Buffers are carved out of mmap'd read/write/execute page pools. Pools are
//! mapped wherever the kernel's ASLR places them, so a relocated copy's
//! address is never derivable from the original function's address.
//!
//! Taken from detour-rs with slight modifications: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use lazy_static::lazy_static;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

pub mod pool;

pub use pool::AllocError;

/// A thread-safe pool of executable memory.
pub struct ExecAllocator(Arc<Mutex<pool::PagePool>>);

impl ExecAllocator {
    /// Creates a new executable memory allocator.
    pub fn new() -> Self {
        ExecAllocator(Arc::new(Mutex::new(pool::PagePool::new())))
    }

    /// Allocates `size` bytes of read-, write- & executable memory.
    pub fn allocate(&self, size: usize) -> Result<ExecutableMemory, AllocError> {
        let mut pool = self.0.lock().unwrap();
        pool.allocate(size).map(ExecutableMemory)
    }
}

impl Default for ExecAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle for an allocated executable buffer.
///
/// The backing pages stay mapped for the lifetime of the handle; relocated
/// code keeps its handle inside the registry record, so the buffer is only
/// unmapped at registry teardown.
pub struct ExecutableMemory(pool::Allocation);

impl ExecutableMemory {
    /// Address of the buffer.
    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }
}

impl Deref for ExecutableMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for ExecutableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.0.deref_mut()
    }
}

lazy_static! {
    static ref POOL: ExecAllocator = ExecAllocator::new();
}

/// Allocates an executable buffer from the process-wide pool
///
/// Note: When the buffer returns, its contents are undefined, but valid u8 values
pub fn allocate_executable(size: usize) -> Result<ExecutableMemory, AllocError> {
    POOL.allocate(size)
}
