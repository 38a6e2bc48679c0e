//! mmap-backed page pools carved into buffers with `SlicePool`
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

use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};
use thiserror::Error;

/// Defines the allocation type.
pub type Allocation = SliceBox<u8>;

/// Minimum size of a freshly mapped pool, in pages.
const MIN_POOL_PAGES: usize = 4;

/// Errors that occur while allocating executable memory
#[derive(Debug, Error)]
pub enum AllocError {
    /// The kernel refused to map more executable memory
    #[error("out of executable memory")]
    OutOfMemory,
    /// Error while memmapping a pool
    #[error("mmap failed: {0}")]
    MmapError(mmap::MapError),
}

/// All executable page pools owned by an allocator.
pub struct PagePool {
    /// Memory pools used for allocations
    pools: Vec<SlicePool<u8>>,
}

impl PagePool {
    /// Creates an empty pool set; pages are mapped on first allocation.
    pub fn new() -> Self {
        PagePool { pools: Vec::new() }
    }

    /// Allocates a buffer, mapping a new pool if no existing one has room.
    ///
    /// Pools stay mapped for the life of the allocator; freed buffers are
    /// returned to their pool when the `SliceBox` drops.
    pub fn allocate(&mut self, size: usize) -> Result<Allocation, AllocError> {
        // Check if an existing pool can handle the allocation request
        if let Some(allocation) = self.pools.iter_mut().find_map(|pool| pool.alloc(size)) {
            return Ok(allocation);
        }

        // ... otherwise map a fresh pool and use it for the request
        let pool = Self::map_pool(size)?;
        let allocation = pool.alloc(size).ok_or(AllocError::OutOfMemory)?;
        self.pools.push(pool);
        Ok(allocation)
    }

    /// Maps a read/write/execute pool large enough for `size` bytes.
    ///
    /// No placement hint is given: ASLR decides where the pool lands, which
    /// keeps relocated copies at addresses unrelated to their origin.
    fn map_pool(size: usize) -> Result<SlicePool<u8>, AllocError> {
        let page_size = region::page::size();
        let pages = (size + page_size - 1) / page_size;
        let len = pages.max(MIN_POOL_PAGES) * page_size;

        mmap::MemoryMap::new(
            len,
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
            ],
        )
        .map_err(|e| match e {
            mmap::MapError::ErrNoMem => AllocError::OutOfMemory,
            e => AllocError::MmapError(e),
        })
        .map(SliceableMemoryMap)
        .map(SlicePool::new)
    }
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}

/// A wrapper for making a memory map compatible with `SlicePool`.
struct SliceableMemoryMap(mmap::MemoryMap);

impl SliceableMemoryMap {
    /// Get a slice of the memory map
    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }

    /// Get a mutable slice of the memory map
    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

impl AsRef<[u8]> for SliceableMemoryMap {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for SliceableMemoryMap {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

unsafe impl Send for SliceableMemoryMap {}
unsafe impl Sync for SliceableMemoryMap {}
