//  Copyright 2024 Cedana.
//
//  Modifications licensed under the Apache License, Version 2.0.

//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! A prioritized, streaming image asset pipeline: ingest DDS container files from a virtual
//! filesystem, stream bytes asynchronously off disk (C4), parse them incrementally (C7), store
//! decoded pixel data in a reservation-based virtual-memory cache (C6, C10), and hand locked
//! cache regions to downstream consumers through a priority-scheduled streaming layer (C5).

// Unless we are in release mode, allow dead code, unused imports and variables,
// it makes development more enjoyable.
#![cfg_attr(debug_assertions, allow(dead_code, unused_imports, unused_variables))]

pub mod aio;
pub mod buffer_pool;
pub mod cache;
pub mod config;
pub mod encoder;
pub mod error;
pub mod image_memory;
pub mod loader;
pub mod mmap_buf;
pub mod ord_by;
pub mod parser;
pub mod pio;
pub mod queues;
pub mod stream_decoder;
pub mod types;
pub mod util;
pub mod vfs;
