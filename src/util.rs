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

use nix::unistd::{sysconf, SysconfVar};

pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;

/// Sentinel meaning "until end of stream / all elements" (§6 of the spec).
pub const ALL_FRAMES: u32 = u32::MAX;

/// Default `MAX_ACTIVE` for the AIO driver: must be a power of two.
pub const DEFAULT_MAX_ACTIVE: usize = 128;

/// Delivery ring capacity for interval-paced PIO streams.
pub const DELIVERY_RING_SIZE: usize = 4;

lazy_static::lazy_static! {
    pub static ref PAGE_SIZE: usize = sysconf(SysconfVar::PAGE_SIZE)
        .expect("failed to determine PAGE_SIZE")
        .expect("failed to determine PAGE_SIZE") as usize;
}

/// Rounds `value` up to the next multiple of `granularity`. `granularity` must be a power of two.
pub fn round_up(value: usize, granularity: usize) -> usize {
    debug_assert!(granularity.is_power_of_two());
    (value + granularity - 1) & !(granularity - 1)
}

/// Rounds `value` down to the previous multiple of `granularity`. `granularity` must be a power
/// of two.
pub fn round_down(value: usize, granularity: usize) -> usize {
    debug_assert!(granularity.is_power_of_two());
    value & !(granularity - 1)
}

pub fn round_up_u64(value: u64, granularity: u64) -> u64 {
    debug_assert!(granularity.is_power_of_two());
    (value + granularity - 1) & !(granularity - 1)
}

pub fn round_down_u64(value: u64, granularity: u64) -> u64 {
    debug_assert!(granularity.is_power_of_two());
    value & !(granularity - 1)
}

/// A high-resolution monotonic clock that timestamps everything in nanoseconds (§4.10, §5).
/// Kept as a distinct type (rather than passing `std::time::Instant` around directly) so that
/// components can be driven by a fake clock in tests.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: std::time::Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self { origin: std::time::Instant::now() }
    }
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_aligns_to_granularity() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    fn round_down_aligns_to_granularity() {
        assert_eq!(round_down(0, 512), 0);
        assert_eq!(round_down(511, 512), 0);
        assert_eq!(round_down(512, 512), 512);
        assert_eq!(round_down(1023, 512), 512);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }
}
