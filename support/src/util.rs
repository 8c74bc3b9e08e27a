/*
 * This file is part of KAFS.
 *
 * KAFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * KAFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * KAFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! Small numeric and formatting helpers shared by every KAFS binary.

use std::fmt;
use std::mem::size_of;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current timestamp since the Unix epoch.
pub fn get_timestamp() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
}

/// Performs the log2 operation on the given integer.
///
/// If the result is undefined (`n == 0`), the function returns `None`.
pub fn log2(n: u64) -> Option<u32> {
    let num_bits = (size_of::<u64>() * 8) as u32;
    let n = num_bits - n.leading_zeros();
    if n > 0 {
        Some(n - 1)
    } else {
        None
    }
}

/// Returns `2^n`.
pub fn pow2(n: u32) -> u64 {
    1u64 << n
}

/// Returns `ceil(n / d)`.
pub fn ceil_division(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// Returns `true` if `n` is a power of two.
pub fn is_pow2(n: u64) -> bool {
    n != 0 && n & (n - 1) == 0
}

/// Structure representing a number of bytes, for human-readable display.
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut order = log2(self.0.max(1)).unwrap_or(0) / log2(1024).unwrap();

        let suffix = match order {
            0 => "bytes",
            1 => "KiB",
            2 => "MiB",
            3 => "GiB",
            4 => "TiB",

            _ => {
                order = 0;
                "bytes"
            }
        };

        let unit = 1024u64.pow(order);
        let nbr = self.0 / unit;

        write!(fmt, "{nbr} {suffix}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log2_values() {
        assert_eq!(log2(0), None);
        assert_eq!(log2(1), Some(0));
        assert_eq!(log2(2), Some(1));
        assert_eq!(log2(4096), Some(12));
    }

    #[test]
    fn pow2_roundtrip() {
        for n in 0..20 {
            assert_eq!(log2(pow2(n)), Some(n));
        }
    }

    #[test]
    fn ceil_division_values() {
        assert_eq!(ceil_division(0, 8), 0);
        assert_eq!(ceil_division(1, 8), 1);
        assert_eq!(ceil_division(8, 8), 1);
        assert_eq!(ceil_division(9, 8), 2);
    }

    #[test]
    fn bytesize() {
        assert_eq!(format!("{}", ByteSize(0)).as_str(), "0 bytes");
        assert_eq!(format!("{}", ByteSize(1024)).as_str(), "1 KiB");
        assert_eq!(format!("{}", ByteSize(4 * 1024 * 1024)).as_str(), "4 MiB");
    }
}
