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

//! Environment-driven runtime configuration, read once at process start by
//! `kafsfront`/`kafsd`/`kafsctl`.
//!
//! `Journal` reads its own two env vars directly (`KAFS_JOURNAL_DISABLE`,
//! `KAFS_JOURNAL_GC_NS`) since it owns that state; this module covers the
//! knobs that live above a single [`crate::context::Context`]: which image to
//! mount, how many worker threads to run, and how to reach the hotplug peer.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_HOTPLUG_SOCKET: &str = "/run/kafs/hotplug.sock";
const DEFAULT_HOTPLUG_WAIT_MS: u64 = 2000;
const DEFAULT_HOTPLUG_QUEUE_CAP: usize = 64;

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v != "0").unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Front-end and daemon configuration, assembled from environment variables.
///
/// | Variable | Meaning | Default |
/// |---|---|---|
/// | `KAFS_IMAGE` | path to the filesystem image | required |
/// | `KAFS_SINGLE_THREADED` | disable the FUSE multi-thread pool | unset |
/// | `KAFS_MAX_THREADS` | worker thread cap when multi-threaded | 8 |
/// | `KAFS_HOTPLUG_SOCKET` | UDS path the front listens on for the peer | `/run/kafs/hotplug.sock` |
/// | `KAFS_HOTPLUG_DATA_MODE` | route read/write through the peer instead of falling back locally | unset |
/// | `KAFS_HOTPLUG_WAIT_MS` | how long a dispatch blocks for a peer before falling back | 2000 |
/// | `KAFS_HOTPLUG_QUEUE_CAP` | max dispatches queued waiting for a peer | 64 |
pub struct Config {
    pub image_path: PathBuf,
    pub single_threaded: bool,
    pub max_threads: usize,
    pub hotplug_socket: PathBuf,
    pub hotplug_data_mode: bool,
    pub hotplug_wait: Duration,
    pub hotplug_queue_cap: usize,
}

impl Config {
    fn from_env_with(image_path: PathBuf) -> Self {
        Self {
            image_path,
            single_threaded: env_flag("KAFS_SINGLE_THREADED"),
            max_threads: env_parse("KAFS_MAX_THREADS", 8usize).max(1),
            hotplug_socket: std::env::var_os("KAFS_HOTPLUG_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HOTPLUG_SOCKET)),
            hotplug_data_mode: env_flag("KAFS_HOTPLUG_DATA_MODE"),
            hotplug_wait: Duration::from_millis(env_parse(
                "KAFS_HOTPLUG_WAIT_MS",
                DEFAULT_HOTPLUG_WAIT_MS,
            )),
            hotplug_queue_cap: env_parse("KAFS_HOTPLUG_QUEUE_CAP", DEFAULT_HOTPLUG_QUEUE_CAP),
        }
    }

    /// Reads configuration from the environment, including the image path
    /// (`KAFS_IMAGE`). Returns `None` if `KAFS_IMAGE` is unset.
    pub fn from_env() -> Option<Self> {
        let image_path = std::env::var_os("KAFS_IMAGE").map(PathBuf::from)?;
        Some(Self::from_env_with(image_path))
    }

    /// Same as [`Self::from_env`] but with an explicit image path, taking
    /// precedence over `KAFS_IMAGE` (the CLI-argument case).
    pub fn with_image(image_path: PathBuf) -> Self {
        Self::from_env_with(image_path)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_flag_treats_zero_as_unset() {
        std::env::set_var("KAFS_CONFIG_TEST_FLAG", "0");
        assert!(!env_flag("KAFS_CONFIG_TEST_FLAG"));
        std::env::set_var("KAFS_CONFIG_TEST_FLAG", "1");
        assert!(env_flag("KAFS_CONFIG_TEST_FLAG"));
        std::env::remove_var("KAFS_CONFIG_TEST_FLAG");
        assert!(!env_flag("KAFS_CONFIG_TEST_FLAG"));
    }

    #[test]
    fn env_parse_falls_back_on_missing_or_bad_value() {
        std::env::remove_var("KAFS_CONFIG_TEST_NUM");
        assert_eq!(env_parse("KAFS_CONFIG_TEST_NUM", 7u64), 7);
        std::env::set_var("KAFS_CONFIG_TEST_NUM", "not-a-number");
        assert_eq!(env_parse("KAFS_CONFIG_TEST_NUM", 7u64), 7);
        std::env::set_var("KAFS_CONFIG_TEST_NUM", "42");
        assert_eq!(env_parse("KAFS_CONFIG_TEST_NUM", 7u64), 42);
        std::env::remove_var("KAFS_CONFIG_TEST_NUM");
    }

    #[test]
    fn with_image_overrides_env_path() {
        std::env::remove_var("KAFS_IMAGE");
        let cfg = Config::with_image(PathBuf::from("/tmp/explicit.img"));
        assert_eq!(cfg.image_path, PathBuf::from("/tmp/explicit.img"));
    }
}
