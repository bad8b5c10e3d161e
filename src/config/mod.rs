//! Configuration management module
//!
//! INI-based configuration read from `/etc/kapsule.conf` with a vendor
//! fallback in `/usr/lib/kapsule.conf`.

mod config;

pub use config::*;
