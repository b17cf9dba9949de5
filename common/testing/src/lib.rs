// Licensed under the Apache-2.0 license

//! Shared test support: a RAM-backed NOR flash model with fault injection.

mod ram_flash;

pub use ram_flash::RamFlash;
