// Licensed under the Apache-2.0 license

//! End-to-end boot and persistence scenarios over simulated flash devices.

#[cfg(test)]
mod harness;
#[cfg(test)]
mod test_boot_flow;
#[cfg(test)]
mod test_wear_levelling;
