//! Test modules for the sandbox crate.

mod support;
mod unit;
