//! Crate-level tests exercising real processes and sockets.

mod support;
