//! Execution core for kiln image builds.
//!
//! The core is two halves: the capability contracts a build is made of
//! (builders, provisioners, post-processors, and their artifacts and
//! callbacks) and the RPC bridge that makes those capabilities callable
//! across a plugin process boundary as if they were local. Templates
//! describing what to invoke live in the `kiln-template` crate.

use rand::Rng;
use std::net::{Ipv4Addr, TcpListener};

pub mod capability;
pub mod rpc;

/// Bind a listener to a random open TCP port in the given range.
pub fn bind_open_port(lower: u16, upper: u16) -> TcpListener {
    loop {
        let port = rand::rng().random_range(lower..upper);
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => break listener,
            Err(_) => continue,
        }
    }
}
