// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! LHTML Shell Core
//!
//! Sandboxed document filesystem for the LHTML shell: path confinement,
//! size quota, grouped save/io locking and the guest RPC contract.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Everything the `lhtml` binary needs below the CLI

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
