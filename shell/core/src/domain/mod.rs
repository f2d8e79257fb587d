// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Sandbox rules that hold regardless of how guests reach the shell.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer

pub mod chroot_fs;
pub mod document;
pub mod events;
pub mod lock;
pub mod quota;
pub mod safe_join;
pub mod shell_config;
pub mod storage;
