// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Storage Infrastructure Module
//!
//! Local-disk [`DocumentStorage`](crate::domain::storage::DocumentStorage)
//! backing the sandboxed filesystem.

pub mod local;

pub use local::{dir_size, list_tree, LocalDocumentStorage};
