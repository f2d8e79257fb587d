// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod storage;

pub use event_bus::{DocumentEvent, EventBus, EventBusError, EventReceiver};
