// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Client side of the UniSet2 LogServer TCP protocol: fixed-size packed
//! command frames out, a newline-delimited log stream back.

mod client;
pub mod protocol;

pub use client::{Client, ClientConfig, ConnectionStatus};
pub use protocol::{level, Command, Message, MAGIC, MAX_LOGNAME_LEN, MESSAGE_SIZE};
