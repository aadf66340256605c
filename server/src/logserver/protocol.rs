// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::error::{Error, Result};

/// Protocol magic; frames with any other value are rejected.
pub const MAGIC: u32 = 20_201_222;

/// Usable logname bytes; the wire field is one byte longer for the NUL.
pub const MAX_LOGNAME_LEN: usize = 120;

/// Fixed frame size: 1 + 4 + 4 + 1 + 121.
pub const MESSAGE_SIZE: usize = 131;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Command {
    Nop = 0,
    SetLevel = 1,
    AddLevel = 2,
    DelLevel = 3,
    Rotate = 4,
    OffLogFile = 5,
    OnLogFile = 6,
    SetVerbosity = 7,
    SaveLogLevel = 8,
    RestoreLogLevel = 9,
    List = 10,
    FilterMode = 11,
    ViewDefaultLogLevel = 12,
    ShowLocalTime = 13,
    ShowUtcTime = 14,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Command> {
        match v {
            0 => Some(Command::Nop),
            1 => Some(Command::SetLevel),
            2 => Some(Command::AddLevel),
            3 => Some(Command::DelLevel),
            4 => Some(Command::Rotate),
            5 => Some(Command::OffLogFile),
            6 => Some(Command::OnLogFile),
            7 => Some(Command::SetVerbosity),
            8 => Some(Command::SaveLogLevel),
            9 => Some(Command::RestoreLogLevel),
            10 => Some(Command::List),
            11 => Some(Command::FilterMode),
            12 => Some(Command::ViewDefaultLogLevel),
            13 => Some(Command::ShowLocalTime),
            14 => Some(Command::ShowUtcTime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Nop => "NOP",
            Command::SetLevel => "SetLevel",
            Command::AddLevel => "AddLevel",
            Command::DelLevel => "DelLevel",
            Command::Rotate => "Rotate",
            Command::OffLogFile => "OffLogFile",
            Command::OnLogFile => "OnLogFile",
            Command::SetVerbosity => "SetVerbosity",
            Command::SaveLogLevel => "SaveLogLevel",
            Command::RestoreLogLevel => "RestoreLogLevel",
            Command::List => "List",
            Command::FilterMode => "FilterMode",
            Command::ViewDefaultLogLevel => "ViewDefaultLogLevel",
            Command::ShowLocalTime => "ShowLocalTime",
            Command::ShowUtcTime => "ShowUTCTime",
        }
    }
}

/// Log level bitmask carried in the `data` field of level commands.
pub mod level {
    pub const NONE: u32 = 0;
    pub const CRIT: u32 = 1 << 0;
    pub const WARN: u32 = 1 << 1;
    pub const INFO: u32 = 1 << 2;
    pub const LEVEL1: u32 = 1 << 3;
    pub const LEVEL2: u32 = 1 << 4;
    pub const LEVEL3: u32 = 1 << 5;
    pub const LEVEL4: u32 = 1 << 6;
    pub const LEVEL5: u32 = 1 << 7;
    pub const LEVEL6: u32 = 1 << 8;
    pub const LEVEL7: u32 = 1 << 9;
    pub const LEVEL8: u32 = 1 << 10;
    pub const LEVEL9: u32 = 1 << 11;
    pub const ANY: u32 = 0xFFFF_FFFF;
}

/// One packed command frame.
///
/// Mirrors the C++ `lsMessage` struct: `uint8 be_order; uint32 magic;
/// uint32 data; uint8 cmd; char logname[121]` (packed, little-endian).
/// Senders always write `byte_order = 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub byte_order: u8,
    pub magic: u32,
    pub data: u32,
    pub cmd: Command,
    logname: [u8; MAX_LOGNAME_LEN + 1],
}

impl Message {
    pub fn new(cmd: Command, data: u32, logname: &str) -> Message {
        let mut msg = Message {
            byte_order: 0,
            magic: MAGIC,
            data,
            cmd,
            logname: [0u8; MAX_LOGNAME_LEN + 1],
        };
        msg.set_logname(logname);
        msg
    }

    /// Truncates to [`MAX_LOGNAME_LEN`] bytes; the buffer stays NUL-padded.
    pub fn set_logname(&mut self, name: &str) {
        self.logname = [0u8; MAX_LOGNAME_LEN + 1];
        let bytes = name.as_bytes();
        let n = bytes.len().min(MAX_LOGNAME_LEN);
        self.logname[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn logname(&self) -> String {
        let end = self
            .logname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.logname.len());
        String::from_utf8_lossy(&self.logname[..end]).into_owned()
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(MESSAGE_SIZE);
        buf.write_u8(self.byte_order)?;
        buf.write_u32::<LittleEndian>(self.magic)?;
        buf.write_u32::<LittleEndian>(self.data)?;
        buf.write_u8(self.cmd as u8)?;
        buf.extend_from_slice(&self.logname);
        debug_assert_eq!(buf.len(), MESSAGE_SIZE);
        Ok(buf)
    }

    pub fn unmarshal(data: &[u8]) -> Result<Message> {
        if data.len() < MESSAGE_SIZE {
            return Err(Error::Framing(format!(
                "frame too short: got {}, need {}",
                data.len(),
                MESSAGE_SIZE
            )));
        }

        let mut cursor = Cursor::new(data);
        let byte_order = cursor.read_u8()?;
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(Error::Framing(format!(
                "invalid magic: got {magic}, expected {MAGIC}"
            )));
        }
        let data_field = cursor.read_u32::<LittleEndian>()?;
        let cmd_raw = cursor.read_u8()?;
        let cmd = Command::from_u8(cmd_raw)
            .ok_or_else(|| Error::Framing(format!("unknown command {cmd_raw}")))?;

        let mut logname = [0u8; MAX_LOGNAME_LEN + 1];
        let offset = cursor.position() as usize;
        logname.copy_from_slice(&data[offset..offset + MAX_LOGNAME_LEN + 1]);

        Ok(Message {
            byte_order,
            magic,
            data: data_field,
            cmd,
            logname,
        })
    }
}
