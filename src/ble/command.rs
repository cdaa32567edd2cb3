//! Viewer control commands.
//!
//! The viewer writes a short ASCII word to the command characteristic.
//!
//! # Example
//!
//! ```
//! use esp32_cam_ble::ble::ViewerCommand;
//!
//! let cmd: ViewerCommand = "pause\n".parse().unwrap();
//! assert_eq!(cmd, ViewerCommand::Pause);
//! ```

use std::fmt;

/// Longest command word accepted from the characteristic.
pub const MAX_COMMAND_LEN: usize = 16;

/// Commands a viewer can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerCommand {
    /// Begin streaming on a connected link.
    Start,
    /// Suspend streaming, keeping the link.
    Pause,
    /// Continue a paused stream.
    Resume,
    /// End streaming and return to the connected state.
    Stop,
}

impl ViewerCommand {
    /// Convert command to string for BLE.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }

    /// Decode a raw characteristic write.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CommandError> {
        if bytes.len() > MAX_COMMAND_LEN {
            return Err(CommandError::TooLong(bytes.len()));
        }
        let text = std::str::from_utf8(bytes).map_err(|_| CommandError::InvalidUtf8)?;
        text.trim_end_matches('\0').parse()
    }
}

impl std::str::FromStr for ViewerCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "stop" => Ok(Self::Stop),
            _ => Err(CommandError::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for ViewerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors decoding a viewer command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Unrecognised command word.
    Unknown(String),
    /// Write was not valid UTF-8.
    InvalidUtf8,
    /// Write exceeded [`MAX_COMMAND_LEN`].
    TooLong(usize),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(s) => write!(f, "unknown command: {:?}", s),
            Self::InvalidUtf8 => write!(f, "command is not valid UTF-8"),
            Self::TooLong(len) => {
                write!(f, "command too long: {} bytes (max {})", len, MAX_COMMAND_LEN)
            }
        }
    }
}

impl std::error::Error for CommandError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("start".parse::<ViewerCommand>(), Ok(ViewerCommand::Start));
        assert_eq!("PAUSE".parse::<ViewerCommand>(), Ok(ViewerCommand::Pause));
        assert_eq!(" resume ".parse::<ViewerCommand>(), Ok(ViewerCommand::Resume));
        assert_eq!("stop\r\n".parse::<ViewerCommand>(), Ok(ViewerCommand::Stop));
        assert!(matches!(
            "reboot".parse::<ViewerCommand>(),
            Err(CommandError::Unknown(_))
        ));
    }

    #[test]
    fn test_display_roundtrip() {
        for cmd in [
            ViewerCommand::Start,
            ViewerCommand::Pause,
            ViewerCommand::Resume,
            ViewerCommand::Stop,
        ] {
            assert_eq!(cmd.to_string().parse::<ViewerCommand>(), Ok(cmd));
        }
    }

    #[test]
    fn test_from_bytes() {
        assert_eq!(ViewerCommand::from_bytes(b"start"), Ok(ViewerCommand::Start));
        assert_eq!(ViewerCommand::from_bytes(b"pause\0"), Ok(ViewerCommand::Pause));
        assert_eq!(
            ViewerCommand::from_bytes(&[0xFF, 0xFE]),
            Err(CommandError::InvalidUtf8)
        );
        assert_eq!(
            ViewerCommand::from_bytes(&[b'a'; 17]),
            Err(CommandError::TooLong(17))
        );
    }
}
