//! Command codec: validate a control intent and encode it for the device.
//!
//! The device speaks a letter-per-line protocol (`F\n`, `S\n`, ...). Intensity is
//! validated for range but never put on the wire.

use serde_json::Value;

/// Inclusive bounds for a command's intensity.
pub const INTENSITY_MIN: f64 = 0.0;
pub const INTENSITY_MAX: f64 = 100.0;

/// Message shown to clients for any validation failure.
pub const INVALID_COMMAND_MESSAGE: &str = "Invalid command format";

/// Recognized command letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
    /// `Q`
    QuitUpper,
    /// `q`
    QuitLower,
    /// `W`: accepted and passed through; not part of the directional set.
    AuxUpper,
    /// `w`
    AuxLower,
}

impl CommandKind {
    pub const ALL: [CommandKind; 9] = [
        CommandKind::Forward,
        CommandKind::Backward,
        CommandKind::Left,
        CommandKind::Right,
        CommandKind::Stop,
        CommandKind::QuitUpper,
        CommandKind::QuitLower,
        CommandKind::AuxUpper,
        CommandKind::AuxLower,
    ];

    pub fn letter(self) -> char {
        match self {
            CommandKind::Forward => 'F',
            CommandKind::Backward => 'B',
            CommandKind::Left => 'L',
            CommandKind::Right => 'R',
            CommandKind::Stop => 'S',
            CommandKind::QuitUpper => 'Q',
            CommandKind::QuitLower => 'q',
            CommandKind::AuxUpper => 'W',
            CommandKind::AuxLower => 'w',
        }
    }

    /// Case-sensitive lookup; the input must be exactly one letter.
    pub fn from_letter(s: &str) -> Option<Self> {
        let mut chars = s.chars();
        let c = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        Self::ALL.into_iter().find(|k| k.letter() == c)
    }
}

/// A validated command. Construct with [`validate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    kind: CommandKind,
    intensity: f64,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn intensity(&self) -> f64 {
        self.intensity
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown command letter: {0:?}")]
    UnknownCommand(String),
    #[error("intensity {0} outside [0, 100]")]
    IntensityOutOfRange(f64),
    #[error("intensity is missing or not a number")]
    IntensityNotNumeric,
}

/// Validate a command letter and its intensity.
///
/// Intensity must be a JSON number in [0, 100]; an out-of-range intensity rejects
/// the whole command even though it is never transmitted.
pub fn validate(letter: &str, intensity: &Value) -> Result<Command, ValidationError> {
    let kind = CommandKind::from_letter(letter)
        .ok_or_else(|| ValidationError::UnknownCommand(letter.to_string()))?;
    let intensity = intensity
        .as_f64()
        .ok_or(ValidationError::IntensityNotNumeric)?;
    if !(INTENSITY_MIN..=INTENSITY_MAX).contains(&intensity) {
        return Err(ValidationError::IntensityOutOfRange(intensity));
    }
    Ok(Command { kind, intensity })
}

/// Wire encoding: the command letter followed by `\n`.
pub fn encode(command: &Command) -> Vec<u8> {
    // every letter is ASCII
    vec![command.kind.letter() as u8, b'\n']
}
