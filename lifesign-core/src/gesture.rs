use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A facial gesture the claimant can be challenged to perform.
///
/// Adding a gesture means adding a variant here and a matching arm in
/// [`crate::detect::detect`]; the match is exhaustive so a missing detector
/// fails to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GestureKind {
    Blink,
    TurnLeft,
    TurnRight,
    Smile,
    BrowRaise,
    MouthOpen,
}

impl GestureKind {
    /// Default challenge pool: every known gesture.
    pub const POOL: [GestureKind; 6] = [
        GestureKind::Blink,
        GestureKind::TurnLeft,
        GestureKind::TurnRight,
        GestureKind::Smile,
        GestureKind::BrowRaise,
        GestureKind::MouthOpen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GestureKind::Blink => "blink",
            GestureKind::TurnLeft => "turn_left",
            GestureKind::TurnRight => "turn_right",
            GestureKind::Smile => "smile",
            GestureKind::BrowRaise => "brow_raise",
            GestureKind::MouthOpen => "mouth_open",
        }
    }

    /// Operator-facing instruction for the gesture.
    pub fn instruction(&self) -> &'static str {
        match self {
            GestureKind::Blink => "Blink both eyes",
            GestureKind::TurnLeft => "Turn your head to the left",
            GestureKind::TurnRight => "Turn your head to the right",
            GestureKind::Smile => "Smile wide",
            GestureKind::BrowRaise => "Raise your eyebrows",
            GestureKind::MouthOpen => "Open your mouth",
        }
    }
}

impl fmt::Display for GestureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GestureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blink" => Ok(GestureKind::Blink),
            "turn_left" => Ok(GestureKind::TurnLeft),
            "turn_right" => Ok(GestureKind::TurnRight),
            "smile" => Ok(GestureKind::Smile),
            "brow_raise" => Ok(GestureKind::BrowRaise),
            "mouth_open" => Ok(GestureKind::MouthOpen),
            other => Err(format!("Unknown gesture: {}", other)),
        }
    }
}
