//! Payloads accepted on the button command topic.

/// What a payload asks the bot to do.
///
/// `ON` and `OFF` (any case) switch a bot in switch mode; every other
/// payload is a plain press trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonCommand {
    Press,
    TurnOn,
    TurnOff,
}

impl ButtonCommand {
    pub fn from_payload(payload: &[u8]) -> Self {
        if payload.eq_ignore_ascii_case(b"on") {
            ButtonCommand::TurnOn
        } else if payload.eq_ignore_ascii_case(b"off") {
            ButtonCommand::TurnOff
        } else {
            ButtonCommand::Press
        }
    }

    pub fn operation(self) -> &'static str {
        match self {
            ButtonCommand::Press => "press",
            ButtonCommand::TurnOn => "turn_on",
            ButtonCommand::TurnOff => "turn_off",
        }
    }

    /// State reported once the command succeeded.
    pub fn resulting_state(self) -> &'static [u8] {
        match self {
            ButtonCommand::Press | ButtonCommand::TurnOn => b"ON",
            ButtonCommand::TurnOff => b"OFF",
        }
    }
}
