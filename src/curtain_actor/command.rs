//! Payloads accepted on the curtain set-position topic.

use super::CurtainError;

/// Positions are percentages, 100 = fully open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurtainCommand {
    Open,
    Close,
    Stop,
    SetPosition(u8),
}

impl CurtainCommand {
    pub const MAX_POSITION: u8 = 100;

    /// Keywords match case-insensitively; numbers are ASCII decimal.
    pub fn from_payload(payload: &[u8]) -> Result<Self, CurtainError> {
        let payload = payload.trim_ascii();
        if payload.eq_ignore_ascii_case(b"open") {
            return Ok(CurtainCommand::Open);
        }
        if payload.eq_ignore_ascii_case(b"close") {
            return Ok(CurtainCommand::Close);
        }
        if payload.eq_ignore_ascii_case(b"stop") {
            return Ok(CurtainCommand::Stop);
        }

        let text = String::from_utf8_lossy(payload);
        let position: i64 = text
            .parse()
            .map_err(|_| CurtainError::UnexpectedPayload(text.to_string()))?;
        match u8::try_from(position) {
            Ok(percent) if percent <= Self::MAX_POSITION => Ok(CurtainCommand::SetPosition(percent)),
            _ => Err(CurtainError::InvalidPosition(position)),
        }
    }

    pub fn operation(self) -> &'static str {
        match self {
            CurtainCommand::Open => "open",
            CurtainCommand::Close => "close",
            CurtainCommand::Stop => "stop",
            CurtainCommand::SetPosition(_) => "set_position",
        }
    }

    /// State reported once the command succeeded. `STOP` clears the
    /// retained state, there being no "stopped" state to report.
    pub fn resulting_state(self) -> Vec<u8> {
        match self {
            CurtainCommand::Open => b"opening".to_vec(),
            CurtainCommand::Close => b"closing".to_vec(),
            CurtainCommand::Stop => Vec::new(),
            CurtainCommand::SetPosition(percent) => percent.to_string().into_bytes(),
        }
    }

    /// Whether the cached position is meaningful right after the command.
    /// While the motor is still moving it is not.
    pub fn position_settled(self) -> bool {
        matches!(self, CurtainCommand::Stop)
    }
}
