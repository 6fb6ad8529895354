//! Voice gateway close codes

/// Close codes sent by the voice gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum VoiceCloseCode {
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    SessionNoLongerValid = 4006,
    SessionTimeout = 4009,
    ServerNotFound = 4011,
    UnknownProtocol = 4012,
    /// Kicked, moved or the channel was deleted
    Disconnected = 4014,
    VoiceServerCrashed = 4015,
    UnknownEncryptionMode = 4016,
}

/// What a voice session does after its gateway closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and resume the same session
    Resume,
    /// Tear the session down quietly
    Teardown,
    /// Tear down and report an error
    Fatal,
}

impl VoiceCloseCode {
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4006 => Some(Self::SessionNoLongerValid),
            4009 => Some(Self::SessionTimeout),
            4011 => Some(Self::ServerNotFound),
            4012 => Some(Self::UnknownProtocol),
            4014 => Some(Self::Disconnected),
            4015 => Some(Self::VoiceServerCrashed),
            4016 => Some(Self::UnknownEncryptionMode),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub const fn action(self) -> CloseAction {
        match self {
            Self::Disconnected | Self::SessionNoLongerValid | Self::SessionTimeout => {
                CloseAction::Teardown
            }
            Self::AuthenticationFailed
            | Self::UnknownProtocol
            | Self::UnknownEncryptionMode
            | Self::ServerNotFound => CloseAction::Fatal,
            _ => CloseAction::Resume,
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::UnknownOpcode => "Invalid opcode sent",
            Self::DecodeError => "Invalid payload sent",
            Self::NotAuthenticated => "Payload sent before identifying",
            Self::AuthenticationFailed => "Authentication failed",
            Self::AlreadyAuthenticated => "Already authenticated",
            Self::SessionNoLongerValid => "Session is no longer valid",
            Self::SessionTimeout => "Session timed out",
            Self::ServerNotFound => "Voice server not found",
            Self::UnknownProtocol => "Unknown protocol",
            Self::Disconnected => "Disconnected from the channel",
            Self::VoiceServerCrashed => "Voice server crashed",
            Self::UnknownEncryptionMode => "Unknown encryption mode",
        }
    }
}

/// Action for a raw close code; codes outside the table are resumed
#[must_use]
pub fn close_action(code: u16) -> CloseAction {
    VoiceCloseCode::from_u16(code).map_or(CloseAction::Resume, VoiceCloseCode::action)
}

impl std::fmt::Display for VoiceCloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u16())
    }
}
