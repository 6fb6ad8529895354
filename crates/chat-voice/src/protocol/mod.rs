//! Voice gateway protocol definitions

mod close_codes;
mod messages;
mod opcodes;

pub use close_codes::{close_action, CloseAction, VoiceCloseCode};
pub use messages::{
    SelectProtocol, SelectProtocolData, SessionDescription, Speaking, VoiceHello, VoiceIdentify,
    VoiceMessage, VoiceReady, VoiceResume,
};
pub use opcodes::VoiceOpCode;
