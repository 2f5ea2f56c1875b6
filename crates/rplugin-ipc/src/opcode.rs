//! The opcode set and its partition across the two channels.
//!
//! Numeric values follow the original protocol's bands (query opcodes from
//! 0, realtime-adjacent lifecycle from 100, counts from 200, parameters from
//! 300, programs from 350, MIDI from 400, process/ready from 500, debug/warn
//! from 600, GUI from 700) purely so wire dumps stay comparable; the bands
//! themselves carry no behavior. What actually matters is [`Channel`]:
//! an opcode legal on the wrong channel is a protocol violation.

/// Which channel an opcode may legally travel on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Named pipes only.
    Control,
    /// Shared-memory ring only.
    Ring,
    /// Either, depending on context (spec §3: "Lifecycle").
    Either,
}

macro_rules! opcodes {
    ($($name:ident = $value:expr => $channel:expr),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(i32)]
        pub enum Opcode {
            $($name = $value),+
        }

        impl Opcode {
            #[must_use]
            pub fn from_i32(value: i32) -> Option<Self> {
                match value {
                    $($value => Some(Self::$name),)+
                    _ => None,
                }
            }

            #[must_use]
            pub const fn channel(self) -> Channel {
                match self {
                    $(Self::$name => $channel),+
                }
            }
        }
    };
}

opcodes! {
    GetVersion = 0 => Channel::Control,
    GetName = 1 => Channel::Control,
    GetMaker = 2 => Channel::Control,

    SetBufferSize = 100 => Channel::Ring,
    SetSampleRate = 101 => Channel::Ring,
    Reset = 102 => Channel::Either,
    Terminate = 103 => Channel::Either,

    GetInputCount = 200 => Channel::Control,
    GetOutputCount = 201 => Channel::Control,

    GetParameterCount = 300 => Channel::Control,
    GetParameterName = 301 => Channel::Control,
    SetParameter = 302 => Channel::Ring,
    GetParameter = 303 => Channel::Control,
    GetParameterDefault = 304 => Channel::Control,
    GetParameters = 305 => Channel::Control,

    GetProgramCount = 350 => Channel::Control,
    GetProgramName = 351 => Channel::Control,
    SetCurrentProgram = 352 => Channel::Ring,

    HasMidiInput = 400 => Channel::Control,
    SendMidiData = 401 => Channel::Ring,

    Process = 500 => Channel::Ring,
    IsReady = 501 => Channel::Control,

    SetDebugLevel = 600 => Channel::Either,
    Warn = 601 => Channel::Control,

    ShowGui = 700 => Channel::Either,
    HideGui = 701 => Channel::Either,

    GetBlob = 800 => Channel::Control,
    SetBlob = 801 => Channel::Control,
}

impl Opcode {
    /// Whether this opcode is legal on the control (named pipe) channel.
    #[must_use]
    pub const fn legal_on_control(self) -> bool {
        matches!(self.channel(), Channel::Control | Channel::Either)
    }

    /// Whether this opcode is legal on the ring (shared memory) channel.
    #[must_use]
    pub const fn legal_on_ring(self) -> bool {
        matches!(self.channel(), Channel::Ring | Channel::Either)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_opcodes() {
        assert_eq!(Opcode::from_i32(500), Some(Opcode::Process));
        assert_eq!(Opcode::from_i32(302), Some(Opcode::SetParameter));
        assert_eq!(Opcode::from_i32(9999), None);
    }

    #[test]
    fn query_opcodes_are_control_only() {
        assert!(Opcode::GetVersion.legal_on_control());
        assert!(!Opcode::GetVersion.legal_on_ring());
    }

    #[test]
    fn realtime_opcodes_are_ring_only() {
        assert!(Opcode::Process.legal_on_ring());
        assert!(!Opcode::Process.legal_on_control());
        assert!(Opcode::SetParameter.legal_on_ring());
        assert!(!Opcode::SetParameter.legal_on_control());
    }

    #[test]
    fn lifecycle_opcodes_are_legal_on_either_channel() {
        assert!(Opcode::Terminate.legal_on_control());
        assert!(Opcode::Terminate.legal_on_ring());
        assert!(Opcode::ShowGui.legal_on_control());
        assert!(Opcode::ShowGui.legal_on_ring());
    }
}
