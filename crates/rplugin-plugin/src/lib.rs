//! The abstract hosted-plugin boundary.
//!
//! The real foreign plugin ABI (loading a dynamic library, calling into its
//! callback table) is out of scope for this proxy — it's a collaborator
//! that lives on the other side of this trait. `ServerEndpoint` only ever
//! talks to a `HostedPlugin`; anything implementing it, real ABI adapter or
//! test double, can sit behind the wire protocol in `rplugin-ipc`.

use rplugin_core::{ChannelCount, Frames, SampleRate};

/// Static metadata a hosted plugin reports once at load time.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub maker: String,
    pub version: f32,
}

/// Description of a single automatable parameter.
#[derive(Debug, Clone)]
pub struct ParameterInfo {
    pub name: String,
    pub default_value: f32,
}

/// A MIDI event queued for the current process block, carrying the
/// sample-frame offset within the block at which it occurs (spec §4.1's
/// `frameOffsets`).
#[derive(Debug, Clone, Copy)]
pub struct MidiEvent {
    /// Up to three raw MIDI bytes, short events zero-padded by the caller.
    pub bytes: [u8; 3],
    pub frame_offset: i32,
}

/// State of a begin/end-edit bracket the hosted plugin has opened around a
/// parameter edit, as reported through [`PluginEvent::BeginEdit`] /
/// [`PluginEvent::EndEdit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EditBatchState {
    #[default]
    None,
    Started,
    Finished,
}

/// Something the hosted plugin produced on its own initiative between
/// process calls — not a response to a request from the host. The server
/// drains these once per cycle and folds them into the parameter-change
/// notification ring bound for the UI side channel.
#[derive(Debug, Clone, Copy)]
pub enum PluginEvent {
    ParameterChanged { index: i32, value: f32 },
    BeginEdit { index: i32 },
    EndEdit { index: i32 },
}

/// Errors a hosted plugin call can fail with.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin rejected operation: {0}")]
    Rejected(String),
    #[error("plugin not ready: {0}")]
    NotReady(String),
}

/// The operations `ServerEndpoint` invokes against the hosted plugin. Every
/// opcode in `rplugin_ipc::Opcode` maps onto exactly one of these methods.
pub trait HostedPlugin: Send {
    fn info(&self) -> PluginInfo;

    fn set_buffer_size(&mut self, frames: Frames) -> Result<(), PluginError>;
    fn set_sample_rate(&mut self, sample_rate: SampleRate) -> Result<(), PluginError>;
    fn reset(&mut self);

    fn input_count(&self) -> ChannelCount;
    fn output_count(&self) -> ChannelCount;

    fn parameter_count(&self) -> usize;
    fn parameter_name(&self, index: i32) -> String;
    fn set_parameter(&mut self, index: i32, value: f32);
    fn parameter(&self, index: i32) -> f32;
    fn parameter_default(&self, index: i32) -> f32;

    fn program_count(&self) -> usize;
    fn program_name(&self, index: i32) -> String;
    fn set_current_program(&mut self, index: i32);

    fn has_midi_input(&self) -> bool;
    fn send_midi_data(&mut self, events: &[MidiEvent]) -> Result<(), PluginError>;

    /// Process one block of audio. `inputs[c][f]`/`outputs[c][f]` address
    /// channel `c`, frame `f`.
    fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]);

    /// Opaque plugin state, as used by `GetBlob`/`SetBlob`.
    fn get_blob(&self) -> Vec<u8>;
    fn set_blob(&mut self, data: &[u8]) -> Result<(), PluginError>;

    fn warn(&mut self, message: &str) -> bool;

    fn show_gui(&mut self, gui_data: &str);
    fn hide_gui(&mut self);

    /// Drain events the plugin has produced since the last call (parameter
    /// automation the plugin itself generated, and begin/end-edit
    /// brackets). Never blocks.
    fn poll_events(&mut self) -> Vec<PluginEvent> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{EditBatchState, PluginEvent};

    #[test]
    fn edit_batch_state_defaults_to_none() {
        assert_eq!(EditBatchState::default(), EditBatchState::None);
    }

    #[test]
    fn plugin_event_carries_index_and_value() {
        let event = PluginEvent::ParameterChanged {
            index: 2,
            value: 0.75,
        };
        match event {
            PluginEvent::ParameterChanged { index, value } => {
                assert_eq!(index, 2);
                assert!((value - 0.75).abs() < f32::EPSILON);
            }
            _ => unreachable!(),
        }
    }
}
