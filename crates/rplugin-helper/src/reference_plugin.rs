//! A minimal `HostedPlugin` implementation: a single-parameter gain stage.
//!
//! Stands in for a real foreign-ABI adapter, which is out of scope for this
//! proxy. Useful on its own for exercising the wire protocol end to end
//! without needing an actual plugin binary on disk.

use rplugin_core::{ChannelCount, Frames, SampleRate};
use rplugin_plugin::{HostedPlugin, MidiEvent, PluginError, PluginInfo};

pub struct GainPlugin {
    gain: f32,
    sample_rate: SampleRate,
    buffer_size: Frames,
    current_program: i32,
}

impl Default for GainPlugin {
    fn default() -> Self {
        Self {
            gain: 1.0,
            sample_rate: 44_100,
            buffer_size: 512,
            current_program: 0,
        }
    }
}

impl HostedPlugin for GainPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "Reference Gain".to_string(),
            maker: "rplugin-bridge".to_string(),
            version: 1.0,
        }
    }

    fn set_buffer_size(&mut self, frames: Frames) -> Result<(), PluginError> {
        self.buffer_size = frames;
        Ok(())
    }

    fn set_sample_rate(&mut self, sample_rate: SampleRate) -> Result<(), PluginError> {
        self.sample_rate = sample_rate;
        Ok(())
    }

    fn reset(&mut self) {
        self.gain = 1.0;
    }

    fn input_count(&self) -> ChannelCount {
        2
    }

    fn output_count(&self) -> ChannelCount {
        2
    }

    fn parameter_count(&self) -> usize {
        1
    }

    fn parameter_name(&self, index: i32) -> String {
        if index == 0 {
            "Gain".to_string()
        } else {
            String::new()
        }
    }

    fn set_parameter(&mut self, index: i32, value: f32) {
        if index == 0 {
            self.gain = value;
        }
    }

    fn parameter(&self, index: i32) -> f32 {
        if index == 0 {
            self.gain
        } else {
            0.0
        }
    }

    fn parameter_default(&self, index: i32) -> f32 {
        if index == 0 {
            1.0
        } else {
            0.0
        }
    }

    fn program_count(&self) -> usize {
        1
    }

    fn program_name(&self, index: i32) -> String {
        if index == self.current_program {
            "Default (current)".to_string()
        } else {
            "Default".to_string()
        }
    }

    fn set_current_program(&mut self, index: i32) {
        self.current_program = index;
    }

    fn has_midi_input(&self) -> bool {
        false
    }

    fn send_midi_data(&mut self, _events: &[MidiEvent]) -> Result<(), PluginError> {
        Err(PluginError::Rejected("no midi input".to_string()))
    }

    fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) {
        for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
            for (sample_in, sample_out) in input.iter().zip(output.iter_mut()) {
                *sample_out = sample_in * self.gain;
            }
        }
    }

    fn get_blob(&self) -> Vec<u8> {
        self.gain.to_le_bytes().to_vec()
    }

    fn set_blob(&mut self, data: &[u8]) -> Result<(), PluginError> {
        let bytes: [u8; 4] = data
            .try_into()
            .map_err(|_| PluginError::Rejected("blob is not 4 bytes".to_string()))?;
        self.gain = f32::from_le_bytes(bytes);
        Ok(())
    }

    fn warn(&mut self, _message: &str) -> bool {
        true
    }

    fn show_gui(&mut self, _gui_data: &str) {}

    fn hide_gui(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_applies_gain() {
        let mut plugin = GainPlugin::default();
        plugin.set_parameter(0, 2.0);
        let input = vec![1.0_f32, 2.0, 3.0];
        let mut output = vec![0.0_f32; 3];
        plugin.process(&[&input], &mut [&mut output]);
        assert_eq!(output, vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn reset_restores_unity_gain() {
        let mut plugin = GainPlugin::default();
        plugin.set_parameter(0, 0.2);
        plugin.reset();
        assert!((plugin.parameter(0) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn blob_round_trips_gain() {
        let mut plugin = GainPlugin::default();
        plugin.set_parameter(0, 0.42);
        let blob = plugin.get_blob();
        let mut restored = GainPlugin::default();
        restored.set_blob(&blob).unwrap();
        assert!((restored.parameter(0) - 0.42).abs() < f32::EPSILON);
    }
}
