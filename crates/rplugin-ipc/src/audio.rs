//! The shared audio I/O region: the raw float buffer `process` actually
//! moves sample data through. The ring only ever carries the `Process`
//! opcode itself; this is the other half of §3's two-region transport,
//! mapped lazily once channel counts and block size are known and resized
//! (via [`SharedMapping::resize`]) whenever any of the three changes.

use std::path::Path;
use std::slice;

use rplugin_core::{ChannelCount, Error, Frames, Result, SAMPLE_BYTES};

use crate::shm::SharedMapping;

fn byte_len(inputs: ChannelCount, outputs: ChannelCount, block_size: Frames) -> usize {
    (inputs + outputs) * block_size * SAMPLE_BYTES
}

/// `inputs` channel blocks followed by `outputs` channel blocks, each a
/// contiguous run of `block_size` native-endian `f32` samples.
pub struct AudioRegion {
    mapping: SharedMapping,
    inputs: ChannelCount,
    outputs: ChannelCount,
    block_size: Frames,
}

impl AudioRegion {
    /// Creates the shared-memory object (client side).
    pub fn create(name: &str, inputs: ChannelCount, outputs: ChannelCount, block_size: Frames) -> Result<Self> {
        let mapping = SharedMapping::create(name, byte_len(inputs, outputs, block_size))?;
        Ok(Self { mapping, inputs, outputs, block_size })
    }

    /// Opens a region the client already created (helper side).
    pub fn open_existing(path: &Path, inputs: ChannelCount, outputs: ChannelCount, block_size: Frames) -> Result<Self> {
        let mapping = SharedMapping::open_existing(path, byte_len(inputs, outputs, block_size))?;
        Ok(Self { mapping, inputs, outputs, block_size })
    }

    /// Resizes the region in place when channel counts or block size change.
    pub fn resize(&mut self, inputs: ChannelCount, outputs: ChannelCount, block_size: Frames) -> Result<()> {
        self.mapping.resize(byte_len(inputs, outputs, block_size))?;
        self.inputs = inputs;
        self.outputs = outputs;
        self.block_size = block_size;
        Ok(())
    }

    #[must_use]
    pub const fn inputs(&self) -> ChannelCount {
        self.inputs
    }

    #[must_use]
    pub const fn outputs(&self) -> ChannelCount {
        self.outputs
    }

    #[must_use]
    pub const fn block_size(&self) -> Frames {
        self.block_size
    }

    fn check_channel(&self, channel: ChannelCount, is_output: bool) -> Result<()> {
        let count = if is_output { self.outputs } else { self.inputs };
        if channel >= count {
            return Err(Error::ProtocolViolation(format!(
                "audio channel {channel} out of range (have {count})"
            )));
        }
        Ok(())
    }

    fn channel_offset(&self, channel: ChannelCount, is_output: bool) -> usize {
        let base = if is_output { self.inputs } else { 0 };
        (base + channel) * self.block_size
    }

    /// Input channel block, written by the client before posting `Process`,
    /// read by the server before calling the plugin.
    pub fn input_channel(&self, channel: ChannelCount) -> Result<&[f32]> {
        self.check_channel(channel, false)?;
        let offset = self.channel_offset(channel, false);
        // SAFETY: offset/len are within the mapping's byte length by
        // construction (`byte_len` sizes exactly `(inputs+outputs)*block_size`
        // floats, and `check_channel` bounds `channel`).
        Ok(unsafe { slice::from_raw_parts(self.mapping.as_ptr().cast::<f32>().add(offset), self.block_size) })
    }

    pub fn input_channel_mut(&mut self, channel: ChannelCount) -> Result<&mut [f32]> {
        self.check_channel(channel, false)?;
        let offset = self.channel_offset(channel, false);
        // SAFETY: see `input_channel`.
        Ok(unsafe { slice::from_raw_parts_mut(self.mapping.as_ptr().cast::<f32>().add(offset), self.block_size) })
    }

    /// Output channel block, written by the server after calling the
    /// plugin, read by the client after the server's completion post.
    pub fn output_channel(&self, channel: ChannelCount) -> Result<&[f32]> {
        self.check_channel(channel, true)?;
        let offset = self.channel_offset(channel, true);
        // SAFETY: see `input_channel`.
        Ok(unsafe { slice::from_raw_parts(self.mapping.as_ptr().cast::<f32>().add(offset), self.block_size) })
    }

    pub fn output_channel_mut(&mut self, channel: ChannelCount) -> Result<&mut [f32]> {
        self.check_channel(channel, true)?;
        let offset = self.channel_offset(channel, true);
        // SAFETY: see `input_channel`.
        Ok(unsafe { slice::from_raw_parts_mut(self.mapping.as_ptr().cast::<f32>().add(offset), self.block_size) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn byte_len_covers_all_channels_and_frames() {
        assert_eq!(byte_len(2, 2, 64), 4 * 64 * 4);
    }

    #[test]
    #[serial]
    fn input_and_output_channels_are_disjoint() {
        let name = "/rplugin_audio_test_disjoint";
        let mut region = AudioRegion::create(name, 2, 2, 8).unwrap();
        region.input_channel_mut(0).unwrap().fill(1.0);
        region.input_channel_mut(1).unwrap().fill(2.0);
        region.output_channel_mut(0).unwrap().fill(3.0);
        region.output_channel_mut(1).unwrap().fill(4.0);

        assert_eq!(region.input_channel(0).unwrap(), &[1.0; 8]);
        assert_eq!(region.input_channel(1).unwrap(), &[2.0; 8]);
        assert_eq!(region.output_channel(0).unwrap(), &[3.0; 8]);
        assert_eq!(region.output_channel(1).unwrap(), &[4.0; 8]);

        drop(region);
        let _ = crate::shm::unlink(name);
    }

    #[test]
    #[serial]
    fn resize_changes_dimensions_and_preserves_api() {
        let name = "/rplugin_audio_test_resize";
        let mut region = AudioRegion::create(name, 1, 1, 4).unwrap();
        region.resize(2, 3, 16).unwrap();
        assert_eq!(region.inputs(), 2);
        assert_eq!(region.outputs(), 3);
        assert_eq!(region.block_size(), 16);
        assert!(region.input_channel(1).is_ok());
        assert!(region.output_channel(2).is_ok());
        drop(region);
        let _ = crate::shm::unlink(name);
    }

    #[test]
    #[serial]
    fn out_of_range_channel_is_rejected() {
        let name = "/rplugin_audio_test_oob";
        let region = AudioRegion::create(name, 1, 1, 4).unwrap();
        assert!(region.input_channel(1).is_err());
        assert!(region.output_channel(1).is_err());
        drop(region);
        let _ = crate::shm::unlink(name);
    }
}
