//! The host-facing API: every call the native plugin host makes against a
//! hosted plugin running inside the helper process. Query opcodes go out
//! over the blocking control pipes; realtime opcodes go out over the
//! non-blocking shared ring, synchronized by the two control-region
//! semaphores the same way the original client's `waitForServer` does.

use rplugin_core::{ChannelCount, Error, Frames, Result, SampleRate};
use rplugin_ipc::{AudioRegion, ClientTransport, MidiEventWire, Opcode};
use tracing::warn;

use crate::lifecycle::HelperLifecycle;

/// Thin wrapper the client reaches for on every call: posts to the
/// server-wakeup semaphore after a ring write, then waits (bounded) for the
/// server to post back, surfacing a timeout as connection loss exactly like
/// a stalled helper process would.
fn ring_round_trip<T>(
    transport: &ClientTransport,
    write: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let result = write()?;
    transport.ring().commit_write()?;
    transport.run_server_sem().post()?;
    transport.run_client_sem().wait_default_timeout()?;
    Ok(result)
}

/// Host-side endpoint. Every public method here corresponds to exactly one
/// opcode and dispatches it to whichever channel that opcode is legal on.
/// Tracks the input/output channel counts and block size the host has
/// established so far, creating and resizing the shared audio region (§3)
/// the moment all three are known.
pub struct ClientEndpoint {
    helper: HelperLifecycle,
    audio: Option<AudioRegion>,
    input_count: Option<ChannelCount>,
    output_count: Option<ChannelCount>,
    buffer_size: Option<Frames>,
}

impl ClientEndpoint {
    #[must_use]
    pub fn new(helper: HelperLifecycle) -> Self {
        Self {
            helper,
            audio: None,
            input_count: None,
            output_count: None,
            buffer_size: None,
        }
    }

    fn control_request(&mut self, opcode: Opcode) -> Result<()> {
        self.helper.request_pipe_mut().write_opcode(opcode)
    }

    /// Creates the audio region on the first call once all three dimensions
    /// are known, resizes it on every subsequent call.
    fn sync_audio_region(&mut self) -> Result<()> {
        let (Some(inputs), Some(outputs), Some(block_size)) =
            (self.input_count, self.output_count, self.buffer_size)
        else {
            return Ok(());
        };
        match self.audio.as_mut() {
            Some(region) => region.resize(inputs, outputs, block_size),
            None => {
                let name = self.helper.transport().paths().audio_shm_name.clone();
                self.audio = Some(AudioRegion::create(&name, inputs, outputs, block_size)?);
                Ok(())
            }
        }
    }

    pub fn get_version(&mut self) -> Result<i32> {
        self.control_request(Opcode::GetVersion)?;
        self.helper.response_pipe_mut().read_int()
    }

    pub fn get_name(&mut self) -> Result<String> {
        self.control_request(Opcode::GetName)?;
        self.helper.response_pipe_mut().read_string()
    }

    pub fn get_maker(&mut self) -> Result<String> {
        self.control_request(Opcode::GetMaker)?;
        self.helper.response_pipe_mut().read_string()
    }

    pub fn set_buffer_size(&mut self, frames: Frames) -> Result<()> {
        let transport = self.helper.transport();
        ring_round_trip(transport, || {
            let ring = transport.ring();
            ring.write_opcode(Opcode::SetBufferSize)?;
            ring.write_int(frames as i32)
        })?;
        self.buffer_size = Some(frames);
        self.sync_audio_region()
    }

    pub fn set_sample_rate(&mut self, sample_rate: SampleRate) -> Result<()> {
        let transport = self.helper.transport();
        ring_round_trip(transport, || {
            let ring = transport.ring();
            ring.write_opcode(Opcode::SetSampleRate)?;
            ring.write_int(sample_rate as i32)
        })
    }

    pub fn reset(&mut self) -> Result<()> {
        self.control_request(Opcode::Reset)
    }

    pub fn input_count(&mut self) -> Result<ChannelCount> {
        self.control_request(Opcode::GetInputCount)?;
        let count = self.helper.response_pipe_mut().read_int()? as ChannelCount;
        self.input_count = Some(count);
        self.sync_audio_region()?;
        Ok(count)
    }

    pub fn output_count(&mut self) -> Result<ChannelCount> {
        self.control_request(Opcode::GetOutputCount)?;
        let count = self.helper.response_pipe_mut().read_int()? as ChannelCount;
        self.output_count = Some(count);
        self.sync_audio_region()?;
        Ok(count)
    }

    pub fn parameter_count(&mut self) -> Result<usize> {
        self.control_request(Opcode::GetParameterCount)?;
        Ok(self.helper.response_pipe_mut().read_int()? as usize)
    }

    pub fn parameter_name(&mut self, index: i32) -> Result<String> {
        self.control_request(Opcode::GetParameterName)?;
        self.helper.request_pipe_mut().write_int(index)?;
        self.helper.response_pipe_mut().read_string()
    }

    /// Fire-and-forget: parameter automation is realtime traffic and does
    /// not wait for an acknowledgment beyond the server's wakeup.
    pub fn set_parameter(&mut self, index: i32, value: f32) -> Result<()> {
        let transport = self.helper.transport();
        ring_round_trip(transport, || {
            let ring = transport.ring();
            ring.write_opcode(Opcode::SetParameter)?;
            ring.write_int(index)?;
            ring.write_float(value)
        })
    }

    pub fn parameter(&mut self, index: i32) -> Result<f32> {
        self.control_request(Opcode::GetParameter)?;
        self.helper.request_pipe_mut().write_int(index)?;
        self.helper.response_pipe_mut().read_float()
    }

    pub fn parameter_default(&mut self, index: i32) -> Result<f32> {
        self.control_request(Opcode::GetParameterDefault)?;
        self.helper.request_pipe_mut().write_int(index)?;
        self.helper.response_pipe_mut().read_float()
    }

    /// Bulk range fetch: raw floats for parameters `[p0, pn)`, no per-value
    /// length prefix, matching the original's `getParameters` shape.
    pub fn parameters(&mut self, p0: i32, pn: i32) -> Result<Vec<f32>> {
        self.control_request(Opcode::GetParameters)?;
        self.helper.request_pipe_mut().write_int(p0)?;
        self.helper.request_pipe_mut().write_int(pn)?;
        let count = (pn - p0).max(0) as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.helper.response_pipe_mut().read_float()?);
        }
        Ok(values)
    }

    pub fn program_count(&mut self) -> Result<usize> {
        self.control_request(Opcode::GetProgramCount)?;
        Ok(self.helper.response_pipe_mut().read_int()? as usize)
    }

    pub fn program_name(&mut self, index: i32) -> Result<String> {
        self.control_request(Opcode::GetProgramName)?;
        self.helper.request_pipe_mut().write_int(index)?;
        self.helper.response_pipe_mut().read_string()
    }

    pub fn set_current_program(&mut self, index: i32) -> Result<()> {
        let transport = self.helper.transport();
        ring_round_trip(transport, || {
            let ring = transport.ring();
            ring.write_opcode(Opcode::SetCurrentProgram)?;
            ring.write_int(index)
        })
    }

    pub fn has_midi_input(&mut self) -> Result<bool> {
        self.control_request(Opcode::HasMidiInput)?;
        self.helper.response_pipe_mut().read_bool()
    }

    pub fn send_midi_data(&mut self, events: &[MidiEventWire]) -> Result<()> {
        let transport = self.helper.transport();
        ring_round_trip(transport, || {
            let ring = transport.ring();
            ring.write_opcode(Opcode::SendMidiData)?;
            ring.write_midi_batch(events)
        })
    }

    /// Processes one audio block: copies `inputs` into the shared audio
    /// region, signals the helper over the ring, waits for its completion
    /// post, then copies the plugin's output back out. Fails fast if
    /// buffer size or either channel count hasn't been established yet.
    pub fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        if self.input_count.is_none() || self.output_count.is_none() || self.buffer_size.is_none() {
            return Err(Error::ProtocolViolation(
                "process called before buffer size and channel counts were established".to_string(),
            ));
        }

        {
            let audio = self
                .audio
                .as_mut()
                .ok_or_else(|| Error::ProtocolViolation("audio region not yet mapped".to_string()))?;
            for (channel, samples) in inputs.iter().enumerate() {
                let dst = audio.input_channel_mut(channel)?;
                if dst.len() != samples.len() {
                    return Err(Error::ProtocolViolation(format!(
                        "input channel {channel} block length {} != configured block size {}",
                        samples.len(),
                        dst.len()
                    )));
                }
                dst.copy_from_slice(samples);
            }
        }

        let transport = self.helper.transport();
        ring_round_trip(transport, || transport.ring().write_opcode(Opcode::Process))?;

        let audio = self
            .audio
            .as_ref()
            .ok_or_else(|| Error::ProtocolViolation("audio region not yet mapped".to_string()))?;
        for (channel, samples) in outputs.iter_mut().enumerate() {
            let src = audio.output_channel(channel)?;
            if src.len() != samples.len() {
                return Err(Error::ProtocolViolation(format!(
                    "output channel {channel} block length {} != configured block size {}",
                    samples.len(),
                    src.len()
                )));
            }
            samples.copy_from_slice(src);
        }
        Ok(())
    }

    pub fn is_ready(&mut self) -> Result<bool> {
        self.control_request(Opcode::IsReady)?;
        self.helper.response_pipe_mut().read_bool()
    }

    pub fn set_debug_level(&mut self, level: rplugin_core::DebugLevel) -> Result<()> {
        self.control_request(Opcode::SetDebugLevel)?;
        self.helper.request_pipe_mut().write_int(level as i32)
    }

    /// Two-way debug message: the helper's reply indicates whether it
    /// wants the host to keep running (matching the original's `warn()`
    /// returning a bool the caller may use to abort).
    pub fn warn(&mut self, message: &str) -> Result<bool> {
        self.control_request(Opcode::Warn)?;
        self.helper.request_pipe_mut().write_string(message)?;
        let keep_running = self.helper.response_pipe_mut().read_bool()?;
        if !keep_running {
            warn!(%message, "helper requested shutdown after warning");
        }
        Ok(keep_running)
    }

    pub fn show_gui(&mut self, gui_data: &str) -> Result<()> {
        self.control_request(Opcode::ShowGui)?;
        self.helper.request_pipe_mut().write_string(gui_data)
    }

    pub fn hide_gui(&mut self) -> Result<()> {
        self.control_request(Opcode::HideGui)
    }

    pub fn get_blob(&mut self) -> Result<Vec<u8>> {
        self.control_request(Opcode::GetBlob)?;
        self.helper.response_pipe_mut().read_blob()
    }

    pub fn set_blob(&mut self, data: &[u8]) -> Result<()> {
        self.control_request(Opcode::SetBlob)?;
        self.helper.request_pipe_mut().write_blob(data)
    }

    pub fn terminate(&mut self) -> Result<()> {
        let _ = self.control_request(Opcode::Terminate);
        self.helper.drain_and_reap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rplugin_ipc::TransportPaths;
    use serial_test::serial;
    use tempfile::tempdir;

    fn test_paths(dir: &std::path::Path, tag: &str) -> TransportPaths {
        TransportPaths {
            request_pipe: dir.join(format!("req_{tag}")),
            response_pipe: dir.join(format!("resp_{tag}")),
            control_shm_name: format!("/rplugin_ctrl_endpoint_test_{tag}"),
            audio_shm_name: format!("/rplugin_audio_endpoint_test_{tag}"),
        }
    }

    /// `ring_round_trip` is the primitive every realtime opcode method
    /// (`set_buffer_size`, `set_parameter`, `process`, ...) goes through.
    /// Rather than spin up a real helper process, simulate a server that
    /// already posted its reply: the wait should return immediately, and
    /// the write closure's opcode should land on the ring exactly once.
    #[test]
    #[serial]
    fn ring_round_trip_writes_commits_posts_and_waits() {
        let dir = tempdir().unwrap();
        let transport = ClientTransport::create(test_paths(dir.path(), "happy")).unwrap();
        transport.run_client_sem().post().unwrap();

        let result = ring_round_trip(&transport, || {
            let ring = transport.ring();
            ring.write_opcode(Opcode::Process)
        });
        assert!(result.is_ok());

        assert!(transport.run_server_sem().try_wait().unwrap());
        assert!(!transport.run_server_sem().try_wait().unwrap());

        let ring = transport.ring();
        assert_eq!(ring.read_opcode().unwrap(), Opcode::Process);
    }

    /// If nobody ever posts the client-wakeup semaphore, the round trip
    /// must surface connection loss rather than hang the caller.
    #[test]
    #[serial]
    fn ring_round_trip_times_out_as_connection_lost() {
        let dir = tempdir().unwrap();
        let transport = ClientTransport::create(test_paths(dir.path(), "timeout")).unwrap();

        let result = ring_round_trip(&transport, || {
            let ring = transport.ring();
            ring.write_opcode(Opcode::SetParameter)
        });
        assert!(matches!(result, Err(Error::ConnectionLost)));
    }
}
