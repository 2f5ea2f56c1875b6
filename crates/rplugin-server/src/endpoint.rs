//! Helper-side dispatch loop: pulls opcodes off the control pipes and the
//! shared ring and calls the corresponding [`HostedPlugin`] method.
//!
//! The plugin instance is mutex-guarded and shared between two dispatchers
//! that run on separate threads: [`ControlDispatcher`] blocks indefinitely
//! on the request pipe (a UI-driven parameter query, say, can take
//! arbitrarily long to arrive), while [`RingDispatcher`] services the
//! realtime ring and must never be stalled behind that read. `process`
//! itself never blocks on the plugin mutex: a contended lock during a
//! process call means the host gets a zero-filled block for that cycle
//! rather than a stall, mirroring the original's preference for silence
//! over a realtime-thread priority inversion.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, TryLockError};

use rplugin_core::{DebugLevel, Error, Frames, Result};
use rplugin_ipc::{AudioRegion, ControlPipe, Opcode, ServerTransport};
use rplugin_plugin::{HostedPlugin, MidiEvent, PluginEvent};
use tracing::{debug, error, warn};

use crate::notify::NotifyRing;
use crate::watchdog::Heartbeat;

type SharedPlugin = Arc<Mutex<Box<dyn HostedPlugin>>>;

/// Owns both halves of the helper's dispatch before they're split onto their
/// separate threads, and the audio-region shm path the ring half maps
/// lazily once it knows the plugin's channel counts and a cached buffer
/// size.
pub struct ServerEndpoint {
    control: ControlDispatcher,
    ring: RingDispatcher,
}

impl ServerEndpoint {
    #[must_use]
    pub fn new(
        transport: ServerTransport,
        request: ControlPipe,
        response: ControlPipe,
        plugin: Box<dyn HostedPlugin>,
        heartbeat: Heartbeat,
        audio_shm_path: PathBuf,
    ) -> Self {
        let plugin: SharedPlugin = Arc::new(Mutex::new(plugin));
        Self {
            control: ControlDispatcher {
                request,
                response,
                plugin: plugin.clone(),
                debug_level: DebugLevel::None,
            },
            ring: RingDispatcher {
                transport,
                plugin,
                notify: NotifyRing::new(),
                heartbeat,
                audio: None,
                audio_shm_path,
                buffer_size: None,
            },
        }
    }

    /// Splits into the two independently-owned dispatch halves, each bound
    /// for its own thread.
    #[must_use]
    pub fn split(self) -> (ControlDispatcher, RingDispatcher) {
        (self.control, self.ring)
    }
}

/// Blocking half: services the request/response control pipes. Runs on a
/// thread at default OS scheduling priority, since a slow UI-side query
/// must never be mistaken for a stuck realtime thread.
pub struct ControlDispatcher {
    request: ControlPipe,
    response: ControlPipe,
    plugin: SharedPlugin,
    debug_level: DebugLevel,
}

impl ControlDispatcher {
    /// Services exactly one control-pipe request. Blocks on the request
    /// pipe's `read_opcode` until one arrives; this is the cold path and is
    /// expected to block.
    pub fn dispatch_control(&mut self) -> Result<()> {
        let opcode = self.request.read_opcode()?;
        if !opcode.legal_on_control() {
            return Err(Error::ProtocolViolation(format!(
                "{opcode:?} is not legal on the control channel"
            )));
        }
        self.handle_control_opcode(opcode)
    }

    fn handle_control_opcode(&mut self, opcode: Opcode) -> Result<()> {
        let mut plugin = self.plugin.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match opcode {
            Opcode::GetVersion => {
                self.response.write_int(plugin.info().version as i32)?;
            }
            Opcode::GetName => self.response.write_string(&plugin.info().name)?,
            Opcode::GetMaker => self.response.write_string(&plugin.info().maker)?,
            Opcode::Reset => plugin.reset(),
            Opcode::GetInputCount => self.response.write_int(plugin.input_count() as i32)?,
            Opcode::GetOutputCount => self.response.write_int(plugin.output_count() as i32)?,
            Opcode::GetParameterCount => {
                self.response.write_int(plugin.parameter_count() as i32)?;
            }
            Opcode::GetParameterName => {
                let index = self.request.read_int()?;
                self.response.write_string(&plugin.parameter_name(index))?;
            }
            Opcode::GetParameter => {
                let index = self.request.read_int()?;
                self.response.write_float(plugin.parameter(index))?;
            }
            Opcode::GetParameterDefault => {
                let index = self.request.read_int()?;
                self.response.write_float(plugin.parameter_default(index))?;
            }
            Opcode::GetParameters => {
                let p0 = self.request.read_int()?;
                let pn = self.request.read_int()?;
                for index in p0..pn {
                    self.response.write_float(plugin.parameter(index))?;
                }
            }
            Opcode::GetProgramCount => self.response.write_int(plugin.program_count() as i32)?,
            Opcode::GetProgramName => {
                let index = self.request.read_int()?;
                self.response.write_string(&plugin.program_name(index))?;
            }
            Opcode::HasMidiInput => self.response.write_bool(plugin.has_midi_input())?,
            Opcode::IsReady => self.response.write_bool(true)?,
            Opcode::SetDebugLevel => {
                let level = self.request.read_int()?;
                self.debug_level = DebugLevel::from_i32(level);
            }
            Opcode::Warn => {
                let message = self.request.read_string()?;
                let keep_running = plugin.warn(&message);
                self.response.write_bool(keep_running)?;
            }
            Opcode::ShowGui => {
                let gui_data = self.request.read_string()?;
                plugin.show_gui(&gui_data);
            }
            Opcode::HideGui => plugin.hide_gui(),
            Opcode::GetBlob => self.response.write_blob(&plugin.get_blob())?,
            Opcode::SetBlob => {
                let data = self.request.read_blob()?;
                if let Err(e) = plugin.set_blob(&data) {
                    error!(error = %e, "plugin rejected set_blob");
                }
            }
            Opcode::Terminate => {
                debug!("terminate requested over control channel");
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "{other:?} reached control dispatch but has no control handler"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn debug_level(&self) -> DebugLevel {
        self.debug_level
    }
}

/// Realtime half: services the shared ring, including the `Process` opcode
/// and the shared audio region it reads and writes. Meant to run on a
/// `SCHED_FIFO`-priority thread alongside the watchdog.
pub struct RingDispatcher {
    transport: ServerTransport,
    plugin: SharedPlugin,
    notify: NotifyRing,
    heartbeat: Heartbeat,
    audio: Option<AudioRegion>,
    audio_shm_path: PathBuf,
    buffer_size: Option<Frames>,
}

impl RingDispatcher {
    /// Services exactly one ring-based (realtime) request, waiting on the
    /// server-wakeup semaphore the client posts after committing a write,
    /// and posting the client-wakeup semaphore back once handled.
    pub fn dispatch_ring(&mut self) -> Result<()> {
        self.transport.run_server_sem().wait_default_timeout()?;
        self.dispatch_ring_inner()
    }

    /// Non-blocking counterpart to [`Self::dispatch_ring`]: returns
    /// `Ok(false)` immediately if the client hasn't posted since the last
    /// check, instead of waiting up to the connection-loss timeout.
    pub fn try_dispatch_ring(&mut self) -> Result<bool> {
        if !self.transport.run_server_sem().try_wait()? {
            return Ok(false);
        }
        self.dispatch_ring_inner().map(|()| true)
    }

    fn dispatch_ring_inner(&mut self) -> Result<()> {
        let ring = self.transport.ring();
        let opcode = ring.read_opcode()?;
        if !opcode.legal_on_ring() {
            self.transport.run_client_sem().post()?;
            return Err(Error::ProtocolViolation(format!(
                "{opcode:?} is not legal on the ring channel"
            )));
        }
        let result = self.handle_ring_opcode(opcode);
        self.transport.run_client_sem().post()?;
        result
    }

    /// Maps the audio region the first time a `Process` opcode arrives, or
    /// resizes it if the plugin's channel counts changed since. Returns
    /// `Ok(None)` (instead of an error) when the buffer size isn't known
    /// yet, per the lazy-sizing rule: the caller should skip the plugin call
    /// for this cycle rather than treat it as a protocol violation.
    fn ensure_audio_region<'a>(
        audio: &'a mut Option<AudioRegion>,
        audio_shm_path: &std::path::Path,
        inputs: rplugin_core::ChannelCount,
        outputs: rplugin_core::ChannelCount,
        buffer_size: Option<Frames>,
    ) -> Result<Option<&'a mut AudioRegion>> {
        let Some(buffer_size) = buffer_size else {
            warn!("process opcode arrived before buffer size was set, skipping this cycle");
            return Ok(None);
        };
        match audio {
            Some(region) => {
                if region.inputs() != inputs || region.outputs() != outputs || region.block_size() != buffer_size {
                    region.resize(inputs, outputs, buffer_size)?;
                }
            }
            None => {
                *audio = Some(AudioRegion::open_existing(audio_shm_path, inputs, outputs, buffer_size)?);
            }
        }
        Ok(audio.as_mut())
    }

    fn handle_ring_opcode(&mut self, opcode: Opcode) -> Result<()> {
        if opcode == Opcode::Process {
            return self.handle_process();
        }
        let ring = self.transport.ring();
        let mut plugin = self.plugin.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match opcode {
            Opcode::SetBufferSize => {
                let frames = ring.read_int()? as usize;
                self.buffer_size = Some(frames);
                let _ = plugin.set_buffer_size(frames);
            }
            Opcode::SetSampleRate => {
                let sample_rate = ring.read_int()? as u32;
                let _ = plugin.set_sample_rate(sample_rate);
            }
            Opcode::SetParameter => {
                let index = ring.read_int()?;
                let value = ring.read_float()?;
                plugin.set_parameter(index, value);
            }
            Opcode::SetCurrentProgram => {
                let index = ring.read_int()?;
                plugin.set_current_program(index);
            }
            Opcode::SendMidiData => {
                let events = ring.read_midi_batch()?;
                let converted: Vec<MidiEvent> = events
                    .into_iter()
                    .map(|e| MidiEvent {
                        bytes: e.bytes,
                        frame_offset: e.frame_offset,
                    })
                    .collect();
                if let Err(e) = plugin.send_midi_data(&converted) {
                    error!(error = %e, "plugin rejected midi data");
                }
            }
            Opcode::Reset | Opcode::Terminate | Opcode::SetDebugLevel | Opcode::ShowGui | Opcode::HideGui => {
                // Lifecycle opcodes legal on either channel; the ring side
                // just needs to not treat them as unknown.
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "{other:?} reached ring dispatch but has no ring handler"
                )));
            }
        }
        Ok(())
    }

    /// Handles the `Process` opcode on its own path: a contended plugin
    /// mutex here means a control-channel call is in flight, so this tries
    /// the lock instead of blocking the realtime thread behind it, falling
    /// back to silence for the cycle exactly as the original prefers
    /// silence over a priority inversion.
    fn handle_process(&mut self) -> Result<()> {
        self.heartbeat.pet();
        let events = match self.plugin.try_lock() {
            Ok(mut plugin) => Self::run_process_cycle(
                &mut **plugin,
                &mut self.audio,
                &self.audio_shm_path,
                self.buffer_size,
            )?,
            Err(TryLockError::WouldBlock) => {
                warn!("plugin mutex contended during process, returning silence this cycle");
                if let Some(region) = self.audio.as_mut() {
                    for channel in 0..region.outputs() {
                        region.output_channel_mut(channel)?.fill(0.0);
                    }
                }
                Vec::new()
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                let mut plugin = poisoned.into_inner();
                Self::run_process_cycle(
                    &mut **plugin,
                    &mut self.audio,
                    &self.audio_shm_path,
                    self.buffer_size,
                )?
            }
        };
        for event in events {
            self.notify.push(event);
        }
        Ok(())
    }

    /// Copies inputs out of the shared region, calls the plugin, copies
    /// outputs back in. Skips the plugin call entirely (but still returns
    /// `Ok`) when the buffer size hasn't been learned yet.
    fn run_process_cycle(
        plugin: &mut dyn HostedPlugin,
        audio: &mut Option<AudioRegion>,
        audio_shm_path: &std::path::Path,
        buffer_size: Option<Frames>,
    ) -> Result<Vec<PluginEvent>> {
        let inputs = plugin.input_count();
        let outputs = plugin.output_count();
        if let Some(region) = Self::ensure_audio_region(audio, audio_shm_path, inputs, outputs, buffer_size)? {
            let mut input_buffers = Vec::with_capacity(inputs);
            for channel in 0..inputs {
                input_buffers.push(region.input_channel(channel)?);
            }
            let block_size = region.block_size();
            let mut scratch = vec![0.0f32; outputs * block_size];
            {
                let mut output_refs: Vec<&mut [f32]> = scratch.chunks_mut(block_size).collect();
                plugin.process(&input_buffers, &mut output_refs);
            }
            for (channel, block) in scratch.chunks(block_size).enumerate() {
                region.output_channel_mut(channel)?.copy_from_slice(block);
            }
        }
        Ok(plugin.poll_events())
    }

    /// Drains and returns pending plugin-originated events (parameter
    /// automation, begin/end-edit brackets) for delivery to the host's UI
    /// side channel.
    pub fn drain_notifications(&mut self) -> Vec<PluginEvent> {
        self.notify.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rplugin_ipc::{ClientTransport, TransportPaths};
    use rplugin_plugin::PluginInfo;
    use serial_test::serial;
    use tempfile::tempdir;

    struct EchoPlugin {
        gain: f32,
    }

    impl HostedPlugin for EchoPlugin {
        fn info(&self) -> PluginInfo {
            PluginInfo {
                version: 1.0,
                name: "echo".to_string(),
                maker: "test".to_string(),
            }
        }
        fn set_buffer_size(&mut self, _frames: Frames) -> std::result::Result<(), rplugin_plugin::PluginError> {
            Ok(())
        }
        fn set_sample_rate(
            &mut self,
            _sample_rate: rplugin_core::SampleRate,
        ) -> std::result::Result<(), rplugin_plugin::PluginError> {
            Ok(())
        }
        fn reset(&mut self) {
            self.gain = 1.0;
        }
        fn input_count(&self) -> rplugin_core::ChannelCount {
            1
        }
        fn output_count(&self) -> rplugin_core::ChannelCount {
            1
        }
        fn parameter_count(&self) -> usize {
            1
        }
        fn parameter_name(&self, _index: i32) -> String {
            "Gain".to_string()
        }
        fn set_parameter(&mut self, index: i32, value: f32) {
            if index == 0 {
                self.gain = value;
            }
        }
        fn parameter(&self, _index: i32) -> f32 {
            self.gain
        }
        fn parameter_default(&self, _index: i32) -> f32 {
            1.0
        }
        fn program_count(&self) -> usize {
            0
        }
        fn program_name(&self, _index: i32) -> String {
            String::new()
        }
        fn set_current_program(&mut self, _index: i32) {}
        fn has_midi_input(&self) -> bool {
            false
        }
        fn send_midi_data(
            &mut self,
            _events: &[MidiEvent],
        ) -> std::result::Result<(), rplugin_plugin::PluginError> {
            Ok(())
        }
        fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) {
            for (dst, src) in outputs[0].iter_mut().zip(inputs[0].iter()) {
                *dst = src * self.gain;
            }
        }
        fn get_blob(&self) -> Vec<u8> {
            Vec::new()
        }
        fn set_blob(&mut self, _data: &[u8]) -> std::result::Result<(), rplugin_plugin::PluginError> {
            Ok(())
        }
        fn warn(&mut self, _message: &str) -> bool {
            true
        }
        fn show_gui(&mut self, _gui_data: &str) {}
        fn hide_gui(&mut self) {}
    }

    fn test_paths(dir: &std::path::Path, tag: &str) -> TransportPaths {
        TransportPaths {
            request_pipe: dir.join(format!("req_{tag}")),
            response_pipe: dir.join(format!("resp_{tag}")),
            control_shm_name: format!("/rplugin_ctrl_test_{tag}"),
            audio_shm_name: format!("/rplugin_audio_test_{tag}"),
        }
    }

    #[test]
    #[serial]
    fn process_opcode_maps_region_lazily_and_runs_the_plugin() {
        let dir = tempdir().unwrap();
        let paths = test_paths(dir.path(), "process");
        let control_shm = paths.control_shm_name.clone();
        let audio_shm = paths.audio_shm_name.clone();
        let client = ClientTransport::create(paths).unwrap();

        let client_audio = AudioRegion::create(&audio_shm, 1, 1, 4).unwrap();

        let plugin: Box<dyn HostedPlugin> = Box::new(EchoPlugin { gain: 2.0 });
        let server_transport = ServerTransport::open(std::path::Path::new(&control_shm)).unwrap();
        let mut ring = RingDispatcher {
            transport: server_transport,
            plugin: Arc::new(Mutex::new(plugin)),
            notify: NotifyRing::new(),
            heartbeat: Heartbeat::new(),
            audio: None,
            audio_shm_path: std::path::PathBuf::from(&audio_shm),
            buffer_size: Some(4),
        };

        let mut input_region = client_audio;
        input_region.input_channel_mut(0).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);

        client.ring().write_opcode(Opcode::Process).unwrap();
        client.ring().commit_write().unwrap();
        client.run_server_sem().post().unwrap();

        ring.dispatch_ring().unwrap();
        assert!(ring.audio.is_some());

        assert_eq!(
            input_region.output_channel(0).unwrap(),
            &[2.0, 4.0, 6.0, 8.0]
        );

        drop(client);
        drop(input_region);
        let _ = rplugin_ipc::shm::unlink(&audio_shm);
    }

    #[test]
    #[serial]
    fn process_opcode_is_skipped_when_buffer_size_unknown() {
        let dir = tempdir().unwrap();
        let paths = test_paths(dir.path(), "unsized");
        let control_shm = paths.control_shm_name.clone();
        let client = ClientTransport::create(paths).unwrap();

        let plugin: Box<dyn HostedPlugin> = Box::new(EchoPlugin { gain: 1.0 });
        let server_transport = ServerTransport::open(std::path::Path::new(&control_shm)).unwrap();
        let mut ring = RingDispatcher {
            transport: server_transport,
            plugin: Arc::new(Mutex::new(plugin)),
            notify: NotifyRing::new(),
            heartbeat: Heartbeat::new(),
            audio: None,
            audio_shm_path: std::path::PathBuf::from("/rplugin_audio_never_created"),
            buffer_size: None,
        };

        client.ring().write_opcode(Opcode::Process).unwrap();
        client.ring().commit_write().unwrap();
        client.run_server_sem().post().unwrap();

        ring.dispatch_ring().unwrap();
        assert!(ring.audio.is_none());
    }

    #[test]
    #[serial]
    fn set_buffer_size_is_cached_from_the_ring() {
        let dir = tempdir().unwrap();
        let paths = test_paths(dir.path(), "bufsize");
        let control_shm = paths.control_shm_name.clone();
        let client = ClientTransport::create(paths).unwrap();

        let plugin: Box<dyn HostedPlugin> = Box::new(EchoPlugin { gain: 1.0 });
        let server_transport = ServerTransport::open(std::path::Path::new(&control_shm)).unwrap();
        let mut ring = RingDispatcher {
            transport: server_transport,
            plugin: Arc::new(Mutex::new(plugin)),
            notify: NotifyRing::new(),
            heartbeat: Heartbeat::new(),
            audio: None,
            audio_shm_path: std::path::PathBuf::from("/rplugin_audio_unused"),
            buffer_size: None,
        };

        client.ring().write_opcode(Opcode::SetBufferSize).unwrap();
        client.ring().write_int(32).unwrap();
        client.ring().commit_write().unwrap();
        client.run_server_sem().post().unwrap();

        ring.dispatch_ring().unwrap();
        assert_eq!(ring.buffer_size, Some(32));
    }

    #[test]
    fn control_dispatcher_answers_get_name() {
        let dir = tempdir().unwrap();
        let request_path = dir.path().join("req");
        let response_path = dir.path().join("resp");
        rplugin_ipc::pipes::make_fifo(&request_path).unwrap();
        rplugin_ipc::pipes::make_fifo(&response_path).unwrap();

        let writer_thread = {
            let request_path = request_path.clone();
            std::thread::spawn(move || {
                let mut writer = ControlPipe::open_writer(&request_path).unwrap();
                writer.write_opcode(Opcode::GetName).unwrap();
            })
        };
        let request = ControlPipe::open_reader(&request_path).unwrap();
        writer_thread.join().unwrap();

        let reader_thread = {
            let response_path = response_path.clone();
            std::thread::spawn(move || ControlPipe::open_reader(&response_path).unwrap().read_string().unwrap())
        };
        let response = ControlPipe::open_writer(&response_path).unwrap();

        let plugin: Box<dyn HostedPlugin> = Box::new(EchoPlugin { gain: 1.0 });
        let mut control = ControlDispatcher {
            request,
            response,
            plugin: Arc::new(Mutex::new(plugin)),
            debug_level: DebugLevel::None,
        };
        control.dispatch_control().unwrap();
        assert_eq!(reader_thread.join().unwrap(), "echo");
    }
}
