//! In-process simulated depth sensor.
//!
//! Used as the development driver for the binary and as the test double for
//! the pipeline. Every frame is stamped with a sequence number and a checksum
//! so receivers can detect torn or mixed buffers with [`verify_frame`].

use crate::sensor::{DepthSensor, InterruptCallback, SensorEnumerator};
use crate::types::{
    DepthComputeParams, ModeDetails, Status, StatusResult, DEPTH_COMPUTE_KEYS,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(10);
const SEQUENCE_WORDS: usize = 4;
const CHECKSUM_WORDS: usize = 2;

/// Smallest frame that can carry the sequence stamp and checksum.
pub const MIN_STAMPED_ELEMENTS: usize = SEQUENCE_WORDS + CHECKSUM_WORDS;

/// Most modes a sensor can expose; mode numbers are a `u8`.
pub const MAX_SIM_MODES: usize = 256;

/// Build `count` synthetic modes: two processed modes, one PCM mode, then
/// progressively wider processed modes. `count` is clamped to
/// `1..=MAX_SIM_MODES`.
pub fn sim_modes(count: usize) -> Vec<ModeDetails> {
    (0..=u8::MAX)
        .take(count.clamp(1, MAX_SIM_MODES))
        .map(|i| {
            let (width, height, is_pcm, phases) = match i {
                0 => (64, 64, false, 1),
                1 => (32, 32, false, 1),
                2 => (64, 48, true, 3),
                n => (16 * (u32::from(n) + 1), 16, false, 1),
            };
            let frame_content = if is_pcm {
                vec!["raw".to_string()]
            } else {
                ["depth", "ab", "conf", "metadata"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            };
            ModeDetails {
                mode_number: i,
                pixel_format_index: u8::from(is_pcm),
                frame_width_in_bytes: width * 2,
                frame_height_in_bytes: height,
                base_resolution_width: width,
                base_resolution_height: height,
                metadata_size: 128,
                is_pcm,
                number_of_phases: phases,
                frame_content,
            }
        })
        .collect()
}

fn frame_checksum(words: &[u16]) -> u32 {
    words
        .iter()
        .fold(0x811c_9dc5u32, |acc, &w| acc.wrapping_mul(31).wrapping_add(w as u32))
}

/// Fill `frame` with a deterministic pattern for `sequence` and stamp it.
pub fn stamp_frame(frame: &mut [u16], sequence: u64) {
    let len = frame.len();
    if len < MIN_STAMPED_ELEMENTS {
        frame.fill(sequence as u16);
        return;
    }
    for (i, word) in frame[..SEQUENCE_WORDS].iter_mut().enumerate() {
        *word = (sequence >> (16 * i)) as u16;
    }
    let body_end = len - CHECKSUM_WORDS;
    let band = body_end / 3..body_end / 2;
    for i in SEQUENCE_WORDS..body_end {
        frame[i] = if band.contains(&i) {
            0
        } else {
            ((sequence as usize * 31 + i * 7) % 4096) as u16
        };
    }
    let sum = frame_checksum(&frame[..body_end]);
    frame[body_end] = sum as u16;
    frame[body_end + 1] = (sum >> 16) as u16;
}

/// Return the sequence number of an intact stamped frame, `None` if the
/// checksum does not match.
pub fn verify_frame(frame: &[u16]) -> Option<u64> {
    let len = frame.len();
    if len < MIN_STAMPED_ELEMENTS {
        return None;
    }
    let body_end = len - CHECKSUM_WORDS;
    let stored = frame[body_end] as u32 | (frame[body_end + 1] as u32) << 16;
    if stored != frame_checksum(&frame[..body_end]) {
        return None;
    }
    Some(
        frame[..SEQUENCE_WORDS]
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &w)| acc | (w as u64) << (16 * i)),
    )
}

fn default_depth_params() -> DepthComputeParams {
    DEPTH_COMPUTE_KEYS
        .iter()
        .enumerate()
        .map(|(i, key)| (key.to_string(), (i * 10).to_string()))
        .collect()
}

struct SimState {
    opened: bool,
    streaming: bool,
    active_mode: Option<ModeDetails>,
    sequence: u64,
    failures_pending: u32,
    controls: HashMap<String, String>,
    registers: HashMap<u16, u16>,
    payload: Vec<u8>,
    depth_params: DepthComputeParams,
    callback: Option<InterruptCallback>,
}

/// Simulated ToF imager.
pub struct SimulatedSensor {
    name: String,
    modes: Vec<ModeDetails>,
    frame_interval: Duration,
    state: Mutex<SimState>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    frames: AtomicUsize,
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self::with_modes(sim_modes(3))
    }

    pub fn with_modes(modes: Vec<ModeDetails>) -> Self {
        let controls = [
            ("fps", "30"),
            ("phaseDepthBits", "12"),
            ("abBits", "16"),
            ("confidenceBits", "8"),
            ("netlinktest", "0"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            name: "sim-tof".to_string(),
            modes,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            state: Mutex::new(SimState {
                opened: false,
                streaming: false,
                active_mode: None,
                sequence: 0,
                failures_pending: 0,
                controls,
                registers: HashMap::new(),
                payload: Vec::new(),
                depth_params: default_depth_params(),
                callback: None,
            }),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            frames: AtomicUsize::new(0),
        }
    }

    /// Set the simulated time the hardware takes to deliver one frame.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Frames successfully delivered through `get_frame`.
    pub fn frames_delivered(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    pub fn active_mode(&self) -> Option<ModeDetails> {
        self.lock().active_mode.clone()
    }

    /// Make the next `count` frame reads fail with `GenericError`.
    pub fn fail_next_frames(&self, count: u32) {
        self.lock().failures_pending = count;
    }

    pub fn has_interrupt_callback(&self) -> bool {
        self.lock().callback.is_some()
    }

    /// Deliver an interrupt to the registered callback, if any.
    pub fn raise_interrupt(&self, code: i32) {
        let callback = self.lock().callback.clone();
        if let Some(callback) = callback {
            callback(code);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_mode(&self, mode: u8) -> StatusResult<&ModeDetails> {
        self.modes
            .iter()
            .find(|m| m.mode_number == mode)
            .ok_or(Status::InvalidArgument)
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl DepthSensor for SimulatedSensor {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn open(&self) -> StatusResult<()> {
        let mut state = self.lock();
        state.opened = true;
        if state.active_mode.is_none() {
            state.active_mode = self.modes.first().cloned();
        }
        Ok(())
    }

    fn start(&self) -> StatusResult<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if !state.opened || state.active_mode.is_none() {
            return Err(Status::Unavailable);
        }
        state.streaming = true;
        Ok(())
    }

    fn stop(&self) -> StatusResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.lock().streaming = false;
        Ok(())
    }

    fn available_modes(&self) -> StatusResult<Vec<u8>> {
        Ok(self.modes.iter().map(|m| m.mode_number).collect())
    }

    fn mode_details(&self, mode: u8) -> StatusResult<ModeDetails> {
        self.find_mode(mode).cloned()
    }

    fn set_mode_by_index(&self, mode: u8) -> StatusResult<()> {
        let details = self.find_mode(mode)?.clone();
        let mut state = self.lock();
        if state.streaming {
            return Err(Status::Busy);
        }
        state.active_mode = Some(details);
        Ok(())
    }

    fn set_mode(&self, details: &ModeDetails) -> StatusResult<()> {
        self.set_mode_by_index(details.mode_number)
    }

    fn get_frame(&self, frame: &mut [u16], timeout: Duration) -> StatusResult<()> {
        let expected = {
            let state = self.lock();
            if !state.streaming {
                return Err(Status::Unavailable);
            }
            state.active_mode.as_ref().map(ModeDetails::element_count)
        };
        if expected != Some(frame.len()) {
            return Err(Status::InvalidArgument);
        }
        if self.frame_interval > timeout {
            std::thread::sleep(timeout);
            return Err(Status::Timeout);
        }
        std::thread::sleep(self.frame_interval);

        let sequence = {
            let mut state = self.lock();
            if !state.streaming {
                return Err(Status::Unavailable);
            }
            if state.failures_pending > 0 {
                state.failures_pending -= 1;
                return Err(Status::GenericError);
            }
            state.sequence += 1;
            state.sequence
        };
        stamp_frame(frame, sequence);
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn available_controls(&self) -> StatusResult<Vec<String>> {
        let mut names: Vec<String> = self.lock().controls.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn set_control(&self, name: &str, value: &str) -> StatusResult<()> {
        let mut state = self.lock();
        match state.controls.get_mut(name) {
            Some(slot) => {
                *slot = value.to_string();
                Ok(())
            }
            None => Err(Status::InvalidArgument),
        }
    }

    fn control(&self, name: &str) -> StatusResult<String> {
        self.lock()
            .controls
            .get(name)
            .cloned()
            .ok_or(Status::InvalidArgument)
    }

    fn set_sensor_configuration(&self, configuration: &str) -> StatusResult<()> {
        if configuration.is_empty() {
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }

    fn init_target_depth_compute(&self, ini: &[u8], _calibration: &[u8]) -> StatusResult<()> {
        if ini.is_empty() {
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }

    fn read_register(&self, cmd: u16, _delay_us: u32) -> StatusResult<u16> {
        Ok(self.lock().registers.get(&cmd).copied().unwrap_or(0))
    }

    fn write_register(&self, cmd: u16, value: u16, _delay_us: u32) -> StatusResult<()> {
        self.lock().registers.insert(cmd, value);
        Ok(())
    }

    fn read_payload_cmd(&self, cmd: u32, data: &mut [u8]) -> StatusResult<()> {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (cmd as u8) ^ (i as u8);
        }
        Ok(())
    }

    fn read_payload(&self, data: &mut [u8]) -> StatusResult<()> {
        let state = self.lock();
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = state.payload.get(i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_payload_cmd(&self, _cmd: u32, data: &[u8]) -> StatusResult<()> {
        self.lock().payload = data.to_vec();
        Ok(())
    }

    fn write_payload(&self, data: &[u8]) -> StatusResult<()> {
        self.lock().payload = data.to_vec();
        Ok(())
    }

    fn chip_status(&self) -> StatusResult<(i32, i32)> {
        Ok((0, 0))
    }

    fn depth_compute_params(&self) -> StatusResult<DepthComputeParams> {
        Ok(self.lock().depth_params.clone())
    }

    fn set_depth_compute_params(&self, params: &DepthComputeParams) -> StatusResult<()> {
        let mut state = self.lock();
        if params.keys().any(|k| !state.depth_params.contains_key(k)) {
            return Err(Status::InvalidArgument);
        }
        for (key, value) in params {
            state.depth_params.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn ini_params_for_mode(&self, mode: i32) -> StatusResult<String> {
        let mode = u8::try_from(mode).map_err(|_| Status::InvalidArgument)?;
        self.find_mode(mode)?;
        let state = self.lock();
        Ok(state
            .depth_params
            .iter()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect())
    }

    fn register_interrupt_callback(&self, callback: InterruptCallback) -> StatusResult<()> {
        self.lock().callback = Some(callback);
        Ok(())
    }

    fn unregister_interrupt_callback(&self) -> StatusResult<()> {
        self.lock().callback = None;
        Ok(())
    }
}

/// Enumerator exposing a fixed list of simulated sensors.
pub struct SimulatedEnumerator {
    sensors: Vec<Arc<SimulatedSensor>>,
    searched: bool,
}

impl SimulatedEnumerator {
    pub fn new(sensors: Vec<Arc<SimulatedSensor>>) -> Self {
        Self {
            sensors,
            searched: false,
        }
    }

    /// A board with nothing attached.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl SensorEnumerator for SimulatedEnumerator {
    fn search_sensors(&mut self) -> StatusResult<()> {
        self.searched = true;
        log::debug!("Simulated search found {} sensor(s)", self.sensors.len());
        Ok(())
    }

    fn depth_sensors(&self) -> Vec<Arc<dyn DepthSensor>> {
        if !self.searched {
            return Vec::new();
        }
        self.sensors
            .iter()
            .map(|s| s.clone() as Arc<dyn DepthSensor>)
            .collect()
    }

    fn kernel_version(&self) -> String {
        "sim-kernel-1.0".to_string()
    }

    fn uboot_version(&self) -> String {
        "sim-uboot-1.0".to_string()
    }

    fn sd_version(&self) -> String {
        "sim-sd-1.0".to_string()
    }
}
