//! Device Session (C4): per-device runtime state driven by inbound frames
//! (spec §4.3). Owned exclusively by the Orchestrator task; other tasks only
//! ever see a read-only snapshot published on the Event Bus (spec §5),
//! mirroring the ownership discipline `ContextStore` uses for its process
//! map in the teacher.

use crate::model::DeviceState;
use crate::transport::{Frame, FrameTag};
use chrono::Utc;
use std::collections::HashMap;

/// Effect of processing one inbound frame against a device's state: either
/// nothing the orchestrator needs to act on, or a production delta to
/// append, or a reset to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEffect {
    None,
    Delta(i64),
    DeviceReset { previous_counter: i64 },
    LecturaCompleted,
}

/// A 60 s heartbeat timeout, past which a device with no frames is
/// considered disconnected (spec §4.3, §5 Housekeeper).
pub const HEARTBEAT_TIMEOUT_SECONDS: i64 = 60;

pub struct DeviceSessions {
    devices: HashMap<String, DeviceState>,
}

impl DeviceSessions {
    pub fn new() -> Self {
        Self {
            devices: HashMap::new(),
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceState> {
        self.devices.get(device_id)
    }

    pub fn snapshot(&self, device_id: &str) -> Option<DeviceState> {
        self.devices.get(device_id).cloned()
    }

    /// Applies one inbound frame's effect on its device (implicit creation
    /// on first frame, per spec §3's Device lifecycle), returning what the
    /// orchestrator should do about it.
    pub fn apply_frame(&mut self, frame: &Frame) -> FrameEffect {
        let now = Utc::now();
        let device = self
            .devices
            .entry(frame.device_id.clone())
            .or_insert_with(|| DeviceState::new(frame.device_id.clone()));
        device.last_frame_at = Some(now);
        device.connected = true;

        match frame.tag {
            FrameTag::Cont => {
                let v = frame.value as i64;
                if v < device.counter {
                    let previous = device.counter;
                    device.counter = v;
                    FrameEffect::DeviceReset {
                        previous_counter: previous,
                    }
                } else {
                    let delta = v - device.counter;
                    device.counter = v;
                    if delta > 0 {
                        FrameEffect::Delta(delta)
                    } else {
                        FrameEffect::None
                    }
                }
            }
            FrameTag::Total => {
                device.total = frame.value as i64;
                FrameEffect::None
            }
            FrameTag::Meta => {
                device.target = frame.value as i64;
                FrameEffect::None
            }
            FrameTag::Estado => {
                device.active = frame.value == 1;
                FrameEffect::None
            }
            FrameTag::Reset => {
                device.counter = 0;
                device.active = false;
                FrameEffect::None
            }
            FrameTag::Log => {
                device.log_counter = frame.value as i64;
                FrameEffect::None
            }
            FrameTag::Heartbeat => {
                device.last_heartbeat_at = Some(now);
                FrameEffect::None
            }
            FrameTag::Inactivo => {
                device.inactive_seconds = frame.value as i64;
                FrameEffect::None
            }
            FrameTag::Fin => FrameEffect::LecturaCompleted,
        }
    }

    /// Marks devices whose `last_frame_at` is older than the heartbeat
    /// timeout as disconnected; run periodically by the Housekeeper task.
    pub fn sweep_stale(&mut self) -> Vec<String> {
        let now = Utc::now();
        let mut newly_disconnected = Vec::new();
        for (id, device) in self.devices.iter_mut() {
            if !device.connected {
                continue;
            }
            let stale = match device.last_frame_at {
                Some(last) => (now - last).num_seconds() > HEARTBEAT_TIMEOUT_SECONDS,
                None => false,
            };
            if stale {
                device.connected = false;
                newly_disconnected.push(id.clone());
            }
        }
        newly_disconnected
    }
}

impl Default for DeviceSessions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(device_id: &str, tag: FrameTag, value: i32) -> Frame {
        Frame {
            device_id: device_id.to_string(),
            tag,
            value,
        }
    }

    #[test]
    fn first_cont_frame_creates_device_implicitly() {
        let mut sessions = DeviceSessions::new();
        assert!(sessions.get("EST01").is_none());
        sessions.apply_frame(&frame("EST01", FrameTag::Cont, 1));
        assert!(sessions.get("EST01").is_some());
    }

    #[test]
    fn equal_cont_value_emits_no_delta() {
        let mut sessions = DeviceSessions::new();
        sessions.apply_frame(&frame("EST01", FrameTag::Cont, 5));
        let effect = sessions.apply_frame(&frame("EST01", FrameTag::Cont, 5));
        assert_eq!(effect, FrameEffect::None);
    }

    #[test]
    fn increasing_cont_value_emits_delta() {
        let mut sessions = DeviceSessions::new();
        sessions.apply_frame(&frame("EST01", FrameTag::Cont, 5));
        let effect = sessions.apply_frame(&frame("EST01", FrameTag::Cont, 8));
        assert_eq!(effect, FrameEffect::Delta(3));
        assert_eq!(sessions.get("EST01").unwrap().counter, 8);
    }

    #[test]
    fn decreasing_cont_value_triggers_device_reset_not_negative_delta() {
        let mut sessions = DeviceSessions::new();
        sessions.apply_frame(&frame("EST01", FrameTag::Cont, 7));
        let effect = sessions.apply_frame(&frame("EST01", FrameTag::Cont, 0));
        assert_eq!(
            effect,
            FrameEffect::DeviceReset {
                previous_counter: 7
            }
        );
        assert_eq!(sessions.get("EST01").unwrap().counter, 0);
    }

    #[test]
    fn reset_tag_zeroes_counter_and_clears_active() {
        let mut sessions = DeviceSessions::new();
        sessions.apply_frame(&frame("EST01", FrameTag::Cont, 7));
        sessions.apply_frame(&frame("EST01", FrameTag::Estado, 1));
        sessions.apply_frame(&frame("EST01", FrameTag::Reset, 0));
        let device = sessions.get("EST01").unwrap();
        assert_eq!(device.counter, 0);
        assert!(!device.active);
    }

    #[test]
    fn fin_emits_lectura_completed() {
        let mut sessions = DeviceSessions::new();
        let effect = sessions.apply_frame(&frame("EST01", FrameTag::Fin, 0));
        assert_eq!(effect, FrameEffect::LecturaCompleted);
    }

    #[test]
    fn meta_sets_target() {
        let mut sessions = DeviceSessions::new();
        sessions.apply_frame(&frame("EST01", FrameTag::Meta, 10));
        assert_eq!(sessions.get("EST01").unwrap().target, 10);
    }
}
