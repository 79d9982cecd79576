use tracing::debug;

use super::{ControlTarget, MappingTarget, TriggerKind, TriggerSpec};
use crate::midi::{MessageKind, MidiEvent};

/// Range a learned CC preset trigger fires in, i.e. a footswitch press.
pub const PRESET_CC_RANGE: (u8, u8) = (64, 127);

/// The two learn slots. Arming one never touches the other.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LearnEngine {
    control: Option<ControlTarget>,
    preset: Option<usize>,
}

impl LearnEngine {
    pub fn start_control(&mut self, target: ControlTarget) {
        debug!("Control learn armed for {target:?}");
        self.control = Some(target);
    }

    pub fn start_preset(&mut self, preset: usize) {
        debug!("Preset learn armed for preset {preset}");
        self.preset = Some(preset);
    }

    pub fn cancel_control(&mut self) {
        self.control = None;
    }

    pub fn cancel_preset(&mut self) {
        self.preset = None;
    }

    pub fn control_target(&self) -> Option<ControlTarget> {
        self.control
    }

    pub fn preset_target(&self) -> Option<usize> {
        self.preset
    }

    pub fn is_active(&self) -> bool {
        self.control.is_some() || self.preset.is_some()
    }

    /// Takes the event if an armed slot wants it. Control learn wins a CC when both are armed.
    pub fn capture(&mut self, event: &MidiEvent) -> Option<(TriggerSpec, MappingTarget)> {
        match event.message.kind {
            MessageKind::ControlChange { controller, .. } => {
                if let Some(target) = self.control.take() {
                    let trigger =
                        TriggerSpec::learned(TriggerKind::ControlChange, controller, event);
                    Some((trigger, MappingTarget::Control(target)))
                } else {
                    let preset = self.preset.take()?;
                    let trigger = TriggerSpec {
                        value_range: Some(PRESET_CC_RANGE),
                        ..TriggerSpec::learned(TriggerKind::ControlChange, controller, event)
                    };
                    Some((trigger, MappingTarget::Preset(preset)))
                }
            }
            MessageKind::ProgramChange { program } => {
                let preset = self.preset.take()?;
                let trigger = TriggerSpec::learned(TriggerKind::ProgramChange, program, event);
                Some((trigger, MappingTarget::Preset(preset)))
            }
            MessageKind::NoteOn { note, .. } => {
                let preset = self.preset.take()?;
                let trigger = TriggerSpec::learned(TriggerKind::NoteOn, note, event);
                Some((trigger, MappingTarget::Preset(preset)))
            }
            _ => None,
        }
    }
}
