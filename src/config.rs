//! Rack file: everything needed to bring the rack back after a restart.

use std::{error, fmt, fs, io, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    channel::KeyboardZone,
    host::PluginDescriptor,
    mapping::Mapping,
    music::ScaleSettings,
    router::ChordPad,
};

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Json(serde_json::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "Rack file I/O error: {e}"),
            Error::Json(e) => write!(f, "Invalid rack file: {e}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub descriptor: PluginDescriptor,
    #[serde(default)]
    pub name: String,
    /// Opaque bytes from the plugin's `full_state`.
    #[serde(default)]
    pub state: Vec<u8>,
    #[serde(default)]
    pub bypassed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub midi_channel: u8,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub scale_filter_enabled: bool,
    #[serde(default)]
    pub is_chord_target: bool,
    #[serde(default)]
    pub zones: Vec<KeyboardZone>,
    #[serde(default)]
    pub instrument: Option<PluginConfig>,
    #[serde(default)]
    pub effects: Vec<PluginConfig>,
    #[serde(default = "unity")]
    pub volume: f32,
    #[serde(default)]
    pub pan: f32,
    #[serde(default)]
    pub muted: bool,
}

impl ChannelConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            midi_channel: 0,
            source: None,
            scale_filter_enabled: false,
            is_chord_target: false,
            zones: vec![],
            instrument: None,
            effects: vec![],
            volume: 1.0,
            pan: 0.0,
            muted: false,
        }
    }

    pub fn plugin_count(&self) -> usize {
        self.instrument.iter().count() + self.effects.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RackConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub scale: ScaleSettings,
    #[serde(default)]
    pub chord_pad: Option<ChordPad>,
    #[serde(default)]
    pub spillover: bool,
    #[serde(default = "unity")]
    pub master_volume: f32,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    #[serde(default)]
    pub presets: Vec<String>,
}

impl RackConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

impl Default for RackConfig {
    fn default() -> Self {
        Self {
            channels: vec![],
            scale: Default::default(),
            chord_pad: None,
            spillover: false,
            master_volume: 1.0,
            mappings: vec![],
            presets: vec![],
        }
    }
}

fn unity() -> f32 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_gets_defaults() {
        let rack: RackConfig =
            serde_json::from_str(r#"{ "channels": [ { "name": "Keys" } ] }"#).unwrap();
        assert_eq!(rack.channels, vec![ChannelConfig::new("Keys")]);
        assert_eq!(rack.master_volume, 1.0);
        assert!(!rack.spillover);
    }

    #[test]
    fn save_and_load() {
        let path = std::env::temp_dir().join(format!("stagerack-{}.json", std::process::id()));
        let mut rack = RackConfig::default();
        let mut channel = ChannelConfig::new("Pads");
        channel.midi_channel = 2;
        channel.zones.push(KeyboardZone::new(0, 59, -12));
        channel.effects.push(PluginConfig {
            descriptor: PluginDescriptor::effect("gain", "Srak"),
            name: "Gain".into(),
            state: br#"{"gain":0.5}"#.to_vec(),
            bypassed: true,
        });
        rack.channels.push(channel);
        rack.presets = vec!["Intro".into(), "Verse".into()];

        rack.save(&path).unwrap();
        let loaded = RackConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, rack);
        assert_eq!(loaded.channels[0].plugin_count(), 1);
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = RackConfig::load(Path::new("/nonexistent/rack.json"));
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
