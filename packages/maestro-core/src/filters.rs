//! Audio filter abstraction and the eleven Lavalink filter types.
//!
//! Every filter is a [`Filter<T>`] holding a value and its type's canonical
//! "off" default. A filter is *active* iff its value differs from that
//! default - this `changed()` test, not an explicit flag, is the single
//! source of truth for whether it is transmitted to the node.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Generic Filter
// ─────────────────────────────────────────────────────────────────────────────

/// A filter value paired with its canonical default.
///
/// `changed()` / `to_wire()` / `reset()` replace the per-type default-diff
/// logic a naive implementation would repeat for every filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter<T: Clone + PartialEq + Serialize> {
    value: T,
    default: T,
}

impl<T: Clone + PartialEq + Serialize> Filter<T> {
    /// Creates a filter resting at its default "off" value.
    #[must_use]
    pub fn new(default: T) -> Self {
        Self {
            value: default.clone(),
            default,
        }
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Sets a new value.
    pub fn set(&mut self, value: T) {
        self.value = value;
    }

    /// Whether the value differs from the canonical default.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.value != self.default
    }

    /// Returns the filter to its default "off" value.
    pub fn reset(&mut self) {
        self.value = self.default.clone();
    }

    /// Wire representation, or `None` when the filter is at its default.
    #[must_use]
    pub fn to_wire(&self) -> Option<Value> {
        if !self.changed() {
            return None;
        }
        serde_json::to_value(&self.value).ok()
    }
}

impl<T: Clone + PartialEq + Serialize + Default> Default for Filter<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Filter Value Types
// ─────────────────────────────────────────────────────────────────────────────

/// Playback volume multiplier applied inside the filter chain (1.0 = 100%).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Volume(pub f32);

impl Default for Volume {
    fn default() -> Self {
        Self(1.0)
    }
}

/// Fifteen-band equalizer; each gain is -0.25..=1.0 with 0.0 = flat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Equalizer(pub [f32; 15]);

impl Default for Equalizer {
    fn default() -> Self {
        Self([0.0; 15])
    }
}

// The wire format is a list of {band, gain} objects, not a bare array.
impl Serialize for Equalizer {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Band {
            band: u8,
            gain: f32,
        }
        serializer.collect_seq(self.0.iter().enumerate().map(|(band, gain)| Band {
            band: band as u8,
            gain: *gain,
        }))
    }
}

impl<'de> Deserialize<'de> for Equalizer {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Band {
            band: u8,
            gain: f32,
        }
        let bands = Vec::<Band>::deserialize(deserializer)?;
        let mut gains = [0.0; 15];
        for band in bands {
            if let Some(slot) = gains.get_mut(band.band as usize) {
                *slot = band.gain;
            }
        }
        Ok(Self(gains))
    }
}

/// Karaoke (vocal suppression) settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Karaoke {
    pub level: f32,
    pub mono_level: f32,
    pub filter_band: f32,
    pub filter_width: f32,
}

impl Default for Karaoke {
    fn default() -> Self {
        Self {
            level: 1.0,
            mono_level: 1.0,
            filter_band: 220.0,
            filter_width: 100.0,
        }
    }
}

/// Speed / pitch / rate scaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timescale {
    pub speed: f32,
    pub pitch: f32,
    pub rate: f32,
}

impl Default for Timescale {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
            rate: 1.0,
        }
    }
}

/// Volume oscillation. Depth 0.0 disables the effect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tremolo {
    pub frequency: f32,
    pub depth: f32,
}

impl Default for Tremolo {
    fn default() -> Self {
        Self {
            frequency: 2.0,
            depth: 0.0,
        }
    }
}

/// Pitch oscillation. Depth 0.0 disables the effect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vibrato {
    pub frequency: f32,
    pub depth: f32,
}

impl Default for Vibrato {
    fn default() -> Self {
        Self {
            frequency: 2.0,
            depth: 0.0,
        }
    }
}

/// Audio rotation ("8D") in Hz. 0.0 disables the effect.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    pub rotation_hz: f32,
}

/// Waveform distortion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distortion {
    pub sin_offset: f32,
    pub sin_scale: f32,
    pub cos_offset: f32,
    pub cos_scale: f32,
    pub tan_offset: f32,
    pub tan_scale: f32,
    pub offset: f32,
    pub scale: f32,
}

impl Default for Distortion {
    fn default() -> Self {
        Self {
            sin_offset: 0.0,
            sin_scale: 1.0,
            cos_offset: 0.0,
            cos_scale: 1.0,
            tan_offset: 0.0,
            tan_scale: 1.0,
            offset: 0.0,
            scale: 1.0,
        }
    }
}

/// Low-pass smoothing. Values <= 1.0 disable the effect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowPass {
    pub smoothing: f32,
}

impl Default for LowPass {
    fn default() -> Self {
        Self { smoothing: 1.0 }
    }
}

/// Stereo channel mixing. The identity matrix leaves audio untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMix {
    pub left_to_left: f32,
    pub left_to_right: f32,
    pub right_to_left: f32,
    pub right_to_right: f32,
}

impl Default for ChannelMix {
    fn default() -> Self {
        Self {
            left_to_left: 1.0,
            left_to_right: 0.0,
            right_to_left: 0.0,
            right_to_right: 1.0,
        }
    }
}

/// Echo effect. Zero delay and decay disable it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Echo {
    pub delay: f32,
    pub decay: f32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Filter Set
// ─────────────────────────────────────────────────────────────────────────────

/// The full per-player filter chain, one independently toggleable filter per
/// slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSet {
    pub volume: Filter<Volume>,
    pub equalizer: Filter<Equalizer>,
    pub karaoke: Filter<Karaoke>,
    pub timescale: Filter<Timescale>,
    pub tremolo: Filter<Tremolo>,
    pub vibrato: Filter<Vibrato>,
    pub rotation: Filter<Rotation>,
    pub distortion: Filter<Distortion>,
    pub low_pass: Filter<LowPass>,
    pub channel_mix: Filter<ChannelMix>,
    pub echo: Filter<Echo>,
}

impl FilterSet {
    /// Builds the payload for a `filters` op frame.
    ///
    /// Only filters whose value differs from their default are included;
    /// a fully default set produces an empty map, which tells the node to
    /// clear every filter.
    #[must_use]
    pub fn to_wire(&self) -> serde_json::Map<String, Value> {
        let mut payload = serde_json::Map::new();
        let slots: [(&str, Option<Value>); 11] = [
            ("volume", self.volume.to_wire()),
            ("equalizer", self.equalizer.to_wire()),
            ("karaoke", self.karaoke.to_wire()),
            ("timescale", self.timescale.to_wire()),
            ("tremolo", self.tremolo.to_wire()),
            ("vibrato", self.vibrato.to_wire()),
            ("rotation", self.rotation.to_wire()),
            ("distortion", self.distortion.to_wire()),
            ("lowPass", self.low_pass.to_wire()),
            ("channelMix", self.channel_mix.to_wire()),
            ("echo", self.echo.to_wire()),
        ];
        for (key, value) in slots {
            if let Some(value) = value {
                payload.insert(key.to_string(), value);
            }
        }
        payload
    }

    /// Whether any filter differs from its default.
    #[must_use]
    pub fn any_changed(&self) -> bool {
        !self.to_wire().is_empty()
    }

    /// Returns every filter to its default "off" value.
    pub fn reset_all(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_filter_is_unchanged_and_off_wire() {
        let filter: Filter<Timescale> = Filter::default();
        assert!(!filter.changed());
        assert!(filter.to_wire().is_none());
    }

    #[test]
    fn reset_is_idempotent_for_every_filter_type() {
        let mut set = FilterSet::default();
        set.volume.set(Volume(0.5));
        set.equalizer.set(Equalizer([0.1; 15]));
        set.karaoke.set(Karaoke {
            level: 0.5,
            ..Karaoke::default()
        });
        set.timescale.set(Timescale {
            speed: 1.5,
            ..Timescale::default()
        });
        set.tremolo.set(Tremolo {
            depth: 0.3,
            ..Tremolo::default()
        });
        set.vibrato.set(Vibrato {
            depth: 0.3,
            ..Vibrato::default()
        });
        set.rotation.set(Rotation { rotation_hz: 0.2 });
        set.distortion.set(Distortion {
            scale: 0.5,
            ..Distortion::default()
        });
        set.low_pass.set(LowPass { smoothing: 20.0 });
        set.channel_mix.set(ChannelMix {
            left_to_right: 0.5,
            ..ChannelMix::default()
        });
        set.echo.set(Echo {
            delay: 0.5,
            decay: 0.5,
        });
        assert!(set.any_changed());

        set.reset_all();
        assert!(!set.any_changed());
        assert!(set.to_wire().is_empty());
        assert!(!set.volume.changed());
        assert!(set.equalizer.to_wire().is_none());
    }

    #[test]
    fn only_changed_filters_hit_the_wire() {
        let mut set = FilterSet::default();
        set.timescale.set(Timescale {
            speed: 1.25,
            pitch: 1.0,
            rate: 1.0,
        });
        let wire = set.to_wire();
        assert_eq!(wire.len(), 1);
        assert_eq!(wire["timescale"]["speed"], 1.25);
    }

    #[test]
    fn equalizer_serializes_as_band_gain_pairs() {
        let mut eq = Equalizer::default();
        eq.0[3] = 0.25;
        let value = serde_json::to_value(eq).unwrap();
        assert_eq!(value[3]["band"], 3);
        assert_eq!(value[3]["gain"], 0.25);
        assert_eq!(value.as_array().unwrap().len(), 15);
    }

    #[test]
    fn equalizer_round_trips() {
        let mut eq = Equalizer::default();
        eq.0[0] = -0.25;
        eq.0[14] = 1.0;
        let json = serde_json::to_string(&eq).unwrap();
        let back: Equalizer = serde_json::from_str(&json).unwrap();
        assert_eq!(eq, back);
    }
}
