//! The simulated receiver's state.
//!
//! The whole tree is kept in wire form: a snapshot is a clone, and an action
//! edits the matching [`CellDesc`] in place after the same type checks the
//! client applies, plus the tuner's own range limit.

use sdr_cell::{Value, ValueType};
use sdr_net::{ActionFrame, BlockDesc, CellContent, CellDesc, Snapshot, StateDelta};
use tracing::info;

/// Highest frequency the tuner driver accepts, in Hz.
pub const MAX_HARDWARE_FREQ: f64 = 4_294_967_295.0;

/// What the tuner is asked for when `freq` is 0. Some tuners produce
/// baseband at this setting.
pub const ZERO_FREQ_QUIRK: f64 = 3700e6;

pub const MODES: [&str; 5] = ["AM", "NFM", "WFM", "USB", "LSB"];

/// Frequency sent to the tuner for a requested `freq`, compensating the
/// oscillator error `correction_ppm`.
#[must_use]
pub fn hardware_frequency(freq: f64, correction_ppm: f64) -> f64 {
    if freq == 0.0 {
        ZERO_FREQ_QUIRK
    } else {
        freq * (1.0 - 1e-6 * correction_ppm)
    }
}

/// Why an action was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("no cell at {0}")]
    UnknownPath(String),

    #[error("{0} is read-only")]
    ReadOnly(String),

    #[error("invalid value for {path}: {reason}")]
    Invalid { path: String, reason: String },

    #[error("tuner frequency {hardware_hz} Hz is outside 0..={MAX_HARDWARE_FREQ}")]
    OutOfTunerRange { hardware_hz: f64 },
}

/// A single-source, single-receiver radio.
#[derive(Debug, Clone)]
pub struct Radio {
    tree: BlockDesc,
}

impl Radio {
    /// A radio tuned to `freq` Hz with default settings.
    #[must_use]
    pub fn new(freq: f64) -> Self {
        let source = BlockDesc::new("OsmoSDRSource")
            .capability("source")
            .capability("device")
            .value(
                "freq",
                ValueType::range(0.0, MAX_HARDWARE_FREQ),
                true,
                serde_json::json!(freq),
            )
            .value("correction_ppm", ValueType::Float, true, serde_json::json!(0.0))
            .value("agc", ValueType::Bool, true, serde_json::json!(false))
            .value(
                "gain",
                ValueType::loose_range(0.0, 49.6),
                true,
                serde_json::json!(20.0),
            )
            .value("sample_rate", ValueType::Int, false, serde_json::json!(2_400_000));
        let receiver = BlockDesc::new("Receiver")
            .capability("receiver")
            .value(
                "mode",
                ValueType::enumeration(MODES),
                true,
                serde_json::json!("WFM"),
            )
            .value("rec_freq", ValueType::Float, true, serde_json::json!(freq));
        Self {
            tree: BlockDesc::new("Radio")
                .capability("top")
                .block("source", source)
                .block("receivers", BlockDesc::new("Receivers").block("a", receiver)),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            root: self.tree.clone(),
        }
    }

    /// Current value at `path`.
    #[must_use]
    pub fn value<S: AsRef<str>>(&self, path: &[S]) -> Option<&serde_json::Value> {
        match &self.tree.find(path)?.content {
            CellContent::Value(value) => Some(value),
            CellContent::Block(_) => None,
        }
    }

    fn number(&self, path: &[&str]) -> f64 {
        self.value(path)
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0)
    }

    /// Apply `frame` and return the delta to broadcast: the accepted value,
    /// or a rejection naming the frame's sequence number.
    pub fn handle(&mut self, frame: &ActionFrame) -> StateDelta {
        match self.apply(frame) {
            Ok(value) => StateDelta::Value {
                path: frame.path.clone(),
                value,
            },
            Err(rejection) => StateDelta::Rejected {
                seq: frame.seq,
                reason: rejection.to_string(),
            },
        }
    }

    /// Validate and store one action.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] when the path, writability, type or tuner
    /// range check fails. The radio is unchanged in that case.
    pub fn apply(&mut self, frame: &ActionFrame) -> Result<serde_json::Value, Rejection> {
        let key = frame.path.join("/");
        let cell = self
            .tree
            .find(&frame.path)
            .ok_or_else(|| Rejection::UnknownPath(key.clone()))?;
        let value = admit(cell, &key, &frame.value)?;

        let hardware_hz = match key.as_str() {
            "source/freq" => Some(hardware_frequency(
                value.as_f64().unwrap_or(0.0),
                self.number(&["source", "correction_ppm"]),
            )),
            "source/correction_ppm" => Some(hardware_frequency(
                self.number(&["source", "freq"]),
                value.as_f64().unwrap_or(0.0),
            )),
            _ => None,
        };
        if let Some(hardware_hz) = hardware_hz {
            if !(0.0..=MAX_HARDWARE_FREQ).contains(&hardware_hz) {
                return Err(Rejection::OutOfTunerRange { hardware_hz });
            }
            info!(hardware_hz, "tuner retuned");
        }

        let json = value.to_json().ok_or_else(|| Rejection::Invalid {
            path: key.clone(),
            reason: "value has no wire form".to_string(),
        })?;
        if let Some(cell) = self.tree.find_mut(&frame.path) {
            cell.content = CellContent::Value(json.clone());
        }
        info!(path = %key, value = %json, "setting changed");
        Ok(json)
    }
}

fn admit(cell: &CellDesc, key: &str, json: &serde_json::Value) -> Result<Value, Rejection> {
    if !cell.writable || matches!(cell.content, CellContent::Block(_)) {
        return Err(Rejection::ReadOnly(key.to_string()));
    }
    Value::from_json(json)
        .and_then(|v| cell.value_type.admit(v))
        .map_err(|err| Rejection::Invalid {
            path: key.to_string(),
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64, path: &[&str], value: serde_json::Value) -> ActionFrame {
        ActionFrame {
            seq,
            path: path.iter().map(|s| s.to_string()).collect(),
            value,
        }
    }

    #[test]
    fn test_hardware_frequency_applies_correction() {
        assert_eq!(hardware_frequency(100e6, 0.0), 100e6);
        assert!((hardware_frequency(100e6, 10.0) - 99_999_000.0).abs() < 1e-3);
        assert_eq!(hardware_frequency(0.0, 50.0), ZERO_FREQ_QUIRK);
    }

    #[test]
    fn test_accepted_action_updates_snapshot() {
        let mut radio = Radio::new(98e6);
        let delta = radio.handle(&frame(1, &["source", "freq"], serde_json::json!(144_800_000)));
        assert_eq!(
            delta,
            StateDelta::Value {
                path: vec!["source".into(), "freq".into()],
                value: serde_json::json!(144.8e6),
            }
        );
        assert_eq!(
            radio.snapshot().root.find(&["source", "freq"]).unwrap().content,
            CellContent::Value(serde_json::json!(144.8e6))
        );
    }

    #[test]
    fn test_out_of_range_freq_rejected() {
        let mut radio = Radio::new(98e6);
        let delta = radio.handle(&frame(4, &["source", "freq"], serde_json::json!(5e9)));
        assert!(matches!(delta, StateDelta::Rejected { seq: 4, .. }));
        assert_eq!(radio.value(&["source", "freq"]), Some(&serde_json::json!(98e6)));
    }

    #[test]
    fn test_correction_can_push_tuner_out_of_range() {
        let mut radio = Radio::new(MAX_HARDWARE_FREQ);
        let result = radio.apply(&frame(2, &["source", "correction_ppm"], serde_json::json!(-10.0)));
        assert!(matches!(result, Err(Rejection::OutOfTunerRange { .. })));
        assert!(radio.apply(&frame(3, &["source", "correction_ppm"], serde_json::json!(10.0))).is_ok());
    }

    #[test]
    fn test_read_only_and_unknown_paths_rejected() {
        let mut radio = Radio::new(98e6);
        assert_eq!(
            radio.apply(&frame(1, &["source", "sample_rate"], serde_json::json!(1))),
            Err(Rejection::ReadOnly("source/sample_rate".into()))
        );
        assert_eq!(
            radio.apply(&frame(2, &["source"], serde_json::json!(1))),
            Err(Rejection::ReadOnly("source".into()))
        );
        assert_eq!(
            radio.apply(&frame(3, &["antenna"], serde_json::json!(1))),
            Err(Rejection::UnknownPath("antenna".into()))
        );
    }

    #[test]
    fn test_mode_must_be_known() {
        let mut radio = Radio::new(98e6);
        assert!(matches!(
            radio.apply(&frame(1, &["receivers", "a", "mode"], serde_json::json!("SSTV"))),
            Err(Rejection::Invalid { .. })
        ));
        assert!(radio.apply(&frame(2, &["receivers", "a", "mode"], serde_json::json!("AM"))).is_ok());
    }
}
