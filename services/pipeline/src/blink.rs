//! Hysteresis state machine that turns a per-frame EAR signal into blinks.
//!
//! A closure starts on the first frame below the threshold and ends on the
//! first frame at or above it. Closures shorter than
//! [`BlinkConfig::min_consecutive_frames`] are noise; closures longer than
//! [`BlinkConfig::max_consecutive_frames`] are sustained closures (eyes shut or
//! off-screen) and are not reported as blinks either.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Blink detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlinkConfig {
    /// EAR below this value counts as a closed-eye frame
    #[serde(default = "default_ear_threshold")]
    pub ear_threshold: f64,
    /// Minimum closed frames for a closure to count as a blink
    #[serde(default = "default_min_consecutive_frames")]
    pub min_consecutive_frames: u32,
    /// Closures longer than this are sustained closures, not blinks
    #[serde(default = "default_max_consecutive_frames")]
    pub max_consecutive_frames: u32,
}

fn default_ear_threshold() -> f64 {
    0.28
}

fn default_min_consecutive_frames() -> u32 {
    3
}

fn default_max_consecutive_frames() -> u32 {
    24
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            ear_threshold: default_ear_threshold(),
            min_consecutive_frames: default_min_consecutive_frames(),
            max_consecutive_frames: default_max_consecutive_frames(),
        }
    }
}

impl BlinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ear_threshold.is_finite() || self.ear_threshold <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "blink.ear_threshold".to_string(),
                message: format!("must be a positive ratio, got {}", self.ear_threshold),
            });
        }
        if self.min_consecutive_frames == 0 {
            return Err(ConfigError::InvalidValue {
                key: "blink.min_consecutive_frames".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_consecutive_frames < self.min_consecutive_frames {
            return Err(ConfigError::InvalidValue {
                key: "blink.max_consecutive_frames".to_string(),
                message: format!(
                    "must be >= min_consecutive_frames ({})",
                    self.min_consecutive_frames
                ),
            });
        }
        Ok(())
    }
}

/// A closure that ended with the eye reopening and qualified as a blink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletedBlink {
    /// Timestamp of the first closed frame
    pub start: f64,
    /// Timestamp of the frame on which the eye reopened
    pub end: f64,
    /// Number of closed frames in the closure
    pub frames: u32,
}

impl CompletedBlink {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Result of feeding one frame to the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlinkUpdate {
    /// Set on the frame that completes a blink
    pub completed: Option<CompletedBlink>,
    /// Set on the frame that opens a new closure
    pub closure_started: bool,
    /// Blinks completed so far
    pub blink_count: u64,
}

impl BlinkUpdate {
    pub fn blink_completed(&self) -> bool {
        self.completed.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EyeState {
    Open,
    Closing { started_at: f64, frames: u32 },
    /// Closure ran past `max_consecutive_frames`; reopening emits nothing.
    SustainedClosure { started_at: f64, frames: u32 },
}

/// Per-session blink detector.
#[derive(Debug, Clone)]
pub struct BlinkStateMachine {
    config: BlinkConfig,
    state: EyeState,
    blink_count: u64,
}

impl Default for BlinkStateMachine {
    fn default() -> Self {
        Self::new(BlinkConfig::default())
    }
}

impl BlinkStateMachine {
    pub fn new(config: BlinkConfig) -> Self {
        Self {
            config,
            state: EyeState::Open,
            blink_count: 0,
        }
    }

    pub fn config(&self) -> &BlinkConfig {
        &self.config
    }

    pub fn blink_count(&self) -> u64 {
        self.blink_count
    }

    /// Whether a closure is currently in progress
    pub fn is_closed(&self) -> bool {
        !matches!(self.state, EyeState::Open)
    }

    /// Feed one frame.
    ///
    /// `ear` is `None` when no face was detected. Absent, non-finite and
    /// non-positive ratios are skipped: they neither start, extend nor end a
    /// closure.
    pub fn process(&mut self, timestamp: f64, ear: Option<f64>) -> BlinkUpdate {
        let mut update = BlinkUpdate {
            completed: None,
            closure_started: false,
            blink_count: self.blink_count,
        };

        let ear = match ear {
            Some(value) if value.is_finite() && value > 0.0 => value,
            _ => {
                trace!(timestamp, "Skipping frame without a usable EAR");
                return update;
            }
        };

        let closed = ear < self.config.ear_threshold;

        self.state = match (self.state, closed) {
            (EyeState::Open, true) => {
                update.closure_started = true;
                EyeState::Closing {
                    started_at: timestamp,
                    frames: 1,
                }
            }
            (EyeState::Open, false) => EyeState::Open,
            (EyeState::Closing { started_at, frames }, true) => {
                let frames = frames.saturating_add(1);
                if frames > self.config.max_consecutive_frames {
                    debug!(
                        started_at,
                        frames, "Closure exceeded max frames, treating as sustained closure"
                    );
                    EyeState::SustainedClosure { started_at, frames }
                } else {
                    EyeState::Closing { started_at, frames }
                }
            }
            (EyeState::Closing { started_at, frames }, false) => {
                if frames >= self.config.min_consecutive_frames {
                    self.blink_count += 1;
                    let blink = CompletedBlink {
                        start: started_at,
                        end: timestamp,
                        frames,
                    };
                    debug!(
                        start = blink.start,
                        end = blink.end,
                        frames,
                        count = self.blink_count,
                        "Blink completed"
                    );
                    update.completed = Some(blink);
                    update.blink_count = self.blink_count;
                } else {
                    trace!(frames, "Closure too short, discarding");
                }
                EyeState::Open
            }
            (EyeState::SustainedClosure { started_at, frames }, true) => {
                EyeState::SustainedClosure {
                    started_at,
                    frames: frames.saturating_add(1),
                }
            }
            (EyeState::SustainedClosure { started_at, frames }, false) => {
                debug!(started_at, frames, "Sustained closure ended without a blink");
                EyeState::Open
            }
        };

        update
    }

    /// Drop any closure in progress and zero the counter
    pub fn reset(&mut self) {
        self.state = EyeState::Open;
        self.blink_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `ears` at timestamps 1, 2, 3, ... and collect every update
    fn run(machine: &mut BlinkStateMachine, ears: &[Option<f64>]) -> Vec<BlinkUpdate> {
        ears.iter()
            .enumerate()
            .map(|(i, ear)| machine.process((i + 1) as f64, *ear))
            .collect()
    }

    fn present(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    #[test]
    fn test_three_frame_closure_completes_one_blink() {
        let mut machine = BlinkStateMachine::default();
        let updates = run(&mut machine, &present(&[0.35, 0.35, 0.20, 0.19, 0.18, 0.30]));

        let completed: Vec<_> = updates.iter().filter_map(|u| u.completed).collect();
        assert_eq!(completed.len(), 1);
        assert_eq!(
            completed[0],
            CompletedBlink {
                start: 3.0,
                end: 6.0,
                frames: 3
            }
        );
        assert!(updates[5].blink_completed());
        assert!(updates[..5].iter().all(|u| !u.blink_completed()));
        assert!(updates[2].closure_started);
        assert_eq!(machine.blink_count(), 1);
    }

    #[test]
    fn test_two_frame_closure_is_noise() {
        let mut machine = BlinkStateMachine::default();
        let updates = run(&mut machine, &present(&[0.35, 0.20, 0.19, 0.35]));

        assert!(updates.iter().all(|u| !u.blink_completed()));
        assert_eq!(machine.blink_count(), 0);
        assert!(!machine.is_closed());
    }

    #[test]
    fn test_no_blink_while_still_closing() {
        let mut machine = BlinkStateMachine::default();
        let updates = run(&mut machine, &present(&[0.20, 0.20, 0.20, 0.20]));

        assert!(updates.iter().all(|u| !u.blink_completed()));
        assert!(machine.is_closed());
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut machine = BlinkStateMachine::default();
        let updates = run(&mut machine, &present(&[0.28, 0.20, 0.20, 0.20, 0.28]));

        assert!(!updates[0].closure_started);
        assert_eq!(updates[4].completed.map(|b| b.frames), Some(3));
    }

    #[test]
    fn test_absent_ear_does_not_start_closure() {
        let mut machine = BlinkStateMachine::default();
        let updates = run(&mut machine, &[None, None, None, Some(0.35)]);

        assert!(updates.iter().all(|u| !u.closure_started && !u.blink_completed()));
        assert!(!machine.is_closed());
    }

    #[test]
    fn test_absent_ear_does_not_end_or_extend_closure() {
        let mut machine = BlinkStateMachine::default();
        // Two closed frames, a face dropout, then one more closed frame: the
        // dropout must neither end the closure nor count towards it.
        let updates = run(
            &mut machine,
            &[Some(0.2), Some(0.2), None, None, Some(0.2), Some(0.35)],
        );

        let blink = updates[5].completed.unwrap();
        assert_eq!(blink.start, 1.0);
        assert_eq!(blink.end, 6.0);
        assert_eq!(blink.frames, 3);
        assert!(updates[..5].iter().all(|u| !u.blink_completed()));
    }

    #[test]
    fn test_non_positive_and_nan_ear_are_skipped() {
        let mut machine = BlinkStateMachine::default();
        let updates = run(
            &mut machine,
            &[Some(0.0), Some(-0.5), Some(f64::NAN), Some(f64::INFINITY)],
        );

        assert!(updates.iter().all(|u| !u.closure_started));
        assert!(!machine.is_closed());
    }

    #[test]
    fn test_sustained_closure_is_not_a_blink() {
        let mut machine = BlinkStateMachine::new(BlinkConfig {
            max_consecutive_frames: 5,
            ..Default::default()
        });
        let mut ears = vec![Some(0.1); 6];
        ears.push(Some(0.35));
        let updates = run(&mut machine, &ears);

        assert!(updates.iter().all(|u| !u.blink_completed()));
        assert_eq!(machine.blink_count(), 0);
        assert!(!machine.is_closed());

        // The machine recovers and detects the next ordinary blink.
        let next = run(&mut machine, &present(&[0.1, 0.1, 0.1, 0.35]));
        assert!(next[3].blink_completed());
    }

    #[test]
    fn test_closure_at_max_frames_still_counts() {
        let mut machine = BlinkStateMachine::new(BlinkConfig {
            max_consecutive_frames: 5,
            ..Default::default()
        });
        let mut ears = vec![Some(0.1); 5];
        ears.push(Some(0.35));
        let updates = run(&mut machine, &ears);

        assert_eq!(updates[5].completed.map(|b| b.frames), Some(5));
    }

    #[test]
    fn test_blink_count_accumulates() {
        let mut machine = BlinkStateMachine::default();
        let pattern = [0.35, 0.2, 0.2, 0.2, 0.35];
        let mut ears = present(&pattern);
        ears.extend(present(&pattern));
        let updates = run(&mut machine, &ears);

        assert_eq!(updates.last().unwrap().blink_count, 2);
        assert_eq!(updates[4].blink_count, 1);

        machine.reset();
        assert_eq!(machine.blink_count(), 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(BlinkConfig::default().validate().is_ok());

        let bad_threshold = BlinkConfig {
            ear_threshold: 0.0,
            ..Default::default()
        };
        assert!(bad_threshold.validate().is_err());

        let inverted = BlinkConfig {
            min_consecutive_frames: 10,
            max_consecutive_frames: 4,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }
}
