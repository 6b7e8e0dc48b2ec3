//! ScriptedSensor: replays a fixed sequence of outcomes.
//!
//! Used by tests and demos to drive the pipeline deterministically: each
//! `initialize` pops the next scripted init outcome (succeeding once the
//! script is empty) and each `read` pops the next scripted reading or error.

use std::collections::VecDeque;

use super::{InitError, ReadError, SensorInfo, SensorSource};
use crate::reading::Reading;

pub struct ScriptedSensor {
    info: SensorInfo,
    init_outcomes: VecDeque<InitError>,
    reads: VecDeque<Result<Reading, ReadError>>,
    init_attempts: u32,
    reads_taken: u32,
}

impl ScriptedSensor {
    pub fn new() -> Self {
        Self {
            info: SensorInfo {
                name: "scripted",
                description: "Replays a scripted sequence of readings and failures",
                hardware: false,
            },
            init_outcomes: VecDeque::new(),
            reads: VecDeque::new(),
            init_attempts: 0,
            reads_taken: 0,
        }
    }

    /// Queue a failing `initialize` outcome.
    pub fn fail_init(mut self, err: InitError) -> Self {
        self.init_outcomes.push_back(err);
        self
    }

    /// Queue a successful read.
    pub fn then_read(mut self, reading: Reading) -> Self {
        self.reads.push_back(Ok(reading));
        self
    }

    /// Queue a failed read.
    pub fn then_fail(mut self, err: ReadError) -> Self {
        self.reads.push_back(Err(err));
        self
    }

    pub fn init_attempts(&self) -> u32 {
        self.init_attempts
    }

    pub fn reads_taken(&self) -> u32 {
        self.reads_taken
    }
}

impl Default for ScriptedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for ScriptedSensor {
    fn info(&self) -> &SensorInfo {
        &self.info
    }

    fn initialize(&mut self) -> Result<(), InitError> {
        self.init_attempts += 1;
        match self.init_outcomes.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn read(&mut self) -> Result<Reading, ReadError> {
        self.reads_taken += 1;
        self.reads
            .pop_front()
            .unwrap_or_else(|| Err(ReadError::Unavailable("script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_replay_in_order() {
        let mut s = ScriptedSensor::new()
            .then_read(Reading::new(22.5, 45.0, 410))
            .then_fail(ReadError::Busy)
            .then_read(Reading::new(22.6, 45.1, 415));

        assert_eq!(s.read().unwrap().co2, 410);
        assert!(matches!(s.read(), Err(ReadError::Busy)));
        assert_eq!(s.read().unwrap().co2, 415);
        assert_eq!(s.reads_taken(), 3);
    }

    #[test]
    fn test_exhausted_script_is_unavailable() {
        let mut s = ScriptedSensor::new();
        assert!(matches!(s.read(), Err(ReadError::Unavailable(_))));
    }
}
