//! Installation lifecycle states.
//!
//! States are totally ordered and every gate in the boot path is a
//! `state <= threshold` comparison, so the discriminants are load-bearing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Installation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum InstallState {
    /// Created by deploy, not yet seen by the target machine
    Queued = 100,
    /// Target machine fetched its first boot artifact
    Started = 200,
    /// A boot script was served to the target machine
    Booting = 300,
    /// The installer fetched its kickstart
    Installing = 400,
    /// Terminal, set by the completion callback
    Finished = 500,
}

impl InstallState {
    pub const ALL: [InstallState; 5] = [
        InstallState::Queued,
        InstallState::Started,
        InstallState::Booting,
        InstallState::Installing,
        InstallState::Finished,
    ];

    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstallState::Queued => "queued",
            InstallState::Started => "started",
            InstallState::Booting => "booting",
            InstallState::Installing => "installing",
            InstallState::Finished => "finished",
        }
    }

    /// Whether an installation in this state passes a `state <= threshold` gate.
    pub fn within(self, threshold: InstallState) -> bool {
        self <= threshold
    }

    pub fn is_terminal(self) -> bool {
        self == InstallState::Finished
    }
}

impl TryFrom<i16> for InstallState {
    type Error = Error;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            100 => Ok(InstallState::Queued),
            200 => Ok(InstallState::Started),
            300 => Ok(InstallState::Booting),
            400 => Ok(InstallState::Installing),
            500 => Ok(InstallState::Finished),
            other => Err(Error::Storage(format!("unknown installation state {}", other))),
        }
    }
}

impl FromStr for InstallState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstallState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::NotFound(format!("installation state '{}'", s)))
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_are_ordered() {
        for pair in InstallState::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].as_i16() < pair[1].as_i16());
        }
    }

    #[test]
    fn test_threshold_is_inclusive_and_monotonic() {
        for state in InstallState::ALL {
            for threshold in InstallState::ALL {
                if state.within(threshold) {
                    for higher in InstallState::ALL.iter().filter(|t| **t >= threshold) {
                        assert!(state.within(*higher));
                    }
                }
            }
            assert!(state.within(state));
        }
    }

    #[test]
    fn test_i16_mapping() {
        for state in InstallState::ALL {
            assert_eq!(InstallState::try_from(state.as_i16()).unwrap(), state);
        }
        assert!(InstallState::try_from(0).is_err());
        assert!(InstallState::try_from(250).is_err());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("Booting".parse::<InstallState>().unwrap(), InstallState::Booting);
        assert_eq!("installing".parse::<InstallState>().unwrap(), InstallState::Installing);
        assert!("done".parse::<InstallState>().is_err());
    }
}
