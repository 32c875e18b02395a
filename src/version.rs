// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// On-flash format version.
///
/// The bookkeeping and record layouts in this crate are bit-exact, so there
/// is no spare byte to stash a version marker in. The version is tracked
/// in-memory only and asserted identical across every
/// [`crate::SegmentManager::recover`] call within a process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Version {
    /// Version for 1.x.x releases
    V1,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

impl From<Version> for u8 {
    fn from(value: Version) -> Self {
        match value {
            Version::V1 => 1,
        }
    }
}

impl TryFrom<u8> for Version {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            _ => Err(()),
        }
    }
}

/// The version every [`crate::CommitLog::recover`] call in this process must
/// agree on, tracked purely in-memory (§9, Open Question: "fix one byte
/// order ... add a format-version byte if you anticipate future change";
/// §10.4 decision: no on-disk byte is defined by this specification, so the
/// check lives at the process level instead of on flash).
static CURRENT_VERSION: std::sync::OnceLock<Version> = std::sync::OnceLock::new();

/// Registers `version` as this process's commit-log version, or confirms it
/// matches whatever was registered by an earlier [`crate::CommitLog::recover`]
/// call. Returns the previously registered version on mismatch.
pub(crate) fn check_and_set(version: Version) -> Result<(), Option<Version>> {
    let registered = *CURRENT_VERSION.get_or_init(|| version);
    if registered == version {
        Ok(())
    } else {
        Err(Some(registered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_round_trips_through_u8() {
        let byte = u8::from(Version::V1);
        assert_eq!(Version::try_from(byte), Ok(Version::V1));
    }

    #[test]
    fn unknown_version_byte_rejected() {
        assert!(Version::try_from(0).is_err());
        assert!(Version::try_from(2).is_err());
    }
}
