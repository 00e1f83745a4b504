//! Role identities carried in the `IDN` and `DST` fields.

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

/// One logical participant on the instrument network.
///
/// A connection learns its role from the handshake and keeps it for
/// the rest of its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoleId {
    /// Supervisory controller process
    Orchestrator,
    /// On-band camera
    CameraA,
    /// Off-band camera
    CameraB,
    /// Spectrometer
    Spectrometer,
    /// Operator tool or automation script connected over the network
    External,
    /// Sender did not identify itself
    Unidentified,
}

/// Error returned when a tag is not one of [`RoleId::TAGS`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role tag `{0}`")]
pub struct UnknownRole(pub String);

impl RoleId {
    /// Every role, in tag order.
    pub const ALL: [RoleId; 6] = [
        RoleId::Orchestrator,
        RoleId::CameraA,
        RoleId::CameraB,
        RoleId::Spectrometer,
        RoleId::External,
        RoleId::Unidentified,
    ];

    /// Wire tags accepted in `IDN` and `DST`.
    pub const TAGS: &'static [&'static str] = &["MAS", "CM1", "CM2", "SPC", "EXN", "NUL"];

    /// Three-letter wire tag.
    pub const fn tag(self) -> &'static str {
        match self {
            RoleId::Orchestrator => "MAS",
            RoleId::CameraA => "CM1",
            RoleId::CameraB => "CM2",
            RoleId::Spectrometer => "SPC",
            RoleId::External => "EXN",
            RoleId::Unidentified => "NUL",
        }
    }

    /// Roles that own a device on the instrument.
    pub const fn is_device(self) -> bool {
        matches!(
            self,
            RoleId::CameraA | RoleId::CameraB | RoleId::Spectrometer
        )
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for RoleId {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoleId::ALL
            .iter()
            .copied()
            .find(|r| r.tag() == s)
            .ok_or_else(|| UnknownRole(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_variants() {
        for (role, tag) in RoleId::ALL.iter().zip(RoleId::TAGS) {
            assert_eq!(role.tag(), *tag);
            assert_eq!(tag.parse::<RoleId>().unwrap(), *role);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(
            "XYZ".parse::<RoleId>(),
            Err(UnknownRole("XYZ".to_owned()))
        );
    }
}
