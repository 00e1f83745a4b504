//! The command schema: every three-letter code, its value kind and its
//! accepted domain.
//!
//! The table is static. Adding a code means adding one line to the
//! `command_codes!` invocation below; the enum, the name table and the
//! per-code kind are all generated from it.

use core::fmt;
use core::str::FromStr;

use crate::role::RoleId;

/// Vertical pixel count of the cameras, which bounds the saturation row setting.
pub const CAMERA_PIX_NUM_Y: i64 = 486;

/// Pixel count of the spectrometer detector.
pub const SPECTROMETER_PIX_NUM: i64 = 2048;

/// Value kind and accepted domain of a code.
///
/// String and list domains use an empty set to mean "accept anything".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kind {
    /// Literal `0` or `1` on the wire
    Bool,
    /// Inclusive integer range
    Int { min: i64, max: i64 },
    /// Inclusive float range, two decimals on the wire
    Float { min: f64, max: f64 },
    /// Single token from an enumerated set
    Str(&'static [&'static str]),
    /// Comma-joined tokens, each from an enumerated set
    List(&'static [&'static str]),
}

impl Kind {
    /// Whether this kind accepts free-form text.
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Kind::Str(d) | Kind::List(d) if d.is_empty())
    }
}

const ANY: &[&str] = &[];

/// Generate the `Code` enum along with its name table and schema lookup
/// from a single list of `CODE => Kind` lines.
macro_rules! command_codes {
    (
        $(
            $( #[$variant_attr:meta] )*
            $code:ident => $kind:expr
        ),+ $(,)?
    ) => {
        /// Three-letter command code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[allow(clippy::upper_case_acronyms)]
        pub enum Code {
            $(
                $( #[$variant_attr] )*
                $code
            ),+
        }

        impl Code {
            /// Every code in the schema, in wire order.
            pub const ALL: &'static [Code] = &[ $( Code::$code ),+ ];

            /// Names of every code in the schema, in wire order.
            pub const NAMES: &'static [&'static str] = &[ $( stringify!($code) ),+ ];

            /// Three-letter wire name.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Code::$code => stringify!($code) ),+
                }
            }

            /// Value kind and domain.
            pub const fn kind(self) -> Kind {
                match self {
                    $( Code::$code => $kind ),+
                }
            }
        }
    };
}

command_codes! {
    /// Identity of the sender
    IDN => Kind::Str(RoleId::TAGS),
    /// Destination roles; absent means everyone
    DST => Kind::List(RoleId::TAGS),
    /// Shutter speed (us), camera A
    SSA => Kind::Int { min: 1, max: 6_000_001 },
    /// Shutter speed (us), camera B
    SSB => Kind::Int { min: 1, max: 6_000_001 },
    /// Integration time (ms), spectrometer
    SSS => Kind::Int { min: 1, max: 10_001 },
    /// Camera framerate (Hz)
    FRC => Kind::Float { min: 0.0, max: 1.0 },
    /// Spectrometer framerate (Hz)
    FRS => Kind::Float { min: 0.0, max: 10.0 },
    /// Auto shutter speed, camera A
    ATA => Kind::Bool,
    /// Auto shutter speed, camera B
    ATB => Kind::Bool,
    /// Auto integration time, spectrometer
    ATS => Kind::Bool,
    /// Spectrometer coadd count
    CAD => Kind::Int { min: 0, max: 20 },
    /// Camera minimum saturation before adjusting shutter speed
    SMN => Kind::Float { min: 0.0, max: 0.9 },
    /// Camera maximum saturation before adjusting shutter speed
    SMX => Kind::Float { min: 0.1, max: 1.0 },
    /// Camera saturation pixel count
    PXC => Kind::Int { min: 0, max: 10_000 },
    /// Camera saturation rows; negative counts from the bottom
    RWC => Kind::Int { min: -CAMERA_PIX_NUM_Y, max: CAMERA_PIX_NUM_Y },
    /// Spectrometer saturation pixel count
    PXS => Kind::Int { min: 0, max: SPECTROMETER_PIX_NUM },
    /// Spectrometer saturation window, lower wavelength
    WMN => Kind::Int { min: 300, max: 400 },
    /// Spectrometer saturation window, upper wavelength
    WMX => Kind::Int { min: 300, max: 400 },
    /// Spectrometer minimum saturation
    SNS => Kind::Float { min: 0.0, max: 0.9 },
    /// Spectrometer maximum saturation
    SXS => Kind::Float { min: 0.1, max: 1.0 },
    /// Capture type tag, camera A
    TPA => Kind::Str(ANY),
    /// Capture type tag, camera B
    TPB => Kind::Str(ANY),
    /// Capture type tag, spectrometer
    TPS => Kind::Str(ANY),
    /// Start dark sequence on the cameras
    DKC => Kind::Bool,
    /// Dark sequence finished on a camera
    DFC => Kind::Bool,
    /// Start dark sequence on the spectrometer
    DKS => Kind::Bool,
    /// Dark sequence finished on the spectrometer
    DFS => Kind::Bool,
    /// Stop continuous camera capture
    SPC => Kind::Bool,
    /// Stop continuous spectrometer capture
    SPS => Kind::Bool,
    /// Start continuous camera capture
    STC => Kind::Bool,
    /// Start continuous spectrometer capture
    STS => Kind::Bool,
    /// Exit
    EXT => Kind::Bool,
    /// Forced exit, accepted during dark capture
    DXT => Kind::Bool,
    /// Restart
    RST => Kind::Bool,
    /// Status request: 0 connection test, 1 settings
    LOG => Kind::Int { min: 0, max: 5 },
    /// Hello; a true value asks for a reply
    HLO => Kind::Bool,
    /// Hello reply from camera A
    HLA => Kind::Bool,
    /// Hello reply from camera B
    HLB => Kind::Bool,
    /// Hello reply from the spectrometer
    HLS => Kind::Bool,
    /// Goodbye, carrying the sender's own remote port
    GBY => Kind::Int { min: 0, max: 65_535 },
    /// List connected peers
    LST => Kind::Bool,
    /// Connected peers as `ip:port/ROLE`
    CNX => Kind::List(ANY),
    /// New image, camera A
    NIA => Kind::Str(ANY),
    /// New image metadata, camera A
    NMA => Kind::Str(ANY),
    /// New image, camera B
    NIB => Kind::Str(ANY),
    /// New image metadata, camera B
    NMB => Kind::Str(ANY),
    /// New spectrum
    NIS => Kind::Str(ANY),
    /// Codes that failed validation or could not be acted on
    ERR => Kind::List(Code::NAMES),
}

/// One row of the schema table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchemaEntry {
    pub code: Code,
    pub kind: Kind,
}

/// Iterate the full schema table.
pub fn schema() -> impl Iterator<Item = SchemaEntry> {
    Code::ALL.iter().map(|&code| SchemaEntry {
        code,
        kind: code.kind(),
    })
}

/// Look up a code by its wire name.
pub fn lookup(name: &str) -> Option<Code> {
    Code::ALL.iter().copied().find(|c| c.as_str() == name)
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Code {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lookup(s).ok_or(())
    }
}
