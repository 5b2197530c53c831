//! Firmware dialects and their constant frame tables.
//!
//! The byte tables are opaque: they were captured from working consoles and
//! are replayed verbatim. Nothing here is derived at runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One keep-alive step of a poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollStep {
    /// Frame written on this tick
    pub frame: &'static [u8],
    /// Skip the wire trace for this frame
    pub log_suppressed: bool,
}

impl PollStep {
    const fn logged(frame: &'static [u8]) -> Self {
        Self {
            frame,
            log_suppressed: false,
        }
    }

    const fn quiet(frame: &'static [u8]) -> Self {
        Self {
            frame,
            log_suppressed: true,
        }
    }
}

/// Firmware dialect spoken by the treadmill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceVariant {
    /// Default dialect, six-step poll cycle and a pinned telemetry header
    #[default]
    Generic,
    /// Alternate dialect, seven-step poll cycle
    AltProtocol,
}

impl fmt::Display for DeviceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => write!(f, "Generic"),
            Self::AltProtocol => write!(f, "AltProtocol"),
        }
    }
}

impl DeviceVariant {
    /// Frames sent once after subscription, in order
    #[must_use]
    pub const fn init_sequence(self) -> &'static [&'static [u8]] {
        match self {
            Self::Generic => GENERIC_INIT,
            Self::AltProtocol => ALT_INIT,
        }
    }

    /// Keep-alive frames cycled through one per tick
    #[must_use]
    pub const fn poll_sequence(self) -> &'static [PollStep] {
        match self {
            Self::Generic => GENERIC_POLL,
            Self::AltProtocol => ALT_POLL,
        }
    }

    /// Number of ticks in one poll cycle
    #[must_use]
    pub const fn poll_len(self) -> usize {
        self.poll_sequence().len()
    }

    /// Poll index on which pending speed/incline requests are written.
    ///
    /// Always the step right after the main telemetry poll frame.
    #[must_use]
    pub const fn command_slot(self) -> usize {
        match self {
            Self::Generic => 3,
            Self::AltProtocol => 5,
        }
    }

    /// Bytes 4..=5 every telemetry frame must carry, if the dialect pins them
    #[must_use]
    pub const fn header_check(self) -> Option<[u8; 2]> {
        match self {
            Self::Generic => Some([0x02, 0x31]),
            Self::AltProtocol => None,
        }
    }
}

const INIT_ANNOUNCE_08: &[u8] = &[0xfe, 0x02, 0x08, 0x02];
const INIT_ANNOUNCE_0A: &[u8] = &[0xfe, 0x02, 0x0a, 0x02];
const INIT_ANNOUNCE_2C: &[u8] = &[0xfe, 0x02, 0x2c, 0x04];

const INIT_SUPPORTED_FEATURES: &[u8] = &[
    0xff, 0x08, 0x02, 0x04, 0x02, 0x04, 0x02, 0x04, 0x81, 0x87, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];
const INIT_CAPABILITIES_A: &[u8] = &[
    0xff, 0x0a, 0x02, 0x04, 0x02, 0x06, 0x02, 0x06, 0x82, 0x00, 0x00, 0x8a, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];
const INIT_CAPABILITIES_B: &[u8] = &[
    0xff, 0x0a, 0x02, 0x04, 0x02, 0x06, 0x02, 0x06, 0x84, 0x00, 0x00, 0x8c, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];
const INIT_VERSION: &[u8] = &[
    0xff, 0x08, 0x02, 0x04, 0x02, 0x04, 0x02, 0x04, 0x95, 0x9b, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];

const GENERIC_INIT: &[&[u8]] = &[
    INIT_ANNOUNCE_08,
    INIT_SUPPORTED_FEATURES,
    INIT_ANNOUNCE_08,
    &[
        0xff, 0x08, 0x02, 0x04, 0x02, 0x04, 0x04, 0x04, 0x80, 0x88, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ],
    INIT_ANNOUNCE_08,
    &[
        0xff, 0x08, 0x02, 0x04, 0x02, 0x04, 0x04, 0x04, 0x88, 0x90, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ],
    INIT_ANNOUNCE_0A,
    INIT_CAPABILITIES_A,
    INIT_ANNOUNCE_0A,
    INIT_CAPABILITIES_B,
    INIT_ANNOUNCE_08,
    INIT_VERSION,
    INIT_ANNOUNCE_2C,
    &[
        0x00, 0x12, 0x02, 0x04, 0x02, 0x28, 0x04, 0x28, 0x90, 0x04, 0x00, 0x61, 0xd8, 0x5d, 0xd0,
        0x51, 0xd0, 0x55, 0xe8, 0x61,
    ],
    &[
        0x01, 0x12, 0xf8, 0x8d, 0x00, 0x91, 0x20, 0xd5, 0x48, 0xe1, 0x98, 0x3d, 0xd0, 0x71, 0x10,
        0xb5, 0x48, 0xe1, 0xb8, 0x4d,
    ],
    &[
        0xff, 0x08, 0xe0, 0xb1, 0x40, 0x80, 0x02, 0x00, 0x00, 0x75, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ],
    &[0xfe, 0x02, 0x17, 0x03],
    &[
        0x00, 0x12, 0x02, 0x04, 0x02, 0x13, 0x04, 0x13, 0x02, 0x00, 0x0d, 0x00, 0x10, 0x00, 0xd8,
        0x1c, 0x48, 0x00, 0x00, 0xe0,
    ],
    &[
        0xff, 0x05, 0x00, 0x00, 0x00, 0x10, 0x62, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ],
    &[0xfe, 0x02, 0x19, 0x03],
    &[
        0x00, 0x12, 0x02, 0x04, 0x02, 0x15, 0x04, 0x15, 0x02, 0x0e, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ],
    &[
        0xff, 0x07, 0x00, 0x00, 0x00, 0x10, 0x01, 0x00, 0x3a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ],
];

const ALT_INIT: &[&[u8]] = &[
    INIT_ANNOUNCE_08,
    INIT_SUPPORTED_FEATURES,
    INIT_ANNOUNCE_08,
    &[
        0xff, 0x08, 0x02, 0x04, 0x02, 0x04, 0x07, 0x04, 0x80, 0x8b, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ],
    INIT_ANNOUNCE_08,
    &[
        0xff, 0x08, 0x02, 0x04, 0x02, 0x04, 0x07, 0x04, 0x88, 0x93, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ],
    INIT_ANNOUNCE_0A,
    INIT_CAPABILITIES_A,
    INIT_ANNOUNCE_0A,
    INIT_CAPABILITIES_B,
    INIT_ANNOUNCE_08,
    INIT_VERSION,
    INIT_ANNOUNCE_2C,
    &[
        0x00, 0x12, 0x02, 0x04, 0x02, 0x28, 0x07, 0x28, 0x90, 0x07, 0x01, 0x10, 0xcc, 0x7a, 0x3e,
        0xf4, 0xb8, 0x66, 0x3a, 0xf8,
    ],
    &[
        0x01, 0x12, 0xb4, 0x72, 0x46, 0x1c, 0xf0, 0xbe, 0x92, 0x40, 0x3c, 0xea, 0xce, 0xa4, 0x88,
        0x76, 0x4a, 0x28, 0x04, 0xe2,
    ],
    &[
        0xff, 0x08, 0xf6, 0xcc, 0xe0, 0x98, 0x02, 0x00, 0x00, 0xd1, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ],
];

const POLL_ANNOUNCE_17: &[u8] = &[0xfe, 0x02, 0x17, 0x03];

const GENERIC_POLL: &[PollStep] = &[
    PollStep::logged(&[
        0xff, 0x05, 0x18, 0x00, 0x00, 0x01, 0x2f, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ]),
    PollStep::logged(POLL_ANNOUNCE_17),
    // telemetry poll
    PollStep::logged(&[
        0x00, 0x12, 0x02, 0x04, 0x02, 0x13, 0x04, 0x13, 0x02, 0x00, 0x0d, 0x80, 0x0a, 0x40, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ]),
    PollStep::quiet(&[
        0xff, 0x05, 0x00, 0x00, 0x00, 0x84, 0x74, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ]),
    PollStep::logged(POLL_ANNOUNCE_17),
    PollStep::logged(&[
        0x00, 0x12, 0x02, 0x04, 0x02, 0x13, 0x04, 0x13, 0x02, 0x00, 0x0d, 0x1b, 0x94, 0x31, 0x00,
        0x00, 0x40, 0x50, 0x00, 0x80,
    ]),
];

const ALT_POLL: &[PollStep] = &[
    PollStep::logged(&[0xfe, 0x02, 0x19, 0x03]),
    PollStep::logged(&[
        0x00, 0x12, 0x02, 0x04, 0x02, 0x15, 0x07, 0x15, 0x02, 0x00, 0x0f, 0xbc, 0x90, 0x70, 0x00,
        0x00, 0x00, 0x40, 0x00, 0x00,
    ]),
    PollStep::logged(&[
        0xff, 0x07, 0x00, 0x00, 0x00, 0x10, 0x00, 0x08, 0x5d, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ]),
    PollStep::logged(POLL_ANNOUNCE_17),
    // telemetry poll
    PollStep::logged(&[
        0x00, 0x12, 0x02, 0x04, 0x02, 0x13, 0x07, 0x13, 0x02, 0x00, 0x0d, 0x3c, 0x9c, 0x31, 0x00,
        0x00, 0x40, 0x40, 0x00, 0x80,
    ]),
    PollStep::logged(&[
        0xff, 0x05, 0x00, 0x80, 0x01, 0x00, 0xa9, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ]),
    PollStep::logged(&[0xfe, 0x02, 0x0d, 0x02]),
];
