//! Boost classes: priority tiers that bias fetching independently of on-screen size.

/// Ordered from least to most important. The ordinal feeds the priority calculation directly, so adding a variant in
/// the middle reorders everything above it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BoostClass {
    #[default]
    Normal,
    Sculpt,
    Selected,
    Avatar,
    /// First class exempt from the memory bias.
    High,
    AvatarBake,
    Ui,
    SuperHigh,
}

impl BoostClass {
    pub const ALL: [BoostClass; 8] = [
        BoostClass::Normal,
        BoostClass::Sculpt,
        BoostClass::Selected,
        BoostClass::Avatar,
        BoostClass::High,
        BoostClass::AvatarBake,
        BoostClass::Ui,
        BoostClass::SuperHigh,
    ];

    pub fn ordinal(self) -> u32 {
        self as u32
    }

    /// High and above always load at usable quality, whatever the memory pressure.
    pub fn is_exempt_from_bias(self) -> bool {
        self >= BoostClass::High
    }
}
