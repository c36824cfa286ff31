//! Service categories: logical message namespaces carried by a connection.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bitmask of logical service categories.
///
/// A connection may serve several categories at once (bitwise OR). Message ids
/// are registered against a single category and resolved in
/// [`ServiceCategory::precedence`] order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ServiceCategory(u32);

impl ServiceCategory {
    /// No categories.
    pub const NONE: Self = Self(0);
    /// Messages shared by every backend (heartbeat, time sync, errors).
    pub const COMMON: Self = Self(1);
    /// Login and account flow.
    pub const LOGIN: Self = Self(2);
    /// In-game traffic.
    pub const GAME: Self = Self(4);
    /// Developer cheat commands. Only resolved in debug or `cheat` builds.
    pub const CHEAT: Self = Self(8);

    /// Resolution order, highest priority first.
    const PRECEDENCE: [Self; 4] = [Self::COMMON, Self::GAME, Self::LOGIN, Self::CHEAT];

    /// Build a category mask from raw bits. Unknown bits are kept.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Whether no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether exactly one known category bit is set.
    pub fn is_single(self) -> bool {
        self.0.count_ones() == 1 && Self::PRECEDENCE.contains(&self)
    }

    /// Whether cheat-category messages are routed in this build.
    pub const fn cheats_enabled() -> bool {
        cfg!(any(debug_assertions, feature = "cheat"))
    }

    /// The single-bit categories of this mask, in resolution order.
    ///
    /// [`ServiceCategory::CHEAT`] is skipped unless
    /// [`ServiceCategory::cheats_enabled`].
    pub fn precedence(self) -> impl Iterator<Item = ServiceCategory> {
        Self::PRECEDENCE.into_iter().filter(move |&category| {
            self.contains(category) && (category != Self::CHEAT || Self::cheats_enabled())
        })
    }

    /// Parse a category name (`common`, `login`, `game`, `cheat`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "common" => Some(Self::COMMON),
            "login" => Some(Self::LOGIN),
            "game" => Some(Self::GAME),
            "cheat" => Some(Self::CHEAT),
            _ => None,
        }
    }

    fn name(self) -> Option<&'static str> {
        match self {
            Self::COMMON => Some("Common"),
            Self::LOGIN => Some("Login"),
            Self::GAME => Some("Game"),
            Self::CHEAT => Some("Cheat"),
            _ => None,
        }
    }
}

impl BitOr for ServiceCategory {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ServiceCategory {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("ServiceCategory(NONE)");
        }
        f.write_str("ServiceCategory(")?;
        let mut first = true;
        let mut known = 0;
        for category in Self::PRECEDENCE {
            if self.contains(category) {
                if !first {
                    f.write_str(" | ")?;
                }
                first = false;
                known |= category.0;
                f.write_str(category.name().unwrap_or("?"))?;
            }
        }
        let unknown = self.0 & !known;
        if unknown != 0 {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "{unknown:#x}")?;
        }
        f.write_str(")")
    }
}
