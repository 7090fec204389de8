use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// 播放器状态位
///
/// PREPARING 与 PREPARED 互斥；PLAYING 蕴含 PREPARED。
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PlayerFlags(u32);

impl PlayerFlags {
    pub const PLAYING: PlayerFlags = PlayerFlags(1);
    pub const LOOPING: PlayerFlags = PlayerFlags(2);
    pub const FIRST_FRAME: PlayerFlags = PlayerFlags(4);
    pub const PREPARING: PlayerFlags = PlayerFlags(8);
    pub const PREPARED: PlayerFlags = PlayerFlags(16);
    pub const AT_EOS: PlayerFlags = PlayerFlags(32);

    pub const fn empty() -> Self {
        PlayerFlags(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// 是否包含 `other` 的全部位
    pub const fn contains(&self, other: PlayerFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PlayerFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PlayerFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: PlayerFlags, value: bool) {
        if value {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl BitOr for PlayerFlags {
    type Output = PlayerFlags;

    fn bitor(self, rhs: PlayerFlags) -> PlayerFlags {
        PlayerFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PlayerFlags {
    fn bitor_assign(&mut self, rhs: PlayerFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PlayerFlags {
    type Output = PlayerFlags;

    fn bitand(self, rhs: PlayerFlags) -> PlayerFlags {
        PlayerFlags(self.0 & rhs.0)
    }
}

impl Not for PlayerFlags {
    type Output = PlayerFlags;

    fn not(self) -> PlayerFlags {
        PlayerFlags(!self.0)
    }
}

impl fmt::Debug for PlayerFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PlayerFlags, &str); 6] = [
            (PlayerFlags::PLAYING, "PLAYING"),
            (PlayerFlags::LOOPING, "LOOPING"),
            (PlayerFlags::FIRST_FRAME, "FIRST_FRAME"),
            (PlayerFlags::PREPARING, "PREPARING"),
            (PlayerFlags::PREPARED, "PREPARED"),
            (PlayerFlags::AT_EOS, "AT_EOS"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "PlayerFlags({})", names.join(" | "))
    }
}
