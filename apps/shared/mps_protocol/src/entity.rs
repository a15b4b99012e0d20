use serde::{Deserialize, Serialize};
use std::fmt;

/// Categories of game objects mirrored by the client pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum EntityKind {
    Ped = 0,
    Vehicle = 1,
    Object = 2,
    Blip = 3,
    Pickup = 4,
    Checkpoint = 5,
    Colshape = 6,
    Marker = 7,
    Label = 8,
    Camera = 9,
    Browser = 10,
    Dummy = 11,
}

impl EntityKind {
    /// Every kind, in discriminant order
    pub const ALL: [EntityKind; 12] = [
        EntityKind::Ped,
        EntityKind::Vehicle,
        EntityKind::Object,
        EntityKind::Blip,
        EntityKind::Pickup,
        EntityKind::Checkpoint,
        EntityKind::Colshape,
        EntityKind::Marker,
        EntityKind::Label,
        EntityKind::Camera,
        EntityKind::Browser,
        EntityKind::Dummy,
    ];

    /// Convert from u32 (for script interop)
    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Convert to u32 (for script interop)
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Position of this kind in [`EntityKind::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Script-facing type name
    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Ped => "ped",
            EntityKind::Vehicle => "vehicle",
            EntityKind::Object => "object",
            EntityKind::Blip => "blip",
            EntityKind::Pickup => "pickup",
            EntityKind::Checkpoint => "checkpoint",
            EntityKind::Colshape => "colshape",
            EntityKind::Marker => "marker",
            EntityKind::Label => "label",
            EntityKind::Camera => "camera",
            EntityKind::Browser => "browser",
            EntityKind::Dummy => "dummy",
        }
    }

    /// Inverse of [`EntityKind::name`], case-insensitive
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference to an entity carried inside event arguments
///
/// `id` is the process-local id when raised by the local engine; the core
/// passes peer-supplied references through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: u32,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: u32) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_conversion() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_u32(kind.to_u32()), Some(kind));
        }
        assert_eq!(EntityKind::from_u32(12), None);
        assert_eq!(EntityKind::Browser.index(), 10);
        assert_eq!(EntityKind::from_name("Vehicle"), Some(EntityKind::Vehicle));
        assert_eq!(EntityKind::from_name("tank"), None);
    }

    #[test]
    fn test_entity_ref_display() {
        assert_eq!(EntityRef::new(EntityKind::Vehicle, 7).to_string(), "vehicle#7");
    }
}
