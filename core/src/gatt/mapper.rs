//! Permission and property mapping
//!
//! Pure translations between the application's integer codes and the typed
//! capability sets the radio stack understands. None of these functions fail:
//! unknown codes are ignored or mapped to the most restrictive variant.

use crate::platform::{AdvertisementStatus, ProtectionLevel};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

// ============================================================================
// CHARACTERISTIC PROPERTIES
// ============================================================================

/// Stack-side characteristic property flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CharacteristicFlags(u32);

impl CharacteristicFlags {
    pub const NONE: Self = Self(0);
    pub const BROADCAST: Self = Self(0x0001);
    pub const READ: Self = Self(0x0002);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x0004);
    pub const WRITE: Self = Self(0x0008);
    pub const NOTIFY: Self = Self(0x0010);
    pub const INDICATE: Self = Self(0x0020);
    pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x0040);
    pub const EXTENDED_PROPERTIES: Self = Self(0x0080);
    pub const RELIABLE_WRITES: Self = Self(0x0100);
    pub const WRITABLE_AUXILIARIES: Self = Self(0x0200);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Value pushes (notify or indicate) are possible
    pub fn can_push(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

impl BitOr for CharacteristicFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CharacteristicFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Application-level property codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CharacteristicProperty {
    Broadcast = 0,
    Read = 1,
    WriteWithoutResponse = 2,
    Write = 3,
    Notify = 4,
    Indicate = 5,
    AuthenticatedSignedWrites = 6,
    ExtendedProperties = 7,
    NotifyEncryptionRequired = 8,
    IndicateEncryptionRequired = 9,
}

impl CharacteristicProperty {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Broadcast),
            1 => Some(Self::Read),
            2 => Some(Self::WriteWithoutResponse),
            3 => Some(Self::Write),
            4 => Some(Self::Notify),
            5 => Some(Self::Indicate),
            6 => Some(Self::AuthenticatedSignedWrites),
            7 => Some(Self::ExtendedProperties),
            8 => Some(Self::NotifyEncryptionRequired),
            9 => Some(Self::IndicateEncryptionRequired),
            _ => None,
        }
    }

    pub fn flag(&self) -> CharacteristicFlags {
        match self {
            Self::Broadcast => CharacteristicFlags::BROADCAST,
            Self::Read => CharacteristicFlags::READ,
            Self::WriteWithoutResponse => CharacteristicFlags::WRITE_WITHOUT_RESPONSE,
            Self::Write => CharacteristicFlags::WRITE,
            Self::Notify | Self::NotifyEncryptionRequired => CharacteristicFlags::NOTIFY,
            Self::Indicate | Self::IndicateEncryptionRequired => CharacteristicFlags::INDICATE,
            Self::AuthenticatedSignedWrites => CharacteristicFlags::AUTHENTICATED_SIGNED_WRITES,
            Self::ExtendedProperties => CharacteristicFlags::EXTENDED_PROPERTIES,
        }
    }
}

/// Fold application property codes into stack flags; unknown codes are skipped
pub fn to_characteristic_properties(codes: &[i64]) -> CharacteristicFlags {
    codes
        .iter()
        .filter_map(|&code| CharacteristicProperty::from_code(code))
        .fold(CharacteristicFlags::NONE, |flags, property| {
            flags | property.flag()
        })
}

// ============================================================================
// PERMISSIONS
// ============================================================================

/// Application-level permission codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlePermission {
    Readable,
    Writeable,
    ReadEncryptionRequired,
    WriteEncryptionRequired,
    None,
}

/// Total mapping from a permission code; out-of-range codes are `None`
pub fn to_permission(code: i64) -> BlePermission {
    match code {
        0 => BlePermission::Readable,
        1 => BlePermission::Writeable,
        2 => BlePermission::ReadEncryptionRequired,
        3 => BlePermission::WriteEncryptionRequired,
        _ => BlePermission::None,
    }
}

/// How one direction (read or write) of an attribute may be accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    Denied,
    Open,
    EncryptionRequired,
}

impl AccessLevel {
    pub fn protection(&self) -> ProtectionLevel {
        match self {
            Self::EncryptionRequired => ProtectionLevel::EncryptionRequired,
            Self::Denied | Self::Open => ProtectionLevel::Plain,
        }
    }
}

/// Read and write access of a characteristic or descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionSet {
    pub read: AccessLevel,
    pub write: AccessLevel,
}

impl PermissionSet {
    pub const OPEN: Self = Self {
        read: AccessLevel::Open,
        write: AccessLevel::Open,
    };
}

/// Fold permission codes into a [`PermissionSet`].
///
/// The strongest requirement per direction wins. An empty list leaves access
/// open (the property flags gate it); a list of only `None` codes denies both.
pub fn to_permission_set(codes: &[i64]) -> PermissionSet {
    if codes.is_empty() {
        return PermissionSet::OPEN;
    }

    let mut set = PermissionSet {
        read: AccessLevel::Denied,
        write: AccessLevel::Denied,
    };
    for &code in codes {
        match to_permission(code) {
            BlePermission::Readable => set.read = set.read.max(AccessLevel::Open),
            BlePermission::Writeable => set.write = set.write.max(AccessLevel::Open),
            BlePermission::ReadEncryptionRequired => set.read = AccessLevel::EncryptionRequired,
            BlePermission::WriteEncryptionRequired => set.write = AccessLevel::EncryptionRequired,
            BlePermission::None => {}
        }
    }
    set
}

// ============================================================================
// DIAGNOSTICS
// ============================================================================

pub fn advertisement_status_to_text(status: AdvertisementStatus) -> &'static str {
    match status {
        AdvertisementStatus::Created => "Created",
        AdvertisementStatus::Started => "Started",
        AdvertisementStatus::Stopped => "Stopped",
        AdvertisementStatus::Aborted => "Aborted",
        AdvertisementStatus::AdvertisementCancelled => "AdvertisementCancelled",
    }
}

impl fmt::Display for AdvertisementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(advertisement_status_to_text(*self))
    }
}

/// Reduce a platform client token to the remote device address.
///
/// Tokens look like `BluetoothLE#BluetoothLE<local>-<remote>`; the part after
/// the final `-` is the remote address.
pub fn parse_client_id(token: &str) -> String {
    match token.rsplit_once('-') {
        Some((_, remote)) if !remote.is_empty() => remote.to_string(),
        _ => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_permission_codes() {
        assert_eq!(to_permission(0), BlePermission::Readable);
        assert_eq!(to_permission(1), BlePermission::Writeable);
        assert_eq!(to_permission(2), BlePermission::ReadEncryptionRequired);
        assert_eq!(to_permission(3), BlePermission::WriteEncryptionRequired);
        assert_eq!(to_permission(4), BlePermission::None);
        assert_eq!(to_permission(-1), BlePermission::None);
        assert_eq!(to_permission(5), BlePermission::None);
    }

    proptest! {
        #[test]
        fn prop_to_permission_is_deterministic(code in any::<i64>()) {
            prop_assert_eq!(to_permission(code), to_permission(code));
            if !(0..=3).contains(&code) {
                prop_assert_eq!(to_permission(code), BlePermission::None);
            }
        }

        #[test]
        fn prop_permission_set_is_order_independent(mut codes in prop::collection::vec(-2i64..7, 0..8)) {
            let forward = to_permission_set(&codes);
            codes.reverse();
            prop_assert_eq!(forward, to_permission_set(&codes));
        }

        #[test]
        fn prop_unknown_property_codes_ignored(codes in prop::collection::vec(10i64..1000, 0..8)) {
            prop_assert!(to_characteristic_properties(&codes).is_empty());
        }
    }

    #[test]
    fn test_property_codes_map_to_flags() {
        let flags = to_characteristic_properties(&[1, 3, 4]);
        assert!(flags.contains(CharacteristicFlags::READ));
        assert!(flags.contains(CharacteristicFlags::WRITE));
        assert!(flags.contains(CharacteristicFlags::NOTIFY));
        assert!(!flags.contains(CharacteristicFlags::INDICATE));
        assert_eq!(flags.bits(), 0x2 | 0x8 | 0x10);
    }

    #[test]
    fn test_encrypted_push_codes_share_flags() {
        assert_eq!(
            to_characteristic_properties(&[8]),
            CharacteristicFlags::NOTIFY
        );
        assert_eq!(
            to_characteristic_properties(&[9]),
            CharacteristicFlags::INDICATE
        );
        assert!(to_characteristic_properties(&[9]).can_push());
        assert!(!to_characteristic_properties(&[1, 3]).can_push());
    }

    #[test]
    fn test_unknown_property_code_skipped() {
        let flags = to_characteristic_properties(&[42, 1, -7]);
        assert_eq!(flags, CharacteristicFlags::READ);
    }

    #[test]
    fn test_permission_set_strongest_wins() {
        let set = to_permission_set(&[0, 2, 1]);
        assert_eq!(set.read, AccessLevel::EncryptionRequired);
        assert_eq!(set.write, AccessLevel::Open);

        let set = to_permission_set(&[2, 0]);
        assert_eq!(set.read, AccessLevel::EncryptionRequired);
    }

    #[test]
    fn test_permission_set_defaults() {
        assert_eq!(to_permission_set(&[]), PermissionSet::OPEN);

        let denied = to_permission_set(&[4]);
        assert_eq!(denied.read, AccessLevel::Denied);
        assert_eq!(denied.write, AccessLevel::Denied);

        let read_only = to_permission_set(&[0]);
        assert_eq!(read_only.read, AccessLevel::Open);
        assert_eq!(read_only.write, AccessLevel::Denied);
    }

    #[test]
    fn test_protection_levels() {
        assert_eq!(
            AccessLevel::EncryptionRequired.protection(),
            ProtectionLevel::EncryptionRequired
        );
        assert_eq!(AccessLevel::Open.protection(), ProtectionLevel::Plain);
        assert_eq!(AccessLevel::Denied.protection(), ProtectionLevel::Plain);
    }

    #[test]
    fn test_status_text() {
        assert_eq!(
            advertisement_status_to_text(AdvertisementStatus::Started),
            "Started"
        );
        assert_eq!(
            AdvertisementStatus::AdvertisementCancelled.to_string(),
            "AdvertisementCancelled"
        );
    }

    #[test]
    fn test_parse_client_id() {
        assert_eq!(
            parse_client_id("BluetoothLE#BluetoothLE00:1a:7d:da:71:13-aa:bb:cc:dd:ee:ff"),
            "aa:bb:cc:dd:ee:ff"
        );
        assert_eq!(parse_client_id("aa:bb:cc:dd:ee:ff"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(parse_client_id("trailing-"), "trailing-");
    }
}
