/*!
 * Device identities.
 */
use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// A fixed, enumerable set of device slots
///
/// The coordinator creates exactly one connection and one controller per
/// key returned by [`DeviceKey::all`]. `Display` gives the name used to look
/// up the device's settings.
pub trait DeviceKey: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static {
    /// Every key of the domain
    fn all() -> Vec<Self>;
}

/// The bundled device domain: three flight computers and a HIL rig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceId {
    /// Flight control computer 1
    Fcc1,
    /// Flight control computer 2
    Fcc2,
    /// Flight control computer 3
    Fcc3,
    /// Hardware-in-the-loop rig
    Hil,
}

impl DeviceId {
    /// Every device id in display order
    pub const ALL: [DeviceId; 4] = [DeviceId::Fcc1, DeviceId::Fcc2, DeviceId::Fcc3, DeviceId::Hil];

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceId::Fcc1 => "FCC1",
            DeviceId::Fcc2 => "FCC2",
            DeviceId::Fcc3 => "FCC3",
            DeviceId::Hil => "HIL",
        }
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceId {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceId::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DeviceError::UnknownDevice(s.to_string()))
    }
}

impl DeviceKey for DeviceId {
    fn all() -> Vec<Self> {
        DeviceId::ALL.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for id in DeviceId::all() {
            assert_eq!(id.to_string().parse::<DeviceId>().unwrap(), id);
        }
        assert_eq!(" hil ".parse::<DeviceId>().unwrap(), DeviceId::Hil);
    }

    #[test]
    fn test_unknown_name() {
        assert!(matches!(
            "FCC4".parse::<DeviceId>(),
            Err(DeviceError::UnknownDevice(name)) if name == "FCC4"
        ));
    }
}
