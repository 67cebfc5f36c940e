use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::serde_as;

/// The stored form of a monitor snapshot.
///
/// The snapshot version is the KVV version of the entry.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MonitorEntry {
    pub latest_update_id: u64,
    #[serde_as(as = "Hex")]
    pub snapshot: Vec<u8>,
}

/// The stored form of an archived monitor
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ArchivedEntry {
    pub latest_update_id: u64,
    /// The snapshot version at the time of archiving
    pub version: u64,
    #[serde_as(as = "Hex")]
    pub snapshot: Vec<u8>,
}
