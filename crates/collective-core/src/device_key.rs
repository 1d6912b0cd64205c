/// The ordered set of device ids that forms one collective communicator
/// group. Two keys are equal iff the underlying sequences are
/// element-wise equal; insertion order is preserved because rank
/// assignment inside the communicator depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DeviceTupleKey(Vec<i32>);

impl DeviceTupleKey {
    /// Builds a key from the participating device ids, sorted so that
    /// workers which agree on the *set* of devices also agree on the key
    /// regardless of the order they were enumerated in.
    ///
    /// Panics in debug builds if any id is negative: a negative local id
    /// means a peer was missing from the group, which is a caller bug.
    pub fn from_devices(mut devices: Vec<i32>) -> Self {
        debug_assert!(
            devices.iter().all(|&d| d >= 0),
            "negative device id in communicator key: {devices:?}"
        );
        devices.sort_unstable();
        Self(devices)
    }

    pub fn devices(&self) -> &[i32] {
        &self.0
    }

    pub fn group_size(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Display for DeviceTupleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}
