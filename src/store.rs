//! Persistent store of network records
//!
//! A provisioner keeps one record per mesh network it manages: the network key and its index,
//! the IV index, the next outbound sequence number, the application key names bound to the
//! network, and the next unicast address to hand to a provisioned device. Records are kept as
//! YAML files under `${base}/net/${name}.yml` and the store is the only code that touches
//! those files.
//!
//! The sequence number and the unicast allocator are mutated exclusively through
//! [`allocate_seq`](NetworkStore::allocate_seq) and
//! [`allocate_unicast`](NetworkStore::allocate_unicast), which persist the incremented value
//! before handing the allocation out. Callers must never read-modify-write these fields
//! themselves, otherwise two PDUs could go out under one nonce.

use serde::{Deserialize, Serialize};

use std::fs;
use std::io;
use std::path::PathBuf;

use crate::crypto;

/// Largest value the 24 bit sequence counter can reach
pub const SEQ_MAX: u32 = 0x00FF_FFFF;

/// Largest valid unicast address
const UNICAST_MAX: u16 = 0x7FFF;

/// Everything persisted for one mesh network
///
/// `seq` is the *next* sequence number to place in an outbound network PDU and `next_unicast`
/// is the *next* address to assign during provisioning. Both only ever grow, as does
/// `iv_index`; [`NetworkStore::save`] refuses to persist a regression of either.
#[derive(Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub struct NetworkRecord {
    pub name: String,
    pub net_key: [u8; crypto::KEY_LEN],
    pub net_key_index: u16,
    pub iv_index: u32,
    pub seq: u32,
    pub apps: Vec<String>,
    pub next_unicast: u16,
}

impl NetworkRecord {
    /// The IV index in the big-endian wire order used by nonces and the privacy ECB
    pub fn iv_index_bytes(&self) -> [u8; 4] {
        self.iv_index.to_be_bytes()
    }
}

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Format(serde_yaml::Error),
    /// No record file exists for the requested network name
    UnknownNetwork(String),
    /// A record with this name already exists
    NameCollision(String),
    /// Saving the record would move its sequence number backwards
    SequenceRegression(String),
    /// Saving the record would move its IV index backwards
    IvIndexRegression(String),
    /// The 24 bit sequence space of the network is used up
    SequenceExhausted(String),
    /// No unicast addresses are left to assign
    UnicastExhausted(String),
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "store io error: {}", err),
            StoreError::Format(err) => write!(f, "malformed network record: {}", err),
            StoreError::UnknownNetwork(name) => write!(f, "no network named \"{}\"", name),
            StoreError::NameCollision(name) => write!(f, "network \"{}\" already exists", name),
            StoreError::SequenceRegression(name) => {
                write!(f, "refusing to regress the sequence number of \"{}\"", name)
            }
            StoreError::IvIndexRegression(name) => {
                write!(f, "refusing to regress the iv index of \"{}\"", name)
            }
            StoreError::SequenceExhausted(name) => {
                write!(f, "sequence numbers of \"{}\" are exhausted", name)
            }
            StoreError::UnicastExhausted(name) => {
                write!(f, "unicast addresses of \"{}\" are exhausted", name)
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> StoreError {
        StoreError::Io(err)
    }
}

impl From<serde_yaml::Error> for StoreError {
    fn from(err: serde_yaml::Error) -> StoreError {
        StoreError::Format(err)
    }
}

/// Handle to the on-disk store rooted at a base directory
///
/// The handle is cheap to clone; every layer that needs records gets its own.
#[derive(Clone,Debug)]
pub struct NetworkStore {
    base: PathBuf,
}

impl NetworkStore {
    pub fn new<P>(base: P) -> Self
    where
        P: Into<PathBuf>,
    {
        NetworkStore { base: base.into() }
    }

    /// The file a record of the given name lives in
    pub fn record_path(&self, name: &str) -> PathBuf {
        self.base.join("net").join(format!("{}.yml", name))
    }

    /// Create, persist, and return a record for a brand new network
    ///
    /// The network key and IV index are drawn from the system RNG; the sequence counter
    /// starts at zero and unicast assignment starts at 0x0001.
    pub fn create(&self, name: &str, net_key_index: u16) -> Result<NetworkRecord, StoreError> {
        if self.record_path(name).exists() {
            return Err( StoreError::NameCollision(name.to_string()) );
        }

        let mut net_key = [0u8; crypto::KEY_LEN];
        let mut iv_index = [0u8; 4];

        crypto::fill_random(&mut net_key);
        crypto::fill_random(&mut iv_index);

        let record = NetworkRecord {
            name: name.to_string(),
            net_key,
            net_key_index,
            iv_index: <u32>::from_be_bytes(iv_index),
            seq: 0,
            apps: Vec::new(),
            next_unicast: 0x0001,
        };

        self.save(&record)?;

        Ok(record)
    }

    pub fn load(&self, name: &str) -> Result<NetworkRecord, StoreError> {
        let path = self.record_path(name);

        if !path.exists() {
            return Err( StoreError::UnknownNetwork(name.to_string()) );
        }

        Ok( serde_yaml::from_str(&fs::read_to_string(path)?)? )
    }

    /// Persist a record, upholding the monotonicity of `seq` and `iv_index`
    pub fn save(&self, record: &NetworkRecord) -> Result<(), StoreError> {
        match self.load(&record.name) {
            Ok(existing) => {
                if record.seq < existing.seq {
                    return Err( StoreError::SequenceRegression(record.name.clone()) );
                }
                if record.iv_index < existing.iv_index {
                    return Err( StoreError::IvIndexRegression(record.name.clone()) );
                }
            }
            Err(StoreError::UnknownNetwork(_)) => (),
            Err(other) => return Err(other),
        }

        let path = self.record_path(&record.name);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, serde_yaml::to_string(record)?)?;

        Ok(())
    }

    /// Load every record in the store
    ///
    /// Files that fail to parse are logged and skipped so one corrupt record cannot take the
    /// whole network layer down.
    pub fn list(&self) -> Result<Vec<NetworkRecord>, StoreError> {
        let dir = self.base.join("net");

        if !dir.exists() {
            return Ok( Vec::new() );
        }

        let mut records = Vec::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();

            if path.extension().map(|ext| ext == "yml") != Some(true) {
                continue;
            }

            match fs::read_to_string(&path).map_err(StoreError::from).and_then(|text| {
                serde_yaml::from_str::<NetworkRecord>(&text).map_err(StoreError::from)
            }) {
                Ok(record) => records.push(record),
                Err(err) => log::warn!("skipping unreadable record {}: {}", path.display(), err),
            }
        }

        Ok(records)
    }

    /// Take the next outbound sequence number of a network
    ///
    /// The incremented counter is persisted before the allocated value is returned, so a
    /// sequence number can never be handed out twice even across a restart.
    pub fn allocate_seq(&self, name: &str) -> Result<u32, StoreError> {
        let mut record = self.load(name)?;

        let seq = record.seq;

        if seq >= SEQ_MAX {
            return Err( StoreError::SequenceExhausted(name.to_string()) );
        }

        record.seq = seq + 1;

        self.save(&record)?;

        Ok(seq)
    }

    /// Take the next unicast address of a network
    pub fn allocate_unicast(&self, name: &str) -> Result<u16, StoreError> {
        let mut record = self.load(name)?;

        let unicast = record.next_unicast;

        if unicast == 0 || unicast >= UNICAST_MAX {
            return Err( StoreError::UnicastExhausted(name.to_string()) );
        }

        record.next_unicast = unicast + 1;

        self.save(&record)?;

        Ok(unicast)
    }
}

#[cfg(test)]
pub(crate) mod tests {

    use super::*;

    /// A store under the system temporary directory, removed when dropped
    pub(crate) struct TempStore {
        pub store: NetworkStore,
        base: PathBuf,
    }

    impl TempStore {
        pub(crate) fn new(tag: &str) -> Self {
            let base = std::env::temp_dir().join(format!(
                "meshwork-{}-{}",
                tag,
                std::process::id()
            ));

            // stale leftovers from an aborted run would break the collision tests
            let _ = fs::remove_dir_all(&base);

            TempStore { store: NetworkStore::new(&base), base }
        }
    }

    impl Drop for TempStore {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.base);
        }
    }

    pub(crate) fn sample_record(name: &str) -> NetworkRecord {
        NetworkRecord {
            name: name.to_string(),
            net_key: [0x7d; crypto::KEY_LEN],
            net_key_index: 0x0123,
            iv_index: 0x1234_5678,
            seq: 0x07,
            apps: (0..10).map(|index| format!("test_app{}", index)).collect(),
            next_unicast: 0x0002,
        }
    }

    #[test]
    fn save_then_load_round_trip() {
        let temp = TempStore::new("round-trip");

        let record = sample_record("test_net");

        assert!( !temp.store.record_path("test_net").exists() );

        temp.store.save(&record).unwrap();

        assert!( temp.store.record_path("test_net").exists() );

        assert_eq!( record, temp.store.load("test_net").unwrap() );
    }

    #[test]
    fn load_of_missing_network() {
        let temp = TempStore::new("missing");

        match temp.store.load("nothing_here") {
            Err(StoreError::UnknownNetwork(name)) => assert_eq!( "nothing_here", name ),
            other => panic!("expected UnknownNetwork, got {:?}", other),
        }
    }

    #[test]
    fn create_draws_fresh_material() {
        let temp = TempStore::new("create");

        let record = temp.store.create("fresh", 0).unwrap();

        assert_eq!( 0, record.seq );
        assert_eq!( 0x0001, record.next_unicast );

        let other = temp.store.create("fresh2", 0).unwrap();

        assert_ne!( record.net_key, other.net_key );

        match temp.store.create("fresh", 0) {
            Err(StoreError::NameCollision(_)) => (),
            other => panic!("expected NameCollision, got {:?}", other),
        }
    }

    #[test]
    fn seq_allocation_is_monotonic_and_persisted() {
        let temp = TempStore::new("seq");

        temp.store.save(&sample_record("net")).unwrap();

        assert_eq!( 0x07, temp.store.allocate_seq("net").unwrap() );
        assert_eq!( 0x08, temp.store.allocate_seq("net").unwrap() );

        // the counter was persisted, not just held in memory
        assert_eq!( 0x09, temp.store.load("net").unwrap().seq );
    }

    #[test]
    fn seq_regression_is_rejected() {
        let temp = TempStore::new("seq-regress");

        temp.store.save(&sample_record("net")).unwrap();

        let mut rewound = sample_record("net");
        rewound.seq = 0x03;

        match temp.store.save(&rewound) {
            Err(StoreError::SequenceRegression(_)) => (),
            other => panic!("expected SequenceRegression, got {:?}", other),
        }

        let mut rewound_iv = sample_record("net");
        rewound_iv.iv_index = 0;

        match temp.store.save(&rewound_iv) {
            Err(StoreError::IvIndexRegression(_)) => (),
            other => panic!("expected IvIndexRegression, got {:?}", other),
        }
    }

    #[test]
    fn unicast_allocation_advances() {
        let temp = TempStore::new("unicast");

        temp.store.save(&sample_record("net")).unwrap();

        assert_eq!( 0x0002, temp.store.allocate_unicast("net").unwrap() );
        assert_eq!( 0x0003, temp.store.allocate_unicast("net").unwrap() );
        assert_eq!( 0x0004, temp.store.load("net").unwrap().next_unicast );
    }

    #[test]
    fn list_returns_every_saved_record() {
        let temp = TempStore::new("list");

        temp.store.save(&sample_record("alpha")).unwrap();
        temp.store.save(&sample_record("beta")).unwrap();

        let mut names = temp
            .store
            .list()
            .unwrap()
            .into_iter()
            .map(|record| record.name)
            .collect::<Vec<_>>();

        names.sort();

        assert_eq!( vec!["alpha".to_string(), "beta".to_string()], names );
    }
}
