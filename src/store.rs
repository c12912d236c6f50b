// Durable per-VPC metadata. One JSON document per VPC under the state
// directory; the store is the source of truth across invocations and the
// kernel is a cache of its intent.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, VpcError};
use crate::model::VpcRecord;

/// Well-known state directory used by the CLI. Tests point the store at a
/// temporary directory instead.
pub const STATE_DIR: &str = "/etc/vpcctl";
pub const LOG_FILE: &str = "/etc/vpcctl/vpcctl.log";
pub const LOCK_FILE: &str = "/etc/vpcctl/.lock";

pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new() -> Self {
        Self::at(STATE_DIR)
    }

    pub fn at<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.document_path(name).exists()
    }

    pub fn load(&self, name: &str) -> Result<VpcRecord> {
        self.try_load(name)?.ok_or(VpcError::NotFound {
            kind: "VPC",
            name: name.to_string(),
        })
    }

    pub fn try_load(&self, name: &str) -> Result<Option<VpcRecord>> {
        let path = self.document_path(name);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Atomic replace: the document is written to a temp file in the same
    /// directory and renamed over the target, so a reader never sees a torn
    /// write and a crash leaves either the old or the new record.
    pub fn save(&self, record: &VpcRecord) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.document_path(&record.name);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Remove a document. Absence is not an error.
    pub fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.document_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All VPC records, sorted by name for stable output.
    pub fn list(&self) -> Result<Vec<VpcRecord>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read_to_string(&path)?;
            records.push(serde_json::from_str::<VpcRecord>(&data)?);
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Every record whose peerings reference `vpc`. Catches unilateral
    /// copies left behind by an interrupted peering teardown.
    pub fn peered_with(&self, vpc: &str) -> Result<Vec<VpcRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.name != vpc && r.peering_with(vpc).is_some())
            .collect())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Cidr;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record(name: &str, cidr: &str) -> VpcRecord {
        VpcRecord {
            name: name.to_string(),
            cidr: Cidr::parse(cidr).unwrap(),
            gateway: Cidr::parse(cidr).unwrap().first_usable(),
            bridge: format!("br-{}", name),
            subnets: Vec::new(),
            peerings: Vec::new(),
            policies: BTreeMap::new(),
        }
    }

    #[test]
    fn save_creates_directory_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = Store::at(dir.path().join("nested"));

        let rec = record("prod", "10.0.0.0/16");
        store.save(&rec).unwrap();

        assert!(store.exists("prod"));
        assert_eq!(store.load("prod").unwrap(), rec);
    }

    #[test]
    fn save_is_an_idempotent_upsert() {
        let dir = TempDir::new().unwrap();
        let store = Store::at(dir.path());

        let mut rec = record("prod", "10.0.0.0/16");
        store.save(&rec).unwrap();
        rec.bridge = "br-prod".to_string();
        store.save(&rec).unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
        // No temp file left behind by the rename dance.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn load_of_missing_record_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = Store::at(dir.path());
        assert!(matches!(
            store.load("ghost"),
            Err(crate::error::VpcError::NotFound { .. })
        ));
        assert!(store.try_load("ghost").unwrap().is_none());
    }

    #[test]
    fn delete_tolerates_absence() {
        let dir = TempDir::new().unwrap();
        let store = Store::at(dir.path());
        store.delete("ghost").unwrap();

        store.save(&record("prod", "10.0.0.0/16")).unwrap();
        store.delete("prod").unwrap();
        assert!(!store.exists("prod"));
    }

    #[test]
    fn peered_with_finds_referencing_records() {
        let dir = TempDir::new().unwrap();
        let store = Store::at(dir.path());

        let mut v = record("v", "10.0.0.0/16");
        let w = record("w", "10.1.0.0/16");
        v.peerings.push(crate::model::PeeringRecord {
            peer: "w".to_string(),
            block: Cidr::parse("192.168.0.0/30").unwrap(),
            local_endpoint: "192.168.0.1".parse().unwrap(),
            remote_endpoint: "192.168.0.2".parse().unwrap(),
            veth_local: "veth-peer-v-w-a".to_string(),
            veth_remote: "veth-peer-v-w-b".to_string(),
        });
        store.save(&v).unwrap();
        store.save(&w).unwrap();

        let referencing = store.peered_with("w").unwrap();
        assert_eq!(referencing.len(), 1);
        assert_eq!(referencing[0].name, "v");
        assert!(store.peered_with("v").unwrap().is_empty());
    }
}
