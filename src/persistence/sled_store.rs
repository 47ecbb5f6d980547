use sled::Db;

/// Records recovered for one topic partition, in offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPartition {
    pub topic: String,
    pub partition: u32,
    pub records: Vec<Vec<u8>>,
}

/// Durable segment storage for the embedded log broker.
///
/// Each topic partition lives in its own sled tree named
/// `<topic>/<partition>`, keyed by the big-endian record offset so iteration
/// yields records in append order.
#[derive(Clone)]
pub struct LogStore {
    db: Db,
}

impl LogStore {
    pub fn open(path: &str) -> Result<Self, sled::Error> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    pub fn append(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        record: &[u8],
    ) -> Result<(), sled::Error> {
        let tree = self.db.open_tree(tree_name(topic, partition))?;
        tree.insert(offset.to_be_bytes(), record)?;
        Ok(())
    }

    /// Loads every stored partition. Trees that do not follow the naming
    /// scheme are skipped.
    pub fn load(&self) -> Result<Vec<StoredPartition>, sled::Error> {
        let mut partitions = Vec::new();
        for name in self.db.tree_names() {
            let Some((topic, partition)) = parse_tree_name(&name) else {
                continue;
            };
            let tree = self.db.open_tree(&name)?;
            let records = tree
                .iter()
                .values()
                .map(|value| value.map(|v| v.to_vec()))
                .collect::<Result<Vec<_>, _>>()?;
            partitions.push(StoredPartition {
                topic,
                partition,
                records,
            });
        }
        Ok(partitions)
    }

    pub fn flush(&self) -> Result<(), sled::Error> {
        self.db.flush()?;
        Ok(())
    }
}

fn tree_name(topic: &str, partition: u32) -> String {
    format!("{topic}/{partition}")
}

fn parse_tree_name(name: &[u8]) -> Option<(String, u32)> {
    let name = std::str::from_utf8(name).ok()?;
    let (topic, partition) = name.rsplit_once('/')?;
    if topic.is_empty() {
        return None;
    }
    Some((topic.to_string(), partition.parse().ok()?))
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("db", &"sled::Db")
            .finish()
    }
}
