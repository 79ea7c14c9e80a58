use crate::error::ShardError;

/// Number of slots on the hash-slot ring.
pub const HASH_SLOT_COUNT: u32 = 1023;

/// Maps a shard-key identifier onto one shard of an ordered backend list.
///
/// `init` runs once when the owning table connection is built; `shard_index`
/// must be side-effect-free and stable under repeated calls.
pub trait ShardingAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&mut self, shard_count: usize) -> Result<(), ShardError>;

    /// Index of the shard owning `key`, in `0..shard_count`.
    fn shard_index(&self, shard_count: usize, key: i64) -> Result<usize, ShardError>;
}

/// `key mod n`. Works for any non-empty backend list, including a single
/// backend.
#[derive(Debug, Default)]
pub struct Modulo;

impl ShardingAlgorithm for Modulo {
    fn name(&self) -> &'static str {
        "modulo"
    }

    fn init(&mut self, shard_count: usize) -> Result<(), ShardError> {
        if shard_count == 0 {
            return Err(ShardError::invalid_config(
                "modulo algorithm requires at least one shard",
            ));
        }
        Ok(())
    }

    fn shard_index(&self, shard_count: usize, key: i64) -> Result<usize, ShardError> {
        if shard_count == 0 {
            return Err(ShardError::invalid_config(
                "modulo algorithm requires at least one shard",
            ));
        }
        Ok(key.rem_euclid(shard_count as i64) as usize)
    }
}

/// Hash ring over a fixed slot count. Slots are partitioned into contiguous
/// ranges, one per shard, with the last range absorbing the remainder. The
/// owning slot is `crc32(decimal-string(key)) mod slot_count`.
#[derive(Debug)]
pub struct HashSlot {
    slot_count: u32,
    /// Half-open `[start, end)` slot ranges, one per shard, in shard order.
    ranges: Vec<(u32, u32)>,
}

impl Default for HashSlot {
    fn default() -> Self {
        Self {
            slot_count: HASH_SLOT_COUNT,
            ranges: Vec::new(),
        }
    }
}

impl HashSlot {
    fn slot_of(&self, key: i64) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key.to_string().as_bytes());
        hasher.finalize() % self.slot_count
    }
}

impl ShardingAlgorithm for HashSlot {
    fn name(&self) -> &'static str {
        "hashmap"
    }

    fn init(&mut self, shard_count: usize) -> Result<(), ShardError> {
        if shard_count < 2 {
            return Err(ShardError::invalid_config(
                "hashmap algorithm requires at least two shards",
            ));
        }
        let per_shard = self.slot_count / shard_count as u32;
        self.ranges = (0..shard_count as u32)
            .map(|i| {
                let start = i * per_shard;
                let end = if i as usize == shard_count - 1 {
                    self.slot_count
                } else {
                    start + per_shard
                };
                (start, end)
            })
            .collect();
        Ok(())
    }

    fn shard_index(&self, shard_count: usize, key: i64) -> Result<usize, ShardError> {
        if self.ranges.len() != shard_count {
            return Err(ShardError::invalid_config(
                "hashmap algorithm was not initialized for this shard list",
            ));
        }
        let slot = self.slot_of(key);
        self.ranges
            .iter()
            .position(|(start, end)| slot >= *start && slot < *end)
            .ok_or_else(|| {
                ShardError::invalid_config(format!("slot {slot} is owned by no shard"))
            })
    }
}
