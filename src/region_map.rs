use crate::{
    region::{Access, BufferHandle, Region},
    types::{Address, IndexSet, TaskId},
};
use rustc_hash::FxBuildHasher;
use std::collections::BTreeMap;

/// Last writer and current readers of one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionEntry {
    /// Bytes this entry describes.
    pub region: Region,
    /// Task that last wrote the region, if any task did.
    pub writer: Option<TaskId>,
    /// Tasks that read the region since the last write.
    pub readers: IndexSet<TaskId>,
}

/// Entries recorded through buffers based at one address.
#[derive(Debug, Default)]
struct Bucket {
    /// Highest end of any entry's range.
    end: u64,
    entries: Vec<RegionEntry>,
}

impl Bucket {
    fn refresh_end(&mut self) {
        self.end = self
            .entries
            .iter()
            .map(|entry| entry.region.range.end)
            .max()
            .unwrap_or(0);
    }
}

/// Dependency index: who last wrote and who reads which absolute bytes.
///
/// Entries are bucketed by the base address of the buffer they were recorded
/// through. Every entry starts at or after its bucket's address, so a lookup
/// only visits buckets based below the end of the queried range whose highest
/// end lies past its start. Within and across buckets entries may overlap; an
/// entry is only replaced by a write that covers it completely. Every
/// imprecision adds edges, never removes them.
#[derive(Debug, Default)]
pub struct RegionMap {
    buckets: BTreeMap<Address, Bucket>,
}

impl RegionMap {
    /// Total number of entries across all buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(|bucket| bucket.entries.len()).sum()
    }

    /// Whether the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries recorded through buffers based at `key`.
    #[must_use]
    pub fn entries(&self, key: Address) -> &[RegionEntry] {
        self.buckets
            .get(&key)
            .map_or(&[], |bucket| bucket.entries.as_slice())
    }

    /// Base addresses of the buckets that may hold entries intersecting `region`.
    fn candidate_keys(&self, region: &Region) -> Vec<Address> {
        self.buckets
            .range(..region.range.end)
            .filter(|(_, bucket)| bucket.end > region.range.start)
            .map(|(&key, _)| key)
            .collect()
    }

    /// Predecessors a task with the given accesses must wait for, in order of
    /// discovery and without duplicates.
    ///
    /// Every hazard between an entry and an access yields an edge: from the
    /// last writer for read-after-write and write-after-write, from every
    /// reader for write-after-read.
    #[must_use]
    pub fn dependencies(&self, accesses: &[(Region, Access)]) -> IndexSet<TaskId> {
        let mut predecessors = IndexSet::with_hasher(FxBuildHasher);
        for (region, access) in accesses {
            let entries = self
                .candidate_keys(region)
                .into_iter()
                .flat_map(|key| self.entries(key));
            for entry in entries {
                if entry.region.hazard(Access::Write, region, *access).is_some() {
                    predecessors.extend(entry.writer);
                }
                if entry.region.hazard(Access::Read, region, *access).is_some() {
                    predecessors.extend(entry.readers.iter().copied());
                }
            }
        }
        predecessors
    }

    /// Register `task`'s accesses, in parameter order.
    ///
    /// `is_retired` tells whether a task has left the task window; entries that
    /// only reference retired tasks are dropped while their bucket is visited.
    pub fn record(
        &mut self,
        task: TaskId,
        accesses: &[(Region, Access)],
        is_retired: impl Fn(TaskId) -> bool,
    ) {
        for (region, access) in accesses {
            let mut keys = self.candidate_keys(region);
            if !keys.contains(&region.key) {
                keys.push(region.key);
            }

            let mut covered = false;
            for key in keys {
                let Some(bucket) = self.buckets.get_mut(&key) else {
                    continue;
                };
                bucket.entries.retain_mut(|entry| {
                    entry.readers.retain(|&reader| !is_retired(reader));
                    entry.writer.is_some_and(|writer| !is_retired(writer))
                        || !entry.readers.is_empty()
                });
                if access.writes() {
                    bucket.entries.retain(|entry| !region.covers(&entry.region));
                } else {
                    let overlapping = bucket
                        .entries
                        .iter_mut()
                        .filter(|entry| entry.region.overlaps(region));
                    for entry in overlapping {
                        entry.readers.insert(task);
                        covered |= entry.region.covers(region);
                    }
                }
                if bucket.entries.is_empty() {
                    self.buckets.remove(&key);
                } else {
                    bucket.refresh_end();
                }
            }

            let entry = if access.writes() {
                RegionEntry {
                    region: region.clone(),
                    writer: Some(task),
                    readers: IndexSet::default(),
                }
            } else if covered {
                continue;
            } else {
                // Remember the read so a later writer orders itself after it.
                RegionEntry {
                    region: region.clone(),
                    writer: None,
                    readers: IndexSet::from_iter([task]),
                }
            };
            let bucket = self.buckets.entry(region.key).or_default();
            bucket.end = bucket.end.max(region.range.end);
            bucket.entries.push(entry);
        }
    }

    /// Forget every entry describing one of `buffers`. Called when their arena
    /// storage is reclaimed; a later occupant carries a new version anyway.
    pub fn invalidate(&mut self, buffers: &[BufferHandle]) {
        for buffer in buffers {
            let Some(addr) = buffer.addr() else {
                continue;
            };
            if let Some(bucket) = self.buckets.get_mut(&addr) {
                bucket
                    .entries
                    .retain(|entry| entry.region.version != buffer.version());
                if bucket.entries.is_empty() {
                    self.buckets.remove(&addr);
                } else {
                    bucket.refresh_end();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(key: Address, range: core::ops::Range<u64>) -> Region {
        Region {
            key,
            range: key + range.start..key + range.end,
            version: 0,
        }
    }

    fn submit(map: &mut RegionMap, task: u64, accesses: &[(Region, Access)]) -> Vec<TaskId> {
        let deps = map.dependencies(accesses).into_iter().collect();
        map.record(TaskId(task), accesses, |_| false);
        deps
    }

    #[test]
    fn read_after_write_and_write_after_read() {
        let mut map = RegionMap::default();
        let x = region(0x100, 0..64);
        assert!(submit(&mut map, 0, &[(x.clone(), Access::Write)]).is_empty());
        assert_eq!(submit(&mut map, 1, &[(x.clone(), Access::Read)]), vec![TaskId(0)]);
        assert_eq!(submit(&mut map, 2, &[(x.clone(), Access::Read)]), vec![TaskId(0)]);
        assert_eq!(
            submit(&mut map, 3, &[(x.clone(), Access::Write)]),
            vec![TaskId(0), TaskId(1), TaskId(2)]
        );
        // The covering write replaced the old entry.
        assert_eq!(submit(&mut map, 4, &[(x, Access::Read)]), vec![TaskId(3)]);
    }

    #[test]
    fn partial_overlap_is_conservative() {
        let mut map = RegionMap::default();
        submit(&mut map, 0, &[(region(0x100, 0..64), Access::Write)]);
        submit(&mut map, 1, &[(region(0x100, 0..32), Access::Write)]);
        // Bytes 32..64 still belong to task 0.
        assert_eq!(
            submit(&mut map, 2, &[(region(0x100, 40..48), Access::Read)]),
            vec![TaskId(0)]
        );
        assert_eq!(
            submit(&mut map, 3, &[(region(0x100, 16..48), Access::Read)]),
            vec![TaskId(0), TaskId(1)]
        );
    }

    #[test]
    fn reads_of_unwritten_buffers_still_order_later_writes() {
        let mut map = RegionMap::default();
        let input = region(0x200, 0..16);
        submit(&mut map, 0, &[(input.clone(), Access::Read)]);
        assert_eq!(submit(&mut map, 1, &[(input, Access::Write)]), vec![TaskId(0)]);
    }

    #[test]
    fn read_only_tasks_and_disjoint_buffers_are_independent() {
        let mut map = RegionMap::default();
        submit(&mut map, 0, &[(region(0x100, 0..64), Access::Write)]);
        assert!(submit(&mut map, 1, &[(region(0x100, 64..128), Access::Write)]).is_empty());
        assert!(submit(&mut map, 2, &[(region(0x300, 0..64), Access::Read)]).is_empty());
        assert!(submit(&mut map, 3, &[(region(0x300, 0..64), Access::Read)]).is_empty());
    }

    #[test]
    fn inout_chains_form_a_line() {
        let mut map = RegionMap::default();
        let acc = region(0x400, 0..8);
        assert!(submit(&mut map, 0, &[(acc.clone(), Access::ReadWrite)]).is_empty());
        for task in 1..5 {
            assert_eq!(
                submit(&mut map, task, &[(acc.clone(), Access::ReadWrite)]),
                vec![TaskId(task - 1)]
            );
        }
    }

    #[test]
    fn invalidation_and_retirement_prune_entries() {
        let mut map = RegionMap::default();
        let buffer = BufferHandle::arena(0x500, 64, 7, 2);
        let whole = Region::whole(&buffer).unwrap();
        submit(&mut map, 0, &[(whole, Access::Write)]);
        submit(&mut map, 1, &[(region(0x600, 0..8), Access::Write)]);
        assert_eq!(map.len(), 2);
        map.invalidate(&[buffer]);
        assert_eq!(map.len(), 1);
        assert!(map.entries(0x500).is_empty());

        map.record(TaskId(2), &[(region(0x600, 0..4), Access::Read)], |id| id == TaskId(1));
        // Task 1's entry is gone; task 2's read is recorded on its own.
        assert_eq!(map.entries(0x600).len(), 1);
        assert_eq!(map.entries(0x600)[0].writer, None);
    }

    #[test]
    fn buffers_based_at_different_addresses_alias_by_bytes() {
        let mut map = RegionMap::default();
        let whole = region(0x1000, 0..256);
        let sub = region(0x1080, 0..64);
        submit(&mut map, 0, &[(whole.clone(), Access::Write)]);
        assert_eq!(submit(&mut map, 1, &[(sub.clone(), Access::Read)]), vec![TaskId(0)]);
        assert_eq!(
            submit(&mut map, 2, &[(sub.clone(), Access::Write)]),
            vec![TaskId(0), TaskId(1)]
        );
        // The sub-buffer write is partial; the parent's writer stays relevant.
        assert_eq!(
            submit(&mut map, 3, &[(whole.clone(), Access::Read)]),
            vec![TaskId(0), TaskId(2)]
        );
        assert!(submit(&mut map, 4, &[(region(0x1100, 0..64), Access::Write)]).is_empty());
        // A covering write through the parent replaces the sub-buffer entry too.
        submit(&mut map, 5, &[(whole, Access::Write)]);
        assert!(map.entries(0x1080).is_empty());
        assert_eq!(submit(&mut map, 6, &[(sub, Access::Read)]), vec![TaskId(5)]);
    }
}
