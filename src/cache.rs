use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};

use crate::chunk::ChunkReader;
use crate::error::Result;
use crate::model::id::Id;
use crate::storage::Endpoint;

/// One chunk a query intends to read.
#[derive(Clone, Debug)]
pub struct FetchInfo {
    pub id: Id,
    pub depth: u64,
}

struct Slot {
    refs: usize,
    bytes: usize,
    /// None while the owning load is still in flight.
    data: Option<Arc<ChunkReader>>,
}

struct State {
    resident: HashMap<Id, Slot>,
    /// Refcount-zero residents in eviction order.
    idle: LruCache<Id, ()>,
    resident_bytes: usize,
}

struct Shared {
    capacity: usize,
    state: Mutex<State>,
    room: Condvar,
}

/// Shared chunk cache. At most one load runs per chunk id, and resident
/// bytes stay within the capacity plus at most one in-flight chunk.
#[derive(Clone)]
pub struct Cache {
    shared: Arc<Shared>,
}

impl Cache {
    pub fn new(capacity_bytes: usize) -> Cache {
        Cache {
            shared: Arc::new(Shared {
                capacity: capacity_bytes,
                state: Mutex::new(State {
                    resident: HashMap::new(),
                    idle: LruCache::unbounded(),
                    resident_bytes: 0,
                }),
                room: Condvar::new(),
            }),
        }
    }

    pub fn resident_bytes(&self) -> usize {
        self.shared.state.lock().resident_bytes
    }

    /// Reserve an ordered fetch set for one query. Chunks are pinned one
    /// at a time as the block advances.
    pub fn reserve(
        &self,
        ep: Arc<dyn Endpoint>,
        point_size: usize,
        prefix_ids: bool,
        postfix: String,
        fetches: Vec<FetchInfo>,
    ) -> Block {
        Block {
            cache: self.clone(),
            ep,
            point_size,
            prefix_ids,
            postfix,
            fetches,
            position: 0,
            pinned: None,
        }
    }

    /// Returns the chunk and whether it is pinned in the cache. Absent
    /// chunk files come back as unpinned empties.
    fn fetch(
        &self,
        ep: &dyn Endpoint,
        name: &str,
        point_size: usize,
        id: &Id,
    ) -> Result<(Arc<ChunkReader>, bool)> {
        let size = match ep.try_get_size(name)? {
            Some(size) => size as usize,
            None => return Ok((Arc::new(ChunkReader::empty(point_size)), false)),
        };

        let mut state = self.shared.state.lock();
        loop {
            let s = &mut *state;
            if let Some(slot) = s.resident.get_mut(id) {
                if let Some(data) = slot.data.clone() {
                    slot.refs += 1;
                    if slot.refs == 1 {
                        s.idle.pop(id);
                    }
                    return Ok((data, true));
                }
                // Another block is loading this chunk.
                self.shared.room.wait(&mut state);
                continue;
            }

            while s.resident_bytes + size > self.shared.capacity {
                let victim = s.idle.pop_lru().and_then(|(victim, _)| {
                    s.resident.remove(&victim).map(|slot| (victim, slot.bytes))
                });
                match victim {
                    Some((evicted, bytes)) => {
                        s.resident_bytes -= bytes;
                        debug!("evicted chunk {} ({} bytes)", evicted, bytes);
                    }
                    None => break,
                }
            }
            if s.resident_bytes + size > self.shared.capacity && !s.resident.is_empty() {
                // Every resident chunk is pinned by some block; wait for
                // one to release.
                self.shared.room.wait(&mut state);
                continue;
            }

            s.resident.insert(
                id.clone(),
                Slot {
                    refs: 1,
                    bytes: size,
                    data: None,
                },
            );
            s.resident_bytes += size;
            break;
        }
        drop(state);

        let loaded = ep
            .get_binary(name)
            .and_then(|data| ChunkReader::new(name, data, point_size).map(Arc::new));

        let mut state = self.shared.state.lock();
        let s = &mut *state;
        match loaded {
            Ok(reader) => {
                let actual = reader.num_bytes();
                s.resident_bytes -= size;
                s.resident_bytes += actual;
                if let Some(slot) = s.resident.get_mut(id) {
                    slot.bytes = actual;
                    slot.data = Some(reader.clone());
                }
                self.shared.room.notify_all();
                Ok((reader, true))
            }
            Err(e) => {
                if s.resident.remove(id).is_some() {
                    s.resident_bytes -= size;
                }
                self.shared.room.notify_all();
                Err(e)
            }
        }
    }

    fn release(&self, id: &Id) {
        let mut state = self.shared.state.lock();
        let s = &mut *state;
        if let Some(slot) = s.resident.get_mut(id) {
            slot.refs -= 1;
            if slot.refs == 0 {
                s.idle.push(id.clone(), ());
            }
        }
        drop(state);
        self.shared.room.notify_all();
    }
}

/// A query's reservation over its fetch set. Advancing to the next chunk
/// releases the previous pin, and dropping the block releases the last
/// one, so cancellation never strands a refcount.
pub struct Block {
    cache: Cache,
    ep: Arc<dyn Endpoint>,
    point_size: usize,
    prefix_ids: bool,
    postfix: String,
    fetches: Vec<FetchInfo>,
    position: usize,
    pinned: Option<Id>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.fetches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetches.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.fetches.len() - self.position
    }

    /// Fetch the next chunk in id order. A failed load surfaces its
    /// error and the block moves past it, so later chunks still serve.
    pub fn next_chunk(&mut self) -> Option<Result<(FetchInfo, Arc<ChunkReader>)>> {
        self.unpin();
        if self.position >= self.fetches.len() {
            return None;
        }
        let info = self.fetches[self.position].clone();
        self.position += 1;

        let name = format!("{}{}", info.id.name(self.prefix_ids), self.postfix);
        match self
            .cache
            .fetch(self.ep.as_ref(), &name, self.point_size, &info.id)
        {
            Ok((reader, pinned)) => {
                if pinned {
                    self.pinned = Some(info.id.clone());
                }
                Some(Ok((info, reader)))
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn unpin(&mut self) {
        if let Some(id) = self.pinned.take() {
            self.cache.release(&id);
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::{Endpoint, MemEndpoint};

    const POINT: usize = 4;
    const CHUNK: usize = POINT * 2;

    fn endpoint_with_chunks(n: u64) -> Arc<MemEndpoint> {
        let ep = MemEndpoint::new();
        for id in 0..n {
            ep.put(&id.to_string(), &vec![id as u8; CHUNK]).unwrap();
        }
        Arc::new(ep)
    }

    fn fetches(n: u64) -> Vec<FetchInfo> {
        (0..n)
            .map(|id| FetchInfo {
                id: Id::from_u64(id),
                depth: 2,
            })
            .collect()
    }

    #[test]
    fn test_streams_more_chunks_than_capacity() {
        let ep = endpoint_with_chunks(10);
        let cache = Cache::new(CHUNK * 2);
        let mut block = cache.reserve(ep, POINT, false, String::new(), fetches(10));

        let mut seen = 0;
        while let Some(next) = block.next_chunk() {
            let (info, reader) = next.unwrap();
            assert_eq!(reader.num_points(), 2);
            assert_eq!(info.id, Id::from_u64(seen));
            seen += 1;
            // Resident bytes never pass capacity plus one chunk.
            assert!(cache.resident_bytes() <= CHUNK * 2 + CHUNK);
        }
        assert_eq!(seen, 10);

        drop(block);
        assert!(cache.resident_bytes() <= CHUNK * 2 + CHUNK);
    }

    #[test]
    fn test_resident_chunk_is_shared() {
        let ep = endpoint_with_chunks(1);
        let cache = Cache::new(CHUNK * 4);

        let mut a = cache.reserve(ep.clone(), POINT, false, String::new(), fetches(1));
        let (_, first) = a.next_chunk().unwrap().unwrap();

        let mut b = cache.reserve(ep, POINT, false, String::new(), fetches(1));
        let (_, second) = b.next_chunk().unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.resident_bytes(), CHUNK);
    }

    #[test]
    fn test_absent_chunk_reads_empty() {
        let ep = Arc::new(MemEndpoint::new());
        let cache = Cache::new(CHUNK);
        let mut block = cache.reserve(ep, POINT, false, String::new(), fetches(1));

        let (_, reader) = block.next_chunk().unwrap().unwrap();
        assert_eq!(reader.num_points(), 0);
        assert_eq!(cache.resident_bytes(), 0);
    }

    #[test]
    fn test_corrupt_chunk_skipped_others_served() {
        let ep = MemEndpoint::new();
        ep.put("0", &vec![0u8; CHUNK]).unwrap();
        ep.put("1", &vec![1u8; CHUNK - 1]).unwrap();
        ep.put("2", &vec![2u8; CHUNK]).unwrap();

        let cache = Cache::new(CHUNK * 4);
        let mut block = cache.reserve(Arc::new(ep), POINT, false, String::new(), fetches(3));

        assert!(block.next_chunk().unwrap().is_ok());
        let torn = block.next_chunk().unwrap();
        assert!(matches!(torn, Err(Error::CorruptChunk { .. })));
        let (info, reader) = block.next_chunk().unwrap().unwrap();
        assert_eq!(info.id, Id::from_u64(2));
        assert_eq!(reader.num_points(), 2);
        assert!(block.next_chunk().is_none());
    }

    #[test]
    fn test_postfixed_names() {
        let ep = MemEndpoint::new();
        ep.put("0-2", &vec![7u8; CHUNK]).unwrap();

        let cache = Cache::new(CHUNK);
        let mut block = cache.reserve(Arc::new(ep), POINT, false, "-2".to_string(), fetches(1));
        let (_, reader) = block.next_chunk().unwrap().unwrap();
        assert_eq!(reader.num_points(), 2);
    }
}
