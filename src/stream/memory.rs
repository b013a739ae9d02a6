//! In-process stream backend.
//!
//! Each stream is a single ordered log with a moving head (retention) and a
//! shared cursor per reader group, so every event is handed to exactly one
//! member of a group. Used by tests and by the local run mode.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::stream::client::{
    AckCallback, EventRead, EventReader, EventWriter, ReaderGroup, ReaderType, ResolvedPolicies,
    RetentionType, StreamAdmin, StreamError, StreamResult, Transaction,
};

#[derive(Debug)]
struct StreamLog {
    head: u64,
    events: VecDeque<Vec<u8>>,
    retained_bytes: u64,
    retention_bytes: Option<u64>,
    sealed: bool,
}

impl StreamLog {
    fn new(policies: &ResolvedPolicies) -> Self {
        let retention_bytes = match policies.retention {
            Some((RetentionType::LimitedSizeBytes, limit)) => Some(limit),
            _ => None,
        };
        Self {
            head: 0,
            events: VecDeque::new(),
            retained_bytes: 0,
            retention_bytes,
            sealed: false,
        }
    }

    fn tail(&self) -> u64 {
        self.head + self.events.len() as u64
    }

    fn append(&mut self, event: Vec<u8>) {
        self.retained_bytes += event.len() as u64;
        self.events.push_back(event);
        if let Some(limit) = self.retention_bytes {
            while self.retained_bytes > limit && self.events.len() > 1 {
                self.drop_head();
            }
        }
    }

    fn drop_head(&mut self) {
        if let Some(dropped) = self.events.pop_front() {
            self.retained_bytes -= dropped.len() as u64;
            self.head += 1;
        }
    }

    fn get(&self, position: u64) -> Option<&Vec<u8>> {
        let index = usize::try_from(position.checked_sub(self.head)?).ok()?;
        self.events.get(index)
    }
}

#[derive(Debug)]
struct GroupState {
    stream_key: String,
    cursor: u64,
    online: HashSet<String>,
}

#[derive(Debug, Default)]
struct StoreState {
    scopes: HashSet<String>,
    streams: HashMap<String, StreamLog>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<StoreState>,
    appended: Condvar,
    failing_commits: AtomicU32,
    failing_writes: AtomicU32,
    next_txn: AtomicU64,
}

fn key(scope: &str, name: &str) -> String {
    format!("{scope}/{name}")
}

/// Shared in-memory backend. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStreams {
    inner: Arc<Inner>,
}

impl MemoryStreams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` transaction commits fail.
    pub fn fail_next_commits(&self, count: u32) {
        self.inner.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` direct writes fail at submission.
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Drop every event before `position`, as retention would.
    pub fn truncate(&self, scope: &str, stream: &str, position: u64) -> StreamResult<()> {
        let mut state = self.inner.state.lock();
        let log = state
            .streams
            .get_mut(&key(scope, stream))
            .ok_or_else(|| no_stream(scope, stream))?;
        while log.head < position && !log.events.is_empty() {
            log.drop_head();
        }
        drop(state);
        self.inner.appended.notify_all();
        Ok(())
    }

    /// Number of events currently retained by a stream.
    #[must_use]
    pub fn retained_events(&self, scope: &str, stream: &str) -> usize {
        self.inner
            .state
            .lock()
            .streams
            .get(&key(scope, stream))
            .map_or(0, |log| log.events.len())
    }

    /// Whether the stream exists.
    #[must_use]
    pub fn stream_exists(&self, scope: &str, stream: &str) -> bool {
        self.inner
            .state
            .lock()
            .streams
            .contains_key(&key(scope, stream))
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn append_all(&self, stream_key: &str, events: Vec<Vec<u8>>) -> StreamResult<()> {
        let mut state = self.inner.state.lock();
        let log = state
            .streams
            .get_mut(stream_key)
            .ok_or_else(|| StreamError::Unavailable {
                details: format!("stream {stream_key} was deleted"),
            })?;
        if log.sealed {
            let (scope, stream) = stream_key.split_once('/').unwrap_or((stream_key, ""));
            return Err(StreamError::Sealed {
                scope: scope.to_string(),
                stream: stream.to_string(),
            });
        }
        for event in events {
            log.append(event);
        }
        drop(state);
        self.inner.appended.notify_all();
        Ok(())
    }
}

fn no_stream(scope: &str, stream: &str) -> StreamError {
    StreamError::NoSuchStream {
        scope: scope.to_string(),
        stream: stream.to_string(),
    }
}

fn no_group(scope: &str, group: &str) -> StreamError {
    StreamError::NoSuchReaderGroup {
        scope: scope.to_string(),
        group: group.to_string(),
    }
}

impl StreamAdmin for MemoryStreams {
    fn create_scope(&self, scope: &str) -> StreamResult<bool> {
        Ok(self.inner.state.lock().scopes.insert(scope.to_string()))
    }

    fn create_stream(
        &self,
        scope: &str,
        stream: &str,
        policies: &ResolvedPolicies,
    ) -> StreamResult<bool> {
        let mut state = self.inner.state.lock();
        if !state.scopes.contains(scope) {
            return Err(StreamError::NoSuchScope {
                scope: scope.to_string(),
            });
        }
        let stream_key = key(scope, stream);
        if state.streams.contains_key(&stream_key) {
            return Ok(false);
        }
        state.streams.insert(stream_key, StreamLog::new(policies));
        Ok(true)
    }

    fn seal_stream(&self, scope: &str, stream: &str) -> StreamResult<bool> {
        let mut state = self.inner.state.lock();
        let log = state
            .streams
            .get_mut(&key(scope, stream))
            .ok_or_else(|| no_stream(scope, stream))?;
        let changed = !log.sealed;
        log.sealed = true;
        Ok(changed)
    }

    fn delete_stream(&self, scope: &str, stream: &str) -> StreamResult<bool> {
        let stream_key = key(scope, stream);
        let mut state = self.inner.state.lock();
        state.groups.retain(|_, group| group.stream_key != stream_key);
        let removed = state.streams.remove(&stream_key).is_some();
        drop(state);
        self.inner.appended.notify_all();
        Ok(removed)
    }

    fn delete_scope(&self, scope: &str) -> StreamResult<bool> {
        let mut state = self.inner.state.lock();
        let prefix = format!("{scope}/");
        if state.streams.keys().any(|k| k.starts_with(&prefix)) {
            return Ok(false);
        }
        Ok(state.scopes.remove(scope))
    }

    fn create_reader_group(
        &self,
        scope: &str,
        group: &str,
        stream: &str,
        start: ReaderType,
    ) -> StreamResult<()> {
        let stream_key = key(scope, stream);
        let mut state = self.inner.state.lock();
        let log = state
            .streams
            .get(&stream_key)
            .ok_or_else(|| no_stream(scope, stream))?;
        let cursor = match start {
            ReaderType::Tail => log.tail(),
            ReaderType::Catchup => log.head,
        };
        state
            .groups
            .entry(key(scope, group))
            .and_modify(|existing| {
                existing.stream_key.clone_from(&stream_key);
            })
            .or_insert_with(|| GroupState {
                stream_key: stream_key.clone(),
                cursor,
                online: HashSet::new(),
            });
        Ok(())
    }

    fn reader_group(&self, scope: &str, group: &str) -> StreamResult<Box<dyn ReaderGroup>> {
        let group_key = key(scope, group);
        if !self.inner.state.lock().groups.contains_key(&group_key) {
            return Err(no_group(scope, group));
        }
        Ok(Box::new(MemoryReaderGroup {
            name: group.to_string(),
            group_key,
            store: self.clone(),
        }))
    }

    fn create_writer(&self, scope: &str, stream: &str) -> StreamResult<Box<dyn EventWriter>> {
        let stream_key = key(scope, stream);
        if !self.inner.state.lock().streams.contains_key(&stream_key) {
            return Err(no_stream(scope, stream));
        }
        Ok(Box::new(MemoryWriter {
            stream_key,
            store: self.clone(),
        }))
    }

    fn create_reader(
        &self,
        reader_id: &str,
        scope: &str,
        group: &str,
    ) -> StreamResult<Box<dyn EventReader>> {
        let group_key = key(scope, group);
        let mut state = self.inner.state.lock();
        let group_state = state
            .groups
            .get_mut(&group_key)
            .ok_or_else(|| no_group(scope, group))?;
        group_state.online.insert(reader_id.to_string());
        Ok(Box::new(MemoryReader {
            reader_id: reader_id.to_string(),
            group_key,
            store: self.clone(),
        }))
    }
}

struct MemoryWriter {
    stream_key: String,
    store: MemoryStreams,
}

impl EventWriter for MemoryWriter {
    fn write_event(
        &mut self,
        _routing_key: &str,
        event: Vec<u8>,
        on_ack: AckCallback,
    ) -> StreamResult<()> {
        if MemoryStreams::take_failure(&self.store.inner.failing_writes) {
            return Err(StreamError::Unavailable {
                details: "injected write failure".to_string(),
            });
        }
        let outcome = self.store.append_all(&self.stream_key, vec![event]);
        on_ack(outcome);
        Ok(())
    }

    fn begin_txn(&mut self) -> StreamResult<Box<dyn Transaction>> {
        let n = self.store.inner.next_txn.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            id: format!("txn-{n}"),
            stream_key: self.stream_key.clone(),
            store: self.store.clone(),
            events: Vec::new(),
        }))
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }
}

struct MemoryTransaction {
    id: String,
    stream_key: String,
    store: MemoryStreams,
    events: Vec<Vec<u8>>,
}

impl Transaction for MemoryTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    fn write_event(&mut self, _routing_key: &str, event: Vec<u8>) -> StreamResult<()> {
        self.events.push(event);
        Ok(())
    }

    fn commit(self: Box<Self>) -> StreamResult<()> {
        if MemoryStreams::take_failure(&self.store.inner.failing_commits) {
            return Err(StreamError::Unavailable {
                details: format!("injected commit failure for {}", self.id),
            });
        }
        let this = *self;
        this.store.append_all(&this.stream_key, this.events)
    }

    fn abort(self: Box<Self>) -> StreamResult<()> {
        Ok(())
    }
}

struct MemoryReader {
    reader_id: String,
    group_key: String,
    store: MemoryStreams,
}

impl EventReader for MemoryReader {
    fn read_next_event(&mut self, timeout: Duration) -> StreamResult<EventRead> {
        let deadline = Instant::now() + timeout;
        let inner = &self.store.inner;
        let mut state = inner.state.lock();
        loop {
            let StoreState {
                streams, groups, ..
            } = &mut *state;
            let group = groups
                .get_mut(&self.group_key)
                .ok_or_else(|| StreamError::Unavailable {
                    details: format!("reader group {} was removed", self.group_key),
                })?;
            let log = streams
                .get(&group.stream_key)
                .ok_or_else(|| StreamError::Unavailable {
                    details: format!("stream {} was deleted", group.stream_key),
                })?;
            if group.cursor < log.head {
                group.cursor = log.head;
                return Err(StreamError::TruncatedData { offset: log.head });
            }
            if let Some(event) = log.get(group.cursor) {
                let position = group.cursor;
                group.cursor += 1;
                return Ok(EventRead {
                    event: Some(event.clone()),
                    position,
                });
            }
            let position = group.cursor;
            if Instant::now() >= deadline {
                return Ok(EventRead {
                    event: None,
                    position,
                });
            }
            if inner.appended.wait_until(&mut state, deadline).timed_out() {
                return Ok(EventRead {
                    event: None,
                    position,
                });
            }
        }
    }

    fn close(&mut self) {
        if let Some(group) = self.store.inner.state.lock().groups.get_mut(&self.group_key) {
            group.online.remove(&self.reader_id);
        }
    }
}

struct MemoryReaderGroup {
    name: String,
    group_key: String,
    store: MemoryStreams,
}

impl ReaderGroup for MemoryReaderGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn online_readers(&self) -> Vec<String> {
        let state = self.store.inner.state.lock();
        let mut readers: Vec<String> = state
            .groups
            .get(&self.group_key)
            .map(|g| g.online.iter().cloned().collect())
            .unwrap_or_default();
        readers.sort();
        readers
    }

    fn reset_to_tail(&self) -> StreamResult<()> {
        let mut state = self.store.inner.state.lock();
        let StoreState {
            streams, groups, ..
        } = &mut *state;
        let group = groups
            .get_mut(&self.group_key)
            .ok_or_else(|| StreamError::Unavailable {
                details: format!("reader group {} was removed", self.group_key),
            })?;
        if let Some(log) = streams.get(&group.stream_key) {
            group.cursor = log.tail();
        }
        Ok(())
    }

    fn reader_offline(&self, reader_id: &str) -> StreamResult<()> {
        if let Some(group) = self.store.inner.state.lock().groups.get_mut(&self.group_key) {
            group.online.remove(reader_id);
        }
        Ok(())
    }
}
