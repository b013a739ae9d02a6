//! Stream environment provisioning before a test starts running.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Instant;

use crate::core::config::TestConfiguration;
use crate::core::errors::{Result, SmokeError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::stream::client::{ReaderType, StreamAdmin, StreamPolicies};

/// What `prepare` created (or found already present).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreparedEnvironment {
    pub streams: usize,
    pub reader_groups: usize,
}

/// Creates scopes, streams, and shared reader groups; optionally deletes
/// the streams afterwards.
pub struct StreamPreparer {
    admin: Arc<dyn StreamAdmin>,
    logger: ActivityLoggerHandle,
}

impl StreamPreparer {
    #[must_use]
    pub fn new(admin: Arc<dyn StreamAdmin>, logger: ActivityLoggerHandle) -> Self {
        Self { admin, logger }
    }

    pub fn prepare(&self, config: &TestConfiguration) -> Result<PreparedEnvironment> {
        let started = Instant::now();
        eprintln!(
            "[SMK-PREPARE] preparing environment for test {} ({})",
            config.name, config.id
        );
        let mut prepared = PreparedEnvironment::default();
        if config.create_stream {
            prepared.streams = self.create_streams(config)?;
        }
        prepared.reader_groups = self.create_reader_groups(config)?;

        self.logger.send(ActivityEvent::EnvironmentPrepared {
            streams: prepared.streams,
            reader_groups: prepared.reader_groups,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });
        Ok(prepared)
    }

    /// One stream per distinct `scope/stream`, with a segment per reader.
    fn create_streams(&self, config: &TestConfiguration) -> Result<usize> {
        let by_stream = config.tasks_by_stream();
        for tasks in by_stream.values() {
            let Some(first) = tasks.first() else {
                continue;
            };
            let readers: u32 = tasks.iter().map(|t| t.num_readers).sum();
            let policies = StreamPolicies::resolve(first.stream_policies.as_ref(), readers.max(1));

            self.admin
                .create_scope(&first.scope)
                .map_err(|e| SmokeError::stream("create scope", e))?;
            let created = self
                .admin
                .create_stream(&first.scope, &first.stream, &policies)
                .map_err(|e| SmokeError::stream("create stream", e))?;
            eprintln!(
                "[SMK-PREPARE] stream {} {} with {} segment(s)",
                first.stream_fqn(),
                if created { "created" } else { "already exists" },
                policies.min_segments
            );
        }
        Ok(by_stream.len())
    }

    /// Shared groups only; forgetful readers create their own.
    fn create_reader_groups(&self, config: &TestConfiguration) -> Result<usize> {
        let mut created = 0;
        for (group, tasks) in config.tasks_by_reader_group() {
            let readers: u32 = tasks.iter().map(|t| t.num_readers).sum();
            let Some(first) = tasks.first().filter(|_| readers > 0) else {
                continue;
            };
            self.admin
                .create_reader_group(&first.scope, &group, &first.stream, first.reader_type)
                .map_err(|e| SmokeError::stream("create reader group", e))?;
            let handle = self
                .admin
                .reader_group(&first.scope, &group)
                .map_err(|e| SmokeError::stream("open reader group", e))?;
            for reader in handle.online_readers() {
                eprintln!("[SMK-PREPARE] reader group {group} already contained reader {reader}");
            }
            // A reused tail group must not replay what an earlier run left behind.
            if first.reader_type == ReaderType::Tail {
                handle
                    .reset_to_tail()
                    .map_err(|e| SmokeError::stream("reset reader group", e))?;
            }
            created += 1;
        }
        Ok(created)
    }

    /// Delete every stream the test used, if configured to. Returns how many
    /// were removed.
    pub fn cleanup(&self, config: &TestConfiguration) -> Result<usize> {
        if !config.delete_stream {
            return Ok(0);
        }
        let mut removed = 0;
        for tasks in config.tasks_by_stream().values() {
            let Some(first) = tasks.first() else {
                continue;
            };
            if let Err(e) = self.admin.seal_stream(&first.scope, &first.stream) {
                eprintln!("[SMK-PREPARE] could not seal {}: {e}", first.stream_fqn());
            }
            if self
                .admin
                .delete_stream(&first.scope, &first.stream)
                .map_err(|e| SmokeError::stream("delete stream", e))?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TaskConfiguration;
    use crate::stream::client::{EventReader, EventWriter, StreamResult};
    use crate::stream::memory::MemoryStreams;
    use std::time::Duration;

    fn config() -> TestConfiguration {
        let task = |writers: u32, readers: u32| TaskConfiguration {
            scope: "perf".to_string(),
            stream: "events".to_string(),
            num_writers: writers,
            num_readers: readers,
            ..TaskConfiguration::default()
        };
        TestConfiguration {
            tasks: vec![task(2, 0), task(0, 3)],
            ..TestConfiguration::default()
        }
    }

    #[test]
    fn prepares_stream_and_shared_group() {
        let store = MemoryStreams::new();
        let preparer = StreamPreparer::new(Arc::new(store.clone()), ActivityLoggerHandle::disabled());
        let prepared = preparer.prepare(&config()).unwrap();
        assert_eq!(
            prepared,
            PreparedEnvironment {
                streams: 1,
                reader_groups: 1,
            }
        );
        assert!(store.stream_exists("perf", "events"));
        assert!(store.reader_group("perf", "PerfEvents").is_ok());
    }

    #[test]
    fn prepare_is_repeatable() {
        let store = MemoryStreams::new();
        let preparer = StreamPreparer::new(Arc::new(store.clone()), ActivityLoggerHandle::disabled());
        preparer.prepare(&config()).unwrap();
        preparer.prepare(&config()).unwrap();
        assert!(store.stream_exists("perf", "events"));
    }

    #[test]
    fn reused_tail_group_skips_old_events() {
        let store = MemoryStreams::new();
        let preparer = StreamPreparer::new(Arc::new(store.clone()), ActivityLoggerHandle::disabled());
        let cfg = config();
        preparer.prepare(&cfg).unwrap();

        let mut writer = store.create_writer("perf", "events").unwrap();
        writer
            .write_event("k", b"old".to_vec(), Box::new(|_: StreamResult<()>| {}))
            .unwrap();
        preparer.prepare(&cfg).unwrap();

        let mut reader = store.create_reader("r", "perf", "PerfEvents").unwrap();
        let read = reader.read_next_event(Duration::from_millis(10)).unwrap();
        assert!(read.event.is_none());
    }

    #[test]
    fn groups_without_readers_are_skipped() {
        let store = MemoryStreams::new();
        let preparer = StreamPreparer::new(Arc::new(store.clone()), ActivityLoggerHandle::disabled());
        let mut cfg = config();
        cfg.tasks.truncate(1);
        let prepared = preparer.prepare(&cfg).unwrap();
        assert_eq!(prepared.reader_groups, 0);
        assert!(store.reader_group("perf", "PerfEvents").is_err());
    }

    #[test]
    fn missing_stream_without_creation_fails() {
        let store = MemoryStreams::new();
        let preparer = StreamPreparer::new(Arc::new(store), ActivityLoggerHandle::disabled());
        let mut cfg = config();
        cfg.create_stream = false;
        let err = preparer.prepare(&cfg).unwrap_err();
        assert_eq!(err.code(), "SMK-2002");
    }

    #[test]
    fn cleanup_honors_delete_flag() {
        let store = MemoryStreams::new();
        let preparer = StreamPreparer::new(Arc::new(store.clone()), ActivityLoggerHandle::disabled());
        let mut cfg = config();
        preparer.prepare(&cfg).unwrap();

        cfg.delete_stream = false;
        assert_eq!(preparer.cleanup(&cfg).unwrap(), 0);
        assert!(store.stream_exists("perf", "events"));

        cfg.delete_stream = true;
        assert_eq!(preparer.cleanup(&cfg).unwrap(), 1);
        assert!(!store.stream_exists("perf", "events"));
    }

    #[test]
    fn catchup_group_is_not_reset() {
        let store = MemoryStreams::new();
        let admin: Arc<dyn StreamAdmin> = Arc::new(store.clone());
        let preparer = StreamPreparer::new(Arc::clone(&admin), ActivityLoggerHandle::disabled());
        let mut cfg = config();
        for task in &mut cfg.tasks {
            task.reader_type = ReaderType::Catchup;
        }
        store.create_scope("perf").unwrap();
        store
            .create_stream("perf", "events", &StreamPolicies::resolve(None, 1))
            .unwrap();
        let mut writer = store.create_writer("perf", "events").unwrap();
        writer
            .write_event("k", b"early".to_vec(), Box::new(|_: StreamResult<()>| {}))
            .unwrap();

        preparer.prepare(&cfg).unwrap();
        let mut reader = store.create_reader("r", "perf", "PerfEvents").unwrap();
        let read = reader.read_next_event(Duration::from_millis(10)).unwrap();
        assert_eq!(read.event.as_deref(), Some(&b"early"[..]));
    }
}
