use crate::archive::{DiskFileSource, EntryMetadata, FileSource, MemoryFileSource, OpenedFile};
use crate::config::StreamEngineConfig;
use crate::engine::{StreamEngine, StreamReadBatchParams};
use crate::listener::StreamEngineListener;
use crate::read_stream::{ReadFlags, ReadStream, SharedBuffer, StreamCallback, StreamReadParams};
use crossbeam_channel::Sender;
use sluice_base::hashing::HashMap;
use sluice_base::{MediaType, StreamError, StreamPriority, StreamTaskType};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingCallback {
    async_calls: Mutex<Vec<(u64, Option<StreamError>)>>,
    sync_calls: Mutex<Vec<(u64, Option<StreamError>)>>,
    data: Mutex<HashMap<u64, Vec<u8>>>,
}

impl RecordingCallback {
    fn async_order(&self) -> Vec<u64> {
        self.async_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(user_data, _)| *user_data)
            .collect()
    }

    fn async_count(
        &self,
        user_data: u64,
    ) -> usize {
        self.async_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == user_data)
            .count()
    }

    fn sync_count(
        &self,
        user_data: u64,
    ) -> usize {
        self.sync_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == user_data)
            .count()
    }

    fn sync_error(
        &self,
        user_data: u64,
    ) -> Option<StreamError> {
        self.sync_calls
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| *id == user_data)
            .and_then(|(_, error)| *error)
    }

    fn data(
        &self,
        user_data: u64,
    ) -> Option<Vec<u8>> {
        self.data.lock().unwrap().get(&user_data).cloned()
    }
}

impl StreamCallback for RecordingCallback {
    fn stream_async_on_complete(
        &self,
        stream: &ReadStream,
        error: Option<StreamError>,
    ) {
        if let Some(data) = stream.buffer() {
            self.data.lock().unwrap().insert(stream.user_data(), data);
        }
        self.async_calls
            .lock()
            .unwrap()
            .push((stream.user_data(), error));
    }

    fn stream_on_complete(
        &self,
        stream: &ReadStream,
        error: Option<StreamError>,
    ) {
        self.sync_calls
            .lock()
            .unwrap()
            .push((stream.user_data(), error));
    }
}

fn params(
    user_data: u64,
    priority: StreamPriority,
) -> Option<StreamReadParams> {
    Some(StreamReadParams {
        user_data,
        priority,
        ..Default::default()
    })
}

fn memory_engine(config: StreamEngineConfig) -> (StreamEngine, Arc<MemoryFileSource>) {
    let source = Arc::new(MemoryFileSource::default());
    let engine = StreamEngine::new(config, source.clone()).unwrap();
    (engine, source)
}

fn pattern(
    len: usize,
    seed: u32,
) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn temp_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("sluice-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// Sends a message and sleeps before every read of one path so tests can act mid-read
struct SignallingFileSource {
    inner: Arc<MemoryFileSource>,
    slow_path: String,
    read_tx: Sender<()>,
    read_delay: Duration,
}

struct SignallingFile {
    inner: Box<dyn OpenedFile>,
    signal: Option<(Sender<()>, Duration)>,
}

impl OpenedFile for SignallingFile {
    fn metadata(&self) -> EntryMetadata {
        self.inner.metadata()
    }

    fn media_type(&self) -> MediaType {
        self.inner.media_type()
    }

    fn read_at(
        &mut self,
        offset: u64,
        buffer: &mut [u8],
    ) -> std::io::Result<usize> {
        if let Some((read_tx, read_delay)) = &self.signal {
            let _ = read_tx.send(());
            std::thread::sleep(*read_delay);
        }
        self.inner.read_at(offset, buffer)
    }
}

impl FileSource for SignallingFileSource {
    fn open_file(
        &self,
        path: &str,
    ) -> std::io::Result<Box<dyn OpenedFile>> {
        let signal = if path == self.slow_path {
            Some((self.read_tx.clone(), self.read_delay))
        } else {
            None
        };

        Ok(Box::new(SignallingFile {
            inner: self.inner.open_file(path)?,
            signal,
        }))
    }

    fn exists(
        &self,
        path: &str,
    ) -> bool {
        self.inner.exists(path)
    }

    fn media_type(
        &self,
        path: &str,
    ) -> MediaType {
        self.inner.media_type(path)
    }
}

#[test]
fn uncompressed_file_from_disk() {
    let dir = temp_dir("uncompressed");
    let data = pattern(1024 * 1024, 1);
    std::fs::write(dir.join("level.bin"), &data).unwrap();

    let source = Arc::new(DiskFileSource::new(dir.clone()));
    let engine = StreamEngine::new(StreamEngineConfig::default(), source).unwrap();
    let callback = Arc::new(RecordingCallback::default());
    let stream = engine
        .start_read(
            StreamTaskType::Geometry,
            "level.bin",
            Some(callback.clone()),
            params(1, StreamPriority::Normal),
        )
        .unwrap();

    assert!(stream.wait(Some(TIMEOUT)));
    assert!(stream.is_finished());
    assert!(!stream.is_error());
    assert_eq!(stream.error_name(), "Ok");
    assert_eq!(stream.bytes_read(false), 1024 * 1024);
    assert_eq!(callback.sync_count(1), 1);
    assert_eq!(callback.sync_error(1), None);
    assert_eq!(callback.data(1).unwrap(), data);

    // Released after the main thread phase
    assert!(stream.buffer().is_none());
    assert_eq!(engine.temp_memory().allocated(), 0);

    drop(engine);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn urgent_request_preempts_normal_read_once() {
    let inner = Arc::new(MemoryFileSource::new(MediaType::Hdd));
    let slow_data = pattern(64 * 1024, 2);
    inner.insert_raw("slow", slow_data.clone());
    inner.insert_raw("urgent", pattern(1024, 3));

    let (read_tx, read_rx) = crossbeam_channel::unbounded();
    let source = Arc::new(SignallingFileSource {
        inner,
        slow_path: "slow".to_string(),
        read_tx,
        read_delay: Duration::from_millis(5),
    });
    let config = StreamEngineConfig {
        page_size: 4096,
        decompress_block_size: 1024,
        ..Default::default()
    };
    let engine = StreamEngine::new(config, source).unwrap();
    let callback = Arc::new(RecordingCallback::default());

    let slow = engine
        .start_read(
            StreamTaskType::Texture,
            "slow",
            Some(callback.clone()),
            params(1, StreamPriority::Normal),
        )
        .unwrap();
    read_rx.recv_timeout(TIMEOUT).unwrap();

    let urgent = engine
        .start_read(
            StreamTaskType::Texture,
            "urgent",
            Some(callback.clone()),
            params(2, StreamPriority::Urgent),
        )
        .unwrap();

    assert!(slow.wait(Some(TIMEOUT)));
    assert!(urgent.wait(Some(TIMEOUT)));
    engine.update();

    assert_eq!(callback.async_order(), vec![2, 1]);
    assert_eq!(callback.sync_error(1), None);
    assert_eq!(callback.data(1).unwrap(), slow_data);
    assert_eq!(engine.statistics().preemptions, 1);
}

#[test]
fn compressed_crc_mismatch_discards_data() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    let data = pattern(100 * 1024, 4);
    let compressed = deflate(&data);
    source.insert_entry(
        "corrupt",
        compressed.clone(),
        EntryMetadata {
            compressed_size: compressed.len() as u64,
            uncompressed_size: data.len() as u64,
            is_compressed: true,
            crc32: Some(crc32fast::hash(&data).wrapping_add(1)),
            disk_offset: 0,
        },
    );

    let callback = Arc::new(RecordingCallback::default());
    let stream = engine
        .start_read(
            StreamTaskType::Shader,
            "corrupt",
            Some(callback.clone()),
            params(1, StreamPriority::Normal),
        )
        .unwrap();

    assert!(stream.wait(Some(TIMEOUT)));
    assert!(stream.is_finished());
    assert_eq!(stream.error(), Some(StreamError::VerificationFailed));
    assert_eq!(callback.sync_error(1), Some(StreamError::VerificationFailed));
    assert!(callback.data(1).is_none());
    assert_eq!(engine.statistics().verification_failures, 1);
    assert_eq!(engine.temp_memory().allocated(), 0);
}

#[test]
fn abort_between_phases_reports_user_abort() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    source.insert_raw("sound", pattern(8 * 1024, 5));

    let callback = Arc::new(RecordingCallback::default());
    let stream = engine
        .start_read(
            StreamTaskType::Sound,
            "sound",
            Some(callback.clone()),
            params(1, StreamPriority::Normal),
        )
        .unwrap();

    // Not updating, so the main thread phase can't run yet
    assert!(wait_until(|| callback.async_count(1) == 1));
    assert!(!stream.is_finished());

    stream.abort();
    assert!(stream.is_finished());
    assert_eq!(callback.sync_count(1), 1);
    assert_eq!(callback.sync_error(1), Some(StreamError::UserAbort));

    engine.update();
    engine.update_and_wait(false);
    assert_eq!(callback.async_count(1), 1);
    assert_eq!(callback.sync_count(1), 1);
}

#[test]
fn over_budget_read_waits_for_free() {
    let config = StreamEngineConfig {
        temp_memory_budget: 1024 * 1024,
        temp_pool_size: 0,
        ..Default::default()
    };
    let (engine, source) = memory_engine(config);
    let data = pattern(512 * 1024, 6);
    source.insert_raw("texture", data.clone());

    let held = engine
        .temp_memory()
        .temp_alloc(600 * 1024, false, true, 1)
        .unwrap();

    let callback = Arc::new(RecordingCallback::default());
    let stream = engine
        .start_read(
            StreamTaskType::Texture,
            "texture",
            Some(callback.clone()),
            params(1, StreamPriority::Normal),
        )
        .unwrap();

    assert!(wait_until(|| engine.statistics().out_of_budget_events == 1));
    assert!(!stream.wait(Some(Duration::from_millis(100))));
    assert!(!stream.is_finished());

    drop(held);
    assert!(stream.wait(Some(TIMEOUT)));
    assert_eq!(stream.error(), None);
    assert_eq!(callback.data(1).unwrap(), data);
    assert_eq!(engine.statistics().out_of_budget_events, 1);
}

#[test]
fn urgent_read_ignores_budget() {
    let config = StreamEngineConfig {
        temp_memory_budget: 1024,
        temp_pool_size: 0,
        ..Default::default()
    };
    let (engine, source) = memory_engine(config);
    source.insert_raw("big", pattern(64 * 1024, 7));
    let _held = engine.temp_memory().temp_alloc(1024, false, true, 1).unwrap();

    let stream = engine
        .start_read(StreamTaskType::Texture, "big", None, None)
        .unwrap();
    assert!(stream.wait(Some(TIMEOUT)));
    assert_eq!(stream.error(), None);
    assert_eq!(stream.bytes_read(false), 64 * 1024);
}

#[test]
fn paused_io_services_by_priority() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    for index in 0..5 {
        source.insert_raw(&format!("file_{}", index), pattern(4096, 10 + index));
    }

    let callback = Arc::new(RecordingCallback::default());
    engine.pause_io(true);
    let priorities = [
        StreamPriority::Idle,
        StreamPriority::Normal,
        StreamPriority::Urgent,
        StreamPriority::BelowNormal,
        StreamPriority::AboveNormal,
    ];
    for (index, priority) in priorities.iter().enumerate() {
        engine.start_read(
            StreamTaskType::Animation,
            &format!("file_{}", index),
            Some(callback.clone()),
            params(index as u64, *priority),
        );
    }

    std::thread::sleep(Duration::from_millis(50));
    assert!(callback.async_order().is_empty());

    engine.pause_io(false);
    engine.update_and_wait(false);
    assert_eq!(callback.async_order(), vec![2, 4, 1, 3, 0]);
}

#[test]
fn callbacks_fire_once_under_abort_races() {
    let (engine, source) = memory_engine(StreamEngineConfig {
        page_size: 4096,
        decompress_block_size: 1024,
        ..Default::default()
    });
    source.insert_raw("race", pattern(64 * 1024, 20));

    let callback = Arc::new(RecordingCallback::default());
    let mut streams = Vec::default();
    for index in 0..60u64 {
        let buffer: Option<SharedBuffer> = if index % 2 == 0 {
            Some(Arc::new(Mutex::new(vec![0u8; 64 * 1024])))
        } else {
            None
        };
        let stream = engine
            .start_read(
                StreamTaskType::Geometry,
                "race",
                Some(callback.clone()),
                Some(StreamReadParams {
                    user_data: index,
                    buffer,
                    ..Default::default()
                }),
            )
            .unwrap();

        match index % 3 {
            0 => stream.abort(),
            1 => {
                std::thread::sleep(Duration::from_micros(200 * (index % 7)));
                while !stream.try_abort() {
                    std::thread::yield_now();
                }
            }
            _ => {}
        }
        streams.push(stream);
    }

    engine.update_and_wait(false);
    for stream in &streams {
        assert!(stream.is_finished());
        assert_eq!(callback.async_count(stream.user_data()), 1);
        assert_eq!(callback.sync_count(stream.user_data()), 1);
        if stream.user_data() % 3 == 0 {
            assert_eq!(stream.error(), Some(StreamError::UserAbort));
        }
    }
    assert_eq!(engine.temp_memory().allocated(), 0);
}

#[test]
fn misscheduled_request_moves_to_resident_medium() {
    let source = Arc::new(
        MemoryFileSource::new(MediaType::Memory).with_reported_media_type(MediaType::Hdd),
    );
    source.insert_raw("moved", pattern(2048, 30));
    let engine = StreamEngine::new(StreamEngineConfig::default(), source).unwrap();

    let stream = engine
        .start_read(
            StreamTaskType::Pak,
            "moved",
            None,
            params(1, StreamPriority::Normal),
        )
        .unwrap();
    assert!(stream.wait(Some(TIMEOUT)));
    assert_eq!(stream.error(), None);
    assert_eq!(engine.statistics().reschedules, 1);
}

#[test]
fn batch_read_is_capped_and_grouped() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    source.insert_raw("small", pattern(256, 40));

    let requests = (0..40)
        .map(|index| StreamReadBatchParams {
            task_type: StreamTaskType::MergedMesh,
            path: "small".to_string(),
            callback: None,
            params: params(index, StreamPriority::Normal),
        })
        .collect();

    let mut pre_request_calls = 0;
    let mut pre_request = || pre_request_calls += 1;
    let streams = engine.start_batch_read(requests, Some(&mut pre_request));
    assert_eq!(pre_request_calls, 1);
    assert_eq!(streams.len(), 32);

    engine.update_and_wait(false);
    assert!(streams.iter().all(|stream| stream.is_finished() && !stream.is_error()));
    assert_eq!(engine.statistics().requests_completed, 32);
}

#[test]
fn read_group_defers_scheduling() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    source.insert_raw("grouped", pattern(256, 41));

    let callback = Arc::new(RecordingCallback::default());
    engine.begin_read_group();
    let stream = engine
        .start_read(
            StreamTaskType::Terrain,
            "grouped",
            Some(callback.clone()),
            params(1, StreamPriority::Normal),
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(callback.async_count(1), 0);

    engine.end_read_group();
    assert!(stream.wait(Some(TIMEOUT)));
    assert_eq!(callback.sync_count(1), 1);
}

#[test]
fn paused_task_types_are_parked() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    source.insert_raw("music", pattern(1024, 50));

    engine.pause_streaming(true, StreamTaskType::Music.mask());
    assert_eq!(engine.pause_mask(), StreamTaskType::Music.mask());

    let callback = Arc::new(RecordingCallback::default());
    let stream = engine
        .start_read(
            StreamTaskType::Music,
            "music",
            Some(callback.clone()),
            params(1, StreamPriority::Normal),
        )
        .unwrap();
    assert!(!stream.wait(Some(Duration::from_millis(50))));

    engine.pause_streaming(false, StreamTaskType::Music.mask());
    assert_eq!(engine.pause_mask(), 0);
    assert!(stream.wait(Some(TIMEOUT)));
    assert_eq!(callback.sync_error(1), None);
}

#[test]
fn shutdown_aborts_queued_and_parked_streams() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    source.insert_raw("queued", pattern(1024, 60));

    let callback = Arc::new(RecordingCallback::default());
    engine.pause_io(true);
    let queued = engine
        .start_read(
            StreamTaskType::Video,
            "queued",
            Some(callback.clone()),
            params(1, StreamPriority::Normal),
        )
        .unwrap();

    engine.pause_streaming(true, StreamTaskType::Flash.mask());
    let parked = engine
        .start_read(
            StreamTaskType::Flash,
            "queued",
            Some(callback.clone()),
            params(2, StreamPriority::Normal),
        )
        .unwrap();

    engine.shutdown();
    assert!(engine.is_shut_down());
    assert!(queued.is_finished());
    assert!(parked.is_finished());
    assert_eq!(callback.sync_error(1), Some(StreamError::AbortedOnShutdown));
    assert_eq!(callback.sync_error(2), Some(StreamError::AbortedOnShutdown));
    assert_eq!(callback.async_count(1), 1);
    assert_eq!(callback.async_count(2), 1);

    assert!(engine
        .start_read(StreamTaskType::Video, "queued", None, None)
        .is_none());
}

#[test]
fn blocked_compressed_read_into_external_buffer() {
    let (engine, source) = memory_engine(StreamEngineConfig {
        page_size: 16 * 1024,
        decompress_block_size: 4096,
        ..Default::default()
    });
    let data = pattern(200 * 1024, 70);
    source.insert_compressed("packed", &data).unwrap();

    let buffer: SharedBuffer = Arc::new(Mutex::new(vec![0u8; data.len()]));
    let stream = engine
        .start_read(
            StreamTaskType::GeomCache,
            "packed",
            None,
            Some(StreamReadParams {
                buffer: Some(buffer.clone()),
                ..Default::default()
            }),
        )
        .unwrap();

    assert!(stream.wait(Some(TIMEOUT)));
    assert_eq!(stream.error(), None);
    assert_eq!(stream.bytes_read(false), data.len() as u64);
    assert_eq!(*buffer.lock().unwrap(), data);
    assert!(engine.statistics().bytes_decompressed >= data.len() as u64);
    assert_eq!(engine.temp_memory().allocated(), 0);
}

#[test]
fn partial_compressed_read() {
    let (engine, source) = memory_engine(StreamEngineConfig {
        page_size: 16 * 1024,
        decompress_block_size: 4096,
        ..Default::default()
    });
    let data = pattern(100 * 1024, 71);
    source.insert_compressed("packed", &data).unwrap();

    let callback = Arc::new(RecordingCallback::default());
    let stream = engine
        .start_read(
            StreamTaskType::Geometry,
            "packed",
            Some(callback.clone()),
            Some(StreamReadParams {
                user_data: 7,
                offset: 1000,
                size: 5000,
                ..Default::default()
            }),
        )
        .unwrap();

    assert!(stream.wait(Some(TIMEOUT)));
    assert_eq!(stream.bytes_read(false), 5000);
    assert_eq!(callback.data(7).unwrap(), &data[1000..6000]);
}

#[test]
fn out_of_range_and_missing_files_fail() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    source.insert_raw("small", pattern(100, 80));

    let missing = engine
        .start_read(StreamTaskType::Texture, "missing", None, None)
        .unwrap();
    let bad_offset = engine
        .start_read(
            StreamTaskType::Texture,
            "small",
            None,
            Some(StreamReadParams {
                offset: 200,
                ..Default::default()
            }),
        )
        .unwrap();
    let bad_size = engine
        .start_read(
            StreamTaskType::Texture,
            "small",
            None,
            Some(StreamReadParams {
                offset: 50,
                size: 60,
                ..Default::default()
            }),
        )
        .unwrap();

    engine.update_and_wait(false);
    assert_eq!(missing.error(), Some(StreamError::CannotOpenFile));
    assert_eq!(missing.error_name(), "CannotOpenFile");
    assert_eq!(bad_offset.error(), Some(StreamError::OffsetOutOfRange));
    assert_eq!(bad_size.error(), Some(StreamError::SizeOutOfRange));
    assert_eq!(engine.statistics().requests_failed, 3);
}

#[test]
fn no_sync_callback_finishes_on_async_phase() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    source.insert_raw("async_only", pattern(1024, 90));

    let callback = Arc::new(RecordingCallback::default());
    let stream = engine
        .start_read(
            StreamTaskType::Sound,
            "async_only",
            Some(callback.clone()),
            Some(StreamReadParams {
                user_data: 1,
                flags: ReadFlags {
                    no_sync_callback: true,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
        .unwrap();

    assert!(wait_until(|| stream.is_finished()));
    assert_eq!(callback.async_count(1), 1);
    engine.update_and_wait(false);
    assert_eq!(callback.sync_count(1), 0);
}

#[test]
fn headless_engine_refuses_reads() {
    let (engine, source) = memory_engine(StreamEngineConfig {
        headless: true,
        ..Default::default()
    });
    source.insert_raw("anything", vec![0u8; 16]);
    assert!(engine
        .start_read(StreamTaskType::Texture, "anything", None, None)
        .is_none());
}

#[test]
#[should_panic]
fn empty_path_panics() {
    let (engine, _source) = memory_engine(StreamEngineConfig::default());
    engine.start_read(StreamTaskType::Texture, "", None, None);
}

#[derive(Default)]
struct CountingListener {
    enqueued: AtomicUsize,
    begun: AtomicUsize,
    ended: AtomicUsize,
}

impl StreamEngineListener for CountingListener {
    fn on_stream_enqueue(
        &self,
        _stream: &ReadStream,
    ) {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stream_begin_async_callback(
        &self,
        _stream: &ReadStream,
    ) {
        self.begun.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stream_end_async_callback(
        &self,
        _stream: &ReadStream,
    ) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn listener_sees_every_stream() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    source.insert_raw("observed", pattern(512, 100));
    let listener = Arc::new(CountingListener::default());
    engine.set_listener(Some(listener.clone()));

    for _ in 0..3 {
        engine.start_read(StreamTaskType::Animation, "observed", None, None);
    }
    engine.update_and_wait(false);

    assert_eq!(listener.enqueued.load(Ordering::SeqCst), 3);
    assert_eq!(listener.begun.load(Ordering::SeqCst), 3);
    assert_eq!(listener.ended.load(Ordering::SeqCst), 3);

    let statistics = engine.statistics();
    assert_eq!(statistics.requests_started, 3);
    assert_eq!(statistics.in_flight, 0);
    let json = serde_json::to_string(&statistics).unwrap();
    assert!(json.contains("\"requests_completed\":3"));
}

#[test]
fn update_types_defers_other_types_in_order() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    source.insert_raw("mixed", pattern(256, 110));

    let callback = Arc::new(RecordingCallback::default());
    let sound = engine
        .start_read(
            StreamTaskType::Sound,
            "mixed",
            Some(callback.clone()),
            params(1, StreamPriority::Normal),
        )
        .unwrap();
    let texture = engine
        .start_read(
            StreamTaskType::Texture,
            "mixed",
            Some(callback.clone()),
            params(2, StreamPriority::Normal),
        )
        .unwrap();
    assert!(wait_until(|| callback.async_order().len() == 2));

    engine.update_types(StreamTaskType::Texture.mask());
    assert!(texture.is_finished());
    assert!(!sound.is_finished());

    engine.update();
    assert!(sound.is_finished());
}

#[test]
fn update_and_wait_starts_an_open_read_group() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    source.insert_raw("grouped", pattern(2048, 82));

    let callback = Arc::new(RecordingCallback::default());
    engine.begin_read_group();
    engine
        .start_read(
            StreamTaskType::Terrain,
            "grouped",
            Some(callback.clone()),
            params(1, StreamPriority::Normal),
        )
        .unwrap();

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            engine.update_and_wait(false);
            done_tx.send(()).unwrap();
        });

        let returned = done_rx.recv_timeout(TIMEOUT).is_ok();
        if !returned {
            // Lets the waiting thread finish so the failure is reported instead of hanging
            engine.end_read_group();
        }
        assert!(returned, "update_and_wait never started the grouped read");
    });

    assert_eq!(callback.sync_count(1), 1);
    assert_eq!(callback.sync_error(1), None);
    engine.end_read_group();
}

#[test]
fn bandwidth_cap_throttles_reads() {
    let data = pattern(64 * 1024, 80);
    let read_time = |max_bytes_per_second: Option<u64>| {
        let (engine, source) = memory_engine(StreamEngineConfig {
            page_size: 16 * 1024,
            decompress_block_size: 4096,
            max_bytes_per_second,
            ..Default::default()
        });
        source.insert_raw("capped", data.clone());

        let start = Instant::now();
        let stream = engine
            .start_read(
                StreamTaskType::Video,
                "capped",
                None,
                params(1, StreamPriority::Normal),
            )
            .unwrap();
        assert!(stream.wait(Some(TIMEOUT)));
        assert_eq!(stream.error(), None);
        assert_eq!(stream.bytes_read(false), data.len() as u64);
        start.elapsed()
    };

    // 64 KB at 128 KB/s takes half a second
    let capped = read_time(Some(128 * 1024));
    assert!(capped >= Duration::from_millis(450), "{:?}", capped);

    let uncapped = read_time(None);
    assert!(uncapped < Duration::from_millis(450), "{:?}", uncapped);
}

#[test]
fn corrupt_blocked_stream_fails_decompression() {
    let (engine, source) = memory_engine(StreamEngineConfig {
        page_size: 16 * 1024,
        decompress_block_size: 4096,
        ..Default::default()
    });

    // A valid prefix, then a block header with the reserved block type
    let data = pattern(64 * 1024, 81);
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&data).unwrap();
    encoder.flush().unwrap();
    let mut stored = encoder.get_ref().clone();
    stored.extend(std::iter::repeat(0xff).take(8 * 1024));
    assert!(stored.len() > 2 * 16 * 1024);

    source.insert_entry(
        "broken",
        stored.clone(),
        EntryMetadata {
            compressed_size: stored.len() as u64,
            uncompressed_size: 2 * data.len() as u64,
            is_compressed: true,
            crc32: None,
            disk_offset: 0,
        },
    );

    let callback = Arc::new(RecordingCallback::default());
    let stream = engine
        .start_read(
            StreamTaskType::MergedMesh,
            "broken",
            Some(callback.clone()),
            params(1, StreamPriority::Normal),
        )
        .unwrap();

    assert!(stream.wait(Some(TIMEOUT)));
    assert!(stream.is_finished());
    assert_eq!(stream.error(), Some(StreamError::DecompressionFailed));
    assert_eq!(stream.bytes_read(false), 0);
    assert!(stream.buffer().is_none());
    assert!(callback.data(1).is_none());
    assert_eq!(callback.sync_error(1), Some(StreamError::DecompressionFailed));

    // The valid prefix went through the block chain before the failure
    assert!(engine.statistics().bytes_decompressed > 0);
    assert_eq!(engine.temp_memory().allocated(), 0);
}

#[test]
fn raised_priority_resorts_queued_requests() {
    let inner = Arc::new(MemoryFileSource::default());
    inner.insert_raw("slow", pattern(16 * 1024, 84));

    let (read_tx, read_rx) = crossbeam_channel::unbounded();
    let source = Arc::new(SignallingFileSource {
        inner,
        slow_path: "slow".to_string(),
        read_tx,
        read_delay: Duration::from_millis(50),
    });
    let config = StreamEngineConfig {
        page_size: 4096,
        decompress_block_size: 1024,
        ..Default::default()
    };
    let engine = StreamEngine::new(config, source).unwrap();
    let callback = Arc::new(RecordingCallback::default());

    let start = |user_data: u64, priority: StreamPriority| {
        engine
            .start_read(
                StreamTaskType::Texture,
                "slow",
                Some(callback.clone()),
                params(user_data, priority),
            )
            .unwrap()
    };

    start(0, StreamPriority::Normal);
    read_rx.recv_timeout(TIMEOUT).unwrap();
    let idle = start(1, StreamPriority::Idle);
    start(2, StreamPriority::BelowNormal);
    start(3, StreamPriority::Normal);

    // Three more pages of the first read, then the first page of the next one picked
    for _ in 0..4 {
        read_rx.recv_timeout(TIMEOUT).unwrap();
    }
    idle.set_priority(StreamPriority::AboveNormal);
    assert_eq!(idle.priority(), StreamPriority::AboveNormal);

    engine.update_and_wait(false);
    assert_eq!(callback.async_order(), vec![0, 3, 1, 2]);
}

#[test]
fn free_temporary_memory_before_main_thread_phase() {
    let (engine, source) = memory_engine(StreamEngineConfig::default());
    let data = pattern(32 * 1024, 83);
    source.insert_raw("flash", data.clone());

    let callback = Arc::new(RecordingCallback::default());
    let stream = engine
        .start_read(
            StreamTaskType::Flash,
            "flash",
            Some(callback.clone()),
            params(1, StreamPriority::Normal),
        )
        .unwrap();

    assert!(wait_until(|| callback.async_count(1) == 1));
    assert_eq!(stream.buffer(), Some(data.clone()));
    assert!(engine.temp_memory().allocated() >= data.len());

    stream.free_temporary_memory();
    assert!(stream.buffer().is_none());
    assert_eq!(engine.temp_memory().allocated(), 0);
    assert_eq!(callback.data(1), Some(data));

    engine.update();
    assert_eq!(callback.sync_count(1), 1);
    assert_eq!(callback.sync_error(1), None);
}

#[test]
fn write_only_external_buffer_is_not_streamed_in_place() {
    // Compresses well, so the compressed scratch is far smaller than the output
    let data: Vec<u8> = (0..100 * 1024).map(|i| (i / 64) as u8).collect();

    let peak_memory = |write_only: bool| {
        let (engine, source) = memory_engine(StreamEngineConfig::default());
        source.insert_compressed("packed", &data).unwrap();

        let buffer: SharedBuffer = Arc::new(Mutex::new(vec![0u8; data.len()]));
        let stream = engine
            .start_read(
                StreamTaskType::Pak,
                "packed",
                None,
                Some(StreamReadParams {
                    buffer: Some(buffer.clone()),
                    flags: ReadFlags {
                        write_only_external_buffer: write_only,
                        ..Default::default()
                    },
                    ..Default::default()
                }),
            )
            .unwrap();

        assert!(stream.wait(Some(TIMEOUT)));
        assert_eq!(stream.error(), None);
        assert_eq!(stream.bytes_read(false), data.len() as u64);
        assert_eq!(*buffer.lock().unwrap(), data);
        assert_eq!(engine.temp_memory().allocated(), 0);
        engine.temp_memory().max_allocated()
    };

    // Inflated into an internal buffer and copied over once complete
    assert!(peak_memory(true) >= data.len());
    assert!(peak_memory(false) < data.len());
}
