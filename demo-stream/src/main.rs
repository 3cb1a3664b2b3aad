use sluice::engine::{
    DiskFileSource, LayeredFileSource, MemoryFileSource, ReadStream, StreamCallback, StreamEngine,
    StreamEngineConfig, StreamError, StreamPriority, StreamReadBatchParams, StreamReadParams,
    StreamTaskType,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct LoggingCallback {
    completed: AtomicUsize,
}

impl StreamCallback for LoggingCallback {
    fn stream_async_on_complete(
        &self,
        stream: &ReadStream,
        error: Option<StreamError>,
    ) {
        log::debug!(
            "async phase for {} ({} bytes, {:?})",
            stream.path(),
            stream.bytes_read(false),
            error
        );
    }

    fn stream_on_complete(
        &self,
        stream: &ReadStream,
        error: Option<StreamError>,
    ) {
        match error {
            Some(error) => log::warn!("{} failed: {}", stream.path(), error),
            None => log::info!(
                "{} finished with {} bytes",
                stream.path(),
                stream.bytes_read(false)
            ),
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
    }
}

fn demo_data(
    len: usize,
    seed: u8,
) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / 64) as u8).wrapping_mul(seed))
        .collect()
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Debug)
        .init();

    let config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data/stream_config.json");
    let config = StreamEngineConfig::read_from_path(&config_path).unwrap();

    let loose_dir = std::env::temp_dir().join("sluice-demo-stream");
    std::fs::create_dir_all(&loose_dir).unwrap();
    std::fs::write(loose_dir.join("terrain.raw"), demo_data(3 * 1024 * 1024, 3)).unwrap();
    std::fs::write(loose_dir.join("music.ogg"), demo_data(512 * 1024, 5)).unwrap();

    let pak = Arc::new(MemoryFileSource::default());
    for i in 0..8 {
        pak.insert_compressed(
            &format!("textures/{}.dds", i),
            &demo_data(256 * 1024, i + 1),
        )
        .unwrap();
    }

    let mut source = LayeredFileSource::new();
    source.mount(pak);
    source.mount(Arc::new(DiskFileSource::new(loose_dir.clone())));

    let engine = StreamEngine::new(config, Arc::new(source)).unwrap();
    let callback = Arc::new(LoggingCallback {
        completed: AtomicUsize::new(0),
    });

    let mut streams = Vec::default();
    streams.extend(engine.start_read(
        StreamTaskType::Terrain,
        "terrain.raw",
        Some(callback.clone()),
        Some(StreamReadParams {
            priority: StreamPriority::BelowNormal,
            load_time: Duration::from_millis(500),
            ..Default::default()
        }),
    ));
    streams.extend(engine.start_read(
        StreamTaskType::Music,
        "music.ogg",
        Some(callback.clone()),
        None,
    ));

    let batch = (0..8)
        .map(|i| StreamReadBatchParams {
            task_type: StreamTaskType::Texture,
            path: format!("textures/{}.dds", i),
            callback: Some(callback.clone() as Arc<dyn StreamCallback>),
            params: Some(StreamReadParams {
                user_data: i,
                priority: StreamPriority::Normal,
                ..Default::default()
            }),
        })
        .collect();
    let mut pre_request = || log::info!("Starting texture batch");
    streams.extend(engine.start_batch_read(batch, Some(&mut pre_request)));

    let expected = streams.len();
    loop {
        std::thread::sleep(Duration::from_millis(15));
        engine.update();

        if callback.completed.load(Ordering::Acquire) >= expected {
            break;
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&engine.statistics()).unwrap()
    );

    engine.shutdown();
    let _ = std::fs::remove_dir_all(loose_dir);
}
