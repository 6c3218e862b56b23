//! Sequential file and factory tests

mod test_utils;

use std::sync::Arc;

use roomq::io::{BackendFactory, BackendPreference, IoConfig, IoError, WaitCallback};
use roomq::journal::{JournalError, SequentialFileFactory};

use test_utils::{cleanup, test_file_path, EventLog, ScriptedFactory};

fn posix_config() -> IoConfig {
    IoConfig::new()
        .with_backend(BackendPreference::Posix)
        .with_max_io(16)
        .with_posix_threads(2)
}

fn posix_factory(name: &str) -> SequentialFileFactory {
    let dir = test_file_path(name);
    cleanup(&dir);
    let factory = SequentialFileFactory::new(&dir, posix_config()).unwrap();
    factory.create_dirs().unwrap();
    factory
}

#[test]
fn test_factory_uses_forced_backend() {
    let factory = posix_factory("journal_backend");
    assert_eq!(factory.backend_name(), "posix");
    assert_eq!(factory.alignment(), 1);
    assert!(factory.directory().is_dir());
    cleanup(factory.directory());
}

#[test]
fn test_sequential_write_then_read_back() {
    let factory = posix_factory("journal_roundtrip");
    let file = factory.create_sequential_file("000001.jnl").unwrap();
    file.open().unwrap();
    assert!(file.is_open());
    assert!(file.exists());

    for record in [&b"first"[..], b"second", b"third"] {
        let mut buffer = factory.new_buffer(record.len()).unwrap();
        buffer.copy_from_slice(record).unwrap();
        file.write_blocking(buffer).unwrap();
    }
    assert_eq!(file.position(), 16);
    file.sync().unwrap();
    assert_eq!(file.size().unwrap(), 16);

    file.set_position(5);
    let data = file.read_blocking(factory.new_buffer(6).unwrap()).unwrap();
    assert_eq!(data, b"second");
    assert_eq!(file.position(), 11);

    file.close().unwrap();
    assert_eq!(factory.open_file_count(), 0);
    cleanup(factory.directory());
}

#[test]
fn test_async_writes_through_write_executor() {
    let factory = posix_factory("journal_async");
    let file = factory.create_sequential_file("000002.jnl").unwrap();
    file.open().unwrap();

    let waiters: Vec<WaitCallback> = (0..32u8)
        .map(|i| {
            let mut buffer = factory.new_buffer(4).unwrap();
            buffer.copy_from_slice(&[i; 4]).unwrap();
            let waiter = WaitCallback::new();
            file.write(buffer, waiter.boxed()).unwrap();
            waiter
        })
        .collect();
    for waiter in &waiters {
        waiter.wait().unwrap();
    }
    assert_eq!(file.stats().completed(), 32);
    file.close().unwrap();

    let contents = std::fs::read(file.path()).unwrap();
    assert_eq!(contents.len(), 128);
    for (i, chunk) in contents.chunks(4).enumerate() {
        assert_eq!(chunk, [i as u8; 4]);
    }

    // Completed writes returned their buffers to the pool
    assert!(factory.buffer_pool().retained() > 0);
    cleanup(factory.directory());
}

#[test]
fn test_fill_preallocates() {
    let factory = posix_factory("journal_fill");
    let file = factory.create_sequential_file("000003.jnl").unwrap();
    file.open().unwrap();

    file.fill(0, 20 * 1024, 0).unwrap();
    assert_eq!(file.size().unwrap(), 20 * 1024);

    file.fill(20 * 1024, 3000, 0xEE).unwrap();
    assert_eq!(file.size().unwrap(), 20 * 1024 + 3000);
    file.close().unwrap();

    let contents = std::fs::read(file.path()).unwrap();
    assert!(contents[..20 * 1024].iter().all(|&b| b == 0));
    assert!(contents[20 * 1024..].iter().all(|&b| b == 0xEE));
    cleanup(factory.directory());
}

#[test]
fn test_list_rename_delete() {
    let factory = posix_factory("journal_files");
    for name in ["b.jnl", "a.jnl", "c.tmp"] {
        let file = factory.create_sequential_file(name).unwrap();
        file.open().unwrap();
        file.close().unwrap();
    }
    assert_eq!(factory.list_files("jnl").unwrap(), vec!["a.jnl", "b.jnl"]);
    assert_eq!(factory.list_files(".tmp").unwrap(), vec!["c.tmp"]);

    let mut file = factory.create_sequential_file("c.tmp").unwrap();
    file.open().unwrap();
    file.rename_to("c.jnl").unwrap();
    assert!(!file.is_open());
    assert_eq!(file.file_name(), "c.jnl");
    assert_eq!(factory.list_files("jnl").unwrap(), vec!["a.jnl", "b.jnl", "c.jnl"]);

    file.delete().unwrap();
    assert!(!file.exists());
    assert_eq!(factory.list_files("jnl").unwrap(), vec!["a.jnl", "b.jnl"]);
    cleanup(factory.directory());
}

#[test]
fn test_invalid_file_names_rejected() {
    let factory = posix_factory("journal_names");
    for name in ["", "..", "nested/file.jnl"] {
        assert!(matches!(
            factory.create_sequential_file(name),
            Err(JournalError::InvalidFileName(_))
        ));
    }
    cleanup(factory.directory());
}

#[test]
fn test_open_file_count_and_io_limit() {
    let dir = test_file_path("journal_limit");
    cleanup(&dir);
    let config = posix_config().with_max_io(4).with_io_limit(Some(6));
    let factory = SequentialFileFactory::new(&dir, config).unwrap();
    factory.create_dirs().unwrap();

    let first = factory.create_sequential_file("1.jnl").unwrap();
    let second = factory.create_sequential_file("2.jnl").unwrap();
    first.open().unwrap();
    assert_eq!(factory.open_file_count(), 1);

    match second.open() {
        Err(JournalError::Io(IoError::CannotInitializeBackend { reserved, .. })) => {
            assert_eq!(reserved, 4)
        }
        other => panic!("unexpected {:?}", other),
    }
    second.open_with(2).unwrap();
    assert_eq!(factory.open_file_count(), 2);
    assert_eq!(factory.budget().reserved(), 6);

    first.close().unwrap();
    second.close().unwrap();
    assert_eq!(factory.open_file_count(), 0);
    assert_eq!(factory.budget().reserved(), 0);
    cleanup(&dir);
}

#[test]
fn test_buffer_helpers_on_aligned_backend() {
    let scripted = ScriptedFactory::new();
    let backend: Arc<dyn BackendFactory> = Arc::new(AlignedScripted(scripted));
    let dir = test_file_path("journal_aligned");
    let factory = SequentialFileFactory::with_backend(&dir, IoConfig::new(), backend).unwrap();

    assert_eq!(factory.alignment(), 512);
    assert_eq!(factory.calculate_block_size(1), 512);
    assert_eq!(factory.calculate_block_size(1024), 1024);
    assert!(matches!(
        factory.new_buffer(100),
        Err(JournalError::Io(IoError::BufferSize { size: 100, alignment: 512 }))
    ));

    let buffer = factory.new_buffer(1024).unwrap();
    assert_eq!(buffer.capacity(), 1024);
    assert_eq!(buffer.alignment(), 512);
    factory.release_buffer(buffer);
    assert_eq!(factory.buffer_pool().retained(), 1);

    let file = factory.create_sequential_file("aligned.jnl").unwrap();
    assert_eq!(file.calculate_block_start(0), 0);
    assert_eq!(file.calculate_block_start(1), 512);
    assert_eq!(file.calculate_block_start(1024), 1024);
}

#[test]
fn test_write_after_close_is_not_open() {
    let scripted = ScriptedFactory::new();
    let dir = test_file_path("journal_closed");
    let backend: Arc<dyn BackendFactory> = scripted.clone();
    let config = IoConfig::new().with_serialize_writes(false);
    let factory = SequentialFileFactory::with_backend(&dir, config, backend).unwrap();

    let file = factory.create_sequential_file("closed.jnl").unwrap();
    let log = EventLog::new();
    file.set_buffer_callback(Some(Arc::new(log.clone())));
    file.open_with(2).unwrap();
    let mut buffer = factory.new_buffer(8).unwrap();
    buffer.fill(1);
    file.write_blocking(buffer).unwrap();
    file.close().unwrap();
    assert_eq!(log.events(), vec!["buf:1"]);

    let mut buffer = factory.new_buffer(8).unwrap();
    buffer.fill(2);
    let err = file.write(buffer, log.callback("late")).unwrap_err();
    assert!(matches!(err, JournalError::Io(IoError::NotOpen)));
    assert_eq!(file.position(), 8);
    assert_eq!(log.count("ok:late"), 0);
}

/// Scripted backend advertising direct IO alignment
struct AlignedScripted(Arc<ScriptedFactory>);

impl BackendFactory for AlignedScripted {
    fn name(&self) -> &'static str {
        "scripted-aligned"
    }

    fn alignment(&self) -> usize {
        512
    }

    fn open(
        &self,
        path: &std::path::Path,
        max_io: usize,
    ) -> roomq::io::IoResult<Box<dyn roomq::io::Backend>> {
        self.0.open(path, max_io)
    }
}
