//! Journal IO self-check
//!
//! Usage: roomq-journal-check [--dir DIR] [--backend auto|uring|posix]
//!
//! Creates a journal file, preallocates it, writes it in aligned blocks,
//! reads it back and prints the backend used with timings.
//!
//! Exit codes:
//!   0 - Success
//!   2 - Invalid arguments or backend unavailable
//!   3 - IO error or data mismatch

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use roomq::io::{BackendPreference, BackendSupport, IoConfig, WaitCallback};
use roomq::journal::{JournalError, JournalResult, SequentialFileFactory};

#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Check journal IO on this machine")]
struct Cli {
    /// Journal directory
    #[arg(long, default_value = "./journal-check", env = "ROOMQ_JOURNAL_DIR")]
    dir: PathBuf,

    /// Backend: auto, uring or posix
    #[arg(long, default_value = "auto")]
    backend: String,

    /// Maximum concurrent operations
    #[arg(long, default_value_t = 64)]
    max_io: usize,

    /// File size in bytes
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    size: usize,

    /// Bytes per write
    #[arg(long, default_value_t = 64 * 1024)]
    block: usize,

    /// Keep the file after the check
    #[arg(long)]
    keep: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let backend: BackendPreference = match cli.backend.parse() {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(2);
        }
    };

    let support = BackendSupport::detect();
    match support.uring_unavailable_reason() {
        None => eprintln!("io_uring: available"),
        Some(reason) => eprintln!("io_uring: unavailable ({})", reason),
    }

    let config = IoConfig::from_env()
        .with_backend(backend)
        .with_max_io(cli.max_io);

    match run(&cli, config) {
        Ok(()) => std::process::exit(0),
        Err(JournalError::BackendUnavailable(reason)) => {
            eprintln!("ERROR: backend unavailable: {}", reason);
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(3);
        }
    }
}

fn run(cli: &Cli, config: IoConfig) -> JournalResult<()> {
    let factory = SequentialFileFactory::new(&cli.dir, config)?;
    factory.create_dirs()?;
    eprintln!("Backend: {} (alignment {})", factory.backend_name(), factory.alignment());

    let block = factory.calculate_block_size(cli.block.max(1));
    let blocks = cli.size.div_ceil(block);
    let total = blocks * block;

    let file = factory.create_sequential_file("check.jnl")?;
    file.open()?;

    let start = Instant::now();
    file.fill(0, total, 0)?;
    eprintln!("Filled {} bytes in {:?}", total, start.elapsed());

    let start = Instant::now();
    let mut waiters = Vec::with_capacity(blocks);
    for i in 0..blocks {
        let mut buffer = factory.new_buffer(block)?;
        buffer.fill((i % 251) as u8);
        let waiter = WaitCallback::new();
        file.write(buffer, waiter.boxed())?;
        waiters.push(waiter);
    }
    for waiter in &waiters {
        waiter.wait()?;
    }
    file.sync()?;
    eprintln!("Wrote {} blocks of {} bytes in {:?}", blocks, block, start.elapsed());

    let start = Instant::now();
    let mut readers = Vec::with_capacity(blocks);
    for i in 0..blocks {
        let buffer = factory.new_buffer(block)?;
        let waiter = WaitCallback::capturing();
        file.read_at((i * block) as u64, buffer, waiter.boxed())?;
        readers.push(waiter);
    }

    let mut mismatches = 0;
    for (i, reader) in readers.iter().enumerate() {
        reader.wait()?;
        let data = reader.take_data().unwrap_or_default();
        if data.len() != block || data.iter().any(|&b| b != (i % 251) as u8) {
            mismatches += 1;
        }
    }
    eprintln!("Read {} blocks in {:?}", blocks, start.elapsed());

    let stats = file.stats();
    eprintln!(
        "Operations: {} submitted, {} completed, {} failed, average latency {:?}",
        stats.submitted(),
        stats.completed(),
        stats.failed(),
        stats.latency().average()
    );

    if cli.keep {
        file.close()?;
    } else {
        file.delete()?;
    }

    if mismatches > 0 {
        return Err(JournalError::StdIo(std::io::Error::other(format!(
            "{} blocks read back with unexpected content",
            mismatches
        ))));
    }

    eprintln!("Journal check passed");
    Ok(())
}
