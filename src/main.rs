//! Demo driver: write sample files through one back-end, read them back,
//! verify the contents, and time both phases.

use anyhow::{bail, Context, Result};
use async_file_accessor::{get_instance, AccessorKind, Direction, RequestInfo, RequestStatus};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "async-file-accessor", about = "Async file accessor demo")]
struct Cli {
    /// Back-end to exercise: aio or mmap
    #[arg(long, default_value = "mmap")]
    backend: String,

    /// Directory for the sample files
    #[arg(long, default_value = "./afa-demo-data")]
    dir: PathBuf,

    /// Number of files to write and read back
    #[arg(long, default_value_t = 8)]
    files: usize,

    /// Payload size per file, in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    size: usize,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let kind = match cli.backend.as_str() {
        "aio" => AccessorKind::Aio,
        "mmap" => AccessorKind::Mmap,
        other => bail!("unknown backend '{other}' (expected 'aio' or 'mmap')"),
    };
    std::fs::create_dir_all(&cli.dir)
        .with_context(|| format!("cannot create {}", cli.dir.display()))?;

    let accessor = get_instance(kind);
    println!("async-file-accessor demo: backend={kind}, files={}, size={}", cli.files, cli.size);

    // Write phase: one request per file, distinct byte pattern each.
    let write_start = Instant::now();
    let mut writes = Vec::new();
    for i in 0..cli.files {
        let request = accessor
            .get_request(RequestInfo {
                direction: Direction::Write,
                path: cli.dir.join(format!("sample_{i}.bin")),
                size: cli.size,
                offset: 0,
            })
            .context("write request creation failed")?;
        let mut buf = accessor
            .alloc_write_buf(&request)
            .context("write buffer allocation failed")?;
        buf.as_mut_slice().fill(b'a' + (i % 26) as u8);
        accessor.put_request(&request).context("write submission failed")?;
        writes.push(request);
    }
    accessor.wait_all(0).context("waiting for writes failed")?;
    let failed = writes
        .iter()
        .filter(|r| r.status() != RequestStatus::IoSuccess)
        .count();
    println!(
        "wrote {} files ({} failed) in {:.3}s",
        cli.files,
        failed,
        write_start.elapsed().as_secs_f64()
    );

    // Read phase: import one destination buffer per file.
    let read_start = Instant::now();
    let mut dests: Vec<Vec<u8>> = (0..cli.files).map(|_| vec![0u8; cli.size]).collect();
    let mut reads = Vec::new();
    for (i, dest) in dests.iter_mut().enumerate() {
        let request = accessor
            .get_request(RequestInfo {
                direction: Direction::Read,
                path: cli.dir.join(format!("sample_{i}.bin")),
                size: cli.size,
                offset: 0,
            })
            .context("read request creation failed")?;
        accessor
            .import_read_buf(&request, dest.as_mut_ptr())
            .context("read buffer import failed")?;
        accessor.put_request(&request).context("read submission failed")?;
        reads.push(request);
    }
    accessor.wait_all(0).context("waiting for reads failed")?;

    let mut mismatches = 0;
    for (i, (request, dest)) in reads.iter().zip(&dests).enumerate() {
        let expected = b'a' + (i % 26) as u8;
        if request.status() != RequestStatus::IoSuccess || dest.iter().any(|&b| b != expected) {
            mismatches += 1;
        }
    }
    println!(
        "read {} files back ({} mismatched) in {:.3}s",
        cli.files,
        mismatches,
        read_start.elapsed().as_secs_f64()
    );

    accessor.release_all().context("release failed")?;
    if failed > 0 || mismatches > 0 {
        bail!("{failed} writes failed, {mismatches} reads mismatched");
    }
    println!("round trip verified");
    Ok(())
}
