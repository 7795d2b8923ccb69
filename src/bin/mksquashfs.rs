//! Packer CLI: builds a SquashFS image from a directory, a pseudo-file
//! listing, or a tar stream.

use clap::{Parser, ValueEnum};
use squashfs::compressors::{CompressorConfig, CompressorId};
use squashfs::error::SquashfsError;
use squashfs::io_file::StdFile;
use squashfs::tar::{into_tree, TarReader};
use squashfs::tree::{listing, scan, Tree};
use squashfs::writer::{write_image, WriterConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Source {
    Dir,
    Listing,
    Tar,
}

#[derive(Parser, Debug)]
#[command(name = "mksquashfs", about = "pack a directory, listing, or tar stream into a SquashFS image")]
struct Args {
    /// What `input` names.
    #[arg(long, value_enum, default_value = "dir")]
    source: Source,

    /// Directory to scan, listing file to parse, or tar file to read
    /// (`-` reads the tar stream from stdin).
    input: PathBuf,

    /// Output image path.
    output: PathBuf,

    /// Codec name: gzip, xz, lzma, lz4, lz4hc, zstd, lzo.
    #[arg(long, default_value = "gzip")]
    comp: CompressorId,

    #[arg(long, default_value_t = 131072)]
    block_size: u32,

    /// Pad and store final short blocks instead of tail-packing them.
    #[arg(long)]
    no_fragments: bool,

    /// Skip building an NFS export table.
    #[arg(long)]
    no_export: bool,

    #[arg(long)]
    workers: Option<usize>,
}

fn run(args: Args) -> Result<(), SquashfsError> {
    let tree = build_tree(&args)?;

    let mut cfg = WriterConfig::new(CompressorConfig::new(args.comp, args.block_size));
    cfg.no_fragments = args.no_fragments;
    cfg.export = !args.no_export;
    if let Some(workers) = args.workers {
        cfg.workers = workers.max(1);
    }

    let out = StdFile::create(&args.output)?;
    write_image(&tree, out, cfg, Arc::new(AtomicBool::new(false)))?;
    tracing::info!(output = %args.output.display(), "wrote image");
    Ok(())
}

fn build_tree(args: &Args) -> Result<Tree, SquashfsError> {
    match args.source {
        Source::Dir => scan::scan(&args.input),
        Source::Listing => {
            let text = std::fs::read_to_string(&args.input)?;
            listing::parse(&text)
        }
        Source::Tar => {
            if args.input == PathBuf::from("-") {
                let mut reader = TarReader::new(std::io::stdin().lock());
                into_tree(&mut reader)
            } else {
                let f = std::fs::File::open(&args.input)?;
                let mut reader = TarReader::new(std::io::BufReader::new(f));
                into_tree(&mut reader)
            }
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(SquashfsError::Unsupported(msg)) => {
            tracing::error!(%msg, "unsupported");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "mksquashfs failed");
            ExitCode::FAILURE
        }
    }
}
