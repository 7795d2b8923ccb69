//! Unpacker CLI: lists, inspects, and extracts files out of a SquashFS image.

use clap::{Parser, Subcommand};
use squashfs::error::SquashfsError;
use squashfs::image::{inode_type_name, Image};
use squashfs::inode::Inode;
use squashfs::io_file::StdFile;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "unsquashfs", about = "inspect and extract a SquashFS image")]
struct Args {
    image: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory's entries (defaults to the root).
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Print a regular file's content to stdout.
    Cat { path: String },
    /// Show the super block's summary fields.
    Info,
    /// Extract the whole image to disk, restoring mode, ownership and
    /// device nodes.
    Unpack { dest: PathBuf },
    /// Print an entry's extended attributes.
    ReadXattr { path: String },
}

fn run(args: Args) -> Result<(), SquashfsError> {
    let file = StdFile::open_read(&args.image)?;
    let image = Image::open(file)?;

    match args.command {
        Command::Ls { path } => {
            let inode = image.lookup_path(&path)?;
            for entry in image.list_directory(&inode)? {
                println!(
                    "{:<10} {}",
                    inode_type_name(&image.read_inode(entry.inode_ref)?),
                    String::from_utf8_lossy(&entry.name)
                );
            }
        }
        Command::Cat { path } => {
            let inode = image.lookup_path(&path)?;
            let data = image.read_file_data(&inode)?;
            std::io::stdout().write_all(&data)?;
        }
        Command::Info => {
            let sb = image.superblock();
            println!("{sb}");
            let root = image.root_inode()?;
            if let Inode::Directory(_) | Inode::LDirectory(..) = root {
                tracing::info!("root is a directory, as expected");
            } else {
                return Err(SquashfsError::corrupt("root inode is not a directory"));
            }
        }
        Command::Unpack { dest } => {
            image.extract(&dest)?;
        }
        Command::ReadXattr { path } => {
            let inode = image.lookup_path(&path)?;
            for (name, value) in image.read_xattrs(&inode)? {
                println!("{}={}", String::from_utf8_lossy(&name), String::from_utf8_lossy(&value));
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(SquashfsError::NotFound(msg)) => {
            tracing::error!(%msg, "not found");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "unsquashfs failed");
            ExitCode::FAILURE
        }
    }
}
