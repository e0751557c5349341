use std::{fs::{File, OpenOptions}, io::BufWriter, path::{Path, PathBuf}};

use clap::Parser;

mod backed;
mod crc32;
mod error;
mod import;
mod output;
mod pretty;
mod progress;
mod report;
mod sparse;
mod trunc;

use error::{Error, Result};

/// Strip trailing chunks, e.g. verity metadata, off Android sparse images
#[derive(Parser, Debug)]
#[command(version)]
struct Arg {
    /// Path of sparse image to truncate, raw images are read as well
    image_in: PathBuf,
    /// Path of sparse image to write, would be overwritten if exists
    image_out: PathBuf,
    /// Number of trailing chunks to discard
    #[arg(allow_negative_numbers = true)]
    discard_chunks: i64,

    #[arg(short = 'z', long)]
    /// Compress the output with gzip
    gzip: bool,

    #[arg(short, long)]
    /// Write a plain, fully expanded image instead of a sparse one
    raw: bool,

    #[arg(short, long)]
    /// Append a CRC32 chunk to the output
    crc: bool,

    #[arg(long)]
    /// Verify CRC32 chunks and checksum of the input
    verify_crc: bool,

    #[arg(short, long)]
    /// Print the chunks kept in the output
    list: bool,

    #[arg(long)]
    /// Write a YAML report of the truncation to this path
    report: Option<PathBuf>,
}

fn create_output(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o664);
    }
    match options.open(path) {
        Ok(file) => Ok(file),
        Err(e) => {
            log::error!("Cannot open output file '{}': {}", path.display(), e);
            Err(e.into())
        }
    }
}

fn trunc_file(arg: &Arg) -> Result<()> {
    let image = backed::SparseImage::import(&arg.image_in, arg.verify_crc)?;
    // Reject before the output is touched
    trunc::chunk_budget(&image, arg.discard_chunks)?;
    let flags = output::OutputFlags {
        gzip: arg.gzip,
        sparse: ! arg.raw,
        crc: arg.crc,
    };
    let writer = BufWriter::new(create_output(&arg.image_out)?);
    let progress = progress::write_progress_bar(0)?;
    let (summary, _) = match trunc::write_trunc(
        &image, writer, flags, arg.discard_chunks, progress)
    {
        Ok(result) => result,
        Err(e) => {
            log::error!("Failed to write sparse file '{}', it is incomplete",
                arg.image_out.display());
            return Err(e)
        }
    };
    println!("Size: {} Blocks: {} Chunks: {}",
        summary.size, summary.blocks, summary.chunks);
    if arg.list || arg.report.is_some() {
        let plan = report::plan(&image, &summary)?;
        if arg.list {
            report::print_table_stdout(&plan)?
        }
        if let Some(path) = &arg.report {
            report::TruncReport {
                input: arg.image_in.clone(),
                output: arg.image_out.clone(),
                block_size: image.block_size(),
                discarded_chunks: arg.discard_chunks,
                summary,
                plan,
            }.try_write(path)?
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let arg = Arg::parse();
    trunc_file(&arg)
}
