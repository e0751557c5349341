/*
simgtrunc, to truncate trailing chunks off Android sparse images: report module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use std::{fmt::Display, fs::File, io::BufWriter, path::{Path, PathBuf}};

use serde::Serialize;

use crate::{backed::{BackedBlock, SparseImage}, trunc::{write_n_blocks,
    ChunkSink, TruncSummary}, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum PlanKind {
    Skip,
    Raw,
    Fill,
}

impl Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}",
            match self {
                PlanKind::Skip => "skip",
                PlanKind::Raw => "raw",
                PlanKind::Fill => "fill",
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct PlanEntry {
    pub(crate) kind: PlanKind,
    pub(crate) start_block: u64,
    pub(crate) blocks: u64,
    /// Bytes of content, for raw chunks this may end before the last block
    pub(crate) bytes: u64,
}

/// Sink that only records what would be written
pub(crate) struct PlanRecorder {
    block_size: u32,
    next_block: u64,
    entries: Vec<PlanEntry>,
}

impl PlanRecorder {
    pub(crate) fn new(block_size: u32) -> Self {
        Self {
            block_size,
            next_block: 0,
            entries: Vec::new(),
        }
    }

    pub(crate) fn into_entries(self) -> Vec<PlanEntry> {
        self.entries
    }

    fn record(&mut self, kind: PlanKind, blocks: u64, bytes: u64) {
        self.entries.push(PlanEntry {
            kind,
            start_block: self.next_block,
            blocks,
            bytes,
        });
        self.next_block += blocks;
    }
}

impl ChunkSink for PlanRecorder {
    fn append_skip(&mut self, len: u64) -> Result<()> {
        self.record(PlanKind::Skip, len.div_ceil(self.block_size as u64), len);
        Ok(())
    }

    fn append_data(&mut self, _image: &SparseImage, block: &BackedBlock)
        -> Result<()>
    {
        let kind = if block.is_fill() { PlanKind::Fill } else { PlanKind::Raw };
        self.record(kind, block.blocks(self.block_size), block.len);
        Ok(())
    }
}

/// Chunks a truncation with `summary` writes, pad included
pub(crate) fn plan(image: &SparseImage, summary: &TruncSummary)
    -> Result<Vec<PlanEntry>>
{
    let mut recorder = PlanRecorder::new(image.block_size());
    write_n_blocks(image, &mut recorder, summary.chunks, summary.size)?;
    Ok(recorder.into_entries())
}

pub(crate) fn print_table_stdout(entries: &[PlanEntry]) -> Result<()> {
    use cli_table::{format::Justify, Cell, Style, Table};
    macro_rules! cell_right {
        ($raw: expr) => {
            $raw.cell().justify(Justify::Right)
        };
    }
    macro_rules! cell_bold_center {
        ($raw: expr) => {
            $raw.cell().bold(true).justify(Justify::Center)
        };
    }
    let rows: Vec<_> = entries.iter().enumerate().map(|(id, entry)| [
        cell_right!(id),
        cell_right!(entry.kind),
        cell_right!(entry.start_block),
        cell_right!(entry.blocks),
        cell_right!(format!("0x{:x}", entry.bytes)),
    ]).collect();
    let table = rows.table().title([
        cell_bold_center!("ID"),
        cell_bold_center!("type"),
        cell_bold_center!("start block"),
        cell_bold_center!("blocks"),
        cell_bold_center!("size"),
    ]).bold(true);
    println!("Chunks in truncated image:");
    cli_table::print_stdout(table)?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub(crate) struct TruncReport {
    pub(crate) input: PathBuf,
    pub(crate) output: PathBuf,
    pub(crate) block_size: u32,
    pub(crate) discarded_chunks: i64,
    #[serde(flatten)]
    pub(crate) summary: TruncSummary,
    pub(crate) plan: Vec<PlanEntry>,
}

impl TruncReport {
    pub(crate) fn try_write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = match File::create(path) {
            Ok(file) => file,
            Err(e) => {
                log::error!("Cannot create report file '{}': {}",
                    path.display(), e);
                return Err(e.into())
            }
        };
        serde_yaml::to_writer(BufWriter::new(file), self)?;
        log::info!("Wrote report to '{}'", path.display());
        Ok(())
    }
}
