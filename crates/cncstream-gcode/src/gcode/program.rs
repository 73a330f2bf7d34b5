//! Motion programs split into named blocks

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

use cncstream_core::{Bounds, GcodeError, Position};
use serde::{Deserialize, Serialize};

use super::line::{GcodeLine, LineKind};
use super::modal::ModalTracker;

const NAME_TAG: &str = "Block-name:";
const ENABLE_TAG: &str = "Block-enable:";
const EXPAND_TAG: &str = "Block-expand:";

/// Buffer size for reading program files (256 KB)
const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Ordered group of lines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    /// Disabled blocks are kept but never streamed
    pub enabled: bool,
    /// Display-only
    pub expanded: bool,
    pub lines: Vec<GcodeLine>,
}

impl Default for Block {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            expanded: false,
            lines: Vec::new(),
        }
    }
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Block with lines parsed from text, unparseable lines kept raw
    pub fn from_text(name: impl Into<String>, text: &str) -> Self {
        let mut block = Self::new(name);
        for (i, raw) in text.lines().enumerate() {
            block.push_raw(raw, i as u32 + 1);
        }
        block
    }

    pub fn push(&mut self, line: GcodeLine) {
        self.lines.push(line);
    }

    fn push_raw(&mut self, raw: &str, line_number: u32) {
        let line = GcodeLine::parse(raw, line_number).unwrap_or_else(|e| {
            tracing::warn!("Keeping line {} verbatim: {}", line_number, e);
            GcodeLine::raw(raw)
        });
        self.lines.push(line);
    }

    fn has_header(&self) -> bool {
        !self.name.is_empty() || !self.enabled || self.expanded
    }
}

/// A motion program: ordered blocks of ordered lines
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionProgram {
    blocks: Vec<Block>,
}

fn header_value<'a>(line: &'a GcodeLine, tag: &str) -> Option<&'a str> {
    if line.kind() != LineKind::Empty {
        return None;
    }
    line.comment()?.strip_prefix(tag).map(str::trim)
}

impl MotionProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Program with the given blocks
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    /// Parse program text
    ///
    /// `(Block-name: ...)` comments start a new block; `(Block-enable: 0)`
    /// and `(Block-expand: 1)` set the flags of the current block. Lines of a
    /// disabled block lose their leading `;` on import. Lines that fail to
    /// parse are kept verbatim.
    pub fn parse(text: &str) -> Self {
        let mut program = Self::new();
        for (i, raw) in text.lines().enumerate() {
            program.push_text_line(raw, i as u32 + 1);
        }
        program
    }

    /// Read and parse a program file
    pub fn load(path: impl AsRef<Path>) -> cncstream_core::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
        let mut program = Self::new();
        let mut count = 0u32;
        for line in reader.lines() {
            count += 1;
            program.push_text_line(&line?, count);
        }
        tracing::info!(
            "Loaded {} lines in {} blocks from {}",
            count,
            program.blocks.len(),
            path.display()
        );
        Ok(program)
    }

    /// Write the exported program to a file
    pub fn save(&self, path: impl AsRef<Path>) -> cncstream_core::Result<()> {
        fs::write(path, self.export())?;
        Ok(())
    }

    fn push_text_line(&mut self, raw: &str, line_number: u32) {
        let parsed = GcodeLine::parse(raw, line_number).ok();
        if let Some(line) = &parsed {
            if let Some(name) = header_value(line, NAME_TAG) {
                let reuse = self
                    .blocks
                    .last()
                    .is_some_and(|b| b.lines.is_empty() && !b.has_header());
                if reuse {
                    if let Some(block) = self.blocks.last_mut() {
                        block.name = name.to_string();
                    }
                } else {
                    self.blocks.push(Block::new(name));
                }
                return;
            }
            if let Some(flag) = header_value(line, ENABLE_TAG) {
                self.current_block().enabled = flag != "0";
                return;
            }
            if let Some(flag) = header_value(line, EXPAND_TAG) {
                self.current_block().expanded = flag != "0";
                return;
            }
        }

        let block = self.current_block();
        if !block.enabled {
            if let Some(rest) = raw.trim_start().strip_prefix(';') {
                block.push_raw(rest, line_number);
                return;
            }
        }
        match parsed {
            Some(line) => block.push(line),
            None => block.push_raw(raw, line_number),
        }
    }

    fn current_block(&mut self) -> &mut Block {
        if self.blocks.is_empty() {
            self.blocks.push(Block::default());
        }
        let last = self.blocks.len() - 1;
        &mut self.blocks[last]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    pub fn block_mut(&mut self, index: usize) -> Option<&mut Block> {
        self.blocks.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total number of lines over all blocks
    pub fn line_count(&self) -> usize {
        self.blocks.iter().map(|b| b.lines.len()).sum()
    }

    fn check_index(&self, index: usize) -> Result<(), GcodeError> {
        if index < self.blocks.len() {
            Ok(())
        } else {
            Err(GcodeError::BlockOutOfRange {
                index,
                len: self.blocks.len(),
            })
        }
    }

    /// Insert a block before `index` (`index == len` appends)
    pub fn insert_block(&mut self, index: usize, block: Block) -> Result<(), GcodeError> {
        if index > self.blocks.len() {
            return Err(GcodeError::BlockOutOfRange {
                index,
                len: self.blocks.len(),
            });
        }
        self.blocks.insert(index, block);
        Ok(())
    }

    pub fn delete_block(&mut self, index: usize) -> Result<Block, GcodeError> {
        self.check_index(index)?;
        Ok(self.blocks.remove(index))
    }

    /// Replace a block, returning the old one
    pub fn replace_block(&mut self, index: usize, block: Block) -> Result<Block, GcodeError> {
        self.check_index(index)?;
        Ok(std::mem::replace(&mut self.blocks[index], block))
    }

    pub fn set_block_enabled(&mut self, index: usize, enabled: bool) -> Result<(), GcodeError> {
        self.check_index(index)?;
        self.blocks[index].enabled = enabled;
        Ok(())
    }

    /// Lines of the enabled blocks in order, blank lines omitted
    pub fn stream_lines(&self) -> Vec<String> {
        self.blocks
            .iter()
            .filter(|b| b.enabled)
            .flat_map(|b| b.lines.iter())
            .filter(|l| l.kind() != LineKind::Empty || l.comment().is_some())
            .map(GcodeLine::to_gcode)
            .collect()
    }

    /// Program text including block headers
    pub fn export(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            if block.has_header() {
                out.push_str(&format!("({} {})\n", NAME_TAG, block.name));
                if block.expanded {
                    out.push_str(&format!("({} 1)\n", EXPAND_TAG));
                }
                if !block.enabled {
                    out.push_str(&format!("({} 0)\n", ENABLE_TAG));
                }
            }
            for line in &block.lines {
                if !block.enabled {
                    out.push(';');
                }
                out.push_str(&line.to_gcode());
                out.push('\n');
            }
        }
        out
    }

    /// Bounding box of every fully known move end point in enabled blocks
    pub fn bounds(&self) -> Option<Bounds> {
        let mut tracker = ModalTracker::new();
        let mut bounds: Option<Bounds> = None;
        let mut number = 0u32;
        for block in self.blocks.iter().filter(|b| b.enabled) {
            for line in &block.lines {
                number += 1;
                let Ok(Some(mv)) = tracker.apply(line, number) else {
                    continue;
                };
                let [Some(x), Some(y), Some(z)] = mv.end else {
                    continue;
                };
                let point = Position::new(x, y, z);
                match bounds.as_mut() {
                    Some(b) => b.include(&point),
                    None => bounds = Some(Bounds::at(point)),
                }
            }
        }
        bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "G21\n(Block-name: pocket)\nG0 X0 Y0 Z1\nG1 Z-1 F100\n(Block-name: drill)\n(Block-enable: 0)\n;G0 X5 Y5\n;G1 Z-2\n";

    #[test]
    fn test_blocks_from_headers() {
        let program = MotionProgram::parse(SAMPLE);
        assert_eq!(program.len(), 3);
        assert_eq!(program.blocks()[1].name, "pocket");
        assert!(!program.blocks()[2].enabled);
        assert_eq!(program.blocks()[2].lines[0].get('X'), Some(5.0));
    }

    #[test]
    fn test_export_round_trip() {
        let program = MotionProgram::parse(SAMPLE);
        assert_eq!(program.export(), SAMPLE);
        assert_eq!(MotionProgram::parse(&program.export()), program);
    }

    #[test]
    fn test_disabled_blocks_not_streamed() {
        let program = MotionProgram::parse(SAMPLE);
        assert_eq!(program.stream_lines(), vec!["G21", "G0 X0 Y0 Z1", "G1 Z-1 F100"]);
    }

    #[test]
    fn test_block_editing() {
        let mut program = MotionProgram::parse(SAMPLE);
        let removed = program.delete_block(0).unwrap();
        assert_eq!(removed.lines[0].to_gcode(), "G21");
        program.set_block_enabled(1, true).unwrap();
        program
            .insert_block(0, Block::from_text("probe", "G38.2 Z-5 F10"))
            .unwrap();
        assert_eq!(program.blocks()[0].name, "probe");
        assert!(matches!(
            program.replace_block(9, Block::default()),
            Err(GcodeError::BlockOutOfRange { index: 9, len: 3 })
        ));
        assert_eq!(program.stream_lines().len(), 5);
    }

    #[test]
    fn test_bounds() {
        let program = MotionProgram::parse("G0 X0 Y0 Z5\nG1 X10 Y-2 Z-1\nG53 G0 Z0\nG0 X3");
        let bounds = program.bounds().unwrap();
        assert_eq!(bounds.min, Position::new(0.0, -2.0, -1.0));
        assert_eq!(bounds.max, Position::new(10.0, 0.0, 5.0));
    }

    #[test]
    fn test_bad_lines_kept_verbatim() {
        let program = MotionProgram::parse("G0 X1\nG1 X2 #3\n");
        assert_eq!(program.line_count(), 2);
        assert_eq!(program.stream_lines()[1], "G1 X2 #3");
    }
}
