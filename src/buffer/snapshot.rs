//! Binary snapshot codec for the terminal buffer.
//!
//! The wire format is little-endian throughout: a fixed 22-byte header
//! followed by a row stream that run-length-encodes blank rows and lists
//! cells individually for everything else. `decode` followed by `encode`
//! reproduces the original bytes exactly, since both directions agree on
//! one canonical (greedy) run-length chunking.

use crate::buffer::cell::{Attrs, Cell, Color};
use crate::error::{Error, Result};

const MAGIC: [u8; 2] = [0x54, 0x56];
const VERSION: u8 = 0x01;

/// A single point-in-time, self-contained encoding of a terminal's cell
/// grid, viewport offset, and cursor position.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSnapshot {
    /// Grid width in columns.
    pub cols: u32,
    /// Grid height in rows.
    pub rows: u32,
    /// Scrollback viewport offset; always 0 (no scrollback view in this buffer).
    pub viewport_y: i32,
    /// Cursor column.
    pub cursor_x: i32,
    /// Cursor row.
    pub cursor_y: i32,
    /// Row-major cell grid, `rows` rows of `cols` cells each.
    pub cells: Vec<Vec<Cell>>,
}

impl BufferSnapshot {
    /// Serializes this snapshot to its binary wire format.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22 + (self.rows as usize) * (self.cols as usize));
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.push(0); // reserved flags
        out.extend_from_slice(&self.cols.to_le_bytes());
        out.extend_from_slice(&self.rows.to_le_bytes());
        out.extend_from_slice(&self.viewport_y.to_le_bytes());
        out.extend_from_slice(&self.cursor_x.to_le_bytes());
        out.extend_from_slice(&self.cursor_y.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes()); // reserved

        let mut row_idx = 0usize;
        while row_idx < self.cells.len() {
            if row_is_blank(&self.cells[row_idx]) {
                let mut run = 0usize;
                while row_idx + run < self.cells.len()
                    && run < 255
                    && row_is_blank(&self.cells[row_idx + run])
                {
                    run += 1;
                }
                out.push(0xFE);
                out.push(run as u8);
                row_idx += run;
            } else {
                let row = &self.cells[row_idx];
                out.push(0xFD);
                out.extend_from_slice(&(row.len() as u16).to_le_bytes());
                for cell in row {
                    encode_cell(&mut out, cell);
                }
                row_idx += 1;
            }
        }
        out
    }

    /// Parses a previously [`encode`](Self::encode)d snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the header magic/version is wrong or
    /// the row stream is truncated or malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        if cursor.take(2)? != MAGIC {
            return Err(Error::Internal {
                message: "buffer snapshot: bad magic".into(),
            });
        }
        let version = cursor.u8()?;
        if version != VERSION {
            return Err(Error::Internal {
                message: format!("buffer snapshot: unsupported version {version}"),
            });
        }
        let _flags = cursor.u8()?;
        let cols = cursor.u32()?;
        let rows = cursor.u32()?;
        let viewport_y = cursor.i32()?;
        let cursor_x = cursor.i32()?;
        let cursor_y = cursor.i32()?;
        let _reserved = cursor.i32()?;

        let mut cells = Vec::with_capacity(rows as usize);
        while cells.len() < rows as usize {
            match cursor.u8()? {
                0xFE => {
                    let count = cursor.u8()?;
                    for _ in 0..count {
                        cells.push(vec![Cell::BLANK; cols as usize]);
                    }
                }
                0xFD => {
                    let cell_count = cursor.u16()?;
                    let mut row = Vec::with_capacity(cell_count as usize);
                    for _ in 0..cell_count {
                        row.push(decode_cell(&mut cursor)?);
                    }
                    cells.push(row);
                }
                other => {
                    return Err(Error::Internal {
                        message: format!("buffer snapshot: bad row marker 0x{other:02x}"),
                    });
                }
            }
        }

        Ok(Self {
            cols,
            rows,
            viewport_y,
            cursor_x,
            cursor_y,
            cells,
        })
    }
}

fn row_is_blank(row: &[Cell]) -> bool {
    row.iter().all(Cell::is_blank)
}

const CLASS_SPACE: u8 = 0b00;
const CLASS_ASCII: u8 = 0b01;
const CLASS_UNICODE: u8 = 0b10;

fn encode_cell(out: &mut Vec<u8>, cell: &Cell) {
    if cell.is_blank() {
        out.push(0x00);
        return;
    }

    let is_unicode = !cell.ch.is_ascii();
    let has_fg = cell.fg != Color::Default;
    let has_bg = cell.bg != Color::Default;
    let rgb_fg = matches!(cell.fg, Color::Rgb(..));
    let rgb_bg = matches!(cell.bg, Color::Rgb(..));
    let has_extended = !cell.attrs.is_empty() || has_fg || has_bg;
    let class = if is_unicode { CLASS_UNICODE } else { CLASS_ASCII };

    let type_byte = (u8::from(has_extended) << 7)
        | (u8::from(is_unicode) << 6)
        | (u8::from(has_fg) << 5)
        | (u8::from(has_bg) << 4)
        | (u8::from(rgb_fg) << 3)
        | (u8::from(rgb_bg) << 2)
        | class;
    out.push(type_byte);

    if is_unicode {
        let mut buf = [0u8; 4];
        let encoded = cell.ch.encode_utf8(&mut buf);
        out.push(encoded.len() as u8);
        out.extend_from_slice(encoded.as_bytes());
    } else {
        out.push(cell.ch as u8);
    }

    if has_extended {
        out.push(cell.attrs.bits());
        if has_fg {
            encode_color(out, cell.fg);
        }
        if has_bg {
            encode_color(out, cell.bg);
        }
    }
}

fn encode_color(out: &mut Vec<u8>, color: Color) {
    match color {
        Color::Default => {}
        Color::Indexed(i) => out.push(i),
        Color::Rgb(r, g, b) => out.extend_from_slice(&[r, g, b]),
    }
}

fn decode_cell(cursor: &mut Cursor<'_>) -> Result<Cell> {
    let type_byte = cursor.u8()?;
    if type_byte == 0x00 {
        return Ok(Cell::BLANK);
    }

    let has_extended = type_byte & 0b1000_0000 != 0;
    let is_unicode = type_byte & 0b0100_0000 != 0;
    let has_fg = type_byte & 0b0010_0000 != 0;
    let has_bg = type_byte & 0b0001_0000 != 0;
    let rgb_fg = type_byte & 0b0000_1000 != 0;
    let rgb_bg = type_byte & 0b0000_0100 != 0;
    let class = type_byte & 0b0000_0011;

    let ch = if is_unicode || class == CLASS_UNICODE {
        let len = cursor.u8()? as usize;
        let bytes = cursor.take(len)?;
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.chars().next())
            .ok_or_else(|| Error::Internal {
                message: "buffer snapshot: invalid utf-8 cell".into(),
            })?
    } else if class == CLASS_ASCII {
        cursor.u8()? as char
    } else {
        ' '
    };

    let mut attrs = Attrs::empty();
    let mut fg = Color::Default;
    let mut bg = Color::Default;
    if has_extended {
        attrs = Attrs::from_bits_truncate(cursor.u8()?);
        if has_fg {
            fg = decode_color(cursor, rgb_fg)?;
        }
        if has_bg {
            bg = decode_color(cursor, rgb_bg)?;
        }
    }

    Ok(Cell {
        ch,
        width: unicode_width::UnicodeWidthChar::width(ch).unwrap_or(1) as u8,
        fg,
        bg,
        attrs,
    })
}

fn decode_color(cursor: &mut Cursor<'_>, is_rgb: bool) -> Result<Color> {
    if is_rgb {
        let bytes = cursor.take(3)?;
        Ok(Color::Rgb(bytes[0], bytes[1], bytes[2]))
    } else {
        Ok(Color::Indexed(cursor.u8()?))
    }
}

/// A minimal byte-slice reader, local to this module, so the codec doesn't
/// need an external binary-parsing crate for 22 bytes of fixed header.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::Internal {
                message: "buffer snapshot: unexpected end of stream".into(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BufferSnapshot {
        let mut row0 = vec![Cell::BLANK; 5];
        row0[0] = Cell {
            ch: 'h',
            width: 1,
            fg: Color::Indexed(3),
            bg: Color::Default,
            attrs: Attrs::BOLD,
        };
        row0[1] = Cell {
            ch: 'é',
            width: 1,
            fg: Color::Rgb(10, 20, 30),
            bg: Color::Rgb(1, 2, 3),
            attrs: Attrs::empty(),
        };
        BufferSnapshot {
            cols: 5,
            rows: 3,
            viewport_y: 0,
            cursor_x: 2,
            cursor_y: 0,
            cells: vec![row0, vec![Cell::BLANK; 5], vec![Cell::BLANK; 5]],
        }
    }

    #[test]
    fn header_starts_with_magic_and_version() {
        let bytes = sample().encode();
        assert_eq!(&bytes[0..3], &[0x54, 0x56, 0x01]);
    }

    #[test]
    fn decode_of_encode_round_trips_byte_identical() {
        let snap = sample();
        let bytes = snap.encode();
        let decoded = BufferSnapshot::decode(&bytes).unwrap();
        assert_eq!(decoded, snap);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn all_blank_grid_uses_run_length_rows() {
        let snap = BufferSnapshot {
            cols: 10,
            rows: 2,
            viewport_y: 0,
            cursor_x: 0,
            cursor_y: 0,
            cells: vec![vec![Cell::BLANK; 10]; 2],
        };
        let bytes = snap.encode();
        assert_eq!(bytes[22], 0xFE);
        assert_eq!(bytes[23], 2);
    }

    #[test]
    fn blank_run_longer_than_255_splits_into_chunks() {
        let snap = BufferSnapshot {
            cols: 1,
            rows: 300,
            viewport_y: 0,
            cursor_x: 0,
            cursor_y: 0,
            cells: vec![vec![Cell::BLANK; 1]; 300],
        };
        let bytes = snap.encode();
        let decoded = BufferSnapshot::decode(&bytes).unwrap();
        assert_eq!(decoded.cells.len(), 300);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let err = BufferSnapshot::decode(&[0, 0, 1, 0]).unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[test]
    fn decode_rejects_truncated_stream() {
        let bytes = sample().encode();
        let err = BufferSnapshot::decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }
}
