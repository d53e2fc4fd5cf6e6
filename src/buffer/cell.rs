//! The cell model backing the terminal buffer.

use bitflags::bitflags;

bitflags! {
    /// SGR attribute bits, set by CSI `m` and cleared individually by their
    /// matching "off" parameter (22/23/24/27/29 for bold/italic/underline/
    /// inverse/strike; dim shares the bold-off parameter per the spec).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attrs: u8 {
        /// SGR 1.
        const BOLD = 0b0000_0001;
        /// SGR 3.
        const ITALIC = 0b0000_0010;
        /// SGR 4.
        const UNDERLINE = 0b0000_0100;
        /// SGR 2.
        const DIM = 0b0000_1000;
        /// SGR 7.
        const INVERSE = 0b0001_0000;
        /// SGR 8.
        const INVISIBLE = 0b0010_0000;
        /// SGR 9.
        const STRIKETHROUGH = 0b0100_0000;
    }
}

/// A cell's foreground or background color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    /// No color set; renders as the consumer's default.
    #[default]
    Default,
    /// An 8-bit palette index (0-255), set via `38;5;n` / `48;5;n`.
    Indexed(u8),
    /// A 24-bit truecolor value, set via `38;2;r;g;b` / `48;2;r;g;b`.
    Rgb(u8, u8, u8),
}

/// One grid cell: a code point, its display width, colors, and attributes.
///
/// A wide (East Asian width 2) character occupies this cell plus the cell
/// immediately to its right, which is represented as a `width: 0`
/// continuation cell carrying a space; the cursor may never rest on one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    /// The cell's code point; a plain, unwritten cell holds a space.
    pub ch: char,
    /// Display width in terminal columns: 0 (continuation), 1, or 2.
    pub width: u8,
    /// Foreground color.
    pub fg: Color,
    /// Background color.
    pub bg: Color,
    /// SGR attribute bits active when this cell was written.
    pub attrs: Attrs,
}

impl Cell {
    /// A blank cell: a space, default colors, no attributes.
    pub const BLANK: Cell = Cell {
        ch: ' ',
        width: 1,
        fg: Color::Default,
        bg: Color::Default,
        attrs: Attrs::empty(),
    };

    /// True for an unwritten space cell with no color or attribute, the
    /// shorthand the binary snapshot codec collapses to a single `0x00` byte.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        *self == Self::BLANK
    }

    /// The width-0 continuation half of a wide cell, carrying no visible
    /// glyph of its own.
    #[must_use]
    pub fn continuation() -> Self {
        Cell {
            ch: ' ',
            width: 0,
            fg: Color::Default,
            bg: Color::Default,
            attrs: Attrs::empty(),
        }
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::BLANK
    }
}
