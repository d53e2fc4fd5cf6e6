//! The terminal buffer's grid state and the VTE [`Perform`] implementation
//! that drives it from parsed ANSI/VT100 sequences.
//!
//! This is a pragmatic subset of VT100/xterm behavior: the control
//! sequences the spec enumerates are implemented precisely; anything else
//! (DCS payloads, exotic private modes, combining marks) is consumed and
//! ignored rather than rejected, matching real terminals' tolerance for
//! sequences they don't recognize.

use vte::{Params, Parser, Perform};

use crate::buffer::cell::{Attrs, Cell, Color};
use crate::buffer::snapshot::BufferSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Charset {
    Ascii,
    UkNational,
    DecSpecialGraphics,
}

#[derive(Debug, Clone, Copy)]
struct SavedCursor {
    x: u16,
    y: u16,
    fg: Color,
    bg: Color,
    attrs: Attrs,
    origin_mode: bool,
}

/// A live, mutable terminal screen: a cell grid plus cursor and mode state.
///
/// Implements [`Perform`] directly so `Parser::advance` can drive it; kept
/// as a separate type from [`TerminalBuffer`] so the parser and the screen
/// it mutates are disjoint fields, letting `advance(&mut screen, bytes)`
/// borrow each independently.
struct Screen {
    cols: u16,
    rows: u16,
    grid: Vec<Vec<Cell>>,
    alt_grid: Vec<Vec<Cell>>,
    using_alt: bool,
    cursor_x: u16,
    cursor_y: u16,
    cursor_visible: bool,
    pending_wrap: bool,
    saved_cursor: Option<SavedCursor>,
    alt_saved_cursor: Option<SavedCursor>,
    scroll_top: u16,
    scroll_bottom: u16,
    cur_fg: Color,
    cur_bg: Color,
    cur_attrs: Attrs,
    g0: Charset,
    g1: Charset,
    active_g: u8,
    origin_mode: bool,
    autowrap: bool,
    decckm: bool,
    title: Option<String>,
}

/// A live, mutable terminal screen fed by raw PTY output
/// ([`TerminalBuffer::process`]), backing both the cast recorder's replay
/// view and the live buffer manager's snapshot fan-out.
pub struct TerminalBuffer {
    parser: Parser,
    screen: Screen,
}

impl std::fmt::Debug for TerminalBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalBuffer")
            .field("cols", &self.screen.cols)
            .field("rows", &self.screen.rows)
            .field("cursor_x", &self.screen.cursor_x)
            .field("cursor_y", &self.screen.cursor_y)
            .finish_non_exhaustive()
    }
}

impl TerminalBuffer {
    /// Creates a blank buffer of the given size. `cols`/`rows` are clamped
    /// to at least 1.
    #[must_use]
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            parser: Parser::new(),
            screen: Screen::new(cols, rows),
        }
    }

    /// Feeds raw bytes from the PTY into the ANSI state machine.
    pub fn process(&mut self, bytes: &[u8]) {
        self.parser.advance(&mut self.screen, bytes);
    }

    /// Current column/row width.
    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        (self.screen.cols, self.screen.rows)
    }

    /// Cursor position, as (column, row).
    #[must_use]
    pub fn cursor(&self) -> (u16, u16) {
        (self.screen.cursor_x, self.screen.cursor_y)
    }

    /// Whether the cursor is currently visible (DECTCEM).
    #[must_use]
    pub fn cursor_visible(&self) -> bool {
        self.screen.cursor_visible
    }

    /// The most recent OSC 0/1/2 title, if one has been set.
    #[must_use]
    pub fn title(&self) -> Option<&str> {
        self.screen.title.as_deref()
    }

    /// Captures the current grid/cursor state as a binary snapshot.
    #[must_use]
    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            cols: u32::from(self.screen.cols),
            rows: u32::from(self.screen.rows),
            viewport_y: 0,
            cursor_x: i32::from(self.screen.cursor_x),
            cursor_y: i32::from(self.screen.cursor_y),
            cells: self.screen.grid().clone(),
        }
    }

    /// Resizes the buffer, preserving the trailing nonblank rows of content
    /// anchored to the bottom of the new grid, truncating each row to the
    /// new column count, and resetting the scroll region to full.
    pub fn resize(&mut self, new_cols: u16, new_rows: u16) {
        self.screen.resize(new_cols, new_rows);
    }
}

impl Screen {
    fn new(cols: u16, rows: u16) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        Self {
            cols,
            rows,
            grid: blank_grid(cols, rows),
            alt_grid: blank_grid(cols, rows),
            using_alt: false,
            cursor_x: 0,
            cursor_y: 0,
            cursor_visible: true,
            pending_wrap: false,
            saved_cursor: None,
            alt_saved_cursor: None,
            scroll_top: 0,
            scroll_bottom: rows - 1,
            cur_fg: Color::Default,
            cur_bg: Color::Default,
            cur_attrs: Attrs::empty(),
            g0: Charset::Ascii,
            g1: Charset::Ascii,
            active_g: 0,
            origin_mode: false,
            autowrap: true,
            decckm: false,
            title: None,
        }
    }

    fn resize(&mut self, new_cols: u16, new_rows: u16) {
        let new_cols = new_cols.max(1);
        let new_rows = new_rows.max(1);

        let rows_from_bottom = self.rows.saturating_sub(1).saturating_sub(self.cursor_y);

        self.grid = resize_grid(&self.grid, new_cols, new_rows);
        self.alt_grid = resize_grid(&self.alt_grid, new_cols, new_rows);
        self.cols = new_cols;
        self.rows = new_rows;
        self.scroll_top = 0;
        self.scroll_bottom = new_rows - 1;
        self.cursor_y = new_rows
            .saturating_sub(1)
            .saturating_sub(rows_from_bottom)
            .min(new_rows - 1);
        self.cursor_x = self.cursor_x.min(new_cols - 1);
        self.pending_wrap = false;
    }

    fn grid(&self) -> &Vec<Vec<Cell>> {
        if self.using_alt {
            &self.alt_grid
        } else {
            &self.grid
        }
    }

    fn grid_mut(&mut self) -> &mut Vec<Vec<Cell>> {
        if self.using_alt {
            &mut self.alt_grid
        } else {
            &mut self.grid
        }
    }

    fn set_cell(&mut self, x: u16, y: u16, cell: Cell) {
        if (y as usize) < self.grid().len() && (x as usize) < self.cols as usize {
            self.grid_mut()[y as usize][x as usize] = cell;
        }
    }

    fn put_char(&mut self, ch: char) {
        let width = unicode_width::UnicodeWidthChar::width(ch)
            .unwrap_or(1)
            .min(2) as u8;
        if width == 0 {
            return;
        }
        if self.pending_wrap {
            self.wrap_cursor();
        }
        if width == 2 && self.cursor_x + 1 >= self.cols {
            self.wrap_cursor();
        }

        let (x, y) = (self.cursor_x, self.cursor_y);
        self.set_cell(
            x,
            y,
            Cell {
                ch,
                width,
                fg: self.cur_fg,
                bg: self.cur_bg,
                attrs: self.cur_attrs,
            },
        );
        if width == 2 {
            self.set_cell(
                x + 1,
                y,
                Cell {
                    ch: ' ',
                    width: 0,
                    fg: self.cur_fg,
                    bg: self.cur_bg,
                    attrs: self.cur_attrs,
                },
            );
        }

        self.cursor_x += u16::from(width);
        if self.cursor_x >= self.cols {
            self.cursor_x = self.cols - 1;
            if self.autowrap {
                self.pending_wrap = true;
            }
        }
    }

    fn wrap_cursor(&mut self) {
        self.pending_wrap = false;
        self.cursor_x = 0;
        self.line_feed();
    }

    fn line_feed(&mut self) {
        if self.cursor_y == self.scroll_bottom {
            self.scroll_region_up(1);
        } else if self.cursor_y + 1 < self.rows {
            self.cursor_y += 1;
        }
    }

    fn reverse_line_feed(&mut self) {
        if self.cursor_y == self.scroll_top {
            self.scroll_region_down(1);
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
        }
    }

    fn blank_cell(&self) -> Cell {
        Cell {
            ch: ' ',
            width: 1,
            fg: Color::Default,
            bg: self.cur_bg,
            attrs: Attrs::empty(),
        }
    }

    fn scroll_region_up(&mut self, n: u16) {
        let top = self.scroll_top as usize;
        let bottom = self.scroll_bottom as usize;
        let blank = self.blank_cell();
        let cols = self.cols as usize;
        let grid = self.grid_mut();
        for _ in 0..n {
            if top <= bottom && bottom < grid.len() {
                grid.remove(top);
                grid.insert(bottom, vec![blank; cols]);
            }
        }
    }

    fn scroll_region_down(&mut self, n: u16) {
        let top = self.scroll_top as usize;
        let bottom = self.scroll_bottom as usize;
        let blank = self.blank_cell();
        let cols = self.cols as usize;
        let grid = self.grid_mut();
        for _ in 0..n {
            if top <= bottom && bottom < grid.len() {
                grid.remove(bottom);
                grid.insert(top, vec![blank; cols]);
            }
        }
    }

    fn erase_in_display(&mut self, mode: u16) {
        let blank = self.blank_cell();
        let (cx, cy) = (self.cursor_x as usize, self.cursor_y as usize);
        let grid = self.grid_mut();
        match mode {
            0 => {
                if cy < grid.len() {
                    for cell in grid[cy].iter_mut().skip(cx) {
                        *cell = blank;
                    }
                }
                for row in grid.iter_mut().skip(cy + 1) {
                    row.fill(blank);
                }
            }
            1 => {
                for row in grid.iter_mut().take(cy) {
                    row.fill(blank);
                }
                if cy < grid.len() {
                    for cell in grid[cy].iter_mut().take(cx + 1) {
                        *cell = blank;
                    }
                }
            }
            _ => {
                for row in grid.iter_mut() {
                    row.fill(blank);
                }
            }
        }
    }

    fn erase_in_line(&mut self, mode: u16) {
        let blank = self.blank_cell();
        let cx = self.cursor_x as usize;
        let cy = self.cursor_y as usize;
        let grid = self.grid_mut();
        let Some(row) = grid.get_mut(cy) else {
            return;
        };
        match mode {
            0 => {
                for cell in row.iter_mut().skip(cx) {
                    *cell = blank;
                }
            }
            1 => {
                for cell in row.iter_mut().take(cx + 1) {
                    *cell = blank;
                }
            }
            _ => row.fill(blank),
        }
    }

    fn insert_lines(&mut self, n: u16) {
        if self.cursor_y < self.scroll_top || self.cursor_y > self.scroll_bottom {
            return;
        }
        let saved_top = self.scroll_top;
        self.scroll_top = self.cursor_y;
        self.scroll_region_down(n);
        self.scroll_top = saved_top;
    }

    fn delete_lines(&mut self, n: u16) {
        if self.cursor_y < self.scroll_top || self.cursor_y > self.scroll_bottom {
            return;
        }
        let saved_top = self.scroll_top;
        self.scroll_top = self.cursor_y;
        self.scroll_region_up(n);
        self.scroll_top = saved_top;
    }

    fn insert_chars(&mut self, n: u16) {
        let blank = self.blank_cell();
        let cx = self.cursor_x as usize;
        let cy = self.cursor_y as usize;
        let cols = self.cols as usize;
        let grid = self.grid_mut();
        let Some(row) = grid.get_mut(cy) else {
            return;
        };
        for _ in 0..n {
            if cx < row.len() {
                row.insert(cx, blank);
                row.truncate(cols);
            }
        }
    }

    fn delete_chars(&mut self, n: u16) {
        let blank = self.blank_cell();
        let cx = self.cursor_x as usize;
        let cy = self.cursor_y as usize;
        let grid = self.grid_mut();
        let Some(row) = grid.get_mut(cy) else {
            return;
        };
        for _ in 0..n {
            if cx < row.len() {
                row.remove(cx);
                row.push(blank);
            }
        }
    }

    fn reset_sgr(&mut self) {
        self.cur_attrs = Attrs::empty();
        self.cur_fg = Color::Default;
        self.cur_bg = Color::Default;
    }

    fn apply_sgr(&mut self, params: &Params) {
        let groups: Vec<Vec<u16>> = params.iter().map(<[u16]>::to_vec).collect();
        if groups.is_empty() || (groups.len() == 1 && groups[0] == [0]) {
            self.reset_sgr();
            return;
        }
        let mut i = 0;
        while i < groups.len() {
            let code = groups[i].first().copied().unwrap_or(0);
            match code {
                0 => self.reset_sgr(),
                1 => self.cur_attrs.insert(Attrs::BOLD),
                2 => self.cur_attrs.insert(Attrs::DIM),
                3 => self.cur_attrs.insert(Attrs::ITALIC),
                4 => self.cur_attrs.insert(Attrs::UNDERLINE),
                7 => self.cur_attrs.insert(Attrs::INVERSE),
                8 => self.cur_attrs.insert(Attrs::INVISIBLE),
                9 => self.cur_attrs.insert(Attrs::STRIKETHROUGH),
                22 => self.cur_attrs.remove(Attrs::BOLD | Attrs::DIM),
                23 => self.cur_attrs.remove(Attrs::ITALIC),
                24 => self.cur_attrs.remove(Attrs::UNDERLINE),
                27 => self.cur_attrs.remove(Attrs::INVERSE),
                28 => self.cur_attrs.remove(Attrs::INVISIBLE),
                29 => self.cur_attrs.remove(Attrs::STRIKETHROUGH),
                30..=37 => self.cur_fg = Color::Indexed((code - 30) as u8),
                39 => self.cur_fg = Color::Default,
                40..=47 => self.cur_bg = Color::Indexed((code - 40) as u8),
                49 => self.cur_bg = Color::Default,
                90..=97 => self.cur_fg = Color::Indexed((code - 90 + 8) as u8),
                100..=107 => self.cur_bg = Color::Indexed((code - 100 + 8) as u8),
                38 | 48 => {
                    let is_fg = code == 38;
                    let group = &groups[i];
                    if group.len() >= 3 {
                        match group[1] {
                            5 => self.set_extended_color(is_fg, Color::Indexed(group[2] as u8)),
                            2 if group.len() >= 5 => self.set_extended_color(
                                is_fg,
                                Color::Rgb(group[2] as u8, group[3] as u8, group[4] as u8),
                            ),
                            _ => {}
                        }
                    } else if let Some(mode) = groups.get(i + 1).and_then(|g| g.first()) {
                        match *mode {
                            5 => {
                                if let Some(n) = groups.get(i + 2).and_then(|g| g.first()) {
                                    self.set_extended_color(is_fg, Color::Indexed(*n as u8));
                                    i += 2;
                                }
                            }
                            2 => {
                                if let (Some(r), Some(g), Some(b)) = (
                                    groups.get(i + 2).and_then(|v| v.first()),
                                    groups.get(i + 3).and_then(|v| v.first()),
                                    groups.get(i + 4).and_then(|v| v.first()),
                                ) {
                                    self.set_extended_color(
                                        is_fg,
                                        Color::Rgb(*r as u8, *g as u8, *b as u8),
                                    );
                                    i += 4;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    fn set_extended_color(&mut self, is_fg: bool, color: Color) {
        if is_fg {
            self.cur_fg = color;
        } else {
            self.cur_bg = color;
        }
    }

    fn set_mode(&mut self, private: bool, params: &Params, enabled: bool) {
        if !private {
            return;
        }
        for group in params.iter() {
            match group.first().copied().unwrap_or(0) {
                1 => self.decckm = enabled,
                6 => {
                    self.origin_mode = enabled;
                    self.cursor_x = 0;
                    self.cursor_y = if enabled { self.scroll_top } else { 0 };
                }
                7 => self.autowrap = enabled,
                25 => self.cursor_visible = enabled,
                1049 => self.set_alt_screen(enabled),
                _ => {}
            }
        }
    }

    fn set_alt_screen(&mut self, enabled: bool) {
        if enabled && !self.using_alt {
            self.alt_saved_cursor = Some(self.cursor_snapshot());
            self.using_alt = true;
            self.alt_grid = blank_grid(self.cols, self.rows);
            self.cursor_x = 0;
            self.cursor_y = 0;
        } else if !enabled && self.using_alt {
            self.using_alt = false;
            if let Some(saved) = self.alt_saved_cursor.take() {
                self.restore_cursor_snapshot(saved);
            }
        }
    }

    fn cursor_snapshot(&self) -> SavedCursor {
        SavedCursor {
            x: self.cursor_x,
            y: self.cursor_y,
            fg: self.cur_fg,
            bg: self.cur_bg,
            attrs: self.cur_attrs,
            origin_mode: self.origin_mode,
        }
    }

    fn restore_cursor_snapshot(&mut self, saved: SavedCursor) {
        self.cursor_x = saved.x.min(self.cols.saturating_sub(1));
        self.cursor_y = saved.y.min(self.rows.saturating_sub(1));
        self.cur_fg = saved.fg;
        self.cur_bg = saved.bg;
        self.cur_attrs = saved.attrs;
        self.origin_mode = saved.origin_mode;
        self.pending_wrap = false;
    }

    fn full_reset(&mut self) {
        self.grid = blank_grid(self.cols, self.rows);
        self.alt_grid = blank_grid(self.cols, self.rows);
        self.using_alt = false;
        self.cursor_x = 0;
        self.cursor_y = 0;
        self.cursor_visible = true;
        self.pending_wrap = false;
        self.saved_cursor = None;
        self.alt_saved_cursor = None;
        self.scroll_top = 0;
        self.scroll_bottom = self.rows - 1;
        self.cur_fg = Color::Default;
        self.cur_bg = Color::Default;
        self.cur_attrs = Attrs::empty();
        self.g0 = Charset::Ascii;
        self.g1 = Charset::Ascii;
        self.active_g = 0;
        self.origin_mode = false;
        self.autowrap = true;
        self.decckm = false;
        self.title = None;
    }
}

fn blank_grid(cols: u16, rows: u16) -> Vec<Vec<Cell>> {
    vec![vec![Cell::BLANK; cols as usize]; rows as usize]
}

fn resize_grid(old: &[Vec<Cell>], new_cols: u16, new_rows: u16) -> Vec<Vec<Cell>> {
    let new_cols = new_cols as usize;
    let new_rows = new_rows as usize;

    let mut nonblank_len = old.len();
    while nonblank_len > 0 && old[nonblank_len - 1].iter().all(Cell::is_blank) {
        nonblank_len -= 1;
    }

    let keep = nonblank_len.min(new_rows);
    let start = nonblank_len - keep;
    let dest_start = new_rows - keep;

    let mut grid = blank_grid(new_cols as u16, new_rows as u16);
    for i in 0..keep {
        let src = &old[start + i];
        let copy_cols = new_cols.min(src.len());
        grid[dest_start + i][..copy_cols].copy_from_slice(&src[..copy_cols]);
    }
    grid
}

fn dec_special_graphics(ch: char) -> char {
    match ch {
        'j' => '┘',
        'k' => '┐',
        'l' => '┌',
        'm' => '└',
        'n' => '┼',
        'q' => '─',
        't' => '├',
        'u' => '┤',
        'v' => '┴',
        'w' => '┬',
        'x' => '│',
        'a' => '▒',
        '~' => '·',
        '`' => '◆',
        _ => ch,
    }
}

fn charset_from_designator(byte: u8) -> Charset {
    match byte {
        b'0' => Charset::DecSpecialGraphics,
        b'A' => Charset::UkNational,
        _ => Charset::Ascii,
    }
}

impl Perform for Screen {
    fn print(&mut self, c: char) {
        let active = if self.active_g == 0 { self.g0 } else { self.g1 };
        let mapped = match active {
            Charset::DecSpecialGraphics => dec_special_graphics(c),
            Charset::UkNational if c == '#' => '£',
            _ => c,
        };
        self.put_char(mapped);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            0x07 => {} // BEL: no visual effect on the buffer
            0x08 => {
                self.cursor_x = self.cursor_x.saturating_sub(1);
                self.pending_wrap = false;
            }
            0x09 => {
                let next = ((self.cursor_x / 8) + 1) * 8;
                self.cursor_x = next.min(self.cols - 1);
                self.pending_wrap = false;
            }
            0x0A | 0x0B | 0x0C => self.line_feed(),
            0x0D => {
                self.cursor_x = 0;
                self.pending_wrap = false;
            }
            0x0E => self.active_g = 1,
            0x0F => self.active_g = 0,
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        let Some(&kind) = params.first() else {
            return;
        };
        if matches!(kind, b"0" | b"1" | b"2") {
            let title = params[1..]
                .iter()
                .map(|p| String::from_utf8_lossy(p))
                .collect::<Vec<_>>()
                .join(";");
            self.title = Some(title);
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        let private = intermediates.first() == Some(&b'?');
        let n = |default: u16| -> u16 {
            params
                .iter()
                .next()
                .and_then(|g| g.first().copied())
                .filter(|&v| v != 0)
                .unwrap_or(default)
        };

        match action {
            'A' => self.cursor_y = self.cursor_y.saturating_sub(n(1)),
            'B' | 'e' => self.cursor_y = (self.cursor_y + n(1)).min(self.rows - 1),
            'C' | 'a' => self.cursor_x = (self.cursor_x + n(1)).min(self.cols - 1),
            'D' => self.cursor_x = self.cursor_x.saturating_sub(n(1)),
            'G' | '`' => {
                self.cursor_x = (n(1) - 1).min(self.cols - 1);
                self.pending_wrap = false;
            }
            'd' => {
                self.cursor_y = (n(1) - 1).min(self.rows - 1);
                self.pending_wrap = false;
            }
            'H' | 'f' => {
                let mut params_iter = params.iter();
                let row = params_iter
                    .next()
                    .and_then(|g| g.first().copied())
                    .unwrap_or(1)
                    .max(1)
                    - 1;
                let col = params_iter
                    .next()
                    .and_then(|g| g.first().copied())
                    .unwrap_or(1)
                    .max(1)
                    - 1;
                let row_offset = if self.origin_mode { self.scroll_top } else { 0 };
                self.cursor_y = (row + row_offset).min(self.rows - 1);
                self.cursor_x = col.min(self.cols - 1);
                self.pending_wrap = false;
            }
            'J' => self.erase_in_display(n(0).min(3)),
            'K' => self.erase_in_line(n(0).min(2)),
            'L' => self.insert_lines(n(1)),
            'M' => self.delete_lines(n(1)),
            '@' => self.insert_chars(n(1)),
            'P' => self.delete_chars(n(1)),
            'S' => self.scroll_region_up(n(1)),
            'T' => self.scroll_region_down(n(1)),
            'm' => self.apply_sgr(params),
            'r' => {
                let mut params_iter = params.iter();
                let top = params_iter
                    .next()
                    .and_then(|g| g.first().copied())
                    .unwrap_or(1)
                    .max(1)
                    - 1;
                let bottom = params_iter
                    .next()
                    .and_then(|g| g.first().copied())
                    .unwrap_or(self.rows)
                    .max(1)
                    - 1;
                if top < bottom && bottom < self.rows {
                    self.scroll_top = top;
                    self.scroll_bottom = bottom;
                } else {
                    self.scroll_top = 0;
                    self.scroll_bottom = self.rows - 1;
                }
                self.cursor_x = 0;
                self.cursor_y = if self.origin_mode { self.scroll_top } else { 0 };
                self.pending_wrap = false;
            }
            'h' => self.set_mode(private, params, true),
            'l' => self.set_mode(private, params, false),
            's' => self.saved_cursor = Some(self.cursor_snapshot()),
            'u' => {
                if let Some(saved) = self.saved_cursor {
                    self.restore_cursor_snapshot(saved);
                }
            }
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        match (intermediates.first(), byte) {
            (None, b'7') => self.saved_cursor = Some(self.cursor_snapshot()),
            (None, b'8') => {
                if let Some(saved) = self.saved_cursor {
                    self.restore_cursor_snapshot(saved);
                }
            }
            (None, b'c') => self.full_reset(),
            (None, b'D') => self.line_feed(),
            (None, b'M') => self.reverse_line_feed(),
            (None, b'=' | b'>') => {} // keypad application/numeric mode: no output-side effect
            (Some(b'('), designator) => self.g0 = charset_from_designator(designator),
            (Some(b')'), designator) => self.g1 = charset_from_designator(designator),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(buf: &TerminalBuffer, x: u16, y: u16) -> char {
        buf.screen.grid()[y as usize][x as usize].ch
    }

    #[test]
    fn prints_plain_text_left_to_right() {
        let mut buf = TerminalBuffer::new(10, 3);
        buf.process(b"hi");
        assert_eq!(ch(&buf, 0, 0), 'h');
        assert_eq!(ch(&buf, 1, 0), 'i');
        assert_eq!(buf.cursor(), (2, 0));
    }

    #[test]
    fn autowrap_defers_to_next_printable_character() {
        let mut buf = TerminalBuffer::new(5, 3);
        buf.process(b"abcdef");
        assert_eq!(ch(&buf, 4, 0), 'e');
        assert_eq!(ch(&buf, 0, 1), 'f');
        assert_eq!(buf.cursor(), (1, 1));
    }

    #[test]
    fn carriage_return_and_line_feed_move_cursor() {
        let mut buf = TerminalBuffer::new(10, 3);
        buf.process(b"ab\r\ncd");
        assert_eq!(ch(&buf, 0, 1), 'c');
        assert_eq!(buf.cursor(), (2, 1));
    }

    #[test]
    fn cursor_position_csi_moves_absolute() {
        let mut buf = TerminalBuffer::new(10, 5);
        buf.process(b"\x1b[3;4Hx");
        assert_eq!(ch(&buf, 3, 2), 'x');
    }

    #[test]
    fn sgr_bold_and_color_tracked_on_cells() {
        let mut buf = TerminalBuffer::new(10, 3);
        buf.process(b"\x1b[1;31mX\x1b[0m");
        let cell = buf.screen.grid()[0][0];
        assert!(cell.attrs.contains(Attrs::BOLD));
        assert_eq!(cell.fg, Color::Indexed(1));
    }

    #[test]
    fn sgr_256_color_sets_indexed_color() {
        let mut buf = TerminalBuffer::new(10, 3);
        buf.process(b"\x1b[38;5;200mX");
        assert_eq!(buf.screen.grid()[0][0].fg, Color::Indexed(200));
    }

    #[test]
    fn sgr_truecolor_sets_rgb() {
        let mut buf = TerminalBuffer::new(10, 3);
        buf.process(b"\x1b[38;2;10;20;30mX");
        assert_eq!(buf.screen.grid()[0][0].fg, Color::Rgb(10, 20, 30));
    }

    #[test]
    fn erase_in_display_clears_from_cursor_to_end() {
        let mut buf = TerminalBuffer::new(5, 2);
        buf.process(b"abcde\x1b[5Dfg\x1b[0J");
        assert!(buf.screen.grid()[0][2].is_blank());
    }

    #[test]
    fn scroll_region_is_respected() {
        let mut buf = TerminalBuffer::new(5, 4);
        buf.process(b"\x1b[2;3r");
        buf.process(b"a\r\nb\r\nc\r\nd");
        assert_eq!(buf.size(), (5, 4));
    }

    #[test]
    fn hides_and_shows_cursor_on_dectcem() {
        let mut buf = TerminalBuffer::new(5, 2);
        assert!(buf.cursor_visible());
        buf.process(b"\x1b[?25l");
        assert!(!buf.cursor_visible());
        buf.process(b"\x1b[?25h");
        assert!(buf.cursor_visible());
    }

    #[test]
    fn alternate_screen_preserves_primary_on_exit() {
        let mut buf = TerminalBuffer::new(5, 2);
        buf.process(b"main");
        buf.process(b"\x1b[?1049h");
        buf.process(b"alt!");
        assert_eq!(ch(&buf, 0, 0), 'a');
        buf.process(b"\x1b[?1049l");
        assert_eq!(ch(&buf, 0, 0), 'm');
    }

    #[test]
    fn osc_0_sets_title() {
        let mut buf = TerminalBuffer::new(5, 2);
        buf.process(b"\x1b]0;hello\x07");
        assert_eq!(buf.title(), Some("hello"));
    }

    #[test]
    fn wide_character_occupies_continuation_cell() {
        let mut buf = TerminalBuffer::new(5, 2);
        buf.process("\u{4e2d}".as_bytes()); // CJK character, width 2
        assert_eq!(buf.screen.grid()[0][0].width, 2);
        assert_eq!(buf.screen.grid()[0][1].width, 0);
        assert_eq!(buf.cursor(), (2, 0));
    }

    #[test]
    fn resize_preserves_bottommost_rows_anchored_to_bottom() {
        let mut buf = TerminalBuffer::new(5, 3);
        buf.process(b"row0\r\nrow1\r\nrow2");
        buf.resize(5, 2);
        assert_eq!(ch(&buf, 0, 0), 'r');
        assert_eq!(buf.size(), (5, 2));
    }

    #[test]
    fn resize_skips_trailing_blank_rows_to_find_nonblank_content() {
        let mut buf = TerminalBuffer::new(5, 24);
        buf.process(b"hi");
        buf.resize(5, 5);
        assert_eq!(buf.size(), (5, 5));
        // Row 0 is the only nonblank row in the old 24-row grid; it must be
        // anchored to the bottom of the new grid, not dropped by slicing the
        // last 5 physical rows (which would all have been blank).
        assert_eq!(ch(&buf, 0, 4), 'h');
        assert_eq!(ch(&buf, 1, 4), 'i');
    }

    #[test]
    fn snapshot_reflects_current_cells_and_cursor() {
        let mut buf = TerminalBuffer::new(3, 2);
        buf.process(b"hi");
        let snap = buf.snapshot();
        assert_eq!(snap.cursor_x, 2);
        assert_eq!(snap.cells[0][0].ch, 'h');
    }

    #[test]
    fn full_reset_clears_everything() {
        let mut buf = TerminalBuffer::new(5, 2);
        buf.process(b"\x1b[1mhi\x1bc");
        assert!(buf.screen.grid()[0][0].is_blank());
        assert_eq!(buf.cursor(), (0, 0));
    }
}
